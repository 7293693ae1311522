//! Mint candidate selection
//!
//! Pure spend-plan construction: given the per-mint balance breakdown, a
//! preferred mint and a target amount, produce the ordered list of
//! candidates the orchestrator drains. No I/O happens here so the ordering
//! rules can be tested directly.

use std::collections::HashMap;

use crate::types::{MintBalance, MintInfoRecord, SpendCandidate};
use crate::utils::normalize_mint_url;

/// Build the ordered spend plan for a target amount.
///
/// Ordering: the preferred mint first (when present with balance), then
/// descending capability score, then descending balance. Mints with zero
/// balance are dropped.
pub fn plan_spend(
    balances_by_mint: &HashMap<String, MintBalance>,
    mint_info: &HashMap<String, MintInfoRecord>,
    preferred_mint: Option<&str>,
    target_amount: u64,
) -> Vec<SpendCandidate> {
    let preferred = preferred_mint.map(normalize_mint_url);

    let mut candidates: Vec<SpendCandidate> = balances_by_mint
        .values()
        .filter(|b| b.sum > 0)
        .map(|b| SpendCandidate {
            mint_url: b.mint_url.clone(),
            token_ids: b.token_ids.clone(),
            sum: b.sum,
        })
        .collect();

    candidates.sort_by(|a, b| {
        let a_preferred = preferred.as_deref() == Some(a.mint_url.as_str());
        let b_preferred = preferred.as_deref() == Some(b.mint_url.as_str());
        let a_score = capability_score(mint_info, &a.mint_url);
        let b_score = capability_score(mint_info, &b.mint_url);

        b_preferred
            .cmp(&a_preferred)
            .then(b_score.cmp(&a_score))
            .then(b.sum.cmp(&a.sum))
            .then(a.mint_url.cmp(&b.mint_url))
    });

    if target_amount > 0 {
        log::debug!(
            "Spend plan for {} sats: {:?}",
            target_amount,
            candidates.iter().map(|c| (&c.mint_url, c.sum)).collect::<Vec<_>>()
        );
    }

    candidates
}

/// Walk a plan and allocate `min(remaining, sum)` per candidate until the
/// target is covered. Returns the allocations and the uncovered remainder.
pub fn allocate(plan: &[SpendCandidate], target_amount: u64) -> (Vec<(SpendCandidate, u64)>, u64) {
    let mut remaining = target_amount;
    let mut allocations = Vec::new();

    for candidate in plan {
        if remaining == 0 {
            break;
        }
        let contribution = candidate.sum.min(remaining);
        if contribution > 0 {
            allocations.push((candidate.clone(), contribution));
            remaining -= contribution;
        }
    }

    (allocations, remaining)
}

fn capability_score(mint_info: &HashMap<String, MintInfoRecord>, mint_url: &str) -> u8 {
    mint_info
        .get(mint_url)
        .filter(|info| !info.deleted)
        .map(|info| info.capability_score())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(mint: &str, sum: u64) -> (String, MintBalance) {
        (
            mint.to_string(),
            MintBalance {
                mint_url: mint.to_string(),
                token_ids: vec![format!("{}-t1", mint)],
                sum,
            },
        )
    }

    fn info(mint: &str, mpp: bool) -> (String, MintInfoRecord) {
        (
            mint.to_string(),
            MintInfoRecord {
                mint_url: mint.to_string(),
                name: None,
                icon_url: None,
                input_fee_ppk: 0,
                supports_mpp: mpp,
                supports_restore: false,
                last_seen: 0,
                last_checked: 0,
                deleted: false,
            },
        )
    }

    #[test]
    fn test_preferred_mint_comes_first() {
        let balances: HashMap<_, _> = [
            balance("https://mint.big", 500),
            balance("https://mint.small", 10),
        ]
        .into();
        let infos = HashMap::new();

        let plan = plan_spend(&balances, &infos, Some("https://mint.small/"), 100);
        assert_eq!(plan[0].mint_url, "https://mint.small");
        assert_eq!(plan[1].mint_url, "https://mint.big");
    }

    #[test]
    fn test_capability_score_beats_balance() {
        let balances: HashMap<_, _> = [
            balance("https://mint.big", 500),
            balance("https://mint.mpp", 100),
        ]
        .into();
        let infos: HashMap<_, _> = [info("https://mint.mpp", true), info("https://mint.big", false)].into();

        let plan = plan_spend(&balances, &infos, None, 50);
        assert_eq!(plan[0].mint_url, "https://mint.mpp");
    }

    #[test]
    fn test_zero_balance_mints_dropped() {
        let balances: HashMap<_, _> = [
            balance("https://mint.empty", 0),
            balance("https://mint.full", 30),
        ]
        .into();

        let plan = plan_spend(&balances, &HashMap::new(), None, 25);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].mint_url, "https://mint.full");
    }

    #[test]
    fn test_allocation_drains_in_order() {
        let balances: HashMap<_, _> =
            [balance("https://mint.a", 30), balance("https://mint.b", 20)].into();
        let plan = plan_spend(&balances, &HashMap::new(), None, 40);

        let (allocations, shortfall) = allocate(&plan, 40);
        assert_eq!(shortfall, 0);
        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[0].1, 30);
        assert_eq!(allocations[1].1, 10);
    }

    #[test]
    fn test_allocation_reports_shortfall() {
        let balances: HashMap<_, _> = [balance("https://mint.a", 30)].into();
        let plan = plan_spend(&balances, &HashMap::new(), None, 45);

        let (allocations, shortfall) = allocate(&plan, 45);
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].1, 30);
        assert_eq!(shortfall, 15);
    }

    #[test]
    fn test_single_mint_example_scenario() {
        // Mint M with 30 sats, paying 25: one candidate covers it fully
        let balances: HashMap<_, _> = [balance("https://mint.m", 30)].into();
        let plan = plan_spend(&balances, &HashMap::new(), None, 25);

        let (allocations, shortfall) = allocate(&plan, 25);
        assert_eq!(shortfall, 0);
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].1, 25);
    }
}
