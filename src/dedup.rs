//! Reconciliation and dedup
//!
//! The local store may see the same logical row more than once: a token
//! pasted twice, a mint added under two spellings of its URL, a transport
//! message delivered through several relays. These pure functions collapse
//! the duplicates; callers run them on read, there is no hidden
//! memoization.

use std::collections::{HashMap, HashSet};

use crate::types::{InboundMessage, MintInfoRecord, TokenRecord};
use crate::utils::normalize_mint_url;

// =============================================================================
// Token Dedup
// =============================================================================

/// Find a non-deleted record already holding this bearer text, matching on
/// either the encoded or the raw form
pub fn find_duplicate_token<'a>(
    records: &'a [TokenRecord],
    token_text: &str,
) -> Option<&'a TokenRecord> {
    records.iter().find(|record| {
        !record.deleted
            && (record.encoded_token == token_text
                || record.raw_token.as_deref() == Some(token_text))
    })
}

/// Collapse duplicate token records: for each bearer text, the oldest
/// non-deleted record survives, later copies are soft-deleted
pub fn dedupe_tokens(mut records: Vec<TokenRecord>) -> Vec<TokenRecord> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by_key(|&i| (records[i].created_at, records[i].id.clone()));

    let mut seen: HashSet<String> = HashSet::new();
    for i in order {
        if records[i].deleted {
            continue;
        }

        let mut keys: Vec<String> = vec![records[i].encoded_token.clone()];
        if let Some(raw) = &records[i].raw_token {
            keys.push(raw.clone());
        }

        if keys.iter().any(|k| seen.contains(k)) {
            log::debug!("Soft-deleting duplicate token record {}", records[i].id);
            records[i].deleted = true;
        } else {
            seen.extend(keys);
        }
    }

    records
}

// =============================================================================
// Mint Dedup
// =============================================================================

/// Collapse duplicate mint rows by canonical URL. The highest-scoring row
/// (most metadata, then most recent) survives with its URL rewritten to
/// canonical form; the others are soft-deleted.
pub fn dedupe_mints(mut records: Vec<MintInfoRecord>) -> Vec<MintInfoRecord> {
    let mut best_by_url: HashMap<String, usize> = HashMap::new();

    for (i, record) in records.iter().enumerate() {
        if record.deleted {
            continue;
        }
        let canonical = normalize_mint_url(&record.mint_url);
        match best_by_url.get(&canonical) {
            Some(&best) if records[best].score() >= record.score() => {}
            _ => {
                best_by_url.insert(canonical, i);
            }
        }
    }

    let winners: HashSet<usize> = best_by_url.values().copied().collect();
    for (i, record) in records.iter_mut().enumerate() {
        if record.deleted {
            continue;
        }
        if winners.contains(&i) {
            record.mint_url = normalize_mint_url(&record.mint_url);
        } else {
            log::debug!("Soft-deleting duplicate mint row for {}", record.mint_url);
            record.deleted = true;
        }
    }

    records
}

// =============================================================================
// Message Dedup
// =============================================================================

/// Identity key of a transport message: wrap id first, then client id,
/// then the composite fallback
fn message_key(message: &InboundMessage) -> String {
    if let Some(wrap_id) = &message.wrap_id {
        return format!("wrap:{}", wrap_id);
    }
    if let Some(client_id) = &message.client_id {
        return format!("client:{}", client_id);
    }
    format!("composite:{:?}:{}:{}", message.direction, message.created_at, message.content)
}

/// Drop duplicate transport messages, keeping first delivery order
pub fn dedupe_messages(messages: Vec<InboundMessage>) -> Vec<InboundMessage> {
    let mut seen: HashSet<String> = HashSet::new();
    messages
        .into_iter()
        .filter(|message| seen.insert(message_key(message)))
        .collect()
}
