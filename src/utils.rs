//! Wallet utility functions

use std::future::Future;

use crate::errors::WalletResult;

/// Normalize a mint URL to prevent duplicates like "mint.coinos.io" vs
/// "mint.coinos.io/". This should be called when storing or comparing
/// mint URLs.
pub fn normalize_mint_url(url: &str) -> String {
    let mut normalized = url.trim().to_string();

    // Remove trailing slashes
    while normalized.ends_with('/') {
        normalized.pop();
    }

    // Ensure https:// prefix if no scheme
    if !normalized.starts_with("http://") && !normalized.starts_with("https://") {
        normalized = format!("https://{}", normalized);
    }

    // Lowercase the host portion for consistency
    if let Ok(parsed) = url::Url::parse(&normalized) {
        if let Some(host) = parsed.host_str() {
            let lowercase_host = host.to_lowercase();
            normalized = normalized.replacen(host, &lowercase_host, 1);
        }
    }

    normalized
}

/// Check if a mint URL matches a normalized mint URL
/// Used for filtering records where stored URLs might not be normalized
#[inline]
pub fn mint_matches(stored_mint: &str, normalized_mint: &str) -> bool {
    normalize_mint_url(stored_mint) == normalized_mint
}

/// Get current timestamp in seconds
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

// =============================================================================
// Bounded Retry
// =============================================================================

/// Run an async operation up to `max_attempts` times, retrying only while
/// `is_retryable` accepts the error.
///
/// The classifier decides retry eligibility; it is the single place where
/// error-string heuristics may live. Returns the last error when the
/// attempt budget is exhausted.
pub async fn with_retry<T, F, Fut, P>(
    max_attempts: u32,
    is_retryable: P,
    mut operation: F,
) -> WalletResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = WalletResult<T>>,
    P: Fn(&crate::errors::WalletError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts || !is_retryable(&err) {
                    return Err(err);
                }
                log::debug!("Retryable failure (attempt {}/{}): {}", attempt, max_attempts, err);
            }
        }
    }
}
