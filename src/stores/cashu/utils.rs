//! Cashu wallet utility functions

use std::sync::atomic::{AtomicU64, Ordering};

use url::Url;

/// Normalize a mint URL to prevent duplicates like "mint.coinos.io" vs "mint.coinos.io/"
/// This should be called when storing or comparing mint URLs.
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
    if let Ok(parsed) = Url::parse(&normalized) {
        if let Some(host) = parsed.host_str() {
            let scheme_end = normalized.find("://").map(|i| i + 3).unwrap_or(0);
            if let Some(pos) = normalized[scheme_end..].to_lowercase().find(host) {
                let start = scheme_end + pos;
                normalized.replace_range(start..start + host.len(), host);
            }
        }
    }

    normalized
}

/// Check if a mint URL matches a normalized mint URL
/// Used for filtering tokens where stored URLs might not be normalized
#[inline]
pub fn mint_matches(stored_mint: &str, normalized_mint: &str) -> bool {
    normalize_mint_url(stored_mint) == normalized_mint
}

/// Get current timestamp in seconds
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Split an amount into power-of-two denominations, smallest first
pub fn split_amount(amount: u64) -> Vec<u64> {
    (0..64)
        .map(|bit| 1u64 << bit)
        .filter(|denomination| amount & denomination != 0)
        .collect()
}

// =============================================================================
// Clock
// =============================================================================

/// Source of "now" for locktime decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        now_secs()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mint_url() {
        assert_eq!(
            normalize_mint_url("mint.example.com"),
            "https://mint.example.com"
        );
        assert_eq!(
            normalize_mint_url("https://mint.example.com/"),
            "https://mint.example.com"
        );
        assert_eq!(
            normalize_mint_url("https://MINT.Example.COM"),
            "https://mint.example.com"
        );
        assert_eq!(
            normalize_mint_url("  https://mint.example.com/  "),
            "https://mint.example.com"
        );
        assert_eq!(
            normalize_mint_url("http://127.0.0.1:3338/"),
            "http://127.0.0.1:3338"
        );
    }

    #[test]
    fn test_mint_matches() {
        assert!(mint_matches("https://mint.example.com/", "https://mint.example.com"));
        assert!(mint_matches("mint.example.com", "https://mint.example.com"));
        assert!(!mint_matches("https://other.mint.com", "https://mint.example.com"));
    }

    #[test]
    fn test_split_amount() {
        assert_eq!(split_amount(0), Vec::<u64>::new());
        assert_eq!(split_amount(1), vec![1]);
        assert_eq!(split_amount(50), vec![2, 16, 32]);
        assert_eq!(split_amount(1023).iter().sum::<u64>(), 1023);
        assert_eq!(split_amount(1024), vec![1024]);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(5);
        assert_eq!(clock.now(), 105);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }
}
