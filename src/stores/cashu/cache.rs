//! Keyset Cache
//!
//! Provides caching for mint keysets to avoid a keys round trip on every
//! swap. Entries expire after `keyset_cache_ttl_secs` and are dropped
//! whenever the mint stops signing with the cached keyset.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::errors::{CashuResult, CashuWalletError};
use super::types::Keyset;
use super::utils::normalize_mint_url;
use crate::stores::mint_client::MintClient;

#[derive(Debug, Clone)]
struct CachedKeyset {
    keyset: Keyset,
    cached_at: Instant,
}

/// Active keyset per mint
#[derive(Debug)]
pub struct KeysetCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedKeyset>>,
}

impl KeysetCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, mint_url: &str) -> Option<Keyset> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(mint_url)
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .map(|entry| entry.keyset.clone())
    }

    /// The mint's active keyset for `unit`, with keys
    ///
    /// Among several active keysets the one with the lowest input fee wins.
    pub async fn active_keyset(&self, mint: &dyn MintClient, unit: &str) -> CashuResult<Keyset> {
        let mint_url = normalize_mint_url(mint.mint_url());
        if let Some(keyset) = self.cached(&mint_url) {
            return Ok(keyset);
        }

        let keysets = mint
            .get_keysets()
            .await
            .map_err(|e| e.into_wallet_error(&mint_url))?;

        let info = keysets
            .into_iter()
            .filter(|k| k.active && k.unit == unit)
            .min_by_key(|k| k.input_fee_ppk)
            .ok_or_else(|| CashuWalletError::MintRejected {
                mint_url: mint_url.clone(),
                code: None,
                detail: format!("mint has no active keyset for unit {}", unit),
            })?;

        let mut keyset = mint
            .get_keys(&info.id)
            .await
            .map_err(|e| e.into_wallet_error(&mint_url))?;
        keyset.active = info.active;
        keyset.input_fee_ppk = info.input_fee_ppk;

        if keyset.input_fee_ppk > 0 {
            log::warn!(
                "Keyset {} at {} charges {} ppk input fees, swaps will be rejected",
                keyset.id,
                mint_url,
                keyset.input_fee_ppk
            );
        }

        log::debug!("Cached keyset {} for {}", keyset.id, mint_url);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                mint_url,
                CachedKeyset {
                    keyset: keyset.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        Ok(keyset)
    }

    pub fn invalidate(&self, mint_url: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&normalize_mint_url(mint_url));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeMint;

    #[tokio::test(start_paused = true)]
    async fn test_active_keyset_is_cached_until_ttl() {
        let mint = FakeMint::new("https://mint.example.com");
        let cache = KeysetCache::new(Duration::from_secs(60));

        let first = cache.active_keyset(&mint, "sat").await.unwrap();
        assert!(first.active);
        assert_eq!(first.keys.len(), 64);
        assert_eq!(mint.keys_requests(), 1);

        let second = cache.active_keyset(&mint, "sat").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mint.keys_requests(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.active_keyset(&mint, "sat").await.unwrap();
        assert_eq!(mint.keys_requests(), 2);

        cache.invalidate("https://mint.example.com/");
        cache.active_keyset(&mint, "sat").await.unwrap();
        assert_eq!(mint.keys_requests(), 3);
    }

    #[tokio::test]
    async fn test_unknown_unit_is_rejected() {
        let mint = FakeMint::new("https://mint.example.com");
        let cache = KeysetCache::new(Duration::from_secs(60));
        assert!(matches!(
            cache.active_keyset(&mint, "usd").await,
            Err(CashuWalletError::MintRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_mint() {
        let mint = FakeMint::new("https://mint.example.com");
        mint.set_unreachable(true);
        let cache = KeysetCache::new(Duration::from_secs(60));
        assert!(matches!(
            cache.active_keyset(&mint, "sat").await,
            Err(CashuWalletError::MintUnreachable { .. })
        ));
    }
}
