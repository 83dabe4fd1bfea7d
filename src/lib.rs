//! ridecash
//!
//! Self-custodial Cashu wallet core for peer-to-peer ride payments. Proofs
//! are kept as NIP-60 records on Nostr relays and fares are escrowed in
//! hash/time-locked tokens between rider and driver.
//!
//! Start with [`stores::cashu::CashuWallet`].

pub mod crypto;
pub mod stores;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use stores::cashu::{CashuResult, CashuWallet, CashuWalletError, WalletConfig};
