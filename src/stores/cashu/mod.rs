//! Cashu NIP-60 escrow wallet
//!
//! Ecash proofs live as encrypted NIP-60 records on the broadcast store and
//! are reconciled into one ledger view. Ride fares are escrowed in NUT-14
//! HTLC tokens. It provides:
//! - Ledger reconciliation, selection and mint verification
//! - HTLC lock, claim, refund and the expired-refund sweep
//! - Lightning deposits and withdrawals (NUT-04 / NUT-05)
//! - An operation journal and a local safety net for unrecorded value
//! - Deterministic secrets (NUT-13) and seed restore (NUT-09)

pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod htlc;
mod internal;
pub mod lightning;
pub mod proof_recovery;
pub mod proofs;
pub mod recovery;
pub mod retry;
pub mod spending_conditions;
pub mod swap;
pub mod token;
pub mod types;
pub mod utils;
pub mod wallet;

pub use types::*;
pub use errors::{CashuResult, CashuWalletError, NutErrorCode};

pub use config::WalletConfig;
pub use lightning::{DepositQuote, WithdrawResult};
pub use proof_recovery::{OperationJournal, RecoveryScanReport};
pub use proofs::{LedgerView, ProofLedger, ProofVerification};
pub use recovery::{RestoreReport, SafetyNet};
pub use token::{decode_token, encode_token};
pub use utils::{Clock, ManualClock, SystemClock};
pub use wallet::{CashuWallet, ConnectReport, WalletDeps, WalletOptions};
