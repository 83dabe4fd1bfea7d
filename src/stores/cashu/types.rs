//! Cashu wallet data types

use std::collections::BTreeMap;
use std::fmt;

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use super::errors::{CashuResult, CashuWalletError};
use crate::crypto::{hash_to_curve, public_key_from_hex, CryptoError};
use crate::stores::mint_client::KeysetKeys;

pub const DEFAULT_UNIT: &str = "sat";

fn default_unit() -> String {
    DEFAULT_UNIT.to_string()
}

// =============================================================================
// Proofs
// =============================================================================

/// A bearer token unit (NUT-00), identified by its secret
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proof {
    pub amount: u64,
    /// Keyset ID
    #[serde(rename = "id")]
    pub keyset_id: String,
    pub secret: String,
    /// Unblinded signature (hex compressed point)
    #[serde(rename = "C", alias = "c")]
    pub c: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<String>,
}

impl Proof {
    /// `Y = hash_to_curve(secret)` as hex, the id the mint tracks spend state by
    pub fn y(&self) -> Result<String, CryptoError> {
        Ok(hex::encode(hash_to_curve(self.secret.as_bytes())?.serialize()))
    }

    /// Short secret prefix for log lines
    pub fn short_secret(&self) -> &str {
        let end = self.secret.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.secret.len());
        &self.secret[..end]
    }

    /// Copy without any witness, as stored in plain batches
    pub fn without_witness(&self) -> Proof {
        Proof {
            witness: None,
            ..self.clone()
        }
    }
}

/// Sum of proof amounts
pub fn total_amount<'a>(proofs: impl IntoIterator<Item = &'a Proof>) -> u64 {
    proofs.into_iter().map(|p| p.amount).sum()
}

/// A proof together with the record it was read from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofWithOrigin {
    pub proof: Proof,
    pub event_id: String,
    pub mint_url: Option<String>,
    pub created_at: u64,
}

/// Decrypted content of a proof batch record (NIP-60 kind 7375)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mint: Option<String>,
    #[serde(default = "default_unit")]
    pub unit: String,
    pub proofs: Vec<Proof>,
    /// Event IDs this batch supersedes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub del: Vec<String>,
}

/// A decrypted batch with its record metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofBatch {
    pub event_id: String,
    pub created_at: u64,
    pub data: TokenEventData,
}

/// Result of greedy proof selection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofSelection {
    pub proofs: Vec<ProofWithOrigin>,
    pub total: u64,
    pub change: u64,
}

// =============================================================================
// Balances
// =============================================================================

/// How far the balance can be trusted
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BalanceVerification {
    /// Mint confirmed every counted proof unspent
    Verified,
    /// Mint could not be asked; the store view is trusted as-is
    Unverified { reason: String },
    /// Store unreachable; this is the last known view
    Stale,
    /// Nothing fetched yet
    #[default]
    Unknown,
}

/// Derived balance snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalances {
    /// Spendable sats in the ledger
    pub available: u64,
    /// Sats locked in active escrows
    pub pending: u64,
    pub verification: BalanceVerification,
    pub updated_at: u64,
}

impl WalletBalances {
    pub fn is_verified(&self) -> bool {
        self.verification == BalanceVerification::Verified
    }
}

// =============================================================================
// Keysets
// =============================================================================

/// A mint's per-denomination signing keys
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyset {
    pub id: String,
    pub unit: String,
    pub active: bool,
    #[serde(default)]
    pub input_fee_ppk: u64,
    /// amount -> compressed point hex
    pub keys: BTreeMap<u64, String>,
}

impl Keyset {
    pub fn from_wire(wire: KeysetKeys, active: bool, input_fee_ppk: u64) -> CashuResult<Self> {
        let mut keys = BTreeMap::new();
        for (amount, key) in wire.keys {
            let amount: u64 = amount.parse().map_err(|_| {
                CashuWalletError::Serialization(format!("invalid key amount {}", amount))
            })?;
            keys.insert(amount, key);
        }
        Ok(Self {
            id: wire.id,
            unit: wire.unit,
            active,
            input_fee_ppk,
            keys,
        })
    }

    /// Mint public key for a denomination
    pub fn key_for(&self, amount: u64) -> CashuResult<PublicKey> {
        let hex_key = self.keys.get(&amount).ok_or_else(|| {
            CashuWalletError::InvalidAmount(format!(
                "keyset {} has no key for amount {}",
                self.id, amount
            ))
        })?;
        Ok(public_key_from_hex(hex_key)?)
    }
}

// =============================================================================
// Escrow
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HtlcStatus {
    Locked,
    Claimed,
    Refunded,
    Failed,
}

impl HtlcStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HtlcStatus::Locked)
    }
}

impl fmt::Display for HtlcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HtlcStatus::Locked => write!(f, "LOCKED"),
            HtlcStatus::Claimed => write!(f, "CLAIMED"),
            HtlcStatus::Refunded => write!(f, "REFUNDED"),
            HtlcStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// An escrow created by this wallet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingHtlc {
    pub escrow_id: String,
    /// Encoded token holding the HTLC-locked proofs
    pub htlc_token: String,
    pub amount_sats: u64,
    pub locktime: u64,
    pub locker_pubkey: String,
    pub counterparty_pubkey: String,
    pub payment_hash: String,
    pub mint_url: String,
    pub status: HtlcStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_ref: Option<String>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
}

/// Parameters for locking funds into an escrow
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRequest {
    pub amount_sats: u64,
    pub payment_hash: String,
    /// Driver key, compressed hex or Nostr pubkey (hex / npub)
    pub counterparty_key: String,
    /// Unix seconds after which the locker may refund
    pub expiry: u64,
    pub ride_ref: Option<String>,
}

// =============================================================================
// Recovery
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Mint,
    Swap,
    Melt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Recovered,
    Failed,
}

/// Intent record written before an irreversible mint call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub kind: OperationKind,
    pub input_secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_id: Option<String>,
    pub mint_url: String,
    pub status: OperationStatus,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Locally retained copy of proofs that could not be published
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryToken {
    pub id: String,
    pub encoded_token: String,
    pub amount_sats: u64,
    pub mint_url: String,
    pub reason: String,
    pub created_at: u64,
}

/// Where an operation's output value ended up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { event_id: String },
    Captured { recovery_token_id: String },
}

/// Result of a settled claim, refund, receive or deposit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub amount: u64,
    pub escrow_id: Option<String>,
    pub outcome: PublishOutcome,
}

/// Conditions surfaced for manual inspection, never auto-resolved
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsistencyHazard {
    /// Some inputs of a journaled operation are spent, some are not
    AmbiguousOperation {
        operation_id: String,
        spent: usize,
        unspent: usize,
    },
    /// Operation completed at the mint but its outputs were never recorded
    UnrecordedOutputs { operation_id: String },
    /// Proof totals from two sources disagree
    AmountMismatch {
        context: String,
        expected: u64,
        actual: u64,
    },
}

// =============================================================================
// Wallet metadata (NIP-60 kind 17375)
// =============================================================================

/// Replaceable wallet record, encrypted to the owner
#[derive(Clone, PartialEq, Eq, Default)]
pub struct WalletMetadata {
    pub mint_url: String,
    /// Hex secret key used for escrow signatures
    pub wallet_key: String,
    pub mnemonic: String,
    /// Next unused derivation counter per keyset
    pub counters: BTreeMap<String, u32>,
}

impl fmt::Debug for WalletMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletMetadata")
            .field("mint_url", &self.mint_url)
            .field("wallet_key", &"<redacted>")
            .field("mnemonic", &"<redacted>")
            .field("counters", &self.counters)
            .finish()
    }
}

impl WalletMetadata {
    pub fn to_tags(&self) -> Vec<Vec<String>> {
        let mut tags = vec![
            vec!["privkey".to_string(), self.wallet_key.clone()],
            vec!["mint".to_string(), self.mint_url.clone()],
            vec!["mnemonic".to_string(), self.mnemonic.clone()],
        ];
        for (keyset_id, counter) in &self.counters {
            tags.push(vec![
                "counter".to_string(),
                keyset_id.clone(),
                counter.to_string(),
            ]);
        }
        tags
    }

    pub fn from_tags(tags: &[Vec<String>]) -> CashuResult<Self> {
        let mut metadata = WalletMetadata::default();
        for tag in tags {
            match (tag.first().map(String::as_str), tag.get(1)) {
                (Some("privkey"), Some(v)) => metadata.wallet_key = v.clone(),
                (Some("mint"), Some(v)) if metadata.mint_url.is_empty() => {
                    metadata.mint_url = v.clone()
                }
                (Some("mnemonic"), Some(v)) => metadata.mnemonic = v.clone(),
                (Some("counter"), Some(id)) => {
                    let counter = tag
                        .get(2)
                        .and_then(|c| c.parse::<u32>().ok())
                        .unwrap_or(0);
                    metadata.counters.insert(id.clone(), counter);
                }
                _ => {}
            }
        }
        if metadata.wallet_key.is_empty() || metadata.mint_url.is_empty() {
            return Err(CashuWalletError::Serialization(
                "wallet record missing privkey or mint".to_string(),
            ));
        }
        Ok(metadata)
    }

    /// Keep the higher counter for every keyset
    pub fn merge_counters(&mut self, other: &BTreeMap<String, u32>) {
        for (id, counter) in other {
            let entry = self.counters.entry(id.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub balance: WalletBalances,
    /// Proofs dropped because the mint reports them spent
    pub spent_removed: usize,
    /// Batches rewritten to drop spent proofs
    pub cleaned_events: usize,
    /// Escrows observed as claimed by the counterparty
    pub htlcs_claimed: usize,
    pub refunds: usize,
    pub pruned: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalletDiagnostics {
    pub balance: WalletBalances,
    pub last_sync: Option<u64>,
    pub pending_operations: usize,
    pub recovery_tokens: usize,
    pub locked_escrows: usize,
    pub hazards: Vec<ConsistencyHazard>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proof_json_field_names() {
        let proof = Proof {
            amount: 8,
            keyset_id: "009a1f293253e41e".into(),
            secret: "abc".into(),
            c: "02aa".into(),
            witness: None,
        };
        let json = serde_json::to_value(&proof).unwrap();
        assert_eq!(json["id"], "009a1f293253e41e");
        assert_eq!(json["C"], "02aa");
        assert!(json.get("witness").is_none());

        let lower: Proof =
            serde_json::from_str(r#"{"amount":8,"id":"00","secret":"abc","c":"02aa"}"#).unwrap();
        assert_eq!(lower.c, "02aa");
    }

    #[test]
    fn test_token_event_defaults() {
        let data: TokenEventData = serde_json::from_str(r#"{"proofs":[]}"#).unwrap();
        assert_eq!(data.unit, "sat");
        assert!(data.mint.is_none());
        assert!(data.del.is_empty());
    }

    #[test]
    fn test_wallet_metadata_tags() {
        let mut metadata = WalletMetadata {
            mint_url: "https://mint.example.com".into(),
            wallet_key: "11".repeat(32),
            mnemonic: "abandon about".into(),
            counters: BTreeMap::new(),
        };
        metadata.counters.insert("009a1f293253e41e".into(), 12);

        let parsed = WalletMetadata::from_tags(&metadata.to_tags()).unwrap();
        assert_eq!(parsed, metadata);

        let mut other = BTreeMap::new();
        other.insert("009a1f293253e41e".to_string(), 4);
        other.insert("00ffffffffffffff".to_string(), 3);
        metadata.merge_counters(&other);
        assert_eq!(metadata.counters["009a1f293253e41e"], 12);
        assert_eq!(metadata.counters["00ffffffffffffff"], 3);

        assert!(format!("{:?}", metadata).contains("<redacted>"));
        assert!(WalletMetadata::from_tags(&[]).is_err());
    }

    #[test]
    fn test_htlc_status_terminal() {
        assert!(!HtlcStatus::Locked.is_terminal());
        assert!(HtlcStatus::Claimed.is_terminal());
        assert!(HtlcStatus::Refunded.is_terminal());
        assert!(HtlcStatus::Failed.is_terminal());
        assert_eq!(
            serde_json::to_string(&HtlcStatus::Refunded).unwrap(),
            "\"REFUNDED\""
        );
    }
}
