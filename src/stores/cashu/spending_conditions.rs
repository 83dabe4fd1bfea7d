//! Spending conditions (NUT-10 / NUT-14)
//!
//! Parsing and construction of well-known secrets. A proof secret is either
//! a plain random string or a NUT-10 structured secret
//! `[kind, {nonce, data, tags}]`. Only the `HTLC` kind is spendable by this
//! wallet; any other structured kind is rejected with a typed error.

use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{CashuResult, CashuWalletError};
use super::types::Proof;
use crate::crypto::{public_key_from_hex, sha256, sign_message, verify_signature};

pub const HTLC_KIND: &str = "HTLC";

// =============================================================================
// Signature Flag
// =============================================================================

/// Which parts of a transaction the witness signatures commit to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigFlag {
    /// Signatures cover only this input's secret
    #[default]
    SigInputs,
    /// Signatures cover all inputs and outputs
    SigAll,
}

impl SigFlag {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "SIG_INPUTS" => Some(SigFlag::SigInputs),
            "SIG_ALL" => Some(SigFlag::SigAll),
            _ => None,
        }
    }

    pub fn is_sig_all(&self) -> bool {
        matches!(self, SigFlag::SigAll)
    }
}

// =============================================================================
// Parsed Secrets
// =============================================================================

/// Body of a NUT-10 secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WellKnownSecret {
    nonce: String,
    data: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<Vec<Value>>,
}

/// Conditions carried by an HTLC secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcConditions {
    pub nonce: String,
    /// Hex SHA-256 the preimage must hash to
    pub payment_hash: String,
    pub locktime: Option<u64>,
    /// Keys allowed to spend after `locktime`
    pub refund_keys: Vec<String>,
    /// Keys whose signature must accompany the preimage
    pub pubkeys: Vec<String>,
    pub sig_flag: SigFlag,
}

impl HtlcConditions {
    /// Whether the refund path is open at `now`
    pub fn locktime_passed(&self, now: u64) -> bool {
        self.locktime.map(|t| now >= t).unwrap_or(false)
    }

    /// Check a witness the way a mint would
    ///
    /// The hash path needs a matching preimage plus, when `pubkeys` is set, a
    /// valid signature from one of them. After `locktime` the refund path
    /// needs a signature from one of `refund_keys` (or nothing if none are
    /// listed).
    pub fn verify_witness(&self, secret: &str, witness: &HtlcWitness, now: u64) -> Result<(), String> {
        let signed_by_any = |keys: &[String]| {
            keys.iter().any(|key| {
                let Ok(pk) = public_key_from_hex(key) else {
                    return false;
                };
                witness
                    .signatures
                    .iter()
                    .any(|sig| verify_signature(&pk, secret.as_bytes(), sig).is_ok())
            })
        };

        if preimage_matches(&witness.preimage, &self.payment_hash) {
            if self.pubkeys.is_empty() || signed_by_any(&self.pubkeys) {
                return Ok(());
            }
            if !self.locktime_passed(now) {
                return Err("HTLC preimage accepted but signature is missing or invalid".to_string());
            }
        }

        if self.locktime_passed(now) {
            if self.refund_keys.is_empty() || signed_by_any(&self.refund_keys) {
                return Ok(());
            }
            return Err("HTLC refund signature is missing or invalid".to_string());
        }

        Err("HTLC preimage does not match and locktime has not passed".to_string())
    }
}

/// A proof secret, classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSecret {
    Plain(String),
    Htlc(HtlcConditions),
}

/// Parse a proof secret
///
/// Anything that is not a JSON array is a plain secret. A JSON array must be
/// a well-formed NUT-10 secret of a kind this wallet understands.
pub fn parse_secret(secret: &str) -> CashuResult<ParsedSecret> {
    if !secret.trim_start().starts_with('[') {
        return Ok(ParsedSecret::Plain(secret.to_string()));
    }

    let invalid = |reason: &str| CashuWalletError::InvalidSecret(reason.to_string());

    let (kind, body): (String, WellKnownSecret) =
        serde_json::from_str(secret).map_err(|e| invalid(&format!("malformed NUT-10 secret: {}", e)))?;

    if kind != HTLC_KIND {
        return Err(invalid(&format!("unsupported spending condition kind {}", kind)));
    }

    let payment_hash = validate_payment_hash(&body.data)?;

    let mut conditions = HtlcConditions {
        nonce: body.nonce,
        payment_hash,
        locktime: None,
        refund_keys: Vec::new(),
        pubkeys: Vec::new(),
        sig_flag: SigFlag::default(),
    };

    for tag in &body.tags {
        let values: Vec<String> = tag.iter().map(tag_value_to_string).collect();
        let Some((name, rest)) = values.split_first() else {
            continue;
        };
        match name.as_str() {
            "locktime" => {
                let raw = rest.first().ok_or_else(|| invalid("locktime tag without value"))?;
                conditions.locktime =
                    Some(raw.parse().map_err(|_| invalid("locktime is not a unix timestamp"))?);
            }
            "refund" => conditions.refund_keys.extend(rest.iter().cloned()),
            "pubkeys" => conditions.pubkeys.extend(rest.iter().cloned()),
            "sigflag" => {
                if let Some(flag) = rest.first().and_then(|f| SigFlag::from_str(f)) {
                    conditions.sig_flag = flag;
                }
            }
            other => log::debug!("Ignoring unknown HTLC tag {}", other),
        }
    }

    Ok(ParsedSecret::Htlc(conditions))
}

fn tag_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A proof together with its parsed spending conditions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedProof {
    Plain(Proof),
    Htlc {
        proof: Proof,
        conditions: HtlcConditions,
    },
}

impl ClassifiedProof {
    pub fn proof(&self) -> &Proof {
        match self {
            ClassifiedProof::Plain(proof) => proof,
            ClassifiedProof::Htlc { proof, .. } => proof,
        }
    }
}

pub fn classify_proof(proof: &Proof) -> CashuResult<ClassifiedProof> {
    Ok(match parse_secret(&proof.secret)? {
        ParsedSecret::Plain(_) => ClassifiedProof::Plain(proof.clone()),
        ParsedSecret::Htlc(conditions) => ClassifiedProof::Htlc {
            proof: proof.clone(),
            conditions,
        },
    })
}

// =============================================================================
// Building Secrets and Witnesses
// =============================================================================

/// Build a fresh HTLC secret string with a random nonce
pub fn build_htlc_secret(
    payment_hash: &str,
    locktime: u64,
    refund_keys: &[String],
    pubkeys: &[String],
) -> CashuResult<String> {
    let payment_hash = validate_payment_hash(payment_hash)?;

    let mut tags = vec![vec![
        Value::String("locktime".into()),
        Value::String(locktime.to_string()),
    ]];
    if !refund_keys.is_empty() {
        tags.push(tagged("refund", refund_keys));
    }
    if !pubkeys.is_empty() {
        tags.push(tagged("pubkeys", pubkeys));
    }

    let nonce: [u8; 32] = rand::random();
    let body = WellKnownSecret {
        nonce: hex::encode(nonce),
        data: payment_hash,
        tags,
    };
    Ok(serde_json::to_string(&(HTLC_KIND, body))?)
}

fn tagged(name: &str, values: &[String]) -> Vec<Value> {
    std::iter::once(Value::String(name.to_string()))
        .chain(values.iter().cloned().map(Value::String))
        .collect()
}

/// Lowercased payment hash, or `InvalidSecret` if it is not 32 bytes of hex
pub fn validate_payment_hash(payment_hash: &str) -> CashuResult<String> {
    let normalized = payment_hash.trim().to_lowercase();
    match hex::decode(&normalized) {
        Ok(bytes) if bytes.len() == 32 => Ok(normalized),
        _ => Err(CashuWalletError::InvalidSecret(
            "payment hash must be 32 bytes of hex".to_string(),
        )),
    }
}

/// HTLC witness (NUT-14)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcWitness {
    pub preimage: String,
    #[serde(default)]
    pub signatures: Vec<String>,
}

impl HtlcWitness {
    pub fn from_json(raw: &str) -> CashuResult<Self> {
        serde_json::from_str(raw).map_err(|e| CashuWalletError::InvalidSecret(format!("bad witness: {}", e)))
    }
}

/// Serialized witness signing the proof's secret
///
/// An empty preimage is used on the refund path, where only the signature
/// matters.
pub fn build_witness(secret: &str, preimage: Option<&str>, key: &SecretKey) -> CashuResult<String> {
    let witness = HtlcWitness {
        preimage: preimage.unwrap_or_default().to_string(),
        signatures: vec![sign_message(key, secret.as_bytes())],
    };
    serde_json::to_string(&witness).map_err(|e| CashuWalletError::SigningFailed(e.to_string()))
}

/// `SHA256(preimage) == payment_hash`, with the preimage given as hex
pub fn preimage_matches(preimage_hex: &str, payment_hash_hex: &str) -> bool {
    let Ok(preimage) = hex::decode(preimage_hex.trim()) else {
        return false;
    };
    if preimage.is_empty() {
        return false;
    }
    hex::encode(sha256(&preimage)) == payment_hash_hex.trim().to_lowercase()
}

// =============================================================================
// Key Normalization
// =============================================================================

/// Normalize a key to compressed hex
///
/// Accepts compressed hex (`02`/`03` prefix) or a Nostr public key (hex,
/// npub, NIP-21). Nostr keys are x-only, so they are lifted to the even-Y
/// point.
pub fn normalize_pubkey(key: &str) -> CashuResult<String> {
    let trimmed = key.trim();

    if trimmed.len() == 66 {
        return public_key_from_hex(trimmed)
            .map(|pk| pk.to_string())
            .map_err(|e| CashuWalletError::InvalidPubkey(format!("{}: {}", trimmed, e)));
    }

    let parsed = nostr_sdk::PublicKey::parse(trimmed)
        .map_err(|e| CashuWalletError::InvalidPubkey(format!("invalid Nostr pubkey: {}", e)))?;
    let compressed = format!("02{}", parsed.to_hex());
    public_key_from_hex(&compressed)
        .map(|pk| pk.to_string())
        .map_err(|e| CashuWalletError::InvalidPubkey(e.to_string()))
}
