//! Token Utilities
//!
//! Encoding and decoding of serialized Cashu tokens. Tokens are produced in
//! the V3 format (`cashuA` + base64url JSON), which every mint and wallet can
//! read and which survives copy/paste for manual recovery.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::errors::{CashuResult, CashuWalletError};
use super::types::{total_amount, Proof, DEFAULT_UNIT};

// =============================================================================
// Token Format Detection
// =============================================================================

/// Token format version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormat {
    /// V3 format (cashuA prefix, base64url JSON)
    V3,
    /// V4 format (cashuB prefix, compact CBOR)
    V4,
    /// Unknown format
    Unknown,
}

impl TokenFormat {
    /// Detect token format from string
    pub fn detect(token_str: &str) -> Self {
        let trimmed = token_str.trim();
        if trimmed.starts_with("cashuA") {
            TokenFormat::V3
        } else if trimmed.starts_with("cashuB") {
            TokenFormat::V4
        } else {
            TokenFormat::Unknown
        }
    }

    /// Get the prefix for this format
    pub fn prefix(&self) -> &'static str {
        match self {
            TokenFormat::V3 => "cashuA",
            TokenFormat::V4 => "cashuB",
            TokenFormat::Unknown => "",
        }
    }
}

/// Quick check whether a string looks like a Cashu token
pub fn is_token(s: &str) -> bool {
    !matches!(TokenFormat::detect(s), TokenFormat::Unknown)
}

// =============================================================================
// V3 Token
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub mint: String,
    pub proofs: Vec<Proof>,
}

/// Serialized token body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenV3 {
    pub token: Vec<TokenEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl TokenV3 {
    /// Single-mint token for a proof set
    pub fn new(mint_url: &str, proofs: Vec<Proof>, memo: Option<String>) -> CashuResult<Self> {
        if proofs.is_empty() {
            return Err(CashuWalletError::InvalidToken {
                reason: "cannot create token with no proofs".to_string(),
            });
        }
        Ok(Self {
            token: vec![TokenEntry {
                mint: mint_url.to_string(),
                proofs,
            }],
            unit: Some(DEFAULT_UNIT.to_string()),
            memo,
        })
    }

    pub fn value(&self) -> u64 {
        self.token.iter().map(|e| total_amount(&e.proofs)).sum()
    }

    /// The mint URL and proofs of a single-mint token
    pub fn single_mint(&self) -> CashuResult<(&str, &[Proof])> {
        match self.token.as_slice() {
            [entry] if !entry.proofs.is_empty() => Ok((entry.mint.as_str(), entry.proofs.as_slice())),
            [_] => Err(CashuWalletError::InvalidToken {
                reason: "token holds no proofs".to_string(),
            }),
            _ => Err(CashuWalletError::InvalidToken {
                reason: format!("expected a single-mint token, found {} mints", self.token.len()),
            }),
        }
    }

    pub fn encode(&self) -> CashuResult<String> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("{}{}", TokenFormat::V3.prefix(), URL_SAFE.encode(json)))
    }

    pub fn decode(token_str: &str) -> CashuResult<Self> {
        let trimmed = token_str.trim();
        match TokenFormat::detect(trimmed) {
            TokenFormat::V3 => {}
            TokenFormat::V4 => {
                return Err(CashuWalletError::InvalidToken {
                    reason: "cashuB tokens are not supported, request a cashuA token".to_string(),
                })
            }
            TokenFormat::Unknown => {
                return Err(CashuWalletError::InvalidToken {
                    reason: "must start with 'cashuA'".to_string(),
                })
            }
        }

        // Accept padded/unpadded and standard-alphabet encodings
        let body: String = trimmed[TokenFormat::V3.prefix().len()..]
            .trim_end_matches('=')
            .chars()
            .map(|c| match c {
                '+' => '-',
                '/' => '_',
                other => other,
            })
            .collect();

        let bytes = URL_SAFE_NO_PAD
            .decode(body.as_bytes())
            .map_err(|e| CashuWalletError::InvalidToken {
                reason: format!("invalid base64: {}", e),
            })?;

        let token: TokenV3 =
            serde_json::from_slice(&bytes).map_err(|e| CashuWalletError::InvalidToken {
                reason: format!("invalid token json: {}", e),
            })?;

        if token.token.iter().all(|e| e.proofs.is_empty()) {
            return Err(CashuWalletError::InvalidToken {
                reason: "token holds no proofs".to_string(),
            });
        }
        Ok(token)
    }
}

/// Encode proofs from one mint as a `cashuA` token
pub fn encode_token(mint_url: &str, proofs: &[Proof], memo: Option<String>) -> CashuResult<String> {
    TokenV3::new(mint_url, proofs.to_vec(), memo)?.encode()
}

/// Decode a single-mint token into its mint URL and proofs
pub fn decode_token(token_str: &str) -> CashuResult<(String, Vec<Proof>)> {
    let token = TokenV3::decode(token_str)?;
    let (mint, proofs) = token.single_mint()?;
    Ok((mint.to_string(), proofs.to_vec()))
}
