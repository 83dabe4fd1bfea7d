//! Cashu wallet error types
//!
//! Typed error handling for better context preservation and error matching.
//! Includes NUT error codes per the NUT-00 specification.

use std::fmt;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::stores::local_store::LocalStoreError;
use crate::stores::nostr_client::StoreError;

// =============================================================================
// NUT Error Codes (per NUT-00 specification)
// =============================================================================

/// NUT error codes from the Cashu specification
/// These map to standardized error responses from mints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NutErrorCode {
    /// Token already spent
    TokenAlreadySpent = 11001,
    /// Token pending (locked in transaction)
    TokenPending = 11002,
    /// Transaction unbalanced (inputs != outputs + fee)
    TransactionUnbalanced = 11003,
    /// Unit not supported by mint
    UnsupportedUnit = 11004,
    /// Minting disabled
    MintingDisabled = 11005,
    /// Quote not paid
    QuoteNotPaid = 11006,
    /// Quote expired
    QuoteExpired = 11007,
    /// Quote pending
    QuotePending = 11008,
    /// Blinded message already signed
    BlindedMessageAlreadySigned = 11009,
    /// Amount out of limit range
    AmountOutOfLimitRange = 11010,
    /// Duplicate inputs
    DuplicateInputs = 11011,
    /// Duplicate outputs
    DuplicateOutputs = 11012,
    /// Multiple units in single request
    MultipleUnits = 11013,
    /// Unit mismatch
    UnitMismatch = 11014,
    /// Witness missing or invalid (P2PK / HTLC)
    WitnessMissingOrInvalid = 11015,
    /// Duplicate signature
    DuplicateSignature = 11016,
    /// Keyset not known to the mint
    KeysetNotFound = 12001,
    /// Keyset no longer active
    KeysetInactive = 12002,
    /// Lightning error
    LightningError = 20001,
    /// Invoice already paid
    InvoiceAlreadyPaid = 20002,
    /// Unknown/generic error
    Unknown = 65535,
}

impl NutErrorCode {
    /// Create from numeric code
    pub fn from_code(code: u16) -> Self {
        match code {
            11001 => Self::TokenAlreadySpent,
            11002 => Self::TokenPending,
            11003 => Self::TransactionUnbalanced,
            11004 => Self::UnsupportedUnit,
            11005 => Self::MintingDisabled,
            11006 => Self::QuoteNotPaid,
            11007 => Self::QuoteExpired,
            11008 => Self::QuotePending,
            11009 => Self::BlindedMessageAlreadySigned,
            11010 => Self::AmountOutOfLimitRange,
            11011 => Self::DuplicateInputs,
            11012 => Self::DuplicateOutputs,
            11013 => Self::MultipleUnits,
            11014 => Self::UnitMismatch,
            11015 => Self::WitnessMissingOrInvalid,
            11016 => Self::DuplicateSignature,
            12001 => Self::KeysetNotFound,
            12002 => Self::KeysetInactive,
            20001 => Self::LightningError,
            20002 => Self::InvoiceAlreadyPaid,
            _ => Self::Unknown,
        }
    }

    /// Get numeric code value
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Check if error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TokenPending | Self::QuotePending | Self::LightningError | Self::Unknown
        )
    }

    /// Check if error indicates tokens are unusable
    pub fn is_token_lost(&self) -> bool {
        matches!(
            self,
            Self::TokenAlreadySpent | Self::BlindedMessageAlreadySigned
        )
    }
}

impl fmt::Display for NutErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenAlreadySpent => write!(f, "Token already spent (11001)"),
            Self::TokenPending => write!(f, "Token pending (11002)"),
            Self::TransactionUnbalanced => write!(f, "Transaction unbalanced (11003)"),
            Self::UnsupportedUnit => write!(f, "Unsupported unit (11004)"),
            Self::MintingDisabled => write!(f, "Minting disabled (11005)"),
            Self::QuoteNotPaid => write!(f, "Quote not paid (11006)"),
            Self::QuoteExpired => write!(f, "Quote expired (11007)"),
            Self::QuotePending => write!(f, "Quote pending (11008)"),
            Self::BlindedMessageAlreadySigned => write!(f, "Blinded message already signed (11009)"),
            Self::AmountOutOfLimitRange => write!(f, "Amount out of limit range (11010)"),
            Self::DuplicateInputs => write!(f, "Duplicate inputs (11011)"),
            Self::DuplicateOutputs => write!(f, "Duplicate outputs (11012)"),
            Self::MultipleUnits => write!(f, "Multiple units (11013)"),
            Self::UnitMismatch => write!(f, "Unit mismatch (11014)"),
            Self::WitnessMissingOrInvalid => write!(f, "Witness missing or invalid (11015)"),
            Self::DuplicateSignature => write!(f, "Duplicate signature (11016)"),
            Self::KeysetNotFound => write!(f, "Keyset not found (12001)"),
            Self::KeysetInactive => write!(f, "Keyset inactive (12002)"),
            Self::LightningError => write!(f, "Lightning error (20001)"),
            Self::InvoiceAlreadyPaid => write!(f, "Invoice already paid (20002)"),
            Self::Unknown => write!(f, "Unknown error (65535)"),
        }
    }
}

// =============================================================================
// Wallet Errors
// =============================================================================

/// Cashu wallet error type
#[derive(Debug, Error)]
pub enum CashuWalletError {
    // ==========================================================================
    // Input Errors (rejected before any state mutation)
    // ==========================================================================
    #[error("Wallet not initialized")]
    WalletNotInitialized,
    #[error("Invalid token format: {reason}")]
    InvalidToken { reason: String },
    #[error("Insufficient funds: available={available}, required={required}")]
    InsufficientFunds { available: u64, required: u64 },
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Preimage does not match payment hash")]
    InvalidPreimage,
    #[error("Invalid pubkey format: {0}")]
    InvalidPubkey(String),
    #[error("Invalid secret: {0}")]
    InvalidSecret(String),

    // ==========================================================================
    // Counterpart Errors
    // ==========================================================================
    #[error("No client registered for mint {mint_url}")]
    MintNotFound { mint_url: String },
    #[error("Mint {mint_url} unreachable: {message}")]
    MintUnreachable { mint_url: String, message: String },
    #[error("Mint {mint_url} rejected request ({}): {detail}", code_label(.code))]
    MintRejected {
        mint_url: String,
        code: Option<u16>,
        detail: String,
    },
    #[error("Broadcast store unreachable: {0}")]
    StoreUnreachable(String),
    #[error("Broadcast store rejected request: {0}")]
    StoreRejected(String),
    #[error("Publish failed after {attempts} attempts: {message}")]
    PublishExhausted { attempts: u32, message: String },

    // ==========================================================================
    // Quote Errors
    // ==========================================================================
    #[error("Quote unpaid: {quote_id}")]
    QuoteUnpaid { quote_id: String },
    #[error("Quote failed: {message}")]
    QuoteFailed { message: String },

    // ==========================================================================
    // Escrow Errors
    // ==========================================================================
    #[error("No escrow with id {escrow_id}")]
    HtlcNotFound { escrow_id: String },
    #[error("Escrow {escrow_id} already resolved ({status})")]
    HtlcAlreadyResolved { escrow_id: String, status: String },
    #[error("Refund not allowed before locktime {locktime} (now {now})")]
    RefundNotYetAllowed { locktime: u64, now: u64 },
    #[error("Failed to sign witness: {0}")]
    SigningFailed(String),

    // ==========================================================================
    // Recovery Errors
    // ==========================================================================
    #[error("Funds could not be recorded ({reason}); keep this token: {token}")]
    ValueAtRisk { token: String, reason: String },
    #[error("Pending operation not found: {id}")]
    OperationNotFound { id: String },
    #[error("Recovery token not found: {id}")]
    RecoveryTokenNotFound { id: String },

    // ==========================================================================
    // Infrastructure Errors
    // ==========================================================================
    #[error("Failed to encrypt content: {0}")]
    Encryption(String),
    #[error("Failed to decrypt content: {0}")]
    Decryption(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Local store error: {0}")]
    LocalStore(String),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Operation cancelled")]
    Cancelled,
}

fn code_label(code: &Option<u16>) -> String {
    match code {
        Some(code) => NutErrorCode::from_code(*code).to_string(),
        None => "no code".to_string(),
    }
}

/// Result type alias for cashu wallet operations
pub type CashuResult<T> = Result<T, CashuWalletError>;

impl From<serde_json::Error> for CashuWalletError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<LocalStoreError> for CashuWalletError {
    fn from(err: LocalStoreError) -> Self {
        Self::LocalStore(err.to_string())
    }
}

impl From<StoreError> for CashuWalletError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unreachable(msg) => Self::StoreUnreachable(msg),
            StoreError::Rejected(msg) => Self::StoreRejected(msg),
        }
    }
}

impl CashuWalletError {
    /// NUT error code carried by a mint rejection, if any
    pub fn nut_error_code(&self) -> Option<NutErrorCode> {
        match self {
            Self::MintRejected { code: Some(code), .. } => Some(NutErrorCode::from_code(*code)),
            _ => None,
        }
    }

    /// Check if this error indicates tokens are already spent
    pub fn is_token_spent(&self) -> bool {
        if self.nut_error_code() == Some(NutErrorCode::TokenAlreadySpent) {
            return true;
        }
        match self {
            Self::MintRejected { detail, .. } => {
                let msg = detail.to_lowercase();
                msg.contains("already spent") || msg.contains("already redeemed")
            }
            _ => false,
        }
    }

    /// Check if the mint reported the inputs as pending
    pub fn is_token_pending(&self) -> bool {
        self.nut_error_code() == Some(NutErrorCode::TokenPending)
    }

    /// Check if the mint no longer accepts the keyset the request used
    pub fn is_keyset_error(&self) -> bool {
        matches!(
            self.nut_error_code(),
            Some(NutErrorCode::KeysetNotFound | NutErrorCode::KeysetInactive)
        )
    }

    /// Check if this is an insufficient funds error
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, Self::InsufficientFunds { .. })
    }

    /// Check if this is a connection/network error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::MintUnreachable { .. } | Self::StoreUnreachable(_)
        )
    }

    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        self.is_connection_error()
            || self.nut_error_code().map(|c| c.is_recoverable()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nut_error_code_roundtrip() {
        assert_eq!(NutErrorCode::from_code(11001), NutErrorCode::TokenAlreadySpent);
        assert_eq!(NutErrorCode::TokenAlreadySpent.code(), 11001);
        assert_eq!(NutErrorCode::from_code(4242), NutErrorCode::Unknown);
        assert!(NutErrorCode::TokenPending.is_recoverable());
        assert!(!NutErrorCode::TokenAlreadySpent.is_recoverable());
        assert!(NutErrorCode::BlindedMessageAlreadySigned.is_token_lost());
        assert_eq!(NutErrorCode::from_code(12002), NutErrorCode::KeysetInactive);
    }

    #[test]
    fn test_spent_detection() {
        let by_code = CashuWalletError::MintRejected {
            mint_url: "https://mint.example.com".into(),
            code: Some(11001),
            detail: "proofs spent".into(),
        };
        assert!(by_code.is_token_spent());
        assert!(!by_code.is_retryable());

        let by_text = CashuWalletError::MintRejected {
            mint_url: "https://mint.example.com".into(),
            code: None,
            detail: "Token already spent.".into(),
        };
        assert!(by_text.is_token_spent());

        let witness = CashuWalletError::MintRejected {
            mint_url: "https://mint.example.com".into(),
            code: Some(11015),
            detail: "bad witness".into(),
        };
        assert!(!witness.is_token_spent());
    }

    #[test]
    fn test_unreachable_vs_rejected() {
        let unreachable = CashuWalletError::MintUnreachable {
            mint_url: "https://mint.example.com".into(),
            message: "timeout".into(),
        };
        assert!(unreachable.is_connection_error());
        assert!(unreachable.is_retryable());

        let store: CashuWalletError = StoreError::Rejected("blocked".into()).into();
        assert!(!store.is_connection_error());
        let store: CashuWalletError = StoreError::Unreachable("offline".into()).into();
        assert!(store.is_connection_error());
    }

    #[test]
    fn test_display_includes_code() {
        let err = CashuWalletError::MintRejected {
            mint_url: "https://mint.example.com".into(),
            code: Some(11002),
            detail: "pending".into(),
        };
        assert!(err.to_string().contains("11002"));
    }
}
