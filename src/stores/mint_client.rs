//! Mint HTTP boundary
//!
//! Typed calls for the Cashu v1 REST surface the wallet consumes. Every
//! outcome is `Ok`, [`MintError::Rejected`] (the mint answered and refused)
//! or [`MintError::Unreachable`] (no usable answer). The distinction drives
//! recovery: unreachable requests may be retried, rejected ones may not.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::cashu::config::WalletConfig;
use super::cashu::errors::{CashuResult, CashuWalletError};
use super::cashu::types::{Keyset, Proof};
use super::cashu::utils::normalize_mint_url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MintError {
    #[error("rejected (code {code:?}): {detail}")]
    Rejected { code: Option<u16>, detail: String },
    #[error("unreachable: {0}")]
    Unreachable(String),
}

impl MintError {
    pub fn into_wallet_error(self, mint_url: &str) -> CashuWalletError {
        match self {
            MintError::Rejected { code, detail } => CashuWalletError::MintRejected {
                mint_url: mint_url.to_string(),
                code,
                detail,
            },
            MintError::Unreachable(message) => CashuWalletError::MintUnreachable {
                mint_url: mint_url.to_string(),
                message,
            },
        }
    }
}

// =============================================================================
// Wire types (NUT-00 .. NUT-09)
// =============================================================================

/// Output sent to the mint for signing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlindedMessage {
    pub amount: u64,
    pub id: String,
    #[serde(rename = "B_")]
    pub blinded_secret: String,
}

/// Mint's signature on a blinded output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlindSignature {
    pub amount: u64,
    pub id: String,
    #[serde(rename = "C_")]
    pub blinded_signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeysetInfo {
    pub id: String,
    pub unit: String,
    pub active: bool,
    #[serde(default)]
    pub input_fee_ppk: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysetsResponse {
    pub keysets: Vec<KeysetInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysetKeys {
    pub id: String,
    pub unit: String,
    pub keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysResponse {
    pub keysets: Vec<KeysetKeys>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRequest {
    pub inputs: Vec<Proof>,
    pub outputs: Vec<BlindedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapResponse {
    pub signatures: Vec<BlindSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStateRequest {
    #[serde(rename = "Ys")]
    pub ys: Vec<String>,
}

/// Spend state of a proof as reported by the mint (NUT-07)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MintProofState {
    Unspent,
    Pending,
    Spent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProofStateEntry {
    #[serde(rename = "Y")]
    pub y: String,
    pub state: MintProofState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStateResponse {
    pub states: Vec<ProofStateEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintQuoteRequest {
    pub amount: u64,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MintQuoteState {
    #[default]
    Unpaid,
    Paid,
    Issued,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MintQuoteResponse {
    pub quote: String,
    /// Lightning invoice to pay
    pub request: String,
    #[serde(default)]
    pub state: MintQuoteState,
    #[serde(default)]
    pub expiry: Option<u64>,
    #[serde(default)]
    pub amount: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintRequest {
    pub quote: String,
    pub outputs: Vec<BlindedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintResponse {
    pub signatures: Vec<BlindSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeltQuoteRequest {
    pub request: String,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeltQuoteState {
    #[default]
    Unpaid,
    Pending,
    Paid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeltQuoteResponse {
    pub quote: String,
    pub amount: u64,
    pub fee_reserve: u64,
    #[serde(default)]
    pub state: MeltQuoteState,
    #[serde(default)]
    pub expiry: Option<u64>,
    #[serde(default)]
    pub payment_preimage: Option<String>,
    #[serde(default)]
    pub change: Option<Vec<BlindSignature>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeltRequest {
    pub quote: String,
    pub inputs: Vec<Proof>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<BlindedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub outputs: Vec<BlindedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResponse {
    pub outputs: Vec<BlindedMessage>,
    pub signatures: Vec<BlindSignature>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    code: Option<u16>,
}

// =============================================================================
// Client trait
// =============================================================================

#[async_trait]
pub trait MintClient: Send + Sync {
    /// Normalized URL this client talks to
    fn mint_url(&self) -> &str;

    async fn get_keysets(&self) -> Result<Vec<KeysetInfo>, MintError>;
    async fn get_keys(&self, keyset_id: &str) -> Result<Keyset, MintError>;
    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse, MintError>;
    async fn check_state(&self, ys: Vec<String>) -> Result<Vec<ProofStateEntry>, MintError>;
    async fn mint_quote(&self, request: MintQuoteRequest) -> Result<MintQuoteResponse, MintError>;
    async fn mint_quote_status(&self, quote_id: &str) -> Result<MintQuoteResponse, MintError>;
    async fn mint(&self, request: MintRequest) -> Result<MintResponse, MintError>;
    async fn melt_quote(&self, request: MeltQuoteRequest) -> Result<MeltQuoteResponse, MintError>;
    async fn melt(&self, request: MeltRequest) -> Result<MeltQuoteResponse, MintError>;
    async fn restore(&self, request: RestoreRequest) -> Result<RestoreResponse, MintError>;
}

// =============================================================================
// HTTP adapter
// =============================================================================

/// `reqwest` client for a single mint; every call carries the client timeout
#[derive(Debug, Clone)]
pub struct HttpMintClient {
    mint_url: String,
    http: reqwest::Client,
}

impl HttpMintClient {
    pub fn new(mint_url: &str, timeout: Duration) -> Result<Self, MintError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MintError::Unreachable(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            mint_url: normalize_mint_url(mint_url),
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.mint_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, MintError> {
        let response = self
            .http
            .get(self.endpoint(path))
            .send()
            .await
            .map_err(classify_transport_error)?;
        decode_response(response).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, MintError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(classify_transport_error)?;
        decode_response(response).await
    }
}

fn classify_transport_error(e: reqwest::Error) -> MintError {
    if e.is_timeout() {
        MintError::Unreachable(format!("timeout: {}", e))
    } else {
        MintError::Unreachable(e.to_string())
    }
}

async fn decode_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, MintError> {
    let status = response.status();
    let body = response.text().await.map_err(classify_transport_error)?;

    if status.is_success() {
        return serde_json::from_str(&body).map_err(|e| MintError::Rejected {
            code: None,
            detail: format!("unexpected response body: {}", e),
        });
    }

    if status.is_server_error() && status != reqwest::StatusCode::INTERNAL_SERVER_ERROR {
        // Gateway errors mean the mint itself never answered
        return Err(MintError::Unreachable(format!("HTTP {}", status)));
    }

    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => Err(MintError::Rejected {
            code: err.code,
            detail: err.detail.unwrap_or_else(|| body.clone()),
        }),
        Err(_) => Err(MintError::Rejected {
            code: None,
            detail: format!("HTTP {}: {}", status, body),
        }),
    }
}

#[async_trait]
impl MintClient for HttpMintClient {
    fn mint_url(&self) -> &str {
        &self.mint_url
    }

    async fn get_keysets(&self) -> Result<Vec<KeysetInfo>, MintError> {
        let response: KeysetsResponse = self.get("keysets").await?;
        Ok(response.keysets)
    }

    async fn get_keys(&self, keyset_id: &str) -> Result<Keyset, MintError> {
        let response: KeysResponse = self.get(&format!("keys/{}", keyset_id)).await?;
        let keys = response
            .keysets
            .into_iter()
            .find(|k| k.id == keyset_id)
            .ok_or_else(|| MintError::Rejected {
                code: None,
                detail: format!("mint returned no keys for keyset {}", keyset_id),
            })?;
        Keyset::from_wire(keys, true, 0).map_err(|e| MintError::Rejected {
            code: None,
            detail: e.to_string(),
        })
    }

    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse, MintError> {
        self.post("swap", &request).await
    }

    async fn check_state(&self, ys: Vec<String>) -> Result<Vec<ProofStateEntry>, MintError> {
        let response: CheckStateResponse = self.post("checkstate", &CheckStateRequest { ys }).await?;
        Ok(response.states)
    }

    async fn mint_quote(&self, request: MintQuoteRequest) -> Result<MintQuoteResponse, MintError> {
        self.post("mint/quote/bolt11", &request).await
    }

    async fn mint_quote_status(&self, quote_id: &str) -> Result<MintQuoteResponse, MintError> {
        self.get(&format!("mint/quote/bolt11/{}", quote_id)).await
    }

    async fn mint(&self, request: MintRequest) -> Result<MintResponse, MintError> {
        self.post("mint/bolt11", &request).await
    }

    async fn melt_quote(&self, request: MeltQuoteRequest) -> Result<MeltQuoteResponse, MintError> {
        self.post("melt/quote/bolt11", &request).await
    }

    async fn melt(&self, request: MeltRequest) -> Result<MeltQuoteResponse, MintError> {
        self.post("melt/bolt11", &request).await
    }

    async fn restore(&self, request: RestoreRequest) -> Result<RestoreResponse, MintError> {
        self.post("restore", &request).await
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Mint clients keyed by normalized URL
///
/// With an HTTP timeout configured, unknown mints get an [`HttpMintClient`]
/// on first use; otherwise only registered clients are served.
pub struct MintRegistry {
    clients: RwLock<HashMap<String, Arc<dyn MintClient>>>,
    http_timeout: Option<Duration>,
}

impl MintRegistry {
    /// Registry that only serves explicitly registered clients
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            http_timeout: None,
        }
    }

    /// Registry that creates HTTP clients on demand
    pub fn with_http(timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            http_timeout: Some(timeout),
        }
    }

    pub fn from_config(config: &WalletConfig) -> Self {
        Self::with_http(config.mint_timeout())
    }

    pub fn register(&self, client: Arc<dyn MintClient>) {
        let url = normalize_mint_url(client.mint_url());
        if let Ok(mut clients) = self.clients.write() {
            clients.insert(url, client);
        }
    }

    pub fn get(&self, mint_url: &str) -> CashuResult<Arc<dyn MintClient>> {
        let url = normalize_mint_url(mint_url);
        if let Some(client) = self.clients.read().ok().and_then(|c| c.get(&url).cloned()) {
            return Ok(client);
        }

        let timeout = self.http_timeout.ok_or_else(|| CashuWalletError::MintNotFound {
            mint_url: url.clone(),
        })?;
        let client: Arc<dyn MintClient> = Arc::new(
            HttpMintClient::new(&url, timeout).map_err(|e| e.into_wallet_error(&url))?,
        );
        log::info!("Created HTTP client for mint {}", url);
        self.register(client.clone());
        Ok(client)
    }
}

impl Default for MintRegistry {
    fn default() -> Self {
        Self::new()
    }
}
