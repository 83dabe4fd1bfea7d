//! In-memory mint
//!
//! Blind-signs with real per-denomination secp256k1 keys, tracks spent `Y`s,
//! enforces HTLC witnesses and locktimes against a shared clock, remembers
//! every signature for NUT-09 restore, and can be told to fail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use secp256k1::{PublicKey, SecretKey, SECP256K1};

use crate::crypto::{hash_to_curve, public_key_from_hex, sha256, sign_blinded, verify_unblinded};
use crate::stores::cashu::spending_conditions::{parse_secret, HtlcWitness, ParsedSecret};
use crate::stores::cashu::types::{Keyset, Proof};
use crate::stores::cashu::utils::{normalize_mint_url, split_amount, Clock, SystemClock};
use crate::stores::mint_client::{
    BlindSignature, BlindedMessage, KeysetInfo, MeltQuoteRequest, MeltQuoteResponse,
    MeltQuoteState, MeltRequest, MintClient, MintError, MintProofState, MintQuoteRequest,
    MintQuoteResponse, MintQuoteState, MintRequest, MintResponse, ProofStateEntry,
    RestoreRequest, RestoreResponse, SwapRequest, SwapResponse,
};

const MAX_ORDER: u32 = 64;

#[derive(Default)]
struct FakeMintState {
    spent: HashSet<String>,
    pending: HashSet<String>,
    /// B_ -> signature, for restore and double-sign detection
    signed: HashMap<String, BlindSignature>,
    mint_quotes: HashMap<String, MintQuoteResponse>,
    melt_quotes: HashMap<String, MeltQuoteResponse>,
    failing_swaps: u32,
    dropped_swap_responses: u32,
    /// Ys spent by someone else right before the next swap
    spend_before_swap: Vec<String>,
    swaps: u32,
}

pub struct FakeMint {
    url: String,
    keyset_id: String,
    secrets: BTreeMap<u64, SecretKey>,
    clock: Arc<dyn Clock>,
    state: Mutex<FakeMintState>,
    unreachable: AtomicBool,
    auto_pay: AtomicBool,
    melt_fee_reserve: AtomicU32,
    keys_requests: AtomicU32,
}

fn rejected(code: Option<u16>, detail: impl Into<String>) -> MintError {
    MintError::Rejected {
        code,
        detail: detail.into(),
    }
}

impl FakeMint {
    pub fn new(url: &str) -> Self {
        Self::with_clock(url, Arc::new(SystemClock))
    }

    pub fn with_clock(url: &str, clock: Arc<dyn Clock>) -> Self {
        let url = normalize_mint_url(url);
        let mut secrets = BTreeMap::new();
        for order in 0..MAX_ORDER {
            let amount = 1u64 << order;
            let mut nonce = 0u32;
            let secret = loop {
                let bytes = sha256(format!("{}:{}:{}", url, amount, nonce).as_bytes());
                if let Ok(secret) = SecretKey::from_slice(&bytes) {
                    break secret;
                }
                nonce += 1;
            };
            secrets.insert(amount, secret);
        }

        let mut concatenated = Vec::new();
        for secret in secrets.values() {
            concatenated.extend_from_slice(&PublicKey::from_secret_key(SECP256K1, secret).serialize());
        }
        let keyset_id = format!("00{}", &hex::encode(sha256(&concatenated))[..14]);

        Self {
            url,
            keyset_id,
            secrets,
            clock,
            state: Mutex::new(FakeMintState::default()),
            unreachable: AtomicBool::new(false),
            auto_pay: AtomicBool::new(true),
            melt_fee_reserve: AtomicU32::new(2),
            keys_requests: AtomicU32::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeMintState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_reachable(&self) -> Result<(), MintError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(MintError::Unreachable("fake mint offline".to_string()))
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Knobs and inspection
    // -------------------------------------------------------------------------

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `count` swaps before the mint processes them
    pub fn fail_next_swaps(&self, count: u32) {
        self.state().failing_swaps = count;
    }

    /// Process the next `count` swaps, then fail as if the response was lost
    pub fn drop_next_swap_responses(&self, count: u32) {
        self.state().dropped_swap_responses = count;
    }

    /// Spend `proof` elsewhere just before the next swap is processed
    pub fn mark_spent_on_next_swap(&self, proof: &Proof) {
        if let Ok(y) = proof.y() {
            self.state().spend_before_swap.push(y);
        }
    }

    /// Whether new mint quotes start out paid
    pub fn set_auto_pay(&self, auto_pay: bool) {
        self.auto_pay.store(auto_pay, Ordering::SeqCst);
    }

    pub fn pay_quote(&self, quote_id: &str) {
        if let Some(quote) = self.state().mint_quotes.get_mut(quote_id) {
            quote.state = MintQuoteState::Paid;
        }
    }

    pub fn set_melt_fee_reserve(&self, fee_reserve: u32) {
        self.melt_fee_reserve.store(fee_reserve, Ordering::SeqCst);
    }

    pub fn keys_requests(&self) -> u32 {
        self.keys_requests.load(Ordering::SeqCst)
    }

    pub fn swap_count(&self) -> u32 {
        self.state().swaps
    }

    pub fn keyset(&self) -> Keyset {
        Keyset {
            id: self.keyset_id.clone(),
            unit: "sat".to_string(),
            active: true,
            input_fee_ppk: 0,
            keys: self
                .secrets
                .iter()
                .map(|(amount, secret)| {
                    (*amount, PublicKey::from_secret_key(SECP256K1, secret).to_string())
                })
                .collect(),
        }
    }

    /// Issue valid plain proofs directly, bypassing blinding
    pub async fn issue(&self, amounts: &[u64]) -> Vec<Proof> {
        amounts
            .iter()
            .filter_map(|amount| {
                let secret = hex::encode(rand::random::<[u8; 32]>());
                self.sign_secret(*amount, &secret)
            })
            .collect()
    }

    fn sign_secret(&self, amount: u64, secret: &str) -> Option<Proof> {
        let key = self.secrets.get(&amount)?;
        let y = hash_to_curve(secret.as_bytes()).ok()?;
        let c = sign_blinded(key, &y).ok()?;
        Some(Proof {
            amount,
            keyset_id: self.keyset_id.clone(),
            secret: secret.to_string(),
            c: c.to_string(),
            witness: None,
        })
    }

    pub fn mark_spent(&self, proof: &Proof) {
        if let Ok(y) = proof.y() {
            self.state().spent.insert(y);
        }
    }

    pub fn mark_pending(&self, proof: &Proof) {
        if let Ok(y) = proof.y() {
            self.state().pending.insert(y);
        }
    }

    pub fn is_spent(&self, proof: &Proof) -> bool {
        proof
            .y()
            .map(|y| self.state().spent.contains(&y))
            .unwrap_or(false)
    }

    /// Whether the proof carries a valid signature from this mint
    pub fn is_valid(&self, proof: &Proof) -> bool {
        let Some(key) = self.secrets.get(&proof.amount) else {
            return false;
        };
        let Ok(c) = public_key_from_hex(&proof.c) else {
            return false;
        };
        proof.keyset_id == self.keyset_id
            && verify_unblinded(key, proof.secret.as_bytes(), &c).unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Validate inputs and return their Ys
    fn verify_inputs(&self, state: &FakeMintState, inputs: &[Proof]) -> Result<Vec<String>, MintError> {
        let mut ys = Vec::new();
        for input in inputs {
            let y = input
                .y()
                .map_err(|e| rejected(None, format!("invalid secret: {}", e)))?;
            if ys.contains(&y) {
                return Err(rejected(Some(11011), "Duplicate inputs provided"));
            }
            if state.spent.contains(&y) {
                return Err(rejected(Some(11001), "Token already spent"));
            }
            if state.pending.contains(&y) {
                return Err(rejected(Some(11002), "Token is pending"));
            }
            if !self.is_valid(input) {
                return Err(rejected(None, "Could not verify proof"));
            }

            match parse_secret(&input.secret) {
                Ok(ParsedSecret::Plain(_)) => {}
                Ok(ParsedSecret::Htlc(conditions)) => {
                    let witness = input
                        .witness
                        .as_deref()
                        .ok_or_else(|| rejected(Some(11015), "Witness is missing for HTLC"))
                        .and_then(|raw| {
                            HtlcWitness::from_json(raw)
                                .map_err(|e| rejected(Some(11015), e.to_string()))
                        })?;
                    conditions
                        .verify_witness(&input.secret, &witness, self.clock.now())
                        .map_err(|detail| rejected(Some(11015), detail))?;
                }
                Err(e) => return Err(rejected(None, e.to_string())),
            }
            ys.push(y);
        }
        Ok(ys)
    }

    fn check_outputs(&self, state: &FakeMintState, outputs: &[BlindedMessage]) -> Result<(), MintError> {
        let mut seen = HashSet::new();
        for output in outputs {
            if output.id != self.keyset_id {
                return Err(rejected(None, format!("unknown keyset {}", output.id)));
            }
            if !self.secrets.contains_key(&output.amount) {
                return Err(rejected(Some(11010), format!("invalid amount {}", output.amount)));
            }
            if !seen.insert(output.blinded_secret.clone()) {
                return Err(rejected(Some(11012), "Duplicate outputs provided"));
            }
            if state.signed.contains_key(&output.blinded_secret) {
                return Err(rejected(Some(11009), "Blinded message already signed"));
            }
        }
        Ok(())
    }

    /// Sign `output` for `amount` (which may differ for blank change outputs)
    fn sign_output(
        &self,
        state: &mut FakeMintState,
        output: &BlindedMessage,
        amount: u64,
    ) -> Result<BlindSignature, MintError> {
        let key = self
            .secrets
            .get(&amount)
            .ok_or_else(|| rejected(Some(11010), format!("invalid amount {}", amount)))?;
        let blinded = public_key_from_hex(&output.blinded_secret)
            .map_err(|e| rejected(None, format!("invalid blinded message: {}", e)))?;
        let c_ = sign_blinded(key, &blinded).map_err(|e| rejected(None, e.to_string()))?;
        let signature = BlindSignature {
            amount,
            id: self.keyset_id.clone(),
            blinded_signature: c_.to_string(),
        };
        state
            .signed
            .insert(output.blinded_secret.clone(), signature.clone());
        Ok(signature)
    }
}

#[async_trait]
impl MintClient for FakeMint {
    fn mint_url(&self) -> &str {
        &self.url
    }

    async fn get_keysets(&self) -> Result<Vec<KeysetInfo>, MintError> {
        self.check_reachable()?;
        Ok(vec![KeysetInfo {
            id: self.keyset_id.clone(),
            unit: "sat".to_string(),
            active: true,
            input_fee_ppk: 0,
        }])
    }

    async fn get_keys(&self, keyset_id: &str) -> Result<Keyset, MintError> {
        self.check_reachable()?;
        self.keys_requests.fetch_add(1, Ordering::SeqCst);
        if keyset_id != self.keyset_id {
            return Err(rejected(None, format!("unknown keyset {}", keyset_id)));
        }
        Ok(self.keyset())
    }

    async fn swap(&self, request: SwapRequest) -> Result<SwapResponse, MintError> {
        self.check_reachable()?;
        let mut state = self.state();

        if state.failing_swaps > 0 {
            state.failing_swaps -= 1;
            return Err(MintError::Unreachable("injected swap failure".to_string()));
        }

        let raced: Vec<String> = state.spend_before_swap.drain(..).collect();
        state.spent.extend(raced);

        let ys = self.verify_inputs(&state, &request.inputs)?;
        self.check_outputs(&state, &request.outputs)?;

        let input_total: u64 = request.inputs.iter().map(|p| p.amount).sum();
        let output_total: u64 = request.outputs.iter().map(|o| o.amount).sum();
        if input_total != output_total {
            return Err(rejected(
                Some(11003),
                format!("inputs {} != outputs {}", input_total, output_total),
            ));
        }

        let mut signatures = Vec::with_capacity(request.outputs.len());
        for output in &request.outputs {
            signatures.push(self.sign_output(&mut state, output, output.amount)?);
        }
        state.spent.extend(ys);
        state.swaps += 1;

        if state.dropped_swap_responses > 0 {
            state.dropped_swap_responses -= 1;
            return Err(MintError::Unreachable("response lost".to_string()));
        }
        Ok(SwapResponse { signatures })
    }

    async fn check_state(&self, ys: Vec<String>) -> Result<Vec<ProofStateEntry>, MintError> {
        self.check_reachable()?;
        let state = self.state();
        Ok(ys
            .into_iter()
            .map(|y| {
                let proof_state = if state.spent.contains(&y) {
                    MintProofState::Spent
                } else if state.pending.contains(&y) {
                    MintProofState::Pending
                } else {
                    MintProofState::Unspent
                };
                ProofStateEntry {
                    y,
                    state: proof_state,
                    witness: None,
                }
            })
            .collect())
    }

    async fn mint_quote(&self, request: MintQuoteRequest) -> Result<MintQuoteResponse, MintError> {
        self.check_reachable()?;
        if request.unit != "sat" {
            return Err(rejected(Some(11004), "unit not supported"));
        }
        let quote_id = uuid::Uuid::new_v4().to_string();
        let quote = MintQuoteResponse {
            quote: quote_id.clone(),
            request: format!("lnbcfake{}", request.amount),
            state: if self.auto_pay.load(Ordering::SeqCst) {
                MintQuoteState::Paid
            } else {
                MintQuoteState::Unpaid
            },
            expiry: Some(self.clock.now() + 3600),
            amount: Some(request.amount),
        };
        self.state().mint_quotes.insert(quote_id, quote.clone());
        Ok(quote)
    }

    async fn mint_quote_status(&self, quote_id: &str) -> Result<MintQuoteResponse, MintError> {
        self.check_reachable()?;
        self.state()
            .mint_quotes
            .get(quote_id)
            .cloned()
            .ok_or_else(|| rejected(None, "unknown quote"))
    }

    async fn mint(&self, request: MintRequest) -> Result<MintResponse, MintError> {
        self.check_reachable()?;
        let mut state = self.state();
        let quote = state
            .mint_quotes
            .get(&request.quote)
            .cloned()
            .ok_or_else(|| rejected(None, "unknown quote"))?;
        match quote.state {
            MintQuoteState::Unpaid => return Err(rejected(Some(11006), "Quote not paid")),
            MintQuoteState::Issued => return Err(rejected(None, "Quote already issued")),
            MintQuoteState::Paid => {}
        }

        self.check_outputs(&state, &request.outputs)?;
        let output_total: u64 = request.outputs.iter().map(|o| o.amount).sum();
        if Some(output_total) != quote.amount {
            return Err(rejected(Some(11003), "outputs do not match quote amount"));
        }

        let mut signatures = Vec::new();
        for output in &request.outputs {
            signatures.push(self.sign_output(&mut state, output, output.amount)?);
        }
        if let Some(q) = state.mint_quotes.get_mut(&request.quote) {
            q.state = MintQuoteState::Issued;
        }
        Ok(MintResponse { signatures })
    }

    async fn melt_quote(&self, request: MeltQuoteRequest) -> Result<MeltQuoteResponse, MintError> {
        self.check_reachable()?;
        let amount: u64 = request
            .request
            .strip_prefix("fake:")
            .and_then(|a| a.parse().ok())
            .ok_or_else(|| rejected(Some(20001), "invalid invoice"))?;
        let quote = MeltQuoteResponse {
            quote: uuid::Uuid::new_v4().to_string(),
            amount,
            fee_reserve: self.melt_fee_reserve.load(Ordering::SeqCst) as u64,
            state: MeltQuoteState::Unpaid,
            expiry: Some(self.clock.now() + 3600),
            payment_preimage: None,
            change: None,
        };
        self.state()
            .melt_quotes
            .insert(quote.quote.clone(), quote.clone());
        Ok(quote)
    }

    async fn melt(&self, request: MeltRequest) -> Result<MeltQuoteResponse, MintError> {
        self.check_reachable()?;
        let mut state = self.state();
        let quote = state
            .melt_quotes
            .get(&request.quote)
            .cloned()
            .ok_or_else(|| rejected(None, "unknown quote"))?;
        if quote.state != MeltQuoteState::Unpaid {
            return Err(rejected(Some(20002), "Invoice already paid"));
        }

        let ys = self.verify_inputs(&state, &request.inputs)?;
        self.check_outputs(&state, &request.outputs)?;
        let input_total: u64 = request.inputs.iter().map(|p| p.amount).sum();
        if input_total < quote.amount + quote.fee_reserve {
            return Err(rejected(Some(11003), "inputs do not cover amount and fee reserve"));
        }

        // Lightning is free here, so the whole overpayment comes back as change
        let change_amounts = split_amount(input_total - quote.amount);
        if change_amounts.len() > request.outputs.len() && !change_amounts.is_empty() {
            log::debug!(
                "Fake mint keeps {} sats: not enough blank outputs",
                input_total - quote.amount
            );
        }
        let mut change = Vec::new();
        for (output, amount) in request.outputs.iter().zip(change_amounts) {
            change.push(self.sign_output(&mut state, output, amount)?);
        }

        state.spent.extend(ys);
        let paid = MeltQuoteResponse {
            state: MeltQuoteState::Paid,
            payment_preimage: Some(hex::encode([0u8; 32])),
            change: Some(change),
            ..quote
        };
        state.melt_quotes.insert(paid.quote.clone(), paid.clone());
        Ok(paid)
    }

    async fn restore(&self, request: RestoreRequest) -> Result<RestoreResponse, MintError> {
        self.check_reachable()?;
        let state = self.state();
        let mut outputs = Vec::new();
        let mut signatures = Vec::new();
        for output in request.outputs {
            if let Some(signature) = state.signed.get(&output.blinded_secret) {
                signatures.push(signature.clone());
                outputs.push(output);
            }
        }
        Ok(RestoreResponse {
            outputs,
            signatures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::cashu::utils::ManualClock;

    #[tokio::test]
    async fn test_issued_proofs_verify() {
        let mint = FakeMint::new("https://mint.example.com");
        let proofs = mint.issue(&[1, 64]).await;
        assert_eq!(proofs.len(), 2);
        assert!(proofs.iter().all(|p| mint.is_valid(p)));
        assert!(mint.keyset().id.starts_with("00"));
        assert_eq!(mint.keyset().id.len(), 16);

        let mut forged = proofs[0].clone();
        forged.amount = 2;
        assert!(!mint.is_valid(&forged));
    }

    #[tokio::test]
    async fn test_check_state_reports_spent() {
        let mint = FakeMint::with_clock("https://mint.example.com", Arc::new(ManualClock::new(0)));
        let proofs = mint.issue(&[4, 8]).await;
        mint.mark_spent(&proofs[0]);

        let ys: Vec<String> = proofs.iter().map(|p| p.y().unwrap()).collect();
        let states = mint.check_state(ys).await.unwrap();
        assert_eq!(states[0].state, MintProofState::Spent);
        assert_eq!(states[1].state, MintProofState::Unspent);
    }
}
