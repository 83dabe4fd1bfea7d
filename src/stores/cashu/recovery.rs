//! Wallet recovery
//!
//! The safety net keeps proofs that could not be published as locally stored
//! tokens, so value is never dropped because the store was unreachable. Seed
//! recovery (NUT-09 / NUT-13) rebuilds proofs the mint signed for this seed.

use std::collections::HashMap;
use std::sync::Arc;

use super::errors::{CashuResult, CashuWalletError};
use super::internal::{persist_metadata, WalletContext, WalletState};
use super::proofs::ProofVerification;
use super::swap::{deterministic_outputs, unblind_outputs, PreparedOutput};
use super::token::{decode_token, encode_token};
use super::types::{total_amount, Proof, RecoveryToken};
use super::utils::{normalize_mint_url, Clock};
use crate::stores::local_store::{get_json, list_json, put_json, LocalStore};
use crate::stores::mint_client::RestoreRequest;

const KEY_PREFIX: &str = "recovery_token:";

fn key_for(id: &str) -> String {
    format!("{}{}", KEY_PREFIX, id)
}

// =============================================================================
// Safety Net
// =============================================================================

/// Locally retained tokens for value that could not be recorded
///
/// Tokens are never spent automatically; they are listed until the caller
/// republishes them.
pub struct SafetyNet {
    local: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
}

impl SafetyNet {
    pub fn new(local: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { local, clock }
    }

    /// Keep `proofs` as a recovery token
    ///
    /// If even the local write fails, the error carries the encoded token.
    pub async fn capture(
        &self,
        proofs: &[Proof],
        mint_url: &str,
        reason: &str,
    ) -> CashuResult<RecoveryToken> {
        let mint_url = normalize_mint_url(mint_url);
        let encoded_token = encode_token(&mint_url, proofs, Some("recovery".to_string()))?;
        let token = RecoveryToken {
            id: uuid::Uuid::new_v4().to_string(),
            encoded_token,
            amount_sats: total_amount(proofs),
            mint_url,
            reason: reason.to_string(),
            created_at: self.clock.now(),
        };

        if let Err(e) = put_json(self.local.as_ref(), &key_for(&token.id), &token).await {
            log::error!(
                "Could not store recovery token for {} sats: {}",
                token.amount_sats,
                e
            );
            return Err(CashuWalletError::ValueAtRisk {
                token: token.encoded_token,
                reason: e.to_string(),
            });
        }

        log::warn!(
            "Captured {} sats as recovery token {} ({})",
            token.amount_sats,
            token.id,
            reason
        );
        Ok(token)
    }

    /// Every retained token, oldest first
    pub async fn list(&self) -> CashuResult<Vec<RecoveryToken>> {
        let mut tokens: Vec<RecoveryToken> = list_json(self.local.as_ref(), KEY_PREFIX).await?;
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tokens)
    }

    pub async fn get(&self, id: &str) -> CashuResult<RecoveryToken> {
        get_json(self.local.as_ref(), &key_for(id))
            .await?
            .ok_or_else(|| CashuWalletError::RecoveryTokenNotFound { id: id.to_string() })
    }

    pub async fn remove(&self, id: &str) -> CashuResult<()> {
        self.local.delete(&key_for(id)).await?;
        Ok(())
    }
}

/// Publish a recovery token's unspent proofs to the ledger and drop the token
///
/// Returns the amount republished. Proofs the mint reports spent are
/// discarded; if the mint cannot be asked the token is kept.
pub(crate) async fn republish(ctx: &WalletContext, id: &str) -> CashuResult<u64> {
    let token = ctx.safety_net.get(id).await?;
    let (mint_url, proofs) = decode_token(&token.encoded_token)?;
    let mint = ctx.mint(&mint_url)?;

    let unspent = match ctx.ledger.verify_proofs(mint.as_ref(), &proofs).await {
        ProofVerification::Checked { unspent, .. } => unspent,
        ProofVerification::Unverified { reason } => {
            return Err(CashuWalletError::MintUnreachable {
                mint_url,
                message: reason,
            })
        }
    };

    let amount = total_amount(&unspent);
    if !unspent.is_empty() {
        ctx.ledger.publish_proofs(&unspent, &mint_url, &[]).await?;
    }
    ctx.safety_net.remove(id).await?;

    log::info!(
        "Republished recovery token {}: {} of {} sats still unspent",
        id,
        amount,
        token.amount_sats
    );
    Ok(amount)
}

// =============================================================================
// Seed Recovery (NUT-09 / NUT-13)
// =============================================================================

/// Summary of a seed restore run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub keyset_id: String,
    /// Sats newly added to the ledger
    pub restored: u64,
    /// Proofs the mint had signed for this seed, spent or not
    pub signed_outputs: usize,
    /// First counter after the highest used one
    pub next_counter: u32,
}

/// Ask the mint which deterministic outputs it signed and keep the unspent
/// ones that are not already in the ledger
pub(crate) async fn restore_from_seed(
    ctx: &WalletContext,
    state: &mut WalletState,
    mint_url: &str,
) -> CashuResult<RestoreReport> {
    let mint = ctx.mint(mint_url)?;
    let mint_url = mint.mint_url().to_string();
    let keyset = ctx.active_keyset(mint.as_ref()).await?;
    let batch_size = ctx.config.restore_batch_size;

    log::info!("Starting seed restore for keyset {} at {}", keyset.id, mint_url);

    let mut counter = 0u32;
    let mut empty_batches = 0;
    let mut next_counter = 0u32;
    let mut restored: Vec<Proof> = Vec::new();

    while empty_batches < ctx.config.restore_empty_batches {
        let seed = state.seed;
        let keyset_id = keyset.id.clone();
        let start = counter;
        let outputs = tokio::task::spawn_blocking(move || {
            deterministic_outputs(&seed, &keyset_id, start, &vec![1; batch_size as usize])
        })
        .await
        .map_err(|e| CashuWalletError::Internal(format!("derivation task failed: {}", e)))??;

        let by_blinded: HashMap<&str, (usize, &PreparedOutput)> = outputs
            .iter()
            .enumerate()
            .map(|(i, o)| (o.blinded.blinded_secret.as_str(), (i, o)))
            .collect();

        let response = mint
            .restore(RestoreRequest {
                outputs: outputs.iter().map(|o| o.blinded.clone()).collect(),
            })
            .await
            .map_err(|e| e.into_wallet_error(&mint_url))?;

        let mut matched = Vec::new();
        let mut signatures = Vec::new();
        for (output, signature) in response.outputs.iter().zip(response.signatures) {
            if let Some((index, prepared)) = by_blinded.get(output.blinded_secret.as_str()) {
                next_counter = next_counter.max(start + *index as u32 + 1);
                matched.push((*prepared).clone());
                signatures.push(signature);
            }
        }

        if matched.is_empty() {
            empty_batches += 1;
        } else {
            empty_batches = 0;
            restored.extend(unblind_outputs(&keyset, &matched, &signatures)?);
        }

        counter = counter
            .checked_add(batch_size)
            .ok_or_else(|| CashuWalletError::Internal("derivation counter overflow".to_string()))?;
    }

    let signed_outputs = restored.len();
    let unspent = match ctx.ledger.verify_proofs(mint.as_ref(), &restored).await {
        ProofVerification::Checked { unspent, .. } => unspent,
        ProofVerification::Unverified { reason } => {
            return Err(CashuWalletError::MintUnreachable {
                mint_url,
                message: reason,
            })
        }
    };

    let view = ctx.ledger.fetch_proofs(true).await?;
    let mut fresh: Vec<Proof> = unspent
        .into_iter()
        .filter(|p| !view.contains_secret(&p.secret))
        .collect();
    fresh.sort_by(|a, b| a.amount.cmp(&b.amount).then_with(|| a.secret.cmp(&b.secret)));

    let amount = total_amount(&fresh);
    if !fresh.is_empty() {
        ctx.ledger.publish_proofs(&fresh, &mint_url, &[]).await?;
    }

    let current = state.metadata.counters.get(&keyset.id).copied().unwrap_or(0);
    if next_counter > current {
        state.metadata.counters.insert(keyset.id.clone(), next_counter);
        persist_metadata(ctx, &state.metadata).await?;
    }

    log::info!(
        "Seed restore found {} signed outputs, restored {} sats",
        signed_outputs,
        amount
    );
    Ok(RestoreReport {
        keyset_id: keyset.id,
        restored: amount,
        signed_outputs,
        next_counter: next_counter.max(current),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::cashu::utils::ManualClock;
    use crate::stores::cashu_memory_db::MemoryLocalStore;
    use crate::test_utils::{TestWallet, TEST_MINT};

    fn safety_net() -> (MemoryLocalStore, SafetyNet) {
        let local = MemoryLocalStore::new();
        let net = SafetyNet::new(Arc::new(local.clone()), Arc::new(ManualClock::new(5)));
        (local, net)
    }

    #[tokio::test]
    async fn test_capture_list_remove() {
        let (_local, net) = safety_net();
        let wallet = TestWallet::new("alice").await;
        let proofs = wallet.mint.issue(&[2, 8]).await;

        let token = net.capture(&proofs, TEST_MINT, "store offline").await.unwrap();
        assert_eq!(token.amount_sats, 10);
        assert_eq!(decode_token(&token.encoded_token).unwrap().1, proofs);
        assert_eq!(net.list().await.unwrap(), vec![token.clone()]);

        net.remove(&token.id).await.unwrap();
        assert!(matches!(
            net.get(&token.id).await,
            Err(CashuWalletError::RecoveryTokenNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_capture_returns_token() {
        let (local, net) = safety_net();
        let wallet = TestWallet::new("alice").await;
        let proofs = wallet.mint.issue(&[4]).await;

        local.set_failing(true);
        match net.capture(&proofs, TEST_MINT, "store offline").await {
            Err(CashuWalletError::ValueAtRisk { token, .. }) => {
                assert_eq!(decode_token(&token).unwrap().1, proofs);
            }
            other => panic!("expected ValueAtRisk, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_republish_drops_spent_proofs() {
        let wallet = TestWallet::new("alice").await;
        let ctx = wallet.wallet.context();
        let proofs = wallet.mint.issue(&[1, 16]).await;
        let token = ctx.safety_net.capture(&proofs, TEST_MINT, "test").await.unwrap();
        wallet.mint.mark_spent(&proofs[0]);

        wallet.mint.set_unreachable(true);
        assert!(matches!(
            republish(&ctx, &token.id).await,
            Err(CashuWalletError::MintUnreachable { .. })
        ));
        assert_eq!(ctx.safety_net.list().await.unwrap().len(), 1);

        wallet.mint.set_unreachable(false);
        assert_eq!(republish(&ctx, &token.id).await.unwrap(), 16);
        assert!(ctx.safety_net.list().await.unwrap().is_empty());
        assert_eq!(ctx.ledger.fetch_proofs(true).await.unwrap().balance(), 16);
    }
}
