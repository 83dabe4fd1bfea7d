//! HTLC escrow
//!
//! Locks ride fares into hash/time-locked proofs (NUT-14), claims them with
//! the preimage and refunds them after the locktime. Escrows this wallet
//! created are kept in the local store until pruned.
//!
//! Every path that makes the mint consume proofs is journaled first and
//! records its outputs through the publish-or-capture step before the
//! journal entry is cleared.

use std::collections::{HashMap, HashSet};

use nostr::nips::nip60::TransactionDirection;
use serde::{Deserialize, Serialize};

use super::errors::{CashuResult, CashuWalletError};
use super::internal::{
    next_deterministic_outputs, record_outputs, select_verified, source_events, WalletContext,
    WalletState,
};
use super::spending_conditions::{
    build_witness, classify_proof, normalize_pubkey, preimage_matches, validate_payment_hash,
    ClassifiedProof, HtlcConditions,
};
use super::swap::{execute_swap, htlc_outputs, unblind_outputs, PreparedOutput};
use super::token::{decode_token, encode_token};
use super::types::{
    total_amount, HtlcStatus, Keyset, LockRequest, OperationKind, PendingHtlc, PendingOperation,
    Proof, PublishOutcome, Settlement,
};
use super::utils::split_amount;
use crate::crypto::secret_key_from_hex;
use crate::stores::local_store::{get_json, list_json, put_json};
use crate::stores::mint_client::{BlindSignature, MintClient, MintProofState, RestoreRequest};

const KEY_PREFIX: &str = "htlc:";

fn key_for(escrow_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, escrow_id)
}

/// x-only part of a compressed key, for comparing against lifted Nostr keys
fn x_only(key: &str) -> &str {
    key.get(2..).unwrap_or(key)
}

// =============================================================================
// Escrow Registry
// =============================================================================

pub(crate) async fn list_escrows(ctx: &WalletContext) -> CashuResult<Vec<PendingHtlc>> {
    let mut escrows: Vec<PendingHtlc> = list_json(ctx.local.as_ref(), KEY_PREFIX).await?;
    escrows.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.escrow_id.cmp(&b.escrow_id))
    });
    Ok(escrows)
}

pub(crate) async fn load_escrow(ctx: &WalletContext, escrow_id: &str) -> CashuResult<PendingHtlc> {
    get_json(ctx.local.as_ref(), &key_for(escrow_id))
        .await?
        .ok_or_else(|| CashuWalletError::HtlcNotFound {
            escrow_id: escrow_id.to_string(),
        })
}

async fn save_escrow(ctx: &WalletContext, htlc: &PendingHtlc) -> CashuResult<()> {
    put_json(ctx.local.as_ref(), &key_for(&htlc.escrow_id), htlc).await?;
    Ok(())
}

/// Move a locked escrow to a terminal state
async fn resolve(ctx: &WalletContext, htlc: &mut PendingHtlc, status: HtlcStatus) -> CashuResult<()> {
    htlc.status = status;
    htlc.resolved_at = Some(ctx.clock.now());
    save_escrow(ctx, htlc).await?;
    log::info!("Escrow {} is now {}", htlc.escrow_id, status);
    Ok(())
}

// =============================================================================
// Lock Intents
// =============================================================================

const INTENT_PREFIX: &str = "htlc_lock:";

fn intent_key(operation_id: &str) -> String {
    format!("{}{}", INTENT_PREFIX, operation_id)
}

/// One HTLC output of a lock swap; the blinding factor is hex
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IntentOutput {
    amount: u64,
    secret: String,
    blinding_factor: String,
}

/// HTLC outputs of an in-flight lock, written before the swap is sent
///
/// Escrow secrets are random, so a lost swap response can only be rebuilt
/// from this record and the mint's stored signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockIntent {
    operation_id: String,
    keyset: Keyset,
    outputs: Vec<IntentOutput>,
    /// Saved as-is once the token is known
    escrow: PendingHtlc,
}

impl LockIntent {
    fn prepared_outputs(&self) -> CashuResult<Vec<PreparedOutput>> {
        self.outputs
            .iter()
            .map(|o| {
                let blinding_factor = secret_key_from_hex(&o.blinding_factor)?;
                PreparedOutput::new(&self.keyset.id, o.amount, o.secret.clone(), blinding_factor)
            })
            .collect()
    }
}

async fn forget_intent(ctx: &WalletContext, operation_id: &str) {
    if let Err(e) = ctx.local.delete(&intent_key(operation_id)).await {
        log::warn!("Failed to clear lock intent {}: {}", operation_id, e);
    }
}

/// Rebuild escrows whose lock swap took effect at the mint but whose
/// response never arrived
///
/// Intents for `recovered` operations are re-signed through the mint's
/// restore endpoint. Intents whose operation left the journal without being
/// recovered belong to locks that never happened and are dropped.
pub(crate) async fn recover_lost_locks(
    ctx: &WalletContext,
    recovered: &[PendingOperation],
) -> CashuResult<Vec<PendingHtlc>> {
    let intents: Vec<LockIntent> = list_json(ctx.local.as_ref(), INTENT_PREFIX).await?;
    if intents.is_empty() {
        return Ok(Vec::new());
    }
    let journaled: HashSet<String> = ctx.journal.list().await?.into_iter().map(|o| o.id).collect();

    let mut escrows = Vec::new();
    for intent in intents {
        if recovered.iter().any(|op| op.id == intent.operation_id) {
            match restore_lock(ctx, &intent).await {
                Ok(htlc) => escrows.push(htlc),
                Err(e) => log::warn!(
                    "Could not rebuild escrow {} from operation {}: {}",
                    intent.escrow.escrow_id,
                    intent.operation_id,
                    e
                ),
            }
        } else if !journaled.contains(&intent.operation_id) {
            log::debug!("Dropping lock intent {}, its swap never took effect", intent.operation_id);
            forget_intent(ctx, &intent.operation_id).await;
        }
    }
    Ok(escrows)
}

async fn restore_lock(ctx: &WalletContext, intent: &LockIntent) -> CashuResult<PendingHtlc> {
    let mint = ctx.mint(&intent.escrow.mint_url)?;
    let mint_url = mint.mint_url().to_string();
    let outputs = intent.prepared_outputs()?;

    let response = mint
        .restore(RestoreRequest {
            outputs: outputs.iter().map(|o| o.blinded.clone()).collect(),
        })
        .await
        .map_err(|e| e.into_wallet_error(&mint_url))?;

    let mut by_blinded: HashMap<String, BlindSignature> = response
        .outputs
        .into_iter()
        .map(|o| o.blinded_secret)
        .zip(response.signatures)
        .collect();
    let signatures: Vec<BlindSignature> = outputs
        .iter()
        .filter_map(|o| by_blinded.remove(&o.blinded.blinded_secret))
        .collect();
    if signatures.len() != outputs.len() {
        return Err(CashuWalletError::Internal(format!(
            "mint holds signatures for {} of {} escrow outputs",
            signatures.len(),
            outputs.len()
        )));
    }

    let locked = unblind_outputs(&intent.keyset, &outputs, &signatures)?;
    let mut htlc = intent.escrow.clone();
    htlc.htlc_token = encode_token(&mint_url, &locked, htlc.ride_ref.clone())?;
    htlc.amount_sats = total_amount(&locked);
    save_escrow(ctx, &htlc).await?;
    forget_intent(ctx, &intent.operation_id).await;

    log::warn!(
        "Rebuilt escrow {} ({} sats) from interrupted operation {}",
        htlc.escrow_id,
        htlc.amount_sats,
        intent.operation_id
    );
    Ok(htlc)
}

// =============================================================================
// Lock
// =============================================================================

/// Lock `request.amount_sats` into an HTLC token for the counterparty
///
/// A swap rejected because a selected proof was already spent triggers one
/// cleanup of spent proofs and a second attempt.
pub(crate) async fn lock(
    ctx: &WalletContext,
    state: &mut WalletState,
    request: LockRequest,
) -> CashuResult<PendingHtlc> {
    if request.amount_sats == 0 {
        return Err(CashuWalletError::InvalidAmount(
            "escrow amount must be greater than zero".to_string(),
        ));
    }
    let payment_hash = validate_payment_hash(&request.payment_hash)?;
    let counterparty = normalize_pubkey(&request.counterparty_key)?;
    let now = ctx.clock.now();
    if request.expiry <= now {
        return Err(CashuWalletError::InvalidSecret(format!(
            "locktime {} is not in the future (now {})",
            request.expiry, now
        )));
    }

    let mint = ctx.mint(state.mint_url())?;

    match try_lock(ctx, state, mint.as_ref(), &request, &payment_hash, &counterparty).await {
        Err(e) if e.is_token_spent() => {
            log::warn!("Escrow swap hit a spent proof, cleaning up and retrying once: {}", e);
            let view = ctx.ledger.fetch_proofs(true).await?;
            let proofs: Vec<Proof> = view
                .proofs_for_mint(mint.mint_url())
                .into_iter()
                .map(|p| p.proof)
                .collect();
            let spent: HashSet<String> = ctx
                .ledger
                .verify_proofs(mint.as_ref(), &proofs)
                .await
                .spent()
                .iter()
                .map(|p| p.secret.clone())
                .collect();
            ctx.ledger.remove_spent(&spent).await?;
            try_lock(ctx, state, mint.as_ref(), &request, &payment_hash, &counterparty).await
        }
        other => other,
    }
}

async fn try_lock(
    ctx: &WalletContext,
    state: &mut WalletState,
    mint: &dyn MintClient,
    request: &LockRequest,
    payment_hash: &str,
    counterparty: &str,
) -> CashuResult<PendingHtlc> {
    let mint_url = mint.mint_url().to_string();
    let amount = request.amount_sats;

    let (selection, view) = select_verified(ctx, mint, amount).await?;
    let inputs: Vec<Proof> = selection.proofs.iter().map(|p| p.proof.clone()).collect();
    let input_secrets: Vec<String> = inputs.iter().map(|p| p.secret.clone()).collect();
    let sources = source_events(&selection);
    let consumed: HashSet<String> = input_secrets.iter().cloned().collect();
    let migrated = view.unconsumed_proofs(&sources, &consumed);

    let keyset = ctx.active_keyset(mint).await?;
    let locker = state.wallet_pubkey();
    let locked_outputs = htlc_outputs(
        &keyset.id,
        &split_amount(amount),
        payment_hash,
        request.expiry,
        &[locker.clone()],
        &[counterparty.to_string()],
    )?;
    let change_outputs =
        next_deterministic_outputs(ctx, state, &keyset.id, &split_amount(selection.change)).await?;
    let mut outputs = locked_outputs.clone();
    outputs.extend(change_outputs);

    let operation = ctx
        .journal
        .begin(OperationKind::Swap, input_secrets.clone(), None, &mint_url)
        .await?;

    let intent = LockIntent {
        operation_id: operation.id.clone(),
        keyset: keyset.clone(),
        outputs: locked_outputs
            .iter()
            .map(|o| IntentOutput {
                amount: o.amount,
                secret: o.secret.clone(),
                blinding_factor: hex::encode(o.blinding_factor.secret_bytes()),
            })
            .collect(),
        escrow: PendingHtlc {
            escrow_id: uuid::Uuid::new_v4().to_string(),
            htlc_token: String::new(),
            amount_sats: amount,
            locktime: request.expiry,
            locker_pubkey: locker,
            counterparty_pubkey: counterparty.to_string(),
            payment_hash: payment_hash.to_string(),
            mint_url: mint_url.clone(),
            status: HtlcStatus::Locked,
            ride_ref: request.ride_ref.clone(),
            created_at: ctx.clock.now(),
            resolved_at: None,
        },
    };
    if let Err(e) = put_json(ctx.local.as_ref(), &intent_key(&operation.id), &intent).await {
        ctx.journal.complete(&operation.id).await;
        return Err(e.into());
    }

    log::info!(
        "Locking {} sats for {} (locktime {}), {} sats change",
        amount,
        counterparty,
        request.expiry,
        selection.change
    );

    let mut proofs = match execute_swap(mint, &keyset, inputs, &outputs).await {
        Ok(proofs) => proofs,
        Err(e) => {
            ctx.forget_rejected_keyset(&mint_url, &e);
            // Unreachable means the mint may have swapped; the journal entry and intent stay for the scan
            if !e.is_connection_error() {
                forget_intent(ctx, &operation.id).await;
                ctx.journal.complete(&operation.id).await;
            }
            return Err(e);
        }
    };
    ctx.ledger.record_spent(input_secrets.iter());

    let change = proofs.split_off(locked_outputs.len());
    let locked = proofs;
    state.check_amount("escrow lock", amount, total_amount(&locked));

    let outcome = record_outputs(ctx, &change, &migrated, &mint_url, &sources, "escrow change").await?;

    let mut htlc = intent.escrow;
    htlc.htlc_token = encode_token(&mint_url, &locked, request.ride_ref.clone())?;
    htlc.amount_sats = total_amount(&locked);
    if let Err(e) = save_escrow(ctx, &htlc).await {
        log::error!("Escrow {} could not be saved: {}", htlc.escrow_id, e);
        return Err(CashuWalletError::ValueAtRisk {
            token: htlc.htlc_token,
            reason: e.to_string(),
        });
    }
    forget_intent(ctx, &operation.id).await;
    ctx.journal.complete(&operation.id).await;

    let created: Vec<String> = match outcome {
        Some(PublishOutcome::Published { event_id }) => vec![event_id],
        _ => vec![],
    };
    ctx.ledger
        .record_history(TransactionDirection::Out, amount, &created, &sources)
        .await;

    Ok(htlc)
}

// =============================================================================
// Claim
// =============================================================================

/// HTLC proofs of a token, all locked to the same payment hash
fn parse_htlc_token(htlc_token: &str) -> CashuResult<(String, Vec<(Proof, HtlcConditions)>)> {
    let (mint_url, proofs) = decode_token(htlc_token)?;
    if proofs.is_empty() {
        return Err(CashuWalletError::InvalidToken {
            reason: "token holds no proofs".to_string(),
        });
    }

    let mut locked = Vec::with_capacity(proofs.len());
    for proof in &proofs {
        match classify_proof(proof) {
            Ok(ClassifiedProof::Htlc { proof, conditions }) => locked.push((proof, conditions)),
            Ok(ClassifiedProof::Plain(_)) => {
                return Err(CashuWalletError::InvalidToken {
                    reason: "token holds proofs without HTLC conditions".to_string(),
                })
            }
            Err(e) => {
                return Err(CashuWalletError::InvalidToken {
                    reason: e.to_string(),
                })
            }
        }
    }

    let hash = &locked[0].1.payment_hash;
    if locked.iter().any(|(_, c)| &c.payment_hash != hash) {
        return Err(CashuWalletError::InvalidToken {
            reason: "proofs are locked to different payment hashes".to_string(),
        });
    }
    Ok((mint_url, locked))
}

/// Claim an HTLC token with its preimage into this wallet's ledger
pub(crate) async fn claim(
    ctx: &WalletContext,
    state: &mut WalletState,
    htlc_token: &str,
    preimage: &str,
) -> CashuResult<Settlement> {
    let (mint_url, locked) = parse_htlc_token(htlc_token)?;
    if !preimage_matches(preimage, &locked[0].1.payment_hash) {
        return Err(CashuWalletError::InvalidPreimage);
    }

    let own_key = state.wallet_pubkey();
    let mut inputs = Vec::with_capacity(locked.len());
    for (proof, conditions) in locked {
        if !conditions.pubkeys.is_empty()
            && !conditions.pubkeys.iter().any(|k| x_only(k) == x_only(&own_key))
        {
            return Err(CashuWalletError::SigningFailed(
                "wallet key is not among the HTLC claimants".to_string(),
            ));
        }
        let witness = build_witness(&proof.secret, Some(preimage), &state.wallet_key)
            .map_err(|e| CashuWalletError::SigningFailed(e.to_string()))?;
        inputs.push(Proof {
            witness: Some(witness),
            ..proof
        });
    }

    let settlement = redeem(ctx, state, &mint_url, inputs, "escrow claim", None).await?;
    log::info!("Claimed {} sats from escrow", settlement.amount);
    Ok(settlement)
}

/// Swap witnessed inputs into fresh deterministic proofs and record them
pub(crate) async fn redeem(
    ctx: &WalletContext,
    state: &mut WalletState,
    mint_url: &str,
    inputs: Vec<Proof>,
    context: &str,
    escrow_id: Option<String>,
) -> CashuResult<Settlement> {
    let mint = ctx.mint(mint_url)?;
    let mint_url = mint.mint_url().to_string();
    let keyset = ctx.active_keyset(mint.as_ref()).await?;
    let amount = total_amount(&inputs);
    let outputs = next_deterministic_outputs(ctx, state, &keyset.id, &split_amount(amount)).await?;
    let input_secrets: Vec<String> = inputs.iter().map(|p| p.secret.clone()).collect();

    let operation = ctx
        .journal
        .begin(OperationKind::Swap, input_secrets.clone(), None, &mint_url)
        .await?;

    let proofs = match execute_swap(mint.as_ref(), &keyset, inputs, &outputs).await {
        Ok(proofs) => proofs,
        Err(e) => {
            ctx.forget_rejected_keyset(&mint_url, &e);
            if !e.is_connection_error() {
                ctx.journal.complete(&operation.id).await;
            }
            return Err(e);
        }
    };
    let received = total_amount(&proofs);
    state.check_amount(context, amount, received);

    let outcome = record_outputs(ctx, &proofs, &[], &mint_url, &[], context)
        .await?
        .ok_or_else(|| CashuWalletError::Internal("no outputs to record".to_string()))?;
    ctx.journal.complete(&operation.id).await;

    if let PublishOutcome::Published { event_id } = &outcome {
        ctx.ledger
            .record_history(TransactionDirection::In, received, &[event_id.clone()], &[])
            .await;
    }

    Ok(Settlement {
        amount: received,
        escrow_id,
        outcome,
    })
}

// =============================================================================
// Refund
// =============================================================================

/// Reclaim a locked escrow after its locktime
pub(crate) async fn refund(
    ctx: &WalletContext,
    state: &mut WalletState,
    escrow_id: &str,
) -> CashuResult<Settlement> {
    let mut htlc = load_escrow(ctx, escrow_id).await?;
    if htlc.status.is_terminal() {
        return Err(CashuWalletError::HtlcAlreadyResolved {
            escrow_id: escrow_id.to_string(),
            status: htlc.status.to_string(),
        });
    }
    let now = ctx.clock.now();
    if now < htlc.locktime {
        return Err(CashuWalletError::RefundNotYetAllowed {
            locktime: htlc.locktime,
            now,
        });
    }

    let (mint_url, locked) = parse_htlc_token(&htlc.htlc_token)?;
    let mut inputs = Vec::with_capacity(locked.len());
    for (proof, _) in locked {
        let witness = build_witness(&proof.secret, None, &state.wallet_key)
            .map_err(|e| CashuWalletError::SigningFailed(e.to_string()))?;
        inputs.push(Proof {
            witness: Some(witness),
            ..proof
        });
    }

    match redeem(ctx, state, &mint_url, inputs, "escrow refund", Some(htlc.escrow_id.clone())).await {
        Ok(settlement) => {
            resolve(ctx, &mut htlc, HtlcStatus::Refunded).await?;
            Ok(settlement)
        }
        Err(e) if e.is_token_spent() => {
            log::info!("Escrow {} was claimed before the refund", escrow_id);
            resolve(ctx, &mut htlc, HtlcStatus::Claimed).await?;
            Err(CashuWalletError::HtlcAlreadyResolved {
                escrow_id: escrow_id.to_string(),
                status: HtlcStatus::Claimed.to_string(),
            })
        }
        Err(e @ CashuWalletError::MintRejected { .. }) if !e.is_retryable() => {
            log::error!("Refund of escrow {} rejected: {}", escrow_id, e);
            resolve(ctx, &mut htlc, HtlcStatus::Failed).await?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Locked escrows whose locktime has passed at `now`
pub(crate) async fn refundable(ctx: &WalletContext, now: u64) -> CashuResult<Vec<PendingHtlc>> {
    Ok(list_escrows(ctx)
        .await?
        .into_iter()
        .filter(|h| h.status == HtlcStatus::Locked && now >= h.locktime)
        .collect())
}

/// Refund every expired escrow, logging the ones that fail
pub(crate) async fn sweep_expired_refunds(
    ctx: &WalletContext,
    state: &mut WalletState,
) -> CashuResult<Vec<Settlement>> {
    let expired = refundable(ctx, ctx.clock.now()).await?;
    let mut settled = Vec::new();
    for htlc in expired {
        match refund(ctx, state, &htlc.escrow_id).await {
            Ok(settlement) => settled.push(settlement),
            Err(e) => log::warn!("Refund sweep skipped escrow {}: {}", htlc.escrow_id, e),
        }
    }
    if !settled.is_empty() {
        log::info!("Refund sweep reclaimed {} escrows", settled.len());
    }
    Ok(settled)
}

// =============================================================================
// Maintenance
// =============================================================================

/// Mark locked escrows whose proofs the mint reports spent as claimed
pub(crate) async fn sync_htlc_states(ctx: &WalletContext) -> CashuResult<usize> {
    let mut claimed = 0;
    for mut htlc in list_escrows(ctx).await? {
        if htlc.status != HtlcStatus::Locked {
            continue;
        }
        let Ok((mint_url, locked)) = parse_htlc_token(&htlc.htlc_token) else {
            log::warn!("Escrow {} holds an unreadable token", htlc.escrow_id);
            continue;
        };
        let mint = ctx.mint(&mint_url)?;

        let mut ys = Vec::with_capacity(locked.len());
        for (proof, _) in &locked {
            ys.push(proof.y()?);
        }
        let states = match mint.check_state(ys).await {
            Ok(states) => states,
            Err(e) => {
                log::warn!("Could not check escrow {}: {}", htlc.escrow_id, e);
                continue;
            }
        };

        if !states.is_empty() && states.iter().all(|s| s.state == MintProofState::Spent) {
            resolve(ctx, &mut htlc, HtlcStatus::Claimed).await?;
            claimed += 1;
        }
    }
    Ok(claimed)
}

/// Drop resolved escrows older than the audit window
pub(crate) async fn prune_resolved(ctx: &WalletContext, now: u64) -> CashuResult<usize> {
    let window = ctx.config.htlc_audit_window_secs;
    let mut pruned = 0;
    for htlc in list_escrows(ctx).await? {
        let expired = htlc
            .resolved_at
            .map(|at| now.saturating_sub(at) > window)
            .unwrap_or(false);
        if htlc.status.is_terminal() && expired {
            ctx.local.delete(&key_for(&htlc.escrow_id)).await?;
            pruned += 1;
        }
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::cashu::types::HtlcStatus;
    use crate::stores::local_store::LocalStore;
    use crate::test_utils::{preimage_pair, TestWallet, TEST_MINT};

    const HOUR: u64 = 3600;

    async fn locked_escrow(rider: &TestWallet, driver: &TestWallet, hash: &str) -> PendingHtlc {
        rider.fund(&[64]).await;
        rider
            .wallet
            .lock_htlc(LockRequest {
                amount_sats: 50,
                payment_hash: hash.to_string(),
                counterparty_key: driver.wallet.pubkey().await,
                expiry: rider.clock_now() + HOUR,
                ride_ref: Some("ride-1".into()),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lock_and_claim_happy_path() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (preimage, hash) = preimage_pair();

        let htlc = locked_escrow(&rider, &driver, &hash).await;
        assert_eq!(htlc.amount_sats, 50);
        assert_eq!(htlc.status, HtlcStatus::Locked);
        assert_eq!(htlc.payment_hash, hash);

        // 64 funded, 50 locked, 14 change published back
        let balance = rider.wallet.sync().await.unwrap().balance;
        assert_eq!(balance.available, 14);
        assert_eq!(balance.pending, 50);

        let settlement = driver.wallet.claim_htlc(&htlc.htlc_token, &preimage).await.unwrap();
        assert_eq!(settlement.amount, 50);
        assert!(matches!(settlement.outcome, PublishOutcome::Published { .. }));
        assert_eq!(driver.wallet.sync().await.unwrap().balance.available, 50);

        // The rider sees the escrow claimed
        let result = rider.wallet.sync().await.unwrap();
        assert_eq!(result.htlcs_claimed, 1);
        assert_eq!(result.balance.pending, 0);
    }

    #[tokio::test]
    async fn test_wrong_preimage_fails_without_network() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (_preimage, hash) = preimage_pair();
        let htlc = locked_escrow(&rider, &driver, &hash).await;

        let swaps = rider.mint.swap_count();
        rider.mint.set_unreachable(true);
        driver.store.set_unreachable(true);
        let result = driver.wallet.claim_htlc(&htlc.htlc_token, &"00".repeat(32)).await;
        assert!(matches!(result, Err(CashuWalletError::InvalidPreimage)));
        assert_eq!(rider.mint.swap_count(), swaps);

        driver.store.set_unreachable(false);
        rider.mint.set_unreachable(false);
        assert_eq!(driver.wallet.sync().await.unwrap().balance.available, 0);
    }

    #[tokio::test]
    async fn test_claim_rejects_malformed_tokens() {
        let rider = TestWallet::new("rider").await;
        let (preimage, _hash) = preimage_pair();

        assert!(matches!(
            rider.wallet.claim_htlc("cashuAnot-a-token", &preimage).await,
            Err(CashuWalletError::InvalidToken { .. })
        ));

        let plain = rider.mint.issue(&[8]).await;
        let token = encode_token(TEST_MINT, &plain, None).unwrap();
        assert!(matches!(
            rider.wallet.claim_htlc(&token, &preimage).await,
            Err(CashuWalletError::InvalidToken { .. })
        ));
    }

    #[tokio::test]
    async fn test_claim_after_failed_swap_is_retried() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (preimage, hash) = preimage_pair();
        let htlc = locked_escrow(&rider, &driver, &hash).await;

        driver.mint.fail_next_swaps(1);
        assert!(matches!(
            driver.wallet.claim_htlc(&htlc.htlc_token, &preimage).await,
            Err(CashuWalletError::MintUnreachable { .. })
        ));
        assert_eq!(driver.wallet.pending_operations().await.unwrap().len(), 1);

        // The inputs are still unspent, so the scan drops the entry
        let report = driver.wallet.connect().await.unwrap();
        assert_eq!(report.recovery.failed.len(), 1);
        assert!(driver.wallet.pending_operations().await.unwrap().is_empty());

        let settlement = driver.wallet.claim_htlc(&htlc.htlc_token, &preimage).await.unwrap();
        assert_eq!(settlement.amount, 50);
    }

    #[tokio::test]
    async fn test_lost_lock_response_is_restored_from_seed() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (preimage, hash) = preimage_pair();
        let funded = rider.fund(&[64]).await;

        rider.mint.drop_next_swap_responses(1);
        let result = rider
            .wallet
            .lock_htlc(LockRequest {
                amount_sats: 50,
                payment_hash: hash.clone(),
                counterparty_key: driver.wallet.pubkey().await,
                expiry: rider.clock_now() + HOUR,
                ride_ref: Some("ride-7".into()),
            })
            .await;
        assert!(matches!(result, Err(CashuWalletError::MintUnreachable { .. })));
        assert!(rider.mint.is_spent(&funded[0]));
        assert!(rider.wallet.escrows().await.unwrap().is_empty());

        let report = rider.wallet.connect().await.unwrap();
        assert_eq!(report.recovery.recovered.len(), 1);
        assert_eq!(report.sync.balance.available, 0);

        // The 50 locked sats come back from the saved HTLC outputs
        assert_eq!(report.recovered_escrows.len(), 1);
        let escrow = &report.recovered_escrows[0];
        assert_eq!(escrow.amount_sats, 50);
        assert_eq!(escrow.status, HtlcStatus::Locked);
        assert_eq!(escrow.payment_hash, hash);
        assert_eq!(escrow.ride_ref.as_deref(), Some("ride-7"));
        assert_eq!(rider.wallet.escrows().await.unwrap(), vec![escrow.clone()]);

        // A second connect finds nothing left to rebuild
        let again = rider.wallet.connect().await.unwrap();
        assert!(again.recovered_escrows.is_empty());

        // The 14 sats of change were deterministic outputs
        let restored = rider.wallet.restore_from_seed(TEST_MINT).await.unwrap();
        assert_eq!(restored.restored, 14);
        assert_eq!(rider.wallet.sync().await.unwrap().balance.available, 14);

        let settlement = driver.wallet.claim_htlc(&escrow.htlc_token, &preimage).await.unwrap();
        assert_eq!(settlement.amount, 50);
    }

    #[tokio::test]
    async fn test_failed_locks_leave_no_intent() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (_preimage, hash) = preimage_pair();
        let funded = rider.fund(&[64]).await;
        let request = LockRequest {
            amount_sats: 50,
            payment_hash: hash,
            counterparty_key: driver.wallet.pubkey().await,
            expiry: rider.clock_now() + HOUR,
            ride_ref: None,
        };

        // Swap never reached the mint: the intent waits for the journal scan
        rider.mint.fail_next_swaps(1);
        let result = rider.wallet.lock_htlc(request.clone()).await;
        assert!(matches!(result, Err(CashuWalletError::MintUnreachable { .. })));
        assert_eq!(rider.local.list(INTENT_PREFIX).await.unwrap().len(), 1);

        let report = rider.wallet.connect().await.unwrap();
        assert_eq!(report.recovery.failed.len(), 1);
        assert!(report.recovered_escrows.is_empty());
        assert!(rider.local.list(INTENT_PREFIX).await.unwrap().is_empty());
        assert_eq!(report.sync.balance.available, 64);

        // Mint rejects the lock outright on both attempts
        rider.mint.mark_spent_on_next_swap(&funded[0]);
        assert!(rider.wallet.lock_htlc(request).await.is_err());
        assert!(rider.local.list(INTENT_PREFIX).await.unwrap().is_empty());
        assert!(rider.wallet.escrows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_by_other_key_fails_to_sign() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let stranger = rider.sibling("stranger").await;
        let (preimage, hash) = preimage_pair();
        let htlc = locked_escrow(&rider, &driver, &hash).await;

        assert!(matches!(
            stranger.wallet.claim_htlc(&htlc.htlc_token, &preimage).await,
            Err(CashuWalletError::SigningFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_refund_timing() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (_preimage, hash) = preimage_pair();
        let htlc = locked_escrow(&rider, &driver, &hash).await;

        assert!(matches!(
            rider.wallet.refund_htlc(&htlc.escrow_id).await,
            Err(CashuWalletError::RefundNotYetAllowed { .. })
        ));

        rider.clock.advance(HOUR);
        let settlement = rider.wallet.refund_htlc(&htlc.escrow_id).await.unwrap();
        assert_eq!(settlement.amount, 50);
        assert_eq!(settlement.escrow_id.as_deref(), Some(htlc.escrow_id.as_str()));

        assert!(matches!(
            rider.wallet.refund_htlc(&htlc.escrow_id).await,
            Err(CashuWalletError::HtlcAlreadyResolved { .. })
        ));
        assert_eq!(rider.wallet.sync().await.unwrap().balance.available, 64);
        assert!(matches!(
            rider.wallet.refund_htlc("missing").await,
            Err(CashuWalletError::HtlcNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_refund_after_claim_marks_claimed() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (preimage, hash) = preimage_pair();
        let htlc = locked_escrow(&rider, &driver, &hash).await;

        driver.wallet.claim_htlc(&htlc.htlc_token, &preimage).await.unwrap();
        rider.clock.advance(HOUR);

        assert!(matches!(
            rider.wallet.refund_htlc(&htlc.escrow_id).await,
            Err(CashuWalletError::HtlcAlreadyResolved { .. })
        ));
        let ctx = rider.wallet.context();
        assert_eq!(load_escrow(&ctx, &htlc.escrow_id).await.unwrap().status, HtlcStatus::Claimed);
        assert!(ctx.journal.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_refunds_expired_escrows() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (_preimage, hash) = preimage_pair();
        locked_escrow(&rider, &driver, &hash).await;

        assert!(rider.wallet.sweep_expired_refunds().await.unwrap().is_empty());
        rider.clock.advance(HOUR + 1);
        let settled = rider.wallet.sweep_expired_refunds().await.unwrap();
        assert_eq!(settled.len(), 1);

        let ctx = rider.wallet.context();
        assert!(refundable(&ctx, rider.clock_now()).await.unwrap().is_empty());

        // Resolved escrows are pruned after the audit window
        let later = rider.clock_now() + ctx.config.htlc_audit_window_secs + 1;
        assert_eq!(prune_resolved(&ctx, later).await.unwrap(), 1);
        assert!(list_escrows(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_retries_after_spent_rejection() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (_preimage, hash) = preimage_pair();
        let proofs = rider.fund(&[32, 64]).await;

        // Spent after verification but before the swap: the swap is rejected
        rider.mint.mark_spent_on_next_swap(&proofs[0]);
        let htlc = rider
            .wallet
            .lock_htlc(LockRequest {
                amount_sats: 20,
                payment_hash: hash,
                counterparty_key: driver.wallet.pubkey().await,
                expiry: rider.clock_now() + HOUR,
                ride_ref: None,
            })
            .await
            .unwrap();
        assert_eq!(htlc.amount_sats, 20);
        assert_eq!(rider.wallet.sync().await.unwrap().balance.available, 44);
    }

    #[tokio::test]
    async fn test_lock_skips_pending_proofs() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (_preimage, hash) = preimage_pair();
        let proofs = rider.fund(&[1, 64]).await;
        rider.mint.mark_pending(&proofs[0]);

        let htlc = rider
            .wallet
            .lock_htlc(LockRequest {
                amount_sats: 20,
                payment_hash: hash,
                counterparty_key: driver.wallet.pubkey().await,
                expiry: rider.clock_now() + HOUR,
                ride_ref: None,
            })
            .await
            .unwrap();
        assert_eq!(htlc.amount_sats, 20);
        assert!(!rider.mint.is_spent(&proofs[0]));

        // 44 change plus the pending proof, which stays in the ledger
        assert_eq!(rider.wallet.sync().await.unwrap().balance.available, 45);
    }

    #[tokio::test]
    async fn test_lock_input_validation() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (_preimage, hash) = preimage_pair();
        rider.fund(&[8]).await;
        let request = LockRequest {
            amount_sats: 16,
            payment_hash: hash.clone(),
            counterparty_key: driver.wallet.pubkey().await,
            expiry: rider.clock_now() + HOUR,
            ride_ref: None,
        };

        assert!(matches!(
            rider.wallet.lock_htlc(request.clone()).await,
            Err(CashuWalletError::InsufficientFunds { available: 8, required: 16 })
        ));
        assert!(matches!(
            rider.wallet.lock_htlc(LockRequest { amount_sats: 0, ..request.clone() }).await,
            Err(CashuWalletError::InvalidAmount(_))
        ));
        assert!(matches!(
            rider
                .wallet
                .lock_htlc(LockRequest { payment_hash: "zz".into(), ..request.clone() })
                .await,
            Err(CashuWalletError::InvalidSecret(_))
        ));
        assert!(matches!(
            rider
                .wallet
                .lock_htlc(LockRequest { counterparty_key: "nope".into(), ..request })
                .await,
            Err(CashuWalletError::InvalidPubkey(_))
        ));
    }
}
