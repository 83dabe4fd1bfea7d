//! Internal helper functions for cashu wallet operations
//!
//! These are shared by multiple cashu submodules but not exported publicly.
//! The module provides:
//! - The wallet context and the mutex-guarded wallet state
//! - Derivation counter reservation
//! - Verified proof selection with spent-proof cleanup
//! - Recording operation outputs (publish, else capture)
//! - Cancellation shielding for post-swap steps

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use secp256k1::{PublicKey, SecretKey, SECP256K1};
use tokio::sync::watch;

use super::cache::KeysetCache;
use super::config::WalletConfig;
use super::errors::{CashuResult, CashuWalletError};
use super::htlc;
use super::proof_recovery::OperationJournal;
use super::proofs::{LedgerView, ProofLedger, ProofVerification};
use super::recovery::SafetyNet;
use super::swap::{deterministic_outputs, PreparedOutput};
use super::types::{
    BalanceVerification, ConsistencyHazard, HtlcStatus, Keyset, Proof, ProofSelection,
    PublishOutcome, WalletBalances, WalletDiagnostics, WalletMetadata,
};
use super::utils::Clock;
use crate::stores::local_store::{get_json, put_json, LocalStore};
use crate::stores::mint_client::{MintClient, MintRegistry};

/// Local copy of the wallet record tags
pub(crate) const METADATA_KEY: &str = "wallet:metadata";

/// Selection passes before giving up on a ledger that keeps yielding spent proofs
const MAX_SELECTION_PASSES: usize = 3;

// =============================================================================
// Context and State
// =============================================================================

/// Collaborators shared by every wallet operation
pub(crate) struct WalletContext {
    pub ledger: ProofLedger,
    pub mints: MintRegistry,
    pub keysets: KeysetCache,
    pub journal: OperationJournal,
    pub safety_net: SafetyNet,
    pub local: Arc<dyn LocalStore>,
    pub clock: Arc<dyn Clock>,
    pub config: WalletConfig,
    pub snapshot: watch::Sender<WalletDiagnostics>,
}

/// Everything a mutation may change, owned by the wallet mutex
pub(crate) struct WalletState {
    pub metadata: WalletMetadata,
    pub wallet_key: SecretKey,
    pub seed: [u8; 64],
    pub hazards: Vec<ConsistencyHazard>,
    pub balance: WalletBalances,
    pub last_sync: Option<u64>,
}

impl WalletState {
    /// Compressed hex public key of the wallet key
    pub fn wallet_pubkey(&self) -> String {
        PublicKey::from_secret_key(SECP256K1, &self.wallet_key).to_string()
    }

    pub fn mint_url(&self) -> &str {
        &self.metadata.mint_url
    }

    pub fn flag(&mut self, hazard: ConsistencyHazard) {
        if !self.hazards.contains(&hazard) {
            self.hazards.push(hazard);
        }
    }

    /// Proceed on a total mismatch, but leave a hazard behind
    pub fn check_amount(&mut self, context: &str, expected: u64, actual: u64) {
        if expected != actual {
            log::warn!(
                "{}: expected {} sats but got {}, proceeding",
                context,
                expected,
                actual
            );
            self.flag(ConsistencyHazard::AmountMismatch {
                context: context.to_string(),
                expected,
                actual,
            });
        }
    }
}

impl WalletContext {
    pub fn mint(&self, mint_url: &str) -> CashuResult<Arc<dyn MintClient>> {
        self.mints.get(mint_url)
    }

    pub async fn active_keyset(&self, mint: &dyn MintClient) -> CashuResult<Keyset> {
        self.keysets.active_keyset(mint, &self.config.unit).await
    }

    /// Drop the cached keyset when the mint refused it
    pub fn forget_rejected_keyset(&self, mint_url: &str, error: &CashuWalletError) {
        if error.is_keyset_error() {
            log::info!("Mint {} refused the cached keyset, refetching on next use", mint_url);
            self.keysets.invalidate(mint_url);
        }
    }
}

// =============================================================================
// Metadata and Counters
// =============================================================================

pub(crate) async fn load_local_metadata(local: &dyn LocalStore) -> CashuResult<Option<WalletMetadata>> {
    let tags: Option<Vec<Vec<String>>> = get_json(local, METADATA_KEY).await?;
    tags.map(|tags| WalletMetadata::from_tags(&tags)).transpose()
}

/// Persist metadata locally (required) and to the store (best effort)
pub(crate) async fn persist_metadata(ctx: &WalletContext, metadata: &WalletMetadata) -> CashuResult<()> {
    put_json(ctx.local.as_ref(), METADATA_KEY, &metadata.to_tags()).await?;
    if let Err(e) = ctx.ledger.save_wallet_record(metadata).await {
        log::warn!("Wallet record not published, kept locally: {}", e);
    }
    Ok(())
}

/// Reserve `count` derivation slots and persist the advanced counter
///
/// Returns the first reserved counter. The counter is durable before any
/// output using it reaches the mint, so a crash can only skip slots.
pub(crate) async fn reserve_counters(
    ctx: &WalletContext,
    state: &mut WalletState,
    keyset_id: &str,
    count: usize,
) -> CashuResult<u32> {
    let start = state.metadata.counters.get(keyset_id).copied().unwrap_or(0);
    if count == 0 {
        return Ok(start);
    }
    let next = u32::try_from(count)
        .ok()
        .and_then(|count| start.checked_add(count))
        .ok_or_else(|| CashuWalletError::Internal("derivation counter overflow".to_string()))?;

    state.metadata.counters.insert(keyset_id.to_string(), next);
    persist_metadata(ctx, &state.metadata).await?;
    Ok(start)
}

/// Deterministic outputs for `amounts` on freshly reserved counters
pub(crate) async fn next_deterministic_outputs(
    ctx: &WalletContext,
    state: &mut WalletState,
    keyset_id: &str,
    amounts: &[u64],
) -> CashuResult<Vec<PreparedOutput>> {
    let start = reserve_counters(ctx, state, keyset_id, amounts.len()).await?;
    deterministic_outputs(&state.seed, keyset_id, start, amounts)
}

// =============================================================================
// Selection
// =============================================================================

/// Select proofs covering `amount` at `mint`, confirmed unspent by the mint
///
/// Spent proofs found along the way are removed from the ledger. Pending
/// proofs stay in the ledger but are held back for the rest of the
/// selection, and the remaining proofs are selected again.
pub(crate) async fn select_verified(
    ctx: &WalletContext,
    mint: &dyn MintClient,
    amount: u64,
) -> CashuResult<(ProofSelection, LedgerView)> {
    let mint_url = mint.mint_url().to_string();
    let mut held_back: HashSet<String> = HashSet::new();

    for pass in 0..MAX_SELECTION_PASSES {
        let view = ctx.ledger.fetch_proofs(true).await?;
        let selection = match ctx
            .ledger
            .select_proofs_for_spending(amount, Some(&mint_url), &held_back)
            .await
        {
            Ok(selection) => selection,
            Err(CashuWalletError::InsufficientFunds { available, .. }) if !held_back.is_empty() => {
                return Err(CashuWalletError::MintRejected {
                    mint_url,
                    code: Some(11002),
                    detail: format!(
                        "{} proofs are pending at the mint, {} sats spendable",
                        held_back.len(),
                        available
                    ),
                });
            }
            Err(e) => return Err(e),
        };
        let inputs: Vec<Proof> = selection.proofs.iter().map(|p| p.proof.clone()).collect();

        match ctx.ledger.verify_proofs(mint, &inputs).await {
            ProofVerification::Checked { spent, pending, .. } => {
                if spent.is_empty() && pending.is_empty() {
                    return Ok((selection, view));
                }

                if !pending.is_empty() {
                    log::info!(
                        "Selection pass {} holds back {} pending proofs",
                        pass + 1,
                        pending.len()
                    );
                    held_back.extend(pending.iter().map(|p| p.secret.clone()));
                }
                if !spent.is_empty() {
                    log::info!(
                        "Selection pass {} hit {} spent proofs, cleaning up",
                        pass + 1,
                        spent.len()
                    );
                    let secrets: HashSet<String> =
                        spent.iter().map(|p| p.secret.clone()).collect();
                    if let Err(e) = ctx.ledger.remove_spent(&secrets).await {
                        log::warn!("Spent-proof cleanup failed: {}", e);
                    }
                }
            }
            ProofVerification::Unverified { reason } => {
                return Err(CashuWalletError::MintUnreachable {
                    mint_url,
                    message: reason,
                });
            }
        }
    }

    Err(CashuWalletError::Internal(
        "proof selection kept returning spent or pending proofs".to_string(),
    ))
}

/// Distinct batch ids a selection draws from
pub(crate) fn source_events(selection: &ProofSelection) -> Vec<String> {
    let mut events: Vec<String> = selection.proofs.iter().map(|p| p.event_id.clone()).collect();
    events.sort();
    events.dedup();
    events
}

// =============================================================================
// Recording Outputs
// =============================================================================

/// Publish `outputs` plus `migrated` proofs as one batch superseding
/// `supersedes`, then request deletion of the superseded batches
///
/// If publishing fails the outputs (not the migrated proofs, which are still
/// in the superseded batches) are captured by the safety net. Returns `None`
/// only when there was nothing to capture.
pub(crate) async fn record_outputs(
    ctx: &WalletContext,
    outputs: &[Proof],
    migrated: &[Proof],
    mint_url: &str,
    supersedes: &[String],
    reason: &str,
) -> CashuResult<Option<PublishOutcome>> {
    if outputs.is_empty() && migrated.is_empty() && supersedes.is_empty() {
        return Ok(None);
    }

    let mut batch = outputs.to_vec();
    batch.extend_from_slice(migrated);

    match ctx.ledger.publish_proofs(&batch, mint_url, supersedes).await {
        Ok(event_id) => {
            ctx.ledger.delete_proof_events(supersedes).await;
            Ok(Some(PublishOutcome::Published { event_id }))
        }
        Err(e) if outputs.is_empty() => {
            log::warn!("Could not tombstone {} batches after {}: {}", supersedes.len(), reason, e);
            Ok(None)
        }
        Err(e) => {
            log::error!("Publishing {} outputs failed ({}), capturing them", reason, e);
            let token = ctx
                .safety_net
                .capture(outputs, mint_url, &format!("{}: {}", reason, e))
                .await?;
            Ok(Some(PublishOutcome::Captured {
                recovery_token_id: token.id,
            }))
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Recompute the balance and publish a diagnostics snapshot
pub(crate) async fn refresh_snapshot(ctx: &WalletContext, state: &mut WalletState) {
    match ctx.ledger.fetch_proofs(false).await {
        Ok(view) => {
            state.balance.available = view.balance();
            if view.stale {
                state.balance.verification = BalanceVerification::Stale;
            }
        }
        Err(e) => {
            log::warn!("Balance refresh failed: {}", e);
            state.balance.verification = BalanceVerification::Stale;
        }
    }

    let escrows = htlc::list_escrows(ctx).await.unwrap_or_default();
    let locked: Vec<_> = escrows
        .iter()
        .filter(|h| h.status == HtlcStatus::Locked)
        .collect();
    state.balance.pending = locked.iter().map(|h| h.amount_sats).sum();
    state.balance.updated_at = ctx.clock.now();

    let diagnostics = WalletDiagnostics {
        balance: state.balance.clone(),
        last_sync: state.last_sync,
        pending_operations: ctx.journal.list().await.map(|ops| ops.len()).unwrap_or(0),
        recovery_tokens: ctx.safety_net.list().await.map(|t| t.len()).unwrap_or(0),
        locked_escrows: locked.len(),
        hazards: state.hazards.clone(),
    };
    ctx.snapshot.send_replace(diagnostics);
}

// =============================================================================
// Cancellation
// =============================================================================

/// Run `fut` to completion even if the caller stops polling
///
/// Used for every operation that can make the mint consume inputs: once the
/// swap is sent, recording its outputs must not be interrupted.
pub(crate) async fn shielded<F, T>(fut: F) -> CashuResult<T>
where
    F: Future<Output = CashuResult<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(CashuWalletError::Cancelled),
        Err(e) => Err(CashuWalletError::Internal(format!("wallet task panicked: {}", e))),
    }
}
