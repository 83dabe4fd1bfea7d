//! Cashu wallet
//!
//! `CashuWallet` is the entry point for everything else in this module. It
//! owns the wallet state behind one async mutex, so lock, claim, refund,
//! deposit, withdraw, receive and sync never interleave. Balance and
//! diagnostics are published on a watch channel and can be read without
//! waiting for a running operation.
//!
//! Operations that can make the mint consume proofs run their body in a
//! spawned task. Dropping the caller's future does not stop them half way.

use std::collections::HashSet;
use std::sync::Arc;

use nostr::nips::nip60::SpendingHistory;
use tokio::sync::{watch, Mutex};

use super::cache::KeysetCache;
use super::config::WalletConfig;
use super::errors::{CashuResult, CashuWalletError};
use super::htlc;
use super::internal::{
    load_local_metadata, persist_metadata, refresh_snapshot, shielded, WalletContext, WalletState,
};
use super::lightning::{self, DepositQuote, WithdrawResult};
use super::proof_recovery::{OperationJournal, RecoveryScanReport};
use super::proofs::{ProofLedger, ProofVerification};
use super::recovery::{self, RestoreReport, SafetyNet};
use super::spending_conditions::{classify_proof, ClassifiedProof};
use super::token::decode_token;
use super::types::{
    BalanceVerification, LockRequest, PendingHtlc, PendingOperation, Proof, RecoveryToken,
    Settlement, SyncResult, WalletBalances, WalletDiagnostics, WalletMetadata,
};
use super::utils::{normalize_mint_url, Clock};
use crate::crypto::{
    generate_mnemonic, generate_secret_key, mnemonic_to_seed, secret_key_from_hex,
    validate_mnemonic,
};
use crate::stores::local_store::LocalStore;
use crate::stores::mint_client::MintRegistry;
use crate::stores::nostr_client::BroadcastStore;
use crate::stores::signer::ContentCipher;

/// Collaborators a wallet is opened with
pub struct WalletDeps {
    pub store: Arc<dyn BroadcastStore>,
    pub cipher: Arc<dyn ContentCipher>,
    pub local: Arc<dyn LocalStore>,
    pub mints: MintRegistry,
    pub clock: Arc<dyn Clock>,
}

/// Settings used only when no wallet record exists yet
#[derive(Debug, Clone, Default)]
pub struct WalletOptions {
    pub mint_url: String,
    /// Restore an existing seed instead of generating one
    pub mnemonic: Option<String>,
}

/// Result of [`CashuWallet::connect`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectReport {
    pub recovery: RecoveryScanReport,
    /// Escrows rebuilt from locks whose swap response was lost
    pub recovered_escrows: Vec<PendingHtlc>,
    pub sync: SyncResult,
}

pub struct CashuWallet {
    ctx: Arc<WalletContext>,
    state: Arc<Mutex<WalletState>>,
    snapshot: watch::Receiver<WalletDiagnostics>,
}

// =============================================================================
// Opening
// =============================================================================

impl CashuWallet {
    /// Load the wallet record (store first, then the local copy) or create one
    ///
    /// Counters are merged keeping the higher value per keyset, so a stale
    /// store record never rewinds derivation.
    pub async fn open(
        deps: WalletDeps,
        options: WalletOptions,
        config: WalletConfig,
    ) -> CashuResult<Self> {
        config.validate()?;
        let WalletDeps {
            store,
            cipher,
            local,
            mints,
            clock,
        } = deps;

        let ledger = ProofLedger::new(store, cipher, config.clone());
        let local_copy = load_local_metadata(local.as_ref()).await?;
        let remote = match ledger.load_wallet_record().await {
            Ok(remote) => remote,
            Err(e) if local_copy.is_some() => {
                log::warn!("Wallet record unavailable, using local copy: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        let (mut metadata, created) = match (remote, local_copy) {
            (Some(mut remote), Some(local_copy)) => {
                remote.merge_counters(&local_copy.counters);
                (remote, false)
            }
            (Some(remote), None) => (remote, false),
            (None, Some(local_copy)) => (local_copy, false),
            (None, None) => (new_metadata(&options)?, true),
        };

        if metadata.mnemonic.is_empty() {
            log::warn!("Wallet record has no seed, assigning one");
            metadata.mnemonic = match &options.mnemonic {
                Some(words) => words.clone(),
                None => generate_mnemonic()?,
            };
        } else if options.mnemonic.as_deref().is_some_and(|m| m != metadata.mnemonic) {
            log::warn!("Ignoring provided mnemonic, the existing wallet record has its own");
        }
        validate_mnemonic(&metadata.mnemonic)?;

        let wallet_key = secret_key_from_hex(&metadata.wallet_key)?;
        let words = metadata.mnemonic.clone();
        let seed = tokio::task::spawn_blocking(move || mnemonic_to_seed(&words, ""))
            .await
            .map_err(|e| CashuWalletError::Internal(format!("seed derivation failed: {}", e)))??;

        let (snapshot_tx, snapshot) = watch::channel(WalletDiagnostics::default());
        let ctx = Arc::new(WalletContext {
            ledger,
            mints,
            keysets: KeysetCache::new(config.keyset_cache_ttl()),
            journal: OperationJournal::new(local.clone(), clock.clone()),
            safety_net: SafetyNet::new(local.clone(), clock.clone()),
            local,
            clock,
            config,
            snapshot: snapshot_tx,
        });

        persist_metadata(&ctx, &metadata).await?;
        if created {
            log::info!("Created wallet for mint {}", metadata.mint_url);
        } else {
            log::info!(
                "Loaded wallet for mint {} ({} keyset counters)",
                metadata.mint_url,
                metadata.counters.len()
            );
        }

        let state = WalletState {
            metadata,
            wallet_key,
            seed,
            hazards: Vec::new(),
            balance: WalletBalances::default(),
            last_sync: None,
        };

        Ok(Self {
            ctx,
            state: Arc::new(Mutex::new(state)),
            snapshot,
        })
    }

    /// Recover interrupted operations, then sync
    pub async fn connect(&self) -> CashuResult<ConnectReport> {
        let (recovery, recovered_escrows) = {
            let mut state = self.state.lock().await;
            let ctx = &self.ctx;
            let report = ctx
                .journal
                .scan(|url| ctx.mints.get(url).ok(), ctx.config.max_sync_input_size)
                .await?;
            for hazard in &report.hazards {
                state.flag(hazard.clone());
            }
            if !report.is_clean() {
                log::warn!(
                    "Operation journal: {} recovered, {} ambiguous, {} unchecked",
                    report.recovered.len(),
                    report.ambiguous.len(),
                    report.unchecked.len()
                );
            }
            let escrows = htlc::recover_lost_locks(ctx, &report.recovered).await?;
            (report, escrows)
        };

        let sync = self.sync().await?;
        Ok(ConnectReport {
            recovery,
            recovered_escrows,
            sync,
        })
    }
}

fn new_metadata(options: &WalletOptions) -> CashuResult<WalletMetadata> {
    if options.mint_url.is_empty() {
        return Err(CashuWalletError::MintNotFound {
            mint_url: String::new(),
        });
    }
    let mnemonic = match &options.mnemonic {
        Some(words) => words.trim().to_string(),
        None => generate_mnemonic()?,
    };
    Ok(WalletMetadata {
        mint_url: normalize_mint_url(&options.mint_url),
        wallet_key: hex::encode(generate_secret_key().secret_bytes()),
        mnemonic,
        counters: Default::default(),
    })
}

// =============================================================================
// Sync
// =============================================================================

/// Drop proofs the mint reports spent and settle the balance verification
async fn reconcile(ctx: &WalletContext, state: &mut WalletState) -> CashuResult<SyncResult> {
    let mut result = SyncResult::default();
    let view = ctx.ledger.fetch_proofs(true).await?;
    if view.stale {
        state.balance.verification = BalanceVerification::Stale;
        return Ok(result);
    }

    let mint = ctx.mint(state.mint_url())?;
    let proofs: Vec<Proof> = view
        .proofs_for_mint(mint.mint_url())
        .into_iter()
        .map(|p| p.proof)
        .collect();

    match ctx.ledger.verify_proofs(mint.as_ref(), &proofs).await {
        ProofVerification::Checked { spent, pending, .. } => {
            if !pending.is_empty() {
                log::info!("{} proofs are pending at the mint", pending.len());
            }
            let spent: HashSet<String> = spent.into_iter().map(|p| p.secret).collect();
            result.spent_removed = spent.len();
            result.cleaned_events = ctx.ledger.remove_spent(&spent).await?;
            state.balance.verification = BalanceVerification::Verified;
        }
        ProofVerification::Unverified { reason } => {
            log::warn!("Balance not verified with the mint: {}", reason);
            state.balance.verification = BalanceVerification::Unverified { reason };
        }
    }
    Ok(result)
}

/// Escrow upkeep run after every reconcile; failures only log
async fn maintain_escrows(ctx: &WalletContext, state: &mut WalletState, result: &mut SyncResult) {
    match htlc::sync_htlc_states(ctx).await {
        Ok(claimed) => result.htlcs_claimed = claimed,
        Err(e) => log::warn!("Escrow state check failed: {}", e),
    }
    match htlc::sweep_expired_refunds(ctx, state).await {
        Ok(settled) => result.refunds = settled.len(),
        Err(e) => log::warn!("Refund sweep failed: {}", e),
    }
    match htlc::prune_resolved(ctx, ctx.clock.now()).await {
        Ok(pruned) => result.pruned = pruned,
        Err(e) => log::warn!("Escrow pruning failed: {}", e),
    }
}

// =============================================================================
// Receive
// =============================================================================

/// Swap a plain token into fresh proofs of this wallet
async fn receive(ctx: &WalletContext, state: &mut WalletState, token: &str) -> CashuResult<Settlement> {
    let (mint_url, proofs) = decode_token(token)?;
    for proof in &proofs {
        let classified = classify_proof(proof).map_err(|e| CashuWalletError::InvalidToken {
            reason: e.to_string(),
        })?;
        if let ClassifiedProof::Htlc { .. } = classified {
            return Err(CashuWalletError::InvalidToken {
                reason: "token is HTLC-locked, claim it with the preimage".to_string(),
            });
        }
    }

    let settlement = htlc::redeem(ctx, state, &mint_url, proofs, "receive", None).await?;
    log::info!("Received {} sats from {}", settlement.amount, mint_url);
    Ok(settlement)
}

// =============================================================================
// Operations
// =============================================================================

impl CashuWallet {
    /// Reconcile the ledger with the mint and run escrow upkeep
    ///
    /// Reconciling is safe to cancel. The refund sweep that follows is not
    /// and runs shielded.
    pub async fn sync(&self) -> CashuResult<SyncResult> {
        let ctx = self.ctx.clone();
        let mut state = self.state.clone().lock_owned().await;
        let mut result = reconcile(&ctx, &mut state).await?;

        shielded(async move {
            maintain_escrows(&ctx, &mut state, &mut result).await;
            state.last_sync = Some(ctx.clock.now());
            refresh_snapshot(&ctx, &mut state).await;
            result.balance = state.balance.clone();
            log::debug!(
                "Sync done: {} sats available, {} pending",
                result.balance.available,
                result.balance.pending
            );
            Ok(result)
        })
        .await
    }

    /// Lock funds into an HTLC escrow for the counterparty
    pub async fn lock_htlc(&self, request: LockRequest) -> CashuResult<PendingHtlc> {
        let ctx = self.ctx.clone();
        let mut state = self.state.clone().lock_owned().await;
        shielded(async move {
            let result = htlc::lock(&ctx, &mut state, request).await;
            refresh_snapshot(&ctx, &mut state).await;
            result
        })
        .await
    }

    /// Claim an escrow token addressed to this wallet
    pub async fn claim_htlc(&self, htlc_token: &str, preimage: &str) -> CashuResult<Settlement> {
        let ctx = self.ctx.clone();
        let htlc_token = htlc_token.to_string();
        let preimage = preimage.to_string();
        let mut state = self.state.clone().lock_owned().await;
        shielded(async move {
            let result = htlc::claim(&ctx, &mut state, &htlc_token, &preimage).await;
            refresh_snapshot(&ctx, &mut state).await;
            result
        })
        .await
    }

    /// Reclaim an expired escrow this wallet locked
    pub async fn refund_htlc(&self, escrow_id: &str) -> CashuResult<Settlement> {
        let ctx = self.ctx.clone();
        let escrow_id = escrow_id.to_string();
        let mut state = self.state.clone().lock_owned().await;
        shielded(async move {
            let result = htlc::refund(&ctx, &mut state, &escrow_id).await;
            refresh_snapshot(&ctx, &mut state).await;
            result
        })
        .await
    }

    pub async fn sweep_expired_refunds(&self) -> CashuResult<Vec<Settlement>> {
        let ctx = self.ctx.clone();
        let mut state = self.state.clone().lock_owned().await;
        shielded(async move {
            let result = htlc::sweep_expired_refunds(&ctx, &mut state).await;
            refresh_snapshot(&ctx, &mut state).await;
            result
        })
        .await
    }

    /// Escrows this wallet created, newest first
    pub async fn escrows(&self) -> CashuResult<Vec<PendingHtlc>> {
        htlc::list_escrows(&self.ctx).await
    }

    /// Receive a plain (unlocked) token
    pub async fn receive_token(&self, token: &str) -> CashuResult<Settlement> {
        let ctx = self.ctx.clone();
        let token = token.trim().to_string();
        let mut state = self.state.clone().lock_owned().await;
        shielded(async move {
            let result = receive(&ctx, &mut state, &token).await;
            refresh_snapshot(&ctx, &mut state).await;
            result
        })
        .await
    }

    pub async fn create_deposit_quote(&self, amount: u64) -> CashuResult<DepositQuote> {
        let state = self.state.lock().await;
        lightning::create_deposit_quote(&self.ctx, &state, amount).await
    }

    /// Mint the proofs of a paid deposit quote
    pub async fn complete_deposit(&self, quote_id: &str) -> CashuResult<Settlement> {
        let ctx = self.ctx.clone();
        let quote_id = quote_id.to_string();
        let mut state = self.state.clone().lock_owned().await;
        shielded(async move {
            let result = lightning::complete_deposit(&ctx, &mut state, &quote_id).await;
            refresh_snapshot(&ctx, &mut state).await;
            result
        })
        .await
    }

    /// Pay a Lightning invoice from the ledger
    pub async fn withdraw(&self, invoice: &str) -> CashuResult<WithdrawResult> {
        let ctx = self.ctx.clone();
        let invoice = invoice.trim().to_string();
        let mut state = self.state.clone().lock_owned().await;
        shielded(async move {
            let result = lightning::withdraw(&ctx, &mut state, &invoice).await;
            refresh_snapshot(&ctx, &mut state).await;
            result
        })
        .await
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    pub async fn recovery_tokens(&self) -> CashuResult<Vec<RecoveryToken>> {
        self.ctx.safety_net.list().await
    }

    /// Publish a recovery token's unspent proofs back into the ledger
    pub async fn republish_recovery_token(&self, id: &str) -> CashuResult<u64> {
        let ctx = self.ctx.clone();
        let id = id.to_string();
        let mut state = self.state.clone().lock_owned().await;
        shielded(async move {
            let result = recovery::republish(&ctx, &id).await;
            refresh_snapshot(&ctx, &mut state).await;
            result
        })
        .await
    }

    /// Rebuild proofs this wallet's seed produced at `mint_url`
    pub async fn restore_from_seed(&self, mint_url: &str) -> CashuResult<RestoreReport> {
        let ctx = self.ctx.clone();
        let mint_url = mint_url.to_string();
        let mut state = self.state.clone().lock_owned().await;
        shielded(async move {
            let result = recovery::restore_from_seed(&ctx, &mut state, &mint_url).await;
            refresh_snapshot(&ctx, &mut state).await;
            result
        })
        .await
    }

    /// Journal entries left by interrupted operations
    pub async fn pending_operations(&self) -> CashuResult<Vec<PendingOperation>> {
        self.ctx.journal.list().await
    }

    /// Forget a journal entry after its outcome was handled by hand
    pub async fn dismiss_operation(&self, id: &str) -> CashuResult<()> {
        let mut state = self.state.lock().await;
        self.ctx.journal.dismiss(id).await?;
        refresh_snapshot(&self.ctx, &mut state).await;
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Spending history, newest first
    pub async fn history(&self) -> CashuResult<Vec<(u64, SpendingHistory)>> {
        self.ctx.ledger.fetch_history().await
    }

    /// Last published balance; does not wait for running operations
    pub fn balance(&self) -> WalletBalances {
        self.snapshot.borrow().balance.clone()
    }

    pub fn diagnostics(&self) -> WalletDiagnostics {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified after every operation
    pub fn subscribe(&self) -> watch::Receiver<WalletDiagnostics> {
        self.snapshot.clone()
    }

    /// Compressed hex key counterparties lock escrows to
    pub async fn pubkey(&self) -> String {
        self.state.lock().await.wallet_pubkey()
    }

    pub async fn mint_url(&self) -> String {
        self.state.lock().await.mint_url().to_string()
    }

    pub async fn mnemonic(&self) -> String {
        self.state.lock().await.metadata.mnemonic.clone()
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub(crate) fn context(&self) -> Arc<WalletContext> {
        self.ctx.clone()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> Arc<Mutex<WalletState>> {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::cashu::internal::METADATA_KEY;
    use crate::stores::cashu::token::encode_token;
    use crate::stores::cashu::types::{ConsistencyHazard, OperationKind, PublishOutcome};
    use crate::stores::cashu::utils::ManualClock;
    use crate::stores::cashu_memory_db::{MemoryBroadcastStore, MemoryLocalStore};
    use crate::stores::local_store::put_json;
    use crate::stores::signer::Nip44Cipher;
    use crate::test_utils::{preimage_pair, TestWallet, TEST_MINT};
    use nostr_sdk::Keys;

    #[tokio::test]
    async fn test_open_reuses_record_and_keeps_higher_counters() {
        let wallet = TestWallet::new("alice").await;
        let pubkey = wallet.wallet.pubkey().await;
        {
            let ctx = wallet.wallet.context();
            let mut state = wallet.wallet.state().lock_owned().await;
            state.metadata.counters.insert("00aa".into(), 7);
            persist_metadata(&ctx, &state.metadata).await.unwrap();
            // Local copy ahead of the store record
            state.metadata.counters.insert("00aa".into(), 9);
            put_json(ctx.local.as_ref(), METADATA_KEY, &state.metadata.to_tags())
                .await
                .unwrap();
        }

        let reopened = wallet.reopen().await;
        assert_eq!(reopened.pubkey().await, pubkey);
        let state = reopened.state().lock_owned().await;
        assert_eq!(state.metadata.counters["00aa"], 9);
    }

    #[tokio::test]
    async fn test_open_without_store_or_local_copy_fails() {
        let store = MemoryBroadcastStore::new("alice");
        store.set_unreachable(true);
        let deps = WalletDeps {
            store: Arc::new(store),
            cipher: Arc::new(Nip44Cipher::from_keys(Keys::generate())),
            local: Arc::new(MemoryLocalStore::new()),
            mints: MintRegistry::new(),
            clock: Arc::new(ManualClock::new(0)),
        };
        let options = WalletOptions {
            mint_url: TEST_MINT.to_string(),
            mnemonic: None,
        };
        // Creating a fresh wallet here could shadow an existing record
        assert!(matches!(
            CashuWallet::open(deps, options, WalletConfig::default()).await,
            Err(CashuWalletError::StoreUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_drops_spent_proofs() {
        let wallet = TestWallet::new("alice").await;
        let proofs = wallet.fund(&[1, 2, 4]).await;
        wallet.mint.mark_spent(&proofs[1]);

        let result = wallet.wallet.sync().await.unwrap();
        assert_eq!(result.spent_removed, 1);
        assert_eq!(result.cleaned_events, 1);
        assert_eq!(result.balance.available, 5);
        assert!(result.balance.is_verified());
        assert_eq!(wallet.wallet.balance().available, 5);
        assert!(wallet.wallet.diagnostics().last_sync.is_some());
    }

    #[tokio::test]
    async fn test_sync_with_unreachable_mint_is_unverified() {
        let wallet = TestWallet::new("alice").await;
        wallet.fund(&[8]).await;
        wallet.mint.set_unreachable(true);

        let result = wallet.wallet.sync().await.unwrap();
        assert_eq!(result.balance.available, 8);
        assert!(matches!(
            result.balance.verification,
            BalanceVerification::Unverified { .. }
        ));
    }

    #[tokio::test]
    async fn test_receive_plain_token() {
        let alice = TestWallet::new("alice").await;
        let bob = alice.sibling("bob").await;
        let proofs = alice.mint.issue(&[16, 4]).await;
        let token = encode_token(TEST_MINT, &proofs, None).unwrap();

        let settlement = bob.wallet.receive_token(&token).await.unwrap();
        assert_eq!(settlement.amount, 20);
        assert_eq!(bob.wallet.sync().await.unwrap().balance.available, 20);

        // Proofs were swapped, the original token is now spent
        assert!(matches!(
            alice.wallet.receive_token(&token).await,
            Err(CashuWalletError::MintRejected { code: Some(11001), .. })
        ));
    }

    #[tokio::test]
    async fn test_unpublished_receive_lands_in_safety_net() {
        let alice = TestWallet::new("alice").await;
        let bob = alice.sibling("bob").await;
        let proofs = alice.mint.issue(&[16, 4]).await;
        let token = encode_token(TEST_MINT, &proofs, None).unwrap();

        // Counter record and proof batch both exhaust their retries
        bob.store.fail_next_publishes(6);
        let settlement = bob.wallet.receive_token(&token).await.unwrap();
        let PublishOutcome::Captured { recovery_token_id } = settlement.outcome else {
            panic!("expected the proofs to be captured");
        };

        let snapshot = bob.wallet.subscribe();
        assert_eq!(snapshot.borrow().recovery_tokens, 1);
        assert_eq!(bob.wallet.balance().available, 0);
        assert_eq!(bob.wallet.recovery_tokens().await.unwrap().len(), 1);

        let republished = bob.wallet.republish_recovery_token(&recovery_token_id).await.unwrap();
        assert_eq!(republished, 20);
        assert!(bob.wallet.recovery_tokens().await.unwrap().is_empty());
        assert_eq!(bob.wallet.sync().await.unwrap().balance.available, 20);
        assert_eq!(snapshot.borrow().recovery_tokens, 0);
    }

    #[tokio::test]
    async fn test_receive_rejects_htlc_token() {
        let rider = TestWallet::new("rider").await;
        let driver = rider.sibling("driver").await;
        let (_preimage, hash) = preimage_pair();
        rider.fund(&[8]).await;
        let htlc = rider
            .wallet
            .lock_htlc(LockRequest {
                amount_sats: 8,
                payment_hash: hash,
                counterparty_key: driver.wallet.pubkey().await,
                expiry: rider.clock_now() + 600,
                ride_ref: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            driver.wallet.receive_token(&htlc.htlc_token).await,
            Err(CashuWalletError::InvalidToken { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_surfaces_ambiguous_operations() {
        let wallet = TestWallet::new("alice").await;
        let proofs = wallet.fund(&[1, 2]).await;
        let ctx = wallet.wallet.context();
        ctx.journal
            .begin(
                OperationKind::Swap,
                proofs.iter().map(|p| p.secret.clone()).collect(),
                None,
                TEST_MINT,
            )
            .await
            .unwrap();
        wallet.mint.mark_spent(&proofs[0]);

        let report = wallet.wallet.connect().await.unwrap();
        assert_eq!(report.recovery.ambiguous.len(), 1);
        let diagnostics = wallet.wallet.diagnostics();
        assert!(matches!(
            diagnostics.hazards.as_slice(),
            [ConsistencyHazard::AmbiguousOperation { spent: 1, unspent: 1, .. }]
        ));
        assert_eq!(diagnostics.pending_operations, 1);

        let id = report.recovery.ambiguous[0].id.clone();
        wallet.wallet.dismiss_operation(&id).await.unwrap();
        assert!(wallet.wallet.pending_operations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_from_seed_on_fresh_wallet() {
        let alice = TestWallet::new("alice").await;
        let quote = alice.wallet.create_deposit_quote(13).await.unwrap();
        alice.wallet.complete_deposit(&quote.quote_id).await.unwrap();

        let mnemonic = alice.wallet.mnemonic().await;
        let restored = alice.with_mnemonic("alice-restored", &mnemonic).await;
        assert_eq!(restored.wallet.sync().await.unwrap().balance.available, 0);

        let report = restored.wallet.restore_from_seed(TEST_MINT).await.unwrap();
        assert_eq!(report.restored, 13);
        assert_eq!(report.signed_outputs, 3);
        assert_eq!(report.next_counter, 3);
        assert_eq!(restored.wallet.sync().await.unwrap().balance.available, 13);

        // A second run finds nothing new
        let again = restored.wallet.restore_from_seed(TEST_MINT).await.unwrap();
        assert_eq!(again.restored, 0);
    }

    #[tokio::test]
    async fn test_history_records_deposit_and_withdraw() {
        let wallet = TestWallet::new("alice").await;
        let quote = wallet.wallet.create_deposit_quote(32).await.unwrap();
        wallet.wallet.complete_deposit(&quote.quote_id).await.unwrap();
        wallet.wallet.withdraw("fake:10").await.unwrap();

        let history = wallet.wallet.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].0 >= history[1].0);
    }
}
