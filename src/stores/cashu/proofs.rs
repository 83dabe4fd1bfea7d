//! Proof ledger
//!
//! Reconciles the wallet's proof batches on the broadcast store into one
//! spendable view, publishes new batches, selects proofs for spending and
//! checks spend state with the mint.
//!
//! Batches are append-only. A batch leaves the view when a newer batch names
//! it in `del` (or, as a backup, when a deletion request targets it). Every
//! batch that supersedes another also carries the unconsumed proofs of the
//! batch it supersedes, so there is never a tombstone without its migration.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use nostr::nips::nip60::{SpendingHistory, TransactionDirection};
use tokio::time::Instant;

use super::config::WalletConfig;
use super::errors::{CashuResult, CashuWalletError};
use super::events::{
    build_deletion_record, build_history_record, build_token_record, build_wallet_record,
    decrypt_history_record, decrypt_token_record, decrypt_wallet_record, deletion_targets,
    history_entry, KIND_DELETION, KIND_HISTORY, KIND_TOKEN, KIND_WALLET,
};
use super::retry::retry_with_backoff;
use super::spending_conditions::{parse_secret, ParsedSecret};
use super::types::{
    total_amount, Proof, ProofBatch, ProofSelection, ProofWithOrigin, TokenEventData,
    WalletMetadata,
};
use super::utils::{mint_matches, normalize_mint_url, now_secs};
use crate::stores::mint_client::{MintClient, MintProofState};
use crate::stores::nostr_client::{
    BroadcastStore, RecordDraft, RecordQuery, StoreError, StoreMessage, StoreRecord,
};
use crate::stores::signer::ContentCipher;

// =============================================================================
// Ledger View
// =============================================================================

/// Reconciled proofs at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerView {
    /// Live proofs ordered by `(amount, secret)`
    pub proofs: Vec<ProofWithOrigin>,
    /// True when the store could not be reached and this is the last good view
    pub stale: bool,
    pub fetched_at: u64,
}

impl LedgerView {
    pub fn balance(&self) -> u64 {
        self.proofs.iter().map(|p| p.proof.amount).sum()
    }

    /// Proofs at `mint_url`; batches without a mint tag count for every mint
    pub fn proofs_for_mint(&self, mint_url: &str) -> Vec<ProofWithOrigin> {
        let normalized = normalize_mint_url(mint_url);
        self.proofs
            .iter()
            .filter(|p| {
                p.mint_url
                    .as_deref()
                    .map(|m| mint_matches(m, &normalized))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Live proofs of the given batches, minus `consumed` secrets
    pub fn unconsumed_proofs(&self, events: &[String], consumed: &HashSet<String>) -> Vec<Proof> {
        self.proofs
            .iter()
            .filter(|p| events.contains(&p.event_id) && !consumed.contains(&p.proof.secret))
            .map(|p| p.proof.clone())
            .collect()
    }

    pub fn contains_secret(&self, secret: &str) -> bool {
        self.proofs.iter().any(|p| p.proof.secret == secret)
    }
}

/// Reconcile decrypted batches into the live proof set
///
/// Tombstones are the union of every batch's `del` set and the targets of
/// deletion requests. Duplicate secrets collapse to the copy from the newest
/// batch (ties broken by event id). Secrets in `spent` are dropped.
pub fn reconcile_batches(
    batches: &[ProofBatch],
    deletion_targets: &HashSet<String>,
    spent: &HashSet<String>,
) -> Vec<ProofWithOrigin> {
    let tombstoned: HashSet<&str> = batches
        .iter()
        .flat_map(|b| b.data.del.iter().map(String::as_str))
        .chain(deletion_targets.iter().map(String::as_str))
        .collect();

    let mut live: Vec<&ProofBatch> = batches
        .iter()
        .filter(|b| !tombstoned.contains(b.event_id.as_str()))
        .collect();
    live.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.event_id.cmp(&a.event_id))
    });

    let mut seen = HashSet::new();
    let mut proofs = Vec::new();
    for batch in live {
        let mint_url = batch.data.mint.as_deref().map(normalize_mint_url);
        for proof in &batch.data.proofs {
            if spent.contains(&proof.secret) || !seen.insert(proof.secret.clone()) {
                continue;
            }
            proofs.push(ProofWithOrigin {
                proof: proof.clone(),
                event_id: batch.event_id.clone(),
                mint_url: mint_url.clone(),
                created_at: batch.created_at,
            });
        }
    }

    proofs.sort_by(|a, b| {
        a.proof
            .amount
            .cmp(&b.proof.amount)
            .then_with(|| a.proof.secret.cmp(&b.proof.secret))
    });
    proofs
}

/// Greedy ascending selection until the running total covers `amount`
pub fn select_ascending(candidates: &[ProofWithOrigin], amount: u64) -> CashuResult<ProofSelection> {
    if amount == 0 {
        return Err(CashuWalletError::InvalidAmount(
            "amount must be greater than zero".to_string(),
        ));
    }

    let mut sorted: Vec<&ProofWithOrigin> = candidates.iter().collect();
    sorted.sort_by(|a, b| {
        a.proof
            .amount
            .cmp(&b.proof.amount)
            .then_with(|| a.proof.secret.cmp(&b.proof.secret))
    });

    let available = sorted
        .iter()
        .try_fold(0u64, |acc, p| acc.checked_add(p.proof.amount))
        .ok_or_else(|| CashuWalletError::Internal("proof amount overflow".to_string()))?;
    if available < amount {
        return Err(CashuWalletError::InsufficientFunds {
            available,
            required: amount,
        });
    }

    let mut selected = Vec::new();
    let mut total = 0u64;
    for proof in sorted {
        if total >= amount {
            break;
        }
        total += proof.proof.amount;
        selected.push(proof.clone());
    }

    Ok(ProofSelection {
        proofs: selected,
        total,
        change: total - amount,
    })
}

// =============================================================================
// Verification
// =============================================================================

/// Outcome of asking the mint about a proof set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofVerification {
    Checked {
        unspent: Vec<Proof>,
        pending: Vec<Proof>,
        spent: Vec<Proof>,
    },
    /// Mint could not be asked; the store view is trusted as-is
    Unverified { reason: String },
}

impl ProofVerification {
    pub fn spent(&self) -> &[Proof] {
        match self {
            ProofVerification::Checked { spent, .. } => spent,
            ProofVerification::Unverified { .. } => &[],
        }
    }
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Debug, Clone)]
struct CachedView {
    view: LedgerView,
    cached_at: Instant,
}

/// The wallet's proof ledger on the broadcast store
pub struct ProofLedger {
    store: Arc<dyn BroadcastStore>,
    cipher: Arc<dyn ContentCipher>,
    config: WalletConfig,
    cache: Mutex<Option<CachedView>>,
    /// Secrets the mint has confirmed spent this session
    known_spent: Mutex<HashSet<String>>,
}

impl ProofLedger {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        cipher: Arc<dyn ContentCipher>,
        config: WalletConfig,
    ) -> Self {
        Self {
            store,
            cipher,
            config,
            cache: Mutex::new(None),
            known_spent: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    fn cached_view(&self) -> Option<CachedView> {
        self.cache.lock().ok().and_then(|c| c.clone())
    }

    fn store_view(&self, view: &LedgerView) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(CachedView {
                view: view.clone(),
                cached_at: Instant::now(),
            });
        }
    }

    fn update_cached_view(&self, update: impl FnOnce(&mut LedgerView)) {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(cached) = cache.as_mut() {
                update(&mut cached.view);
            }
        }
    }

    /// Drop the cached view so the next fetch queries the store
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    fn known_spent(&self) -> HashSet<String> {
        self.known_spent
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Remember spent secrets and drop them from the cached view
    pub fn record_spent<'a>(&self, secrets: impl IntoIterator<Item = &'a String>) {
        let secrets: HashSet<String> = secrets.into_iter().cloned().collect();
        if secrets.is_empty() {
            return;
        }
        if let Ok(mut known) = self.known_spent.lock() {
            known.extend(secrets.iter().cloned());
        }
        self.update_cached_view(|view| view.proofs.retain(|p| !secrets.contains(&p.proof.secret)));
    }

    /// Run a store query, racing end-of-stored-records against the query timeout
    pub async fn collect_records(&self, query: RecordQuery) -> Result<Vec<StoreRecord>, StoreError> {
        let mut stream = self.store.query(query).await?;
        let mut records = Vec::new();

        let deadline = tokio::time::sleep(self.config.query_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(StoreMessage::Record(record)) => records.push(record),
                    Some(StoreMessage::EndOfStoredRecords) | None => break,
                },
                _ = &mut deadline => {
                    log::warn!(
                        "Store query timed out after {:?}, proceeding with {} records",
                        self.config.query_timeout(),
                        records.len()
                    );
                    break;
                }
            }
        }

        Ok(records)
    }

    /// Reconciled proof view, served from cache within the TTL
    pub async fn fetch_proofs(&self, force_refresh: bool) -> CashuResult<LedgerView> {
        if !force_refresh {
            if let Some(cached) = self.cached_view() {
                if !cached.view.stale && cached.cached_at.elapsed() < self.config.proof_cache_ttl() {
                    return Ok(cached.view);
                }
            }
        }

        let query = RecordQuery::kinds([KIND_TOKEN, KIND_DELETION]).author(self.store.author());
        let records = match self.collect_records(query).await {
            Ok(records) => records,
            Err(StoreError::Unreachable(message)) => {
                return match self.cached_view() {
                    Some(cached) => {
                        log::warn!("Store unreachable ({}), serving last known proofs", message);
                        let mut view = cached.view;
                        view.stale = true;
                        Ok(view)
                    }
                    None => Err(CashuWalletError::StoreUnreachable(message)),
                };
            }
            Err(StoreError::Rejected(message)) => {
                return Err(CashuWalletError::StoreRejected(message))
            }
        };

        let mut deleted = HashSet::new();
        let mut batches = Vec::new();
        for record in &records {
            match record.kind {
                KIND_DELETION => deleted.extend(deletion_targets(record)),
                KIND_TOKEN => match decrypt_token_record(self.cipher.as_ref(), record).await {
                    Ok(batch) => batches.push(batch),
                    Err(e) => log::warn!("Skipping unreadable proof batch {}: {}", record.id, e),
                },
                _ => {}
            }
        }

        let proofs = reconcile_batches(&batches, &deleted, &self.known_spent());
        log::debug!(
            "Reconciled {} batches ({} deletion targets) into {} proofs",
            batches.len(),
            deleted.len(),
            proofs.len()
        );

        let view = LedgerView {
            proofs,
            stale: false,
            fetched_at: now_secs(),
        };
        self.store_view(&view);
        Ok(view)
    }

    /// Publish one batch superseding `supersedes`
    pub async fn publish_proofs(
        &self,
        proofs: &[Proof],
        mint_url: &str,
        supersedes: &[String],
    ) -> CashuResult<String> {
        self.publish_batch(proofs, Some(mint_url), supersedes).await
    }

    /// Publish a batch; without a mint the batch counts for every mint
    async fn publish_batch(
        &self,
        proofs: &[Proof],
        mint_url: Option<&str>,
        supersedes: &[String],
    ) -> CashuResult<String> {
        if proofs.is_empty() && supersedes.is_empty() {
            return Err(CashuWalletError::Internal(
                "refusing to publish an empty batch".to_string(),
            ));
        }

        let mint_url = mint_url.map(normalize_mint_url);
        let data = TokenEventData {
            mint: mint_url.clone(),
            unit: self.config.unit.clone(),
            proofs: proofs.iter().map(Proof::without_witness).collect(),
            del: supersedes.to_vec(),
        };
        let draft = build_token_record(self.cipher.as_ref(), &data).await?;
        let event_id = self.publish_with_retry(draft, "publish proof batch").await?;

        log::info!(
            "Published {} proofs ({} sats) as {}, superseding {} batches",
            data.proofs.len(),
            total_amount(&data.proofs),
            event_id,
            supersedes.len()
        );

        let created_at = now_secs();
        self.update_cached_view(|view| {
            view.proofs.retain(|p| !supersedes.contains(&p.event_id));
            let existing: HashSet<String> =
                view.proofs.iter().map(|p| p.proof.secret.clone()).collect();
            view.proofs.extend(
                data.proofs
                    .iter()
                    .filter(|p| !existing.contains(&p.secret))
                    .map(|p| ProofWithOrigin {
                        proof: p.clone(),
                        event_id: event_id.clone(),
                        mint_url: mint_url.clone(),
                        created_at,
                    }),
            );
            view.proofs.sort_by(|a, b| {
                a.proof
                    .amount
                    .cmp(&b.proof.amount)
                    .then_with(|| a.proof.secret.cmp(&b.proof.secret))
            });
        });

        Ok(event_id)
    }

    async fn publish_with_retry(&self, draft: RecordDraft, label: &str) -> CashuResult<String> {
        let store = self.store.clone();
        retry_with_backoff(
            &self.config.publish_retry,
            label,
            |e: &StoreError| matches!(e, StoreError::Unreachable(_)),
            || {
                let store = store.clone();
                let draft = draft.clone();
                async move { store.publish(draft).await }
            },
        )
        .await
        .map_err(|failure| match failure.error {
            StoreError::Rejected(message) => CashuWalletError::StoreRejected(message),
            StoreError::Unreachable(message) => CashuWalletError::PublishExhausted {
                attempts: failure.attempts,
                message,
            },
        })
    }

    /// Select proofs covering `amount`, optionally from one mint
    ///
    /// Secrets in `held_back` are not candidates.
    pub async fn select_proofs_for_spending(
        &self,
        amount: u64,
        mint_filter: Option<&str>,
        held_back: &HashSet<String>,
    ) -> CashuResult<ProofSelection> {
        let view = self.fetch_proofs(false).await?;
        let candidates: Vec<ProofWithOrigin> = match mint_filter {
            Some(mint) => view.proofs_for_mint(mint),
            None => view.proofs,
        }
        .into_iter()
        .filter(|p| !held_back.contains(&p.proof.secret))
        .filter(|p| matches!(parse_secret(&p.proof.secret), Ok(ParsedSecret::Plain(_))))
        .collect();

        select_ascending(&candidates, amount)
    }

    /// Best-effort deletion request for superseded batches
    pub async fn delete_proof_events(&self, event_ids: &[String]) -> bool {
        if event_ids.is_empty() {
            return true;
        }
        match self.store.publish(build_deletion_record(event_ids)).await {
            Ok(id) => {
                log::debug!("Requested deletion of {} batches ({})", event_ids.len(), id);
                true
            }
            Err(e) => {
                log::warn!("Deletion request for {} batches failed: {}", event_ids.len(), e);
                false
            }
        }
    }

    /// Ask the mint for the spend state of `proofs`
    ///
    /// Spent secrets are remembered and dropped from the view.
    pub async fn verify_proofs(&self, mint: &dyn MintClient, proofs: &[Proof]) -> ProofVerification {
        let mut by_y = HashMap::new();
        for proof in proofs {
            match proof.y() {
                Ok(y) => {
                    by_y.insert(y, proof.clone());
                }
                Err(e) => log::warn!("Cannot map proof {} to a point: {}", proof.short_secret(), e),
            }
        }

        let mut states = HashMap::new();
        let ys: Vec<String> = by_y.keys().cloned().collect();
        for chunk in ys.chunks(self.config.max_sync_input_size.max(1)) {
            match mint.check_state(chunk.to_vec()).await {
                Ok(entries) => {
                    for entry in entries {
                        states.insert(entry.y, entry.state);
                    }
                }
                Err(e) => {
                    log::warn!("Proof verification at {} failed: {}", mint.mint_url(), e);
                    return ProofVerification::Unverified {
                        reason: e.to_string(),
                    };
                }
            }
        }

        let (mut unspent, mut pending, mut spent) = (Vec::new(), Vec::new(), Vec::new());
        for (y, proof) in by_y {
            match states.get(&y) {
                Some(MintProofState::Spent) => spent.push(proof),
                Some(MintProofState::Pending) => pending.push(proof),
                Some(MintProofState::Unspent) | None => unspent.push(proof),
            }
        }

        if !spent.is_empty() {
            log::info!("Mint reports {} of {} proofs spent", spent.len(), proofs.len());
            self.record_spent(spent.iter().map(|p| &p.secret));
        }

        ProofVerification::Checked {
            unspent,
            pending,
            spent,
        }
    }

    /// Rewrite every batch that holds a spent secret without it
    ///
    /// Each mint's affected batches are replaced by one batch carrying their
    /// remaining proofs. Returns the number of batches superseded.
    pub async fn remove_spent(&self, spent_secrets: &HashSet<String>) -> CashuResult<usize> {
        if spent_secrets.is_empty() {
            return Ok(0);
        }
        self.record_spent(spent_secrets.iter());

        // Fresh view minus the spent secrets, but with the unfiltered batch membership
        let query = RecordQuery::kinds([KIND_TOKEN, KIND_DELETION]).author(self.store.author());
        let records = self
            .collect_records(query)
            .await
            .map_err(CashuWalletError::from)?;

        let mut deleted = HashSet::new();
        let mut batches = Vec::new();
        for record in &records {
            match record.kind {
                KIND_DELETION => deleted.extend(deletion_targets(record)),
                KIND_TOKEN => {
                    if let Ok(batch) = decrypt_token_record(self.cipher.as_ref(), record).await {
                        batches.push(batch);
                    }
                }
                _ => {}
            }
        }
        let live = reconcile_batches(&batches, &deleted, &HashSet::new());

        // Untagged batches stay untagged so their proofs keep counting for every mint
        let mut affected: BTreeMap<Option<String>, HashSet<String>> = BTreeMap::new();
        for p in live.iter().filter(|p| spent_secrets.contains(&p.proof.secret)) {
            affected
                .entry(p.mint_url.clone())
                .or_default()
                .insert(p.event_id.clone());
        }

        let mut cleaned = 0;
        for (mint, events) in affected {
            let events: Vec<String> = events.into_iter().collect();
            let remaining: Vec<Proof> = live
                .iter()
                .filter(|p| events.contains(&p.event_id) && !spent_secrets.contains(&p.proof.secret))
                .map(|p| p.proof.clone())
                .collect();

            self.publish_batch(&remaining, mint.as_deref(), &events).await?;
            self.delete_proof_events(&events).await;
            cleaned += events.len();
        }

        if cleaned > 0 {
            log::info!("Cleaned {} batches holding spent proofs", cleaned);
        }
        Ok(cleaned)
    }

    // =========================================================================
    // Wallet record and history
    // =========================================================================

    pub async fn load_wallet_record(&self) -> CashuResult<Option<WalletMetadata>> {
        let query = RecordQuery::kinds([KIND_WALLET]).author(self.store.author());
        let records = self.collect_records(query).await?;
        let newest = records.iter().max_by_key(|r| (r.created_at, r.id.clone()));
        match newest {
            Some(record) => Ok(Some(decrypt_wallet_record(self.cipher.as_ref(), record).await?)),
            None => Ok(None),
        }
    }

    pub async fn save_wallet_record(&self, metadata: &WalletMetadata) -> CashuResult<String> {
        let draft = build_wallet_record(self.cipher.as_ref(), metadata).await?;
        self.publish_with_retry(draft, "publish wallet record").await
    }

    /// Best-effort spending-history record
    pub async fn record_history(
        &self,
        direction: TransactionDirection,
        amount: u64,
        created: &[String],
        destroyed: &[String],
    ) {
        let entry = history_entry(direction, amount, created, destroyed);
        let result = match build_history_record(self.cipher.as_ref(), &entry).await {
            Ok(draft) => self.store.publish(draft).await.map_err(CashuWalletError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::warn!("Failed to record {} sat history entry: {}", amount, e);
        }
    }

    /// History entries, newest first
    pub async fn fetch_history(&self) -> CashuResult<Vec<(u64, SpendingHistory)>> {
        let query = RecordQuery::kinds([KIND_HISTORY]).author(self.store.author());
        let records = self.collect_records(query).await?;
        let mut entries = Vec::new();
        for record in &records {
            match decrypt_history_record(self.cipher.as_ref(), record).await {
                Ok(entry) => entries.push((record.created_at, entry)),
                Err(e) => log::warn!("Skipping unreadable history record {}: {}", record.id, e),
            }
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries)
    }
}
