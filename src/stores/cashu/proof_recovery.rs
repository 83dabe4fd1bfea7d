//! Operation Journal
//!
//! Intent records written before any mint call that consumes proofs, and the
//! startup scan that classifies whatever a crash or lost response left
//! behind.
//!
//! An entry holds the exact input secrets. It is removed only after the
//! operation's outputs were published or captured by the safety net, so a
//! surviving entry means "the mint may have consumed these inputs and we may
//! not have their replacement".

use std::collections::HashMap;
use std::sync::Arc;

use super::errors::{CashuResult, CashuWalletError};
use super::types::{ConsistencyHazard, OperationKind, OperationStatus, PendingOperation};
use super::utils::{normalize_mint_url, Clock};
use crate::crypto::hash_to_curve;
use crate::stores::local_store::{get_json, list_json, put_json, LocalStore};
use crate::stores::mint_client::{MintClient, MintProofState, MintQuoteState};

const KEY_PREFIX: &str = "pending_op:";

fn key_for(id: &str) -> String {
    format!("{}{}", KEY_PREFIX, id)
}

/// Point a secret maps to, as the mint indexes proof state
fn secret_to_y(secret: &str) -> CashuResult<String> {
    Ok(hex::encode(hash_to_curve(secret.as_bytes())?.serialize()))
}

// =============================================================================
// Scan Report
// =============================================================================

/// Classification of the journal after a scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryScanReport {
    /// Completed at the mint; outputs may need restoring from seed
    pub recovered: Vec<PendingOperation>,
    /// Never took effect, dropped from the journal
    pub failed: Vec<PendingOperation>,
    /// Partially spent inputs, left for manual inspection
    pub ambiguous: Vec<PendingOperation>,
    /// Mint unreachable or the outcome is still in flight
    pub unchecked: Vec<PendingOperation>,
    pub hazards: Vec<ConsistencyHazard>,
}

impl RecoveryScanReport {
    pub fn is_clean(&self) -> bool {
        self.recovered.is_empty() && self.ambiguous.is_empty() && self.unchecked.is_empty()
    }
}

enum ScanVerdict {
    Recovered,
    Failed,
    Ambiguous { spent: usize, unspent: usize },
    Unchecked(String),
}

// =============================================================================
// Journal
// =============================================================================

pub struct OperationJournal {
    local: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
}

impl OperationJournal {
    pub fn new(local: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { local, clock }
    }

    /// Record intent; must succeed before the mint call is made
    pub async fn begin(
        &self,
        kind: OperationKind,
        input_secrets: Vec<String>,
        quote_id: Option<String>,
        mint_url: &str,
    ) -> CashuResult<PendingOperation> {
        let operation = PendingOperation {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            input_secrets,
            quote_id,
            mint_url: normalize_mint_url(mint_url),
            status: OperationStatus::Pending,
            created_at: self.clock.now(),
            note: None,
        };
        put_json(self.local.as_ref(), &key_for(&operation.id), &operation).await?;
        log::debug!(
            "Journaled {:?} operation {} ({} inputs)",
            operation.kind,
            operation.id,
            operation.input_secrets.len()
        );
        Ok(operation)
    }

    /// Drop the entry once outputs are durably recorded
    ///
    /// A failure only leaves a stale entry behind, which the next scan
    /// reports, so it is logged rather than returned.
    pub async fn complete(&self, id: &str) {
        if let Err(e) = self.local.delete(&key_for(id)).await {
            log::warn!("Failed to clear journal entry {}: {}", id, e);
        }
    }

    pub async fn get(&self, id: &str) -> CashuResult<PendingOperation> {
        get_json(self.local.as_ref(), &key_for(id))
            .await?
            .ok_or_else(|| CashuWalletError::OperationNotFound { id: id.to_string() })
    }

    /// Every entry, oldest first
    pub async fn list(&self) -> CashuResult<Vec<PendingOperation>> {
        let mut operations: Vec<PendingOperation> =
            list_json(self.local.as_ref(), KEY_PREFIX).await?;
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(operations)
    }

    /// Remove a recovered entry after the operator dealt with it
    pub async fn dismiss(&self, id: &str) -> CashuResult<()> {
        self.get(id).await?;
        self.local.delete(&key_for(id)).await?;
        Ok(())
    }

    async fn save(&self, operation: &PendingOperation) -> CashuResult<()> {
        put_json(self.local.as_ref(), &key_for(&operation.id), operation).await?;
        Ok(())
    }

    /// Resolve pending entries against their mints
    ///
    /// `mint_for` returns the client for a mint URL, or `None` when no client
    /// can be built for it.
    pub async fn scan<F>(&self, mint_for: F, chunk_size: usize) -> CashuResult<RecoveryScanReport>
    where
        F: Fn(&str) -> Option<Arc<dyn MintClient>>,
    {
        let mut report = RecoveryScanReport::default();

        for mut operation in self.list().await? {
            match operation.status {
                OperationStatus::Recovered => {
                    report.recovered.push(operation);
                    continue;
                }
                // Failed entries are dropped as soon as they are classified
                OperationStatus::Failed => {
                    self.complete(&operation.id).await;
                    continue;
                }
                OperationStatus::Pending => {}
            }

            let verdict = match mint_for(&operation.mint_url) {
                Some(mint) => self.classify(mint.as_ref(), &operation, chunk_size).await,
                None => ScanVerdict::Unchecked(format!("no client for {}", operation.mint_url)),
            };

            match verdict {
                ScanVerdict::Recovered => {
                    log::warn!(
                        "{:?} operation {} completed at the mint but its outputs were not recorded",
                        operation.kind,
                        operation.id
                    );
                    operation.status = OperationStatus::Recovered;
                    operation.note = Some("inputs spent; restore outputs from seed".to_string());
                    self.save(&operation).await?;
                    report.hazards.push(ConsistencyHazard::UnrecordedOutputs {
                        operation_id: operation.id.clone(),
                    });
                    report.recovered.push(operation);
                }
                ScanVerdict::Failed => {
                    log::info!(
                        "{:?} operation {} never took effect, dropping it",
                        operation.kind,
                        operation.id
                    );
                    operation.status = OperationStatus::Failed;
                    self.complete(&operation.id).await;
                    report.failed.push(operation);
                }
                ScanVerdict::Ambiguous { spent, unspent } => {
                    log::error!(
                        "Operation {} is partially spent ({} spent, {} unspent); needs manual inspection",
                        operation.id,
                        spent,
                        unspent
                    );
                    report.hazards.push(ConsistencyHazard::AmbiguousOperation {
                        operation_id: operation.id.clone(),
                        spent,
                        unspent,
                    });
                    report.ambiguous.push(operation);
                }
                ScanVerdict::Unchecked(reason) => {
                    log::warn!("Could not resolve operation {}: {}", operation.id, reason);
                    report.unchecked.push(operation);
                }
            }
        }

        Ok(report)
    }

    async fn classify(
        &self,
        mint: &dyn MintClient,
        operation: &PendingOperation,
        chunk_size: usize,
    ) -> ScanVerdict {
        if operation.kind == OperationKind::Mint {
            let Some(quote_id) = operation.quote_id.as_deref() else {
                return ScanVerdict::Failed;
            };
            return match mint.mint_quote_status(quote_id).await {
                Ok(quote) => match quote.state {
                    MintQuoteState::Issued => ScanVerdict::Recovered,
                    MintQuoteState::Unpaid => ScanVerdict::Failed,
                    MintQuoteState::Paid => {
                        ScanVerdict::Unchecked("quote paid but not issued; retry the deposit".into())
                    }
                },
                Err(e) => ScanVerdict::Unchecked(e.to_string()),
            };
        }

        let mut ys = Vec::with_capacity(operation.input_secrets.len());
        for secret in &operation.input_secrets {
            match secret_to_y(secret) {
                Ok(y) => ys.push(y),
                Err(e) => return ScanVerdict::Unchecked(e.to_string()),
            }
        }
        if ys.is_empty() {
            return ScanVerdict::Failed;
        }

        let mut states = HashMap::new();
        for chunk in ys.chunks(chunk_size.max(1)) {
            match mint.check_state(chunk.to_vec()).await {
                Ok(entries) => {
                    for entry in entries {
                        states.insert(entry.y, entry.state);
                    }
                }
                Err(e) => return ScanVerdict::Unchecked(e.to_string()),
            }
        }

        let (mut spent, mut unspent, mut pending) = (0, 0, 0);
        for y in &ys {
            match states.get(y) {
                Some(MintProofState::Spent) => spent += 1,
                Some(MintProofState::Pending) => pending += 1,
                Some(MintProofState::Unspent) | None => unspent += 1,
            }
        }

        if pending > 0 {
            ScanVerdict::Unchecked(format!("{} inputs still pending at the mint", pending))
        } else if unspent == 0 {
            ScanVerdict::Recovered
        } else if spent == 0 {
            ScanVerdict::Failed
        } else {
            ScanVerdict::Ambiguous { spent, unspent }
        }
    }
}
