/// In-memory doubles for the broadcast store and local persistence
///
/// Hold all data in memory without persistence. The broadcast double behaves
/// like a single well-behaved relay (ids, increasing timestamps, honored
/// deletion requests, replaceable records) and can be told to misbehave.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::RwLock;

use super::cashu::events::KIND_DELETION;
use super::cashu::utils::now_secs;
use super::local_store::{LocalStore, LocalStoreError};
use super::nostr_client::{
    BroadcastStore, RecordDraft, RecordQuery, RecordStream, StoreError, StoreMessage, StoreRecord,
};
use crate::crypto::sha256;

#[derive(Debug, Clone)]
pub struct MemoryBroadcastStore {
    author: String,
    records: Arc<RwLock<Vec<StoreRecord>>>,
    last_created_at: Arc<AtomicU64>,
    unreachable: Arc<AtomicBool>,
    failing_publishes: Arc<AtomicU32>,
    withhold_eose: Arc<AtomicBool>,
    ignore_deletions: Arc<AtomicBool>,
    publish_attempts: Arc<AtomicU32>,
}

impl MemoryBroadcastStore {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            records: Arc::new(RwLock::new(Vec::new())),
            last_created_at: Arc::new(AtomicU64::new(0)),
            unreachable: Arc::new(AtomicBool::new(false)),
            failing_publishes: Arc::new(AtomicU32::new(0)),
            withhold_eose: Arc::new(AtomicBool::new(false)),
            ignore_deletions: Arc::new(AtomicBool::new(false)),
            publish_attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fail every publish and query
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes as unreachable
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Never send end-of-stored-records; queries only end by timeout
    pub fn set_withhold_eose(&self, withhold: bool) {
        self.withhold_eose.store(withhold, Ordering::SeqCst);
    }

    /// Keep records targeted by deletion requests
    pub fn set_ignore_deletions(&self, ignore: bool) {
        self.ignore_deletions.store(ignore, Ordering::SeqCst);
    }

    pub fn publish_attempts(&self) -> u32 {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    /// Stored records of one kind, oldest first
    pub async fn records_of_kind(&self, kind: u16) -> Vec<StoreRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Insert a record as-is, bypassing id and timestamp assignment
    pub async fn insert_raw(&self, record: StoreRecord) {
        self.records.write().await.push(record);
    }

    fn next_created_at(&self) -> u64 {
        let now = now_secs();
        let mut current = self.last_created_at.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self.last_created_at.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

fn is_replaceable(kind: u16) -> bool {
    (10_000..20_000).contains(&kind)
}

#[async_trait]
impl BroadcastStore for MemoryBroadcastStore {
    fn author(&self) -> String {
        self.author.clone()
    }

    async fn publish(&self, draft: RecordDraft) -> Result<String, StoreError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("memory store offline".to_string()));
        }
        let failing = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Unreachable("injected publish failure".to_string()));
        }

        let created_at = self.next_created_at();
        let tags_json = serde_json::to_string(&draft.tags)
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        let id = hex::encode(sha256(
            format!(
                "{}:{}:{}:{}:{}",
                self.author, draft.kind, created_at, tags_json, draft.content
            )
            .as_bytes(),
        ));

        let record = StoreRecord {
            id: id.clone(),
            kind: draft.kind,
            author: self.author.clone(),
            created_at,
            content: draft.content,
            tags: draft.tags,
        };

        let mut records = self.records.write().await;
        if record.kind == KIND_DELETION && !self.ignore_deletions.load(Ordering::SeqCst) {
            let targets: HashSet<&str> = record.tag_values("e").collect();
            records.retain(|r| !(r.author == record.author && targets.contains(r.id.as_str())));
        }
        if is_replaceable(record.kind) {
            records.retain(|r| !(r.kind == record.kind && r.author == record.author));
        }
        records.push(record);

        Ok(id)
    }

    async fn query(&self, query: RecordQuery) -> Result<RecordStream, StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("memory store offline".to_string()));
        }

        let matching: Vec<StoreMessage> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .map(StoreMessage::Record)
            .collect();

        let records = stream::iter(matching);
        if self.withhold_eose.load(Ordering::SeqCst) {
            Ok(records.chain(stream::pending()).boxed())
        } else {
            Ok(records
                .chain(stream::once(async { StoreMessage::EndOfStoredRecords }))
                .boxed())
        }
    }
}

// =============================================================================
// Local store double
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemoryLocalStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    fn check_writable(&self) -> Result<(), LocalStoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(LocalStoreError::Io("injected local store failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), LocalStoreError> {
        self.check_writable()?;
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LocalStoreError> {
        self.check_writable()?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, LocalStoreError> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(stream: RecordStream) -> Vec<StoreMessage> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_publish_assigns_ids_and_increasing_timestamps() {
        let store = MemoryBroadcastStore::new("alice");
        let a = store.publish(RecordDraft::new(7375, "a")).await.unwrap();
        let b = store.publish(RecordDraft::new(7375, "a")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);

        let records = store.records_of_kind(7375).await;
        assert!(records[1].created_at > records[0].created_at);
    }

    #[tokio::test]
    async fn test_query_ends_with_eose() {
        let store = MemoryBroadcastStore::new("alice");
        store.publish(RecordDraft::new(7375, "a")).await.unwrap();
        store.publish(RecordDraft::new(1, "note")).await.unwrap();

        let messages = drain(store.query(RecordQuery::kinds([7375])).await.unwrap()).await;
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], StoreMessage::Record(_)));
        assert_eq!(messages[1], StoreMessage::EndOfStoredRecords);
    }

    #[tokio::test]
    async fn test_deletion_and_replaceable_records() {
        let store = MemoryBroadcastStore::new("alice");
        let a = store.publish(RecordDraft::new(7375, "a")).await.unwrap();
        store
            .publish(RecordDraft::new(KIND_DELETION, "").tag(["e", a.as_str()]))
            .await
            .unwrap();
        assert!(store.records_of_kind(7375).await.is_empty());

        store.publish(RecordDraft::new(17375, "v1")).await.unwrap();
        store.publish(RecordDraft::new(17375, "v2")).await.unwrap();
        let wallets = store.records_of_kind(17375).await;
        assert_eq!(wallets.len(), 1);
        assert_eq!(wallets[0].content, "v2");

        store.set_ignore_deletions(true);
        let b = store.publish(RecordDraft::new(7375, "b")).await.unwrap();
        store
            .publish(RecordDraft::new(KIND_DELETION, "").tag(["e", b.as_str()]))
            .await
            .unwrap();
        assert_eq!(store.records_of_kind(7375).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryBroadcastStore::new("alice");
        store.fail_next_publishes(2);
        assert!(store.publish(RecordDraft::new(7375, "a")).await.is_err());
        assert!(store.publish(RecordDraft::new(7375, "a")).await.is_err());
        assert!(store.publish(RecordDraft::new(7375, "a")).await.is_ok());
        assert_eq!(store.publish_attempts(), 3);

        store.set_unreachable(true);
        assert!(matches!(
            store.query(RecordQuery::kinds([7375])).await,
            Err(StoreError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_local_store_prefix_listing() {
        let store = MemoryLocalStore::new();
        store.put("htlc:1", "a".into()).await.unwrap();
        store.put("htlc:2", "b".into()).await.unwrap();
        store.put("pending_op:1", "c".into()).await.unwrap();

        let listed = store.list("htlc:").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "htlc:1");

        store.delete("htlc:1").await.unwrap();
        assert_eq!(store.get("htlc:1").await.unwrap(), None);

        store.set_failing(true);
        assert!(store.put("x", "y".into()).await.is_err());
        assert_eq!(store.len().await, 2);
    }
}
