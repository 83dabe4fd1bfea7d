//! Broadcast store boundary
//!
//! The wallet's replicated state lives in signed records on Nostr relays. The
//! core only needs three things from that transport: publish a record, query
//! records with a filter (streamed, with an end-of-stored-records signal),
//! and know whose records it is reading. [`NostrBroadcastStore`] provides
//! them over `nostr-sdk`; `MemoryBroadcastStore` is the in-memory double.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use nostr_sdk::{Client, EventBuilder, Filter, Kind, PublicKey, Tag, Timestamp};
use thiserror::Error;

/// Store-level failure, classified by the recovery it implies
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Network failure or timeout; retrying may help
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// The store refused the request; retrying the same request will not help
    #[error("rejected: {0}")]
    Rejected(String),
}

/// A record as stored on the broadcast network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecord {
    pub id: String,
    pub kind: u16,
    pub author: String,
    pub created_at: u64,
    pub content: String,
    pub tags: Vec<Vec<String>>,
}

impl StoreRecord {
    /// Values of every tag whose first element is `name`
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(|n| n == name).unwrap_or(false))
            .filter_map(|t| t.get(1).map(|v| v.as_str()))
    }
}

/// An unsigned record ready for publication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDraft {
    pub kind: u16,
    pub content: String,
    pub tags: Vec<Vec<String>>,
}

impl RecordDraft {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
        }
    }

    pub fn tag<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(values.into_iter().map(Into::into).collect());
        self
    }
}

/// Record filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub kinds: Vec<u16>,
    pub author: Option<String>,
    pub since: Option<u64>,
}

impl RecordQuery {
    pub fn kinds(kinds: impl IntoIterator<Item = u16>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Whether a record satisfies this filter
    pub fn matches(&self, record: &StoreRecord) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&record.kind))
            && self.author.as_ref().map(|a| a == &record.author).unwrap_or(true)
            && self.since.map(|s| record.created_at >= s).unwrap_or(true)
    }
}

/// One message of a streamed query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMessage {
    Record(StoreRecord),
    /// Every record the store currently holds for the query has been delivered
    EndOfStoredRecords,
}

/// Streamed query results; dropping the stream closes the subscription
pub type RecordStream = BoxStream<'static, StoreMessage>;

/// Replicated record store consumed by the ledger
#[async_trait]
pub trait BroadcastStore: Send + Sync {
    /// Hex public key the store signs records with
    fn author(&self) -> String;

    /// Publish a record, returning its id
    async fn publish(&self, draft: RecordDraft) -> Result<String, StoreError>;

    /// Start a streamed query
    async fn query(&self, query: RecordQuery) -> Result<RecordStream, StoreError>;
}

// =============================================================================
// nostr-sdk adapter
// =============================================================================

/// Production adapter over a connected `nostr_sdk::Client` with a signer set
#[derive(Clone)]
pub struct NostrBroadcastStore {
    client: Client,
    author: PublicKey,
    fetch_timeout: Duration,
}

impl NostrBroadcastStore {
    pub fn new(client: Client, author: PublicKey, fetch_timeout: Duration) -> Self {
        Self {
            client,
            author,
            fetch_timeout,
        }
    }

    fn build_filter(&self, query: &RecordQuery) -> Result<Filter, StoreError> {
        let mut filter = Filter::new().kinds(query.kinds.iter().map(|k| Kind::from(*k)));
        if let Some(author) = &query.author {
            let pubkey = PublicKey::parse(author)
                .map_err(|e| StoreError::Rejected(format!("invalid author {}: {}", author, e)))?;
            filter = filter.author(pubkey);
        }
        if let Some(since) = query.since {
            filter = filter.since(Timestamp::from(since));
        }
        Ok(filter)
    }
}

/// Machine-readable prefixes of relay `OK false` refusals (NIP-01)
const REFUSAL_PREFIXES: &[&str] = &["blocked:", "invalid:", "pow:", "restricted:", "error:"];

/// Classify the per-relay failures of a publish no relay accepted
///
/// Only when every relay refused the record outright is it `Rejected`.
/// Anything else, including no relay answering at all, may pass on retry.
fn classify_publish_failures<'a>(failures: impl IntoIterator<Item = &'a str>) -> StoreError {
    let failures: Vec<&str> = failures.into_iter().collect();
    if failures.is_empty() {
        return StoreError::Unreachable("no relay acknowledged the record".to_string());
    }

    let refused = failures
        .iter()
        .all(|message| REFUSAL_PREFIXES.iter().any(|prefix| message.contains(prefix)));
    let summary = failures.join("; ");
    if refused {
        StoreError::Rejected(summary)
    } else {
        StoreError::Unreachable(summary)
    }
}

#[async_trait]
impl BroadcastStore for NostrBroadcastStore {
    fn author(&self) -> String {
        self.author.to_hex()
    }

    async fn publish(&self, draft: RecordDraft) -> Result<String, StoreError> {
        let tags = draft
            .tags
            .into_iter()
            .map(Tag::parse)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Rejected(format!("invalid tag: {}", e)))?;

        let builder = EventBuilder::new(Kind::from(draft.kind), draft.content).tags(tags);

        match self.client.send_event_builder(builder).await {
            Ok(output) if output.success.is_empty() => {
                let error = classify_publish_failures(output.failed.values().map(String::as_str));
                log::warn!("No relay accepted kind {} record: {}", draft.kind, error);
                Err(error)
            }
            Ok(output) => {
                let id = output.id().to_hex();
                log::debug!(
                    "Published kind {} record {} to {} relays ({} failed)",
                    draft.kind,
                    id,
                    output.success.len(),
                    output.failed.len()
                );
                Ok(id)
            }
            Err(e) => Err(StoreError::Unreachable(e.to_string())),
        }
    }

    async fn query(&self, query: RecordQuery) -> Result<RecordStream, StoreError> {
        let filter = self.build_filter(&query)?;

        // fetch_events already waits for EOSE from the connected relays (or the timeout)
        let events = self
            .client
            .fetch_events(filter, self.fetch_timeout)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        let records: Vec<StoreMessage> = events
            .into_iter()
            .map(|event| {
                StoreMessage::Record(StoreRecord {
                    id: event.id.to_hex(),
                    kind: event.kind.as_u16(),
                    author: event.pubkey.to_hex(),
                    created_at: event.created_at.as_secs(),
                    content: event.content.clone(),
                    tags: event.tags.iter().map(|t| t.as_slice().to_vec()).collect(),
                })
            })
            .collect();

        Ok(stream::iter(records)
            .chain(stream::once(async { StoreMessage::EndOfStoredRecords }))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: u16, author: &str, created_at: u64) -> StoreRecord {
        StoreRecord {
            id: format!("{}-{}", kind, created_at),
            kind,
            author: author.to_string(),
            created_at,
            content: String::new(),
            tags: vec![
                vec!["e".into(), "abc".into()],
                vec!["k".into(), "7375".into()],
                vec!["e".into(), "def".into()],
            ],
        }
    }

    #[test]
    fn test_query_matches() {
        let query = RecordQuery::kinds([7375]).author("alice").since(100);
        assert!(query.matches(&record(7375, "alice", 100)));
        assert!(!query.matches(&record(7375, "alice", 99)));
        assert!(!query.matches(&record(7375, "bob", 150)));
        assert!(!query.matches(&record(5, "alice", 150)));
        assert!(RecordQuery::default().matches(&record(5, "bob", 0)));
    }

    #[test]
    fn test_tag_values() {
        let r = record(5, "alice", 1);
        let ids: Vec<&str> = r.tag_values("e").collect();
        assert_eq!(ids, vec!["abc", "def"]);
        assert_eq!(r.tag_values("k").collect::<Vec<_>>(), vec!["7375"]);
        assert_eq!(r.tag_values("p").count(), 0);
    }

    #[test]
    fn test_publish_failure_classification() {
        assert!(matches!(
            classify_publish_failures(["blocked: not on whitelist", "invalid: bad signature"]),
            StoreError::Rejected(_)
        ));
        assert!(matches!(
            classify_publish_failures(["blocked: spam", "relay not connected"]),
            StoreError::Unreachable(_)
        ));
        assert!(matches!(
            classify_publish_failures(["rate-limited: slow down"]),
            StoreError::Unreachable(_)
        ));
        assert!(matches!(
            classify_publish_failures(Vec::<&str>::new()),
            StoreError::Unreachable(_)
        ));
    }

    #[test]
    fn test_draft_builder() {
        let draft = RecordDraft::new(5, "cleanup").tag(["e", "abc"]).tag(["k", "7375"]);
        assert_eq!(draft.tags.len(), 2);
        assert_eq!(draft.tags[1], vec!["k".to_string(), "7375".to_string()]);
    }
}
