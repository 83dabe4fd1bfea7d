//! NIP-60 Record Handling
//!
//! Building and decoding the wallet's records on the broadcast store:
//! proof batches (kind 7375), the wallet record (kind 17375), spending
//! history (kind 7376) and deletion requests (kind 5). Content is always
//! encrypted to the wallet owner.

use nostr::nips::nip60::{SpendingHistory, TransactionDirection};
use nostr_sdk::EventId;

use super::errors::{CashuResult, CashuWalletError};
use super::types::{ProofBatch, TokenEventData, WalletMetadata};
use crate::stores::nostr_client::{RecordDraft, StoreRecord};
use crate::stores::signer::ContentCipher;

pub const KIND_DELETION: u16 = 5;
pub const KIND_TOKEN: u16 = 7375;
pub const KIND_HISTORY: u16 = 7376;
pub const KIND_WALLET: u16 = 17375;

// =============================================================================
// Proof Batches (kind 7375)
// =============================================================================

/// Encrypt a batch into a publishable record
pub async fn build_token_record(
    cipher: &dyn ContentCipher,
    data: &TokenEventData,
) -> CashuResult<RecordDraft> {
    let json = serde_json::to_string(data)?;
    let encrypted = cipher.encrypt(&json).await?;
    Ok(RecordDraft::new(KIND_TOKEN, encrypted))
}

/// Decrypt and parse a stored proof batch
pub async fn decrypt_token_record(
    cipher: &dyn ContentCipher,
    record: &StoreRecord,
) -> CashuResult<ProofBatch> {
    if record.kind != KIND_TOKEN {
        return Err(CashuWalletError::Serialization(format!(
            "record {} is kind {}, expected {}",
            record.id, record.kind, KIND_TOKEN
        )));
    }
    let decrypted = cipher.decrypt(&record.content).await?;
    let data: TokenEventData = serde_json::from_str(&decrypted).map_err(|e| {
        CashuWalletError::Serialization(format!("invalid token record {}: {}", record.id, e))
    })?;
    Ok(ProofBatch {
        event_id: record.id.clone(),
        created_at: record.created_at,
        data,
    })
}

// =============================================================================
// Deletion Requests (kind 5)
// =============================================================================

/// Deletion request for proof batch records
pub fn build_deletion_record(event_ids: &[String]) -> RecordDraft {
    let draft = event_ids
        .iter()
        .fold(RecordDraft::new(KIND_DELETION, "proofs spent"), |draft, id| {
            draft.tag(["e", id.as_str()])
        });
    draft.tag(["k".to_string(), KIND_TOKEN.to_string()])
}

/// Event IDs a deletion request targets, if it applies to proof batches
///
/// Requests that carry `k` tags for other kinds only are ignored.
pub fn deletion_targets(record: &StoreRecord) -> Vec<String> {
    if record.kind != KIND_DELETION {
        return Vec::new();
    }
    let token_kind = KIND_TOKEN.to_string();
    let mut kinds = record.tag_values("k").peekable();
    if kinds.peek().is_some() && !kinds.any(|k| k == token_kind) {
        return Vec::new();
    }
    record.tag_values("e").map(str::to_string).collect()
}

// =============================================================================
// Wallet Record (kind 17375)
// =============================================================================

pub async fn build_wallet_record(
    cipher: &dyn ContentCipher,
    metadata: &WalletMetadata,
) -> CashuResult<RecordDraft> {
    let json = serde_json::to_string(&metadata.to_tags())?;
    let encrypted = cipher.encrypt(&json).await?;
    Ok(RecordDraft::new(KIND_WALLET, encrypted))
}

pub async fn decrypt_wallet_record(
    cipher: &dyn ContentCipher,
    record: &StoreRecord,
) -> CashuResult<WalletMetadata> {
    let decrypted = cipher.decrypt(&record.content).await?;
    let tags: Vec<Vec<String>> = serde_json::from_str(&decrypted)
        .map_err(|e| CashuWalletError::Serialization(format!("invalid wallet record: {}", e)))?;
    WalletMetadata::from_tags(&tags)
}

// =============================================================================
// Spending History (kind 7376)
// =============================================================================

/// History entry for a settled value movement
pub fn history_entry(
    direction: TransactionDirection,
    amount: u64,
    created: &[String],
    destroyed: &[String],
) -> SpendingHistory {
    let mut history = SpendingHistory::new(direction, amount);
    for id in created {
        match EventId::from_hex(id) {
            Ok(event_id) => history = history.add_created(event_id),
            Err(_) => log::warn!("Skipping invalid created record id: {}", id),
        }
    }
    for id in destroyed {
        match EventId::from_hex(id) {
            Ok(event_id) => history = history.add_destroyed(event_id),
            Err(_) => log::warn!("Skipping invalid destroyed record id: {}", id),
        }
    }
    history
}

pub async fn build_history_record(
    cipher: &dyn ContentCipher,
    history: &SpendingHistory,
) -> CashuResult<RecordDraft> {
    let mut content: Vec<Vec<String>> = vec![
        vec!["direction".to_string(), history.direction.to_string()],
        vec!["amount".to_string(), history.amount.to_string()],
        vec!["unit".to_string(), "sat".to_string()],
    ];
    for event_id in &history.created {
        content.push(marker_tag(event_id, "created"));
    }
    for event_id in &history.destroyed {
        content.push(marker_tag(event_id, "destroyed"));
    }

    let json = serde_json::to_string(&content)?;
    let encrypted = cipher.encrypt(&json).await?;
    Ok(RecordDraft::new(KIND_HISTORY, encrypted))
}

fn marker_tag(event_id: &EventId, marker: &str) -> Vec<String> {
    vec![
        "e".to_string(),
        event_id.to_hex(),
        String::new(),
        marker.to_string(),
    ]
}

pub async fn decrypt_history_record(
    cipher: &dyn ContentCipher,
    record: &StoreRecord,
) -> CashuResult<SpendingHistory> {
    let decrypted = cipher.decrypt(&record.content).await?;
    let tags: Vec<Vec<String>> = serde_json::from_str(&decrypted)
        .map_err(|e| CashuWalletError::Serialization(format!("invalid history record: {}", e)))?;

    let mut direction = None;
    let mut amount = None;
    let mut created = Vec::new();
    let mut destroyed = Vec::new();

    for tag in &tags {
        match (tag.first().map(String::as_str), tag.get(1)) {
            (Some("direction"), Some(d)) => {
                direction = match d.as_str() {
                    "in" => Some(TransactionDirection::In),
                    "out" => Some(TransactionDirection::Out),
                    _ => None,
                }
            }
            (Some("amount"), Some(a)) => amount = a.parse::<u64>().ok(),
            (Some("e"), Some(id)) => match tag.get(3).map(String::as_str) {
                Some("created") => created.push(id.clone()),
                Some("destroyed") => destroyed.push(id.clone()),
                _ => {}
            },
            _ => {}
        }
    }

    match (direction, amount) {
        (Some(direction), Some(amount)) => {
            Ok(history_entry(direction, amount, &created, &destroyed))
        }
        _ => Err(CashuWalletError::Serialization(format!(
            "history record {} missing direction or amount",
            record.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::cashu::types::Proof;
    use crate::stores::signer::Nip44Cipher;
    use nostr_sdk::Keys;

    fn stored(draft: RecordDraft, id: &str, created_at: u64) -> StoreRecord {
        StoreRecord {
            id: id.to_string(),
            kind: draft.kind,
            author: "owner".to_string(),
            created_at,
            content: draft.content,
            tags: draft.tags,
        }
    }

    fn sample_id(n: u8) -> String {
        hex::encode([n; 32])
    }

    #[tokio::test]
    async fn test_token_record_round_trip_is_encrypted() {
        let cipher = Nip44Cipher::from_keys(Keys::generate());
        let data = TokenEventData {
            mint: Some("https://mint.example.com".into()),
            unit: "sat".into(),
            proofs: vec![Proof {
                amount: 8,
                keyset_id: "009a1f293253e41e".into(),
                secret: "s1".into(),
                c: "02aa".into(),
                witness: None,
            }],
            del: vec![sample_id(1)],
        };

        let draft = build_token_record(&cipher, &data).await.unwrap();
        assert_eq!(draft.kind, KIND_TOKEN);
        assert!(!draft.content.contains("s1"));

        let batch = decrypt_token_record(&cipher, &stored(draft, "ev1", 42)).await.unwrap();
        assert_eq!(batch.event_id, "ev1");
        assert_eq!(batch.created_at, 42);
        assert_eq!(batch.data, data);
    }

    #[tokio::test]
    async fn test_token_record_from_other_key_fails() {
        let cipher = Nip44Cipher::from_keys(Keys::generate());
        let other = Nip44Cipher::from_keys(Keys::generate());
        let data = TokenEventData {
            mint: None,
            unit: "sat".into(),
            proofs: vec![],
            del: vec![],
        };
        let draft = build_token_record(&other, &data).await.unwrap();
        assert!(decrypt_token_record(&cipher, &stored(draft, "ev", 1)).await.is_err());
    }

    #[test]
    fn test_deletion_record_tags() {
        let ids = vec![sample_id(1), sample_id(2)];
        let draft = build_deletion_record(&ids);
        assert_eq!(draft.kind, KIND_DELETION);
        assert_eq!(draft.tags.len(), 3);
        assert_eq!(draft.tags[2], vec!["k".to_string(), "7375".to_string()]);

        let record = stored(draft, "del", 5);
        assert_eq!(deletion_targets(&record), ids);
    }

    #[test]
    fn test_deletion_targets_ignore_other_kinds() {
        let record = StoreRecord {
            id: "d".into(),
            kind: KIND_DELETION,
            author: "owner".into(),
            created_at: 1,
            content: String::new(),
            tags: vec![
                vec!["e".into(), sample_id(3)],
                vec!["k".into(), "1".into()],
            ],
        };
        assert!(deletion_targets(&record).is_empty());

        let untyped = StoreRecord {
            tags: vec![vec!["e".into(), sample_id(3)]],
            ..record
        };
        assert_eq!(deletion_targets(&untyped), vec![sample_id(3)]);
    }

    #[tokio::test]
    async fn test_wallet_record_round_trip() {
        let cipher = Nip44Cipher::from_keys(Keys::generate());
        let mut metadata = WalletMetadata {
            mint_url: "https://mint.example.com".into(),
            wallet_key: "22".repeat(32),
            mnemonic: "abandon abandon about".into(),
            counters: Default::default(),
        };
        metadata.counters.insert("009a1f293253e41e".into(), 7);

        let draft = build_wallet_record(&cipher, &metadata).await.unwrap();
        assert_eq!(draft.kind, KIND_WALLET);
        assert!(!draft.content.contains("abandon"));

        let decoded = decrypt_wallet_record(&cipher, &stored(draft, "w", 1)).await.unwrap();
        assert_eq!(decoded, metadata);
    }

    #[tokio::test]
    async fn test_history_record_round_trip() {
        let cipher = Nip44Cipher::from_keys(Keys::generate());
        let history = history_entry(
            TransactionDirection::Out,
            50,
            &[sample_id(4)],
            &[sample_id(5), "not-an-id".to_string()],
        );
        assert_eq!(history.destroyed.len(), 1);

        let draft = build_history_record(&cipher, &history).await.unwrap();
        let decoded = decrypt_history_record(&cipher, &stored(draft, "h", 1)).await.unwrap();
        assert_eq!(decoded.amount, 50);
        assert_eq!(decoded.direction.to_string(), "out");
        assert_eq!(decoded.created.len(), 1);
        assert_eq!(decoded.destroyed.len(), 1);
    }
}
