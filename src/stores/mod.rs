// Collaborator boundaries and the wallet built on them

pub mod cashu;
pub mod cashu_memory_db;
pub mod local_store;
pub mod mint_client;
pub mod nostr_client;
pub mod signer;
