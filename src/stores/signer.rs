// Copyright (c) 2025 Patrick Ulrich
// Distributed under the MIT software license

//! Record content encryption
//!
//! Wallet records are encrypted to their owner with NIP-44. The signer that
//! holds the owner's identity key may be local keys or a remote signer, so
//! encryption goes through `NostrSigner` rather than raw key material.

use std::sync::Arc;

use async_trait::async_trait;
use nostr::signer::NostrSigner;
use nostr::{Keys, PublicKey};

use super::cashu::errors::{CashuResult, CashuWalletError};

/// Types of signers supported for record encryption
#[derive(Debug, Clone)]
pub enum SignerType {
    /// Private key signer (nsec)
    Keys(Keys),
    /// Any other signer backend (remote signer, hardware, ...)
    Remote {
        signer: Arc<dyn NostrSigner>,
        public_key: PublicKey,
    },
}

impl SignerType {
    /// Public key of the wallet owner
    pub fn public_key(&self) -> PublicKey {
        match self {
            SignerType::Keys(keys) => keys.public_key(),
            SignerType::Remote { public_key, .. } => *public_key,
        }
    }

    /// Get a reference as Arc<dyn NostrSigner>
    pub fn as_nostr_signer(&self) -> Arc<dyn NostrSigner> {
        match self {
            SignerType::Keys(keys) => Arc::new(keys.clone()),
            SignerType::Remote { signer, .. } => signer.clone(),
        }
    }
}

/// Encrypts record content to the wallet owner
#[async_trait]
pub trait ContentCipher: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> CashuResult<String>;
    async fn decrypt(&self, ciphertext: &str) -> CashuResult<String>;
}

/// NIP-44 self-encryption through a Nostr signer
#[derive(Debug, Clone)]
pub struct Nip44Cipher {
    signer: SignerType,
}

impl Nip44Cipher {
    pub fn new(signer: SignerType) -> Self {
        Self { signer }
    }

    pub fn from_keys(keys: Keys) -> Self {
        Self::new(SignerType::Keys(keys))
    }

    pub fn public_key(&self) -> PublicKey {
        self.signer.public_key()
    }
}

#[async_trait]
impl ContentCipher for Nip44Cipher {
    async fn encrypt(&self, plaintext: &str) -> CashuResult<String> {
        let owner = self.signer.public_key();
        self.signer
            .as_nostr_signer()
            .nip44_encrypt(&owner, plaintext)
            .await
            .map_err(|e| CashuWalletError::Encryption(e.to_string()))
    }

    async fn decrypt(&self, ciphertext: &str) -> CashuResult<String> {
        let owner = self.signer.public_key();
        self.signer
            .as_nostr_signer()
            .nip44_decrypt(&owner, ciphertext)
            .await
            .map_err(|e| CashuWalletError::Decryption(e.to_string()))
    }
}
