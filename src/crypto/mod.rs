//! Cryptographic primitives for Cashu ecash
//!
//! Pure functions with no I/O: blind Diffie-Hellman key exchange (NUT-00),
//! deterministic secret derivation (NUT-13), BIP-39 seeds, HMAC and BIP-340
//! Schnorr helpers used by spending-condition witnesses.

pub mod derivation;
pub mod dhke;

use hmac::{Hmac, Mac};
use secp256k1::{schnorr, Keypair, Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use thiserror::Error;

pub use derivation::{
    derive_secrets, generate_mnemonic, mnemonic_to_seed, validate_mnemonic, DerivedSecret,
};
pub use dhke::{
    blind_message, generate_blinding_factor, hash_to_curve, sign_blinded, unblind_signature,
    verify_unblinded,
};

type HmacSha256 = Hmac<Sha256>;

/// Errors raised by the crypto primitives
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid curve point: {0}")]
    InvalidPoint(String),
    #[error("invalid scalar: {0}")]
    InvalidScalar(String),
    #[error("invalid keyset id: {0}")]
    InvalidKeysetId(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("key derivation failed: {0}")]
    Derivation(String),
    #[error("hash to curve exhausted its counter space")]
    NoValidPoint,
}

impl From<secp256k1::Error> for CryptoError {
    fn from(e: secp256k1::Error) -> Self {
        CryptoError::InvalidPoint(e.to_string())
    }
}

/// SHA-256 of arbitrary bytes
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// HMAC-SHA256 (RFC 2104)
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length, so construction cannot fail
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any size"),
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Parse a hex-encoded secret key
pub fn secret_key_from_hex(hex_str: &str) -> Result<SecretKey, CryptoError> {
    SecretKey::from_str(hex_str).map_err(|e| CryptoError::InvalidScalar(e.to_string()))
}

/// Parse a hex-encoded compressed public key
pub fn public_key_from_hex(hex_str: &str) -> Result<PublicKey, CryptoError> {
    PublicKey::from_str(hex_str).map_err(|e| CryptoError::InvalidPoint(e.to_string()))
}

/// Generate a fresh random secret key
pub fn generate_secret_key() -> SecretKey {
    loop {
        let bytes: [u8; 32] = rand::random();
        if let Ok(key) = SecretKey::from_slice(&bytes) {
            return key;
        }
    }
}

/// Sign `SHA256(message)` with BIP-340 Schnorr, returning the hex signature
pub fn sign_message(secret_key: &SecretKey, message: &[u8]) -> String {
    let keypair = Keypair::from_secret_key(SECP256K1, secret_key);
    let msg = Message::from_digest(sha256(message));
    let aux: [u8; 32] = rand::random();
    SECP256K1
        .sign_schnorr_with_aux_rand(&msg, &keypair, &aux)
        .to_string()
}

/// Verify a hex Schnorr signature over `SHA256(message)` against a compressed key
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), CryptoError> {
    let signature = schnorr::Signature::from_str(signature_hex)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let msg = Message::from_digest(sha256(message));
    let (xonly, _parity) = public_key.x_only_public_key();
    SECP256K1
        .verify_schnorr(&signature, &msg, &xonly)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sha256_rfc4231_case_1() {
        let key = [0x0bu8; 20];
        let mac = hmac_sha256(&key, b"Hi There");
        assert_eq!(
            hex::encode(mac),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case_2() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_schnorr_sign_and_verify() {
        let key = generate_secret_key();
        let public = PublicKey::from_secret_key(SECP256K1, &key);
        let sig = sign_message(&key, b"[\"HTLC\",{}]");

        assert!(verify_signature(&public, b"[\"HTLC\",{}]", &sig).is_ok());
        assert!(verify_signature(&public, b"tampered", &sig).is_err());

        let other = PublicKey::from_secret_key(SECP256K1, &generate_secret_key());
        assert!(verify_signature(&other, b"[\"HTLC\",{}]", &sig).is_err());
    }

    #[test]
    fn test_key_hex_parsing() {
        assert!(secret_key_from_hex("zz").is_err());
        assert!(public_key_from_hex("02abcd").is_err());
        let key = generate_secret_key();
        let parsed = secret_key_from_hex(&hex::encode(key.secret_bytes())).unwrap();
        assert_eq!(parsed, key);
    }
}
