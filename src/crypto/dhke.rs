//! Blind Diffie-Hellman key exchange (NUT-00)
//!
//! The wallet maps a secret to a curve point `Y`, blinds it as `B_ = Y + r·G`,
//! the mint answers with `C_ = k·B_`, and the wallet unblinds
//! `C = C_ - r·K`. The mint later verifies `C == k·Y` without ever having
//! seen `Y`.

use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};

use super::{generate_secret_key, sha256, CryptoError};

const DOMAIN_SEPARATOR: &[u8] = b"Secp256k1_HashToCurve_Cashu_";

/// Deterministically map a message to a point on secp256k1
///
/// `msg_hash = SHA256(DOMAIN_SEPARATOR || message)`, then for a little-endian
/// u32 counter the candidate `0x02 || SHA256(msg_hash || counter)` is tried
/// until it parses as a valid compressed point.
pub fn hash_to_curve(message: &[u8]) -> Result<PublicKey, CryptoError> {
    let mut preimage = Vec::with_capacity(DOMAIN_SEPARATOR.len() + message.len());
    preimage.extend_from_slice(DOMAIN_SEPARATOR);
    preimage.extend_from_slice(message);
    let msg_hash = sha256(&preimage);

    let mut buf = [0u8; 36];
    buf[..32].copy_from_slice(&msg_hash);
    let mut candidate = [0u8; 33];
    candidate[0] = 0x02;

    for counter in 0..=u32::MAX {
        buf[32..].copy_from_slice(&counter.to_le_bytes());
        candidate[1..].copy_from_slice(&sha256(&buf));
        if let Ok(point) = PublicKey::from_slice(&candidate) {
            return Ok(point);
        }
    }

    Err(CryptoError::NoValidPoint)
}

/// Random blinding factor `r`
pub fn generate_blinding_factor() -> SecretKey {
    generate_secret_key()
}

/// `B_ = Y + r·G`
pub fn blind_message(y: &PublicKey, r: &SecretKey) -> Result<PublicKey, CryptoError> {
    let r_g = PublicKey::from_secret_key(SECP256K1, r);
    Ok(y.combine(&r_g)?)
}

/// `C = C_ - r·K`
pub fn unblind_signature(
    blinded_signature: &PublicKey,
    r: &SecretKey,
    mint_key: &PublicKey,
) -> Result<PublicKey, CryptoError> {
    let r_k = mint_key.mul_tweak(SECP256K1, &Scalar::from(*r))?;
    Ok(blinded_signature.combine(&r_k.negate(SECP256K1))?)
}

/// Mint side: `C_ = k·B_`
pub fn sign_blinded(mint_secret: &SecretKey, blinded: &PublicKey) -> Result<PublicKey, CryptoError> {
    Ok(blinded.mul_tweak(SECP256K1, &Scalar::from(*mint_secret))?)
}

/// Mint side: check `C == k·hash_to_curve(secret)`
pub fn verify_unblinded(
    mint_secret: &SecretKey,
    secret: &[u8],
    signature: &PublicKey,
) -> Result<bool, CryptoError> {
    let y = hash_to_curve(secret)?;
    let expected = y.mul_tweak(SECP256K1, &Scalar::from(*mint_secret))?;
    Ok(&expected == signature)
}
