//! Deterministic secret derivation (NUT-13) and BIP-39 seeds
//!
//! Every blinded output the wallet creates draws its secret and blinding
//! factor from `(seed, keyset_id, counter)`, so a wallet restored from its
//! mnemonic can ask the mint to re-sign the same blinded messages.
//!
//! Keyset ids prefixed `00` use the BIP32 path
//! `m/129372'/0'/{keyset_int}'/{counter}'/{0|1}`. Keyset ids prefixed `01`
//! use the HMAC-SHA256 KDF.

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};
use sha2::Sha512;

use super::{hmac_sha256, CryptoError};

type HmacSha512 = Hmac<Sha512>;

const HARDENED: u32 = 0x8000_0000;
const NUT13_PURPOSE: u32 = 129372;
const KDF_DOMAIN: &[u8] = b"Cashu_KDF_HMAC_SHA256";

/// secp256k1 group order N, big-endian
const CURVE_ORDER: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE,
    0xBA, 0xAE, 0xDC, 0xE6, 0xAF, 0x48, 0xA0, 0x3B, 0xBF, 0xD2, 0x5E, 0x8C, 0xD0, 0x36, 0x41, 0x41,
];

/// Secret and blinding factor for one output slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedSecret {
    /// Hex-encoded proof secret
    pub secret: String,
    /// Blinding factor `r`, always in `[1, N)`
    pub blinding_factor: SecretKey,
}

/// Derive the secret and blinding factor for `counter` under `keyset_id`
pub fn derive_secrets(
    seed: &[u8],
    keyset_id: &str,
    counter: u32,
) -> Result<DerivedSecret, CryptoError> {
    let id_bytes = hex::decode(keyset_id)
        .map_err(|_| CryptoError::InvalidKeysetId(keyset_id.to_string()))?;

    match id_bytes.first() {
        Some(0x00) if id_bytes.len() == 8 => derive_bip32(seed, &id_bytes, counter),
        Some(0x01) => derive_hmac_kdf(seed, &id_bytes, counter),
        _ => Err(CryptoError::InvalidKeysetId(keyset_id.to_string())),
    }
}

fn derive_bip32(seed: &[u8], id_bytes: &[u8], counter: u32) -> Result<DerivedSecret, CryptoError> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(id_bytes);
    let keyset_int = (u64::from_be_bytes(raw) % (HARDENED as u64 - 1)) as u32;

    let base = [
        NUT13_PURPOSE | HARDENED,
        HARDENED,
        keyset_int | HARDENED,
        counter | HARDENED,
    ];
    let (parent_key, parent_chain) = bip32_path(seed, &base)?;

    let (secret_key, _) = bip32_child(&parent_key, &parent_chain, 0)?;
    let (blinding_factor, _) = bip32_child(&parent_key, &parent_chain, 1)?;

    Ok(DerivedSecret {
        secret: hex::encode(secret_key.secret_bytes()),
        blinding_factor,
    })
}

fn bip32_path(seed: &[u8], path: &[u32]) -> Result<(SecretKey, [u8; 32]), CryptoError> {
    let mut mac = HmacSha512::new_from_slice(b"Bitcoin seed")
        .map_err(|e| CryptoError::Derivation(e.to_string()))?;
    mac.update(seed);
    let master = mac.finalize().into_bytes();

    let mut key = SecretKey::from_slice(&master[..32])
        .map_err(|e| CryptoError::Derivation(e.to_string()))?;
    let mut chain = [0u8; 32];
    chain.copy_from_slice(&master[32..]);

    for &index in path {
        let (child, child_chain) = bip32_child(&key, &chain, index)?;
        key = child;
        chain = child_chain;
    }
    Ok((key, chain))
}

fn bip32_child(
    parent: &SecretKey,
    chain: &[u8; 32],
    index: u32,
) -> Result<(SecretKey, [u8; 32]), CryptoError> {
    let mut mac =
        HmacSha512::new_from_slice(chain).map_err(|e| CryptoError::Derivation(e.to_string()))?;
    if index >= HARDENED {
        mac.update(&[0u8]);
        mac.update(&parent.secret_bytes());
    } else {
        mac.update(&PublicKey::from_secret_key(SECP256K1, parent).serialize());
    }
    mac.update(&index.to_be_bytes());
    let out = mac.finalize().into_bytes();

    let mut tweak_bytes = [0u8; 32];
    tweak_bytes.copy_from_slice(&out[..32]);
    let tweak = Scalar::from_be_bytes(tweak_bytes)
        .map_err(|e| CryptoError::Derivation(e.to_string()))?;
    let child = parent
        .add_tweak(&tweak)
        .map_err(|e| CryptoError::Derivation(e.to_string()))?;

    let mut child_chain = [0u8; 32];
    child_chain.copy_from_slice(&out[32..]);
    Ok((child, child_chain))
}

fn derive_hmac_kdf(seed: &[u8], id_bytes: &[u8], counter: u32) -> Result<DerivedSecret, CryptoError> {
    let mut message = Vec::with_capacity(KDF_DOMAIN.len() + id_bytes.len() + 9);
    message.extend_from_slice(KDF_DOMAIN);
    message.extend_from_slice(id_bytes);
    message.extend_from_slice(&(counter as u64).to_be_bytes());

    message.push(0x00);
    let secret = hmac_sha256(seed, &message);

    if let Some(last) = message.last_mut() {
        *last = 0x01;
    }
    let r_bytes = reduce_mod_order(hmac_sha256(seed, &message));
    let blinding_factor = SecretKey::from_slice(&r_bytes)
        .map_err(|e| CryptoError::InvalidScalar(e.to_string()))?;

    Ok(DerivedSecret {
        secret: hex::encode(secret),
        blinding_factor,
    })
}

/// Reduce a 256-bit big-endian integer modulo N (one subtraction suffices)
fn reduce_mod_order(mut value: [u8; 32]) -> [u8; 32] {
    if value < CURVE_ORDER {
        return value;
    }
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let mut diff = value[i] as i16 - CURVE_ORDER[i] as i16 - borrow;
        if diff < 0 {
            diff += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        value[i] = diff as u8;
    }
    value
}

/// BIP-39 seed for a checksummed mnemonic. Runs 2048 PBKDF2 rounds, so keep
/// it off the async executor.
pub fn mnemonic_to_seed(words: &str, passphrase: &str) -> Result<[u8; 64], CryptoError> {
    let mnemonic = bip39::Mnemonic::parse_normalized(words)
        .map_err(|e| CryptoError::Derivation(e.to_string()))?;
    Ok(mnemonic.to_seed_normalized(passphrase))
}

/// Fresh 12-word BIP-39 mnemonic
pub fn generate_mnemonic() -> Result<String, CryptoError> {
    bip39::Mnemonic::generate(12)
        .map(|m| m.to_string())
        .map_err(|e| CryptoError::Derivation(e.to_string()))
}

/// Check that a mnemonic has valid words and checksum
pub fn validate_mnemonic(words: &str) -> Result<(), CryptoError> {
    bip39::Mnemonic::parse_normalized(words.trim())
        .map(|_| ())
        .map_err(|e| CryptoError::Derivation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NUT13_MNEMONIC: &str =
        "half depart obvious quality work element tank gorilla view sugar picture humble";
    const NUT13_KEYSET: &str = "009a1f293253e41e";

    fn nut13_seed() -> [u8; 64] {
        mnemonic_to_seed(NUT13_MNEMONIC, "").unwrap()
    }

    #[test]
    fn test_mnemonic_to_seed_bip39_vector() {
        let seed = mnemonic_to_seed(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
            "TREZOR",
        )
        .unwrap();
        assert_eq!(
            hex::encode(seed),
            "c55257c360c07c72029aebc1b53c05ed0362ada38ead3e3e9efa3708e53495531f09a6987599d18264c1e1c92f2cf141630c7a3c4ab7c81b2f001698e7463b04"
        );
    }

    #[test]
    fn test_mnemonic_whitespace_is_collapsed() {
        let spaced = "  abandon abandon  abandon abandon abandon abandon\tabandon abandon abandon abandon abandon   about ";
        let plain = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
        assert_eq!(
            mnemonic_to_seed(spaced, "x").unwrap(),
            mnemonic_to_seed(plain, "x").unwrap()
        );
    }

    #[test]
    fn test_mnemonic_to_seed_rejects_bad_checksum() {
        let bad = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon";
        assert!(matches!(
            mnemonic_to_seed(bad, ""),
            Err(CryptoError::Derivation(_))
        ));
        assert!(mnemonic_to_seed("not a mnemonic", "").is_err());
    }

    #[test]
    fn test_nut13_reference_secrets() {
        let seed = nut13_seed();
        let expected = [
            (
                "485875df74771877439ac06339e284c3acfcd9be7abf3bc20b516faeadfe77ae",
                "ad00d431add9c673e843d4c2bf9a778a5f402b985b8da2d5550bf39cda41d679",
            ),
            (
                "8f2b39e8e594a4056eb1e6dbb4b0c38ef13b1b2c751f64f810ec04ee35b77270",
                "967d5232515e10b81ff226ecf5a9e2e2aff92d66ebc3edf0987eb56357fd6248",
            ),
            (
                "bc628c79accd2364fd31511216a0fab62afd4a18ff77a20deded7b858c9860c8",
                "b20f47bb6ae083659f3aa986bfa0435c55c6d93f687d51a01f26862d9b9a4899",
            ),
        ];

        for (counter, (secret, r)) in expected.iter().enumerate() {
            let derived = derive_secrets(&seed, NUT13_KEYSET, counter as u32).unwrap();
            assert_eq!(&derived.secret, secret, "secret at counter {}", counter);
            assert_eq!(
                hex::encode(derived.blinding_factor.secret_bytes()),
                *r,
                "blinding factor at counter {}",
                counter
            );
        }
    }

    #[test]
    fn test_derivation_is_stable_and_distinct() {
        let seed = nut13_seed();
        let v2_keyset = format!("01{}", "ab".repeat(32));

        for keyset in [NUT13_KEYSET, v2_keyset.as_str()] {
            let a = derive_secrets(&seed, keyset, 7).unwrap();
            let b = derive_secrets(&seed, keyset, 7).unwrap();
            assert_eq!(a, b);

            let next = derive_secrets(&seed, keyset, 8).unwrap();
            assert_ne!(a.secret, next.secret);
            assert_ne!(a.blinding_factor, next.blinding_factor);
        }

        let other_keyset = derive_secrets(&seed, "00ad268c4d1f5826", 7).unwrap();
        let first = derive_secrets(&seed, NUT13_KEYSET, 7).unwrap();
        assert_ne!(first.secret, other_keyset.secret);

        let v2 = derive_secrets(&seed, &v2_keyset, 7).unwrap();
        assert_ne!(first.secret, v2.secret);
    }

    #[test]
    fn test_blinding_factor_below_curve_order() {
        let seed = nut13_seed();
        let v2_keyset = format!("01{}", "cd".repeat(32));
        for counter in 0..50 {
            for keyset in [NUT13_KEYSET, v2_keyset.as_str()] {
                let derived = derive_secrets(&seed, keyset, counter).unwrap();
                assert!(derived.blinding_factor.secret_bytes() < CURVE_ORDER);
            }
        }
    }

    #[test]
    fn test_reduce_mod_order() {
        assert_eq!(reduce_mod_order([0u8; 32]), [0u8; 32]);
        assert_eq!(reduce_mod_order(CURVE_ORDER), [0u8; 32]);

        let max = reduce_mod_order([0xFF; 32]);
        assert!(max < CURVE_ORDER);
        // 2^256 - 1 - N = 0x014551231950b75fc4402da1732fc9bebe
        assert_eq!(
            hex::encode(max),
            "000000000000000000000000000000014551231950b75fc4402da1732fc9bebe"
        );
    }

    #[test]
    fn test_invalid_keyset_ids_rejected() {
        let seed = nut13_seed();
        assert!(derive_secrets(&seed, "not-hex", 0).is_err());
        assert!(derive_secrets(&seed, "0088", 0).is_err());
        assert!(derive_secrets(&seed, "029a1f293253e41e", 0).is_err());
    }

    #[test]
    fn test_generated_mnemonic_is_valid() {
        let words = generate_mnemonic().unwrap();
        assert_eq!(words.split_whitespace().count(), 12);
        assert!(validate_mnemonic(&words).is_ok());
        assert!(validate_mnemonic("abandon abandon").is_err());
    }
}
