//! Blind swap operations
//!
//! Building blinded outputs, sending swaps to the mint and unblinding the
//! returned signatures into proofs. Output secrets come from three sources:
//! deterministic (NUT-13, recoverable from the seed), HTLC-conditioned, or
//! blank change outputs for melts (NUT-08).

use secp256k1::SecretKey;

use super::errors::{CashuResult, CashuWalletError};
use super::spending_conditions::build_htlc_secret;
use super::types::{total_amount, Keyset, Proof};
use crate::crypto::{
    blind_message, derive_secrets, generate_blinding_factor, hash_to_curve, public_key_from_hex,
    unblind_signature,
};
use crate::stores::mint_client::{BlindSignature, BlindedMessage, MintClient, SwapRequest};

// =============================================================================
// Outputs
// =============================================================================

/// A blinded output and the values needed to unblind its signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedOutput {
    pub amount: u64,
    pub secret: String,
    pub blinding_factor: SecretKey,
    pub blinded: BlindedMessage,
}

impl PreparedOutput {
    pub fn new(
        keyset_id: &str,
        amount: u64,
        secret: String,
        blinding_factor: SecretKey,
    ) -> CashuResult<Self> {
        let y = hash_to_curve(secret.as_bytes())?;
        let blinded = blind_message(&y, &blinding_factor)?;
        Ok(Self {
            amount,
            blinded: BlindedMessage {
                amount,
                id: keyset_id.to_string(),
                blinded_secret: blinded.to_string(),
            },
            secret,
            blinding_factor,
        })
    }
}

/// Outputs whose secrets derive from `seed`, one counter slot per amount
pub fn deterministic_outputs(
    seed: &[u8],
    keyset_id: &str,
    start_counter: u32,
    amounts: &[u64],
) -> CashuResult<Vec<PreparedOutput>> {
    amounts
        .iter()
        .enumerate()
        .map(|(i, amount)| {
            let counter = start_counter
                .checked_add(i as u32)
                .ok_or_else(|| CashuWalletError::Internal("derivation counter overflow".into()))?;
            let derived = derive_secrets(seed, keyset_id, counter)?;
            PreparedOutput::new(keyset_id, *amount, derived.secret, derived.blinding_factor)
        })
        .collect()
}

/// HTLC-locked outputs, each with its own nonce
pub fn htlc_outputs(
    keyset_id: &str,
    amounts: &[u64],
    payment_hash: &str,
    locktime: u64,
    refund_keys: &[String],
    pubkeys: &[String],
) -> CashuResult<Vec<PreparedOutput>> {
    amounts
        .iter()
        .map(|amount| {
            let secret = build_htlc_secret(payment_hash, locktime, refund_keys, pubkeys)?;
            PreparedOutput::new(keyset_id, *amount, secret, generate_blinding_factor())
        })
        .collect()
}

/// Number of blank outputs that can return up to `fee_reserve` as change
pub fn blank_output_count(fee_reserve: u64) -> usize {
    if fee_reserve <= 1 {
        1
    } else {
        (64 - (fee_reserve - 1).leading_zeros()) as usize
    }
}

// =============================================================================
// Unblinding
// =============================================================================

/// Turn mint signatures into proofs, pairing signatures with outputs by position
///
/// Extra outputs without a signature are ignored (blank change outputs the
/// mint did not need).
pub fn unblind_outputs(
    keyset: &Keyset,
    outputs: &[PreparedOutput],
    signatures: &[BlindSignature],
) -> CashuResult<Vec<Proof>> {
    if signatures.len() > outputs.len() {
        return Err(CashuWalletError::Internal(format!(
            "mint returned {} signatures for {} outputs",
            signatures.len(),
            outputs.len()
        )));
    }

    outputs
        .iter()
        .zip(signatures)
        .map(|(output, signature)| {
            let mint_key = keyset.key_for(signature.amount)?;
            let blinded = public_key_from_hex(&signature.blinded_signature)?;
            let c = unblind_signature(&blinded, &output.blinding_factor, &mint_key)?;
            Ok(Proof {
                amount: signature.amount,
                keyset_id: signature.id.clone(),
                secret: output.secret.clone(),
                c: c.to_string(),
                witness: None,
            })
        })
        .collect()
}

// =============================================================================
// Swap
// =============================================================================

/// Swap `inputs` for `outputs` at the mint
///
/// Input and output totals must match; fee-charging keysets are not supported.
pub async fn execute_swap(
    mint: &dyn MintClient,
    keyset: &Keyset,
    inputs: Vec<Proof>,
    outputs: &[PreparedOutput],
) -> CashuResult<Vec<Proof>> {
    let input_total = total_amount(&inputs);
    let output_total: u64 = outputs.iter().map(|o| o.amount).sum();
    if input_total != output_total {
        return Err(CashuWalletError::InvalidAmount(format!(
            "swap inputs total {} but outputs total {}",
            input_total, output_total
        )));
    }

    log::debug!(
        "Swapping {} inputs for {} outputs ({} sats) at {}",
        inputs.len(),
        outputs.len(),
        input_total,
        mint.mint_url()
    );

    let request = SwapRequest {
        inputs,
        outputs: outputs.iter().map(|o| o.blinded.clone()).collect(),
    };
    let response = mint
        .swap(request)
        .await
        .map_err(|e| e.into_wallet_error(mint.mint_url()))?;

    if response.signatures.len() != outputs.len() {
        return Err(CashuWalletError::Internal(format!(
            "mint signed {} of {} outputs",
            response.signatures.len(),
            outputs.len()
        )));
    }
    unblind_outputs(keyset, outputs, &response.signatures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::mnemonic_to_seed;
    use crate::stores::cashu::spending_conditions::{parse_secret, ParsedSecret};
    use crate::stores::cashu::utils::split_amount;
    use crate::test_utils::FakeMint;

    const MINT: &str = "https://mint.example.com";

    fn seed() -> [u8; 64] {
        mnemonic_to_seed(
            "half depart obvious quality work element tank gorilla view sugar picture humble",
            "",
        )
        .unwrap()
    }

    #[test]
    fn test_deterministic_outputs_advance_counter() {
        let outputs = deterministic_outputs(&seed(), "009a1f293253e41e", 0, &[1, 2, 4]).unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(
            outputs[0].secret,
            "485875df74771877439ac06339e284c3acfcd9be7abf3bc20b516faeadfe77ae"
        );
        let again = deterministic_outputs(&seed(), "009a1f293253e41e", 1, &[2]).unwrap();
        assert_eq!(again[0].secret, outputs[1].secret);
        assert_eq!(again[0].blinded, outputs[1].blinded);
    }

    #[test]
    fn test_htlc_outputs_have_distinct_nonces() {
        let hash = hex::encode([9u8; 32]);
        let outputs = htlc_outputs("009a1f293253e41e", &[2, 16, 32], &hash, 100, &[], &[]).unwrap();
        assert_eq!(outputs.len(), 3);
        assert_ne!(outputs[0].secret, outputs[1].secret);
        for output in &outputs {
            assert!(matches!(parse_secret(&output.secret), Ok(ParsedSecret::Htlc(_))));
        }
    }

    #[test]
    fn test_blank_output_count() {
        assert_eq!(blank_output_count(0), 1);
        assert_eq!(blank_output_count(1), 1);
        assert_eq!(blank_output_count(2), 1);
        assert_eq!(blank_output_count(3), 2);
        assert_eq!(blank_output_count(1000), 10);
        assert_eq!(blank_output_count(1024), 10);
    }

    #[tokio::test]
    async fn test_swap_produces_valid_proofs() {
        let mint = FakeMint::new(MINT);
        let keyset = mint.keyset();
        let inputs = mint.issue(&[8, 2]).await;

        let outputs = deterministic_outputs(&seed(), &keyset.id, 0, &split_amount(10)).unwrap();
        let proofs = execute_swap(&mint, &keyset, inputs.clone(), &outputs).await.unwrap();
        assert_eq!(total_amount(&proofs), 10);
        for proof in &proofs {
            assert!(mint.is_valid(proof));
        }

        // Inputs are now spent
        let replay = execute_swap(&mint, &keyset, inputs, &outputs).await;
        assert!(matches!(
            replay,
            Err(CashuWalletError::MintRejected { code: Some(11001), .. })
        ));
    }

    #[tokio::test]
    async fn test_swap_rejects_unbalanced_amounts() {
        let mint = FakeMint::new(MINT);
        let keyset = mint.keyset();
        let inputs = mint.issue(&[8]).await;
        let outputs = deterministic_outputs(&seed(), &keyset.id, 0, &[4]).unwrap();
        assert!(matches!(
            execute_swap(&mint, &keyset, inputs, &outputs).await,
            Err(CashuWalletError::InvalidAmount(_))
        ));
    }
}
