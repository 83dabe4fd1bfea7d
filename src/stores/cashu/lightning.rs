//! Lightning integration
//!
//! Deposits (NUT-04 mint quotes) and withdrawals (NUT-05 melts with NUT-08
//! blank change outputs). Both are journaled before the mint call.

use std::collections::HashSet;

use nostr::nips::nip60::TransactionDirection;

use super::errors::{CashuResult, CashuWalletError};
use super::internal::{
    next_deterministic_outputs, record_outputs, select_verified, source_events, WalletContext,
    WalletState,
};
use super::swap::{blank_output_count, unblind_outputs};
use super::types::{total_amount, OperationKind, Proof, PublishOutcome, Settlement};
use super::utils::split_amount;
use crate::stores::mint_client::{
    MeltQuoteRequest, MeltQuoteState, MeltRequest, MintQuoteRequest, MintQuoteResponse,
    MintQuoteState, MintRequest,
};

/// Quotes this close to expiry are not used
const QUOTE_EXPIRY_MARGIN_SECS: u64 = 30;

fn quote_expired(expiry: Option<u64>, now: u64) -> bool {
    expiry
        .map(|expiry| now + QUOTE_EXPIRY_MARGIN_SECS >= expiry)
        .unwrap_or(false)
}

// =============================================================================
// Deposit (Lightning → Ecash)
// =============================================================================

/// Invoice to pay for a deposit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositQuote {
    pub quote_id: String,
    pub invoice: String,
    pub amount: u64,
    pub expiry: Option<u64>,
}

pub(crate) async fn create_deposit_quote(
    ctx: &WalletContext,
    state: &WalletState,
    amount: u64,
) -> CashuResult<DepositQuote> {
    if amount == 0 {
        return Err(CashuWalletError::InvalidAmount(
            "deposit amount must be greater than zero".to_string(),
        ));
    }
    let mint = ctx.mint(state.mint_url())?;
    let quote = mint
        .mint_quote(MintQuoteRequest {
            amount,
            unit: ctx.config.unit.clone(),
        })
        .await
        .map_err(|e| e.into_wallet_error(mint.mint_url()))?;

    log::info!("Deposit quote {} created for {} sats", quote.quote, amount);
    Ok(DepositQuote {
        quote_id: quote.quote,
        invoice: quote.request,
        amount: quote.amount.unwrap_or(amount),
        expiry: quote.expiry,
    })
}

/// Mint proofs for a paid deposit quote and publish them
pub(crate) async fn complete_deposit(
    ctx: &WalletContext,
    state: &mut WalletState,
    quote_id: &str,
) -> CashuResult<Settlement> {
    let mint = ctx.mint(state.mint_url())?;
    let mint_url = mint.mint_url().to_string();

    let quote: MintQuoteResponse = mint
        .mint_quote_status(quote_id)
        .await
        .map_err(|e| e.into_wallet_error(&mint_url))?;
    match quote.state {
        MintQuoteState::Unpaid => {
            return Err(CashuWalletError::QuoteUnpaid {
                quote_id: quote_id.to_string(),
            })
        }
        MintQuoteState::Issued => {
            return Err(CashuWalletError::QuoteFailed {
                message: format!("quote {} was already issued", quote_id),
            })
        }
        MintQuoteState::Paid => {}
    }
    let amount = quote.amount.ok_or_else(|| CashuWalletError::QuoteFailed {
        message: format!("quote {} carries no amount", quote_id),
    })?;

    let keyset = ctx.active_keyset(mint.as_ref()).await?;
    let outputs = next_deterministic_outputs(ctx, state, &keyset.id, &split_amount(amount)).await?;
    let operation = ctx
        .journal
        .begin(OperationKind::Mint, vec![], Some(quote_id.to_string()), &mint_url)
        .await?;

    let response = match mint
        .mint(MintRequest {
            quote: quote_id.to_string(),
            outputs: outputs.iter().map(|o| o.blinded.clone()).collect(),
        })
        .await
    {
        Ok(response) => response,
        Err(e) => {
            let e = e.into_wallet_error(&mint_url);
            ctx.forget_rejected_keyset(&mint_url, &e);
            if !e.is_connection_error() {
                ctx.journal.complete(&operation.id).await;
            }
            return Err(e);
        }
    };

    let proofs = unblind_outputs(&keyset, &outputs, &response.signatures)?;
    let minted = total_amount(&proofs);
    state.check_amount("deposit", amount, minted);

    let outcome = record_outputs(ctx, &proofs, &[], &mint_url, &[], "deposit")
        .await?
        .ok_or_else(|| CashuWalletError::Internal("mint returned no signatures".to_string()))?;
    ctx.journal.complete(&operation.id).await;

    if let PublishOutcome::Published { event_id } = &outcome {
        ctx.ledger
            .record_history(TransactionDirection::In, minted, &[event_id.clone()], &[])
            .await;
    }
    log::info!("Deposited {} sats from quote {}", minted, quote_id);

    Ok(Settlement {
        amount: minted,
        escrow_id: None,
        outcome,
    })
}

// =============================================================================
// Withdraw (Ecash → Lightning)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawResult {
    pub amount: u64,
    pub fee_paid: u64,
    pub preimage: Option<String>,
    /// Change returned by the mint
    pub change: u64,
    pub outcome: Option<PublishOutcome>,
}

/// Pay `invoice` from the ledger
pub(crate) async fn withdraw(
    ctx: &WalletContext,
    state: &mut WalletState,
    invoice: &str,
) -> CashuResult<WithdrawResult> {
    let mint = ctx.mint(state.mint_url())?;
    let mint_url = mint.mint_url().to_string();

    let quote = mint
        .melt_quote(MeltQuoteRequest {
            request: invoice.to_string(),
            unit: ctx.config.unit.clone(),
        })
        .await
        .map_err(|e| e.into_wallet_error(&mint_url))?;
    if quote_expired(quote.expiry, ctx.clock.now()) {
        return Err(CashuWalletError::QuoteFailed {
            message: format!("melt quote {} expires too soon", quote.quote),
        });
    }

    let required = quote
        .amount
        .checked_add(quote.fee_reserve)
        .ok_or_else(|| CashuWalletError::QuoteFailed {
            message: format!(
                "melt quote {} amount {} plus fee reserve {} overflows",
                quote.quote, quote.amount, quote.fee_reserve
            ),
        })?;
    let (selection, view) = select_verified(ctx, mint.as_ref(), required).await?;
    let inputs: Vec<Proof> = selection.proofs.iter().map(|p| p.proof.clone()).collect();
    let input_secrets: Vec<String> = inputs.iter().map(|p| p.secret.clone()).collect();
    let input_total = total_amount(&inputs);
    let sources = source_events(&selection);
    let consumed: HashSet<String> = input_secrets.iter().cloned().collect();
    let migrated = view.unconsumed_proofs(&sources, &consumed);

    // Blank outputs cover everything above the invoice amount
    let keyset = ctx.active_keyset(mint.as_ref()).await?;
    let blanks = vec![1; blank_output_count(input_total - quote.amount)];
    let outputs = next_deterministic_outputs(ctx, state, &keyset.id, &blanks).await?;

    let operation = ctx
        .journal
        .begin(OperationKind::Melt, input_secrets.clone(), Some(quote.quote.clone()), &mint_url)
        .await?;

    log::info!(
        "Melting {} sats (fee reserve {}) with {} inputs",
        quote.amount,
        quote.fee_reserve,
        inputs.len()
    );

    let response = match mint
        .melt(MeltRequest {
            quote: quote.quote.clone(),
            inputs,
            outputs: outputs.iter().map(|o| o.blinded.clone()).collect(),
        })
        .await
    {
        Ok(response) => response,
        Err(e) => {
            let e = e.into_wallet_error(&mint_url);
            ctx.forget_rejected_keyset(&mint_url, &e);
            if !e.is_connection_error() {
                ctx.journal.complete(&operation.id).await;
            }
            return Err(e);
        }
    };

    match response.state {
        MeltQuoteState::Paid => {}
        MeltQuoteState::Pending => {
            // Inputs stay journaled until the scan sees them settle
            return Err(CashuWalletError::QuoteFailed {
                message: format!("payment for quote {} is still pending", quote.quote),
            });
        }
        MeltQuoteState::Unpaid => {
            ctx.journal.complete(&operation.id).await;
            return Err(CashuWalletError::QuoteFailed {
                message: format!("mint could not pay quote {}", quote.quote),
            });
        }
    }
    ctx.ledger.record_spent(input_secrets.iter());

    let change = unblind_outputs(&keyset, &outputs, &response.change.unwrap_or_default())?;
    let change_total = total_amount(&change);
    let fee_paid = input_total.saturating_sub(quote.amount.saturating_add(change_total));

    let outcome = record_outputs(ctx, &change, &migrated, &mint_url, &sources, "melt change").await?;
    ctx.journal.complete(&operation.id).await;

    let created: Vec<String> = match &outcome {
        Some(PublishOutcome::Published { event_id }) => vec![event_id.clone()],
        _ => vec![],
    };
    ctx.ledger
        .record_history(
            TransactionDirection::Out,
            quote.amount + fee_paid,
            &created,
            &sources,
        )
        .await;
    log::info!(
        "Withdrew {} sats, fee {}, change {}",
        quote.amount,
        fee_paid,
        change_total
    );

    Ok(WithdrawResult {
        amount: quote.amount,
        fee_paid,
        preimage: response.payment_preimage,
        change: change_total,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestWallet;

    #[test]
    fn test_quote_expiry_margin() {
        assert!(!quote_expired(None, 1_000));
        assert!(!quote_expired(Some(1_100), 1_000));
        assert!(quote_expired(Some(1_020), 1_000));
    }

    #[tokio::test]
    async fn test_deposit_flow() {
        let wallet = TestWallet::new("alice").await;
        wallet.mint.set_auto_pay(false);

        let quote = wallet.wallet.create_deposit_quote(21).await.unwrap();
        assert_eq!(quote.amount, 21);
        assert!(matches!(
            wallet.wallet.complete_deposit(&quote.quote_id).await,
            Err(CashuWalletError::QuoteUnpaid { .. })
        ));

        wallet.mint.pay_quote(&quote.quote_id);
        let settlement = wallet.wallet.complete_deposit(&quote.quote_id).await.unwrap();
        assert_eq!(settlement.amount, 21);
        assert!(matches!(
            wallet.wallet.complete_deposit(&quote.quote_id).await,
            Err(CashuWalletError::QuoteFailed { .. })
        ));

        assert_eq!(wallet.wallet.sync().await.unwrap().balance.available, 21);
        assert!(wallet.wallet.context().journal.list().await.unwrap().is_empty());
        assert!(matches!(
            wallet.wallet.create_deposit_quote(0).await,
            Err(CashuWalletError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_withdraw_returns_change() {
        let wallet = TestWallet::new("alice").await;
        wallet.fund(&[64, 32]).await;

        // 40 sats + 2 fee reserve needs both proofs; everything above 40 comes back
        let result = wallet.wallet.withdraw("fake:40").await.unwrap();
        assert_eq!(result.amount, 40);
        assert_eq!(result.fee_paid, 0);
        assert_eq!(result.change, 56);
        assert!(result.preimage.is_some());

        assert_eq!(wallet.wallet.sync().await.unwrap().balance.available, 56);
    }

    #[tokio::test]
    async fn test_withdraw_insufficient_funds() {
        let wallet = TestWallet::new("alice").await;
        wallet.fund(&[8]).await;
        assert!(matches!(
            wallet.wallet.withdraw("fake:8").await,
            Err(CashuWalletError::InsufficientFunds { available: 8, required: 10 })
        ));
        assert!(matches!(
            wallet.wallet.withdraw("lnbc-garbage").await,
            Err(CashuWalletError::MintRejected { code: Some(20001), .. })
        ));

        let overflowing = format!("fake:{}", u64::MAX);
        assert!(matches!(
            wallet.wallet.withdraw(&overflowing).await,
            Err(CashuWalletError::QuoteFailed { .. })
        ));

        // Without a fee reserve the single proof covers the invoice exactly
        wallet.mint.set_melt_fee_reserve(0);
        let result = wallet.wallet.withdraw("fake:8").await.unwrap();
        assert_eq!(result.change, 0);
        assert!(wallet.wallet.withdraw("fake:1").await.unwrap_err().is_insufficient_funds());
    }

    #[tokio::test]
    async fn test_withdraw_with_pending_proofs_is_rejected() {
        let wallet = TestWallet::new("alice").await;
        let proofs = wallet.fund(&[16]).await;
        wallet.mint.mark_pending(&proofs[0]);

        let err = wallet.wallet.withdraw("fake:8").await.unwrap_err();
        assert!(err.is_token_pending());
        assert!(wallet.wallet.context().journal.list().await.unwrap().is_empty());
    }
}
