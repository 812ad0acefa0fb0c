use rust_decimal::Decimal;
use serde::Serialize;

use super::relay::{TransferStatus, WalletTransfer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Zero price; the wallet was never touched
    Free,
    Paid { tx_hash: String },
    /// Broadcast but not confirmed in time; the hash can back an order once it confirms
    Unconfirmed { tx_hash: String },
    Aborted { reason: String },
}

impl PaymentOutcome {
    pub fn tx_hash(&self) -> Option<&str> {
        match self {
            PaymentOutcome::Paid { tx_hash } => Some(tx_hash),
            _ => None,
        }
    }
}

/// Pay `price` into escrow before an order is placed. A positive price blocks
/// until the transfer confirms; anything short of a hash aborts the order.
pub async fn checkout(wallet: &dyn WalletTransfer, escrow: &str, price: Decimal) -> PaymentOutcome {
    if price.is_zero() {
        return PaymentOutcome::Free;
    }
    if price.is_sign_negative() {
        return PaymentOutcome::Aborted {
            reason: format!("invalid price {price}"),
        };
    }

    match wallet.transfer(escrow, price).await {
        Ok(sent) => match sent.status {
            TransferStatus::Confirmed => PaymentOutcome::Paid {
                tx_hash: sent.tx_hash,
            },
            TransferStatus::Pending => PaymentOutcome::Unconfirmed {
                tx_hash: sent.tx_hash,
            },
            TransferStatus::Reverted => PaymentOutcome::Aborted {
                reason: format!("transfer {} reverted", sent.tx_hash),
            },
        },
        Err(e) => {
            log::warn!("Escrow payment failed: {}", e);
            PaymentOutcome::Aborted {
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::{PaymentError, PaymentResult, SentTransfer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedWallet {
        calls: AtomicUsize,
        result: fn() -> PaymentResult<SentTransfer>,
    }

    #[async_trait]
    impl WalletTransfer for ScriptedWallet {
        async fn transfer(&self, _to: &str, _amount: Decimal) -> PaymentResult<SentTransfer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }

        async fn status(&self, _tx_hash: &str) -> PaymentResult<TransferStatus> {
            Ok(TransferStatus::Pending)
        }
    }

    fn wallet(result: fn() -> PaymentResult<SentTransfer>) -> ScriptedWallet {
        ScriptedWallet {
            calls: AtomicUsize::new(0),
            result,
        }
    }

    fn sent(status: TransferStatus) -> PaymentResult<SentTransfer> {
        Ok(SentTransfer {
            tx_hash: "0xabc".into(),
            status,
        })
    }

    #[tokio::test]
    async fn zero_price_skips_the_wallet() {
        let w = wallet(|| sent(TransferStatus::Confirmed));
        assert_eq!(checkout(&w, "0xescrow", Decimal::ZERO).await, PaymentOutcome::Free);
        assert_eq!(w.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn positive_price_waits_for_the_hash() {
        let w = wallet(|| sent(TransferStatus::Confirmed));
        let outcome = checkout(&w, "0xescrow", Decimal::from(5)).await;
        assert_eq!(outcome.tx_hash(), Some("0xabc"));
        assert_eq!(w.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unconfirmed_transfer_keeps_its_hash() {
        let w = wallet(|| sent(TransferStatus::Pending));
        let outcome = checkout(&w, "0xescrow", Decimal::ONE).await;
        assert_eq!(
            outcome,
            PaymentOutcome::Unconfirmed {
                tx_hash: "0xabc".into()
            }
        );
        // not usable for an order yet
        assert_eq!(outcome.tx_hash(), None);
    }

    #[tokio::test]
    async fn revert_or_error_aborts() {
        let reverted = wallet(|| sent(TransferStatus::Reverted));
        assert!(matches!(
            checkout(&reverted, "0xescrow", Decimal::ONE).await,
            PaymentOutcome::Aborted { .. }
        ));

        let rejected = wallet(|| Err(PaymentError::Rejected("user denied".into())));
        assert!(matches!(
            checkout(&rejected, "0xescrow", Decimal::ONE).await,
            PaymentOutcome::Aborted { .. }
        ));
    }
}
