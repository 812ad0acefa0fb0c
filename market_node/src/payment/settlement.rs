use std::sync::Arc;

use super::relay::{TransferStatus, WalletTransfer};
use crate::market::payout::{Settlement, SettlementLeg};

/// Pays out settlement legs from the escrow wallet
pub struct SettlementExecutor {
    relay: Arc<dyn WalletTransfer>,
}

impl SettlementExecutor {
    pub fn new(relay: Arc<dyn WalletTransfer>) -> Self {
        Self { relay }
    }

    /// Move every open leg forward. A leg with a broadcast hash is only ever
    /// checked, never sent again, unless its receipt shows a revert.
    /// Returns how many legs confirmed on this pass.
    pub async fn execute(&self, settlement: &mut Settlement) -> usize {
        let mut confirmed = 0;
        for leg in settlement.legs.iter_mut() {
            let done = if leg.is_awaiting_confirmation() {
                self.recheck(leg).await
            } else if leg.is_executable() {
                self.send(leg).await
            } else {
                false
            };
            if done {
                confirmed += 1;
            }
        }
        confirmed
    }

    async fn recheck(&self, leg: &mut SettlementLeg) -> bool {
        let Some(tx_hash) = leg.tx_hash.clone() else {
            return false;
        };
        match self.relay.status(&tx_hash).await {
            Ok(TransferStatus::Confirmed) => {
                log::info!("Settlement transfer {} confirmed", tx_hash);
                leg.confirmed = true;
                true
            }
            Ok(TransferStatus::Pending) => {
                log::debug!("Settlement transfer {} still pending", tx_hash);
                false
            }
            Ok(TransferStatus::Reverted) => {
                log::warn!("Settlement transfer {} reverted, sending again", tx_hash);
                leg.tx_hash = None;
                false
            }
            Err(e) => {
                log::warn!("Could not check settlement transfer {}: {}", tx_hash, e);
                false
            }
        }
    }

    async fn send(&self, leg: &mut SettlementLeg) -> bool {
        let Some(wallet) = leg.wallet.clone() else {
            return false;
        };
        match self.relay.transfer(&wallet, leg.amount).await {
            Ok(sent) => match sent.status {
                TransferStatus::Confirmed => {
                    log::info!(
                        "Settled {:?} leg of {} to {}: {}",
                        leg.recipient,
                        leg.amount,
                        wallet,
                        sent.tx_hash
                    );
                    leg.tx_hash = Some(sent.tx_hash);
                    leg.confirmed = true;
                    true
                }
                TransferStatus::Pending => {
                    log::warn!(
                        "Settlement transfer {} to {} not confirmed yet",
                        sent.tx_hash,
                        wallet
                    );
                    leg.tx_hash = Some(sent.tx_hash);
                    false
                }
                TransferStatus::Reverted => {
                    log::warn!("Settlement transfer {} to {} reverted", sent.tx_hash, wallet);
                    false
                }
            },
            Err(e) => {
                log::warn!("Settlement transfer to {} failed: {}", wallet, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::payout::{payout_settlement, refund_settlement, PayoutSplit, PayoutWallets};
    use crate::payment::{PaymentResult, SentTransfer};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    /// Answers every send and receipt lookup with `status`
    struct ScriptedWallet {
        sent: Mutex<Vec<(String, Decimal)>>,
        status: Mutex<TransferStatus>,
    }

    impl ScriptedWallet {
        fn new(status: TransferStatus) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                status: Mutex::new(status),
            })
        }

        fn answer_with(&self, status: TransferStatus) {
            *self.status.lock() = status;
        }
    }

    #[async_trait]
    impl WalletTransfer for ScriptedWallet {
        async fn transfer(&self, to: &str, amount: Decimal) -> PaymentResult<SentTransfer> {
            let mut sent = self.sent.lock();
            sent.push((to.to_string(), amount));
            Ok(SentTransfer {
                tx_hash: format!("0x{:064x}", sent.len()),
                status: *self.status.lock(),
            })
        }

        async fn status(&self, _tx_hash: &str) -> PaymentResult<TransferStatus> {
            Ok(*self.status.lock())
        }
    }

    #[tokio::test]
    async fn pays_only_legs_with_wallets_once() {
        let wallet = ScriptedWallet::new(TransferStatus::Confirmed);
        let executor = SettlementExecutor::new(wallet.clone());
        let details = PayoutSplit::default().split(Decimal::from(100), Some(Uuid::new_v4()), 18);
        let wallets = PayoutWallets {
            performer: Some("0xperformer".into()),
            referrer: None,
            platform: Some("0xplatform".into()),
        };
        let mut settlement = payout_settlement(&details, Uuid::new_v4(), &wallets, Utc::now());

        assert_eq!(executor.execute(&mut settlement).await, 2);
        assert_eq!(executor.execute(&mut settlement).await, 0);

        let sent = wallet.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], ("0xperformer".to_string(), Decimal::from(90)));
        // referrer leg has no wallet and stays open in escrow
        assert!(settlement.legs.iter().any(|l| l.tx_hash.is_none()));
        assert!(!settlement.has_pending_legs());
    }

    #[tokio::test]
    async fn unconfirmed_transfer_is_checked_not_resent() {
        let wallet = ScriptedWallet::new(TransferStatus::Pending);
        let executor = SettlementExecutor::new(wallet.clone());
        let mut settlement =
            refund_settlement(Decimal::from(90), Uuid::new_v4(), Some("0xcustomer".into()), Utc::now());

        for _ in 0..3 {
            assert_eq!(executor.execute(&mut settlement).await, 0);
        }
        assert_eq!(wallet.sent.lock().len(), 1);
        assert!(settlement.legs[0].is_awaiting_confirmation());

        wallet.answer_with(TransferStatus::Confirmed);
        assert_eq!(executor.execute(&mut settlement).await, 1);
        assert_eq!(wallet.sent.lock().len(), 1);
        assert!(settlement.legs[0].confirmed);
        assert!(!settlement.has_pending_legs());
    }

    #[tokio::test]
    async fn reverted_transfer_is_sent_again() {
        let wallet = ScriptedWallet::new(TransferStatus::Pending);
        let executor = SettlementExecutor::new(wallet.clone());
        let mut settlement =
            refund_settlement(Decimal::from(5), Uuid::new_v4(), Some("0xcustomer".into()), Utc::now());

        executor.execute(&mut settlement).await;
        wallet.answer_with(TransferStatus::Reverted);
        // the receipt shows the revert; the hash is dropped
        executor.execute(&mut settlement).await;
        assert_eq!(settlement.legs[0].tx_hash, None);

        wallet.answer_with(TransferStatus::Confirmed);
        assert_eq!(executor.execute(&mut settlement).await, 1);
        assert_eq!(wallet.sent.lock().len(), 2);
    }
}
