//! Signed ERC-20 transfers through a JSON-RPC provider

use async_trait::async_trait;
use ethers::prelude::*;
use rust_decimal::Decimal;
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use super::{parse_address, parse_tx_hash, to_base_units, Erc20Token, PaymentError, PaymentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Confirmed,
    /// Broadcast but no receipt yet
    Pending,
    Reverted,
}

/// A transfer that reached the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransfer {
    pub tx_hash: String,
    pub status: TransferStatus,
}

/// Moves tokens from the signer's wallet.
///
/// An error from `transfer` means nothing was broadcast. Once a transaction
/// is out, its hash is always returned, even when confirmation timed out.
#[async_trait]
pub trait WalletTransfer: Send + Sync {
    async fn transfer(&self, to: &str, amount: Decimal) -> PaymentResult<SentTransfer>;

    /// Where an earlier transfer stands now
    async fn status(&self, tx_hash: &str) -> PaymentResult<TransferStatus>;
}

fn receipt_status(receipt: &TransactionReceipt) -> TransferStatus {
    if receipt.status == Some(U64::from(1)) {
        TransferStatus::Confirmed
    } else {
        TransferStatus::Reverted
    }
}

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

pub struct Erc20Relay {
    client: Arc<SignerClient>,
    token: Address,
    decimals: u32,
    confirmation_timeout: Duration,
}

impl Erc20Relay {
    pub async fn connect(
        rpc_url: &str,
        private_key: &str,
        token_address: &str,
        decimals: u32,
        confirmation_timeout: Duration,
    ) -> PaymentResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| PaymentError::Rpc(format!("failed to create HTTP provider: {e}")))?;
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| PaymentError::Rpc(format!("failed to get chain ID: {e}")))?
            .as_u64();
        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| PaymentError::Signer(e.to_string()))?
            .with_chain_id(chain_id);

        log::info!(
            "Payment relay connected (chain {}, signer {:?})",
            chain_id,
            wallet.address()
        );

        Ok(Self {
            client: Arc::new(SignerMiddleware::new(provider, wallet)),
            token: parse_address(token_address)?,
            decimals,
            confirmation_timeout,
        })
    }

    pub fn signer_address(&self) -> Address {
        self.client.address()
    }

    pub async fn balance(&self) -> PaymentResult<U256> {
        Erc20Token::new(self.token, self.client.clone())
            .balance_of(self.signer_address())
            .call()
            .await
            .map_err(|e| PaymentError::Rpc(e.to_string()))
    }
}

#[async_trait]
impl WalletTransfer for Erc20Relay {
    async fn transfer(&self, to: &str, amount: Decimal) -> PaymentResult<SentTransfer> {
        let recipient = parse_address(to)?;
        let units = to_base_units(amount, self.decimals)?;
        let token = Erc20Token::new(self.token, self.client.clone());
        let call = token.transfer(recipient, units);

        let pending = call
            .send()
            .await
            .map_err(|e| PaymentError::Rejected(e.to_string()))?;
        let tx_hash = format!("{:?}", pending.tx_hash());
        log::info!("Token transfer sent: {} ({} to {})", tx_hash, amount, to);

        let status = match tokio::time::timeout(self.confirmation_timeout, pending.confirmations(1)).await {
            Ok(Ok(Some(receipt))) => receipt_status(&receipt),
            Ok(Ok(None)) => {
                log::warn!("Transfer {} left the mempool without a receipt", tx_hash);
                TransferStatus::Pending
            }
            Ok(Err(e)) => {
                log::warn!("Lost track of transfer {}: {}", tx_hash, e);
                TransferStatus::Pending
            }
            Err(_) => {
                log::warn!("Transfer {} not confirmed within {:?}", tx_hash, self.confirmation_timeout);
                TransferStatus::Pending
            }
        };
        if status == TransferStatus::Reverted {
            log::warn!("Transfer {} reverted", tx_hash);
        }
        Ok(SentTransfer { tx_hash, status })
    }

    async fn status(&self, tx_hash: &str) -> PaymentResult<TransferStatus> {
        let hash = parse_tx_hash(tx_hash)?;
        let receipt = self
            .client
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| PaymentError::Rpc(e.to_string()))?;
        Ok(receipt
            .as_ref()
            .map(receipt_status)
            .unwrap_or(TransferStatus::Pending))
    }
}
