//! Checks that a transaction hash really paid the escrow wallet

use async_trait::async_trait;
use ethers::contract::parse_log;
use ethers::prelude::*;
use rust_decimal::Decimal;
use serde::Serialize;
use std::convert::TryFrom;

use super::{parse_address, parse_tx_hash, to_base_units, PaymentError, PaymentResult, TransferFilter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PaymentCheck {
    Confirmed,
    /// No receipt yet
    Pending,
    Invalid(String),
}

#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify(&self, tx_hash: &str, amount: Decimal) -> PaymentResult<PaymentCheck>;
}

pub struct ChainVerifier {
    provider: Provider<Http>,
    token: Address,
    escrow: Address,
    decimals: u32,
}

impl ChainVerifier {
    pub fn new(rpc_url: &str, token: &str, escrow: &str, decimals: u32) -> PaymentResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| PaymentError::Rpc(format!("failed to create HTTP provider: {e}")))?;
        Ok(Self {
            provider,
            token: parse_address(token)?,
            escrow: parse_address(escrow)?,
            decimals,
        })
    }

    /// Judge a receipt: success status plus a token `Transfer` into escrow
    /// of at least `expected` base units
    pub fn check_receipt(&self, receipt: &TransactionReceipt, expected: U256) -> PaymentCheck {
        if receipt.status != Some(U64::from(1)) {
            return PaymentCheck::Invalid("transaction reverted".to_string());
        }
        let paid = receipt
            .logs
            .iter()
            .filter(|log| log.address == self.token)
            .filter_map(|log| parse_log::<TransferFilter>(log.clone()).ok())
            .any(|transfer| transfer.to == self.escrow && transfer.value >= expected);
        if paid {
            PaymentCheck::Confirmed
        } else {
            PaymentCheck::Invalid("no matching token transfer to the escrow wallet".to_string())
        }
    }
}

#[async_trait]
impl PaymentVerifier for ChainVerifier {
    async fn verify(&self, tx_hash: &str, amount: Decimal) -> PaymentResult<PaymentCheck> {
        let hash = parse_tx_hash(tx_hash)?;
        let expected = to_base_units(amount, self.decimals)?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| PaymentError::Rpc(format!("failed to get receipt: {e}")))?;

        Ok(match receipt {
            Some(receipt) => self.check_receipt(&receipt, expected),
            None => PaymentCheck::Pending,
        })
    }
}

/// Accepts any well-formed hash; used when no RPC endpoint is configured
#[derive(Debug, Default, Clone)]
pub struct FormatOnlyVerifier;

#[async_trait]
impl PaymentVerifier for FormatOnlyVerifier {
    async fn verify(&self, tx_hash: &str, _amount: Decimal) -> PaymentResult<PaymentCheck> {
        Ok(match parse_tx_hash(tx_hash) {
            Ok(_) => PaymentCheck::Confirmed,
            Err(e) => PaymentCheck::Invalid(e.to_string()),
        })
    }
}
