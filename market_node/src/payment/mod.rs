//! USDT escrow payments over an EVM JSON-RPC endpoint.
//!
//! Customers pay the full price into the escrow wallet with an ERC-20
//! `transfer`; the node verifies that transfer before an order is written and
//! later pays settlement legs out of escrow.

use ethers::prelude::abigen;
use ethers::types::{Address, H256, U256};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

pub mod checkout;
pub mod relay;
pub mod settlement;
pub mod verifier;

pub use checkout::{checkout, PaymentOutcome};
pub use relay::{Erc20Relay, SentTransfer, TransferStatus, WalletTransfer};
pub use settlement::SettlementExecutor;
pub use verifier::{ChainVerifier, FormatOnlyVerifier, PaymentCheck, PaymentVerifier};

pub const DEFAULT_TOKEN_DECIMALS: u32 = 18;

abigen!(
    Erc20Token,
    r#"[
        function transfer(address to, uint256 amount) external returns (bool)
        function balanceOf(address owner) external view returns (uint256)
        event Transfer(address indexed from, address indexed to, uint256 value)
    ]"#
);

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid transaction hash: {0}")]
    InvalidHash(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("invalid signer key: {0}")]
    Signer(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("transfer rejected: {0}")]
    Rejected(String),
}

pub fn parse_address(value: &str) -> PaymentResult<Address> {
    value
        .parse::<Address>()
        .map_err(|_| PaymentError::InvalidAddress(value.to_string()))
}

pub fn parse_tx_hash(value: &str) -> PaymentResult<H256> {
    let hex_part = value.strip_prefix("0x").unwrap_or(value);
    if hex_part.len() != 64 {
        return Err(PaymentError::InvalidHash(value.to_string()));
    }
    value
        .parse::<H256>()
        .map_err(|_| PaymentError::InvalidHash(value.to_string()))
}

/// Convert a token amount into base units (`amount * 10^decimals`).
/// Digits beyond `decimals` are truncated.
pub fn to_base_units(amount: Decimal, decimals: u32) -> PaymentResult<U256> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(PaymentError::InvalidAmount(format!("{amount} is negative")));
    }
    let truncated = amount
        .round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
        .normalize();
    let mantissa = u128::try_from(truncated.mantissa())
        .map_err(|_| PaymentError::InvalidAmount(amount.to_string()))?;
    let shift = decimals
        .checked_sub(truncated.scale())
        .ok_or_else(|| PaymentError::InvalidAmount(amount.to_string()))?;
    U256::from(mantissa)
        .checked_mul(U256::exp10(shift as usize))
        .ok_or_else(|| PaymentError::InvalidAmount(format!("{amount} overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn base_units_for_18_decimals() {
        let units = to_base_units(Decimal::from_str("1.5").unwrap(), 18).unwrap();
        assert_eq!(units, U256::from(15u64) * U256::exp10(17));
        assert_eq!(to_base_units(Decimal::ZERO, 18).unwrap(), U256::zero());
    }

    #[test]
    fn base_units_truncate_extra_digits() {
        let units = to_base_units(Decimal::from_str("2.1234567").unwrap(), 6).unwrap();
        assert_eq!(units, U256::from(2_123_456u64));
    }

    #[test]
    fn negative_amounts_are_rejected() {
        assert!(to_base_units(Decimal::from_str("-1").unwrap(), 6).is_err());
    }

    #[test]
    fn hash_and_address_parsing() {
        assert!(parse_tx_hash(&format!("0x{}", "11".repeat(32))).is_ok());
        assert!(parse_tx_hash("0x1234").is_err());
        assert!(parse_address("0x742d35Cc6634C0532925a3b844Bc454e4438f44e").is_ok());
        assert!(parse_address("nope").is_err());
    }
}
