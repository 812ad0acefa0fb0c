//! Input validation for marketplace writes

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use super::error::{MarketError, MarketResult};
use super::types::GeoPoint;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_TEXT_LEN: usize = 5000;

fn is_valid_hex(s: &str) -> bool {
    !s.is_empty() && hex::decode(s).is_ok()
}

/// Validate EVM-style address format
pub fn validate_address(address: &str) -> MarketResult<()> {
    let Some(hex_part) = address.strip_prefix("0x") else {
        return Err(MarketError::validation("wallet", "address must start with '0x'"));
    };
    if address.len() != 42 {
        return Err(MarketError::validation(
            "wallet",
            "address must be 42 characters long (including '0x')",
        ));
    }
    if !is_valid_hex(hex_part) {
        return Err(MarketError::validation(
            "wallet",
            "address contains invalid hex characters",
        ));
    }
    Ok(())
}

/// Validate transaction hash format (0x + 64 hex characters)
pub fn validate_tx_hash(hash: &str) -> MarketResult<()> {
    let hex_part = hash.strip_prefix("0x").unwrap_or(hash);
    if hex_part.len() != 64 || !is_valid_hex(hex_part) {
        return Err(MarketError::validation(
            "transaction_hash",
            "must be 64 hex characters",
        ));
    }
    Ok(())
}

pub fn validate_title(title: &str) -> MarketResult<()> {
    if title.trim().is_empty() {
        return Err(MarketError::validation("title", "cannot be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(MarketError::validation(
            "title",
            format!("cannot exceed {MAX_TITLE_LEN} characters"),
        ));
    }
    Ok(())
}

pub fn validate_description(description: &str) -> MarketResult<()> {
    if description.trim().is_empty() {
        return Err(MarketError::validation("description", "cannot be empty"));
    }
    if description.chars().count() > MAX_TEXT_LEN {
        return Err(MarketError::validation(
            "description",
            format!("cannot exceed {MAX_TEXT_LEN} characters"),
        ));
    }
    Ok(())
}

pub fn validate_price(price: Decimal) -> MarketResult<()> {
    if price.is_sign_negative() && !price.is_zero() {
        return Err(MarketError::validation("price", "cannot be negative"));
    }
    Ok(())
}

pub fn validate_location(location: &GeoPoint) -> MarketResult<()> {
    if !location.is_valid() {
        return Err(MarketError::validation(
            "location",
            "latitude must be within ±90 and longitude within ±180",
        ));
    }
    Ok(())
}

/// Execution time may not lie in the past (minus `tolerance`) or further
/// ahead than `max_ahead`
pub fn validate_execution_time(
    at: DateTime<Utc>,
    now: DateTime<Utc>,
    tolerance: Duration,
    max_ahead: Duration,
) -> MarketResult<()> {
    if at < now - tolerance {
        return Err(MarketError::validation(
            "execution_time",
            "cannot be in the past",
        ));
    }
    if at > now + max_ahead {
        return Err(MarketError::validation(
            "execution_time",
            "cannot be more than a year ahead",
        ));
    }
    Ok(())
}
