use thiserror::Error;

use super::order_lifecycle::TransitionError;
use crate::payment::PaymentError;
use crate::storage::StorageError;

pub type MarketResult<T> = Result<T, MarketError>;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payment required: {0}")]
    PaymentRequired(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error(transparent)]
    Payment(#[from] PaymentError),
}

impl MarketError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        MarketError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        MarketError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

impl From<StorageError> for MarketError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(msg) => MarketError::Conflict(msg),
            StorageError::NotFound(key) => MarketError::NotFound {
                entity: "record",
                id: key,
            },
            other => MarketError::Storage(other),
        }
    }
}
