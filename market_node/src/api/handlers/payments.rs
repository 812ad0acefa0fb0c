use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::errors::{ApiError, ApiResult};
use crate::api::server::{AppState, PaymentInfo};
use crate::payment::PaymentCheck;

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub transaction_hash: String,
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub transaction_hash: String,
    pub check: PaymentCheck,
    /// Hash already backs an order
    pub used_by_order: Option<u64>,
}

pub async fn payment_config(State(state): State<AppState>) -> Json<PaymentInfo> {
    Json(state.payment.clone())
}

/// Check an escrow transfer before submitting the order that uses it
pub async fn verify_payment(
    State(state): State<AppState>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> ApiResult<Json<VerifyResponse>> {
    let Json(req) = payload?;
    if req.amount <= Decimal::ZERO {
        return Err(ApiError::validation_error("amount", "must be positive"));
    }
    let check = state.verifier.verify(&req.transaction_hash, req.amount).await?;
    let used_by_order = state
        .service
        .store()
        .find_order_by_transaction(&req.transaction_hash)
        .await?;
    Ok(Json(VerifyResponse {
        transaction_hash: req.transaction_hash,
        check,
        used_by_order,
    }))
}
