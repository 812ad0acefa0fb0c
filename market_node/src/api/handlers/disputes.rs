use axum::{
    extract::{rejection::JsonRejection, rejection::PathRejection, Path, State},
    Json,
};
use serde::Deserialize;

use crate::api::errors::ApiResult;
use crate::api::server::AppState;
use crate::market::service::DisputeView;
use crate::market::{OrderId, VoteSide};
use crate::policy::AuthUser;

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub vote_side: VoteSide,
}

pub async fn get_dispute(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<OrderId>, PathRejection>,
) -> ApiResult<Json<DisputeView>> {
    let Path(id) = id?;
    Ok(Json(state.service.dispute_view(&user.id, id).await?))
}

/// One vote per outside user; may resolve the dispute
pub async fn cast_vote(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<OrderId>, PathRejection>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> ApiResult<Json<DisputeView>> {
    let Path(id) = id?;
    let Json(req) = payload?;
    Ok(Json(state.service.cast_vote(&user.id, id, req.vote_side).await?))
}
