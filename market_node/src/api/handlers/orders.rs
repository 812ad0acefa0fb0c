use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::api::errors::ApiResult;
use crate::api::server::AppState;
use crate::market::service::{NewOrder, OrderEdit, OrderSummary, OrderTab, OrderView};
use crate::market::{Order, OrderAction, OrderId};
use crate::policy::AuthUser;

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub action: OrderAction,
    /// Rejects the move if the order changed since it was read
    pub expected_version: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrdersQuery {
    #[serde(default)]
    pub tab: OrderTab,
}

/// Place an order on the map; paid orders carry the escrow transaction hash
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<NewOrder>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<OrderView>)> {
    let Json(input) = payload?;
    let view = state.service.create_order(&user.id, input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<OrderId>, PathRejection>,
) -> ApiResult<Json<OrderView>> {
    let Path(id) = id?;
    Ok(Json(state.service.get_order(&user.id, id).await?))
}

pub async fn edit_order(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<OrderId>, PathRejection>,
    payload: Result<Json<OrderEdit>, JsonRejection>,
) -> ApiResult<Json<OrderView>> {
    let Path(id) = id?;
    let Json(edit) = payload?;
    Ok(Json(state.service.edit_order(&user.id, id, edit).await?))
}

pub async fn transition_order(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<OrderId>, PathRejection>,
    payload: Result<Json<TransitionRequest>, JsonRejection>,
) -> ApiResult<Json<Order>> {
    let Path(id) = id?;
    let Json(req) = payload?;
    let order = state
        .service
        .act(&user.id, id, req.action, req.expected_version)
        .await?;
    Ok(Json(order))
}

/// The caller's orders on either side, filtered by tab
pub async fn my_orders(
    State(state): State<AppState>,
    user: AuthUser,
    query: Result<Query<OrdersQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<OrderSummary>>> {
    let Query(query) = query?;
    Ok(Json(state.service.my_orders(&user.id, query.tab).await?))
}
