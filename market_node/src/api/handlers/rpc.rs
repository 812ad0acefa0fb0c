//! Named read queries under `/rpc/{name}`, kept for clients written against
//! the hosted backend's stored procedures.

use axum::{
    extract::{rejection::PathRejection, Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use crate::api::auth::MaybeUser;
use crate::api::errors::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::market::service::OrderTab;

#[derive(Debug, Default, Deserialize)]
pub struct RpcParams {
    pub tab: Option<OrderTab>,
}

pub async fn call(
    State(state): State<AppState>,
    user: MaybeUser,
    name: Result<Path<String>, PathRejection>,
    Query(params): Query<RpcParams>,
) -> ApiResult<Json<Value>> {
    let Path(name) = name?;
    let service = &state.service;

    let value: Result<Value, serde_json::Error> = match name.as_str() {
        "get_all_scenarios_with_creator" => serde_json::to_value(&service.scenarios_with_creator().await?),
        "get_public_map_users" => serde_json::to_value(&service.public_map_users().await?),
        "get_incoming_requests" => {
            let user = user.required()?;
            serde_json::to_value(&service.incoming_requests(&user.id).await?)
        }
        "get_my_created_orders" => {
            let user = user.required()?;
            serde_json::to_value(&service.my_created_orders(&user.id).await?)
        }
        "get_my_accepted_orders" => {
            let user = user.required()?;
            serde_json::to_value(&service.my_accepted_orders(&user.id).await?)
        }
        "get_my_orders" => {
            let user = user.required()?;
            let tab = params.tab.unwrap_or_default();
            serde_json::to_value(&service.my_orders(&user.id, tab).await?)
        }
        other => return Err(ApiError::not_found(&format!("unknown function: {other}"))),
    };

    value.map(Json).map_err(|e| {
        log::error!("Failed to encode {} result: {}", name, e);
        ApiError::internal_server_error("failed to encode result")
    })
}
