use axum::{
    extract::{rejection::JsonRejection, rejection::PathRejection, Path, State},
    http::StatusCode,
    Json,
};

use crate::api::errors::ApiResult;
use crate::api::server::AppState;
use crate::market::service::{NewScenario, ScenarioWithCreator};
use crate::market::{Order, Scenario, ScenarioId};
use crate::policy::AuthUser;

/// Catalog of every scenario with its creator, newest first
pub async fn catalog(State(state): State<AppState>) -> ApiResult<Json<Vec<ScenarioWithCreator>>> {
    Ok(Json(state.service.scenarios_with_creator().await?))
}

pub async fn create_scenario(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<NewScenario>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Scenario>)> {
    let Json(input) = payload?;
    let scenario = state.service.create_scenario(&user.id, input).await?;
    Ok((StatusCode::CREATED, Json(scenario)))
}

pub async fn my_scenarios(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Vec<Scenario>>> {
    Ok(Json(state.service.list_my_scenarios(&user.id).await?))
}

pub async fn delete_scenario(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<ScenarioId>, PathRejection>,
) -> ApiResult<Json<Scenario>> {
    let Path(id) = id?;
    Ok(Json(state.service.delete_scenario(&user.id, id).await?))
}

/// Order a catalog scenario from its creator
pub async fn accept_scenario(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<ScenarioId>, PathRejection>,
) -> ApiResult<(StatusCode, Json<Order>)> {
    let Path(id) = id?;
    let order = state.service.accept_scenario(&user.id, id).await?;
    Ok((StatusCode::CREATED, Json(order)))
}
