use axum::{
    extract::{rejection::JsonRejection, rejection::PathRejection, Multipart, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::errors::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::market::service::{MapUser, ProfileCard, ProfileUpdate};
use crate::market::{GeoPoint, Profile};
use crate::policy::AuthUser;

/// Request to show or hide the caller on the map
#[derive(Debug, Deserialize)]
pub struct LocationRequest {
    pub visible: bool,
    /// Required when `visible`
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Serialize)]
pub struct AvatarResponse {
    pub avatar_url: String,
}

pub async fn get_my_profile(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Profile>> {
    Ok(Json(state.service.get_profile(&user.id).await?))
}

/// Create or update the caller's profile
pub async fn save_profile(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<ProfileUpdate>, JsonRejection>,
) -> ApiResult<Json<Profile>> {
    let Json(update) = payload?;
    Ok(Json(state.service.save_profile(&user.id, update).await?))
}

/// Multipart upload with the image in the `file` field
pub async fn upload_avatar(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<Json<AvatarResponse>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(&e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::validation_error("file", "missing file name"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(&e.body_text()))?;
        if bytes.len() > state.max_upload_bytes {
            return Err(ApiError::payload_too_large(state.max_upload_bytes));
        }

        let avatar_url = state
            .service
            .upload_avatar(&user.id, &file_name, bytes.to_vec())
            .await?;
        return Ok(Json(AvatarResponse { avatar_url }));
    }
    Err(ApiError::validation_error("file", "multipart field 'file' is required"))
}

pub async fn set_location(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<LocationRequest>, JsonRejection>,
) -> ApiResult<Json<Profile>> {
    let Json(req) = payload?;
    let profile = state
        .service
        .set_location_visibility(&user.id, req.visible, req.location)
        .await?;
    Ok(Json(profile))
}

/// Public card of another user with their scenarios
pub async fn get_profile_card(
    State(state): State<AppState>,
    _user: AuthUser,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<ProfileCard>> {
    let Path(id) = id?;
    Ok(Json(state.service.profile_card(&id).await?))
}

pub async fn map_users(State(state): State<AppState>) -> ApiResult<Json<Vec<MapUser>>> {
    Ok(Json(state.service.public_map_users().await?))
}
