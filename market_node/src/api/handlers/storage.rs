use axum::{
    extract::{rejection::PathRejection, Path, State},
    http::header,
    response::{IntoResponse, Response},
};

use crate::api::errors::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::storage::StorageError;

/// Serve a stored object with its content type
pub async fn get_object(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
) -> ApiResult<Response> {
    let Path((bucket, object_path)) = path?;
    let object = state
        .objects
        .get(&bucket, &object_path)
        .await
        .map_err(|e| match e {
            StorageError::InvalidData(_) => ApiError::bad_request(&e.to_string()),
            other => ApiError::from(other),
        })?
        .ok_or_else(|| ApiError::not_found("object not found"))?;
    Ok((
        [
            (header::CONTENT_TYPE, object.content_type),
            (header::CACHE_CONTROL, "public, max-age=3600".to_string()),
        ],
        object.bytes,
    )
        .into_response())
}
