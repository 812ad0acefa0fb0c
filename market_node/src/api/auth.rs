//! Bearer token extractors

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::api::errors::ApiError;
use crate::api::server::AppState;
use crate::policy::AuthUser;

fn authorization(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        state
            .sessions
            .validate_header(authorization(parts))
            .map_err(|e| {
                log::debug!("Rejected {} {}: {}", parts.method, parts.uri.path(), e);
                ApiError::from(e)
            })
    }
}

/// Caller identity when a token is present. A bad token is still rejected.
pub struct MaybeUser(pub Option<AuthUser>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if authorization(parts).is_none() {
            return Ok(MaybeUser(None));
        }
        AuthUser::from_request_parts(parts, state)
            .await
            .map(|user| MaybeUser(Some(user)))
    }
}

impl MaybeUser {
    pub fn required(self) -> Result<AuthUser, ApiError> {
        self.0
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))
    }
}
