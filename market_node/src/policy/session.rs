use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Claims of an access token from the auth provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
    pub aud: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Caller identity once the bearer token checks out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("missing bearer token")]
    Missing,
    #[error("session expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Verifies HS256 access tokens signed with the provider's JWT secret
pub struct SessionValidator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    audience: String,
    session_ttl: u64, // Seconds
}

impl SessionValidator {
    pub fn new(secret: &str, audience: &str, session_ttl: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);
        validation.leeway = 30;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            audience: audience.to_string(),
            session_ttl,
        }
    }

    pub fn validate(&self, token: &str) -> Result<AuthUser, SessionError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => SessionError::Expired,
                _ => SessionError::Invalid(e.to_string()),
            }
        })?;
        Ok(AuthUser {
            id: data.claims.sub,
            email: data.claims.email,
        })
    }

    pub fn validate_header(&self, header: Option<&str>) -> Result<AuthUser, SessionError> {
        let token = parse_bearer_token(header).ok_or(SessionError::Missing)?;
        self.validate(&token)
    }

    /// Sign a token for `user`; used by local tooling and tests
    pub fn issue(&self, user: Uuid, email: Option<String>) -> Result<String, SessionError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SessionError::Invalid(e.to_string()))?
            .as_secs();
        let claims = Claims {
            sub: user,
            exp: now + self.session_ttl,
            iat: now,
            aud: self.audience.clone(),
            email,
            role: Some("authenticated".to_string()),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SessionError::Invalid(e.to_string()))
    }
}

pub fn parse_bearer_token(header: Option<&str>) -> Option<String> {
    header?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates() {
        let sessions = SessionValidator::new("secret", "authenticated", 3600);
        let user = Uuid::new_v4();
        let token = sessions.issue(user, Some("a@b.c".into())).unwrap();

        let auth = sessions
            .validate_header(Some(&format!("Bearer {token}")))
            .unwrap();
        assert_eq!(auth.id, user);
        assert_eq!(auth.email.as_deref(), Some("a@b.c"));
    }

    #[test]
    fn wrong_secret_or_audience_is_rejected() {
        let issuer = SessionValidator::new("secret", "authenticated", 3600);
        let token = issuer.issue(Uuid::new_v4(), None).unwrap();

        let other_secret = SessionValidator::new("other", "authenticated", 3600);
        assert!(matches!(other_secret.validate(&token), Err(SessionError::Invalid(_))));

        let other_audience = SessionValidator::new("secret", "service", 3600);
        assert!(matches!(other_audience.validate(&token), Err(SessionError::Invalid(_))));
    }

    #[test]
    fn expired_token_is_reported() {
        let sessions = SessionValidator::new("secret", "authenticated", 3600);
        let claims = Claims {
            sub: Uuid::new_v4(),
            exp: 1_000,
            iat: 0,
            aud: "authenticated".into(),
            email: None,
            role: None,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"secret")).unwrap();
        assert_eq!(sessions.validate(&token), Err(SessionError::Expired));
    }

    #[test]
    fn test_parse_bearer_token() {
        assert_eq!(
            parse_bearer_token(Some("Bearer abc123")),
            Some("abc123".to_string())
        );
        assert_eq!(parse_bearer_token(Some("Invalid format")), None);
        assert_eq!(parse_bearer_token(Some("Bearer ")), None);
        assert_eq!(parse_bearer_token(None), None);
    }
}
