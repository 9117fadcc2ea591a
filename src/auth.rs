//! Tenant authentication
//!
//! Every upload request carries a signed token whose subject claim names the
//! tenant. Token issuance and policy live elsewhere; this module only checks
//! the signature and pulls the subject out.

use std::collections::HashSet;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::state::AppState;
use crate::upload::types::validate_component;

/// Alternate header carrying the raw token
pub const JWT_HEADER: &str = "x-jwt";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("invalid tenant: {0}")]
    InvalidTenant(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        tracing::debug!(error = %self, "Request rejected");
        let body = Json(serde_json::json!({
            "error": "Forbidden",
            "code": "FORBIDDEN",
        }));
        (StatusCode::FORBIDDEN, body).into_response()
    }
}

/// Signature check for tenant tokens
pub trait TokenVerifier: Send + Sync {
    /// Validate `token` and return its subject
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// HS256 verifier with an optional issuer check
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8], issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::from(["sub".to_string()]);
        validation.validate_aud = false;
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(data.claims.sub)
    }
}

/// Bearer token from `Authorization`, falling back to `X-jwt`.
/// The scheme is matched case-insensitively.
fn extract_token(parts: &Parts) -> Option<&str> {
    let bearer = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        });

    bearer.or_else(|| {
        parts
            .headers
            .get(JWT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    })
}

/// Authenticated tenant id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant(pub String);

#[axum::async_trait]
impl FromRequestParts<AppState> for Tenant {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = extract_token(parts).ok_or(AuthError::MissingToken)?;
        let subject = state.token_verifier().verify(token)?;

        validate_component(&subject).map_err(|_| AuthError::InvalidTenant(subject.clone()))?;
        Ok(Tenant(subject))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &[u8], claims: &Claims) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn claims(sub: &str, iss: Option<&str>) -> Claims {
        Claims {
            sub: sub.to_string(),
            exp: Some(chrono::Utc::now().timestamp() as u64 + 3600),
            iss: iss.map(str::to_string),
        }
    }

    #[test]
    fn test_valid_token_yields_subject() {
        let verifier = JwtVerifier::new(b"secret", None);
        let subject = verifier.verify(&token(b"secret", &claims("tenant-a", None))).unwrap();
        assert_eq!(subject, "tenant-a");
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let verifier = JwtVerifier::new(b"secret", None);
        let result = verifier.verify(&token(b"other", &claims("tenant-a", None)));
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_issuer_is_checked_when_configured() {
        let verifier = JwtVerifier::new(b"secret", Some("relay"));
        assert!(verifier.verify(&token(b"secret", &claims("t", Some("relay")))).is_ok());
        assert!(verifier.verify(&token(b"secret", &claims("t", Some("elsewhere")))).is_err());
    }

    #[test]
    fn test_extract_token_headers() {
        let (parts, _) = axum::http::Request::builder()
            .header(AUTHORIZATION, "bearer abc")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(extract_token(&parts), Some("abc"));

        let (parts, _) = axum::http::Request::builder()
            .header(JWT_HEADER, "xyz")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(extract_token(&parts), Some("xyz"));

        let (parts, _) = axum::http::Request::builder().body(()).unwrap().into_parts();
        assert_eq!(extract_token(&parts), None);
    }
}
