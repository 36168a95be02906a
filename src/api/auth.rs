//! Bearer JWT auth for the task API.
//!
//! - Callers send `Authorization: Bearer <jwt>` signed with `JWT_SECRET` (HS256)
//! - The `sub` claim is the caller's user id
//! - The resolved caller is attached to the request as an `AuthUser` extension

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{DecodingKey, Validation};
use std::sync::Arc;

use super::routes::AppState;
use crate::task::TaskError;
use crate::util::bearer_token;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Claims {
    /// Subject: the user id
    sub: String,
    /// Expiration unix seconds
    exp: i64,
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
}

fn verify_jwt(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

/// Resolve the caller from an `Authorization` header value.
///
/// # Errors
/// `TaskError::Unauthorized` for a missing header or an invalid token.
pub fn resolve_caller(header: Option<&str>, secret: &str) -> Result<AuthUser, TaskError> {
    let token = header
        .and_then(bearer_token)
        .ok_or_else(|| TaskError::Unauthorized("Authorization header required".to_string()))?;

    let invalid = || TaskError::Unauthorized("Invalid auth user".to_string());
    match verify_jwt(token, secret) {
        Ok(claims) if !claims.sub.trim().is_empty() => Ok(AuthUser { id: claims.sub }),
        Ok(_) => Err(invalid()),
        Err(e) => {
            tracing::debug!("Rejected bearer token: {}", e);
            Err(invalid())
        }
    }
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    match resolve_caller(header, &state.config.jwt_secret) {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(rejection) => rejection.into_response(),
    }
}

/// Sign a token for `user` (test fixture).
#[cfg(test)]
pub(crate) fn issue_token(secret: &str, user: &str, ttl_secs: i64) -> String {
    let claims = Claims {
        sub: user.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
