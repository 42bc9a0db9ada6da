//! Request authentication
//!
//! Two kinds of bearer tokens are accepted:
//! - static end-user tokens from the settings
//! - HS256 service JWTs whose `role` claim names the calling service
//!
//! A service call carries the end user in the `X-Paas-User` header or the
//! `username` claim. `internal-sys` calls without one act as `admin`.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::state::AppState;
use crate::error::EngineError;
use crate::settings::AuthSettings;

pub const USER_HEADER: &str = "x-paas-user";
pub const ADMIN_USER: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "internal-sys")]
    InternalSys,
    #[serde(rename = "internal_platform")]
    InternalPlatform,
    #[serde(rename = "default")]
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceClaims {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub exp: usize,
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::InternalSys
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.role, Role::InternalSys | Role::InternalPlatform)
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(EngineError::Forbidden("admin role required".into()).into())
        }
    }

    pub fn require_internal(&self) -> Result<(), ApiError> {
        if self.is_internal() {
            Ok(())
        } else {
            Err(EngineError::Forbidden("internal service role required".into()).into())
        }
    }
}

/// Resolve the caller from a bearer token and the optional user header
pub fn authenticate_token(
    settings: &AuthSettings,
    token: &str,
    user_header: Option<&str>,
) -> Result<Principal, EngineError> {
    if let Some(username) = settings.user_tokens.get(token) {
        return Ok(Principal {
            username: username.clone(),
            role: Role::Default,
        });
    }
    if settings.jwt_secret.is_empty() {
        return Err(EngineError::Unauthorized);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let claims = decode::<ServiceClaims>(
        token,
        &DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!("service token rejected: {}", e);
        EngineError::Unauthorized
    })?
    .claims;

    let user = user_header
        .map(str::to_string)
        .or(claims.username)
        .filter(|u| !u.is_empty());
    let username = match (user, claims.role) {
        (Some(user), _) => user,
        (None, Role::InternalSys) => ADMIN_USER.to_string(),
        (None, _) => return Err(EngineError::Unauthorized),
    };
    Ok(Principal {
        username,
        role: claims.role,
    })
}

/// Sign a service token, used by the CLI and tests
pub fn issue_token(secret: &str, role: Role, username: Option<&str>, ttl_secs: i64) -> Result<String, EngineError> {
    let exp = (chrono::Utc::now().timestamp() + ttl_secs).max(0) as usize;
    let claims = ServiceClaims {
        role,
        username: username.map(str::to_string),
        exp,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| EngineError::Internal(format!("signing token failed: {}", e)))
}

/// Middleware inserting the [`Principal`] into request extensions
pub async fn require_auth(State(state): State<AppState>, mut request: Request<Body>, next: Next) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let Some(token) = token else {
        return ApiError(EngineError::Unauthorized).into_response();
    };
    let user = request
        .headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok());

    match authenticate_token(&state.engine.settings.auth, token, user) {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn settings() -> AuthSettings {
        AuthSettings {
            jwt_secret: "jwt-secret".into(),
            user_tokens: BTreeMap::from([("tok-alice".to_string(), "alice".to_string())]),
        }
    }

    #[test]
    fn test_static_user_token() {
        let principal = authenticate_token(&settings(), "tok-alice", None).unwrap();
        assert_eq!(principal.username, "alice");
        assert!(!principal.is_internal());
    }

    #[test]
    fn test_internal_sys_without_user_is_admin() {
        let token = issue_token("jwt-secret", Role::InternalSys, None, 60).unwrap();
        let principal = authenticate_token(&settings(), &token, None).unwrap();
        assert_eq!(principal.username, ADMIN_USER);
        assert!(principal.is_admin());

        let principal = authenticate_token(&settings(), &token, Some("bob")).unwrap();
        assert_eq!(principal.username, "bob");
    }

    #[test]
    fn test_platform_role_needs_user() {
        let token = issue_token("jwt-secret", Role::InternalPlatform, None, 60).unwrap();
        assert!(matches!(
            authenticate_token(&settings(), &token, None),
            Err(EngineError::Unauthorized)
        ));
        let principal = authenticate_token(&settings(), &token, Some("carol")).unwrap();
        assert!(principal.is_internal());
        assert!(principal.require_admin().is_err());
    }

    #[test]
    fn test_bad_signature_and_expiry() {
        let forged = issue_token("other", Role::InternalSys, None, 60).unwrap();
        assert!(authenticate_token(&settings(), &forged, None).is_err());
        let expired = issue_token("jwt-secret", Role::InternalSys, None, -3600).unwrap();
        assert!(authenticate_token(&settings(), &expired, None).is_err());
    }
}
