/*!
 * # Authentication and Authorization
 *
 * Bearer tokens are HS256 JWTs issued elsewhere; this module only validates
 * them and turns their claims into a typed [`AuthUser`]. Management routes
 * additionally require the `admin` role, or the configured override key in
 * `X-Override-Key`.
 */

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::ErrorResponse;

/// Role marking elevated privilege
pub const ADMIN_ROLE: &str = "admin";

/// Header carrying the admin override key
pub const OVERRIDE_KEY_HEADER: &str = "x-override-key";

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,   // Subject (user ID)
    pub email: String, // User's email
    #[serde(default, alias = "roles")]
    pub role: Vec<String>,
    pub exp: usize, // Expiration time
}

/// Authenticated identity attached to the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub subject_id: String,
    pub email: String,
    pub roles: HashSet<String>,
}

impl AuthUser {
    pub fn new<I, S>(subject_id: impl Into<String>, email: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subject_id: subject_id.into(),
            email: email.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// Identity granted by a matching override key
    pub fn override_admin() -> Self {
        Self::new("override_admin", "admin@example.com", [ADMIN_ROLE])
    }

    /// Check if the user has a specific role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Check if the user is an admin
    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self::new(claims.sub, claims.email, claims.role)
    }
}

/// Raw bearer token of the current request, forwarded to the shipping service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(pub String);

/// Authentication error types
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Insufficient permissions")]
    InsufficientPermissions,
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InsufficientPermissions => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "AUTH_MISSING_TOKEN",
            Self::InvalidToken => "AUTH_INVALID_TOKEN",
            Self::TokenExpired => "AUTH_TOKEN_EXPIRED",
            Self::InsufficientPermissions => "AUTH_INSUFFICIENT_PERMISSIONS",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::new(status, self.code(), self.to_string());
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Validates bearer tokens and resolves admin access
#[derive(Clone)]
pub struct AuthService {
    decoding_key: DecodingKey,
    validation: Validation,
    override_key: Option<String>,
}

impl AuthService {
    pub fn new(jwt_secret: &str, override_key: Option<String>) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            override_key: override_key.filter(|key| !key.is_empty()),
        }
    }

    /// Validate a JWT token and extract the claims
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => {
                    debug!(error = %e, "rejected bearer token");
                    AuthError::InvalidToken
                }
            })
    }

    /// Resolves the caller from the `Authorization: Bearer` header
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(AuthUser, BearerToken), AuthError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let claims = self.validate_token(token)?;
        Ok((AuthUser::from(claims), BearerToken(token.to_string())))
    }

    /// Admin access: a matching override key wins, otherwise the caller must
    /// hold the admin role.
    pub fn authorize_admin(&self, headers: &HeaderMap, user: AuthUser) -> Result<AuthUser, AuthError> {
        let presented = headers
            .get(OVERRIDE_KEY_HEADER)
            .and_then(|value| value.to_str().ok());

        if let (Some(expected), Some(presented)) = (self.override_key.as_deref(), presented) {
            if expected == presented {
                return Ok(AuthUser::override_admin());
            }
            warn!(subject = %user.subject_id, "override key mismatch");
        }

        if user.is_admin() {
            Ok(user)
        } else {
            Err(AuthError::InsufficientPermissions)
        }
    }
}

/// Authentication middleware that extracts and validates the bearer token
pub async fn auth_middleware(
    State(auth): State<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let (user, token) = auth.authenticate(request.headers())?;
    request.extensions_mut().insert(user);
    request.extensions_mut().insert(token);
    Ok(next.run(request).await)
}

/// Authentication plus admin authorization
pub async fn admin_middleware(
    State(auth): State<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let (user, token) = auth.authenticate(request.headers())?;
    let user = auth.authorize_admin(request.headers(), user)?;
    request.extensions_mut().insert(user);
    request.extensions_mut().insert(token);
    Ok(next.run(request).await)
}

/// Extension methods for Router to add auth middleware
pub trait AuthRouterExt {
    fn with_auth(self, auth: Arc<AuthService>) -> Self;
    fn with_admin(self, auth: Arc<AuthService>) -> Self;
}

impl<S> AuthRouterExt for axum::Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn with_auth(self, auth: Arc<AuthService>) -> Self {
        self.layer(axum::middleware::from_fn_with_state(auth, auth_middleware))
    }

    fn with_admin(self, auth: Arc<AuthService>) -> Self {
        self.layer(axum::middleware::from_fn_with_state(auth, admin_middleware))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit_test_secret_with_enough_length_123";

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn valid_token_yields_typed_identity() {
        let auth = AuthService::new(SECRET, None);
        let jwt = token(serde_json::json!({
            "sub": "42", "email": "u@example.com", "role": ["admin", "ops"], "exp": future_exp()
        }));

        let (user, bearer_token) = auth.authenticate(&bearer(&jwt)).unwrap();
        assert_eq!(user.subject_id, "42");
        assert!(user.is_admin());
        assert!(user.has_role("ops"));
        assert_eq!(bearer_token, BearerToken(jwt));
    }

    #[test]
    fn roles_default_to_empty_and_accept_alias() {
        let auth = AuthService::new(SECRET, None);

        let jwt = token(serde_json::json!({"sub": "1", "email": "a@b.c", "exp": future_exp()}));
        assert!(auth.validate_token(&jwt).unwrap().role.is_empty());

        let jwt = token(serde_json::json!({
            "sub": "1", "email": "a@b.c", "roles": ["admin"], "exp": future_exp()
        }));
        assert_eq!(auth.validate_token(&jwt).unwrap().role, vec!["admin"]);
    }

    #[test]
    fn missing_email_is_invalid() {
        let auth = AuthService::new(SECRET, None);
        let jwt = token(serde_json::json!({"sub": "1", "exp": future_exp()}));
        assert_matches!(auth.validate_token(&jwt), Err(AuthError::InvalidToken));
    }

    #[test]
    fn expired_token_is_distinguished() {
        let auth = AuthService::new(SECRET, None);
        let jwt = token(serde_json::json!({
            "sub": "1", "email": "a@b.c", "exp": chrono::Utc::now().timestamp() - 3600
        }));
        assert_matches!(auth.validate_token(&jwt), Err(AuthError::TokenExpired));
    }

    #[test]
    fn wrong_secret_and_missing_header_are_rejected() {
        let auth = AuthService::new("another_secret_that_is_long_enough_000", None);
        let jwt = token(serde_json::json!({"sub": "1", "email": "a@b.c", "exp": future_exp()}));
        assert_matches!(auth.authenticate(&bearer(&jwt)), Err(AuthError::InvalidToken));
        assert_matches!(auth.authenticate(&HeaderMap::new()), Err(AuthError::MissingToken));
    }

    #[test]
    fn override_key_grants_admin() {
        let auth = AuthService::new(SECRET, Some("let-me-in".into()));
        let user = AuthUser::new("7", "u@example.com", Vec::<String>::new());

        let mut headers = HeaderMap::new();
        headers.insert(OVERRIDE_KEY_HEADER, HeaderValue::from_static("let-me-in"));
        assert_eq!(
            auth.authorize_admin(&headers, user.clone()).unwrap(),
            AuthUser::override_admin()
        );

        headers.insert(OVERRIDE_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert_matches!(
            auth.authorize_admin(&headers, user),
            Err(AuthError::InsufficientPermissions)
        );
    }

    #[test]
    fn unauthorized_responses_carry_www_authenticate() {
        let response = AuthError::TokenExpired.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let response = AuthError::InsufficientPermissions.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
