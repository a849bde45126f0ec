//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use brewtrack_shared::INTERNAL_ACCESS_HEADER;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::jwt::JwtManager;
use crate::error::ApiError;

/// Roles allowed to change plans, pay, cancel or resume
pub const BILLING_MANAGER_ROLES: &[&str] = &["owner", "admin"];

/// Authenticated caller extracted from the bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: String,
    pub email: Option<String>,
}

impl AuthUser {
    pub fn can_manage_billing(&self) -> bool {
        BILLING_MANAGER_ROLES.contains(&self.role.as_str())
    }

    pub fn require_billing_manager(&self) -> Result<(), AuthError> {
        if self.can_manage_billing() {
            Ok(())
        } else {
            tracing::warn!(
                user_id = %self.user_id,
                tenant_id = %self.tenant_id,
                role = %self.role,
                "Billing action denied for role"
            );
            Err(AuthError::InsufficientPermissions)
        }
    }

    /// Reject access to another tenant's billing records
    pub fn require_tenant(&self, tenant_id: Uuid) -> Result<(), AuthError> {
        if self.tenant_id == tenant_id {
            Ok(())
        } else {
            tracing::warn!(
                user_id = %self.user_id,
                tenant_id = %self.tenant_id,
                target_tenant_id = %tenant_id,
                "Cross-tenant billing access denied"
            );
            Err(AuthError::WrongTenant)
        }
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state.jwt_manager.validate_token(token).map_err(|e| {
        tracing::debug!(error = %e, "authenticate_jwt: token rejected");
        AuthError::InvalidToken
    })?;

    Ok(AuthUser {
        user_id: claims.sub,
        tenant_id: claims.tenant_id,
        role: claims.role,
        email: claims.email,
    })
}

/// Middleware that requires a valid bearer token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => authenticate_jwt(&auth_state, token),
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                tenant_id = %auth_user.tenant_id,
                role = %auth_user.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Shared secret guarding `/internal/*`
#[derive(Clone)]
pub struct InternalAccess {
    secret: Arc<str>,
}

impl InternalAccess {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: Arc::from(secret),
        }
    }

    /// Constant-time comparison against the configured secret
    pub fn verify(&self, provided: &str) -> bool {
        !self.secret.is_empty() && bool::from(provided.as_bytes().ct_eq(self.secret.as_bytes()))
    }
}

/// Middleware for scheduler-only endpoints
pub async fn require_internal_access(
    State(access): State<InternalAccess>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(INTERNAL_ACCESS_HEADER)
        .and_then(|h| h.to_str().ok());

    match provided {
        Some(value) if access.verify(value) => next.run(request).await,
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "Internal access denied: wrong secret");
            AuthError::InvalidInternalSecret.into_response()
        }
        None => AuthError::MissingAuth.into_response(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Invalid internal access secret")]
    InvalidInternalSecret,
    #[error("Only tenant owners and admins can manage billing")]
    InsufficientPermissions,
    #[error("Subscription belongs to another tenant")]
    WrongTenant,
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingAuth | AuthError::InvalidToken | AuthError::InvalidInternalSecret => {
                ApiError::Unauthorized(err.to_string())
            }
            AuthError::InsufficientPermissions | AuthError::WrongTenant => {
                ApiError::Forbidden(err.to_string())
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
