//! Authentication module for Brewtrack

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
pub use middleware::{
    require_auth, require_internal_access, AuthError, AuthState, AuthUser, InternalAccess,
    BILLING_MANAGER_ROLES,
};
