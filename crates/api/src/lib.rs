// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError::StateConflict carries the status and message
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Brewtrack API Library
//!
//! HTTP surface of the billing core: tenant billing endpoints, the payment
//! gateway webhook and the scheduler-facing sweep endpoints.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
