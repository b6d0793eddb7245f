//! Console HTTP API module.
//!
//! # Purpose
//! Route handlers for the action endpoint and system health checks, the shared error
//! shape, and the OpenAPI document.
pub mod actions;
pub mod error;
pub mod openapi;
pub mod system;
pub mod types;

/// Header carrying the caller's username.
pub const USER_HEADER: &str = "x-console-user";
/// Optional request id echoed back in error bodies.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
