// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError carries provider messages
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Shipmail API Library
//!
//! HTTP server components: authentication, routes, and the campaign and
//! lead services that sit around the credit ledger.

pub mod auth;
pub mod campaigns;
pub mod config;
pub mod error;
pub mod leads;
pub mod routes;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
