//! AutoPO common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared pieces used by every workspace member:
//!
//! - **Error handling**: [`AutopoError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Environment**: typed lookups for the configuration loaders

pub mod env;
pub mod error;
pub mod logging;

pub use error::{AutopoError, Result};
