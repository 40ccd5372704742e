//! Shared plumbing for the clinical trials ETL workspace.
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Currently this is the logging setup used by every binary in the
//! workspace. Pipeline types live in `ctgov-etl`.
//!
//! # Example
//!
//! ```no_run
//! use ctgov_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("started");
//!     Ok(())
//! }
//! ```

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogGuard, LogLevel, LogOutput};
