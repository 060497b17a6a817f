//! Configuration for the Strand runtime
//!
//! Values resolve in priority order: built-in defaults, then `STRAND_*`
//! environment variables. Accelerator-specific flags (`cublas_init`,
//! `gpu_warmup`, overlap toggles) are carried for the device address spaces
//! to observe; the core never interprets them.

pub mod config;

pub use config::RuntimeConfig;

use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value failed to parse or validate
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name
        field: String,
        /// What was wrong
        message: String,
    },
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
