//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DaqError`. Using the `thiserror`
//! crate, it gives every controller, session and sweep driver one consistent
//! error vocabulary.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the bus address could not be opened.
//! - **`Instrument`**: a write or query was rejected by the bus or the instrument.
//! - **`Timeout`**: a write or query did not complete within the session timeout.
//! - **`Parse`**: a response did not have the expected numeric shape.
//! - **`InvalidState`**: an operation was requested from a state that does not
//!   allow it, e.g. enabling bias output twice or measuring before configuring.
//! - **`InvalidValue`**: an argument or configured value is outside the accepted set.
//! - **`Cancelled`**: the shutdown signal fired during an interruptible delay.
//! - **`Config`** / **`Configuration`**: loading or validating settings failed.
//! - **`ShutdownFailed`**: one or more teardown commands failed during release.
//!
//! None of these are retried. Every failure propagates to the caller with `?`.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by sessions, controllers and sweep drivers.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Operation cancelled by shutdown signal")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Shutdown failed with errors: {0:?}")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
