//! Error taxonomy shared by the registry and the delivery pipeline.
//!
//! Every NI-DAQmx call reports a signed status: zero on success, a negative code when the
//! operation failed and a positive code when it completed with a caveat (a coerced range, a
//! slower than requested rate, ...). Negative statuses become [`DriverError`] and abort the
//! operation; positive statuses become [`DriverWarning`] and travel *next to* a successful
//! result instead of replacing it.
//!
//! Local misuse of the registry (duplicate names, stale session references, operations that
//! are not valid in the current lifecycle phase) is reported through the remaining
//! [`DaqError`] variants and never reaches the driver.

use thiserror::Error;

use crate::session::Lifecycle;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = Result<T, DaqError>;

/// A negative driver status: the operation did not complete as requested.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("DAQmx error {code}: {message}")]
pub struct DriverError {
    pub code: i32,
    pub message: String,
}

/// A positive driver status: the operation completed, with a caveat.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("DAQmx warning {code}: {message}")]
pub struct DriverWarning {
    pub code: i32,
    pub message: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaqError {
    #[error("session `{0}` is already registered")]
    DuplicateSession(String),

    #[error("no session `{0}` is registered")]
    UnknownSession(String),

    #[error("session `{session}` cannot {operation} while {state}")]
    InvalidState {
        session: String,
        operation: &'static str,
        state: Lifecycle,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The producer of a delivery queue ended without a driver error.
    #[error("delivery stopped: {0}")]
    Delivery(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl DaqError {
    /// The driver status code behind this error, if it came from the driver.
    pub fn driver_code(&self) -> Option<i32> {
        match self {
            DaqError::Driver(err) => Some(err.code),
            _ => None,
        }
    }
}
