//! Custom error types for mavdrive.
//!
//! Each boundary of the driver has its own error enum: the vehicle link
//! reports [`LinkError`], the dispatcher reports [`DispatchError`], and the
//! driver surface (configuration, sockets, startup) reports [`DriverError`].
//! Navigation failures are not errors at all; they travel inside
//! [`crate::navigator::NavigationOutcome`].

use crate::navigator::NavFailure;
use std::io;
use thiserror::Error;

/// Main error type for driver startup.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Configuration-related errors (parsing, validation, missing files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket errors while bringing up the vehicle link
    #[error("Network error on endpoint '{endpoint}': {source}")]
    Network {
        /// Address of the endpoint that failed
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

/// Type alias for Results that use DriverError
pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new network error
    pub fn network(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            source,
        }
    }
}

impl From<anyhow::Error> for DriverError {
    fn from(err: anyhow::Error) -> Self {
        Self::Config(format!("{:#}", err))
    }
}

/// Failure reported by a vehicle link primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The vehicle answered the command with a non-accepted result.
    #[error("{command} rejected by vehicle (code {code})")]
    Rejected {
        /// Short name of the command (e.g. "arm", "goto")
        command: &'static str,
        /// Vendor result code (MAV_RESULT value for MAVLink links)
        code: u32,
    },

    /// No acknowledgement arrived within the command timeout.
    #[error("{command} was not acknowledged in time")]
    Timeout {
        /// Short name of the command
        command: &'static str,
    },

    /// No vehicle has been heard from yet, or the link has shut down.
    #[error("vehicle not connected")]
    NotConnected,

    /// Local I/O failure while sending.
    #[error("link I/O error: {0}")]
    Io(String),
}

impl LinkError {
    /// Vendor error code carried by this failure.
    ///
    /// Failures that never reached the vehicle have no vendor code and
    /// report `0`.
    pub fn code(&self) -> u32 {
        match self {
            LinkError::Rejected { code, .. } => *code,
            _ => 0,
        }
    }
}

/// Command rejection surfaced to the host by [`crate::dispatch::CommandDispatch`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// A command arrived before a vehicle link was attached.
    #[error("unmanned system not initialized")]
    NotInitialized,

    /// The mission selector did not match any configured mission.
    #[error("unknown mission '{0}'")]
    UnknownMission(String),

    /// A command carried a coordinate, altitude or rate the vehicle cannot
    /// be sent.
    #[error("invalid command target: {0}")]
    InvalidTarget(String),

    /// A navigation operation ended in failure.
    #[error("command rejected: {0}")]
    Rejected(NavFailure),

    /// A direct link primitive failed.
    #[error("link failure: {0}")]
    Link(#[from] LinkError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_error_code() {
        let err = LinkError::Rejected {
            command: "goto",
            code: 7,
        };
        assert_eq!(err.code(), 7);
        assert_eq!(LinkError::NotConnected.code(), 0);
        assert_eq!(err.to_string(), "goto rejected by vehicle (code 7)");
    }

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err: DriverError = anyhow::anyhow!("bad port").context("Failed to parse").into();
        let msg = err.to_string();
        assert!(msg.contains("Failed to parse"));
        assert!(msg.contains("bad port"));
    }
}
