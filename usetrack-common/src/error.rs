//! # Usetrack Error Types
//!
//! ## Design Principles
//!
//! 1. **Stable Codes**: Each variant has a fixed numeric code for logs and HTTP payloads.
//! 2. **Categorized Ranges**: Codes are grouped by fault class (configuration, store,
//!    tracking, protocol).
//! 3. **Containment**: Categories map directly to the propagation policy; only
//!    configuration faults are allowed to stop a process.
//! 4. **Recoverability Hints**: Store faults caused by the network are marked retryable.

use std::io;

/// Result type used across usetrack components.
pub type UsetrackResult<T> = core::result::Result<T, UsetrackError>;

/// High-level category for grouping error codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    /// Invalid configuration detected at startup.
    Configuration,
    /// The shared store could not be reached or answered in time.
    Store,
    /// A tracker or accumulator refused an observation.
    Tracking,
    /// The shared store answered with something we cannot interpret.
    Protocol,
}

impl ErrorCategory {
    /// Returns a short lowercase label for logs and JSON payloads.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Store => "store",
            Self::Tracking => "tracking",
            Self::Protocol => "protocol",
        }
    }
}

/// Errors produced by usetrack components.
#[derive(Debug, thiserror::Error)]
pub enum UsetrackError {
    /// Configuration error: a value failed validation (code 1).
    #[error("invalid configuration for `{key}`: {reason}")]
    InvalidConfig { key: String, reason: String },
    /// Configuration error: the config file could not be read or parsed (code 2).
    #[error("failed to load config file '{path}': {reason}")]
    ConfigFile { path: String, reason: String },

    /// Store error: connecting or talking to the store failed (code 10).
    #[error("store unreachable: {0}")]
    Unreachable(#[from] io::Error),
    /// Store error: the operation exceeded its deadline (code 11).
    #[error("store operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// Store error: the store rejected a command (code 12).
    #[error("store rejected command: {0}")]
    Rejected(String),

    /// Tracking error: the accumulator is full for new units (code 20).
    #[error("accumulator capacity of {0} units exceeded")]
    CapacityExceeded(usize),

    /// Protocol error: malformed or unexpected reply from the store (code 30).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Protocol error: a paging cursor could not be decoded (code 31).
    #[error("invalid cursor `{0}`")]
    InvalidCursor(String),
}

impl UsetrackError {
    /// Convenience constructor for validation failures.
    pub fn invalid_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns the stable numeric code for the error.
    pub const fn code(&self) -> u16 {
        match self {
            Self::InvalidConfig { .. } => 1,
            Self::ConfigFile { .. } => 2,
            Self::Unreachable(_) => 10,
            Self::Timeout(_) => 11,
            Self::Rejected(_) => 12,
            Self::CapacityExceeded(_) => 20,
            Self::ProtocolViolation(_) => 30,
            Self::InvalidCursor(_) => 31,
        }
    }

    /// Returns the coarse category of the error.
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidConfig { .. } | Self::ConfigFile { .. } => ErrorCategory::Configuration,
            Self::Unreachable(_) | Self::Timeout(_) | Self::Rejected(_) => ErrorCategory::Store,
            Self::CapacityExceeded(_) => ErrorCategory::Tracking,
            Self::ProtocolViolation(_) | Self::InvalidCursor(_) => ErrorCategory::Protocol,
        }
    }

    /// Returns true if a later attempt may succeed without intervention.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCategory, UsetrackError};
    use std::time::Duration;

    #[test]
    fn maps_error_categories() {
        assert_eq!(
            UsetrackError::invalid_config("store.backend", "unknown").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            UsetrackError::Timeout(Duration::from_secs(1)).category(),
            ErrorCategory::Store
        );
        assert_eq!(
            UsetrackError::CapacityExceeded(10).category(),
            ErrorCategory::Tracking
        );
        assert_eq!(
            UsetrackError::ProtocolViolation("bad".into()).category(),
            ErrorCategory::Protocol
        );
    }

    #[test]
    fn retryable_only_for_network_faults() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(UsetrackError::from(io).is_retryable());
        assert!(UsetrackError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(!UsetrackError::Rejected("WRONGTYPE".into()).is_retryable());
        assert!(!UsetrackError::invalid_config("x", "y").is_retryable());
    }

    #[test]
    fn codes_are_grouped_by_category() {
        assert_eq!(UsetrackError::invalid_config("k", "r").code(), 1);
        assert_eq!(UsetrackError::CapacityExceeded(1).code(), 20);
        assert_eq!(UsetrackError::InvalidCursor("zz".into()).code(), 31);
    }

    #[test]
    fn display_names_the_offending_key() {
        let err = UsetrackError::invalid_config("reporting.interval_secs", "must be > 0");
        assert_eq!(
            err.to_string(),
            "invalid configuration for `reporting.interval_secs`: must be > 0"
        );
    }
}
