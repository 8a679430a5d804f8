//! Error handling for the set coordinator
//!
//! Policy rejections, lock contention and native-issue failures are part of the
//! coordinator's normal contract and are reported through `bool` / `Option`
//! returns, lock callbacks and connection-state notifications. This error type
//! covers what falls outside that contract: the dispatcher having stopped,
//! policy persistence failures and malformed addresses.
//!
//! ## Error Propagation
//!
//! ```rust,no_run
//! use set_coordinator_protocol::{ConnectionService, PeerAddress, Result};
//!
//! async fn connect_first(service: &ConnectionService, addr: &str) -> Result<bool> {
//!     let address: PeerAddress = addr.parse()?;
//!     service.connect(address).await
//! }
//! ```
//!
//! ## Error Matching
//!
//! ```rust
//! use set_coordinator_protocol::CoordinatorError;
//!
//! let error = CoordinatorError::ServiceStopped;
//! assert!(!error.is_recoverable());
//! assert_eq!(error.to_string(), "Coordinator service stopped");
//! ```

use thiserror::Error;

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Errors that can occur outside the coordinator's boolean contract
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// I/O error while persisting or loading policy data
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The dispatcher task is no longer running
    ///
    /// Returned by every [`ConnectionService`](crate::ConnectionService)
    /// operation after [`shutdown`](crate::ConnectionService::shutdown).
    #[error("Coordinator service stopped")]
    ServiceStopped,

    /// A hardware address could not be parsed
    ///
    /// # Examples
    ///
    /// ```rust
    /// use set_coordinator_protocol::PeerAddress;
    ///
    /// let err = "00:11:22".parse::<PeerAddress>().unwrap_err();
    /// assert!(err.to_string().starts_with("Invalid address"));
    /// ```
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A [`PolicyStore`](crate::PolicyStore) could not persist a change
    ///
    /// `PolicyRegistry` reports a failed registry write this way, and external
    /// store implementations should do the same.
    #[error("Policy store error: {0}")]
    PolicyStore(String),
}

impl CoordinatorError {
    /// Check if this error is transient and the operation may be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoordinatorError::Io(_) | CoordinatorError::PolicyStore(_))
    }

    /// Get a short, user-facing description of the error
    pub fn user_message(&self) -> String {
        match self {
            CoordinatorError::Io(e) => format!("I/O error: {}.", e),
            CoordinatorError::Json(e) => format!("Data format error: {}.", e),
            CoordinatorError::ServiceStopped => {
                "The set coordinator is not running. Restart the service.".to_string()
            }
            CoordinatorError::InvalidAddress(msg) => {
                format!("Invalid Bluetooth address: {}.", msg)
            }
            CoordinatorError::PolicyStore(msg) => {
                format!("Could not update connection policy: {}.", msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoordinatorError::InvalidAddress("00:11:22".to_string());
        assert_eq!(error.to_string(), "Invalid address: 00:11:22");

        let error = CoordinatorError::ServiceStopped;
        assert_eq!(error.to_string(), "Coordinator service stopped");

        let error = CoordinatorError::PolicyStore("read only".to_string());
        assert_eq!(error.to_string(), "Policy store error: read only");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::NotFound, "file not found");
        let error: CoordinatorError = io_error.into();

        assert!(matches!(error, CoordinatorError::Io(_)));
        assert!(error.is_recoverable());
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>(r#"{"broken"#).unwrap_err();
        let error: CoordinatorError = json_error.into();

        assert!(matches!(error, CoordinatorError::Json(_)));
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_user_messages() {
        assert!(CoordinatorError::ServiceStopped
            .user_message()
            .contains("not running"));
        assert!(CoordinatorError::PolicyStore("disk full".to_string())
            .user_message()
            .contains("disk full"));
    }
}
