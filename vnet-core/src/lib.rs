//! vnet core - addresses, error codes and configuration
//!
//! Shared vocabulary for the virtual network: family-normalized addresses,
//! socket error codes, network configuration and tracing setup. The
//! simulator itself lives in `vnet-sim`.

pub mod address;
pub mod config;
pub mod error;
pub mod tracing_setup;

pub use address::{AddressExt, IpFamily, SocketPair};
pub use config::{ConfigError, NetworkConfig};
pub use error::SocketError;

/// Top-level errors that can bubble up from any vnet subsystem.
#[derive(Debug, thiserror::Error)]
pub enum VnetError {
    /// A socket operation failed
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    /// Configuration was invalid or unreadable
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON input or output could not be processed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A scenario did not reach its expected outcome
    #[error("Scenario error: {reason}")]
    Scenario {
        /// What went wrong
        reason: String,
    },
}

impl VnetError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            VnetError::Socket(e) => format!("Socket operation failed: {e}"),
            VnetError::Config(ConfigError::InvalidValue { field, reason }) => {
                format!("Invalid value for {field}: {reason}")
            }
            VnetError::Config(_) => "Configuration could not be loaded".to_string(),
            VnetError::Io(_) => "File system error occurred".to_string(),
            VnetError::Json(e) => format!("Malformed JSON: {e}"),
            VnetError::Scenario { reason } => format!("Scenario failed: {reason}"),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(self, VnetError::Config(_))
    }
}

/// Result type for vnet operations.
pub type Result<T> = std::result::Result<T, VnetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_names_invalid_field() {
        let error = VnetError::from(ConfigError::InvalidValue {
            field: "bandwidth",
            reason: "too small".to_string(),
        });

        assert!(error.is_user_error());
        assert_eq!(error.user_message(), "Invalid value for bandwidth: too small");
    }

    #[test]
    fn test_socket_errors_convert() {
        let error: VnetError = SocketError::ConnectionRefused.into();
        assert!(!error.is_user_error());
        assert!(error.user_message().contains("connection refused"));
    }
}
