use thiserror::Error;

use crate::types::AdapterPowerState;

/// Errors that can occur when talking to a Reabilita peripheral
#[derive(Error, Debug)]
pub enum ReabilitaError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// The local adapter is not in a usable state
    #[error("Bluetooth adapter unavailable: {state}")]
    AdapterUnavailable {
        /// Power state reported by the adapter
        state: AdapterPowerState,
    },

    /// The platform refused to start a scan
    #[error("Failed to start scan: {0}")]
    ScanStart(String),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectFailed(String),

    /// Expected service or characteristic is missing on the peripheral
    #[error("Capability discovery failed: {0}")]
    Discovery(String),

    /// Writing a command failed
    #[error("Failed to write command: {0}")]
    Write(String),

    /// Reading the status characteristic failed
    #[error("Failed to read status: {0}")]
    Read(String),

    /// Payload could not be interpreted as wire text
    #[error("Failed to decode payload: {0}")]
    Decode(String),

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// No active connection
    #[error("No peripheral connected")]
    NotConnected,

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),
}

/// Result type for Reabilita operations
pub type Result<T> = std::result::Result<T, ReabilitaError>;

impl ReabilitaError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::ConnectFailed(_) | Self::Discovery(_) | Self::NotConnected
        )
    }

    /// Check if this error is recoverable
    ///
    /// Read, decode and timeout failures belong to best-effort channels; the
    /// next poll or user action simply tries again.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Read(_) | Self::Decode(_) | Self::Timeout { .. } | Self::InvalidParameters(_)
        )
    }

    /// Check if this error comes from the local adapter rather than the peripheral
    #[must_use]
    pub const fn is_adapter_error(&self) -> bool {
        matches!(self, Self::AdapterUnavailable { .. } | Self::ScanStart(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = ReabilitaError::ConnectFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());
        assert!(!connection_error.is_adapter_error());

        let read_error = ReabilitaError::Read("gatt busy".to_string());
        assert!(!read_error.is_connection_error());
        assert!(read_error.is_recoverable());

        let adapter_error = ReabilitaError::AdapterUnavailable {
            state: AdapterPowerState::PoweredOff,
        };
        assert!(adapter_error.is_adapter_error());
        assert!(!adapter_error.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = ReabilitaError::AdapterUnavailable {
            state: AdapterPowerState::Unauthorized,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("adapter unavailable"));
        assert!(error_string.contains("Unauthorized"));

        let timeout = ReabilitaError::Timeout { timeout_ms: 10_000 };
        assert_eq!(timeout.to_string(), "Operation timed out after 10000ms");
    }
}
