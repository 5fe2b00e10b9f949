//! Error taxonomy shared across the workspace.
//!
//! `ErrorCode` is the wire-visible code carried in error envelopes;
//! `Error` is the in-process error type. Every recoverable coordination
//! failure maps onto exactly one wire code so reply-path envelopes stay
//! consistent no matter which component produced the error.

use serde::{Deserialize, Serialize};

/// Wire error codes carried in the `error_code` field of response envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The target device is not present in the registry.
    DeviceNotFound,
    /// No handler is registered for the requested capability.
    ModuleNotAvailable,
    /// The envelope or its parameters failed validation.
    InvalidParams,
    /// No response arrived within the full retry window.
    Timeout,
    /// The caller is not the holder of the lease it tried to act on.
    PermissionDenied,
    /// An active lease on the resource is held by someone else.
    ResourceBusy,
    /// Transport-level failure.
    NetworkError,
}

impl ErrorCode {
    /// Wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceNotFound => "DEVICE_NOT_FOUND",
            Self::ModuleNotAvailable => "MODULE_NOT_AVAILABLE",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::Timeout => "TIMEOUT",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceBusy => "RESOURCE_BUSY",
            Self::NetworkError => "NETWORK_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordinator error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("no handler registered for capability: {0}")]
    ModuleNotAvailable(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("resource busy: {device_id}/{resource} held by {holder}")]
    ResourceBusy {
        device_id: String,
        resource: String,
        holder: String,
    },

    #[error("transport error: {0}")]
    Network(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("request cancelled: {0}")]
    Cancelled(ErrorCode),

    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// Wire code for this error, used when building reply-path envelopes.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::DeviceNotFound(_) => ErrorCode::DeviceNotFound,
            Self::ModuleNotAvailable(_) => ErrorCode::ModuleNotAvailable,
            Self::InvalidParams(_) | Self::Codec(_) => ErrorCode::InvalidParams,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::ResourceBusy { .. } => ErrorCode::ResourceBusy,
            Self::Cancelled(code) => *code,
            Self::Network(_) | Self::Config(_) | Self::ChannelClosed => ErrorCode::NetworkError,
        }
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_strings() {
        assert_eq!(ErrorCode::DeviceNotFound.as_str(), "DEVICE_NOT_FOUND");
        assert_eq!(ErrorCode::ResourceBusy.as_str(), "RESOURCE_BUSY");

        let json = serde_json::to_string(&ErrorCode::ModuleNotAvailable).unwrap();
        assert_eq!(json, "\"MODULE_NOT_AVAILABLE\"");

        let parsed: ErrorCode = serde_json::from_str("\"TIMEOUT\"").unwrap();
        assert_eq!(parsed, ErrorCode::Timeout);
    }

    #[test]
    fn test_error_to_code_mapping() {
        assert_eq!(
            Error::DeviceNotFound("dev-1".into()).code(),
            ErrorCode::DeviceNotFound
        );
        assert_eq!(Error::Timeout { attempts: 3 }.code(), ErrorCode::Timeout);
        assert_eq!(
            Error::Cancelled(ErrorCode::DeviceNotFound).code(),
            ErrorCode::DeviceNotFound
        );
        assert_eq!(Error::ChannelClosed.code(), ErrorCode::NetworkError);
    }
}
