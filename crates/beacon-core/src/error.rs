//! Error types for Beacon.
//!
//! Every error that can reach a subscriber is cloneable, because a single
//! terminal failure is fanned out to all observers of a discovery session.
//! All errors are serializable so they can be printed as JSON by the CLI.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using BeaconError as the error type.
pub type Result<T> = std::result::Result<T, BeaconError>;

/// Top-level error type for discovery and registration operations.
///
/// Control-plane failures (start, stop, register, unregister) terminate the
/// stream they belong to. Data-plane failures (a single resolution) are
/// handled inside the resolve backlog and never reach a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum BeaconError {
    /// The caller's scope was no longer valid when the operation was dispatched
    #[error("Caller scope is no longer valid")]
    StaleCaller,

    /// The backend could not start discovery
    #[error("Discovery of '{service_type}' failed to start with error code {code}")]
    StartFailed { service_type: String, code: i32 },

    /// The backend could not stop discovery
    #[error("Discovery of '{service_type}' failed to stop with error code {code}")]
    StopFailed { service_type: String, code: i32 },

    /// A single service could not be resolved
    #[error("Resolving '{service}' failed with error code {code}")]
    ResolveFailed { service: String, code: i32 },

    /// The backend rejected a registration
    #[error("Registration of '{service}' failed with error code {code}")]
    RegistrationFailed { service: String, code: i32 },

    /// The backend rejected an unregistration
    #[error("Unregistration of '{service}' failed with error code {code}")]
    UnregistrationFailed { service: String, code: i32 },

    /// A subscriber fell too far behind and missed events
    #[error("Subscriber to '{service_type}' fell behind and missed {skipped} events")]
    Lagged { service_type: String, skipped: u64 },

    /// A session was released more often than it was acquired
    #[error("Session '{key}' released with no active observers")]
    SessionUnderflow { key: String },

    /// Unregister was called for a service that has no active registration
    #[error("Service '{service}' is not registered")]
    NotRegistered { service: String },

    /// Register was called for a service that already has a live registration
    #[error("Service '{service}' is already registered")]
    AlreadyRegistered { service: String },

    /// The backend facility failed outside of a callback
    #[error("Backend error: {0}")]
    Backend(String),

    /// A service descriptor failed validation
    #[error("Invalid service descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BeaconError {
    /// Creates a start failed error.
    pub fn start_failed(service_type: impl Into<String>, code: i32) -> Self {
        Self::StartFailed {
            service_type: service_type.into(),
            code,
        }
    }

    /// Creates a stop failed error.
    pub fn stop_failed(service_type: impl Into<String>, code: i32) -> Self {
        Self::StopFailed {
            service_type: service_type.into(),
            code,
        }
    }

    /// Creates a resolve failed error.
    pub fn resolve_failed(service: impl Into<String>, code: i32) -> Self {
        Self::ResolveFailed {
            service: service.into(),
            code,
        }
    }

    /// Creates a registration failed error.
    pub fn registration_failed(service: impl Into<String>, code: i32) -> Self {
        Self::RegistrationFailed {
            service: service.into(),
            code,
        }
    }

    /// Creates an unregistration failed error.
    pub fn unregistration_failed(service: impl Into<String>, code: i32) -> Self {
        Self::UnregistrationFailed {
            service: service.into(),
            code,
        }
    }

    /// Creates a backend error.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend(reason.into())
    }

    /// Returns true if this error ends the stream it is delivered on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BeaconError::StartFailed { .. }
                | BeaconError::StopFailed { .. }
                | BeaconError::Lagged { .. }
                | BeaconError::RegistrationFailed { .. }
                | BeaconError::UnregistrationFailed { .. }
        )
    }

    /// Returns true if this error is a misuse of the API rather than a
    /// failure of the network or the backend.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            BeaconError::NotRegistered { .. }
                | BeaconError::AlreadyRegistered { .. }
                | BeaconError::SessionUnderflow { .. }
                | BeaconError::InvalidDescriptor(_)
        )
    }
}

/// Errors raised while building a service descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DescriptorError {
    /// Missing required field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Invalid field value
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Invalid service type string
    #[error("Invalid service type '{value}': expected _<service>._tcp or _<service>._udp")]
    InvalidServiceType { value: String },

    /// Invalid TXT record key
    #[error("Invalid TXT record key '{key}': {reason}")]
    InvalidTxtKey { key: String, reason: String },
}

impl DescriptorError {
    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors related to configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_errors_are_terminal() {
        assert!(BeaconError::start_failed("_http._tcp", 3).is_terminal());
        assert!(BeaconError::stop_failed("_http._tcp", 0).is_terminal());
        assert!(BeaconError::registration_failed("printer", 1).is_terminal());
        assert!(BeaconError::unregistration_failed("printer", 1).is_terminal());
        assert!(BeaconError::Lagged {
            service_type: "_http._tcp".to_string(),
            skipped: 3,
        }
        .is_terminal());
    }

    #[test]
    fn test_resolve_failure_is_not_terminal() {
        let err = BeaconError::resolve_failed("printer._http._tcp.local.", 2);
        assert!(!err.is_terminal());
        assert!(!err.is_usage_error());
    }

    #[test]
    fn test_usage_errors() {
        let err = BeaconError::NotRegistered {
            service: "printer".to_string(),
        };
        assert!(err.is_usage_error());
        assert!(!err.is_terminal());

        let err: BeaconError = DescriptorError::missing_field("name").into();
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_error_serialization() {
        let err = BeaconError::start_failed("_ipp._tcp", 7);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("StartFailed"));
        assert!(json.contains("_ipp._tcp"));

        let back: BeaconError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_display_includes_code() {
        let err = BeaconError::registration_failed("printer", 42);
        let display = format!("{}", err);
        assert!(display.contains("printer"));
        assert!(display.contains("42"));
    }
}
