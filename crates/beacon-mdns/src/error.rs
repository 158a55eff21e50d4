//! Error mapping for the mDNS daemon

use beacon_core::BeaconError;

/// Failure codes reported through resolve and unregister replies.
pub mod codes {
    /// The service was removed before it resolved
    pub const SERVICE_VANISHED: i32 = 1;

    /// No resolution arrived within the resolve timeout
    pub const RESOLVE_TIMEOUT: i32 = 2;

    /// The resolved records do not form a valid service
    pub const INVALID_RECORD: i32 = 3;

    /// A second resolve was requested while one was still waiting
    pub const SUPERSEDED: i32 = 4;

    /// The daemon does not know the registration being withdrawn
    pub const NOT_FOUND: i32 = 5;

    /// The daemon stopped before answering
    pub const DAEMON_GONE: i32 = 6;
}

/// Wraps a daemon error with what was being attempted.
pub(crate) fn daemon_error(context: &str, error: mdns_sd::Error) -> BeaconError {
    BeaconError::backend(format!("{}: {}", context, error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_error_keeps_context() {
        let err = daemon_error("browse _http._tcp.local.", mdns_sd::Error::Msg("socket closed".to_string()));
        match err {
            BeaconError::Backend(message) => {
                assert!(message.starts_with("browse _http._tcp.local."));
                assert!(message.contains("socket closed"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
