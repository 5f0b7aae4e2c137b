//! Error types and error classification for the relay agent.

use thiserror::Error;

/// Disconnect notice sent when the SSH side dies and retries are spent.
pub(crate) const REASON_SSH_DOWN: &str = "SSH server down";

/// Disconnect notice recorded when the remote closes the shell channel.
pub(crate) const REASON_CHANNEL_CLOSED: &str = "SSH channel closed";

/// Disconnect notice used when the agent process itself shuts down.
pub(crate) const REASON_SERVER_DOWN: &str = "Server down";

/// Disconnect notice recorded when the browser side goes away first.
pub(crate) const REASON_WS_DISCONNECTED: &str = "Websocket disconnected";

/// Why acquiring a pooled SSH session failed.
///
/// The display strings double as the user-facing messages relayed to the
/// browser, so they stay short and stable.
#[derive(Error, Debug)]
pub enum AcquireError {
    /// The identity already holds the maximum number of live sessions.
    #[error("Too many connections")]
    OverCapacity,

    /// The container reports an auth scheme the agent cannot drive.
    #[error("Authentication methods `{0}` does not supported")]
    AuthMethodUnsupported(String),

    /// The SSH server rejected the supplied credentials.
    #[error("Authentication failed")]
    AuthFailed,

    /// TCP/SSH handshake never completed; detail kept for logs only.
    #[error("Connection failed")]
    ConnectFailed(String),
}

/// Failures inside a relay worker after the session is established.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Opening a fresh shell channel on the live session failed.
    #[error("Failed to create SSH channel: {0}")]
    ChannelCreate(String),

    /// The worker burned through its channel re-creation budget.
    #[error("Channel retry budget exhausted")]
    RetryExhausted,

    /// Writing keystrokes into the shell channel failed.
    #[error("Failed to write to shell: {0}")]
    Write(String),
}

/// Failures talking to the external bridge service.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Bridge response malformed: {0}")]
    Malformed(String),
}

/// Error patterns that indicate authentication failures (should not retry)
pub(crate) const AUTH_ERRORS: &[&str] = &[
    "auth",
    "authentication",
    "permission denied",
    "access denied",
    "invalid credentials",
    "password",
    "publickey",
];

/// Error patterns that indicate transient failures (should retry)
pub(crate) const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection aborted",
    "timeout",
    "timed out",
    "network unreachable",
    "host unreachable",
    "no route to host",
    "temporarily unavailable",
    "broken pipe",
];

/// Determines if an error is retryable based on its message content.
///
/// Authentication failures are never retried; redialing with the same bad
/// credentials only gets the agent banned faster.
pub(crate) fn is_retryable_error(error_str: &str) -> bool {
    let error_lower = error_str.to_lowercase();

    // Authentication errors always win over retryable patterns
    if AUTH_ERRORS
        .iter()
        .any(|auth_err| error_lower.contains(auth_err))
    {
        return false;
    }

    if RETRYABLE_ERRORS
        .iter()
        .any(|retry_err| error_lower.contains(retry_err))
    {
        return true;
    }

    // Default: retry network-ish errors, not SSH protocol errors
    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}

#[cfg(test)]
mod tests {
    use super::*;

    mod acquire_error {
        use super::*;

        #[test]
        fn test_over_capacity_message() {
            assert_eq!(AcquireError::OverCapacity.to_string(), "Too many connections");
        }

        #[test]
        fn test_auth_method_unsupported_names_method() {
            let err = AcquireError::AuthMethodUnsupported("publickey".to_string());
            assert_eq!(
                err.to_string(),
                "Authentication methods `publickey` does not supported"
            );
        }

        #[test]
        fn test_auth_failed_message() {
            assert_eq!(AcquireError::AuthFailed.to_string(), "Authentication failed");
        }

        #[test]
        fn test_connect_failed_hides_detail() {
            let err = AcquireError::ConnectFailed("ECONNREFUSED 127.0.0.1:22".to_string());
            assert_eq!(err.to_string(), "Connection failed");
        }
    }

    mod relay_error {
        use super::*;

        #[test]
        fn test_channel_create_message() {
            let err = RelayError::ChannelCreate("channel open failure".to_string());
            assert_eq!(
                err.to_string(),
                "Failed to create SSH channel: channel open failure"
            );
        }

        #[test]
        fn test_retry_exhausted_message() {
            assert_eq!(
                RelayError::RetryExhausted.to_string(),
                "Channel retry budget exhausted"
            );
        }
    }

    mod error_classification {
        use super::*;

        #[test]
        fn test_auth_errors_not_retryable() {
            assert!(!is_retryable_error("Authentication failed"));
            assert!(!is_retryable_error("Permission denied (publickey)"));
            assert!(!is_retryable_error("Invalid credentials provided"));
        }

        #[test]
        fn test_network_errors_retryable() {
            assert!(is_retryable_error("Connection refused"));
            assert!(is_retryable_error("Operation timed out"));
            assert!(is_retryable_error("Network unreachable"));
            assert!(is_retryable_error("Connection reset by peer"));
        }

        #[test]
        fn test_auth_wins_over_retryable() {
            // Contains both "timeout" and "auth"; auth classification wins
            assert!(!is_retryable_error("authentication timeout"));
        }

        #[test]
        fn test_connect_errors_default_retryable() {
            assert!(is_retryable_error("failed to connect to host"));
        }

        #[test]
        fn test_ssh_protocol_errors_not_retryable() {
            assert!(!is_retryable_error("ssh protocol version mismatch"));
        }

        #[test]
        fn test_unknown_non_ssh_errors_retryable() {
            assert!(is_retryable_error("something odd happened"));
        }
    }
}
