// MIT License - Copyright (c) 2026 Peter Wright
// Arrowhead panel error taxonomy

use std::fmt;

/// Broad failure class, used by hosts to decide between "retry later" and
/// "fix the configuration".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Socket open/read/write failure or connect timeout. Triggers reconnection.
    Transport,
    /// The panel answered badly or not at all (response timeout, rejected ack).
    Protocol,
    /// Firmware or panel provisioning does not support the requested feature.
    Capability,
    /// Input rejected before any I/O took place.
    Validation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Capability => "capability",
            Self::Validation => "validation",
        };
        f.write_str(s)
    }
}

/// All errors that can occur in the arrowhead-lan-bridge library.
#[derive(Debug, thiserror::Error)]
pub enum ArrowheadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connection closed by panel")]
    ConnectionClosed,

    #[error("Not connected (state: {state})")]
    NotConnected { state: crate::state::ConnectionState },

    #[error("Connection attempt already in progress")]
    ConnectInProgress,

    #[error("Command timeout: {command}")]
    CommandTimeout { command: String },

    #[error("Command rejected: {command} -> {response}")]
    CommandRejected { command: String, response: String },

    #[error("Another command is already awaiting a response")]
    CommandInFlight,

    #[error("Invalid response: {details}")]
    InvalidResponse { details: String },

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Firmware {version} does not support enhanced mode (requires {minimum})")]
    EnhancedModeUnsupported { version: String, minimum: String },

    #[error("Panel rejected MODE {mode}: {response}")]
    ModeSwitchRejected { mode: u8, response: String },

    #[error("Panel not provisioned for {feature} (program location {location})")]
    NotProvisioned {
        feature: &'static str,
        location: &'static str,
    },

    #[error("Invalid area: {area} (valid: 1-{max})")]
    InvalidArea { area: u32, max: u32 },

    #[error("Invalid zone: {zone} (valid: 1-{max})")]
    InvalidZone { zone: u32, max: u32 },

    #[error("Invalid output: {output} (valid: 1-{max})")]
    InvalidOutput { output: u32, max: u32 },

    #[error("Invalid user credential: {reason}")]
    InvalidCredential { reason: String },

    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },
}

impl ArrowheadError {
    /// The failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_)
            | Self::ConnectionTimeout
            | Self::ConnectionClosed
            | Self::NotConnected { .. }
            | Self::ConnectInProgress => ErrorKind::Transport,
            Self::CommandTimeout { .. }
            | Self::CommandRejected { .. }
            | Self::CommandInFlight
            | Self::InvalidResponse { .. }
            | Self::AuthenticationFailed { .. } => ErrorKind::Protocol,
            Self::EnhancedModeUnsupported { .. }
            | Self::ModeSwitchRejected { .. }
            | Self::NotProvisioned { .. } => ErrorKind::Capability,
            Self::InvalidArea { .. }
            | Self::InvalidZone { .. }
            | Self::InvalidOutput { .. }
            | Self::InvalidCredential { .. }
            | Self::InvalidCommand { .. } => ErrorKind::Validation,
        }
    }

    /// Whether this error is transient and the connection should be retried.
    ///
    /// Bad credentials, unsupported firmware and invalid input never fix
    /// themselves, so they are excluded.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Transport => true,
            ErrorKind::Protocol => !matches!(self, Self::AuthenticationFailed { .. }),
            ErrorKind::Capability | ErrorKind::Validation => false,
        }
    }

    /// Whether this error should tear down the current connection.
    pub(crate) fn breaks_link(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionTimeout | Self::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, ArrowheadError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionState;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ArrowheadError::ConnectionTimeout.kind(), ErrorKind::Transport);
        assert_eq!(
            ArrowheadError::CommandTimeout { command: "STATUS".into() }.kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            ArrowheadError::NotProvisioned { feature: "area arming", location: "P74E" }.kind(),
            ErrorKind::Capability
        );
        assert_eq!(
            ArrowheadError::InvalidZone { zone: 249, max: 248 }.kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ArrowheadError::ConnectionClosed.is_retryable());
        assert!(ArrowheadError::NotConnected { state: ConnectionState::Error }.is_retryable());
        assert!(ArrowheadError::CommandTimeout { command: "VERSION".into() }.is_retryable());
        assert!(!ArrowheadError::AuthenticationFailed { reason: "bad password".into() }.is_retryable());
        assert!(
            !ArrowheadError::EnhancedModeUnsupported {
                version: "10.3.49".into(),
                minimum: "10.3.50".into()
            }
            .is_retryable()
        );
        assert!(!ArrowheadError::InvalidCredential { reason: "empty".into() }.is_retryable());
    }

    #[test]
    fn test_breaks_link() {
        assert!(ArrowheadError::ConnectionClosed.breaks_link());
        assert!(!ArrowheadError::CommandTimeout { command: "ARMAREA 1".into() }.breaks_link());
    }
}
