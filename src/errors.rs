//! Error types for PowerUDP operations
//!
//! One enum covers the data channel, the control channel and configuration
//! loading. Packet decoding failures have their own type because receivers
//! recover from them locally by dropping the datagram.
use std::io;

use thiserror::Error;

/// Result type alias for PowerUDP operations
pub type Result<T> = std::result::Result<T, PowerUdpError>;

/// Failure to decode a PowerUDP datagram
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes than the fixed header size
    #[error("truncated header: {available} bytes available, {required} required")]
    TruncatedHeader { required: usize, available: usize },

    /// The header's `length` field claims more payload than was received
    #[error("truncated payload: header declares {declared} bytes, {available} available")]
    TruncatedPayload { declared: usize, available: usize },

    /// `ack` field holds a value that is neither data, ACK nor NAK
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
}

/// PowerUDP error enumeration
#[derive(Debug, Clone, Error)]
pub enum PowerUdpError {
    /// I/O error (socket send/receive failure)
    #[error("I/O error: {0}")]
    IoError(String),

    /// Datagram could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Retries exhausted without a matching ACK
    #[error("delivery of seq {seq_num} not confirmed after {attempts} attempts")]
    MaxRetriesExceeded { seq_num: u32, attempts: u32 },

    /// Payload does not fit in a single datagram
    #[error("payload too large: {size} bytes, maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Registration refused by the server side of a session
    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// Server answered a registration with NAK
    #[error("registration rejected by server")]
    RegistrationRejected,

    /// Control-channel reply that is neither ACK nor NAK
    #[error("unexpected registration reply {0:?}")]
    UnexpectedReply([u8; 3]),

    /// Configuration update record with the wrong size
    #[error("malformed configuration update: expected {expected} bytes, received {received}")]
    MalformedConfigUpdate { expected: usize, received: usize },

    /// Configuration record of the right size holding invalid values
    #[error("invalid configuration record: {reason}")]
    InvalidConfigRecord { reason: String },

    /// Settings file could not be read or parsed
    #[error("failed to load configuration from '{path}': {reason}")]
    ConfigLoad { path: String, reason: String },

    /// Settings value out of range
    #[error("invalid configuration: {field} - {reason}")]
    ConfigInvalid { field: String, reason: String },

    /// Operation interrupted by server shutdown
    #[error("server is shutting down")]
    ShuttingDown,
}

impl PowerUdpError {
    pub fn config_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for failures that only concern one datagram or one session
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decode(_)
                | Self::MaxRetriesExceeded { .. }
                | Self::AuthenticationFailed { .. }
                | Self::MalformedConfigUpdate { .. }
                | Self::InvalidConfigRecord { .. }
        )
    }
}

/// Convert from io::Error to PowerUdpError
impl From<io::Error> for PowerUdpError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = PowerUdpError::MaxRetriesExceeded { seq_num: 7, attempts: 5 };
        assert_eq!(err.to_string(), "delivery of seq 7 not confirmed after 5 attempts");

        let err: PowerUdpError = DecodeError::TruncatedHeader { required: 8, available: 3 }.into();
        assert!(err.to_string().contains("3 bytes available"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(PowerUdpError::MalformedConfigUpdate { expected: 6, received: 2 }.is_recoverable());
        assert!(!PowerUdpError::IoError("broken pipe".into()).is_recoverable());
        assert!(!PowerUdpError::ShuttingDown.is_recoverable());
    }
}
