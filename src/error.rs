//! Error types for the acquisition client.
//!
//! All errors implement `std::error::Error` and carry enough structured
//! context to decide whether an operation can simply be retried.
//!
//! ## Error Categories
//!
//! - **Decode Errors**: malformed headers or payloads. Isolated to the
//!   offending slice or datagram tail; the pipeline keeps running.
//! - **Socket Errors**: fatal for the connection. The device handle leaves
//!   the `Connected` state when one occurs.
//! - **State Errors**: an API call was made in a connection state that forbids it.
//! - **Timeout / Conflict Errors**: returned by blocking request/reply calls.
//! - **Callback Errors**: a subscriber failed. Contained and reported, never
//!   propagated into the dispatch loop.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use cbsdk::SdkError;
//! use std::time::Duration;
//!
//! let error = SdkError::timeout("set_runlevel", Duration::from_millis(450));
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

use crate::device::ConnectionState;

/// Result type alias for client operations.
pub type Result<T, E = SdkError> = std::result::Result<T, E>;

/// Structural decode failures.
///
/// Offsets are relative to the start of the datagram being split, or to the
/// start of the payload for payload-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("Truncated header at offset {offset}: {remaining} bytes remain, header needs {needed}")]
    TruncatedHeader { offset: usize, remaining: usize, needed: usize },

    #[error(
        "Packet at offset {offset} declares {declared} payload bytes but only {remaining} remain"
    )]
    LengthOverrun { offset: usize, declared: usize, remaining: usize },

    #[error("Payload for packet type {packet_type:#04x} too short: need {expected}, got {actual}")]
    PayloadTooShort { packet_type: u16, expected: usize, actual: usize },

    #[error("Invalid field '{field}' in packet type {packet_type:#04x}: {details}")]
    InvalidField { packet_type: u16, field: &'static str, details: String },
}

impl DecodeError {
    /// Offset at which the corrupt region starts, when known.
    pub fn offset(&self) -> Option<usize> {
        match self {
            DecodeError::TruncatedHeader { offset, .. } => Some(*offset),
            DecodeError::LengthOverrun { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

/// Main error type for client operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SdkError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Socket error during {operation}")]
    Socket {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation '{operation}' not allowed while {state:?}")]
    State { operation: String, state: ConnectionState },

    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("A request for {classifier} (key {key:?}) is already pending")]
    Conflict { classifier: String, key: Option<u32> },

    #[error("Callback for {key} failed: {reason}")]
    Callback { key: String, reason: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Channel {channel} has not been reported by the device")]
    UnknownChannel { channel: u32 },

    #[error("Incomplete configuration: received {received} of {expected} channel records")]
    IncompleteConfig { received: usize, expected: usize },

    #[error("Encode error: {details}")]
    Encode { details: String },
}

impl SdkError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            SdkError::Decode(_) => false,
            SdkError::Socket { .. } => true,
            SdkError::State { .. } => false,
            SdkError::Timeout { .. } => true,
            SdkError::Conflict { .. } => true,
            SdkError::Callback { .. } => false,
            SdkError::Disconnected => true,
            SdkError::Config { .. } => false,
            SdkError::UnknownChannel { .. } => true,
            SdkError::IncompleteConfig { .. } => true,
            SdkError::Encode { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            SdkError::Decode(_) => vec![
                "Check the protocol version of the instrument firmware",
                "Capture the offending datagram for inspection",
            ],
            SdkError::Socket { .. } => vec![
                "Check that the local adapter address exists on this machine",
                "Verify no other process is bound to the client port",
                "Reconnect the device",
            ],
            SdkError::State { .. } => vec![
                "Call connect() before issuing device commands",
                "Check the connection state via Device::state()",
            ],
            SdkError::Timeout { .. } => vec![
                "Increase the reply timeout",
                "Verify the instrument address and network link",
                "Check that the instrument speaks the expected protocol version",
            ],
            SdkError::Conflict { .. } => vec![
                "Wait for the outstanding request to complete",
                "Serialize configuration calls for the same channel",
            ],
            SdkError::Callback { .. } => {
                vec!["Inspect the failing callback", "Avoid panicking inside subscriber callbacks"]
            }
            SdkError::Disconnected => vec!["Reconnect the device"],
            SdkError::Config { .. } => vec![
                "Specify the local adapter address explicitly",
                "Check the CBSDK_* environment variables",
            ],
            SdkError::UnknownChannel { .. } => vec![
                "Refresh the configuration with get_config(force_refresh = true)",
                "Check the channel id is 1-based",
            ],
            SdkError::IncompleteConfig { .. } => vec![
                "Retry the configuration refresh",
                "Increase the socket receive buffer size",
            ],
            SdkError::Encode { .. } => vec!["Reduce the payload size of the command"],
        }
    }

    /// Helper constructor for socket errors.
    pub fn socket(operation: impl Into<String>, source: std::io::Error) -> Self {
        SdkError::Socket { operation: operation.into(), source }
    }

    /// Helper constructor for connection-state errors.
    pub fn state(operation: impl Into<String>, state: ConnectionState) -> Self {
        SdkError::State { operation: operation.into(), state }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        SdkError::Timeout { operation: operation.into(), duration }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        SdkError::Config { reason: reason.into() }
    }

    /// Helper constructor for callback failures.
    pub fn callback(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SdkError::Callback { key: key.into(), reason: reason.into() }
    }

    /// True for the timeout variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SdkError::Timeout { .. })
    }

    /// True for the conflict variant.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SdkError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_carry_their_context(
                operation in "\\w+",
                declared in 0usize..0x10000,
                remaining in 0usize..0x10000,
                channel in 1u32..1024,
                millis in 1u64..60_000,
            ) {
                let timeout = SdkError::timeout(operation.clone(), Duration::from_millis(millis));
                prop_assert!(timeout.to_string().contains(&operation));

                let overrun: SdkError =
                    DecodeError::LengthOverrun { offset: 0, declared, remaining }.into();
                let msg = overrun.to_string();
                prop_assert!(msg.contains(&declared.to_string()));
                prop_assert!(msg.contains(&remaining.to_string()));

                let unknown = SdkError::UnknownChannel { channel };
                prop_assert!(unknown.to_string().contains(&channel.to_string()));
            }
        }
    }

    #[test]
    fn socket_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let error = SdkError::socket("bind", io);
        let source = std::error::Error::source(&error).expect("socket error has a source");
        assert_eq!(source.to_string(), "port taken");
    }

    #[test]
    fn error_is_send_sync_static() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<SdkError>();
        assert_send_sync_static::<DecodeError>();
    }

    #[test]
    fn retry_classification() {
        assert!(SdkError::timeout("x", Duration::from_millis(1)).is_retryable());
        assert!(SdkError::Disconnected.is_retryable());
        assert!(!SdkError::config("bad").is_retryable());
        let err = SdkError::state("set_channel_config", ConnectionState::Disconnected);
        assert!(!err.is_retryable());

        for error in [
            SdkError::Disconnected,
            SdkError::config("bad"),
            SdkError::timeout("x", Duration::from_millis(1)),
        ] {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty());
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn decode_error_offsets() {
        let truncated = DecodeError::TruncatedHeader { offset: 24, remaining: 3, needed: 10 };
        assert_eq!(truncated.offset(), Some(24));

        let short = DecodeError::PayloadTooShort { packet_type: 0x10, expected: 28, actual: 4 };
        assert_eq!(short.offset(), None);
        assert!(short.to_string().contains("0x10"));
    }
}
