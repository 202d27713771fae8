//! Structured log message carried inside packet ciphertext.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::{PayloadError, payloads};

/// Syslog facility codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Facility {
    /// Kernel messages
    Kern = 0,
    /// User-level messages
    User = 1,
    /// Mail system
    Mail = 2,
    /// System daemons
    Daemon = 3,
    /// Security/authorization messages
    Auth = 4,
    /// Messages generated internally by the logger
    Syslog = 5,
    /// Line printer subsystem
    Lpr = 6,
    /// Network news subsystem
    News = 7,
    /// UUCP subsystem
    Uucp = 8,
    /// Clock daemon
    Cron = 9,
    /// Private security/authorization messages
    AuthPriv = 10,
    /// FTP daemon
    Ftp = 11,
    /// NTP subsystem
    Ntp = 12,
    /// Log audit
    Audit = 13,
    /// Log alert
    Alert = 14,
    /// Clock daemon (second instance)
    Clock = 15,
    /// Local use 0
    Local0 = 16,
    /// Local use 1
    Local1 = 17,
    /// Local use 2
    Local2 = 18,
    /// Local use 3
    Local3 = 19,
    /// Local use 4
    Local4 = 20,
    /// Local use 5
    Local5 = 21,
    /// Local use 6
    Local6 = 22,
    /// Local use 7
    Local7 = 23,
}

/// Syslog severity levels, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Severity {
    /// System is unusable
    Emergency = 0,
    /// Action must be taken immediately
    Alert = 1,
    /// Critical conditions
    Critical = 2,
    /// Error conditions
    Error = 3,
    /// Warning conditions
    Warning = 4,
    /// Normal but significant condition
    Notice = 5,
    /// Informational messages
    Informational = 6,
    /// Debug-level messages
    Debug = 7,
}

/// A log event.
///
/// Created by the application on the send path or by decryption on the
/// receive path. Once handed to a subscriber the core keeps no reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Originating subsystem
    pub facility: Facility,
    /// Severity level
    pub severity: Severity,
    /// Milliseconds since the unix epoch, as stamped by the originator
    pub timestamp_ms: u64,
    /// Originating host
    pub hostname: String,
    /// Process tag (program name, optionally with pid)
    pub tag: String,
    /// Message text
    pub text: String,
}

impl Message {
    /// Create a message with empty origin fields and a zero timestamp.
    pub fn new(facility: Facility, severity: Severity, text: impl Into<String>) -> Self {
        Self {
            facility,
            severity,
            timestamp_ms: 0,
            hostname: String::new(),
            tag: String::new(),
            text: text.into(),
        }
    }

    /// Set the originating host and process tag.
    #[must_use]
    pub fn with_origin(mut self, hostname: impl Into<String>, tag: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self.tag = tag.into();
        self
    }

    /// Set the timestamp.
    #[must_use]
    pub fn with_timestamp_ms(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// CBOR plaintext for encryption.
    pub fn to_cbor(&self) -> Result<Vec<u8>, PayloadError> {
        payloads::to_cbor(self)
    }

    /// Parse CBOR plaintext produced by [`Message::to_cbor`].
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, PayloadError> {
        payloads::from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_cbor_round_trip() {
        let message = Message::new(Facility::Local3, Severity::Warning, "disk 91% full")
            .with_origin("db-7", "diskmon[311]")
            .with_timestamp_ms(1_700_000_000_123);

        let bytes = message.to_cbor().unwrap();
        assert_eq!(Message::from_cbor(&bytes).unwrap(), message);
    }

    #[test]
    fn severity_orders_most_severe_first() {
        assert!(Severity::Emergency < Severity::Error);
        assert!(Severity::Error < Severity::Debug);
    }

    #[test]
    fn garbage_plaintext_is_decode_error() {
        let result = Message::from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(PayloadError::Decode(_))));
    }
}
