//! Protocol error types

use std::fmt;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Body region ended before the named field
    Truncated(&'static str),
    /// Remaining length used more than 4 continuation bytes
    InvalidRemainingLength,
    /// Remaining length exceeds the configured maximum
    PacketTooLarge,
    /// Invalid packet type nibble
    InvalidPacketType(u8),
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Invalid CONNACK return code
    InvalidReturnCode(u8),
    /// Body region longer than its declared fields
    TrailingBytes,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated(field) => write!(f, "packet truncated before {}", field),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::PacketTooLarge => write!(f, "remaining length exceeds maximum"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidReturnCode(c) => write!(f, "invalid return code: {}", c),
            Self::TrailingBytes => write!(f, "trailing bytes after packet body"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length would not fit in 4 continuation bytes
    PacketTooLarge,
    /// String exceeds the 16-bit length prefix
    StringTooLong,
    /// Packet variant this codec never emits
    UnsupportedPacket(&'static str),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::UnsupportedPacket(name) => write!(f, "unsupported packet for encoding: {}", name),
        }
    }
}

impl std::error::Error for EncodeError {}

/// High-level protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Handshake did not start with CONNECT
    ExpectedConnect(u8),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpectedConnect(t) => {
                write!(f, "expected CONNECT to open session, got packet type {}", t)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
