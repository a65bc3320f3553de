//! Protocol and handler error types

use std::fmt;
use std::sync::Arc;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Invalid packet type
    InvalidPacketType(u8),
    /// Invalid remaining length encoding
    InvalidRemainingLength,
    /// Invalid protocol name
    InvalidProtocolName,
    /// Invalid protocol version
    InvalidProtocolVersion(u8),
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Invalid packet flags
    InvalidFlags,
    /// Invalid CONNACK or SUBACK return code
    InvalidReturnCode(u8),
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Packet too large
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "invalid protocol version: {}", v),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::InvalidReturnCode(c) => write!(f, "invalid return code: {}", c),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Packet too large
    PacketTooLarge,
    /// String too long
    StringTooLong,
    /// Invalid topic name
    InvalidTopicName,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::InvalidTopicName => write!(f, "invalid topic name"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors surfaced by the protocol handler.
///
/// Fatal variants (malformed packets, protocol violations, transport
/// failures, keepalive expiry) terminate the connection and are delivered
/// to every outstanding waiter. Non-fatal variants (`InvalidState`,
/// `NoFreePacketId`) are returned to the caller without disturbing the
/// connection. `Cancelled` is deliberately its own variant so that
/// cooperative shutdown is never confused with a peer-side failure.
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// Decode failure on the incoming stream
    Malformed(DecodeError),
    /// Encode failure on the outgoing path
    Encode(EncodeError),
    /// Unexpected packet for the current connection state
    ProtocolViolation(&'static str),
    /// API misuse (double-set waiter, publish before start, ...)
    InvalidState(&'static str),
    /// All usable packet identifiers are inflight
    NoFreePacketId,
    /// No PINGRESP within the configured deadline
    KeepAliveTimeout,
    /// A QoS handshake did not complete within the configured deadline
    HandshakeTimeout,
    /// The connection loop did not become ready in time
    ConnectTimeout,
    /// Cooperative shutdown
    Cancelled,
    /// Underlying I/O failure
    Transport(Arc<std::io::Error>),
    /// The connection is closed
    ConnectionClosed,
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed packet: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Self::NoFreePacketId => write!(f, "no free packet identifier"),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
            Self::HandshakeTimeout => write!(f, "handshake timeout"),
            Self::ConnectTimeout => write!(f, "connect timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<DecodeError> for HandlerError {
    fn from(e: DecodeError) -> Self {
        HandlerError::Malformed(e)
    }
}

impl From<EncodeError> for HandlerError {
    fn from(e: EncodeError) -> Self {
        HandlerError::Encode(e)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        HandlerError::Transport(Arc::new(e))
    }
}

impl HandlerError {
    /// True for the cooperative-shutdown variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HandlerError::Cancelled)
    }
}
