//! Codec error types.

use thiserror::Error;

/// Errors raised while decoding inbound bytes.
///
/// Every variant is fatal to the connection that produced the bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Invalid fixed header flags {flags:#04x} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    #[error("Invalid protocol name: expected 'MQTT', got '{0}'")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol level: {0}")]
    UnsupportedProtocolLevel(u8),

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Packet identifier must be non-zero")]
    ZeroPacketId,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Unexpected packet: {0}")]
    UnexpectedPacket(String),
}

/// Errors raised while encoding an outbound packet.
///
/// These indicate a local misuse and only fail the call that produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Topic must not be empty")]
    EmptyTopic,

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    #[error("String field of {0} bytes exceeds 65535")]
    StringTooLong(usize),

    #[error("Invalid packet identifier: {0}")]
    InvalidPacketId(&'static str),

    #[error("Packet of {0} bytes exceeds the 268435455 byte limit")]
    PacketTooLarge(usize),

    #[error("{0} must carry at least one entry")]
    EmptySubscription(&'static str),

    #[error("DUP flag must be 0 for QoS 0 messages")]
    DupWithoutQoS,

    #[error("Password requires a username")]
    PasswordWithoutUsername,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
