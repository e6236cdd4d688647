//! Client events and state types.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use qmqtt_core::{ConnackCode, QoS};

use crate::error::ClientError;

/// Events surfaced to the application.
#[derive(Debug)]
pub enum Event {
    /// CONNACK accepted; the connection is usable.
    Connected {
        /// Whether the broker resumed a previous session.
        session_present: bool,
    },
    /// The connection ended.
    Disconnected { reason: DisconnectReason },
    /// A QoS 1 or QoS 2 publish completed its handshake.
    Published { packet_id: u16 },
    /// An application message arrived. QoS 2 messages are delivered once,
    /// when the broker releases them.
    MessageReceived {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// One filter of a SUBSCRIBE was acknowledged. `granted_qos` is `None`
    /// when the broker refused the filter.
    Subscribed {
        topic_filter: String,
        granted_qos: Option<QoS>,
    },
    /// One filter of an UNSUBSCRIBE was acknowledged.
    Unsubscribed { topic_filter: String },
    /// An in-flight publish will never complete.
    PublishFailed { packet_id: u16, error: ClientError },
    /// A reconnect attempt is scheduled after `delay`.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        delay: Duration,
    },
    /// A connection-level failure, reported before the `Disconnected`
    /// event it causes.
    Error(ClientError),
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The application called `disconnect()`.
    Requested,
    /// The transport closed or failed, or keepalive expired.
    ConnectionLost,
    /// No CONNACK arrived in time.
    ConnectTimeout,
    /// The broker rejected the CONNECT.
    Refused(ConnackCode),
    /// The broker sent malformed or out-of-place packets.
    Protocol(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("disconnect requested"),
            DisconnectReason::ConnectionLost => f.write_str("connection lost"),
            DisconnectReason::ConnectTimeout => f.write_str("timed out waiting for CONNACK"),
            DisconnectReason::Refused(code) => write!(f, "connection refused: {}", code),
            DisconnectReason::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl DisconnectReason {
    /// Network-level endings that the reconnect policy may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ConnectionLost | DisconnectReason::ConnectTimeout
        )
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// CONNECT sent, waiting for CONNACK.
    Connecting,
    Connected,
    /// DISCONNECT queued or connection failing; transport about to close.
    Disconnecting,
}
