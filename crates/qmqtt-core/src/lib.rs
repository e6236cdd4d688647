//! qmqtt-core - MQTT 3.1.1 packet types and codec.
//!
//! Encoding and decoding are pure functions over byte buffers; no I/O
//! happens here. [`decode`] is resumable: it reports an incomplete buffer
//! as `Ok(None)` without consuming anything.

pub mod error;
pub mod packet;
pub mod topic;
pub mod varint;

pub use error::{EncodeError, ProtocolError, Result};
pub use packet::*;
