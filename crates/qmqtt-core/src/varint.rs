//! Variable Byte Integer encoding/decoding for the MQTT remaining length.
//!
//! 7 bits per byte carry the value, the high bit flags a following byte:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - 2097152-268435455: 4 bytes

use crate::error::{ProtocolError, Result};

/// Largest value representable in four bytes.
pub const MAX_VALUE: u32 = 268_435_455;

/// Decode a variable byte integer from the front of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` if complete,
/// `Ok(None)` if more bytes are needed, or `Err` if the encoding is invalid.
///
/// # Example
/// ```
/// use qmqtt_core::varint::decode;
/// let buf = [0x80, 0x01]; // Encodes 128
/// let (value, consumed) = decode(&buf).unwrap().unwrap();
/// assert_eq!(value, 128);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        value += ((byte & 0x7F) as usize) << (7 * i);

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }

        // A fourth byte may not announce a fifth.
        if i == 3 {
            return Err(ProtocolError::InvalidRemainingLength);
        }
    }

    Ok(None)
}

/// Encode a value as a variable byte integer, appending to a Vec.
///
/// Returns the number of bytes written. Callers must keep `value` at or
/// below [`MAX_VALUE`].
///
/// # Example
/// ```
/// use qmqtt_core::varint::encode_to_vec;
/// let mut buf = Vec::new();
/// let written = encode_to_vec(300, &mut buf);
/// assert_eq!(written, 2);
/// assert_eq!(&buf, &[0xAC, 0x02]);
/// ```
pub fn encode_to_vec(mut value: u32, buf: &mut Vec<u8>) -> usize {
    debug_assert!(value <= MAX_VALUE);
    let start = buf.len();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    buf.len() - start
}

/// Number of bytes needed to encode a value.
///
/// # Example
/// ```
/// use qmqtt_core::varint::encoded_len;
/// assert_eq!(encoded_len(127), 1);
/// assert_eq!(encoded_len(128), 2);
/// assert_eq!(encoded_len(16384), 3);
/// ```
pub fn encoded_len(mut value: u32) -> usize {
    let mut len = 0;
    loop {
        len += 1;
        value /= 128;
        if value == 0 {
            break;
        }
    }
    len
}
