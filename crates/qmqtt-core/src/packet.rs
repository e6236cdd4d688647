//! MQTT 3.1.1 packet types and codec.

use bytes::Bytes;

use crate::error::{EncodeError, ProtocolError, Result};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::varint;

/// Protocol name carried in CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

impl PacketType {
    /// Fixed header flags required for this type. PUBLISH carries its own.
    fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT protocol names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQoS(value)),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Reserved CONNACK return code: {}",
                value
            ))),
        }
    }
}

impl std::fmt::Display for ConnackCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnackCode::Accepted => "connection accepted",
            ConnackCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnackCode::IdentifierRejected => "identifier rejected",
            ConnackCode::ServerUnavailable => "server unavailable",
            ConnackCode::BadUsernamePassword => "bad user name or password",
            ConnackCode::NotAuthorized => "not authorized",
        };
        f.write_str(text)
    }
}

/// Per-filter result carried in SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubackCode {
    Granted(QoS),
    Failure,
}

impl SubackCode {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x80 => Ok(SubackCode::Failure),
            0..=2 => Ok(SubackCode::Granted(QoS::try_from(byte)?)),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid SUBACK return code: {:#04x}",
                byte
            ))),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            SubackCode::Granted(qos) => qos as u8,
            SubackCode::Failure => 0x80,
        }
    }
}

/// Last Will and Testament.
///
/// Published by the broker on the client's behalf if the connection ends
/// without a DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    /// Create a new will message with QoS 0 and no retain.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set the QoS level for the will message.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set whether the will message should be retained.
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// MQTT Packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback { .. } => PacketType::Puback,
            Packet::Pubrec { .. } => PacketType::Pubrec,
            Packet::Pubrel { .. } => PacketType::Pubrel,
            Packet::Pubcomp { .. } => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback { .. } => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connect {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
///
/// `packet_id` is present iff `qos` is above 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK packet data, one return code per requested filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<SubackCode>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

// === Decoding ===

/// Cursor over the body of a single packet.
///
/// The body has already been length-checked against the fixed header, so
/// running out of bytes here means the declared length was too short.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn truncated(what: &str) -> ProtocolError {
        ProtocolError::MalformedPacket(format!("Truncated {}", what))
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(|| Self::truncated("byte"))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(Self::truncated("two byte integer"));
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_packet_id(&mut self) -> Result<u16> {
        match self.read_u16()? {
            0 => Err(ProtocolError::ZeroPacketId),
            id => Ok(id),
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Self::truncated("field"));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        // MQTT-1.5.3-2: UTF-8 string MUST NOT contain null character U+0000
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            ));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn read_binary(&mut self) -> Result<Bytes> {
        let len = self.read_u16()? as usize;
        Ok(Bytes::copy_from_slice(self.read_bytes(len)?))
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }

    fn finish(&self, packet_type: PacketType) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} trailing bytes after {:?}",
                self.remaining(),
                packet_type
            )));
        }
        Ok(())
    }
}

/// Try to decode one complete packet from the front of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` on success and `Ok(None)`
/// when `buf` does not yet hold a whole packet; nothing is consumed in that
/// case and the caller should retry once more bytes arrive.
pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    let Some(&fixed_header) = buf.first() else {
        return Ok(None);
    };

    let packet_type = PacketType::try_from(fixed_header >> 4)?;
    let flags = fixed_header & 0x0F;

    // MQTT-2.2.2-2: reserved flag bits must match the table exactly
    if let Some(required) = packet_type.required_flags() {
        if flags != required {
            return Err(ProtocolError::InvalidFlags {
                packet_type: packet_type as u8,
                flags,
            });
        }
    }

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;
    if buf.len() < total_len {
        return Ok(None);
    }

    let body = &buf[header_len..total_len];
    let packet = match packet_type {
        PacketType::Connect => decode_connect(body)?,
        PacketType::Connack => decode_connack(body)?,
        PacketType::Publish => decode_publish(flags, body)?,
        PacketType::Puback => Packet::Puback {
            packet_id: decode_ack(packet_type, body)?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: decode_ack(packet_type, body)?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: decode_ack(packet_type, body)?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: decode_ack(packet_type, body)?,
        },
        PacketType::Subscribe => decode_subscribe(body)?,
        PacketType::Suback => decode_suback(body)?,
        PacketType::Unsubscribe => decode_unsubscribe(body)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: decode_ack(packet_type, body)?,
        },
        PacketType::Pingreq => decode_empty(packet_type, body, Packet::Pingreq)?,
        PacketType::Pingresp => decode_empty(packet_type, body, Packet::Pingresp)?,
        PacketType::Disconnect => decode_empty(packet_type, body, Packet::Disconnect)?,
    };

    Ok(Some((packet, total_len)))
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    if protocol_name != PROTOCOL_NAME {
        return Err(ProtocolError::InvalidProtocolName(protocol_name));
    }

    let level = dec.read_u8()?;
    if level != PROTOCOL_LEVEL {
        return Err(ProtocolError::UnsupportedProtocolLevel(level));
    }

    let flags = dec.read_u8()?;
    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // Reserved bit must be 0
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }

    // MQTT-3.1.2-13/15: Will QoS and Retain must be 0 without a Will
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }

    // MQTT-3.1.2-22: no password without a username
    if !username_flag && password_flag {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }

    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let topic = dec.read_string()?;
        let payload = dec.read_binary()?;
        Some(Will {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    dec.finish(PacketType::Connect)?;

    Ok(Packet::Connect(Connect {
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let ack_flags = dec.read_u8()?;
    if ack_flags & 0xFE != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "Reserved CONNACK flags set: {:#04x}",
            ack_flags
        )));
    }
    let code = ConnackCode::try_from(dec.read_u8()?)?;
    dec.finish(PacketType::Connack)?;

    Ok(Packet::Connack(Connack {
        session_present: ack_flags & 0x01 != 0,
        code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    // MQTT-3.3.1-2: DUP must be 0 for QoS 0
    if dup && qos == QoS::AtMostOnce {
        return Err(ProtocolError::MalformedPacket(
            "DUP flag set on QoS 0 PUBLISH".into(),
        ));
    }

    let mut dec = Decoder::new(body);
    let topic = dec.read_string()?;
    if validate_topic_name(&topic).is_err() {
        return Err(ProtocolError::MalformedPacket(format!(
            "Invalid PUBLISH topic name: '{}'",
            topic
        )));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_packet_id()?)
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(dec.rest());

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    }))
}

fn decode_ack(packet_type: PacketType, body: &[u8]) -> Result<u16> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_packet_id()?;
    dec.finish(packet_type)?;
    Ok(packet_id)
}

fn decode_empty(packet_type: PacketType, body: &[u8], packet: Packet) -> Result<Packet> {
    Decoder::new(body).finish(packet_type)?;
    Ok(packet)
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_packet_id()?;

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        if validate_topic_filter(&filter).is_err() {
            return Err(ProtocolError::MalformedPacket(format!(
                "Invalid topic filter: '{}'",
                filter
            )));
        }

        // MQTT-3.8.3-4: upper six bits of the requested QoS byte are reserved
        let options = dec.read_u8()?;
        if options & 0xFC != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "Reserved SUBSCRIBE option bits set: {:#04x}",
                options
            )));
        }
        filters.push((filter, QoS::try_from(options)?));
    }

    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_packet_id()?;

    let return_codes = dec
        .rest()
        .iter()
        .map(|&b| SubackCode::from_byte(b))
        .collect::<Result<Vec<_>>>()?;

    if return_codes.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBACK with no return codes".into(),
        ));
    }

    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_packet_id()?;

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        if validate_topic_filter(&filter).is_err() {
            return Err(ProtocolError::MalformedPacket(format!(
                "Invalid topic filter: '{}'",
                filter
            )));
        }
        filters.push(filter);
    }

    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "UNSUBSCRIBE with no topics".into(),
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

// === Encoding ===

fn put_string(s: &str, buf: &mut Vec<u8>) -> std::result::Result<(), EncodeError> {
    put_binary(s.as_bytes(), buf)
}

fn put_binary(data: &[u8], buf: &mut Vec<u8>) -> std::result::Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong(data.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

fn check_packet_id(packet_id: u16) -> std::result::Result<u16, EncodeError> {
    if packet_id == 0 {
        return Err(EncodeError::InvalidPacketId("packet identifier 0 is reserved"));
    }
    Ok(packet_id)
}

/// Encode a packet, appending it to `buf`.
///
/// Field constraints are checked before anything is written, so `buf` is
/// left untouched on error.
pub fn encode(packet: &Packet, buf: &mut Vec<u8>) -> std::result::Result<(), EncodeError> {
    // Variable header and payload, except a PUBLISH payload which is appended
    // straight from the packet to avoid a second copy.
    let mut body = Vec::new();
    let mut tail: &[u8] = &[];

    let flags = match packet {
        Packet::Connect(connect) => {
            encode_connect(connect, &mut body)?;
            0
        }
        Packet::Connack(connack) => {
            body.push(connack.session_present as u8);
            body.push(connack.code as u8);
            0
        }
        Packet::Publish(publish) => {
            tail = &publish.payload;
            encode_publish(publish, &mut body)?
        }
        Packet::Puback { packet_id }
        | Packet::Pubrec { packet_id }
        | Packet::Pubrel { packet_id }
        | Packet::Pubcomp { packet_id }
        | Packet::Unsuback { packet_id } => {
            body.extend_from_slice(&check_packet_id(*packet_id)?.to_be_bytes());
            packet.packet_type().required_flags().unwrap_or(0)
        }
        Packet::Subscribe(subscribe) => {
            if subscribe.filters.is_empty() {
                return Err(EncodeError::EmptySubscription("SUBSCRIBE"));
            }
            body.extend_from_slice(&check_packet_id(subscribe.packet_id)?.to_be_bytes());
            for (filter, qos) in &subscribe.filters {
                validate_topic_filter(filter)?;
                put_string(filter, &mut body)?;
                body.push(*qos as u8);
            }
            0x02
        }
        Packet::Suback(suback) => {
            if suback.return_codes.is_empty() {
                return Err(EncodeError::EmptySubscription("SUBACK"));
            }
            body.extend_from_slice(&check_packet_id(suback.packet_id)?.to_be_bytes());
            body.extend(suback.return_codes.iter().map(|c| c.to_byte()));
            0
        }
        Packet::Unsubscribe(unsubscribe) => {
            if unsubscribe.filters.is_empty() {
                return Err(EncodeError::EmptySubscription("UNSUBSCRIBE"));
            }
            body.extend_from_slice(&check_packet_id(unsubscribe.packet_id)?.to_be_bytes());
            for filter in &unsubscribe.filters {
                validate_topic_filter(filter)?;
                put_string(filter, &mut body)?;
            }
            0x02
        }
        Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => 0,
    };

    let remaining = body.len() + tail.len();
    if remaining > varint::MAX_VALUE as usize {
        return Err(EncodeError::PacketTooLarge(remaining));
    }

    buf.reserve(1 + varint::encoded_len(remaining as u32) + remaining);
    buf.push(((packet.packet_type() as u8) << 4) | flags);
    varint::encode_to_vec(remaining as u32, buf);
    buf.extend_from_slice(&body);
    buf.extend_from_slice(tail);
    Ok(())
}

fn encode_connect(connect: &Connect, body: &mut Vec<u8>) -> std::result::Result<(), EncodeError> {
    if connect.password.is_some() && connect.username.is_none() {
        return Err(EncodeError::PasswordWithoutUsername);
    }

    put_string(PROTOCOL_NAME, body)?;
    body.push(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        validate_topic_name(&will.topic)?;
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);
    body.extend_from_slice(&connect.keep_alive.to_be_bytes());

    put_string(&connect.client_id, body)?;

    if let Some(ref will) = connect.will {
        put_string(&will.topic, body)?;
        put_binary(&will.payload, body)?;
    }
    if let Some(ref username) = connect.username {
        put_string(username, body)?;
    }
    if let Some(ref password) = connect.password {
        put_binary(password, body)?;
    }
    Ok(())
}

/// Writes the PUBLISH variable header and returns the fixed header flags.
fn encode_publish(publish: &Publish, body: &mut Vec<u8>) -> std::result::Result<u8, EncodeError> {
    validate_topic_name(&publish.topic)?;

    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, Some(_)) => {
            return Err(EncodeError::InvalidPacketId(
                "QoS 0 PUBLISH must not carry a packet identifier",
            ))
        }
        (QoS::AtLeastOnce | QoS::ExactlyOnce, None) => {
            return Err(EncodeError::InvalidPacketId(
                "QoS 1/2 PUBLISH requires a packet identifier",
            ))
        }
        _ => {}
    }
    if publish.dup && publish.qos == QoS::AtMostOnce {
        return Err(EncodeError::DupWithoutQoS);
    }

    put_string(&publish.topic, body)?;
    if let Some(id) = publish.packet_id {
        body.extend_from_slice(&check_packet_id(id)?.to_be_bytes());
    }

    let mut flags = (publish.qos as u8) << 1;
    if publish.dup {
        flags |= 0x08;
    }
    if publish.retain {
        flags |= 0x01;
    }
    Ok(flags)
}
