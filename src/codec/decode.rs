//! Packet decoder
//!
//! Reads one control packet at a time off a byte stream: one fixed-header
//! byte, the remaining-length field one byte at a time, then exactly that
//! many body bytes, parsed by packet type.

use std::fmt;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{read_string, read_u16, MAX_REMAINING_LENGTH, MAX_REMAINING_LENGTH_BYTES};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, PacketType, Publish, QoS, ReturnCode, SubAck,
    Subscribe, Unsubscribe,
};

/// Error from reading a packet off a stream.
///
/// Transport failures and malformed packets propagate differently: the
/// session ends on the former and recovers from the latter.
#[derive(Debug)]
pub enum ReadError {
    /// Transport failure (includes clean EOF as `UnexpectedEof`)
    Io(std::io::Error),
    /// Malformed packet
    Decode(DecodeError),
}

impl ReadError {
    /// True when the peer closed the stream between packets or mid-frame.
    pub fn is_eof(&self) -> bool {
        matches!(self, ReadError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Io(e) => write!(f, "IO error: {}", e),
            ReadError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        ReadError::Io(e)
    }
}

impl From<DecodeError> for ReadError {
    fn from(e: DecodeError) -> Self {
        ReadError::Decode(e)
    }
}

/// Decoded fixed header byte: type nibble, duplicate flag, QoS, retain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: u8,
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
}

impl FixedHeader {
    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        let qos_bits = (byte & 0x06) >> 1;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        Ok(Self {
            packet_type: byte >> 4,
            dup: (byte & 0x08) != 0,
            qos,
            retain: (byte & 0x01) != 0,
        })
    }
}

/// Packet decoder
#[derive(Debug)]
pub struct Decoder {
    /// Maximum accepted remaining length
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Read and decode the next packet from the stream.
    ///
    /// The full body region is consumed before parsing, so a body-level
    /// decode error leaves the stream positioned at the next fixed
    /// header and the caller can keep reading.
    pub async fn read_packet<R>(&self, reader: &mut R) -> Result<Packet, ReadError>
    where
        R: AsyncRead + Unpin,
    {
        let header = FixedHeader::from_byte(reader.read_u8().await?)?;

        let remaining_length = self.read_remaining_length(reader).await?;
        if remaining_length > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge.into());
        }

        let mut body = vec![0u8; remaining_length];
        reader.read_exact(&mut body).await?;

        self.decode_body(header, &body).map_err(Into::into)
    }

    /// Read the remaining-length field one byte at a time. A fifth
    /// continuation byte is a decode error, never an unbounded loop.
    async fn read_remaining_length<R>(&self, reader: &mut R) -> Result<usize, ReadError>
    where
        R: AsyncRead + Unpin,
    {
        let mut multiplier: u32 = 1;
        let mut value: u32 = 0;
        let mut pos = 0;

        loop {
            if pos >= MAX_REMAINING_LENGTH_BYTES {
                return Err(DecodeError::InvalidRemainingLength.into());
            }

            let byte = reader.read_u8().await?;
            value += ((byte & 0x7F) as u32) * multiplier;
            pos += 1;

            if (byte & 0x80) == 0 {
                break;
            }

            multiplier *= 128;
        }

        Ok(value as usize)
    }

    /// Parse the body region by packet type.
    pub fn decode_body(&self, header: FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
        let packet_type = PacketType::from_u8(header.packet_type)
            .ok_or(DecodeError::InvalidPacketType(header.packet_type))?;

        match packet_type {
            PacketType::Connect => self.decode_connect(body),
            PacketType::ConnAck => self.decode_connack(body),
            PacketType::Publish => self.decode_publish(header, body),
            PacketType::Subscribe => self.decode_subscribe(body),
            PacketType::SubAck => self.decode_suback(body),
            PacketType::Unsubscribe => self.decode_unsubscribe(body),
            // The acknowledgement family carries no state this broker
            // acts on; the body is consumed and dropped.
            PacketType::PubAck => Ok(Packet::PubAck),
            PacketType::PubRec => Ok(Packet::PubRec),
            PacketType::PubRel => Ok(Packet::PubRel),
            PacketType::PubComp => Ok(Packet::PubComp),
            PacketType::UnsubAck => Ok(Packet::UnsubAck),
            PacketType::PingReq => Ok(Packet::PingReq),
            PacketType::PingResp => Ok(Packet::PingResp),
            PacketType::Disconnect => Ok(Packet::Disconnect),
        }
    }

    fn decode_connect(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut pos = 0;

        let (protocol_name, len) = read_string(&body[pos..], "protocol name")?;
        pos += len;

        if pos >= body.len() {
            return Err(DecodeError::Truncated("protocol level"));
        }
        let protocol_version = body[pos];
        pos += 1;

        if pos >= body.len() {
            return Err(DecodeError::Truncated("connect flags"));
        }
        let flags = body[pos];
        pos += 1;

        let keep_alive = read_u16(&body[pos..], "keep alive")?;
        pos += 2;

        let (client_id, len) = read_string(&body[pos..], "client identifier")?;
        pos += len;

        // The client identifier must be the last field; anything after it
        // means the declared lengths and the body disagree.
        if pos != body.len() {
            return Err(DecodeError::TrailingBytes);
        }

        Ok(Packet::Connect(Connect {
            protocol_name: protocol_name.to_string(),
            protocol_version,
            flags,
            keep_alive,
            client_id: client_id.to_string(),
        }))
    }

    fn decode_connack(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        if body.len() < 2 {
            return Err(DecodeError::Truncated("return code"));
        }
        let return_code =
            ReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;
        Ok(Packet::ConnAck(ConnAck { return_code }))
    }

    fn decode_publish(&self, header: FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut pos = 0;

        let (topic, len) = read_string(&body[pos..], "topic name")?;
        pos += len;

        let packet_id = if header.qos != QoS::AtMostOnce {
            let id = read_u16(&body[pos..], "packet identifier")?;
            pos += 2;
            Some(id)
        } else {
            None
        };

        Ok(Packet::Publish(Publish {
            dup: header.dup,
            qos: header.qos,
            retain: header.retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
        }))
    }

    fn decode_subscribe(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let packet_id = read_u16(body, "packet identifier")?;
        let mut pos = 2;

        let mut topics = Vec::new();
        let mut requested_qos = Vec::new();
        while pos < body.len() {
            let (topic, len) = read_string(&body[pos..], "topic filter")?;
            pos += len;

            if pos >= body.len() {
                return Err(DecodeError::Truncated("requested QoS"));
            }
            let qos = QoS::from_u8(body[pos]).ok_or(DecodeError::InvalidQoS(body[pos]))?;
            pos += 1;

            topics.push(topic.to_string());
            requested_qos.push(qos);
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            topics,
            requested_qos,
        }))
    }

    fn decode_suback(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let packet_id = read_u16(body, "packet identifier")?;
        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes: body[2..].to_vec(),
        }))
    }

    fn decode_unsubscribe(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let packet_id = read_u16(body, "packet identifier")?;
        let mut pos = 2;

        let mut topics = Vec::new();
        while pos < body.len() {
            let (topic, len) = read_string(&body[pos..], "topic filter")?;
            pos += len;
            topics.push(topic.to_string());
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
