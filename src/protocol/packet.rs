//! Control packet definitions

use bytes::Bytes;

use super::{QoS, ReturnCode};

/// Decoded control packet.
///
/// Client-to-server types carry full bodies; the QoS 1/2 acknowledgement
/// family is recognized on the wire but carries no state the broker acts
/// on, so those variants are unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Get packet type as u8
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => 1,
            Packet::ConnAck(_) => 2,
            Packet::Publish(_) => 3,
            Packet::PubAck => 4,
            Packet::PubRec => 5,
            Packet::PubRel => 6,
            Packet::PubComp => 7,
            Packet::Subscribe(_) => 8,
            Packet::SubAck(_) => 9,
            Packet::Unsubscribe(_) => 10,
            Packet::UnsubAck => 11,
            Packet::PingReq => 12,
            Packet::PingResp => 13,
            Packet::Disconnect => 14,
        }
    }
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol name as sent by the client (validated by the session)
    pub protocol_name: String,
    /// Protocol level as sent by the client
    pub protocol_version: u8,
    /// Raw connect flags byte
    pub flags: u8,
    /// Keep alive interval in seconds (parsed, not enforced)
    pub keep_alive: u16,
    /// Client identifier
    pub client_id: String,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// Return code
    pub return_code: ReturnCode,
}

/// PUBLISH packet (bidirectional)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Topic name
    pub topic: String,
    /// Packet identifier; meaningful only when qos > 0. The encode path
    /// never emits it (see `Encoder::encode_publish`).
    pub packet_id: Option<u16>,
    /// Payload
    pub payload: Bytes,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: String::new(),
            packet_id: None,
            payload: Bytes::new(),
        }
    }
}

/// SUBSCRIBE packet (client -> server)
///
/// `topics` and `requested_qos` are parallel arrays of the same length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Topic filters
    pub topics: Vec<String>,
    /// Requested QoS per topic filter
    pub requested_qos: Vec<QoS>,
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    /// Packet identifier
    pub packet_id: u16,
    /// One status byte per subscribed topic (0x00 granted, 0x80 failure)
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Topic filters to unsubscribe from
    pub topics: Vec<String>,
}
