//! Connection handler
//!
//! Per-connection session state machine: handshake, packet dispatch, and
//! cleanup. Reads are sequential within the session's own task; outbound
//! bytes go through the connection's [`SharedWriter`] and are drained by
//! a dedicated flush task that owns the write half of the stream.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tracing::{debug, info, warn};

use crate::broker::{BrokerConfig, SharedWriter};
use crate::codec::{Decoder, Encoder, ReadError};
use crate::protocol::{
    ConnAck, Packet, ProtocolError, Publish, ReturnCode, SubAck, Subscribe, Unsubscribe,
    PROTOCOL_LEVEL, PROTOCOL_NAME, SUBACK_GRANTED_QOS0,
};
use crate::topic::{Subscriber, SubscriptionStore};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Decode(crate::protocol::DecodeError),
    Encode(crate::protocol::EncodeError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Decode(e) => write!(f, "decode error: {}", e),
            ConnectionError::Encode(e) => write!(f, "encode error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<ReadError> for ConnectionError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Io(e) => ConnectionError::Io(e),
            ReadError::Decode(e) => ConnectionError::Decode(e),
        }
    }
}

/// Session state
enum State {
    /// Waiting for the opening CONNECT
    AwaitingConnect,
    /// Handshake accepted, processing packets
    Active { client_id: String },
    /// Terminal; cleanup has been triggered
    Closed,
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    stream: S,
    addr: SocketAddr,
    conn_id: u64,
    subscriptions: Arc<SubscriptionStore>,
    config: BrokerConfig,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        conn_id: u64,
        subscriptions: Arc<SubscriptionStore>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            stream,
            addr,
            conn_id,
            subscriptions,
            config,
        }
    }

    /// Run the connection to completion.
    ///
    /// Whatever ends the session (clean disconnect, connection loss,
    /// handshake rejection), the connection's records are removed from
    /// every topic and the writer is closed before this returns.
    pub async fn run(self) -> Result<(), ConnectionError> {
        let (reader, write_half) = tokio::io::split(self.stream);
        let writer = Arc::new(SharedWriter::new());
        let flush_task = spawn_flush_task(write_half, writer.clone(), self.addr);

        let mut session = Session {
            reader,
            addr: self.addr,
            conn_id: self.conn_id,
            decoder: Decoder::new().with_max_packet_size(self.config.max_packet_size),
            encoder: Encoder::new(),
            subscriptions: self.subscriptions.clone(),
            writer: writer.clone(),
            state: State::AwaitingConnect,
        };

        let result = session.run().await;

        self.subscriptions.remove_connection(self.conn_id);
        writer.close();
        let _ = flush_task.await;

        result
    }
}

/// Flush task: drains the shared buffer to the socket on notification.
/// A write failure closes the writer; delivery is best-effort and never
/// retried.
fn spawn_flush_task<S>(
    mut write_half: WriteHalf<S>,
    writer: Arc<SharedWriter>,
    addr: SocketAddr,
) -> tokio::task::JoinHandle<()>
where
    S: AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            writer.notified().await;
            loop {
                let data = writer.take_buffer();
                if data.is_empty() {
                    break;
                }
                if let Err(e) = write_half.write_all(&data).await {
                    warn!("write failed for {}: {}", addr, e);
                    writer.close();
                    return;
                }
            }
            if !writer.is_alive() {
                let _ = write_half.shutdown().await;
                return;
            }
        }
    })
}

/// The read side of a connection: decodes packets and dispatches them.
struct Session<R> {
    reader: R,
    addr: SocketAddr,
    conn_id: u64,
    decoder: Decoder,
    encoder: Encoder,
    subscriptions: Arc<SubscriptionStore>,
    writer: Arc<SharedWriter>,
    state: State,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(&mut self) -> Result<(), ConnectionError> {
        self.handshake().await?;
        if matches!(self.state, State::Closed) {
            return Ok(());
        }
        self.run_active().await
    }

    /// AwaitingConnect: decode exactly one packet. Anything other than a
    /// CONNECT aborts the session without a response. Exactly one CONNACK
    /// is sent otherwise; only a protocol-level mismatch keeps the
    /// session out of the Active state.
    async fn handshake(&mut self) -> Result<(), ConnectionError> {
        let packet = self.decoder.read_packet(&mut self.reader).await?;

        let connect = match packet {
            Packet::Connect(c) => c,
            other => {
                return Err(ConnectionError::Protocol(ProtocolError::ExpectedConnect(
                    other.packet_type(),
                )))
            }
        };

        let return_code = if connect.protocol_name != PROTOCOL_NAME {
            ReturnCode::UnacceptableProtocolName
        } else if connect.protocol_version != PROTOCOL_LEVEL {
            ReturnCode::UnacceptableProtocolVersion
        } else {
            ReturnCode::Accepted
        };

        self.send_packet(&Packet::ConnAck(ConnAck { return_code }));

        if connect.protocol_version == PROTOCOL_LEVEL {
            if return_code != ReturnCode::Accepted {
                warn!(
                    "client '{}' from {} sent protocol name {:?}, answered {:?}",
                    connect.client_id, self.addr, connect.protocol_name, return_code
                );
            }
            info!("client '{}' connected from {}", connect.client_id, self.addr);
            self.state = State::Active {
                client_id: connect.client_id,
            };
        } else {
            debug!(
                "rejected client '{}' from {}: protocol level {}",
                connect.client_id, self.addr, connect.protocol_version
            );
            self.state = State::Closed;
        }

        Ok(())
    }

    /// Active: decode and dispatch until the peer disconnects. Malformed
    /// packets are logged and skipped; the session favors availability
    /// over strict conformance.
    async fn run_active(&mut self) -> Result<(), ConnectionError> {
        loop {
            let packet = match self.decoder.read_packet(&mut self.reader).await {
                Ok(packet) => packet,
                Err(ReadError::Decode(e)) => {
                    warn!("decode error from {}: {}", self.addr, e);
                    continue;
                }
                Err(e) if e.is_eof() => {
                    debug!("{} closed the connection", self.addr);
                    self.state = State::Closed;
                    return Ok(());
                }
                Err(ReadError::Io(e)) => {
                    self.state = State::Closed;
                    return Err(e.into());
                }
            };

            match packet {
                Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe),
                Packet::Publish(publish) => self.handle_publish(publish)?,
                Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe),
                Packet::PingReq => self.send_packet(&Packet::PingResp),
                Packet::Disconnect => {
                    info!("client '{}' disconnected", self.client_id());
                    self.state = State::Closed;
                    return Ok(());
                }
                other => {
                    warn!(
                        "unsupported packet type {} from '{}'",
                        other.packet_type(),
                        self.client_id()
                    );
                }
            }
        }
    }

    /// Register every (topic, qos) pair and acknowledge each with a
    /// granted QoS 0 status byte.
    fn handle_subscribe(&self, subscribe: Subscribe) {
        let mut return_codes = Vec::with_capacity(subscribe.topics.len());
        for (topic, qos) in subscribe.topics.iter().zip(subscribe.requested_qos.iter()) {
            debug!("client '{}' subscribed to '{}'", self.client_id(), topic);
            self.subscriptions.subscribe(
                topic,
                Subscriber {
                    conn_id: self.conn_id,
                    qos: *qos,
                    writer: self.writer.clone(),
                },
            );
            return_codes.push(SUBACK_GRANTED_QOS0);
        }

        self.send_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }));
    }

    /// Re-encode the publish and fan it out. The retain flag updates the
    /// last-value cache; retained values are not replayed to new
    /// subscribers in this broker.
    fn handle_publish(&self, publish: Publish) -> Result<(), ConnectionError> {
        let topic = publish.topic.clone();
        if publish.retain {
            self.subscriptions.retain(&topic, publish.payload.clone());
        }

        let mut frame =
            BytesMut::with_capacity(4 + 2 + publish.topic.len() + publish.payload.len());
        self.encoder
            .encode(&Packet::Publish(publish), &mut frame)
            .map_err(ConnectionError::Encode)?;

        let delivered = self.subscriptions.publish(&topic, &frame.freeze());
        debug!(
            "publish to '{}' from '{}' reached {} subscriber(s)",
            topic,
            self.client_id(),
            delivered
        );
        Ok(())
    }

    fn handle_unsubscribe(&self, unsubscribe: Unsubscribe) {
        for topic in &unsubscribe.topics {
            let removed = self.subscriptions.unsubscribe(topic, self.conn_id);
            debug!(
                "client '{}' unsubscribed from '{}' (was subscribed: {})",
                self.client_id(),
                topic,
                removed
            );
        }
    }

    /// Encode a response into the shared buffer. An append failure means
    /// the flush task already gave up on the socket; it is logged and the
    /// session keeps going until its own read fails.
    fn send_packet(&self, packet: &Packet) {
        let mut buf = BytesMut::new();
        match self.encoder.encode(packet, &mut buf) {
            Ok(()) => {
                if let Err(e) = self.writer.append(&buf) {
                    warn!("response to {} dropped: {}", self.addr, e);
                }
            }
            Err(e) => {
                warn!("failed to encode response for {}: {}", self.addr, e);
            }
        }
    }

    fn client_id(&self) -> &str {
        match &self.state {
            State::Active { client_id } => client_id,
            _ => "",
        }
    }
}
