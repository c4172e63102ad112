//! Broker core
//!
//! Owns the subscription table, accepts connections and spawns one
//! session task per client.

mod connection;
mod writer;

pub use connection::{Connection, ConnectionError};
pub use writer::{SendError, SharedWriter};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::topic::SubscriptionStore;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum accepted remaining length per packet
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().unwrap(),
            max_packet_size: 1024 * 1024, // 1 MB
        }
    }
}

/// The broker
pub struct Broker {
    /// Configuration
    config: BrokerConfig,
    /// Subscription table, shared with every session task
    subscriptions: Arc<SubscriptionStore>,
    /// Next connection id
    next_conn_id: AtomicU64,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            subscriptions: Arc::new(SubscriptionStore::new()),
            next_conn_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Run the accept loop. Never blocks on per-connection work; accept
    /// errors are logged and the loop keeps serving.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("broker listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("new connection from {}", addr);
                        self.handle_connection(stream, addr);
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("broker shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Spawn a session task for a new connection, racing the shutdown
    /// signal.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let subscriptions = self.subscriptions.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("failed to set TCP_NODELAY for {}: {}", addr, e);
            }

            let conn = Connection::new(stream, addr, conn_id, subscriptions, config);
            let conn_fut = conn.run();
            tokio::pin!(conn_fut);

            loop {
                tokio::select! {
                    biased;

                    result = &mut conn_fut => {
                        if let Err(e) = result {
                            debug!("connection error from {}: {}", addr, e);
                        }
                        break;
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) => break,
                            Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            }
        });
    }

    /// Shutdown the broker
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Subscription table handle (shared with session tasks)
    pub fn subscriptions(&self) -> &Arc<SubscriptionStore> {
        &self.subscriptions
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
