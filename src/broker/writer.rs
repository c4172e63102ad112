//! Direct write buffer shared between the fan-out path and a connection.
//!
//! The subscription table appends pre-serialized frames to a connection's
//! buffer; the connection's flush task drains it to the socket. All
//! outbound bytes for a connection pass through here, so responses and
//! fanned-out frames never interleave mid-packet.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Error when appending to a SharedWriter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Shared write buffer for a single connection.
pub struct SharedWriter {
    /// Pre-serialized bytes waiting to be written
    buffer: Mutex<BytesMut>,
    /// Notification when buffer has new data
    notify: Notify,
    /// Whether the connection is still alive
    alive: AtomicBool,
}

impl SharedWriter {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(2048)),
            notify: Notify::new(),
            alive: AtomicBool::new(true),
        }
    }

    /// Check if the connection is still alive
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the connection as closed and wake the flush task
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    /// Get the notify handle for the flush task
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take all pending data from the buffer
    pub fn take_buffer(&self) -> BytesMut {
        let mut buf = self.buffer.lock();
        buf.split()
    }

    /// Append a pre-serialized frame for delivery.
    ///
    /// Notification is coalesced: the flush task is only woken when the
    /// buffer was empty, so bursts cost one wakeup.
    pub fn append(&self, frame: &[u8]) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        let was_empty = {
            let mut buffer = self.buffer.lock();
            let was_empty = buffer.is_empty();
            buffer.extend_from_slice(frame);
            was_empty
        };

        if was_empty {
            self.notify.notify_one();
        }

        Ok(())
    }
}

impl Default for SharedWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWriter")
            .field("buffer_len", &self.buffer.lock().len())
            .field("alive", &self.is_alive())
            .finish()
    }
}
