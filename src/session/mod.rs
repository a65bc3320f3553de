//! MQTT session state
//!
//! The session owns everything that must survive a reconnect: the two
//! inflight maps, the packet-identifier allocator, and the queue of
//! messages ready for the application. The handler borrows a session for
//! the lifetime of one connection; the session never references the
//! handler back.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::mpsc;

use crate::message::{IncomingMessage, OutgoingMessage};
use crate::protocol::HandlerError;

/// Default capacity of the delivered-message queue
pub const DEFAULT_DELIVERED_QUEUE_SIZE: usize = 1000;

/// Per-client session state.
///
/// Inflight maps are insertion-ordered so that redelivery after a
/// reconnect preserves the original submission order.
pub struct Session {
    /// Client identifier
    pub client_id: String,
    /// Whether the peer asked for a clean session
    pub clean_session: bool,
    /// Outgoing messages awaiting a peer acknowledgement, by packet id
    pub inflight_out: IndexMap<u16, OutgoingMessage>,
    /// Incoming QoS 2 messages between PUBREC-sent and PUBREL-received
    pub inflight_in: IndexMap<u16, IncomingMessage>,
    next_packet_id: u16,
    delivered: Arc<DeliveryQueue>,
}

impl Session {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::with_queue_size(client_id, DEFAULT_DELIVERED_QUEUE_SIZE)
    }

    pub fn with_queue_size(client_id: impl Into<String>, queue_size: usize) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: false,
            inflight_out: IndexMap::new(),
            inflight_in: IndexMap::new(),
            next_packet_id: 1,
            delivered: Arc::new(DeliveryQueue::new(queue_size)),
        }
    }

    /// Allocate the next free packet identifier.
    ///
    /// Starts at 1 and wraps mod 2^16, skipping 0 and every id currently
    /// inflight in either direction. Fails once the window is saturated.
    pub fn next_packet_id(&mut self) -> Result<u16, HandlerError> {
        if self.inflight_out.len() + self.inflight_in.len() >= u16::MAX as usize {
            return Err(HandlerError::NoFreePacketId);
        }

        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.inflight_out.contains_key(&id) && !self.inflight_in.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Queue of messages ready for application consumption.
    pub fn delivered(&self) -> Arc<DeliveryQueue> {
        self.delivered.clone()
    }

    /// Discard all inflight state, as on a clean-session connect.
    pub fn reset(&mut self) {
        self.inflight_out.clear();
        self.inflight_in.clear();
        self.next_packet_id = 1;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("inflight_out", &self.inflight_out.len())
            .field("inflight_in", &self.inflight_in.len())
            .finish()
    }
}

/// Bounded async queue of messages ready for the application.
///
/// Pushes apply backpressure when the queue is full; the receiver side is
/// guarded by an async mutex, so consumption is naturally single-reader.
pub struct DeliveryQueue {
    tx: mpsc::Sender<IncomingMessage>,
    rx: tokio::sync::Mutex<mpsc::Receiver<IncomingMessage>>,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Append a message, waiting while the queue is full.
    pub async fn push(&self, message: IncomingMessage) -> Result<(), HandlerError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| HandlerError::Cancelled)
    }

    /// Remove and return the oldest message, waiting while empty.
    pub async fn pop(&self) -> Result<IncomingMessage, HandlerError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(HandlerError::Cancelled)
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
