//! Serialized write path
//!
//! All outgoing packets, whatever task they originate from, are encoded
//! into a single staging buffer. The connection loop is the only task that
//! touches the transport: it drains the buffer whenever the notify fires.
//! Packets therefore reach the wire whole and in submission order.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::codec::Encoder;
use crate::protocol::{EncodeError, HandlerError, Packet};

pub(crate) struct PacketWriter {
    buffer: Mutex<BytesMut>,
    notify: Notify,
    alive: AtomicBool,
    encoder: Encoder,
    max_packet_size: usize,
}

impl PacketWriter {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(2048)),
            notify: Notify::new(),
            alive: AtomicBool::new(true),
            encoder: Encoder::new(),
            max_packet_size,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the connection as closed; subsequent sends fail.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    /// Notification handle for the connection loop.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Take all staged bytes.
    pub fn take_buffer(&self) -> BytesMut {
        self.buffer.lock().split()
    }

    /// Stage one packet for the connection loop to flush.
    pub fn send(&self, packet: &Packet) -> Result<(), HandlerError> {
        if !self.is_alive() {
            return Err(HandlerError::ConnectionClosed);
        }

        let was_empty = {
            let mut buffer = self.buffer.lock();
            let start_len = buffer.len();
            if let Err(e) = self.encoder.encode(packet, &mut buffer) {
                buffer.truncate(start_len);
                return Err(HandlerError::Encode(e));
            }
            if buffer.len() - start_len > self.max_packet_size {
                buffer.truncate(start_len);
                return Err(HandlerError::Encode(EncodeError::PacketTooLarge));
            }
            start_len == 0
        };

        // Only notify on the empty-to-nonempty edge, coalescing bursts
        if was_empty {
            self.notify.notify_one();
        }

        Ok(())
    }
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("buffered", &self.buffer.lock().len())
            .field("alive", &self.is_alive())
            .finish()
    }
}
