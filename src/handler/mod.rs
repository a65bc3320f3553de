//! Per-connection protocol handler
//!
//! One handler multiplexes publish/subscribe traffic over a single
//! bidirectional byte stream and enforces the MQTT delivery guarantees.
//! The lifecycle is `attach` (bind session and transport, no I/O),
//! `start` (spawn the connection loop and replay inflight state), `stop`
//! (cancel, drain, join). A session can be re-attached to a fresh
//! transport after a stop; delivery resumes where the last connection
//! left off.
//!
//! Concurrency shape: a single connection-loop task owns the transport
//! and multiplexes reads, write flushes, and the keepalive timer through
//! `select!`. Application callers never touch the stream; they stage
//! packets on the [`PacketWriter`] and rendezvous with the loop through
//! per-packet-id [`Waiter`]s.

mod publish;
mod writer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, trace, warn};

use publish::HandshakeDriver;
use writer::PacketWriter;

use crate::codec::Decoder;
use crate::config::HandlerConfig;
use crate::hooks::{NoopSessionHooks, SessionHooks};
use crate::message::IncomingMessage;
use crate::protocol::{HandlerError, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS};
use crate::session::{DeliveryQueue, Session};
use crate::sync::Waiter;
use crate::transport::StreamAdapter;

const READ_CHUNK_SIZE: usize = 4096;

/// One waiter per outstanding acknowledgement, keyed by packet id.
///
/// Entries are removed by whoever resolves them, in a single map
/// operation, so a lookup never observes a resolved-but-present waiter.
pub(crate) struct AckWaiters {
    pub(crate) puback: DashMap<u16, Arc<Waiter<PubAck>>>,
    pub(crate) pubrec: DashMap<u16, Arc<Waiter<PubRec>>>,
    pub(crate) pubrel: DashMap<u16, Arc<Waiter<PubRel>>>,
    pub(crate) pubcomp: DashMap<u16, Arc<Waiter<PubComp>>>,
    pub(crate) pingresp: Mutex<Option<Arc<Waiter<()>>>>,
}

impl AckWaiters {
    fn new() -> Self {
        Self {
            puback: DashMap::new(),
            pubrec: DashMap::new(),
            pubrel: DashMap::new(),
            pubcomp: DashMap::new(),
            pingresp: Mutex::new(None),
        }
    }

    /// Resolve every outstanding waiter with `error` and clear the maps.
    fn fail_all(&self, error: &HandlerError) {
        for entry in self.puback.iter() {
            let _ = entry.value().set_error(error.clone());
        }
        self.puback.clear();
        for entry in self.pubrec.iter() {
            let _ = entry.value().set_error(error.clone());
        }
        self.pubrec.clear();
        for entry in self.pubrel.iter() {
            let _ = entry.value().set_error(error.clone());
        }
        self.pubrel.clear();
        for entry in self.pubcomp.iter() {
            let _ = entry.value().set_error(error.clone());
        }
        self.pubcomp.clear();
        if let Some(waiter) = self.pingresp.lock().take() {
            let _ = waiter.set_error(error.clone());
        }
    }

    fn cancel_all(&self) {
        self.fail_all(&HandlerError::Cancelled);
    }

    fn counts(&self) -> WaiterCounts {
        WaiterCounts {
            puback: self.puback.len(),
            pubrec: self.pubrec.len(),
            pubrel: self.pubrel.len(),
            pubcomp: self.pubcomp.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.counts().is_empty() && self.pingresp.lock().is_none()
    }
}

/// Outstanding acknowledgement waiters per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterCounts {
    pub puback: usize,
    pub pubrec: usize,
    pub pubrel: usize,
    pub pubcomp: usize,
}

impl WaiterCounts {
    pub fn is_empty(&self) -> bool {
        self.puback == 0 && self.pubrec == 0 && self.pubrel == 0 && self.pubcomp == 0
    }
}

/// Cheap observability view of a handler, usable from other tasks.
#[derive(Clone)]
pub struct HandlerProbe {
    waiters: Arc<AckWaiters>,
    reader_ready: Arc<AtomicBool>,
    reader_stopped: Arc<AtomicBool>,
}

impl HandlerProbe {
    /// True while the connection loop is consuming the stream.
    pub fn reader_ready(&self) -> bool {
        self.reader_ready.load(Ordering::SeqCst)
    }

    /// True once the loop and every handshake task have exited.
    pub fn reader_stopped(&self) -> bool {
        self.reader_stopped.load(Ordering::SeqCst)
    }

    pub fn awaiting_puback(&self, packet_id: u16) -> bool {
        self.waiters.puback.contains_key(&packet_id)
    }

    pub fn awaiting_pubrec(&self, packet_id: u16) -> bool {
        self.waiters.pubrec.contains_key(&packet_id)
    }

    pub fn awaiting_pubrel(&self, packet_id: u16) -> bool {
        self.waiters.pubrel.contains_key(&packet_id)
    }

    pub fn awaiting_pubcomp(&self, packet_id: u16) -> bool {
        self.waiters.pubcomp.contains_key(&packet_id)
    }

    pub fn waiter_counts(&self) -> WaiterCounts {
        self.waiters.counts()
    }
}

/// Per-connection MQTT protocol state machine.
///
/// See the module docs for the lifecycle. All async methods are safe to
/// call from any task; `attach`/`start`/`stop` require exclusive access.
pub struct ProtocolHandler {
    config: HandlerConfig,
    hooks: Arc<dyn SessionHooks>,
    session: Option<Arc<RwLock<Session>>>,
    stream: Option<Box<dyn StreamAdapter>>,
    writer: Option<Arc<PacketWriter>>,
    waiters: Arc<AckWaiters>,
    shutdown: broadcast::Sender<()>,
    subtasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    loop_handle: Option<JoinHandle<Result<(), HandlerError>>>,
    reader_ready: Arc<AtomicBool>,
    reader_stopped: Arc<AtomicBool>,
}

impl ProtocolHandler {
    pub fn new(config: HandlerConfig) -> Self {
        Self::with_hooks(config, Arc::new(NoopSessionHooks))
    }

    pub fn with_hooks(config: HandlerConfig, hooks: Arc<dyn SessionHooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            hooks,
            session: None,
            stream: None,
            writer: None,
            waiters: Arc::new(AckWaiters::new()),
            shutdown,
            subtasks: Arc::new(Mutex::new(Vec::new())),
            loop_handle: None,
            reader_ready: Arc::new(AtomicBool::new(false)),
            reader_stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind a session and transport. No I/O happens until `start`.
    ///
    /// Re-attaching with a fresh transport after `stop` resumes the
    /// session's inflight deliveries on the next `start`.
    pub fn attach<S: StreamAdapter + 'static>(
        &mut self,
        session: Arc<RwLock<Session>>,
        stream: S,
    ) -> Result<(), HandlerError> {
        if self.loop_handle.is_some() {
            return Err(HandlerError::InvalidState("cannot attach while running"));
        }
        self.session = Some(session);
        self.stream = Some(Box::new(stream));
        Ok(())
    }

    /// The attached session, if any.
    pub fn session(&self) -> Option<Arc<RwLock<Session>>> {
        self.session.clone()
    }

    /// Observability handle; clones freely across tasks.
    pub fn probe(&self) -> HandlerProbe {
        HandlerProbe {
            waiters: self.waiters.clone(),
            reader_ready: self.reader_ready.clone(),
            reader_stopped: self.reader_stopped.clone(),
        }
    }

    pub(crate) fn driver(&self) -> Result<HandshakeDriver, HandlerError> {
        let session = self
            .session
            .clone()
            .ok_or(HandlerError::InvalidState("handler not attached"))?;
        let writer = self
            .writer
            .clone()
            .ok_or(HandlerError::InvalidState("handler not started"))?;
        let delivered = session.read().delivered();
        Ok(HandshakeDriver {
            session,
            delivered,
            writer,
            waiters: self.waiters.clone(),
            hooks: self.hooks.clone(),
            shutdown: self.shutdown.clone(),
            subtasks: self.subtasks.clone(),
            handshake_timeout: self.config.handshake_timeout,
        })
    }

    /// Spawn the connection loop and replay inflight state.
    ///
    /// Returns once the loop is consuming the stream and every inflight
    /// message has been staged for redelivery.
    pub async fn start(&mut self) -> Result<(), HandlerError> {
        if self.loop_handle.is_some() {
            return Err(HandlerError::InvalidState("handler already started"));
        }
        let session = self
            .session
            .clone()
            .ok_or(HandlerError::InvalidState("attach a session and stream first"))?;
        let stream = self
            .stream
            .take()
            .ok_or(HandlerError::InvalidState("attach a session and stream first"))?;

        let writer = Arc::new(PacketWriter::new(self.config.max_packet_size));
        self.writer = Some(writer.clone());
        self.reader_ready.store(false, Ordering::SeqCst);
        self.reader_stopped.store(false, Ordering::SeqCst);

        let delivered = session.read().delivered();
        let driver = self.driver()?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let event_loop = EventLoop {
            stream,
            session,
            delivered,
            writer,
            waiters: self.waiters.clone(),
            driver,
            shutdown: self.shutdown.subscribe(),
            config: self.config.clone(),
            decoder: Decoder::new().with_max_packet_size(self.config.max_packet_size),
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            ping_outstanding: false,
            last_write: Instant::now(),
            ping_deadline: Instant::now(),
            reader_ready: self.reader_ready.clone(),
        };
        self.loop_handle = Some(tokio::spawn(event_loop.run(ready_tx)));

        match tokio::time::timeout(self.config.connect_timeout, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // Loop exited before signalling readiness
                return Err(HandlerError::ConnectionClosed);
            }
            Err(_) => {
                let _ = self.shutdown.send(());
                return Err(HandlerError::ConnectTimeout);
            }
        }

        self.replay_inflight()?;
        Ok(())
    }

    /// Cancel the connection loop, drain buffered writes, resolve every
    /// outstanding waiter with `Cancelled`, and join all handshake tasks.
    ///
    /// Incomplete messages remain in the session's inflight maps for the
    /// next `start`. Returns the loop's terminal error if it faulted.
    pub async fn stop(&mut self) -> Result<(), HandlerError> {
        let handle = self
            .loop_handle
            .take()
            .ok_or(HandlerError::InvalidState("handler not started"))?;
        let _ = self.shutdown.send(());
        let result = match handle.await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "connection loop aborted");
                Err(HandlerError::Cancelled)
            }
        };

        // Waiters resolve before their tasks are joined so every
        // continuation can unwind.
        self.waiters.cancel_all();
        let subtasks: Vec<_> = self.subtasks.lock().drain(..).collect();
        for task in subtasks {
            let _ = task.await;
        }
        debug_assert!(self.waiters.is_empty());

        if let Some(session) = &self.session {
            self.hooks.on_detach(&session.read());
        }
        self.reader_stopped.store(true, Ordering::SeqCst);
        result
    }

    /// Take the next message delivered by the peer, waiting if none is
    /// queued. The queue belongs to the session and survives the handler.
    pub async fn mqtt_deliver_next_message(&self) -> Result<IncomingMessage, HandlerError> {
        let session = self
            .session
            .as_ref()
            .ok_or(HandlerError::InvalidState("handler not attached"))?;
        let delivered = session.read().delivered();
        delivered.pop().await
    }
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("attached", &self.session.is_some())
            .field("running", &self.loop_handle.is_some())
            .field("waiters", &self.waiters.counts())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// The connection loop: sole owner of the transport.
struct EventLoop {
    stream: Box<dyn StreamAdapter>,
    session: Arc<RwLock<Session>>,
    delivered: Arc<DeliveryQueue>,
    writer: Arc<PacketWriter>,
    waiters: Arc<AckWaiters>,
    driver: HandshakeDriver,
    shutdown: broadcast::Receiver<()>,
    config: HandlerConfig,
    decoder: Decoder,
    read_buf: BytesMut,
    ping_outstanding: bool,
    last_write: Instant,
    ping_deadline: Instant,
    reader_ready: Arc<AtomicBool>,
}

impl EventLoop {
    async fn run(mut self, ready: oneshot::Sender<()>) -> Result<(), HandlerError> {
        self.reader_ready.store(true, Ordering::SeqCst);
        let _ = ready.send(());

        let result = self.drive().await;

        // Drain buffered writes before tearing the transport down.
        let _ = self.flush().await;
        let _ = self.stream.close().await;
        self.writer.close();
        self.reader_ready.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => self.waiters.cancel_all(),
            Err(e) => {
                error!(error = %e, "connection loop failed");
                self.waiters.fail_all(e);
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<(), HandlerError> {
        loop {
            let keepalive_at = self.config.keep_alive.map(|interval| self.last_write + interval);

            tokio::select! {
                received = self.stream.receive(READ_CHUNK_SIZE) => {
                    let chunk = received?;
                    if chunk.is_empty() {
                        debug!("transport closed by peer");
                        return Ok(());
                    }
                    self.read_buf.extend_from_slice(&chunk);
                    if self.process_read_buf().await? == Flow::Stop {
                        return Ok(());
                    }
                }

                _ = self.writer.notified() => {
                    self.flush().await?;
                }

                _ = self.shutdown.recv() => {
                    trace!("shutdown requested");
                    return Ok(());
                }

                _ = sleep_until(keepalive_at.unwrap_or_else(Instant::now)),
                        if keepalive_at.is_some() && !self.ping_outstanding => {
                    self.send_ping()?;
                }

                _ = sleep_until(self.ping_deadline), if self.ping_outstanding => {
                    warn!("no PINGRESP within deadline");
                    return Err(HandlerError::KeepAliveTimeout);
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), HandlerError> {
        let data = self.writer.take_buffer();
        if !data.is_empty() {
            self.stream.send(&data).await?;
            self.last_write = Instant::now();
        }
        Ok(())
    }

    fn send_ping(&mut self) -> Result<(), HandlerError> {
        debug!("keepalive interval expired, sending PINGREQ");
        *self.waiters.pingresp.lock() = Some(Arc::new(Waiter::new()));
        self.writer.send(&Packet::PingReq)?;
        self.ping_outstanding = true;
        self.ping_deadline = Instant::now() + self.config.ping_timeout;
        Ok(())
    }

    async fn process_read_buf(&mut self) -> Result<Flow, HandlerError> {
        loop {
            let (packet, consumed) = match self.decoder.decode(&self.read_buf) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return Ok(Flow::Continue),
                Err(e) => return Err(HandlerError::Malformed(e)),
            };
            self.read_buf.advance(consumed);
            if self.dispatch(packet).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet) -> Result<Flow, HandlerError> {
        trace!(packet_type = packet.packet_type(), "packet received");
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await?,
            Packet::PubAck(ack) => self.resolve_puback(ack),
            Packet::PubRec(rec) => self.resolve_pubrec(rec),
            Packet::PubRel(rel) => self.resolve_pubrel(rel),
            Packet::PubComp(comp) => self.resolve_pubcomp(comp),
            Packet::PingReq => self.writer.send(&Packet::PingResp)?,
            Packet::PingResp => self.handle_pingresp(),
            Packet::Disconnect => {
                debug!("DISCONNECT received");
                return Ok(Flow::Stop);
            }
            other => {
                warn!(packet_type = other.packet_type(), "unexpected packet");
                return Err(HandlerError::ProtocolViolation(
                    "unexpected packet for a running connection",
                ));
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_publish(&mut self, publish: Publish) -> Result<(), HandlerError> {
        match publish.qos {
            QoS::AtMostOnce => {
                self.delivered
                    .push(IncomingMessage::from_publish(publish))
                    .await?;
            }
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id.ok_or(HandlerError::ProtocolViolation(
                    "QoS 1 PUBLISH without packet id",
                ))?;
                let mut message = IncomingMessage::from_publish(publish);
                let puback = PubAck::new(packet_id);
                self.writer.send(&Packet::PubAck(puback))?;
                message.puback = Some(puback);
                self.delivered.push(message).await?;
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.ok_or(HandlerError::ProtocolViolation(
                    "QoS 2 PUBLISH without packet id",
                ))?;
                let pubrec = PubRec::new(packet_id);

                if self.session.read().inflight_in.contains_key(&packet_id) {
                    // Peer retransmission while the release is pending:
                    // acknowledge again, keep the existing waiter and task.
                    debug!(packet_id, "duplicate QoS 2 PUBLISH, repeating PUBREC");
                    self.writer.send(&Packet::PubRec(pubrec))?;
                    return Ok(());
                }

                let mut message = IncomingMessage::from_publish(publish);
                message.pubrec = Some(pubrec);
                {
                    let mut session = self.session.write();
                    session.inflight_in.insert(packet_id, message);
                }
                self.driver.notify_inflight_change();

                let waiter = Arc::new(Waiter::new());
                self.waiters.pubrel.insert(packet_id, waiter.clone());
                self.writer.send(&Packet::PubRec(pubrec))?;
                self.driver.spawn_release(packet_id, waiter);
            }
        }
        Ok(())
    }

    fn resolve_puback(&self, ack: PubAck) {
        match self.waiters.puback.remove(&ack.packet_id) {
            Some((_, waiter)) => {
                if waiter.set(ack).is_err() {
                    warn!(packet_id = ack.packet_id, "PUBACK waiter already resolved");
                }
            }
            // Spurious retransmission from the peer; tolerated
            None => debug!(packet_id = ack.packet_id, "dropping PUBACK with no waiter"),
        }
    }

    fn resolve_pubrec(&self, rec: PubRec) {
        match self.waiters.pubrec.remove(&rec.packet_id) {
            Some((_, waiter)) => {
                if waiter.set(rec).is_err() {
                    warn!(packet_id = rec.packet_id, "PUBREC waiter already resolved");
                }
            }
            None => debug!(packet_id = rec.packet_id, "dropping PUBREC with no waiter"),
        }
    }

    fn resolve_pubrel(&self, rel: PubRel) {
        match self.waiters.pubrel.remove(&rel.packet_id) {
            Some((_, waiter)) => {
                if waiter.set(rel).is_err() {
                    warn!(packet_id = rel.packet_id, "PUBREL waiter already resolved");
                }
            }
            None => debug!(packet_id = rel.packet_id, "dropping PUBREL with no waiter"),
        }
    }

    fn resolve_pubcomp(&self, comp: PubComp) {
        match self.waiters.pubcomp.remove(&comp.packet_id) {
            Some((_, waiter)) => {
                if waiter.set(comp).is_err() {
                    warn!(packet_id = comp.packet_id, "PUBCOMP waiter already resolved");
                }
            }
            None => debug!(packet_id = comp.packet_id, "dropping PUBCOMP with no waiter"),
        }
    }

    fn handle_pingresp(&mut self) {
        self.ping_outstanding = false;
        match self.waiters.pingresp.lock().take() {
            Some(waiter) => {
                let _ = waiter.set(());
            }
            None => debug!("dropping PINGRESP with no outstanding ping"),
        }
    }
}
