//! Publish path and QoS handshake continuations
//!
//! `mqtt_publish` drives a handshake inline; after a reconnect the same
//! continuations are spawned as tasks to finish what the previous
//! connection started. Either way the rules are identical: the inflight
//! entry and the ack waiter exist before the packet reaches the wire, and
//! the entry leaves the session only when its handshake completes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::writer::PacketWriter;
use super::{AckWaiters, ProtocolHandler};
use crate::hooks::SessionHooks;
use crate::message::OutgoingMessage;
use crate::protocol::{
    EncodeError, HandlerError, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
};
use crate::session::{DeliveryQueue, Session};
use crate::sync::Waiter;

/// Everything a handshake needs once it leaves the handler's thread of
/// control: cheap to clone, safe to move into a task.
#[derive(Clone)]
pub(crate) struct HandshakeDriver {
    pub(crate) session: Arc<RwLock<Session>>,
    pub(crate) delivered: Arc<DeliveryQueue>,
    pub(crate) writer: Arc<PacketWriter>,
    pub(crate) waiters: Arc<AckWaiters>,
    pub(crate) hooks: Arc<dyn SessionHooks>,
    pub(crate) shutdown: broadcast::Sender<()>,
    pub(crate) subtasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    pub(crate) handshake_timeout: Option<Duration>,
}

impl HandshakeDriver {
    pub(crate) fn notify_inflight_change(&self) {
        let session = self.session.read();
        self.hooks.on_inflight_change(&session);
    }

    /// Bound a handshake step by the configured timeout. A stalled
    /// handshake is fatal for the connection, so the timeout also
    /// requests shutdown.
    async fn bounded<T>(
        &self,
        step: impl Future<Output = Result<T, HandlerError>>,
    ) -> Result<T, HandlerError> {
        match self.handshake_timeout {
            None => step.await,
            Some(limit) => match tokio::time::timeout(limit, step).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = self.shutdown.send(());
                    Err(HandlerError::HandshakeTimeout)
                }
            },
        }
    }

    /// QoS 1 tail: wait for PUBACK, settle the inflight entry.
    pub(crate) async fn await_puback(
        &self,
        packet_id: u16,
        waiter: Arc<Waiter<PubAck>>,
    ) -> Result<OutgoingMessage, HandlerError> {
        let puback = self.bounded(waiter.get()).await?;
        let mut message = self.settle(packet_id)?;
        message.puback = Some(puback);
        Ok(message)
    }

    /// QoS 2 tail from the start: wait for PUBREC, record it, then run
    /// the release leg.
    pub(crate) async fn await_pubrec_then_complete(
        &self,
        packet_id: u16,
        waiter: Arc<Waiter<PubRec>>,
    ) -> Result<OutgoingMessage, HandlerError> {
        let pubrec = self.bounded(waiter.get()).await?;
        {
            let mut session = self.session.write();
            if let Some(entry) = session.inflight_out.get_mut(&packet_id) {
                entry.pubrec = Some(pubrec);
            }
        }
        self.notify_inflight_change();
        self.complete_qos2(packet_id).await
    }

    /// QoS 2 release leg: PUBREL out, PUBCOMP back. Entered after a
    /// PUBREC, or directly on replay when the PUBREC was recorded before
    /// the reconnect.
    pub(crate) async fn complete_qos2(
        &self,
        packet_id: u16,
    ) -> Result<OutgoingMessage, HandlerError> {
        let waiter = Arc::new(Waiter::new());
        self.waiters.pubcomp.insert(packet_id, waiter.clone());

        let pubrel = PubRel::new(packet_id);
        {
            let mut session = self.session.write();
            if let Some(entry) = session.inflight_out.get_mut(&packet_id) {
                entry.pubrel = Some(pubrel);
            }
        }
        if let Err(e) = self.writer.send(&Packet::PubRel(pubrel)) {
            self.waiters.pubcomp.remove(&packet_id);
            return Err(e);
        }

        let pubcomp = self.bounded(waiter.get()).await?;
        let mut message = self.settle(packet_id)?;
        message.pubcomp = Some(pubcomp);
        Ok(message)
    }

    /// Remove a fully acknowledged message from `inflight_out`.
    fn settle(&self, packet_id: u16) -> Result<OutgoingMessage, HandlerError> {
        let message = {
            let mut session = self.session.write();
            session.inflight_out.shift_remove(&packet_id)
        };
        self.notify_inflight_change();
        message.ok_or(HandlerError::ProtocolViolation(
            "acknowledged message missing from inflight",
        ))
    }

    /// Incoming QoS 2 release: wait for the peer's PUBREL, answer with
    /// PUBCOMP, and only then hand the message to the application.
    pub(crate) fn spawn_release(&self, packet_id: u16, waiter: Arc<Waiter<PubRel>>) {
        let driver = self.clone();
        let handle = tokio::spawn(async move {
            let pubrel = match waiter.get().await {
                Ok(packet) => packet,
                // Cancelled or failed: the entry stays in inflight_in so
                // the next connection replays PUBREC.
                Err(e) => {
                    trace!(packet_id, error = %e, "release wait ended");
                    return;
                }
            };

            let message = {
                let mut session = driver.session.write();
                session.inflight_in.shift_remove(&packet_id)
            };
            let Some(mut message) = message else {
                warn!(packet_id, "PUBREL for message missing from inflight");
                return;
            };
            message.pubrel = Some(pubrel);

            let pubcomp = PubComp::new(packet_id);
            if driver.writer.send(&Packet::PubComp(pubcomp)).is_err() {
                // Connection went away between PUBREL and PUBCOMP; put
                // the message back so the next start() resumes here.
                let mut session = driver.session.write();
                session.inflight_in.insert(packet_id, message);
                return;
            }
            message.pubcomp = Some(pubcomp);
            driver.notify_inflight_change();

            if driver.delivered.push(message).await.is_err() {
                warn!(packet_id, "delivered queue closed before handoff");
            }
        });
        self.subtasks.lock().push(handle);
    }

    /// Detach a handshake continuation so a replayed delivery can finish
    /// without anyone awaiting it.
    fn spawn_detached(
        &self,
        packet_id: u16,
        continuation: impl Future<Output = Result<OutgoingMessage, HandlerError>> + Send + 'static,
    ) {
        let handle = tokio::spawn(async move {
            match continuation.await {
                Ok(_) => debug!(packet_id, "redelivery acknowledged"),
                Err(e) => trace!(packet_id, error = %e, "redelivery ended"),
            }
        });
        self.subtasks.lock().push(handle);
    }
}

impl ProtocolHandler {
    /// Publish an application message and drive its QoS handshake to
    /// completion.
    ///
    /// QoS 0 returns as soon as the packet is staged for the wire. QoS 1
    /// returns after PUBACK; QoS 2 after the full
    /// PUBREC/PUBREL/PUBCOMP exchange. The returned message carries every
    /// acknowledgement packet observed on the way.
    pub async fn mqtt_publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<OutgoingMessage, HandlerError> {
        validate_topic(topic)?;
        let driver = self.driver()?;

        match qos {
            QoS::AtMostOnce => {
                let publish = Publish {
                    dup: false,
                    qos,
                    retain,
                    topic: topic.to_string(),
                    packet_id: None,
                    payload: payload.clone(),
                };
                driver.writer.send(&Packet::Publish(publish.clone()))?;
                let mut message = OutgoingMessage::new(None, topic, qos, payload, retain);
                message.publish = Some(publish);
                Ok(message)
            }
            QoS::AtLeastOnce => {
                let (packet_id, publish) = self.stage(&driver, topic, payload, qos, retain)?;
                let waiter = Arc::new(Waiter::new());
                driver.waiters.puback.insert(packet_id, waiter.clone());
                if let Err(e) = driver.writer.send(&Packet::Publish(publish)) {
                    // The message stays inflight for redelivery; only the
                    // waiter must not outlive this call.
                    driver.waiters.puback.remove(&packet_id);
                    return Err(e);
                }
                driver.await_puback(packet_id, waiter).await
            }
            QoS::ExactlyOnce => {
                let (packet_id, publish) = self.stage(&driver, topic, payload, qos, retain)?;
                let waiter = Arc::new(Waiter::new());
                driver.waiters.pubrec.insert(packet_id, waiter.clone());
                if let Err(e) = driver.writer.send(&Packet::Publish(publish)) {
                    driver.waiters.pubrec.remove(&packet_id);
                    return Err(e);
                }
                driver.await_pubrec_then_complete(packet_id, waiter).await
            }
        }
    }

    /// Allocate a packet id and park the message in `inflight_out`,
    /// before anything touches the wire.
    fn stage(
        &self,
        driver: &HandshakeDriver,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(u16, Publish), HandlerError> {
        let staged = {
            let mut session = driver.session.write();
            if session.inflight_out.len() >= usize::from(self.config.max_inflight) {
                return Err(HandlerError::NoFreePacketId);
            }
            let packet_id = session.next_packet_id()?;
            let publish = Publish {
                dup: false,
                qos,
                retain,
                topic: topic.to_string(),
                packet_id: Some(packet_id),
                payload: payload.clone(),
            };
            let mut message = OutgoingMessage::new(Some(packet_id), topic, qos, payload, retain);
            message.publish = Some(publish.clone());
            session.inflight_out.insert(packet_id, message);
            (packet_id, publish)
        };
        driver.notify_inflight_change();
        Ok(staged)
    }

    /// Redeliver every inflight message over a fresh connection.
    ///
    /// Runs during `start()`, before the handler reports ready to
    /// publish. Original packet ids are reused throughout; nothing here
    /// allocates.
    pub(crate) fn replay_inflight(&self) -> Result<(), HandlerError> {
        let driver = self.driver()?;

        enum Redelivery {
            /// Handshake not past PUBREC: the PUBLISH goes again, marked
            /// as a duplicate
            PublishDup {
                packet_id: u16,
                qos: QoS,
                publish: Publish,
            },
            /// QoS 2 past PUBREC: only the release leg remains
            Release { packet_id: u16 },
        }

        let outgoing: Vec<Redelivery> = {
            let session = driver.session.read();
            session
                .inflight_out
                .iter()
                .filter_map(|(packet_id, message)| {
                    if message.pubrec.is_some() {
                        Some(Redelivery::Release {
                            packet_id: *packet_id,
                        })
                    } else if let Some(publish) = &message.publish {
                        Some(Redelivery::PublishDup {
                            packet_id: *packet_id,
                            qos: message.qos,
                            publish: publish.clone(),
                        })
                    } else {
                        warn!(
                            packet_id = *packet_id,
                            "inflight entry without a recorded PUBLISH"
                        );
                        None
                    }
                })
                .collect()
        };

        for redelivery in outgoing {
            match redelivery {
                Redelivery::Release { packet_id } => {
                    debug!(packet_id, "resuming QoS 2 delivery at PUBREL");
                    let task_driver = driver.clone();
                    driver.spawn_detached(packet_id, async move {
                        task_driver.complete_qos2(packet_id).await
                    });
                }
                Redelivery::PublishDup {
                    packet_id,
                    qos,
                    mut publish,
                } => {
                    publish.dup = true;
                    match qos {
                        QoS::AtLeastOnce => {
                            debug!(packet_id, "redelivering PUBLISH (QoS 1)");
                            let waiter = Arc::new(Waiter::new());
                            driver.waiters.puback.insert(packet_id, waiter.clone());
                            driver.writer.send(&Packet::Publish(publish))?;
                            let task_driver = driver.clone();
                            driver.spawn_detached(packet_id, async move {
                                task_driver.await_puback(packet_id, waiter).await
                            });
                        }
                        QoS::ExactlyOnce => {
                            debug!(packet_id, "redelivering PUBLISH (QoS 2)");
                            let waiter = Arc::new(Waiter::new());
                            driver.waiters.pubrec.insert(packet_id, waiter.clone());
                            driver.writer.send(&Packet::Publish(publish))?;
                            let task_driver = driver.clone();
                            driver.spawn_detached(packet_id, async move {
                                task_driver
                                    .await_pubrec_then_complete(packet_id, waiter)
                                    .await
                            });
                        }
                        QoS::AtMostOnce => {
                            // QoS 0 never belongs in an inflight map
                            warn!(packet_id, "discarding QoS 0 entry from inflight");
                            driver.session.write().inflight_out.shift_remove(&packet_id);
                        }
                    }
                }
            }
        }

        let incoming: Vec<u16> = driver.session.read().inflight_in.keys().copied().collect();
        for packet_id in incoming {
            debug!(packet_id, "redelivering PUBREC");
            let waiter = Arc::new(Waiter::new());
            driver.waiters.pubrel.insert(packet_id, waiter.clone());
            driver.writer.send(&Packet::PubRec(PubRec::new(packet_id)))?;
            driver.spawn_release(packet_id, waiter);
        }

        Ok(())
    }
}

/// A publish topic must be non-empty UTF-8 without wildcard characters.
fn validate_topic(topic: &str) -> Result<(), HandlerError> {
    if topic.is_empty()
        || topic.contains('+')
        || topic.contains('#')
        || topic.contains('\0')
    {
        return Err(HandlerError::Encode(EncodeError::InvalidTopicName));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_validation() {
        assert!(validate_topic("/a/b").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("a/+/b").is_err());
        assert!(validate_topic("a/#").is_err());
        assert!(validate_topic("a\0b").is_err());
    }
}
