//! Application-level messages
//!
//! An application message is the unit the handler trades with its
//! embedder: one PUBLISH plus the acknowledgement packets observed over
//! its lifetime. QoS 0 messages are created and handed over immediately;
//! QoS 1/2 messages live in the session's inflight maps until their
//! handshake completes.

use bytes::Bytes;

use crate::protocol::{PubAck, PubComp, PubRec, PubRel, Publish, QoS};

/// A message travelling application -> wire.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Packet identifier; `None` for QoS 0
    pub packet_id: Option<u16>,
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
    pub retain: bool,
    /// PUBLISH as written to the wire
    pub publish: Option<Publish>,
    /// PUBACK received (QoS 1)
    pub puback: Option<PubAck>,
    /// PUBREC received (QoS 2)
    pub pubrec: Option<PubRec>,
    /// PUBREL sent (QoS 2)
    pub pubrel: Option<PubRel>,
    /// PUBCOMP received (QoS 2)
    pub pubcomp: Option<PubComp>,
}

impl OutgoingMessage {
    pub fn new(
        packet_id: Option<u16>,
        topic: impl Into<String>,
        qos: QoS,
        payload: Bytes,
        retain: bool,
    ) -> Self {
        Self {
            packet_id,
            topic: topic.into(),
            qos,
            payload,
            retain,
            publish: None,
            puback: None,
            pubrec: None,
            pubrel: None,
            pubcomp: None,
        }
    }

    /// True once every acknowledgement this QoS level requires has been
    /// recorded.
    pub fn is_acknowledged(&self) -> bool {
        match self.qos {
            QoS::AtMostOnce => true,
            QoS::AtLeastOnce => self.puback.is_some(),
            QoS::ExactlyOnce => self.pubcomp.is_some(),
        }
    }
}

/// A message travelling wire -> application.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Packet identifier; `None` for QoS 0
    pub packet_id: Option<u16>,
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
    pub retain: bool,
    /// Duplicate-delivery flag from the PUBLISH fixed header
    pub dup: bool,
    /// PUBLISH as read from the wire
    pub publish: Option<Publish>,
    /// PUBACK sent (QoS 1)
    pub puback: Option<PubAck>,
    /// PUBREC sent (QoS 2)
    pub pubrec: Option<PubRec>,
    /// PUBREL received (QoS 2)
    pub pubrel: Option<PubRel>,
    /// PUBCOMP sent (QoS 2)
    pub pubcomp: Option<PubComp>,
}

impl IncomingMessage {
    /// Build the message from a decoded PUBLISH, recording the packet.
    pub fn from_publish(publish: Publish) -> Self {
        Self {
            packet_id: publish.packet_id,
            topic: publish.topic.clone(),
            qos: publish.qos,
            payload: publish.payload.clone(),
            retain: publish.retain,
            dup: publish.dup,
            publish: Some(publish),
            puback: None,
            pubrec: None,
            pubrel: None,
            pubcomp: None,
        }
    }
}
