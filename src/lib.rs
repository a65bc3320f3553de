//! WireMQ - MQTT v3.1.1 per-connection protocol handler
//!
//! The state machine between one MQTT peer and the application: packet
//! codec, QoS 0/1/2 delivery tracking, inflight redelivery across
//! reconnects, and keepalive probing. Listeners, routing, and
//! authentication live in the embedding broker or client; this crate
//! speaks the protocol over any bidirectional byte stream.

pub mod codec;
pub mod config;
pub mod handler;
pub mod hooks;
pub mod message;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod transport;

pub use config::{ConfigError, HandlerConfig};
pub use handler::{HandlerProbe, ProtocolHandler, WaiterCounts};
pub use hooks::{NoopSessionHooks, SessionHooks};
pub use message::{IncomingMessage, OutgoingMessage};
pub use protocol::{HandlerError, Packet, QoS};
pub use session::{DeliveryQueue, Session};
pub use sync::Waiter;
pub use transport::{NetStream, StreamAdapter};
