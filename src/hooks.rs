//! Session observation hooks
//!
//! Extensibility point for an external persistence collaborator: the
//! handler reports every inflight-map mutation so state can be
//! snapshotted. Callbacks are synchronous because they run inside the
//! handler's bookkeeping critical sections; implementations that need to
//! do real I/O should hand the snapshot off to their own task.

use crate::session::Session;

/// Observer of session state changes.
///
/// All methods default to no-ops.
pub trait SessionHooks: Send + Sync {
    /// Called after an entry is added to, updated in, or removed from
    /// `inflight_out` or `inflight_in`. The session is read-locked for
    /// the duration of the call; do not re-lock it.
    fn on_inflight_change(&self, _session: &Session) {}

    /// Called when the handler detaches from the connection, either on a
    /// clean stop or on a fault.
    fn on_detach(&self, _session: &Session) {}
}

/// Hooks implementation that observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSessionHooks;

impl SessionHooks for NoopSessionHooks {}
