//! Single-shot rendezvous cell
//!
//! [`Waiter`] is how a publishing task and the connection reader meet: the
//! publisher registers a waiter keyed by packet id, the reader resolves it
//! when the matching acknowledgement arrives. The cell holds either a value
//! or an error behind an explicit tag, so delivering an error is never
//! conflated with delivering a value that happens to describe one.

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::HandlerError;

enum State<T> {
    Unset,
    Value(T),
    Error(HandlerError),
    Taken,
}

/// A waitable single-shot value.
///
/// `set` / `set_error` may be called at most once between them; the value
/// may be read at most once. At most one task should await `get` at a
/// time.
pub struct Waiter<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> Waiter<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Unset),
            notify: Notify::new(),
        }
    }

    /// Resolve the cell with a value, waking the waiting task.
    pub fn set(&self, value: T) -> Result<(), HandlerError> {
        self.resolve(State::Value(value))
    }

    /// Resolve the cell with an error, waking the waiting task.
    pub fn set_error(&self, error: HandlerError) -> Result<(), HandlerError> {
        self.resolve(State::Error(error))
    }

    /// Shorthand for resolving with [`HandlerError::Cancelled`].
    pub fn cancel(&self) -> Result<(), HandlerError> {
        self.set_error(HandlerError::Cancelled)
    }

    fn resolve(&self, resolved: State<T>) -> Result<(), HandlerError> {
        {
            let mut state = self.state.lock();
            match *state {
                State::Unset => *state = resolved,
                _ => return Err(HandlerError::InvalidState("value already set")),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// True once a value or error has been delivered.
    pub fn is_set(&self) -> bool {
        !matches!(*self.state.lock(), State::Unset)
    }

    /// Same predicate as [`is_set`](Self::is_set); kept so call sites can
    /// say what they mean about the handshake rather than the cell.
    pub fn done(&self) -> bool {
        self.is_set()
    }

    /// Wait for the cell to resolve and take the result.
    ///
    /// Returns immediately if already resolved. A second `get` fails with
    /// `InvalidState`.
    pub async fn get(&self) -> Result<T, HandlerError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                match std::mem::replace(&mut *state, State::Taken) {
                    State::Unset => *state = State::Unset,
                    State::Value(v) => return Ok(v),
                    State::Error(e) => return Err(e),
                    State::Taken => {
                        return Err(HandlerError::InvalidState("value already taken"))
                    }
                }
            }
            notified.await;
        }
    }
}

impl<T> Default for Waiter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Waiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.state.lock() {
            State::Unset => "unset",
            State::Value(_) => "value",
            State::Error(_) => "error",
            State::Taken => "taken",
        };
        f.debug_struct("Waiter").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let w = Waiter::new();
        w.set(7u16).unwrap();
        assert!(w.is_set());
        assert!(w.done());
        assert_eq!(w.get().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn get_blocks_until_set() {
        let w = Arc::new(Waiter::new());
        let reader = {
            let w = w.clone();
            tokio::spawn(async move { w.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!w.is_set());
        w.set("ready").unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), "ready");
    }

    #[tokio::test]
    async fn second_set_is_invalid_state() {
        let w = Waiter::new();
        w.set(1u8).unwrap();
        assert!(matches!(
            w.set(2),
            Err(HandlerError::InvalidState(_))
        ));
        assert!(matches!(
            w.set_error(HandlerError::Cancelled),
            Err(HandlerError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn error_is_raised_on_get() {
        let w: Waiter<u8> = Waiter::new();
        w.set_error(HandlerError::KeepAliveTimeout).unwrap();
        assert!(matches!(w.get().await, Err(HandlerError::KeepAliveTimeout)));
    }

    #[tokio::test]
    async fn cancel_delivers_cancelled() {
        let w: Waiter<u8> = Waiter::new();
        w.cancel().unwrap();
        assert!(w.get().await.unwrap_err().is_cancelled());
    }

    #[test]
    fn get_is_pending_until_set() {
        let w = Waiter::new();
        let mut get = tokio_test::task::spawn(w.get());
        assert!(get.poll().is_pending());

        w.set(5u8).unwrap();
        assert!(get.is_woken());
        match get.poll() {
            std::task::Poll::Ready(Ok(v)) => assert_eq!(v, 5),
            other => panic!("expected ready value, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn value_can_only_be_read_once() {
        let w = Waiter::new();
        w.set(3u8).unwrap();
        assert_eq!(w.get().await.unwrap(), 3);
        assert!(matches!(
            w.get().await,
            Err(HandlerError::InvalidState(_))
        ));
    }
}
