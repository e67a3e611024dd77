//! Event interface: egress notifications from the TX/RX engines to a
//! runtime controller. At most one listener may be registered at a time;
//! registering a second is rejected rather than silently replacing the
//! first, matching the control API's `AlreadyInUse` semantics.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::stream::StreamState;

/// Receives link and per-stream state-change notifications. Implementations
/// must not block; the engines call these synchronously from their own
/// worker threads.
pub trait EventListener: Send + Sync {
    /// The NIC link transitioned; fired at most once per actual transition.
    fn on_link_status(&self, up: bool);

    /// A stream's dispatch/state-machine state changed from what it was the
    /// last time this listener was notified about it.
    fn on_stream_status(&self, stream_id: u64, state: StreamState);
}

/// Single-subscriber event slot, shared by the TX engine and the RX engine
/// so that "at most one listener" is enforced across the whole
/// [`crate::context::EngineContext`] rather than per engine independently.
#[derive(Default)]
pub struct EventSlot {
    listener: RwLock<Option<Arc<dyn EventListener>>>,
}

impl EventSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            listener: RwLock::new(None),
        }
    }

    /// Registers `listener`.
    ///
    /// # Errors
    /// [`Error::AlreadyInUse`] if a listener is already registered.
    pub fn register(&self, listener: Arc<dyn EventListener>) -> Result<()> {
        let mut slot = self.listener.write();
        if slot.is_some() {
            return Err(Error::AlreadyInUse("event listener".into()));
        }
        *slot = Some(listener);
        Ok(())
    }

    /// Clears the registered listener, if any.
    pub fn unregister(&self) {
        *self.listener.write() = None;
    }

    pub fn notify_link_status(&self, up: bool) {
        if let Some(listener) = self.listener.read().as_ref() {
            listener.on_link_status(up);
        }
    }

    pub fn notify_stream_status(&self, stream_id: u64, state: StreamState) {
        if let Some(listener) = self.listener.read().as_ref() {
            listener.on_stream_status(stream_id, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        link_events: Mutex<Vec<bool>>,
        stream_events: Mutex<Vec<(u64, StreamState)>>,
    }

    impl EventListener for RecordingListener {
        fn on_link_status(&self, up: bool) {
            self.link_events.lock().push(up);
        }

        fn on_stream_status(&self, stream_id: u64, state: StreamState) {
            self.stream_events.lock().push((stream_id, state));
        }
    }

    #[test]
    fn second_registration_is_rejected() {
        let slot = EventSlot::new();
        let a = Arc::new(RecordingListener::default());
        let b = Arc::new(RecordingListener::default());
        assert!(slot.register(a).is_ok());
        assert!(matches!(slot.register(b), Err(Error::AlreadyInUse(_))));
    }

    #[test]
    fn unregister_allows_a_fresh_registration() {
        let slot = EventSlot::new();
        let a = Arc::new(RecordingListener::default());
        slot.register(a).unwrap();
        slot.unregister();
        let b = Arc::new(RecordingListener::default());
        assert!(slot.register(b).is_ok());
    }

    #[test]
    fn notifications_reach_the_registered_listener() {
        let slot = EventSlot::new();
        let listener = Arc::new(RecordingListener::default());
        slot.register(listener.clone()).unwrap();
        slot.notify_link_status(true);
        slot.notify_stream_status(7, StreamState::Valid);
        assert_eq!(listener.link_events.lock().as_slice(), &[true]);
        assert_eq!(
            listener.stream_events.lock().as_slice(),
            &[(7, StreamState::Valid)]
        );
    }

    #[test]
    fn no_listener_registered_is_a_silent_no_op() {
        let slot = EventSlot::new();
        slot.notify_link_status(true);
        slot.notify_stream_status(1, StreamState::NoData);
    }
}
