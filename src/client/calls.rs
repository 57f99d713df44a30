use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::transport::ClientCall;

/// Identity of a call tracked by the client.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
pub struct CallId(Uuid);

impl CallId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self.0)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct TrackedCall {
    method: &'static str,
    call: Arc<dyn ClientCall>,
}

/// Calls that have been issued and have not reached their terminal completion.
#[derive(Default)]
pub(crate) struct CallTracker {
    calls: DashMap<CallId, TrackedCall, ahash::RandomState>,
}

impl CallTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn track(&self, method: &'static str, call: Arc<dyn ClientCall>) -> CallId {
        let id = CallId::generate();
        self.calls.insert(id, TrackedCall { method, call });
        id
    }

    pub(crate) fn release(&self, id: &CallId) {
        self.calls.remove(id);
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    /// Cancel every tracked call, returning how many were cancelled.
    pub(crate) fn cancel_all(&self) -> usize {
        // Collected first so cancellation never runs under a map lock.
        let live: Vec<_> = self
            .calls
            .iter()
            .map(|entry| (*entry.key(), entry.value().method, entry.value().call.clone()))
            .collect();

        for (id, method, call) in &live {
            tracing::debug!(call_id = %id, method, "Cancelling call on client shutdown");
            call.cancel();
        }
        live.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use tonic::Status;

    use super::*;
    use crate::completion::Tag;
    use crate::stream::{Slot, WriteOptions};
    use crate::transport::CallOutcome;

    #[derive(Default)]
    struct CountingCall {
        cancels: AtomicUsize,
    }

    impl ClientCall for CountingCall {
        fn start(&self, _request: Option<Bytes>, _tag: Tag) {}
        fn write(&self, _message: Bytes, _options: WriteOptions, _tag: Tag) {}
        fn writes_done(&self, _tag: Tag) {}
        fn read(&self, _slot: Slot<Bytes>, _tag: Tag) {}
        fn finish(&self, _outcome: Slot<CallOutcome>, _tag: Tag) {}
        fn cancel_with(&self, _status: Status) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_track_and_release() {
        let tracker = CallTracker::new();
        let id = tracker.track("test.A/B", Arc::new(CountingCall::default()));
        assert_eq!(tracker.len(), 1);

        tracker.release(&id);
        tracker.release(&id);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_cancel_all() {
        let tracker = CallTracker::new();
        let calls: Vec<_> = (0..3).map(|_| Arc::new(CountingCall::default())).collect();
        for call in &calls {
            tracker.track("test.A/B", call.clone());
        }

        assert_eq!(tracker.cancel_all(), 3);
        for call in &calls {
            assert_eq!(call.cancels.load(Ordering::SeqCst), 1);
        }
    }
}
