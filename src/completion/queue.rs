use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::debug;

use super::Tag;

/// Result of waiting on a [`CompletionQueue`].
pub enum NextStatus {
    /// An operation completed; the tag and its success flag are handed over.
    GotEvent(Tag, bool),
    /// The deadline passed without an event.
    Timeout,
    /// The queue was shut down and fully drained.
    Shutdown,
}

impl std::fmt::Debug for NextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NextStatus::GotEvent(_, ok) => f.debug_tuple("GotEvent").field(ok).finish(),
            NextStatus::Timeout => f.write_str("Timeout"),
            NextStatus::Shutdown => f.write_str("Shutdown"),
        }
    }
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<(Tag, bool)>,
    shutdown: bool,
}

/// Transport-owned queue of completed operations.
///
/// Events posted before [`shutdown`](CompletionQueue::shutdown) are still delivered; once the
/// queue is empty and shut down [`next`](CompletionQueue::next) returns
/// [`NextStatus::Shutdown`]. Tags posted after shutdown are dropped without completing, which
/// resolves any promise they own as abandoned.
#[derive(Default)]
pub struct CompletionQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("completion queue lock poisoned");
        f.debug_struct("CompletionQueue")
            .field("pending", &state.events.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl CompletionQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Post a completed operation.
    pub fn post(&self, tag: Tag, ok: bool) {
        let rejected = {
            let mut state = self.state.lock().expect("completion queue lock poisoned");
            if state.shutdown {
                Some(tag)
            } else {
                state.events.push_back((tag, ok));
                None
            }
        };

        match rejected {
            // Dropped outside the lock, the tag may resolve promises that re-enter the queue.
            Some(tag) => {
                debug!("Dropping completion posted after shutdown");
                drop(tag);
            }
            None => self.ready.notify_one(),
        }
    }

    /// Wait for the next completion, up to `deadline` (forever when `None`).
    pub fn next(&self, deadline: Option<Instant>) -> NextStatus {
        let mut state = self.state.lock().expect("completion queue lock poisoned");
        loop {
            if let Some((tag, ok)) = state.events.pop_front() {
                return NextStatus::GotEvent(tag, ok);
            }
            if state.shutdown {
                return NextStatus::Shutdown;
            }

            match deadline {
                None => {
                    state = self
                        .ready
                        .wait(state)
                        .expect("completion queue lock poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return NextStatus::Timeout;
                    }
                    state = self
                        .ready
                        .wait_timeout(state, deadline - now)
                        .expect("completion queue lock poisoned")
                        .0;
                }
            }
        }
    }

    /// Stop accepting new completions. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("completion queue lock poisoned");
        if !state.shutdown {
            state.shutdown = true;
            debug!(pending = state.events.len(), "Completion queue shut down");
        }
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state
            .lock()
            .expect("completion queue lock poisoned")
            .shutdown
    }

    /// Number of completions waiting to be dispatched.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("completion queue lock poisoned")
            .events
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::completion::notify;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_events_are_fifo() {
        let queue = CompletionQueue::new();
        queue.post(notify(|_| {}), true);
        queue.post(notify(|_| {}), false);

        assert!(matches!(queue.next(None), NextStatus::GotEvent(_, true)));
        assert!(matches!(queue.next(None), NextStatus::GotEvent(_, false)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_timeout_when_idle() {
        let queue = CompletionQueue::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(matches!(queue.next(Some(deadline)), NextStatus::Timeout));
    }

    #[test]
    fn test_shutdown_drains_pending_first() {
        let queue = CompletionQueue::new();
        queue.post(notify(|_| {}), true);
        queue.shutdown();

        assert!(matches!(queue.next(None), NextStatus::GotEvent(_, true)));
        assert!(matches!(queue.next(None), NextStatus::Shutdown));
        assert!(matches!(queue.next(None), NextStatus::Shutdown));
    }

    #[test]
    fn test_post_after_shutdown_drops_tag() {
        let drops = Arc::new(AtomicUsize::new(0));
        let guard = DropCounter(drops.clone());
        let queue = CompletionQueue::new();
        queue.shutdown();
        queue.shutdown();

        queue.post(notify(move |_| drop(guard)), true);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_shutdown_wakes_blocked_waiter() {
        let queue = CompletionQueue::new();
        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || matches!(queue.next(None), NextStatus::Shutdown))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert!(waiter.join().unwrap());
    }
}
