//! Completion notifications and the queue/worker that dispatches them.
//!
//! Every asynchronous transport operation carries a [`Tag`]. When the operation finishes the
//! transport posts the tag back to a [`CompletionQueue`](queue::CompletionQueue) together with an
//! `ok` flag, and the [`CompletionQueueWorker`](worker::CompletionQueueWorker) draining that queue
//! invokes [`Notification::complete`] exactly once and then drops the tag.

pub mod queue;
pub mod worker;

pub use queue::{CompletionQueue, NextStatus};
pub use worker::{CompletionQueueWorker, PollOutcome};

/// A pending asynchronous operation that is told, once, whether it succeeded.
pub trait Notification: Send {
    fn complete(self: Box<Self>, ok: bool);
}

/// The owned handle a transport carries for one outstanding operation.
///
/// Taking `self: Box<Self>` in [`Notification::complete`] means a tag can only be consumed
/// once; the worker that dequeues it is the only place it is dropped after completion.
pub type Tag = Box<dyn Notification>;

/// A [`Notification`] backed by a closure.
pub struct FnNotification<F>(F);

impl<F> Notification for FnNotification<F>
where
    F: FnOnce(bool) + Send,
{
    fn complete(self: Box<Self>, ok: bool) {
        (self.0)(ok)
    }
}

/// Wrap `f` into a [`Tag`].
pub fn notify<F>(f: F) -> Tag
where
    F: FnOnce(bool) + Send + 'static,
{
    Box::new(FnNotification(f))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_notify_passes_flag() {
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();
        let tag = notify(move |ok| flag.store(ok, Ordering::SeqCst));
        tag.complete(true);
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_custom_notification() {
        struct Counter(Arc<AtomicUsize>);

        impl Notification for Counter {
            fn complete(self: Box<Self>, ok: bool) {
                if !ok {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let failures = Arc::new(AtomicUsize::new(0));
        let tag: Tag = Box::new(Counter(failures.clone()));
        tag.complete(false);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }
}
