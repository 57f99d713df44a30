use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info};

use super::queue::{CompletionQueue, NextStatus};

/// What one [`poll`](CompletionQueueWorker::poll) step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A notification was completed and released.
    Event,
    /// The deadline passed without an event.
    Timeout,
    /// The queue is shut down and drained.
    Shutdown,
}

impl PollOutcome {
    /// Whether the worker should keep polling.
    pub fn should_continue(self) -> bool {
        !matches!(self, PollOutcome::Shutdown)
    }
}

/// Drains a [`CompletionQueue`], dispatching every dequeued notification.
///
/// The worker is the sole point where a completed notification is released.
#[derive(Debug)]
pub struct CompletionQueueWorker {
    name: String,
    queue: Arc<CompletionQueue>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CompletionQueueWorker {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_queue(name, CompletionQueue::new())
    }

    pub fn with_queue(name: impl Into<String>, queue: Arc<CompletionQueue>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            queue,
            thread: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<CompletionQueue> {
        &self.queue
    }

    /// Wait for one event up to `deadline` and dispatch it.
    pub fn poll(&self, deadline: Option<Instant>) -> PollOutcome {
        match self.queue.next(deadline) {
            NextStatus::GotEvent(tag, ok) => {
                // `complete` consumes the box, releasing the notification once it returns.
                tag.complete(ok);
                PollOutcome::Event
            }
            NextStatus::Timeout => PollOutcome::Timeout,
            NextStatus::Shutdown => PollOutcome::Shutdown,
        }
    }

    /// Poll until the queue reports shutdown.
    pub fn run(&self) {
        let mut dispatched = 0u64;
        loop {
            match self.poll(None) {
                PollOutcome::Event => dispatched += 1,
                PollOutcome::Timeout => {}
                PollOutcome::Shutdown => break,
            }
        }
        debug!(worker = %self.name, dispatched, "Completion queue worker exiting");
    }

    /// Spawn the dedicated polling thread. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let mut thread = self.thread.lock().expect("worker thread lock poisoned");
        if thread.is_some() {
            return Ok(());
        }

        let worker = self.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run())?;
        info!(worker = %self.name, "Started completion queue worker");
        *thread = Some(handle);
        Ok(())
    }

    /// Shut the queue down; the polling thread exits once it drains.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// Wait for the polling thread to exit.
    ///
    /// Returns immediately when called from the polling thread itself (for example from a
    /// completion callback that stops the owning client or server).
    pub fn join(&self) {
        let handle = {
            let mut thread = self.thread.lock().expect("worker thread lock poisoned");
            match thread.as_ref() {
                Some(handle) if handle.thread().id() == thread::current().id() => None,
                _ => thread.take(),
            }
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(worker = %self.name, "Completion queue worker panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .expect("worker thread lock poisoned")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::completion::notify;

    #[test]
    fn test_poll_completes_event() {
        let worker = CompletionQueueWorker::new("test-cq");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        worker.queue().post(
            notify(move |ok| {
                assert!(ok);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );

        assert_eq!(worker.poll(None), PollOutcome::Event);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_poll_timeout_and_shutdown() {
        let worker = CompletionQueueWorker::new("test-cq");
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(worker.poll(Some(deadline)), PollOutcome::Timeout);

        worker.shutdown();
        assert_eq!(worker.poll(None), PollOutcome::Shutdown);
        assert!(!worker.poll(None).should_continue());
    }

    #[test]
    fn test_thread_dispatches_and_joins() {
        let worker = CompletionQueueWorker::new("test-cq");
        worker.start().unwrap();
        worker.start().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            worker.queue().post(notify(move |ok| tx.send((i, ok)).unwrap()), i % 2 == 0);
        }

        let received: Vec<_> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(
            received,
            vec![(0, true), (1, false), (2, true), (3, false), (4, true)]
        );

        worker.shutdown();
        worker.join();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_join_from_worker_thread_returns() {
        let worker = CompletionQueueWorker::new("test-cq");
        worker.start().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let inner = worker.clone();
        worker.queue().post(
            notify(move |_| {
                inner.shutdown();
                inner.join();
                tx.send(()).unwrap();
            }),
            true,
        );

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        worker.join();
    }
}
