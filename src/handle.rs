//! One-shot result delivery.
//!
//! Every asynchronous operation in the crate resolves exactly once, either through a
//! [`ResultHandle`] the caller awaits (or blocks on) or through a callback it supplied up front.
//! A [`Promise`] is the producing half. Dropping an unresolved promise resolves it with
//! [`CallError::Abandoned`], so a notification destroyed by queue shutdown never leaves a waiter
//! hanging.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::CallError;

type Callback<T> = Box<dyn FnOnce(Result<T, CallError>) + Send>;

enum Target<T> {
    Handle(oneshot::Sender<Result<T, CallError>>),
    Callback(Callback<T>),
}

/// Producing half of a one-shot result.
pub struct Promise<T> {
    target: Option<Target<T>>,
}

impl<T> Promise<T> {
    /// A promise paired with the handle that observes it.
    pub fn channel() -> (Self, ResultHandle<T>) {
        let (tx, rx) = oneshot::channel();
        let promise = Self {
            target: Some(Target::Handle(tx)),
        };
        (promise, ResultHandle { rx })
    }

    /// A promise that runs `f` on the thread that resolves it.
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Result<T, CallError>) + Send + 'static,
    {
        Self {
            target: Some(Target::Callback(Box::new(f))),
        }
    }

    pub fn resolve(mut self, result: Result<T, CallError>) {
        if let Some(target) = self.target.take() {
            deliver(target, result);
        }
    }
}

fn deliver<T>(target: Target<T>, result: Result<T, CallError>) {
    match target {
        // The observer may have gone away; nothing to report to.
        Target::Handle(tx) => {
            let _ = tx.send(result);
        }
        Target::Callback(f) => f(result),
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            deliver(target, Err(CallError::Abandoned));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Some(Target::Handle(_)) => "handle",
            Some(Target::Callback(_)) => "callback",
            None => "resolved",
        };
        f.debug_struct("Promise").field("target", &target).finish()
    }
}

/// Observing half of a one-shot result.
///
/// Await it from async code, or call [`wait`](ResultHandle::wait) from a plain thread.
#[derive(Debug)]
pub struct ResultHandle<T> {
    rx: oneshot::Receiver<Result<T, CallError>>,
}

impl<T> ResultHandle<T> {
    /// A handle that is already resolved with `result`.
    pub fn ready(result: Result<T, CallError>) -> Self {
        let (promise, handle) = Promise::channel();
        promise.resolve(result);
        handle
    }

    /// Block the current thread until the result is available.
    ///
    /// # Panics
    /// Panics when called from within an async runtime, like
    /// [`oneshot::Receiver::blocking_recv`].
    pub fn wait(self) -> Result<T, CallError> {
        self.rx.blocking_recv().unwrap_or(Err(CallError::Abandoned))
    }

    /// The result if it is already available.
    pub fn try_result(&mut self) -> Option<Result<T, CallError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CallError::Abandoned)),
        }
    }
}

impl<T> Future for ResultHandle<T> {
    type Output = Result<T, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CallError::Abandoned)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_handle_receives_value() {
        let (promise, handle) = Promise::channel();
        promise.resolve(Ok(7));
        assert_eq!(handle.wait().unwrap(), 7);
    }

    #[test]
    fn test_dropped_promise_abandons() {
        let (promise, handle) = Promise::<u32>::channel();
        drop(promise);
        assert!(matches!(handle.wait(), Err(CallError::Abandoned)));
    }

    #[test]
    fn test_callback_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let promise = Promise::callback(move |result: Result<bool, CallError>| {
            assert!(result.unwrap());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        promise.resolve(Ok(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_result_before_and_after() {
        let (promise, mut handle) = Promise::channel();
        assert!(handle.try_result().is_none());
        promise.resolve(Ok("done"));
        assert_eq!(handle.try_result().unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_handle_is_awaitable() {
        let (promise, handle) = Promise::channel();
        tokio::spawn(async move { promise.resolve(Ok(42u64)) });
        assert_eq!(handle.await.unwrap(), 42);
    }
}
