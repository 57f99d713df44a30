//! Client-side call façades.
//!
//! The [`AsyncClient`] owns one completion queue drained by a dedicated thread and issues calls
//! through a [`Channel`]. Each call shape returns result handles that resolve from that thread.
//!
//! # Example
//!
//! ```ignore
//! let client = AsyncClient::new(transport.clone(), ClientConfig::default())?;
//!
//! let reply = client
//!     .unary(&SAY_HELLO, HelloRequest { name: "user".into() })
//!     .await?;
//!
//! let (writer, summary) = client.client_streaming(&RECORD_ROUTE).into_parts();
//! let writer = writer.await?;
//! for point in points {
//!     writer.write(point)?;
//! }
//! writer.finish()?.await?;
//! let summary = summary.await?;
//! ```

mod calls;
mod config;
mod streaming;
mod unary;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::info;

pub use calls::CallId;
pub use config::ClientConfig;
pub use streaming::{BidiStream, BidiStreamingCall, ClientStreamingCall, ServerStreamingCall};

use self::calls::CallTracker;
use crate::completion::CompletionQueueWorker;
use crate::error::CallError;
use crate::handle::{Promise, ResultHandle};
use crate::method::{
    BidiStreaming, ClientStreaming, Message, Method, RpcType, ServerStreaming, Unary,
};
use crate::transport::{Channel, ClientCall, ClientContext};

/// Errors creating an [`AsyncClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The completion queue thread could not be spawned.
    #[error("failed to spawn the completion queue thread")]
    Spawn(#[source] std::io::Error),
}

/// Issues calls over a [`Channel`] and dispatches their completions on its own thread.
pub struct AsyncClient {
    channel: Arc<dyn Channel>,
    worker: Arc<CompletionQueueWorker>,
    calls: Arc<CallTracker>,
    config: ClientConfig,
    shut_down: AtomicBool,
}

impl fmt::Debug for AsyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncClient")
            .field("worker", &self.worker.name())
            .field("active_calls", &self.calls.len())
            .field("config", &self.config)
            .finish()
    }
}

impl AsyncClient {
    /// Create the client and start its completion queue thread.
    pub fn new(channel: Arc<dyn Channel>, config: ClientConfig) -> Result<Self, ClientError> {
        let worker = CompletionQueueWorker::new(config.thread_name.clone());
        worker.start().map_err(ClientError::Spawn)?;
        info!(worker = %config.thread_name, "Client started");

        Ok(Self {
            channel,
            worker,
            calls: Arc::new(CallTracker::new()),
            config,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Issue the next call with `context` (metadata, deadline).
    pub fn with_context(&self, context: ClientContext) -> CallScope<'_> {
        CallScope {
            client: self,
            context,
        }
    }

    pub fn unary<Req: Message, Resp: Message>(
        &self,
        method: &Method<Req, Resp, Unary>,
        request: Req,
    ) -> ResultHandle<Resp> {
        self.with_context(ClientContext::new()).unary(method, request)
    }

    /// Like [`unary`](AsyncClient::unary), delivering the outcome to `callback` instead.
    pub fn unary_with<Req, Resp, F>(
        &self,
        method: &Method<Req, Resp, Unary>,
        request: Req,
        callback: F,
    ) where
        Req: Message,
        Resp: Message,
        F: FnOnce(Result<Resp, CallError>) + Send + 'static,
    {
        self.with_context(ClientContext::new())
            .unary_with(method, request, callback)
    }

    pub fn client_streaming<Req: Message, Resp: Message>(
        &self,
        method: &Method<Req, Resp, ClientStreaming>,
    ) -> ClientStreamingCall<Req, Resp> {
        self.with_context(ClientContext::new())
            .client_streaming(method)
    }

    pub fn server_streaming<Req: Message, Resp: Message>(
        &self,
        method: &Method<Req, Resp, ServerStreaming>,
        request: Req,
    ) -> ServerStreamingCall<Resp> {
        self.with_context(ClientContext::new())
            .server_streaming(method, request)
    }

    pub fn bidi_streaming<Req: Message, Resp: Message>(
        &self,
        method: &Method<Req, Resp, BidiStreaming>,
    ) -> BidiStreamingCall<Req, Resp> {
        self.with_context(ClientContext::new())
            .bidi_streaming(method)
    }

    /// Calls issued and not yet completed.
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Cancel live calls, drain the completion queue and join its thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancelled = self.calls.cancel_all();
        self.worker.shutdown();
        self.worker.join();
        info!(worker = %self.worker.name(), cancelled, "Client shut down");
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A call about to be issued with a specific [`ClientContext`].
#[derive(Debug)]
pub struct CallScope<'a> {
    client: &'a AsyncClient,
    context: ClientContext,
}

impl CallScope<'_> {
    fn prepare(&self, method: &'static str, rpc_type: RpcType) -> Arc<dyn ClientCall> {
        let context = self
            .context
            .clone()
            .or_timeout(self.client.config.default_timeout);
        self.client
            .channel
            .prepare_call(method, rpc_type, &context, self.client.worker.queue())
    }

    pub fn unary<Req: Message, Resp: Message>(
        self,
        method: &Method<Req, Resp, Unary>,
        request: Req,
    ) -> ResultHandle<Resp> {
        let (promise, handle) = Promise::channel();
        self.issue_unary(method, request, promise);
        handle
    }

    pub fn unary_with<Req, Resp, F>(
        self,
        method: &Method<Req, Resp, Unary>,
        request: Req,
        callback: F,
    ) where
        Req: Message,
        Resp: Message,
        F: FnOnce(Result<Resp, CallError>) + Send + 'static,
    {
        self.issue_unary(method, request, Promise::callback(callback));
    }

    fn issue_unary<Req: Message, Resp: Message>(
        self,
        method: &Method<Req, Resp, Unary>,
        request: Req,
        promise: Promise<Resp>,
    ) {
        // A shut down client never puts calls on the wire.
        if self.client.is_shut_down() {
            promise.resolve(Err(CallError::Invocation {
                rpc_type: RpcType::Unary,
            }));
            return;
        }
        let call = self.prepare(method.path(), RpcType::Unary);
        unary::start(
            method.path(),
            call,
            &request,
            promise,
            self.client.calls.clone(),
        );
    }

    pub fn client_streaming<Req: Message, Resp: Message>(
        self,
        method: &Method<Req, Resp, ClientStreaming>,
    ) -> ClientStreamingCall<Req, Resp> {
        if self.client.is_shut_down() {
            return ClientStreamingCall::refused();
        }
        let call = self.prepare(method.path(), RpcType::ClientStreaming);
        streaming::client_streaming(method.path(), call, self.client.calls.clone())
    }

    pub fn server_streaming<Req: Message, Resp: Message>(
        self,
        method: &Method<Req, Resp, ServerStreaming>,
        request: Req,
    ) -> ServerStreamingCall<Resp> {
        if self.client.is_shut_down() {
            return ServerStreamingCall::refused();
        }
        let call = self.prepare(method.path(), RpcType::ServerStreaming);
        streaming::server_streaming(method.path(), call, &request, self.client.calls.clone())
    }

    pub fn bidi_streaming<Req: Message, Resp: Message>(
        self,
        method: &Method<Req, Resp, BidiStreaming>,
    ) -> BidiStreamingCall<Req, Resp> {
        if self.client.is_shut_down() {
            return BidiStreamingCall::refused();
        }
        let call = self.prepare(method.path(), RpcType::BidiStreaming);
        streaming::bidi_streaming(method.path(), call, self.client.calls.clone())
    }
}
