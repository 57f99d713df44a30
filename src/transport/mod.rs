//! The seam between the call engine and a completion-queue RPC transport.
//!
//! Every operation takes a [`Tag`] and completes it exactly once by posting it to the completion
//! queue bound to the call: the client queue given to [`Channel::prepare_call`], or the queue a
//! server listener was armed on via [`ServerTransport::request_call`]. Results land in a
//! [`Slot`] before the tag is posted.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tonic::Status;

use crate::completion::{CompletionQueue, Tag};
use crate::method::RpcType;
use crate::stream::{Slot, WriteOptions};

pub mod context;
pub mod loopback;

pub use context::{ClientContext, ServerContext};
pub use loopback::LoopbackTransport;

/// Client side of a transport: creates calls bound to a completion queue.
pub trait Channel: Send + Sync {
    fn prepare_call(
        &self,
        method: &'static str,
        rpc_type: RpcType,
        context: &ClientContext,
        queue: &Arc<CompletionQueue>,
    ) -> Arc<dyn ClientCall>;
}

/// One client call. Operations on a direction must not overlap.
pub trait ClientCall: Send + Sync {
    /// Put the call on the wire. Single-request shapes pass their request, which also half-closes
    /// the request stream. Completes `false` when the call cannot reach the wire.
    fn start(&self, request: Option<Bytes>, tag: Tag);

    fn write(&self, message: Bytes, options: WriteOptions, tag: Tag);

    /// Half-close the request stream.
    fn writes_done(&self, tag: Tag);

    /// Completes `false` once the response stream ended.
    fn read(&self, slot: Slot<Bytes>, tag: Tag);

    /// Wait for the final status (and the single response of single-response shapes). Implies
    /// [`writes_done`](ClientCall::writes_done).
    fn finish(&self, outcome: Slot<CallOutcome>, tag: Tag);

    fn cancel_with(&self, status: Status);

    fn cancel(&self) {
        self.cancel_with(Status::cancelled("call cancelled by client"));
    }
}

/// Final outcome of a client call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status: Status,
    pub response: Option<Bytes>,
}

/// Server side of a transport: hands accepted calls to armed listeners.
pub trait ServerTransport: Send + Sync {
    fn register_method(&self, method: &'static str, rpc_type: RpcType);

    /// Arm a listener for the next call of `method`. The tag completes `true` with the call in
    /// `slot`, or `false` once the server is shutting down.
    fn request_call(
        &self,
        method: &'static str,
        queue: &Arc<CompletionQueue>,
        slot: Slot<IncomingCall>,
        tag: Tag,
    );

    /// Stop accepting calls: abort armed listeners and fail live calls.
    fn shutdown(&self);
}

/// One accepted server call. Operations complete on the queue it was accepted on.
pub trait ServerCall: Send + Sync {
    fn read(&self, slot: Slot<Bytes>, tag: Tag);

    fn write(&self, message: Bytes, options: WriteOptions, tag: Tag);

    /// Send the final status, preceded by `response` for single-response shapes.
    fn finish(&self, response: Option<Bytes>, status: Status, tag: Tag);

    fn cancel_with(&self, status: Status);

    fn is_cancelled(&self) -> bool;
}

/// A call handed to a listener.
pub struct IncomingCall {
    pub context: ServerContext,
    /// The request of single-request shapes.
    pub request: Option<Bytes>,
    pub call: Arc<dyn ServerCall>,
}

impl fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingCall")
            .field("context", &self.context)
            .field("request_len", &self.request.as_ref().map(Bytes::len))
            .finish()
    }
}
