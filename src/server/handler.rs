//! Per-method call handlers and the re-arming accept loop.
//!
//! Every armed listener is a tracked handler instance. When the transport hands it a call, the
//! instance first arms its replacement on the same queue and only then starts processing, so a
//! slow process function never delays acceptance of the next call.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tonic::Status;
use tracing::{debug, error, trace, warn};

use super::registry::{HandlerId, HandlerPhase, HandlerRegistry};
use crate::completion::{CompletionQueue, notify};
use crate::method::{Message, RpcType, decode, encode};
use crate::stream::wire::{ServerSink, ServerSource};
use crate::stream::{StreamReader, StreamWriter, slot, take_slot};
use crate::transport::{IncomingCall, ServerCall, ServerContext, ServerTransport};

/// Everything a listener on one completion queue needs.
pub(crate) struct QueueContext {
    pub(crate) index: usize,
    pub(crate) queue: Arc<CompletionQueue>,
    pub(crate) transport: Arc<dyn ServerTransport>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) runtime: tokio::runtime::Handle,
}

/// Handle an instance uses to report its progress back to the registry.
#[derive(Clone)]
pub(crate) struct Lifecycle {
    registry: Arc<HandlerRegistry>,
    id: HandlerId,
}

impl Lifecycle {
    fn finishing(&self) {
        self.registry.set_phase(&self.id, HandlerPhase::Finishing);
    }

    fn dispose(&self) {
        self.registry.dispose(&self.id);
    }
}

/// What to do with an accepted call of one method.
pub(crate) trait CallHandler: Send + Sync + 'static {
    fn method(&self) -> &'static str;

    fn rpc_type(&self) -> RpcType;

    /// Build the task that processes `incoming` and issues its terminal operation. The terminal
    /// completion must call [`Lifecycle::dispose`].
    fn process(&self, incoming: IncomingCall, lifecycle: Lifecycle) -> BoxFuture<'static, ()>;
}

/// Arm a listener for `handler` on the queue of `context`.
pub(crate) fn listen(handler: Arc<dyn CallHandler>, context: Arc<QueueContext>) {
    let method = handler.method();
    let Some(id) = context.registry.insert(method, context.index) else {
        trace!(method, "Registry closed, not arming listener");
        return;
    };

    let incoming = slot();
    let landed = incoming.clone();
    let transport = context.transport.clone();
    let queue = context.queue.clone();
    let tag = notify(move |ok| {
        let incoming = take_slot(&landed);
        accepted(handler, context, id, ok, incoming)
    });
    transport.request_call(method, &queue, incoming, tag);
}

fn accepted(
    handler: Arc<dyn CallHandler>,
    context: Arc<QueueContext>,
    id: HandlerId,
    ok: bool,
    incoming: Option<IncomingCall>,
) {
    let Some(incoming) = incoming.filter(|_| ok) else {
        debug!(handler_id = %id, method = handler.method(), "Listener aborted");
        context.registry.dispose(&id);
        return;
    };

    // Replacement first: the method keeps accepting while this call is processed.
    listen(handler.clone(), context.clone());

    debug!(
        handler_id = %id,
        method = handler.method(),
        rpc_type = %handler.rpc_type(),
        queue = context.index,
        peer = incoming.context.peer(),
        "Call accepted"
    );
    context.registry.set_phase(&id, HandlerPhase::Processing);
    let lifecycle = Lifecycle {
        registry: context.registry.clone(),
        id,
    };
    let task = context.runtime.spawn(handler.process(incoming, lifecycle));
    context.registry.attach_task(&id, task.abort_handle());
}

/// Run a process future, turning a panic into an `Internal` status.
async fn guarded<T>(
    method: &'static str,
    future: impl Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!(method, "Handler panicked");
            Err(Status::internal("handler panicked"))
        })
}

fn decode_request<Req: Message>(request: Option<Bytes>) -> Result<Req, Status> {
    let payload = request.ok_or_else(|| Status::internal("call arrived without a request"))?;
    decode(payload).map_err(|error| {
        warn!(%error, "Failed to decode request");
        Status::internal(format!("failed to decode request: {error}"))
    })
}

/// Send the single response (or the error status) and dispose once it completed.
fn respond<Resp: Message>(
    call: Arc<dyn ServerCall>,
    result: Result<Resp, Status>,
    lifecycle: Lifecycle,
) {
    let (response, status) = match result {
        Ok(response) => (Some(encode(&response)), Status::ok("")),
        Err(status) => (None, status),
    };
    lifecycle.finishing();
    call.finish(
        response,
        status,
        notify(move |ok| {
            if !ok {
                debug!("Response not delivered, call already ended");
            }
            lifecycle.dispose();
        }),
    );
}

/// Finish the response stream with the process function's status unless it finished it itself.
fn close<Resp: Message>(
    writer: &StreamWriter<Resp>,
    result: Result<(), Status>,
    lifecycle: &Lifecycle,
) {
    lifecycle.finishing();
    writer.close_with(result.err().unwrap_or_else(|| Status::ok("")));
}

fn server_writer<Resp: Message>(
    call: &Arc<dyn ServerCall>,
    lifecycle: Lifecycle,
) -> StreamWriter<Resp> {
    StreamWriter::<Resp>::new(Arc::new(ServerSink::new(call.clone())))
        .on_finished(move |_| lifecycle.dispose())
}

fn server_reader<Req: Message>(call: &Arc<dyn ServerCall>) -> StreamReader<Req> {
    StreamReader::<Req>::new(Arc::new(ServerSource::new(call.clone())))
}

pub(crate) struct UnaryHandler<Req, Resp, F> {
    method: &'static str,
    process: Arc<F>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> UnaryHandler<Req, Resp, F> {
    pub(crate) fn new(method: &'static str, process: F) -> Self {
        Self {
            method,
            process: Arc::new(process),
            _marker: PhantomData,
        }
    }
}

impl<Req, Resp, F, Fut> CallHandler for UnaryHandler<Req, Resp, F>
where
    Req: Message,
    Resp: Message,
    F: Fn(ServerContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    fn method(&self) -> &'static str {
        self.method
    }

    fn rpc_type(&self) -> RpcType {
        RpcType::Unary
    }

    fn process(&self, incoming: IncomingCall, lifecycle: Lifecycle) -> BoxFuture<'static, ()> {
        let IncomingCall {
            context,
            request,
            call,
        } = incoming;
        let (method, process) = (self.method, self.process.clone());

        async move {
            let result = match decode_request::<Req>(request) {
                Ok(request) => {
                    guarded(method, async move { (*process)(context, request).await }).await
                }
                Err(status) => Err(status),
            };
            respond(call, result, lifecycle);
        }
        .boxed()
    }
}

pub(crate) struct ClientStreamingHandler<Req, Resp, F> {
    method: &'static str,
    process: Arc<F>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> ClientStreamingHandler<Req, Resp, F> {
    pub(crate) fn new(method: &'static str, process: F) -> Self {
        Self {
            method,
            process: Arc::new(process),
            _marker: PhantomData,
        }
    }
}

impl<Req, Resp, F, Fut> CallHandler for ClientStreamingHandler<Req, Resp, F>
where
    Req: Message,
    Resp: Message,
    F: Fn(ServerContext, StreamReader<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    fn method(&self) -> &'static str {
        self.method
    }

    fn rpc_type(&self) -> RpcType {
        RpcType::ClientStreaming
    }

    fn process(&self, incoming: IncomingCall, lifecycle: Lifecycle) -> BoxFuture<'static, ()> {
        let IncomingCall { context, call, .. } = incoming;
        let reader = server_reader::<Req>(&call);
        let (method, process) = (self.method, self.process.clone());

        async move {
            let result = guarded(method, async move { (*process)(context, reader).await }).await;
            respond(call, result, lifecycle);
        }
        .boxed()
    }
}

pub(crate) struct ServerStreamingHandler<Req, Resp, F> {
    method: &'static str,
    process: Arc<F>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> ServerStreamingHandler<Req, Resp, F> {
    pub(crate) fn new(method: &'static str, process: F) -> Self {
        Self {
            method,
            process: Arc::new(process),
            _marker: PhantomData,
        }
    }
}

impl<Req, Resp, F, Fut> CallHandler for ServerStreamingHandler<Req, Resp, F>
where
    Req: Message,
    Resp: Message,
    F: Fn(ServerContext, Req, StreamWriter<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    fn method(&self) -> &'static str {
        self.method
    }

    fn rpc_type(&self) -> RpcType {
        RpcType::ServerStreaming
    }

    fn process(&self, incoming: IncomingCall, lifecycle: Lifecycle) -> BoxFuture<'static, ()> {
        let IncomingCall {
            context,
            request,
            call,
        } = incoming;
        let finishing = lifecycle.clone();
        let writer = server_writer::<Resp>(&call, lifecycle);
        let (method, process) = (self.method, self.process.clone());

        async move {
            let result = match decode_request::<Req>(request) {
                Ok(request) => {
                    let stream = writer.clone();
                    let process = async move { (*process)(context, request, stream).await };
                    guarded(method, process).await
                }
                Err(status) => Err(status),
            };
            close(&writer, result, &finishing);
        }
        .boxed()
    }
}

pub(crate) struct BidiStreamingHandler<Req, Resp, F> {
    method: &'static str,
    process: Arc<F>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> BidiStreamingHandler<Req, Resp, F> {
    pub(crate) fn new(method: &'static str, process: F) -> Self {
        Self {
            method,
            process: Arc::new(process),
            _marker: PhantomData,
        }
    }
}

impl<Req, Resp, F, Fut> CallHandler for BidiStreamingHandler<Req, Resp, F>
where
    Req: Message,
    Resp: Message,
    F: Fn(ServerContext, StreamReader<Req>, StreamWriter<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    fn method(&self) -> &'static str {
        self.method
    }

    fn rpc_type(&self) -> RpcType {
        RpcType::BidiStreaming
    }

    fn process(&self, incoming: IncomingCall, lifecycle: Lifecycle) -> BoxFuture<'static, ()> {
        let IncomingCall { context, call, .. } = incoming;
        let finishing = lifecycle.clone();
        let reader = server_reader::<Req>(&call);
        let writer = server_writer::<Resp>(&call, lifecycle);
        let (method, process) = (self.method, self.process.clone());

        async move {
            let stream = writer.clone();
            let result =
                guarded(method, async move { (*process)(context, reader, stream).await }).await;
            close(&writer, result, &finishing);
        }
        .boxed()
    }
}
