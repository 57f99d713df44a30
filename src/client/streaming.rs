use std::fmt;
use std::sync::Arc;

use tonic::Status;
use tracing::debug;

use super::calls::{CallId, CallTracker};
use super::unary::{UnaryCall, response_from, status_from};
use crate::completion::notify;
use crate::error::CallError;
use crate::handle::{Promise, ResultHandle};
use crate::method::{Message, RpcType, encode};
use crate::stream::wire::{ClientClose, ClientSink, ClientSource};
use crate::stream::{StreamReader, StreamWriter, slot, take_slot};
use crate::transport::ClientCall;

/// A client-streaming call: write requests, then receive one response.
pub struct ClientStreamingCall<Req, Resp> {
    writer: ResultHandle<StreamWriter<Req>>,
    response: ResultHandle<Resp>,
    call: Option<Arc<dyn ClientCall>>,
}

fn refusal<T>(rpc_type: RpcType) -> ResultHandle<T> {
    ResultHandle::ready(Err(CallError::Invocation { rpc_type }))
}

impl<Req, Resp> ClientStreamingCall<Req, Resp> {
    pub(crate) fn refused() -> Self {
        Self {
            writer: refusal(RpcType::ClientStreaming),
            response: refusal(RpcType::ClientStreaming),
            call: None,
        }
    }

    /// The writer (once the call is on the wire) and the final response.
    ///
    /// The response resolves after the writer is finished.
    pub fn into_parts(self) -> (ResultHandle<StreamWriter<Req>>, ResultHandle<Resp>) {
        (self.writer, self.response)
    }

    /// Cancel the call. A refused call has nothing to cancel.
    pub fn cancel(&self) {
        if let Some(call) = &self.call {
            call.cancel();
        }
    }
}

impl<Req, Resp> fmt::Debug for ClientStreamingCall<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStreamingCall").finish_non_exhaustive()
    }
}

/// A server-streaming call: one request, then a stream of responses.
pub struct ServerStreamingCall<Resp> {
    reader: ResultHandle<StreamReader<Resp>>,
    status: ResultHandle<()>,
    call: Option<Arc<dyn ClientCall>>,
}

impl<Resp> ServerStreamingCall<Resp> {
    pub(crate) fn refused() -> Self {
        Self {
            reader: refusal(RpcType::ServerStreaming),
            status: refusal(RpcType::ServerStreaming),
            call: None,
        }
    }

    /// The reader (once the call is on the wire) and the final status.
    ///
    /// The status resolves once the reader reached the end of the stream.
    pub fn into_parts(self) -> (ResultHandle<StreamReader<Resp>>, ResultHandle<()>) {
        (self.reader, self.status)
    }

    pub fn cancel(&self) {
        if let Some(call) = &self.call {
            call.cancel();
        }
    }
}

impl<Resp> fmt::Debug for ServerStreamingCall<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStreamingCall").finish_non_exhaustive()
    }
}

/// Both directions of an established bidi call.
pub struct BidiStream<Req, Resp> {
    writer: StreamWriter<Req>,
    reader: StreamReader<Resp>,
}

impl<Req, Resp> BidiStream<Req, Resp> {
    pub fn writer(&self) -> &StreamWriter<Req> {
        &self.writer
    }

    pub fn reader(&self) -> &StreamReader<Resp> {
        &self.reader
    }

    pub fn into_split(self) -> (StreamWriter<Req>, StreamReader<Resp>) {
        (self.writer, self.reader)
    }
}

impl<Req, Resp> fmt::Debug for BidiStream<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BidiStream")
            .field("writer", &self.writer)
            .field("reader", &self.reader)
            .finish()
    }
}

/// A bidi-streaming call.
pub struct BidiStreamingCall<Req, Resp> {
    stream: ResultHandle<BidiStream<Req, Resp>>,
    status: ResultHandle<()>,
    call: Option<Arc<dyn ClientCall>>,
}

impl<Req, Resp> BidiStreamingCall<Req, Resp> {
    pub(crate) fn refused() -> Self {
        Self {
            stream: refusal(RpcType::BidiStreaming),
            status: refusal(RpcType::BidiStreaming),
            call: None,
        }
    }

    /// The stream pair (once the call is on the wire) and the final status.
    ///
    /// Finishing the writer half-closes the request stream; the status resolves once the reader
    /// reached the end of the response stream. Dropping the reader before that cancels the call.
    pub fn into_parts(self) -> (ResultHandle<BidiStream<Req, Resp>>, ResultHandle<()>) {
        (self.stream, self.status)
    }

    pub fn cancel(&self) {
        if let Some(call) = &self.call {
            call.cancel();
        }
    }
}

impl<Req, Resp> fmt::Debug for BidiStreamingCall<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BidiStreamingCall").finish_non_exhaustive()
    }
}

/// Reader whose end-of-stream collects the call's final status. Dropping it early cancels the
/// call.
fn status_reader<Resp: Message>(
    method: &'static str,
    call: Arc<dyn ClientCall>,
    rpc_type: RpcType,
    status: Arc<UnaryCall<()>>,
    tracker: Arc<CallTracker>,
    id: CallId,
) -> StreamReader<Resp> {
    let source = Arc::new(ClientSource::new(call.clone()));
    let abandoned = {
        let (call, status, tracker) = (call.clone(), status.clone(), tracker.clone());
        move || {
            debug!(call_id = %id, method, "Stream reader dropped before the end, cancelling");
            call.cancel();
            tracker.release(&id);
            status.settle(Err(
                Status::cancelled("stream reader dropped before the end").into()
            ));
        }
    };
    StreamReader::<Resp>::new(source).on_abandoned(abandoned).on_end(move || {
        let outcome = slot();
        let landed = outcome.clone();
        call.finish(
            outcome,
            notify(move |ok| {
                tracker.release(&id);
                let result = status_from(ok, take_slot(&landed), rpc_type);
                if let Err(error) = &result {
                    debug!(call_id = %id, method, %error, "Streaming call failed");
                }
                status.settle(result);
            }),
        );
    })
}

pub(crate) fn client_streaming<Req: Message, Resp: Message>(
    method: &'static str,
    call: Arc<dyn ClientCall>,
    tracker: Arc<CallTracker>,
) -> ClientStreamingCall<Req, Resp> {
    const RPC_TYPE: RpcType = RpcType::ClientStreaming;

    let id = tracker.track(method, call.clone());
    let (writer_promise, writer) = Promise::channel();
    let (response_promise, response) = Promise::channel();
    let result = UnaryCall::new(response_promise);

    let outcome = slot();
    let sink = ClientSink::new(call.clone(), ClientClose::Finish(outcome.clone()));
    let on_start = notify(move |ok| {
        if !ok {
            tracker.release(&id);
            writer_promise.resolve(Err(CallError::Invocation { rpc_type: RPC_TYPE }));
            result.settle(Err(CallError::Invocation { rpc_type: RPC_TYPE }));
            return;
        }

        let stream = StreamWriter::<Req>::new(Arc::new(sink)).on_finished(move |ok| {
            tracker.release(&id);
            result.settle(response_from(ok, take_slot(&outcome), RPC_TYPE));
        });
        writer_promise.resolve(Ok(stream));
    });
    call.start(None, on_start);

    ClientStreamingCall {
        writer,
        response,
        call: Some(call),
    }
}

pub(crate) fn server_streaming<Req: Message, Resp: Message>(
    method: &'static str,
    call: Arc<dyn ClientCall>,
    request: &Req,
    tracker: Arc<CallTracker>,
) -> ServerStreamingCall<Resp> {
    const RPC_TYPE: RpcType = RpcType::ServerStreaming;

    let id = tracker.track(method, call.clone());
    let (reader_promise, reader) = Promise::channel();
    let (status_promise, status) = Promise::channel();
    let result = UnaryCall::new(status_promise);

    let on_start = {
        let call = call.clone();
        notify(move |ok| {
            if !ok {
                tracker.release(&id);
                reader_promise.resolve(Err(CallError::Invocation { rpc_type: RPC_TYPE }));
                result.settle(Err(CallError::Invocation { rpc_type: RPC_TYPE }));
                return;
            }
            reader_promise.resolve(Ok(status_reader::<Resp>(
                method, call, RPC_TYPE, result, tracker, id,
            )));
        })
    };
    call.start(Some(encode(request)), on_start);

    ServerStreamingCall {
        reader,
        status,
        call: Some(call),
    }
}

pub(crate) fn bidi_streaming<Req: Message, Resp: Message>(
    method: &'static str,
    call: Arc<dyn ClientCall>,
    tracker: Arc<CallTracker>,
) -> BidiStreamingCall<Req, Resp> {
    const RPC_TYPE: RpcType = RpcType::BidiStreaming;

    let id = tracker.track(method, call.clone());
    let (stream_promise, stream) = Promise::channel();
    let (status_promise, status) = Promise::channel();
    let result = UnaryCall::new(status_promise);

    let on_start = {
        let call = call.clone();
        notify(move |ok| {
            if !ok {
                tracker.release(&id);
                stream_promise.resolve(Err(CallError::Invocation { rpc_type: RPC_TYPE }));
                result.settle(Err(CallError::Invocation { rpc_type: RPC_TYPE }));
                return;
            }

            let sink = Arc::new(ClientSink::new(call.clone(), ClientClose::WritesDone));
            let writer = StreamWriter::<Req>::new(sink);
            let reader = status_reader::<Resp>(method, call, RPC_TYPE, result, tracker, id);
            stream_promise.resolve(Ok(BidiStream { writer, reader }));
        })
    };
    call.start(None, on_start);

    BidiStreamingCall {
        stream,
        status,
        call: Some(call),
    }
}
