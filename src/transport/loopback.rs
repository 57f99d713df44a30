//! In-process transport.
//!
//! Client and server share one [`LoopbackTransport`]: the client side uses it as a [`Channel`],
//! the server side as a [`ServerTransport`]. It follows the completion semantics of a real
//! completion-queue transport: calls wait for an armed listener, unknown methods fail with
//! `Unimplemented`, shutdown aborts listeners and fails live calls with `Unavailable`, and calls
//! started after shutdown never reach the wire.
//!
//! A call with a deadline gets a tokio timer that fails it with `DeadlineExceeded`, so parked
//! reads, finishes and unmatched calls complete on time. Without a runtime to run timers on,
//! deadlines are only checked when the next operation touches the call.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use ahash::RandomState;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::{
    CallOutcome, Channel, ClientCall, ClientContext, IncomingCall, ServerCall, ServerContext,
    ServerTransport,
};
use crate::completion::{CompletionQueue, Tag};
use crate::method::RpcType;
use crate::stream::{Slot, WriteOptions};

struct Delivery {
    queue: Arc<CompletionQueue>,
    tag: Tag,
    ok: bool,
}

fn post_all(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        delivery.queue.post(delivery.tag, delivery.ok);
    }
}

/// An operation waiting for its data.
struct Parked<T> {
    queue: Arc<CompletionQueue>,
    slot: Slot<T>,
    tag: Tag,
}

impl<T> Parked<T> {
    fn fill(self, value: T) -> Delivery {
        *self.slot.lock().expect("slot lock poisoned") = Some(value);
        Delivery {
            queue: self.queue,
            tag: self.tag,
            ok: true,
        }
    }

    fn fail(self) -> Delivery {
        Delivery {
            queue: self.queue,
            tag: self.tag,
            ok: false,
        }
    }
}

#[derive(Default)]
struct MethodEntry {
    listeners: VecDeque<Parked<IncomingCall>>,
    unmatched: VecDeque<Arc<CallCore>>,
}

impl MethodEntry {
    /// Next queued call that is still alive. Calls that died while waiting are skipped.
    fn next_unmatched(&mut self) -> Option<Arc<CallCore>> {
        while let Some(core) = self.unmatched.pop_front() {
            if core.lock().status.is_none() {
                return Some(core);
            }
            trace!(call_id = %core.id, "Skipping dead unmatched call");
        }
        None
    }
}

struct Shared {
    // Entries hold tags, which are not `Sync`.
    methods: DashMap<&'static str, Mutex<MethodEntry>, RandomState>,
    calls: DashMap<Uuid, Weak<CallCore>, RandomState>,
    shutdown: AtomicBool,
    runtime: Option<Handle>,
}

fn entry_lock(entry: &Mutex<MethodEntry>) -> MutexGuard<'_, MethodEntry> {
    entry.lock().expect("loopback method lock poisoned")
}

#[derive(Default)]
struct CallState {
    /// The call never reached the wire.
    broken: bool,
    requests: VecDeque<Bytes>,
    requests_closed: bool,
    responses: VecDeque<Bytes>,
    status: Option<Status>,
    cancelled: bool,
    server_read: Option<Parked<Bytes>>,
    client_read: Option<Parked<Bytes>>,
    client_finish: Option<Parked<CallOutcome>>,
    deadline_timer: Option<AbortHandle>,
}

impl CallState {
    fn terminate(&mut self, status: Status) {
        if self.status.is_none() {
            self.status = Some(status);
            self.cancelled = true;
            self.requests.clear();
            self.responses.clear();
        }
    }
}

struct CallCore {
    id: Uuid,
    method: &'static str,
    rpc_type: RpcType,
    metadata: MetadataMap,
    deadline: Option<Instant>,
    client_queue: Arc<CompletionQueue>,
    shared: Weak<Shared>,
    state: Mutex<CallState>,
}

impl CallCore {
    fn lock(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().expect("loopback call lock poisoned")
    }

    fn expire(&self, state: &mut CallState) {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            state.terminate(Status::deadline_exceeded("deadline exceeded"));
        }
    }

    /// Complete every parked operation that can now make progress.
    fn settle(&self, state: &mut CallState, out: &mut Vec<Delivery>) {
        if let Some(read) = state.server_read.take() {
            if let Some(message) = state.requests.pop_front() {
                out.push(read.fill(message));
            } else if state.requests_closed || state.status.is_some() {
                out.push(read.fail());
            } else {
                state.server_read = Some(read);
            }
        }

        if let Some(read) = state.client_read.take() {
            if let Some(message) = state.responses.pop_front() {
                out.push(read.fill(message));
            } else if state.status.is_some() {
                out.push(read.fail());
            } else {
                state.client_read = Some(read);
            }
        }

        if let Some(status) = state.status.clone() {
            if let Some(finish) = state.client_finish.take() {
                let response = if self.rpc_type.has_single_response() {
                    state.responses.pop_front()
                } else {
                    None
                };
                out.push(finish.fill(CallOutcome { status, response }));
            }
        }
    }

    /// Fail the call once `deadline` passes, on `runtime`.
    fn arm_deadline(self: &Arc<Self>, deadline: Instant, runtime: &Handle) {
        let core = Arc::downgrade(self);
        let timer = runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            if let Some(core) = core.upgrade() {
                trace!(call_id = %core.id, method = core.method, "Loopback deadline timer fired");
                post_all(core.fail(Status::deadline_exceeded("deadline exceeded")));
            }
        });
        self.lock().deadline_timer = Some(timer.abort_handle());
    }

    fn fail(&self, status: Status) -> Vec<Delivery> {
        let mut out = Vec::new();
        let mut state = self.lock();
        state.terminate(status);
        self.settle(&mut state, &mut out);
        out
    }

    fn accept(self: &Arc<Self>, listener: Parked<IncomingCall>) -> Vec<Delivery> {
        let request = if self.rpc_type.has_single_request() {
            self.lock().requests.pop_front()
        } else {
            None
        };

        let call: Arc<dyn ServerCall> = Arc::new(ServerEnd {
            core: self.clone(),
            queue: listener.queue.clone(),
        });
        let context = ServerContext::new(
            self.method,
            format!("loopback:{}", self.id),
            self.metadata.clone(),
            self.deadline,
            call.clone(),
        );
        trace!(call_id = %self.id, method = self.method, "Loopback call accepted");

        vec![listener.fill(IncomingCall {
            context,
            request,
            call,
        })]
    }
}

impl Drop for CallCore {
    fn drop(&mut self) {
        if let Some(timer) = self
            .state
            .get_mut()
            .ok()
            .and_then(|state| state.deadline_timer.take())
        {
            timer.abort();
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.calls.remove(&self.id);
        }
    }
}

/// In-process [`Channel`] and [`ServerTransport`].
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("methods", &self.shared.methods.len())
            .field("live_calls", &self.shared.calls.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl LoopbackTransport {
    /// Create a transport. Deadline timers run on the current tokio runtime, if there is one.
    pub fn new() -> Arc<Self> {
        Self::with_runtime(Handle::try_current().ok())
    }

    /// Create a transport whose deadline timers run on `runtime`.
    pub fn with_runtime(runtime: Option<Handle>) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                methods: DashMap::with_hasher(RandomState::new()),
                calls: DashMap::with_hasher(RandomState::new()),
                shutdown: AtomicBool::new(false),
                runtime,
            }),
        })
    }

    /// Calls that are started and not yet released by both sides.
    pub fn live_calls(&self) -> usize {
        self.shared.calls.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }
}

impl Channel for LoopbackTransport {
    fn prepare_call(
        &self,
        method: &'static str,
        rpc_type: RpcType,
        context: &ClientContext,
        queue: &Arc<CompletionQueue>,
    ) -> Arc<dyn ClientCall> {
        Arc::new(ClientEnd {
            core: Arc::new(CallCore {
                id: Uuid::new_v4(),
                method,
                rpc_type,
                metadata: context.metadata().clone(),
                deadline: context.deadline(),
                client_queue: queue.clone(),
                shared: Arc::downgrade(&self.shared),
                state: Mutex::new(CallState::default()),
            }),
            shared: self.shared.clone(),
        })
    }
}

impl ServerTransport for LoopbackTransport {
    fn register_method(&self, method: &'static str, rpc_type: RpcType) {
        self.shared.methods.entry(method).or_default();
        debug!(method, %rpc_type, "Loopback method registered");
    }

    fn request_call(
        &self,
        method: &'static str,
        queue: &Arc<CompletionQueue>,
        slot: Slot<IncomingCall>,
        tag: Tag,
    ) {
        let listener = Parked {
            queue: queue.clone(),
            slot,
            tag,
        };

        let matched = {
            let record = self.shared.methods.entry(method).or_default();
            let mut entry = entry_lock(&record);
            // Checked under the entry lock so shutdown's drain cannot miss this listener.
            if self.shared.shutdown.load(Ordering::SeqCst) {
                Err(listener)
            } else if let Some(core) = entry.next_unmatched() {
                Ok(Some((core, listener)))
            } else {
                entry.listeners.push_back(listener);
                Ok(None)
            }
        };

        match matched {
            Err(listener) => post_all(vec![listener.fail()]),
            Ok(Some((core, listener))) => post_all(core.accept(listener)),
            Ok(None) => {}
        }
    }

    fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut deliveries = Vec::new();
        let mut stranded = Vec::new();
        for record in self.shared.methods.iter() {
            let mut entry = entry_lock(&record);
            deliveries.extend(entry.listeners.drain(..).map(Parked::fail));
            stranded.extend(entry.unmatched.drain(..));
        }
        let aborted = deliveries.len();

        let live: Vec<_> = self
            .shared
            .calls
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        for core in stranded.iter().chain(live.iter()) {
            deliveries.extend(core.fail(Status::unavailable("server is shutting down")));
        }

        info!(
            aborted_listeners = aborted,
            failed_calls = live.len(),
            "Loopback transport shut down"
        );
        post_all(deliveries);
    }
}

struct ClientEnd {
    core: Arc<CallCore>,
    shared: Arc<Shared>,
}

impl ClientEnd {
    fn run(&self, op: impl FnOnce(&mut CallState, &mut Vec<Delivery>)) {
        let mut out = Vec::new();
        {
            let mut state = self.core.lock();
            self.core.expire(&mut state);
            op(&mut state, &mut out);
            self.core.settle(&mut state, &mut out);
        }
        post_all(out);
    }

    fn complete(&self, tag: Tag, ok: bool) -> Delivery {
        Delivery {
            queue: self.core.client_queue.clone(),
            tag,
            ok,
        }
    }

    fn parked<T>(&self, slot: Slot<T>, tag: Tag) -> Parked<T> {
        Parked {
            queue: self.core.client_queue.clone(),
            slot,
            tag,
        }
    }
}

impl ClientCall for ClientEnd {
    fn start(&self, request: Option<Bytes>, tag: Tag) {
        let core = &self.core;
        if self.shared.shutdown.load(Ordering::SeqCst) {
            core.lock().broken = true;
            debug!(method = core.method, "Loopback call started on a shut down transport");
            post_all(vec![self.complete(tag, false)]);
            return;
        }

        let expired = {
            let mut state = core.lock();
            if let Some(request) = request {
                state.requests.push_back(request);
            }
            if core.rpc_type.has_single_request() {
                state.requests_closed = true;
            }
            core.expire(&mut state);
            state.status.is_some()
        };
        self.shared.calls.insert(core.id, Arc::downgrade(core));
        if let (false, Some(deadline)) = (expired, core.deadline) {
            let runtime = Handle::try_current().ok().or_else(|| self.shared.runtime.clone());
            match runtime {
                Some(runtime) => core.arm_deadline(deadline, &runtime),
                None => debug!(call_id = %core.id, "No runtime for the deadline timer"),
            }
        }

        let mut out = Vec::new();
        if !expired {
            let matched = match self.shared.methods.get(core.method) {
                None => Err(Status::unimplemented(format!(
                    "method {} is not implemented",
                    core.method
                ))),
                Some(record) => {
                    let mut entry = entry_lock(&record);
                    if self.shared.shutdown.load(Ordering::SeqCst) {
                        Err(Status::unavailable("server is shutting down"))
                    } else if let Some(listener) = entry.listeners.pop_front() {
                        Ok(Some(listener))
                    } else {
                        entry.unmatched.push_back(core.clone());
                        Ok(None)
                    }
                }
            };

            match matched {
                Ok(Some(listener)) => out.extend(core.accept(listener)),
                Ok(None) => trace!(call_id = %core.id, "Loopback call waiting for a listener"),
                Err(status) => out.extend(core.fail(status)),
            }
        }

        out.push(self.complete(tag, true));
        post_all(out);
    }

    fn write(&self, message: Bytes, options: WriteOptions, tag: Tag) {
        self.run(|state, out| {
            let ok = !state.broken && state.status.is_none() && !state.requests_closed;
            if ok {
                state.requests.push_back(message);
                state.requests_closed |= options.is_last_message();
            }
            out.push(self.complete(tag, ok));
        });
    }

    fn writes_done(&self, tag: Tag) {
        self.run(|state, out| {
            state.requests_closed = true;
            out.push(self.complete(tag, !state.broken));
        });
    }

    fn read(&self, slot: Slot<Bytes>, tag: Tag) {
        self.run(|state, out| {
            if state.broken || state.client_read.is_some() {
                out.push(self.complete(tag, false));
            } else {
                state.client_read = Some(self.parked(slot, tag));
            }
        });
    }

    fn finish(&self, outcome: Slot<CallOutcome>, tag: Tag) {
        self.run(|state, out| {
            if state.broken || state.client_finish.is_some() {
                out.push(self.complete(tag, false));
            } else {
                state.requests_closed = true;
                state.client_finish = Some(self.parked(outcome, tag));
            }
        });
    }

    fn cancel_with(&self, status: Status) {
        debug!(call_id = %self.core.id, code = ?status.code(), "Loopback call cancelled");
        post_all(self.core.fail(status));
    }
}

struct ServerEnd {
    core: Arc<CallCore>,
    queue: Arc<CompletionQueue>,
}

impl ServerEnd {
    fn run(&self, op: impl FnOnce(&mut CallState, &mut Vec<Delivery>)) {
        let mut out = Vec::new();
        {
            let mut state = self.core.lock();
            self.core.expire(&mut state);
            op(&mut state, &mut out);
            self.core.settle(&mut state, &mut out);
        }
        post_all(out);
    }

    fn complete(&self, tag: Tag, ok: bool) -> Delivery {
        Delivery {
            queue: self.queue.clone(),
            tag,
            ok,
        }
    }
}

impl ServerCall for ServerEnd {
    fn read(&self, slot: Slot<Bytes>, tag: Tag) {
        self.run(|state, out| {
            if state.server_read.is_some() {
                out.push(self.complete(tag, false));
            } else {
                state.server_read = Some(Parked {
                    queue: self.queue.clone(),
                    slot,
                    tag,
                });
            }
        });
    }

    fn write(&self, message: Bytes, _options: WriteOptions, tag: Tag) {
        self.run(|state, out| {
            let ok = state.status.is_none();
            if ok {
                state.responses.push_back(message);
            }
            out.push(self.complete(tag, ok));
        });
    }

    fn finish(&self, response: Option<Bytes>, status: Status, tag: Tag) {
        self.run(|state, out| {
            let ok = state.status.is_none();
            if ok {
                state.responses.extend(response);
                state.status = Some(status);
            }
            out.push(self.complete(tag, ok));
        });
    }

    fn cancel_with(&self, status: Status) {
        debug!(call_id = %self.core.id, code = ?status.code(), "Loopback call aborted by server");
        post_all(self.core.fail(status));
    }

    fn is_cancelled(&self) -> bool {
        let mut state = self.core.lock();
        self.core.expire(&mut state);
        state.cancelled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tonic::Code;

    use super::*;
    use crate::completion::{NextStatus, notify};
    use crate::stream::{slot, take_slot};

    type Log = Arc<Mutex<Vec<(&'static str, bool)>>>;

    fn tag(log: &Log, name: &'static str) -> Tag {
        let log = log.clone();
        notify(move |ok| log.lock().unwrap().push((name, ok)))
    }

    fn run(queue: &CompletionQueue) {
        while let NextStatus::GotEvent(tag, ok) =
            queue.next(Some(Instant::now() + Duration::from_millis(10)))
        {
            tag.complete(ok);
        }
    }

    fn events(log: &Log) -> Vec<(&'static str, bool)> {
        std::mem::take(&mut *log.lock().unwrap())
    }

    #[test]
    fn test_unary_round_trip() {
        let transport = LoopbackTransport::new();
        let (client_q, server_q) = (CompletionQueue::new(), CompletionQueue::new());
        let log = Log::default();

        transport.register_method("test.Echo/Say", RpcType::Unary);
        let incoming = slot();
        transport.request_call("test.Echo/Say", &server_q, incoming.clone(), tag(&log, "accept"));

        let call = transport.prepare_call(
            "test.Echo/Say",
            RpcType::Unary,
            &ClientContext::new(),
            &client_q,
        );
        let outcome = slot();
        call.start(Some(Bytes::from_static(b"ping")), tag(&log, "start"));
        call.finish(outcome.clone(), tag(&log, "finish"));

        run(&server_q);
        assert_eq!(events(&log), vec![("accept", true)]);
        let accepted = take_slot(&incoming).unwrap();
        assert_eq!(accepted.request.as_deref(), Some(&b"ping"[..]));
        assert_eq!(accepted.context.method(), "test.Echo/Say");

        accepted.call.finish(
            Some(Bytes::from_static(b"pong")),
            Status::ok(""),
            tag(&log, "respond"),
        );
        run(&server_q);
        run(&client_q);
        assert_eq!(
            events(&log),
            vec![("respond", true), ("start", true), ("finish", true)]
        );

        let outcome = take_slot(&outcome).unwrap();
        assert_eq!(outcome.status.code(), Code::Ok);
        assert_eq!(outcome.response.as_deref(), Some(&b"pong"[..]));
    }

    #[test]
    fn test_unknown_method_is_unimplemented() {
        let transport = LoopbackTransport::new();
        let client_q = CompletionQueue::new();
        let log = Log::default();

        let call = transport.prepare_call(
            "test.Missing/Nope",
            RpcType::Unary,
            &ClientContext::new(),
            &client_q,
        );
        let outcome = slot();
        call.start(Some(Bytes::new()), tag(&log, "start"));
        call.finish(outcome.clone(), tag(&log, "finish"));
        run(&client_q);

        assert_eq!(events(&log), vec![("start", true), ("finish", true)]);
        assert_eq!(take_slot(&outcome).unwrap().status.code(), Code::Unimplemented);
    }

    #[test]
    fn test_call_waits_for_listener() {
        let transport = LoopbackTransport::new();
        let (client_q, server_q) = (CompletionQueue::new(), CompletionQueue::new());
        let log = Log::default();
        transport.register_method("test.Sum/Add", RpcType::ClientStreaming);

        let call = transport.prepare_call(
            "test.Sum/Add",
            RpcType::ClientStreaming,
            &ClientContext::new(),
            &client_q,
        );
        call.start(None, tag(&log, "start"));
        call.write(Bytes::from_static(b"1"), WriteOptions::new(), tag(&log, "write"));
        run(&client_q);
        assert_eq!(events(&log), vec![("start", true), ("write", true)]);

        let incoming = slot();
        transport.request_call("test.Sum/Add", &server_q, incoming.clone(), tag(&log, "accept"));
        run(&server_q);
        let accepted = take_slot(&incoming).unwrap();
        assert!(accepted.request.is_none());

        let message = slot();
        accepted.call.read(message.clone(), tag(&log, "read"));
        run(&server_q);
        assert_eq!(events(&log), vec![("accept", true), ("read", true)]);
        assert_eq!(take_slot(&message).unwrap(), Bytes::from_static(b"1"));

        // Half-close ends the server's next read.
        accepted.call.read(message.clone(), tag(&log, "read"));
        call.writes_done(tag(&log, "done"));
        run(&server_q);
        run(&client_q);
        assert_eq!(events(&log), vec![("read", false), ("done", true)]);
    }

    #[test]
    fn test_shutdown_aborts_listeners_and_new_calls() {
        let transport = LoopbackTransport::new();
        let (client_q, server_q) = (CompletionQueue::new(), CompletionQueue::new());
        let log = Log::default();
        transport.register_method("test.Echo/Say", RpcType::Unary);
        transport.request_call("test.Echo/Say", &server_q, slot(), tag(&log, "accept"));

        transport.shutdown();
        transport.shutdown();
        run(&server_q);
        assert_eq!(events(&log), vec![("accept", false)]);

        transport.request_call("test.Echo/Say", &server_q, slot(), tag(&log, "late"));
        let call = transport.prepare_call(
            "test.Echo/Say",
            RpcType::Unary,
            &ClientContext::new(),
            &client_q,
        );
        call.start(Some(Bytes::new()), tag(&log, "start"));
        call.finish(slot(), tag(&log, "finish"));
        run(&server_q);
        run(&client_q);
        assert_eq!(
            events(&log),
            vec![("late", false), ("start", false), ("finish", false)]
        );
    }

    #[test]
    fn test_shutdown_fails_live_calls() {
        let transport = LoopbackTransport::new();
        let client_q = CompletionQueue::new();
        let log = Log::default();
        transport.register_method("test.Echo/Say", RpcType::Unary);

        let call = transport.prepare_call(
            "test.Echo/Say",
            RpcType::Unary,
            &ClientContext::new(),
            &client_q,
        );
        let outcome = slot();
        call.start(Some(Bytes::new()), tag(&log, "start"));
        call.finish(outcome.clone(), tag(&log, "finish"));
        assert_eq!(transport.live_calls(), 1);

        transport.shutdown();
        run(&client_q);
        assert_eq!(events(&log), vec![("start", true), ("finish", true)]);
        assert_eq!(take_slot(&outcome).unwrap().status.code(), Code::Unavailable);
    }

    #[test]
    fn test_expired_deadline() {
        let transport = LoopbackTransport::new();
        let client_q = CompletionQueue::new();
        let log = Log::default();
        transport.register_method("test.Echo/Say", RpcType::Unary);

        let context = ClientContext::new().with_deadline(Instant::now());
        let call = transport.prepare_call("test.Echo/Say", RpcType::Unary, &context, &client_q);
        let outcome = slot();
        call.start(Some(Bytes::new()), tag(&log, "start"));
        call.finish(outcome.clone(), tag(&log, "finish"));
        run(&client_q);

        assert_eq!(
            take_slot(&outcome).unwrap().status.code(),
            Code::DeadlineExceeded
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deadline_fails_waiting_call() {
        let transport = LoopbackTransport::new();
        let (client_q, server_q) = (CompletionQueue::new(), CompletionQueue::new());
        let log = Log::default();
        transport.register_method("test.Echo/Say", RpcType::Unary);

        let context = ClientContext::new().with_timeout(Duration::from_millis(30));
        let call = transport.prepare_call("test.Echo/Say", RpcType::Unary, &context, &client_q);
        let outcome = slot();
        call.start(Some(Bytes::new()), tag(&log, "start"));
        call.finish(outcome.clone(), tag(&log, "finish"));

        // Nothing touches the call again; the timer alone completes the finish.
        tokio::time::sleep(Duration::from_millis(150)).await;
        run(&client_q);
        assert_eq!(events(&log), vec![("start", true), ("finish", true)]);
        assert_eq!(
            take_slot(&outcome).unwrap().status.code(),
            Code::DeadlineExceeded
        );

        // The expired call is never handed to a listener.
        transport.request_call("test.Echo/Say", &server_q, slot(), tag(&log, "accept"));
        run(&server_q);
        assert!(events(&log).is_empty());
    }

    #[test]
    fn test_timeout_overflow_means_no_deadline() {
        let transport = LoopbackTransport::new();
        let client_q = CompletionQueue::new();
        let log = Log::default();
        transport.register_method("test.Echo/Say", RpcType::Unary);

        let context = ClientContext::new().with_timeout(Duration::MAX);
        assert!(context.deadline().is_none());
        let call = transport.prepare_call("test.Echo/Say", RpcType::Unary, &context, &client_q);
        call.start(Some(Bytes::new()), tag(&log, "start"));
        run(&client_q);
        assert_eq!(events(&log), vec![("start", true)]);
    }

    #[test]
    fn test_client_cancel_ends_server_read() {
        let transport = LoopbackTransport::new();
        let (client_q, server_q) = (CompletionQueue::new(), CompletionQueue::new());
        let log = Log::default();
        transport.register_method("test.Chat/Talk", RpcType::BidiStreaming);
        let incoming = slot();
        transport.request_call("test.Chat/Talk", &server_q, incoming.clone(), tag(&log, "accept"));

        let call = transport.prepare_call(
            "test.Chat/Talk",
            RpcType::BidiStreaming,
            &ClientContext::new(),
            &client_q,
        );
        call.start(None, tag(&log, "start"));
        run(&server_q);
        let accepted = take_slot(&incoming).unwrap();
        accepted.call.read(slot(), tag(&log, "read"));

        call.cancel();
        run(&server_q);
        assert_eq!(events(&log), vec![("accept", true), ("read", false)]);
        assert!(accepted.context.is_cancelled());
        run(&client_q);
    }
}
