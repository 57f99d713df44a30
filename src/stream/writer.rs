use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tonic::Status;
use tracing::{debug, trace};

use super::{MessageSink, StreamState, WriteOptions};
use crate::completion::notify;
use crate::error::ProtocolViolation;
use crate::handle::{Promise, ResultHandle};
use crate::state_machine::StateMachine;

/// A transport operation the writer wants issued.
#[derive(Debug)]
pub enum WireOp<M> {
    Write { message: M, options: WriteOptions },
    Finish { status: Status },
}

pub enum WriteInput<M> {
    Write {
        message: M,
        options: WriteOptions,
        promise: Promise<bool>,
    },
    Finish {
        status: Status,
        promise: Promise<()>,
    },
    /// The operation in flight completed.
    Completed { ok: bool },
}

pub enum WriteOutput<M> {
    Dispatch(WireOp<M>),
    ResolveWrite(Promise<bool>, bool),
    ResolveFinish(Promise<()>),
    /// The finish operation completed; the stream is closed.
    Finished { ok: bool },
}

enum Pending<M> {
    Write {
        message: M,
        options: WriteOptions,
        promise: Promise<bool>,
    },
    Finish {
        status: Status,
        promise: Promise<()>,
    },
}

enum InFlight {
    Write(Promise<bool>),
    Finish(Vec<Promise<()>>),
}

/// Sequencing logic for the outgoing direction of a stream.
///
/// At most one operation is dispatched at a time. Requests that arrive while one is in flight go
/// to a FIFO pending queue, drained as completions arrive. Writes after a last-message write or
/// after a finish request are never queued, so every queued entry is eligible when drained.
pub struct WriteMachine<M> {
    state: StreamState,
    pending: VecDeque<Pending<M>>,
    in_flight: Option<InFlight>,
    last_message_accepted: bool,
    /// A finish was requested by the caller.
    finish_requested: bool,
    /// A finish is queued or in flight, requested or forced by a failed write.
    finishing: bool,
    outputs: VecDeque<WriteOutput<M>>,
}

impl<M> Default for WriteMachine<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> WriteMachine<M> {
    pub fn new() -> Self {
        Self {
            state: StreamState::Ready,
            pending: VecDeque::new(),
            in_flight: None,
            last_message_accepted: false,
            finish_requested: false,
            finishing: false,
            outputs: VecDeque::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn check_write(&self) -> Result<(), ProtocolViolation> {
        if self.state == StreamState::Finished {
            Err(ProtocolViolation::WriteAfterFinished)
        } else if self.last_message_accepted {
            Err(ProtocolViolation::WriteAfterLastMessage)
        } else if self.finishing {
            Err(ProtocolViolation::WriteAfterFinish)
        } else {
            Ok(())
        }
    }

    pub fn check_finish(&self) -> Result<(), ProtocolViolation> {
        if self.state != StreamState::Finished && self.finish_requested {
            Err(ProtocolViolation::DuplicateFinish)
        } else {
            Ok(())
        }
    }

    fn process_write(&mut self, message: M, options: WriteOptions, promise: Promise<bool>) {
        // Containers check before submitting; anything slipping through is refused, not queued.
        if self.check_write().is_err() {
            self.outputs
                .push_back(WriteOutput::ResolveWrite(promise, false));
            return;
        }

        self.last_message_accepted |= options.is_last_message();
        match self.state {
            StreamState::Ready => self.dispatch_write(message, options, promise),
            _ => self.pending.push_back(Pending::Write {
                message,
                options,
                promise,
            }),
        }
    }

    fn process_finish(&mut self, status: Status, promise: Promise<()>) {
        if self.state == StreamState::Finished {
            self.outputs.push_back(WriteOutput::ResolveFinish(promise));
            return;
        }
        if self.finish_requested {
            drop(promise);
            return;
        }

        self.finish_requested = true;
        if self.finishing {
            // A failed write already forced a finish; ride along with it.
            if let Some(InFlight::Finish(promises)) = &mut self.in_flight {
                promises.push(promise);
            }
            return;
        }

        self.finishing = true;
        match self.state {
            StreamState::Ready => self.dispatch_finish(status, vec![promise]),
            _ => self.pending.push_back(Pending::Finish { status, promise }),
        }
    }

    fn process_completed(&mut self, ok: bool) {
        match self.in_flight.take() {
            None => trace!("Ignoring write completion with nothing in flight"),
            Some(InFlight::Write(promise)) => {
                self.outputs
                    .push_back(WriteOutput::ResolveWrite(promise, ok));
                if ok {
                    self.state = StreamState::Ready;
                    self.drain_next();
                } else {
                    self.fail_pending();
                }
            }
            Some(InFlight::Finish(promises)) => {
                self.state = StreamState::Finished;
                self.outputs
                    .extend(promises.into_iter().map(WriteOutput::ResolveFinish));
                self.outputs.push_back(WriteOutput::Finished { ok });
            }
        }
    }

    fn drain_next(&mut self) {
        match self.pending.pop_front() {
            Some(Pending::Write {
                message,
                options,
                promise,
            }) => self.dispatch_write(message, options, promise),
            Some(Pending::Finish { status, promise }) => {
                self.dispatch_finish(status, vec![promise])
            }
            None => {}
        }
    }

    /// The call died under a write: queued writes fail and a finish is forced.
    fn fail_pending(&mut self) {
        let mut finish = None;
        for pending in self.pending.drain(..) {
            match pending {
                Pending::Write { promise, .. } => {
                    self.outputs
                        .push_back(WriteOutput::ResolveWrite(promise, false));
                }
                Pending::Finish { status, promise } => finish = Some((status, vec![promise])),
            }
        }

        let (status, promises) = finish
            .unwrap_or_else(|| (Status::cancelled("stream write failed"), Vec::new()));
        self.finishing = true;
        self.dispatch_finish(status, promises);
    }

    fn dispatch_write(&mut self, message: M, options: WriteOptions, promise: Promise<bool>) {
        self.state = StreamState::InFlight;
        self.in_flight = Some(InFlight::Write(promise));
        self.outputs
            .push_back(WriteOutput::Dispatch(WireOp::Write { message, options }));
    }

    fn dispatch_finish(&mut self, status: Status, promises: Vec<Promise<()>>) {
        self.state = StreamState::InFlight;
        self.in_flight = Some(InFlight::Finish(promises));
        self.outputs
            .push_back(WriteOutput::Dispatch(WireOp::Finish { status }));
    }
}

impl<M> StateMachine for WriteMachine<M> {
    type Input = WriteInput<M>;
    type Output = WriteOutput<M>;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            WriteInput::Write {
                message,
                options,
                promise,
            } => self.process_write(message, options, promise),
            WriteInput::Finish { status, promise } => self.process_finish(status, promise),
            WriteInput::Completed { ok } => self.process_completed(ok),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.outputs.pop_front()
    }
}

type FinishCallback = Box<dyn FnOnce(bool) + Send>;

struct WriterInner<M> {
    machine: Mutex<WriteMachine<M>>,
    sink: Arc<dyn MessageSink<M>>,
    on_finished: Mutex<Option<FinishCallback>>,
}

impl<M: Send + 'static> WriterInner<M> {
    fn submit(self: &Arc<Self>, input: WriteInput<M>) -> Result<(), ProtocolViolation> {
        let outputs = {
            let mut machine = self.machine.lock().expect("write machine lock poisoned");
            match &input {
                WriteInput::Write { .. } => machine.check_write()?,
                WriteInput::Finish { .. } => machine.check_finish()?,
                WriteInput::Completed { .. } => {}
            }
            machine.process_input(input);
            std::iter::from_fn(|| machine.poll_output()).collect::<Vec<_>>()
        };

        for output in outputs {
            self.execute(output);
        }
        Ok(())
    }

    fn complete(self: &Arc<Self>, ok: bool) {
        // Completions are never rejected.
        let _ = self.submit(WriteInput::Completed { ok });
    }

    fn execute(self: &Arc<Self>, output: WriteOutput<M>) {
        match output {
            WriteOutput::Dispatch(op) => {
                let inner = self.clone();
                let tag = notify(move |ok| inner.complete(ok));
                match op {
                    WireOp::Write { message, options } => {
                        self.sink.start_write(message, options, tag)
                    }
                    WireOp::Finish { status } => {
                        debug!(code = ?status.code(), "Finishing outgoing stream");
                        self.sink.start_finish(status, tag)
                    }
                }
            }
            WriteOutput::ResolveWrite(promise, ok) => promise.resolve(Ok(ok)),
            WriteOutput::ResolveFinish(promise) => promise.resolve(Ok(())),
            WriteOutput::Finished { ok } => {
                let callback = self
                    .on_finished
                    .lock()
                    .expect("finish callback lock poisoned")
                    .take();
                if let Some(callback) = callback {
                    callback(ok);
                }
            }
        }
    }
}

/// Outgoing message stream of a call.
///
/// Cloning yields another handle to the same stream. Writes may be issued back-to-back without
/// waiting; they reach the transport in call order.
pub struct StreamWriter<M> {
    inner: Arc<WriterInner<M>>,
}

impl<M> Clone for StreamWriter<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for StreamWriter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let machine = self.inner.machine.lock().expect("write machine lock poisoned");
        f.debug_struct("StreamWriter")
            .field("state", &machine.state())
            .field("pending", &machine.pending())
            .finish()
    }
}

impl<M: Send + 'static> StreamWriter<M> {
    pub(crate) fn new(sink: Arc<dyn MessageSink<M>>) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                machine: Mutex::new(WriteMachine::new()),
                sink,
                on_finished: Mutex::new(None),
            }),
        }
    }

    /// Run `callback` once the finish operation completes.
    pub(crate) fn on_finished(self, callback: impl FnOnce(bool) + Send + 'static) -> Self {
        *self
            .inner
            .on_finished
            .lock()
            .expect("finish callback lock poisoned") = Some(Box::new(callback));
        self
    }

    /// Write a message. The handle resolves `true` once it reached the wire, `false` if the call
    /// died first.
    pub fn write(&self, message: M) -> Result<ResultHandle<bool>, ProtocolViolation> {
        self.write_with(message, WriteOptions::default())
    }

    pub fn write_with(
        &self,
        message: M,
        options: WriteOptions,
    ) -> Result<ResultHandle<bool>, ProtocolViolation> {
        let (promise, handle) = Promise::channel();
        self.inner.submit(WriteInput::Write {
            message,
            options,
            promise,
        })?;
        Ok(handle)
    }

    /// Write a message flagged as the last one of the stream.
    pub fn write_last(&self, message: M) -> Result<ResultHandle<bool>, ProtocolViolation> {
        self.write_with(message, WriteOptions::new().last_message())
    }

    /// Close the stream. Returns an already-resolved handle if the stream is finished.
    pub fn finish(&self) -> Result<ResultHandle<()>, ProtocolViolation> {
        self.finish_with(Status::ok(""))
    }

    pub(crate) fn finish_with(
        &self,
        status: Status,
    ) -> Result<ResultHandle<()>, ProtocolViolation> {
        let (promise, handle) = Promise::channel();
        self.inner.submit(WriteInput::Finish { status, promise })?;
        Ok(handle)
    }

    /// Finish with `status` unless a finish was already requested.
    pub(crate) fn close_with(&self, status: Status) {
        let _ = self.inner.submit(WriteInput::Finish {
            status,
            promise: Promise::callback(|_| {}),
        });
    }

    pub fn state(&self) -> StreamState {
        self.inner
            .machine
            .lock()
            .expect("write machine lock poisoned")
            .state()
    }
}
