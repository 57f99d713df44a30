use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures::Stream;

use super::{MessageSource, StreamState, slot, take_slot};
use crate::completion::notify;
use crate::error::{CallError, ProtocolViolation};
use crate::handle::{Promise, ResultHandle};
use crate::state_machine::StateMachine;

pub enum ReadInput<M> {
    MoveNext(Promise<bool>),
    /// The read in flight completed, carrying the message when one was delivered.
    Completed { ok: bool, message: Option<M> },
}

pub enum ReadOutput {
    /// Issue a read to the transport.
    Dispatch,
    Resolve(Promise<bool>, bool),
    /// The peer closed the stream or the call died.
    Ended,
}

/// Sequencing logic for the incoming direction of a stream.
pub struct ReadMachine<M> {
    state: StreamState,
    in_flight: Option<Promise<bool>>,
    current: Option<M>,
    outputs: VecDeque<ReadOutput>,
}

impl<M> Default for ReadMachine<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ReadMachine<M> {
    pub fn new() -> Self {
        Self {
            state: StreamState::Ready,
            in_flight: None,
            current: None,
            outputs: VecDeque::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn current(&self) -> Option<&M> {
        self.current.as_ref()
    }

    pub fn take_current(&mut self) -> Option<M> {
        self.current.take()
    }

    pub fn check_move_next(&self) -> Result<(), ProtocolViolation> {
        match self.state {
            StreamState::Ready => Ok(()),
            StreamState::InFlight => Err(ProtocolViolation::ReadInFlight),
            StreamState::Finished => Err(ProtocolViolation::ReadAfterFinished),
        }
    }

    fn process_move_next(&mut self, promise: Promise<bool>) {
        if self.check_move_next().is_err() {
            self.outputs.push_back(ReadOutput::Resolve(promise, false));
            return;
        }
        self.state = StreamState::InFlight;
        self.in_flight = Some(promise);
        self.outputs.push_back(ReadOutput::Dispatch);
    }

    fn process_completed(&mut self, ok: bool, message: Option<M>) {
        let Some(promise) = self.in_flight.take() else {
            return;
        };

        match message.filter(|_| ok) {
            Some(message) => {
                self.current = Some(message);
                self.state = StreamState::Ready;
                self.outputs.push_back(ReadOutput::Resolve(promise, true));
            }
            None => {
                self.state = StreamState::Finished;
                self.outputs.push_back(ReadOutput::Ended);
                self.outputs.push_back(ReadOutput::Resolve(promise, false));
            }
        }
    }
}

impl<M> StateMachine for ReadMachine<M> {
    type Input = ReadInput<M>;
    type Output = ReadOutput;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            ReadInput::MoveNext(promise) => self.process_move_next(promise),
            ReadInput::Completed { ok, message } => self.process_completed(ok, message),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.outputs.pop_front()
    }
}

type EndCallback = Box<dyn FnOnce() + Send>;

struct ReaderInner<M> {
    machine: Mutex<ReadMachine<M>>,
    source: Arc<dyn MessageSource<M>>,
    on_end: Mutex<Option<EndCallback>>,
    on_abandoned: Mutex<Option<EndCallback>>,
}

impl<M> Drop for ReaderInner<M> {
    fn drop(&mut self) {
        let finished = self
            .machine
            .get_mut()
            .map_or(true, |machine| machine.state() == StreamState::Finished);
        if finished {
            return;
        }
        if let Some(callback) = self.on_abandoned.get_mut().ok().and_then(Option::take) {
            callback();
        }
    }
}

impl<M: Send + 'static> ReaderInner<M> {
    fn submit(self: &Arc<Self>, input: ReadInput<M>) -> Result<(), ProtocolViolation> {
        let outputs = {
            let mut machine = self.machine.lock().expect("read machine lock poisoned");
            if let ReadInput::MoveNext(_) = &input {
                machine.check_move_next()?;
            }
            machine.process_input(input);
            std::iter::from_fn(|| machine.poll_output()).collect::<Vec<_>>()
        };

        for output in outputs {
            match output {
                ReadOutput::Dispatch => self.dispatch(),
                ReadOutput::Resolve(promise, more) => promise.resolve(Ok(more)),
                ReadOutput::Ended => {
                    let callback = self.on_end.lock().expect("end callback lock poisoned").take();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>) {
        let message = slot();
        let inner = self.clone();
        let landed = message.clone();
        let tag = notify(move |ok| {
            let message = take_slot(&landed);
            let _ = inner.submit(ReadInput::Completed { ok, message });
        });
        self.source.start_read(message, tag);
    }
}

/// Incoming message stream of a call.
///
/// Drive it with [`move_next`](StreamReader::move_next) and inspect
/// [`current`](StreamReader::current), or consume it as a [`Stream`] via
/// [`into_stream`](StreamReader::into_stream).
pub struct StreamReader<M> {
    inner: Arc<ReaderInner<M>>,
}

impl<M> Clone for StreamReader<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for StreamReader<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let machine = self.inner.machine.lock().expect("read machine lock poisoned");
        f.debug_struct("StreamReader")
            .field("state", &machine.state())
            .field("has_current", &machine.current().is_some())
            .finish()
    }
}

impl<M: Send + 'static> StreamReader<M> {
    pub(crate) fn new(source: Arc<dyn MessageSource<M>>) -> Self {
        Self {
            inner: Arc::new(ReaderInner {
                machine: Mutex::new(ReadMachine::new()),
                source,
                on_end: Mutex::new(None),
                on_abandoned: Mutex::new(None),
            }),
        }
    }

    /// Run `callback` once the stream ends.
    pub(crate) fn on_end(self, callback: impl FnOnce() + Send + 'static) -> Self {
        *self.inner.on_end.lock().expect("end callback lock poisoned") = Some(Box::new(callback));
        self
    }

    /// Run `callback` if the last handle is dropped before the stream ended.
    pub(crate) fn on_abandoned(self, callback: impl FnOnce() + Send + 'static) -> Self {
        *self
            .inner
            .on_abandoned
            .lock()
            .expect("abandon callback lock poisoned") = Some(Box::new(callback));
        self
    }

    /// Read the next message. The handle resolves `true` when a message is available through
    /// [`current`](StreamReader::current), `false` once the stream ended.
    pub fn move_next(&self) -> Result<ResultHandle<bool>, ProtocolViolation> {
        let (promise, handle) = Promise::channel();
        self.inner.submit(ReadInput::MoveNext(promise))?;
        Ok(handle)
    }

    /// Like [`move_next`](StreamReader::move_next), delivering the outcome to `callback` on the
    /// completion thread.
    pub fn move_next_with<F>(&self, callback: F) -> Result<(), ProtocolViolation>
    where
        F: FnOnce(Result<bool, CallError>) + Send + 'static,
    {
        self.inner
            .submit(ReadInput::MoveNext(Promise::callback(callback)))
    }

    /// The most recently read message.
    pub fn current(&self) -> Option<M>
    where
        M: Clone,
    {
        self.inner
            .machine
            .lock()
            .expect("read machine lock poisoned")
            .current()
            .cloned()
    }

    pub fn take_current(&self) -> Option<M> {
        self.inner
            .machine
            .lock()
            .expect("read machine lock poisoned")
            .take_current()
    }

    pub fn state(&self) -> StreamState {
        self.inner
            .machine
            .lock()
            .expect("read machine lock poisoned")
            .state()
    }

    /// Consume the reader as a stream of messages.
    pub fn into_stream(self) -> impl Stream<Item = Result<M, CallError>> + Send {
        async_stream::try_stream! {
            while self.move_next()?.await? {
                if let Some(message) = self.take_current() {
                    yield message;
                }
            }
        }
    }
}
