//! Stream engine: one outstanding transport operation per direction.
//!
//! [`StreamWriter`] and [`StreamReader`] wrap the pure [`WriteMachine`](writer::WriteMachine) and
//! [`ReadMachine`](reader::ReadMachine). Calls made while an operation is in flight are queued
//! (writes) or rejected (reads), and protocol violations are returned synchronously.

use std::sync::{Arc, Mutex};

use tonic::Status;

use crate::completion::Tag;

pub mod reader;
pub mod wire;
pub mod writer;

pub use reader::StreamReader;
pub use writer::StreamWriter;

/// State of one stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Ready,
    InFlight,
    Finished,
}

/// Per-write flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOptions {
    last_message: bool,
    buffer_hint: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the write as the final message of the stream.
    pub fn last_message(mut self) -> Self {
        self.last_message = true;
        self
    }

    /// Allow the transport to buffer the write before sending it.
    pub fn buffer_hint(mut self) -> Self {
        self.buffer_hint = true;
        self
    }

    pub fn is_last_message(&self) -> bool {
        self.last_message
    }

    pub fn is_buffer_hint(&self) -> bool {
        self.buffer_hint
    }
}

/// Write-once landing spot a transport fills before completing an operation's tag.
pub type Slot<T> = Arc<Mutex<Option<T>>>;

pub(crate) fn slot<T>() -> Slot<T> {
    Arc::new(Mutex::new(None))
}

pub(crate) fn take_slot<T>(slot: &Slot<T>) -> Option<T> {
    slot.lock().expect("slot lock poisoned").take()
}

/// Outgoing half of a stream, as seen by the writer engine.
pub trait MessageSink<M>: Send + Sync {
    fn start_write(&self, message: M, options: WriteOptions, tag: Tag);

    /// Close the outgoing direction. Server-side sinks send `status` as the call's final status.
    fn start_finish(&self, status: Status, tag: Tag);
}

/// Incoming half of a stream, as seen by the reader engine.
pub trait MessageSource<M>: Send + Sync {
    /// Read the next message into `slot`; the tag completes `false` once the stream has ended.
    fn start_read(&self, slot: Slot<M>, tag: Tag);
}
