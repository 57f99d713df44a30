//! Adapters binding the typed stream engines to transport calls.
//!
//! Messages are prost-encoded on the way out. On the way in, a read lands raw bytes first and a
//! chained notification decodes them before completing the engine's tag; a payload that fails to
//! decode aborts the call with `Internal` and ends the read.

use std::sync::Arc;

use tonic::Status;
use tracing::warn;

use super::{MessageSink, MessageSource, Slot, WriteOptions, slot, take_slot};
use crate::completion::{Tag, notify};
use crate::method::{Message, decode, encode};
use crate::transport::{CallOutcome, ClientCall, ServerCall};

fn decoding<M: Message>(
    target: Slot<M>,
    tag: Tag,
    on_error: impl FnOnce(Status) + Send + 'static,
) -> (Slot<bytes::Bytes>, Tag) {
    let raw = slot();
    let landed = raw.clone();
    let chained = notify(move |ok| {
        let payload = if ok { take_slot(&landed) } else { None };
        let message = match payload.map(decode::<M>) {
            Some(Ok(message)) => Some(message),
            Some(Err(error)) => {
                warn!(%error, "Dropping undecodable stream message");
                on_error(Status::internal(format!("failed to decode message: {error}")));
                None
            }
            None => None,
        };

        let ok = message.is_some();
        *target.lock().expect("slot lock poisoned") = message;
        tag.complete(ok);
    });
    (raw, chained)
}

/// How a client closes its request stream.
pub(crate) enum ClientClose {
    /// Client-streaming: finishing the stream waits for the status and single response.
    Finish(Slot<CallOutcome>),
    /// Bidi: finishing only half-closes; the status is collected once reads end.
    WritesDone,
}

pub(crate) struct ClientSink {
    call: Arc<dyn ClientCall>,
    close: ClientClose,
}

impl ClientSink {
    pub(crate) fn new(call: Arc<dyn ClientCall>, close: ClientClose) -> Self {
        Self { call, close }
    }
}

impl<M: Message> MessageSink<M> for ClientSink {
    fn start_write(&self, message: M, options: WriteOptions, tag: Tag) {
        self.call.write(encode(&message), options, tag);
    }

    fn start_finish(&self, _status: Status, tag: Tag) {
        match &self.close {
            ClientClose::Finish(outcome) => self.call.finish(outcome.clone(), tag),
            ClientClose::WritesDone => self.call.writes_done(tag),
        }
    }
}

pub(crate) struct ClientSource {
    call: Arc<dyn ClientCall>,
}

impl ClientSource {
    pub(crate) fn new(call: Arc<dyn ClientCall>) -> Self {
        Self { call }
    }
}

impl<M: Message> MessageSource<M> for ClientSource {
    fn start_read(&self, slot: Slot<M>, tag: Tag) {
        let call = self.call.clone();
        let (raw, tag) = decoding(slot, tag, move |status| call.cancel_with(status));
        self.call.read(raw, tag);
    }
}

pub(crate) struct ServerSink {
    call: Arc<dyn ServerCall>,
}

impl ServerSink {
    pub(crate) fn new(call: Arc<dyn ServerCall>) -> Self {
        Self { call }
    }
}

impl<M: Message> MessageSink<M> for ServerSink {
    fn start_write(&self, message: M, options: WriteOptions, tag: Tag) {
        self.call.write(encode(&message), options, tag);
    }

    fn start_finish(&self, status: Status, tag: Tag) {
        self.call.finish(None, status, tag);
    }
}

pub(crate) struct ServerSource {
    call: Arc<dyn ServerCall>,
}

impl ServerSource {
    pub(crate) fn new(call: Arc<dyn ServerCall>) -> Self {
        Self { call }
    }
}

impl<M: Message> MessageSource<M> for ServerSource {
    fn start_read(&self, slot: Slot<M>, tag: Tag) {
        let call = self.call.clone();
        let (raw, tag) = decoding(slot, tag, move |status| call.cancel_with(status));
        self.call.read(raw, tag);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Note {
        #[prost(string, tag = "1")]
        text: String,
    }

    #[test]
    fn test_decoding_delivers_message() {
        let target = slot::<Note>();
        let completed = Arc::new(Mutex::new(None));
        let seen = completed.clone();
        let (raw, tag) = decoding(
            target.clone(),
            notify(move |ok| *seen.lock().unwrap() = Some(ok)),
            |_| panic!("decode should succeed"),
        );

        *raw.lock().unwrap() = Some(encode(&Note {
            text: "hi".to_string(),
        }));
        tag.complete(true);

        assert_eq!(*completed.lock().unwrap(), Some(true));
        assert_eq!(take_slot(&target).unwrap().text, "hi");
    }

    #[test]
    fn test_decoding_failure_aborts() {
        let target = slot::<Note>();
        let completed = Arc::new(Mutex::new(None));
        let aborted = Arc::new(Mutex::new(None));
        let (seen, status_seen) = (completed.clone(), aborted.clone());
        let (raw, tag) = decoding(
            target.clone(),
            notify(move |ok| *seen.lock().unwrap() = Some(ok)),
            move |status| *status_seen.lock().unwrap() = Some(status.code()),
        );

        *raw.lock().unwrap() = Some(Bytes::from_static(&[0xff, 0xff, 0xff]));
        tag.complete(true);

        assert_eq!(*completed.lock().unwrap(), Some(false));
        assert_eq!(*aborted.lock().unwrap(), Some(tonic::Code::Internal));
        assert!(take_slot(&target).is_none());
    }
}
