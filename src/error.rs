use thiserror::Error;

use crate::method::RpcType;

/// Errors surfaced through a call's [`ResultHandle`](crate::handle::ResultHandle).
#[derive(Debug, Error)]
pub enum CallError {
    /// The call never reached the wire.
    #[error(
        "the {rpc_type} RPC is not going to the wire, the channel is either permanently broken or \
         transiently broken"
    )]
    Invocation { rpc_type: RpcType },

    /// The call completed but the remote status was not `Ok`.
    #[error("call failed with status {}: {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),

    /// The calling code broke the streaming protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    /// The operation was torn down before it completed (queue shutdown).
    #[error("the operation was abandoned before it completed")]
    Abandoned,
}

impl CallError {
    /// The remote status if this error carries one.
    pub fn status(&self) -> Option<&tonic::Status> {
        match self {
            CallError::Status(status) => Some(status),
            _ => None,
        }
    }
}

/// Programming errors in calling code, rejected synchronously at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// `write` on a stream that already finished.
    #[error("attempt to write to a finished stream")]
    WriteAfterFinished,

    /// `write` after a write flagged as the last message.
    #[error("last message is already written, no more message is allowed")]
    WriteAfterLastMessage,

    /// `write` after `finish` was requested.
    #[error("attempt to write after finish")]
    WriteAfterFinish,

    /// `finish` while a previous finish is still pending.
    #[error("duplicate finish call")]
    DuplicateFinish,

    /// `move_next` while a read is in flight.
    #[error("attempt to move next while the reader is moving next")]
    ReadInFlight,

    /// `move_next` after the stream ended.
    #[error("attempt to move next after the reader is finished")]
    ReadAfterFinished,
}
