//! Asynchronous RPC call engine over a completion-queue transport.
//!
//! Every transport operation is started with a completion [`Tag`](completion::Tag) and finishes
//! later, when a [`CompletionQueueWorker`](completion::CompletionQueueWorker) thread pulls the tag
//! off its [`CompletionQueue`](completion::CompletionQueue) and runs it. On top of that:
//!
//! - [`stream`] serializes writes and reads on one call into the transport's one-op-in-flight
//!   discipline, exposing [`StreamWriter`] and [`StreamReader`].
//! - [`client`] offers the unary, client-streaming, server-streaming and bidi call façades of
//!   [`AsyncClient`], resolving [`ResultHandle`]s.
//! - [`server`] runs per-method handlers behind a re-arming accept loop in [`AsyncServer`].
//! - [`transport`] defines the transport seams and an in-process [`LoopbackTransport`].

pub mod client;
pub mod completion;
pub mod error;
pub mod handle;
pub mod method;
pub mod server;
pub mod state_machine;
pub mod stream;
pub mod transport;

pub use client::{AsyncClient, ClientConfig};
pub use error::{CallError, ProtocolViolation};
pub use handle::{Promise, ResultHandle};
pub use method::{
    BidiStreaming, ClientStreaming, Message, Method, RpcType, ServerStreaming, Unary,
};
pub use server::{AsyncServer, ServerConfig, Service};
pub use stream::{StreamReader, StreamState, StreamWriter, WriteOptions};
pub use transport::{ClientContext, LoopbackTransport, ServerContext};
