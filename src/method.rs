//! RPC shapes and typed method descriptors.
//!
//! A [`Method`] stands in for one generated stub/service entry point: it names the method path and
//! fixes the request type, response type and shape at compile time, so the client and server
//! entry points can only be used with the shape they were generated for.

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;

/// The four RPC shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

impl RpcType {
    /// Whether the client sends exactly one request message.
    pub fn has_single_request(self) -> bool {
        matches!(self, RpcType::Unary | RpcType::ServerStreaming)
    }

    /// Whether the server sends exactly one response message.
    pub fn has_single_response(self) -> bool {
        matches!(self, RpcType::Unary | RpcType::ClientStreaming)
    }
}

impl fmt::Display for RpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcType::Unary => "unary",
            RpcType::ClientStreaming => "client-streaming",
            RpcType::ServerStreaming => "server-streaming",
            RpcType::BidiStreaming => "bidi-streaming",
        };
        f.write_str(name)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Marker type naming an RPC shape.
pub trait Shape: sealed::Sealed + Send + Sync + 'static {
    const RPC_TYPE: RpcType;
}

macro_rules! shape {
    ($name:ident, $rpc_type:expr) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl Shape for $name {
            const RPC_TYPE: RpcType = $rpc_type;
        }
    };
}

shape!(Unary, RpcType::Unary);
shape!(ClientStreaming, RpcType::ClientStreaming);
shape!(ServerStreaming, RpcType::ServerStreaming);
shape!(BidiStreaming, RpcType::BidiStreaming);

/// Message types carried by calls.
pub trait Message: prost::Message + Default + Send + 'static {}

impl<T: prost::Message + Default + Send + 'static> Message for T {}

pub(crate) fn encode<M: Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

pub(crate) fn decode<M: Message>(payload: Bytes) -> Result<M, prost::DecodeError> {
    M::decode(payload)
}

/// A typed RPC method descriptor.
///
/// ```ignore
/// pub const SAY_HELLO: Method<HelloRequest, HelloReply, Unary> =
///     Method::new("helloworld.Greeter/SayHello");
/// ```
pub struct Method<Req, Resp, S> {
    path: &'static str,
    _marker: PhantomData<fn() -> (Req, Resp, S)>,
}

impl<Req, Resp, S: Shape> Method<Req, Resp, S> {
    pub const fn new(path: &'static str) -> Self {
        Self {
            path,
            _marker: PhantomData,
        }
    }

    /// Full method path, e.g. `helloworld.Greeter/SayHello`.
    pub fn path(&self) -> &'static str {
        self.path
    }

    pub fn rpc_type(&self) -> RpcType {
        S::RPC_TYPE
    }
}

impl<Req, Resp, S> Clone for Method<Req, Resp, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Resp, S> Copy for Method<Req, Resp, S> {}

impl<Req, Resp, S: Shape> fmt::Debug for Method<Req, Resp, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("path", &self.path)
            .field("rpc_type", &S::RPC_TYPE)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_message_shapes() {
        assert!(RpcType::Unary.has_single_request());
        assert!(RpcType::Unary.has_single_response());
        assert!(RpcType::ServerStreaming.has_single_request());
        assert!(!RpcType::ServerStreaming.has_single_response());
        assert!(!RpcType::ClientStreaming.has_single_request());
        assert!(RpcType::ClientStreaming.has_single_response());
        assert!(!RpcType::BidiStreaming.has_single_request());
        assert!(!RpcType::BidiStreaming.has_single_response());
    }

    #[test]
    fn test_method_descriptor() {
        const PING: Method<(), (), BidiStreaming> = Method::new("test.Pinger/Ping");
        assert_eq!(PING.path(), "test.Pinger/Ping");
        assert_eq!(PING.rpc_type(), RpcType::BidiStreaming);
    }
}
