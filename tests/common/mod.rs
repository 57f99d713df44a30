#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cq_rpc::server::ServerError;
use cq_rpc::{
    AsyncClient, AsyncServer, BidiStreaming, ClientConfig, ClientStreaming, LoopbackTransport,
    Method, ServerConfig, ServerStreaming, Service, Unary,
};
use futures::StreamExt;
use tokio::sync::Notify;
use tonic::Status;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloReply {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Number {
    #[prost(int64, tag = "1")]
    pub value: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Summary {
    #[prost(uint32, tag = "1")]
    pub count: u32,
    #[prost(int64, tag = "2")]
    pub total: i64,
}

pub const SAY_HELLO: Method<HelloRequest, HelloReply, Unary> =
    Method::new("test.Greeter/SayHello");
pub const WHO_AM_I: Method<HelloRequest, HelloReply, Unary> = Method::new("test.Greeter/WhoAmI");
pub const MISSING: Method<HelloRequest, HelloReply, Unary> = Method::new("test.Greeter/Missing");
pub const SUM: Method<Number, Summary, ClientStreaming> = Method::new("test.Math/Sum");
pub const COUNT_UP: Method<Number, Number, ServerStreaming> = Method::new("test.Math/CountUp");
pub const FAIL_AFTER: Method<Number, Number, ServerStreaming> = Method::new("test.Math/FailAfter");
pub const HANG: Method<Number, Number, ServerStreaming> = Method::new("test.Math/Hang");
pub const ECHO: Method<Number, Number, BidiStreaming> = Method::new("test.Math/Echo");

pub fn hello(name: impl Into<String>) -> HelloRequest {
    HelloRequest { name: name.into() }
}

fn internal(error: impl ToString) -> Status {
    Status::internal(error.to_string())
}

/// `SayHello` reacts to a few special names: `fail`, `panic`, `slow` and `gate` (blocks until the
/// gate is opened).
pub struct Greeter {
    pub gate: Arc<Notify>,
}

impl Service for Greeter {
    fn register(&self, server: &AsyncServer) -> Result<(), ServerError> {
        let gate = self.gate.clone();
        server.register_unary(&SAY_HELLO, move |_context, request: HelloRequest| {
            let gate = gate.clone();
            async move {
                match request.name.as_str() {
                    "fail" => return Err(Status::not_found("nobody called fail")),
                    "panic" => panic!("handler blew up"),
                    "slow" => tokio::time::sleep(Duration::from_millis(300)).await,
                    "gate" => gate.notified().await,
                    _ => {}
                }
                Ok(HelloReply {
                    message: format!("Hello {}", request.name),
                })
            }
        })?;

        server.register_unary(&WHO_AM_I, |context, _request: HelloRequest| async move {
            let user = context
                .metadata()
                .get("x-user")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("anonymous")
                .to_string();
            Ok(HelloReply {
                message: format!("{user}@{}", context.peer()),
            })
        })
    }
}

pub struct Math;

impl Service for Math {
    fn register(&self, server: &AsyncServer) -> Result<(), ServerError> {
        server.register_client_streaming(&SUM, |_context, reader| async move {
            let mut summary = Summary::default();
            let mut numbers = Box::pin(reader.into_stream());
            while let Some(number) = numbers.next().await {
                summary.count += 1;
                summary.total += number.map_err(internal)?.value;
            }
            Ok(summary)
        })?;

        server.register_server_streaming(&COUNT_UP, |_context, request: Number, writer| async move {
            for value in 1..=request.value {
                writer
                    .write(Number { value })
                    .map_err(internal)?
                    .await
                    .map_err(internal)?;
            }
            Ok(())
        })?;

        server.register_server_streaming(
            &FAIL_AFTER,
            |_context, request: Number, writer| async move {
                for value in 1..=request.value {
                    writer
                        .write(Number { value })
                        .map_err(internal)?
                        .await
                        .map_err(internal)?;
                }
                Err(Status::aborted("gave up"))
            },
        )?;

        server.register_server_streaming(&HANG, |_context, _request: Number, writer| async move {
            writer
                .write(Number { value: 1 })
                .map_err(internal)?
                .await
                .map_err(internal)?;
            std::future::pending::<()>().await;
            Ok(())
        })?;

        server.register_bidi_streaming(&ECHO, |_context, reader, writer| async move {
            while reader.move_next().map_err(internal)?.await.map_err(internal)? {
                if let Some(number) = reader.take_current() {
                    writer.write(number).map_err(internal)?;
                }
            }
            Ok(())
        })
    }
}

pub struct Harness {
    pub client: AsyncClient,
    pub server: AsyncServer,
    pub transport: Arc<LoopbackTransport>,
    pub gate: Arc<Notify>,
}

/// Server and client over one loopback transport. Must run inside a tokio runtime.
pub fn harness(queues: usize) -> Harness {
    let transport = LoopbackTransport::new();
    let gate = Arc::new(Notify::new());

    let config = ServerConfig::builder().completion_queues(queues).build();
    let server = AsyncServer::new(transport.clone(), config).unwrap();
    server
        .add_services((Greeter { gate: gate.clone() }, Math))
        .unwrap();
    server.start().unwrap();

    let client = AsyncClient::new(transport.clone(), ClientConfig::default()).unwrap();
    Harness {
        client,
        server,
        transport,
        gate,
    }
}
