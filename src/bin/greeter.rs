use std::time::Duration;

use anyhow::Result;
use cq_rpc::server::ServerError;
use cq_rpc::{
    AsyncClient, AsyncServer, BidiStreaming, ClientConfig, ClientStreaming, LoopbackTransport,
    Method, ServerConfig, ServerStreaming, Service, Unary,
};
use futures::StreamExt;
use rand::Rng;
use tonic::Status;
use tracing::{info, warn};

#[derive(Clone, PartialEq, ::prost::Message)]
struct HelloRequest {
    #[prost(string, tag = "1")]
    name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct HelloReply {
    #[prost(string, tag = "1")]
    message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct GreetingCount {
    #[prost(uint32, tag = "1")]
    count: u32,
}

const SAY_HELLO: Method<HelloRequest, HelloReply, Unary> =
    Method::new("helloworld.Greeter/SayHello");
const COUNT_GREETINGS: Method<HelloRequest, GreetingCount, ClientStreaming> =
    Method::new("helloworld.Greeter/CountGreetings");
const GREET_REPEATEDLY: Method<HelloRequest, HelloReply, ServerStreaming> =
    Method::new("helloworld.Greeter/GreetRepeatedly");
const CHAT: Method<HelloRequest, HelloReply, BidiStreaming> =
    Method::new("helloworld.Greeter/Chat");

const GREETINGS: usize = 3;

/// Simulated work, so calls overlap.
async fn jitter() {
    let millis = rand::rng().random_range(5..40);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

fn greet(name: &str) -> HelloReply {
    HelloReply {
        message: format!("Hello {name}"),
    }
}

struct Greeter;

impl Service for Greeter {
    fn register(&self, server: &AsyncServer) -> Result<(), ServerError> {
        server.register_unary(&SAY_HELLO, |_context, request: HelloRequest| async move {
            jitter().await;
            Ok(greet(&request.name))
        })?;

        server.register_client_streaming(&COUNT_GREETINGS, |_context, reader| async move {
            let mut count = 0;
            let mut requests = Box::pin(reader.into_stream());
            while let Some(request) = requests.next().await {
                request.map_err(|error| Status::internal(error.to_string()))?;
                count += 1;
            }
            Ok(GreetingCount { count })
        })?;

        server.register_server_streaming(
            &GREET_REPEATEDLY,
            |_context, request: HelloRequest, writer| async move {
                for _ in 0..GREETINGS {
                    jitter().await;
                    let written = writer
                        .write(greet(&request.name))
                        .map_err(|error| Status::internal(error.to_string()))?
                        .await
                        .unwrap_or(false);
                    if !written {
                        return Err(Status::cancelled("client went away"));
                    }
                }
                Ok(())
            },
        )?;

        server.register_bidi_streaming(&CHAT, |_context, reader, writer| async move {
            let mut requests = Box::pin(reader.into_stream());
            while let Some(request) = requests.next().await {
                let request = request.map_err(|error| Status::internal(error.to_string()))?;
                writer
                    .write(greet(&request.name))
                    .map_err(|error| Status::internal(error.to_string()))?
                    .await
                    .map_err(|error| Status::internal(error.to_string()))?;
            }
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let queues = std::env::var("GREETER_QUEUES")
        .ok()
        .and_then(|queues| queues.parse().ok())
        .unwrap_or(2);
    let name = std::env::var("GREETER_NAME").unwrap_or_else(|_| "user".to_string());

    let transport = LoopbackTransport::new();
    let server = AsyncServer::new(
        transport.clone(),
        ServerConfig::builder().completion_queues(queues).build(),
    )?;
    server.add_services(Greeter)?;
    server.start()?;

    let client = AsyncClient::new(transport.clone(), ClientConfig::default())?;

    let reply = client
        .unary(&SAY_HELLO, HelloRequest { name: name.clone() })
        .await?;
    info!(message = %reply.message, "Unary reply");

    let (writer, count) = client.client_streaming(&COUNT_GREETINGS).into_parts();
    let writer = writer.await?;
    for index in 0..GREETINGS {
        writer.write(HelloRequest {
            name: format!("{name}-{index}"),
        })?;
    }
    writer.finish()?.await?;
    info!(count = count.await?.count, "Client-streaming reply");

    let (reader, status) = client
        .server_streaming(&GREET_REPEATEDLY, HelloRequest { name: name.clone() })
        .into_parts();
    let mut replies = Box::pin(reader.await?.into_stream());
    while let Some(reply) = replies.next().await {
        info!(message = %reply?.message, "Server-streaming reply");
    }
    status.await?;

    let (stream, status) = client.bidi_streaming(&CHAT).into_parts();
    let (writer, reader) = stream.await?.into_split();
    for index in 0..GREETINGS {
        writer.write(HelloRequest {
            name: format!("{name}-{index}"),
        })?;
        if reader.move_next()?.await? {
            if let Some(reply) = reader.take_current() {
                info!(message = %reply.message, "Bidi reply");
            }
        }
    }
    writer.finish()?.await?;
    while reader.move_next()?.await? {
        warn!("Unexpected trailing bidi reply");
    }
    status.await?;

    client.shutdown();
    server.stop();
    info!(live_calls = transport.live_calls(), "Greeter done");
    Ok(())
}
