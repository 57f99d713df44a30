//! Server side: per-method handlers accepting calls on one or more completion queues.
//!
//! Handlers are registered per [`Method`] with an async process function. Once started, every
//! handler keeps one listener armed on every completion queue; each accepted call is processed on
//! the tokio runtime while a fresh listener takes its place.
//!
//! # Example
//!
//! ```ignore
//! let server = AsyncServer::new(transport.clone(), ServerConfig::default())?;
//! server.register_unary(&SAY_HELLO, |_context, request: HelloRequest| async move {
//!     Ok(HelloReply { message: format!("Hello {}", request.name) })
//! })?;
//! server.start()?;
//! // ...
//! server.stop();
//! ```

mod config;
mod error;
mod handler;
mod registry;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use impl_trait_for_tuples::impl_for_tuples;
use tokio::runtime::{Handle, Runtime};
use tonic::Status;
use tracing::{debug, info};

pub use config::ServerConfig;
pub use error::ServerError;
pub use registry::{HandlerId, HandlerPhase};

use self::handler::{
    BidiStreamingHandler, CallHandler, ClientStreamingHandler, QueueContext, ServerStreamingHandler,
    UnaryHandler, listen,
};
use self::registry::HandlerRegistry;
use crate::completion::CompletionQueueWorker;
use crate::method::{BidiStreaming, ClientStreaming, Message, Method, ServerStreaming, Unary};
use crate::stream::{StreamReader, StreamWriter};
use crate::transport::{ServerContext, ServerTransport};

enum ServerState {
    Idle,
    Running {
        workers: Vec<Arc<CompletionQueueWorker>>,
        contexts: Vec<Arc<QueueContext>>,
    },
    Stopped,
}

/// Accepts calls from a [`ServerTransport`] and dispatches them to registered handlers.
pub struct AsyncServer {
    transport: Arc<dyn ServerTransport>,
    config: ServerConfig,
    handlers: Mutex<Vec<Arc<dyn CallHandler>>>,
    registry: Arc<HandlerRegistry>,
    state: Mutex<ServerState>,
    runtime: Handle,
    owned_runtime: Mutex<Option<Runtime>>,
}

impl fmt::Debug for AsyncServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncServer")
            .field("config", &self.config)
            .field("live_handlers", &self.registry.len())
            .finish()
    }
}

impl AsyncServer {
    /// Create a server over `transport`.
    ///
    /// Process functions run on the ambient tokio runtime when there is one, otherwise on a
    /// runtime owned by the server.
    pub fn new(
        transport: Arc<dyn ServerTransport>,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        let (runtime, owned_runtime) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .thread_name(format!("{}-handlers", config.thread_name))
                    .enable_all()
                    .build()
                    .map_err(ServerError::Runtime)?;
                (runtime.handle().clone(), Some(runtime))
            }
        };

        Ok(Self {
            transport,
            config,
            handlers: Mutex::new(Vec::new()),
            registry: Arc::new(HandlerRegistry::new()),
            state: Mutex::new(ServerState::Idle),
            runtime,
            owned_runtime: Mutex::new(owned_runtime),
        })
    }

    /// Register a unary handler.
    pub fn register_unary<Req, Resp, F, Fut>(
        &self,
        method: &Method<Req, Resp, Unary>,
        process: F,
    ) -> Result<(), ServerError>
    where
        Req: Message,
        Resp: Message,
        F: Fn(ServerContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.register(Arc::new(UnaryHandler::<Req, Resp, F>::new(
            method.path(),
            process,
        )))
    }

    /// Register a client-streaming handler. The process function reads every request from the
    /// reader and returns the single response.
    pub fn register_client_streaming<Req, Resp, F, Fut>(
        &self,
        method: &Method<Req, Resp, ClientStreaming>,
        process: F,
    ) -> Result<(), ServerError>
    where
        Req: Message,
        Resp: Message,
        F: Fn(ServerContext, StreamReader<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.register(Arc::new(ClientStreamingHandler::<Req, Resp, F>::new(
            method.path(),
            process,
        )))
    }

    /// Register a server-streaming handler. The stream is finished with the returned status once
    /// the process function completes, unless it already finished it.
    pub fn register_server_streaming<Req, Resp, F, Fut>(
        &self,
        method: &Method<Req, Resp, ServerStreaming>,
        process: F,
    ) -> Result<(), ServerError>
    where
        Req: Message,
        Resp: Message,
        F: Fn(ServerContext, Req, StreamWriter<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.register(Arc::new(ServerStreamingHandler::<Req, Resp, F>::new(
            method.path(),
            process,
        )))
    }

    /// Register a bidirectional streaming handler.
    pub fn register_bidi_streaming<Req, Resp, F, Fut>(
        &self,
        method: &Method<Req, Resp, BidiStreaming>,
        process: F,
    ) -> Result<(), ServerError>
    where
        Req: Message,
        Resp: Message,
        F: Fn(ServerContext, StreamReader<Req>, StreamWriter<Resp>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.register(Arc::new(BidiStreamingHandler::<Req, Resp, F>::new(
            method.path(),
            process,
        )))
    }

    /// Register every handler of `services`.
    pub fn add_services<S: Service>(&self, services: S) -> Result<(), ServerError> {
        services.register(self)
    }

    fn register(&self, handler: Arc<dyn CallHandler>) -> Result<(), ServerError> {
        if matches!(
            *self.state.lock().expect("server state lock poisoned"),
            ServerState::Stopped
        ) {
            return Err(ServerError::Stopped);
        }
        self.transport
            .register_method(handler.method(), handler.rpc_type());

        // Lock order: state, then handlers.
        let contexts = {
            let state = self.state.lock().expect("server state lock poisoned");
            self.handlers
                .lock()
                .expect("handlers lock poisoned")
                .push(handler.clone());
            match &*state {
                ServerState::Stopped => return Err(ServerError::Stopped),
                ServerState::Idle => Vec::new(),
                ServerState::Running { contexts, .. } => contexts.clone(),
            }
        };
        info!(
            method = handler.method(),
            rpc_type = %handler.rpc_type(),
            "Registered RPC handler"
        );

        // Registered on a running server: arm it right away.
        for context in contexts {
            listen(handler.clone(), context);
        }
        Ok(())
    }

    /// Spawn the completion queue threads and arm one listener per handler on each queue.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut state = self.state.lock().expect("server state lock poisoned");
        match *state {
            ServerState::Running { .. } => return Err(ServerError::AlreadyStarted),
            ServerState::Stopped => return Err(ServerError::Stopped),
            ServerState::Idle => {}
        }

        let count = self.config.queue_count();
        let mut workers: Vec<Arc<CompletionQueueWorker>> = Vec::with_capacity(count);
        let mut contexts = Vec::with_capacity(count);
        for index in 0..count {
            let name = format!("{}-{index}", self.config.thread_name);
            let worker = CompletionQueueWorker::new(name);
            if let Err(error) = worker.start() {
                for started in &workers {
                    started.shutdown();
                    started.join();
                }
                return Err(ServerError::Spawn(error));
            }
            contexts.push(Arc::new(QueueContext {
                index,
                queue: worker.queue().clone(),
                transport: self.transport.clone(),
                registry: self.registry.clone(),
                runtime: self.runtime.clone(),
            }));
            workers.push(worker);
        }

        *state = ServerState::Running {
            workers,
            contexts: contexts.clone(),
        };
        let handlers = self.handlers.lock().expect("handlers lock poisoned").clone();
        drop(state);

        for context in &contexts {
            for handler in &handlers {
                listen(handler.clone(), context.clone());
            }
        }
        info!(queues = count, handlers = handlers.len(), "Server started");
        Ok(())
    }

    /// Shut down the transport, drain and join every completion queue thread, then release all
    /// remaining handler instances. Idempotent.
    pub fn stop(&self) {
        let previous = std::mem::replace(
            &mut *self.state.lock().expect("server state lock poisoned"),
            ServerState::Stopped,
        );
        let workers = match previous {
            ServerState::Stopped => return,
            ServerState::Idle => Vec::new(),
            ServerState::Running { workers, .. } => workers,
        };

        self.transport.shutdown();
        for worker in &workers {
            worker.shutdown();
        }
        for worker in &workers {
            worker.join();
        }
        let released = self.registry.teardown();
        debug!(released, "Handler registry torn down");

        if let Some(runtime) = self
            .owned_runtime
            .lock()
            .expect("runtime lock poisoned")
            .take()
        {
            runtime.shutdown_background();
        }
        info!(queues = workers.len(), "Server stopped");
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.state.lock().expect("server state lock poisoned"),
            ServerState::Running { .. }
        )
    }

    /// Handler instances currently tracked, across all phases.
    pub fn live_handlers(&self) -> usize {
        self.registry.len()
    }

    pub fn handlers_in(&self, phase: HandlerPhase) -> usize {
        self.registry.count_in(phase)
    }
}

impl Drop for AsyncServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A group of handlers registered together, e.g. everything one service definition offers.
///
/// Tuples of services are services too, so `server.add_services((greeter, route_guide))` works.
pub trait Service {
    fn register(&self, server: &AsyncServer) -> Result<(), ServerError>;
}

#[impl_for_tuples(1, 12)]
impl Service for Tuple {
    fn register(&self, server: &AsyncServer) -> Result<(), ServerError> {
        for_tuples!( #( Tuple.register(server)?; )* );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct Ping {
        #[prost(uint32, tag = "1")]
        seq: u32,
    }

    const PING: Method<Ping, Ping, Unary> = Method::new("test.Pinger/Ping");

    struct Pinger;

    impl Service for Pinger {
        fn register(&self, server: &AsyncServer) -> Result<(), ServerError> {
            server.register_unary(&PING, |_context, ping: Ping| async move { Ok(ping) })
        }
    }

    fn server(queues: usize) -> AsyncServer {
        let config = ServerConfig::builder().completion_queues(queues).build();
        AsyncServer::new(LoopbackTransport::new(), config).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_arms_listener_per_queue() {
        let server = server(3);
        server.add_services((Pinger,)).unwrap();
        server.start().unwrap();

        assert!(server.is_running());
        assert_eq!(server.handlers_in(HandlerPhase::Listening), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_twice_fails() {
        let server = server(1);
        server.start().unwrap();
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_register_while_running_arms_immediately() {
        let server = server(2);
        server.start().unwrap();
        assert_eq!(server.live_handlers(), 0);

        server.add_services(Pinger).unwrap();
        assert_eq!(server.handlers_in(HandlerPhase::Listening), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_is_idempotent_and_final() {
        let server = server(2);
        server.add_services(Pinger).unwrap();
        server.start().unwrap();

        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.live_handlers(), 0);
        assert!(matches!(server.start(), Err(ServerError::Stopped)));
        assert!(matches!(
            server.add_services(Pinger),
            Err(ServerError::Stopped)
        ));
    }

    #[test]
    fn test_owns_runtime_outside_tokio() {
        let server = server(1);
        server.add_services(Pinger).unwrap();
        server.start().unwrap();
        server.stop();
        assert_eq!(server.live_handlers(), 0);
    }
}
