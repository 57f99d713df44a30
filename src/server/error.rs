use thiserror::Error;

/// Errors from the server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called on a running server.
    #[error("server is already started")]
    AlreadyStarted,

    /// The server was stopped and cannot be restarted.
    #[error("server is stopped")]
    Stopped,

    /// A completion queue thread could not be spawned.
    #[error("failed to spawn completion queue thread")]
    Spawn(#[source] std::io::Error),

    /// No tokio runtime was available and one could not be built.
    #[error("failed to build the handler runtime")]
    Runtime(#[source] std::io::Error),
}
