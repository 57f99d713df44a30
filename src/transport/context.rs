use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tonic::metadata::MetadataMap;

use super::ServerCall;

/// Per-call options supplied by the client.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    metadata: MetadataMap,
    deadline: Option<Instant>,
}

impl ClientContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the call with `DeadlineExceeded` if it has not completed within `timeout`.
    ///
    /// A timeout too large to represent as an [`Instant`] (such as `Duration::MAX`) means no
    /// deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn or_timeout(mut self, timeout: Option<Duration>) -> Self {
        if self.deadline.is_none() {
            self.deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        }
        self
    }
}

/// What a process function knows about the call it is serving.
#[derive(Clone)]
pub struct ServerContext {
    method: &'static str,
    peer: String,
    metadata: MetadataMap,
    deadline: Option<Instant>,
    call: Arc<dyn ServerCall>,
}

impl ServerContext {
    pub fn new(
        method: &'static str,
        peer: impl Into<String>,
        metadata: MetadataMap,
        deadline: Option<Instant>,
        call: Arc<dyn ServerCall>,
    ) -> Self {
        Self {
            method,
            peer: peer.into(),
            metadata,
            deadline,
            call,
        }
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the client cancelled the call or its deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.call.is_cancelled()
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("method", &self.method)
            .field("peer", &self.peer)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
