use std::num::NonZeroUsize;

use bon::Builder;

/// Configuration for the async server.
#[derive(Debug, Clone, Builder)]
pub struct ServerConfig {
    /// Number of completion queues, each drained by its own thread.
    /// `0` uses the available parallelism.
    #[builder(default = 1)]
    pub completion_queues: usize,

    /// Prefix for completion queue thread names; threads are named `{thread_name}-{index}`.
    #[builder(default = "rpc-server-cq".to_string())]
    pub thread_name: String,
}

impl ServerConfig {
    /// Get the number of completion queues to run.
    pub fn queue_count(&self) -> usize {
        match self.completion_queues {
            0 => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            count => count,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.queue_count(), 1);
        assert_eq!(config.thread_name, "rpc-server-cq");
    }

    #[test]
    fn test_zero_queues_uses_parallelism() {
        let config = ServerConfig::builder().completion_queues(0).build();
        assert!(config.queue_count() >= 1);
    }
}
