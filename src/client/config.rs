use std::time::Duration;

use bon::Builder;

/// Configuration for the async client.
#[derive(Debug, Clone, Builder)]
pub struct ClientConfig {
    /// Name of the completion queue thread.
    #[builder(default = "rpc-client-cq".to_string())]
    pub thread_name: String,

    /// Deadline applied to calls whose context does not set one.
    pub default_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
