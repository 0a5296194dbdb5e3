use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on a pending episode load, fetch, or transmit, in milliseconds.
    /// Zero waits forever.
    pub request_timeout_ms: u64,

    /// Optional cap on chunk size; the transport's message limit always applies.
    pub chunk_size: Option<usize>,

    /// How many times a Host recreates a closed control channel
    pub control_reopen_limit: u32,

    /// Leading bytes of each file included in an abstract
    pub abstract_prefix_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            chunk_size: None,
            control_reopen_limit: 1,
            abstract_prefix_len: 2048,
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_control_reopen_limit(mut self, limit: u32) -> Self {
        self.control_reopen_limit = limit;
        self
    }

    pub fn with_abstract_prefix_len(mut self, len: usize) -> Self {
        self.abstract_prefix_len = len;
        self
    }
}
