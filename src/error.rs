//! Error kinds surfaced at the crate's public boundaries.
//!
//! Library code uses `thiserror` enums so callers can match on kind; the demo
//! binary (src/bin/acornq_demo.rs) collapses everything into `anyhow`.

use thiserror::Error;

/// Errors from a Broker call against the remote store.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Network/timeout/protocol error talking to the store. Per the error-handling
    /// design, this aborts the current batch; it is never silently dropped.
    #[error("store I/O error: {0}")]
    Io(#[from] redis::RedisError),

    /// A task's JSON document failed to deserialize. The caller skips just this
    /// task rather than failing the whole pick.
    #[error("task JSON decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors from `Client::enqueue`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("task type is empty")]
    EmptyTaskType,

    #[error("queue name must contain one or more characters")]
    EmptyQueueName,

    #[error("unique TTL cannot be less than 1s")]
    UniqueTtlTooShort,

    #[error("task already exists")]
    DuplicateTask,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Fatal misconfiguration detected at `Server`/`Config` construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("task handler is empty")]
    EmptyHandler,

    #[error("concurrency must be greater than zero")]
    InvalidConcurrency,

    #[error("no queues configured")]
    NoQueues,
}
