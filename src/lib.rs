//! A distributed task queue engine backed by a Redis-compatible store.
//!
//! Every multi-key state transition runs as a single Lua script (see
//! [`scripts`]) so the queue's invariants hold even under concurrent workers and
//! partial network failure. See [`server::Server`] for the entry point that ties
//! workers, heartbeats, recovery, and archive cleanup together.

pub mod broker;
pub mod cleaner;
pub mod client;
pub mod error;
pub mod heartbeat;
pub mod keys;
pub mod recovery;
pub mod scripts;
pub mod server;
pub mod task;
pub mod timer;
pub mod worker;

pub use broker::{Broker, LiveItem};
pub use client::Client;
pub use error::{BrokerError, ClientError, ConfigError};
pub use keys::KeyInfo;
pub use server::{Config, QueueWeight, Server};
pub use task::{state, EnqueueOptions, TaskInfo, SKIP_RETRY_MARKER};
pub use timer::{TimerTasker, TimerWheel};
pub use worker::{ErrHandlerFn, IsFailureFn, Outcome, RetryDelayFn, TaskHandler};
