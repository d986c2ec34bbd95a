//! Periodic eviction of archived tasks past their retention window.
//!
//! Grounded on `examples/original_source/cleaner.go`. Unlike the original's single
//! shared cursor (which starves whichever of `successful`/`failed` it isn't
//! currently paginating), each queue keeps independent cursors for its two
//! archive lists, drained one [`BATCH_LEN`]-sized page at a time until both are
//! empty.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::broker::{Broker, CleanerCursor};
use crate::timer::TimerTasker;

/// How many `todel`-eligible members are processed per Lua invocation.
pub const BATCH_LEN: i64 = 500;

/// How often the cleaner re-runs once its queues are fully drained.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(60);

/// How soon to re-run while there's still known backlog, to avoid archive
/// growth outpacing a once-a-minute sweep under heavy load.
pub const BUSY_INTERVAL: Duration = Duration::from_secs(1);

pub struct ArchiveCleaner {
    broker: Arc<Broker>,
    cursors: Mutex<HashMap<String, CleanerCursor>>,
}

impl ArchiveCleaner {
    pub fn new(broker: Arc<Broker>) -> Arc<Self> {
        Arc::new(ArchiveCleaner {
            broker,
            cursors: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl TimerTasker for ArchiveCleaner {
    async fn clean(&self) -> (Duration, bool) {
        let mut cursors = self.cursors.lock().await;
        match self.broker.cleanup_archive(BATCH_LEN, &mut cursors).await {
            Ok(more) if more => (BUSY_INTERVAL, false),
            Ok(_) => (IDLE_INTERVAL, false),
            Err(e) => {
                warn!(error = %e, "archive cleanup failed");
                (IDLE_INTERVAL, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_interval_is_tighter_than_idle() {
        assert!(BUSY_INTERVAL < IDLE_INTERVAL);
    }
}
