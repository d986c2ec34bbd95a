//! Periodic zombie-task reclamation.
//!
//! Grounded on `examples/original_source/recovery.go`: an active task whose
//! liveness marker hasn't been refreshed within `idle_timeout` is assumed to
//! belong to a dead worker and is moved back to `pending`. `idle_timeout` is
//! fixed at 55s here (≥ 2x [`crate::heartbeat::LIVE_TTL`]) resolving the 30s vs.
//! 55s inconsistency between the original's constant and its call site.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::broker::Broker;
use crate::timer::TimerTasker;

/// How long an active task may go without a liveness refresh before it's
/// considered abandoned.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(55);

/// How often the sweep itself re-runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct RecoverySweeper {
    broker: Arc<Broker>,
    queues: Vec<String>,
}

impl RecoverySweeper {
    pub fn new(broker: Arc<Broker>, queues: Vec<String>) -> Arc<Self> {
        Arc::new(RecoverySweeper { broker, queues })
    }
}

#[async_trait]
impl TimerTasker for RecoverySweeper {
    async fn clean(&self) -> (Duration, bool) {
        if let Err(e) = self.broker.recovery_tasks(&self.queues, IDLE_TIMEOUT).await {
            warn!(error = %e, "recovery sweep failed");
        }
        (SWEEP_INTERVAL, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_exceeds_double_live_ttl() {
        assert!(IDLE_TIMEOUT >= crate::heartbeat::LIVE_TTL * 2u32);
    }
}
