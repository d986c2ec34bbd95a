//! Process lifecycle: validates configuration, starts every background task,
//! coordinates graceful shutdown.
//!
//! Grounded on `examples/original_source/server.go`. `Config::patch` mirrors
//! `patchConfig`'s defaulting/validation; `Server::start`/`shutdown` mirror
//! `Start`/`ShutDown`. Signal handling (`waitForSignals`) lives in the demo binary
//! rather than the library, since a library shouldn't install process-wide signal
//! handlers on a caller's behalf.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::Broker;
use crate::cleaner::ArchiveCleaner;
use crate::error::ConfigError;
use crate::heartbeat::{HeartbeatService, LiveEvent};
use crate::recovery::RecoverySweeper;
use crate::timer::{TimerTasker, TimerWheel};
use crate::worker::{default_retry_delay, ErrHandlerFn, IsFailureFn, RetryDelayFn, TaskHandler, Worker};

/// One entry in the weighted queue list: `(name, relative priority)`. Mirrors the
/// original's `map[string]int` queue weights, expanded into priority-ordered
/// queue names by [`Config::queue_names`].
#[derive(Debug, Clone)]
pub struct QueueWeight {
    pub name: String,
    pub priority: u32,
}

pub struct Config {
    pub queues: Vec<QueueWeight>,
    pub concurrency: usize,
    pub strict_priority: bool,
    pub retry_delay: RetryDelayFn,
    /// Invoked on every swallowed background error (§6 "Error hook"). `None`
    /// means errors are only surfaced via `tracing`.
    pub err_handler: Option<ErrHandlerFn>,
    /// Classifies a handler error message as a genuine failure (counted toward
    /// `max_retry`) vs. not (§6 "IsFailure hook"). Defaults to "always true".
    pub is_failure: IsFailureFn,
}

impl Config {
    /// Validate and normalize: at least one queue, concurrency > 0, and a usable
    /// retry-delay function (defaulted if none given).
    fn patch(mut self) -> Result<Self, ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        self.queues.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(self)
    }

    fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name.clone()).collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queues: vec![QueueWeight {
                name: "default".to_string(),
                priority: 1,
            }],
            concurrency: 10,
            strict_priority: false,
            retry_delay: Arc::new(default_retry_delay),
            err_handler: None,
            is_failure: Arc::new(|_| true),
        }
    }
}

pub struct Server {
    broker: Arc<Broker>,
    config: Config,
    timer: TimerWheel,
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    workers: Vec<Arc<Worker>>,
}

impl Server {
    pub fn new(broker: Arc<Broker>, config: Config) -> Result<Self, ConfigError> {
        let config = config.patch()?;
        Ok(Server {
            broker,
            config,
            timer: TimerWheel::spawn(),
            stop: CancellationToken::new(),
            handles: Vec::new(),
            workers: Vec::new(),
        })
    }

    /// Register every configured queue, then spawn the worker pool plus the
    /// recovery sweeper, archive cleaner, and heartbeat service as background
    /// tasks.
    pub async fn start(
        &mut self,
        handler: Option<Arc<dyn TaskHandler>>,
    ) -> Result<(), ConfigError> {
        let handler = handler.ok_or(ConfigError::EmptyHandler)?;
        let queues = self.config.queue_names();
        for q in &queues {
            self.broker.register_queue(q).await;
        }

        let (live_tx, live_rx) = tokio::sync::mpsc::unbounded_channel::<LiveEvent>();
        let heartbeat = HeartbeatService::new(self.broker.clone(), self.timer.clone());
        let hb_stop = self.stop.clone();
        self.handles
            .push(tokio::spawn(heartbeat.run(live_rx, hb_stop)));

        let recovery = RecoverySweeper::new(self.broker.clone(), queues.clone());
        self.timer.register(
            recovery as Arc<dyn TimerTasker>,
            crate::recovery::SWEEP_INTERVAL,
        );

        let cleaner = ArchiveCleaner::new(self.broker.clone());
        self.timer.register(
            cleaner as Arc<dyn TimerTasker>,
            crate::cleaner::IDLE_INTERVAL,
        );

        for _ in 0..self.config.concurrency {
            let worker = Arc::new(Worker::new(
                self.broker.clone(),
                queues.clone(),
                self.config.strict_priority,
                handler.clone(),
                self.config.retry_delay.clone(),
                self.config.is_failure.clone(),
                self.config.err_handler.clone(),
                live_tx.clone(),
                1,
            ));
            let stop = self.stop.clone();
            self.handles.push(tokio::spawn(worker.clone().run(stop)));
            self.workers.push(worker);
        }
        info!(queues = ?queues, concurrency = self.config.concurrency, "server started");
        Ok(())
    }

    /// Cancel every background task and wait for them to exit. A worker's
    /// `run()` loop can still have a `process()` spawn in flight when its own
    /// handle returns (cancellation is checked between dispatches, not inside
    /// one), so every worker's [`Worker::join_in_flight`] is awaited too —
    /// otherwise this could return while a task handler is still running.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        self.timer.shutdown();
        for h in self.handles.drain(..) {
            let _ = h.await;
        }
        for w in &self.workers {
            w.join_in_flight().await;
        }
        info!("server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_rejects_empty_queues() {
        let cfg = Config {
            queues: vec![],
            ..Config::default()
        };
        assert!(matches!(cfg.patch(), Err(ConfigError::NoQueues)));
    }

    #[test]
    fn patch_rejects_zero_concurrency() {
        let cfg = Config {
            concurrency: 0,
            ..Config::default()
        };
        assert!(matches!(cfg.patch(), Err(ConfigError::InvalidConcurrency)));
    }

    #[test]
    fn patch_sorts_queues_by_descending_priority() {
        let cfg = Config {
            queues: vec![
                QueueWeight { name: "low".into(), priority: 1 },
                QueueWeight { name: "high".into(), priority: 9 },
            ],
            ..Config::default()
        }
        .patch()
        .unwrap();
        assert_eq!(cfg.queue_names(), vec!["high", "low"]);
    }
}
