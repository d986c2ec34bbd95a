//! Per-slot pick/process/archive loop.
//!
//! Grounded on `examples/original_source/worker.go`: each worker slot runs
//! independently, picking one task at a time, reporting liveness to the
//! [`crate::heartbeat::HeartbeatService`] while the handler runs, and routing the
//! outcome to retry or to the appropriate archive.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::broker::{Broker, LiveItem};
use crate::heartbeat::{LiveEvent, LiveEventSender};
use crate::task::{state, TaskInfo, SKIP_RETRY_MARKER};

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Result of running a task's handler.
pub enum Outcome {
    Success,
    /// Failed; the message is stored on the task and either drives a retry or,
    /// if `retry == SKIP_RETRY_MARKER` (or retries are exhausted), an immediate
    /// archive as failed.
    Failure(String),
}

/// Implemented by callers to process one task's payload.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskInfo) -> Outcome;
}

/// Computes the next `pending_at` for a retried task. Default mirrors the
/// original's Sidekiq-derived backoff: `retried^4 + 15 + rand(30) * (retried+1)`.
pub type RetryDelayFn = Arc<dyn Fn(i32, &TaskInfo) -> Duration + Send + Sync>;

pub fn default_retry_delay(retried: i32, _task: &TaskInfo) -> Duration {
    let retried = retried as i64;
    let jitter = rand::random::<u64>() % 30;
    let secs = retried.pow(4) + 15 + (jitter as i64) * (retried + 1);
    Duration::from_secs(secs.max(0) as u64)
}

/// Classifies a handler error message as a genuine failure, counted toward
/// `max_retry`, vs. not. Default treats every non-empty message as a failure.
pub type IsFailureFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Invoked on every swallowed background error (store I/O during pick/retry/
/// archive, best-effort error_msg writes). `None` in `Config` means errors are
/// only surfaced via `tracing`.
pub type ErrHandlerFn = Arc<dyn Fn(&str) + Send + Sync>;

fn shuffled_queue_order(queues: &[String], strict_priority: bool) -> Vec<String> {
    if strict_priority {
        return queues.to_vec();
    }
    let mut qs = queues.to_vec();
    qs.shuffle(&mut rand::thread_rng());
    qs
}

pub struct Worker {
    broker: Arc<Broker>,
    queues: Vec<String>,
    strict_priority: bool,
    handler: Arc<dyn TaskHandler>,
    retry_delay: RetryDelayFn,
    is_failure: IsFailureFn,
    err_handler: Option<ErrHandlerFn>,
    live_tx: LiveEventSender,
    concurrency: Arc<Semaphore>,
    /// Join handles of the per-task `process()` spawns, so shutdown can wait for
    /// whichever task is currently in flight instead of returning while a handler
    /// is still running.
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<Broker>,
        queues: Vec<String>,
        strict_priority: bool,
        handler: Arc<dyn TaskHandler>,
        retry_delay: RetryDelayFn,
        is_failure: IsFailureFn,
        err_handler: Option<ErrHandlerFn>,
        live_tx: LiveEventSender,
        concurrency: usize,
    ) -> Self {
        Worker {
            broker,
            queues,
            strict_priority,
            handler,
            retry_delay,
            is_failure,
            err_handler,
            live_tx,
            concurrency: Arc::new(Semaphore::new(concurrency)),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every `process()` spawn started so far to finish. Called by
    /// [`crate::server::Server::shutdown`] after `run()`'s own handle has
    /// returned, since a spawn started just before cancellation can still be
    /// running at that point.
    pub async fn join_in_flight(&self) {
        let mut handles = self.in_flight.lock().await;
        for h in handles.drain(..) {
            let _ = h.await;
        }
    }

    /// Surfaces a swallowed background error through both `tracing` and the
    /// configured error hook (§6 "Error hook"), if any.
    fn report_error(&self, context: &str, err: &impl std::fmt::Display) {
        let msg = format!("{context}: {err}");
        error!("{msg}");
        if let Some(hook) = &self.err_handler {
            hook(&msg);
        }
    }

    /// Queue names in the order a single pick should try them: caller-given
    /// priority order as-is, or shuffled per pick to give equal-weight queues
    /// a fair share (mirrors `queueNames` in the original).
    fn ordered_queues(&self) -> Vec<String> {
        shuffled_queue_order(&self.queues, self.strict_priority)
    }

    /// Run until `stop` is cancelled. A task already picked when cancellation
    /// lands is handed straight back to `pending` via [`Broker::active_to_pending`]
    /// rather than dispatched, mirroring the original's "stop seen right after
    /// pick, before handling" path. A task already dispatched to `process()` is
    /// left to run to completion; the caller must await [`Worker::join_in_flight`]
    /// after this handle returns to avoid racing that in-flight task.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        loop {
            if stop.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                p = self.concurrency.clone().acquire_owned() => p.expect("semaphore never closed"),
                _ = stop.cancelled() => break,
            };
            let queues = self.ordered_queues();
            let picked = self.broker.pick_tasks(&queues, 1).await;
            let mut tasks = match picked {
                Ok(tasks) => tasks,
                Err(e) => {
                    self.report_error("pick_tasks failed", &e);
                    drop(permit);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };
            let Some(task) = tasks.pop() else {
                drop(permit);
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };
            if stop.is_cancelled() {
                if let Err(e) = self
                    .broker
                    .active_to_pending(std::slice::from_ref(&task))
                    .await
                {
                    self.report_error("returning in-flight task to pending failed", &e);
                }
                drop(permit);
                break;
            }
            let this = self.clone();
            let handle = tokio::spawn(async move {
                this.process(task).await;
                drop(permit);
            });
            self.in_flight.lock().await.push(handle);
        }
    }

    async fn process(&self, mut task: TaskInfo) {
        let item = LiveItem {
            queue: task.queue.clone(),
            task_id: task.id.clone(),
        };
        let _ = self.live_tx.send(LiveEvent {
            item: item.clone(),
            stop: false,
        });

        let outcome = self.run_handler(&task).await;

        let _ = self.live_tx.send(LiveEvent {
            item,
            stop: true,
        });

        match outcome {
            Outcome::Success => {
                task.completed_at = now();
                if let Err(e) = self.broker.active_to_archive(&[task], true).await {
                    self.report_error("archiving successful task failed", &e);
                }
            }
            Outcome::Failure(msg) => self.handle_failure(task, msg).await,
        }
    }

    async fn run_handler(&self, task: &TaskInfo) -> Outcome {
        if task.timeout > 0 {
            let budget = Duration::from_secs(task.timeout as u64);
            match tokio::time::timeout(budget, self.handler.handle(task)).await {
                Ok(outcome) => outcome,
                Err(_) => Outcome::Failure(format!("handler exceeded {}s timeout", task.timeout)),
            }
        } else {
            self.handler.handle(task).await
        }
    }

    async fn handle_failure(&self, mut task: TaskInfo, msg: String) {
        task.error_msg = msg;
        task.last_failed_at = now();
        if let Err(e) = self.broker.set_error_msg(&task).await {
            self.report_error("best-effort error_msg write failed", &e);
        }

        let skip_retry = task.error_msg == SKIP_RETRY_MARKER;
        let exhausted = task.retried >= task.retry;
        if skip_retry || exhausted {
            if let Err(e) = self.broker.active_to_archive(&[task], false).await {
                self.report_error("archiving failed task failed", &e);
            }
            return;
        }

        if (self.is_failure)(&task.error_msg) {
            task.retried += 1;
        }
        task.pending_at = now() + (self.retry_delay)(task.retried, &task).as_secs() as i64;
        task.state = state::RETRIED;
        if let Err(e) = self.broker.retry_tasks(&[task]).await {
            self.report_error("retrying task failed", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> TaskInfo {
        TaskInfo {
            id: "a".into(),
            type_name: "x".into(),
            payload: String::new(),
            queue: "default".into(),
            unique_key: String::new(),
            error_msg: String::new(),
            state: 0,
            retry: 3,
            retried: 0,
            timeout: 0,
            deadline: 0,
            retention: 0,
            start_at: 0,
            last_failed_at: 0,
            pending_at: 0,
            completed_at: 0,
        }
    }

    #[test]
    fn default_retry_delay_grows_with_attempts() {
        let t = sample_task();
        let d0 = default_retry_delay(0, &t).as_secs();
        let d4 = default_retry_delay(4, &t).as_secs();
        assert!(d4 > d0);
    }

    #[test]
    fn strict_priority_preserves_caller_order() {
        let queues = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(shuffled_queue_order(&queues, true), queues);
    }

    #[test]
    fn non_strict_preserves_membership() {
        let queues = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut shuffled = shuffled_queue_order(&queues, false);
        shuffled.sort();
        let mut expected = queues.clone();
        expected.sort();
        assert_eq!(shuffled, expected);
    }
}
