//! Batches live-tasks, maintains liveness markers, handles stop signals.
//!
//! Grounded on `examples/original_source/heartbeat.go`. Live-add events accumulate
//! into a *current batch* for `BATCH_WINDOW`; once that window elapses and the
//! batch is non-empty, it's handed to the [`crate::timer::TimerWheel`] to fire
//! every `LIVE_TTL` and a fresh batch takes over. First fire of a batch does an
//! NX ZADD (create); subsequent fires do XX (refresh only) — this is what makes a
//! freshly-picked task's liveness marker race-free against recovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::broker::{Broker, LiveItem};
use crate::timer::{TimerTasker, TimerWheel};

/// How long a batch accumulates live-add events before being registered with the
/// timer wheel.
pub const BATCH_WINDOW: Duration = Duration::from_secs(20);
/// How often a registered batch refreshes its members' liveness scores. Must
/// exceed `BATCH_WINDOW` so a batch's marker always outlives the window during
/// which it was still accumulating.
pub const LIVE_TTL: Duration = Duration::from_secs(25);

/// One liveness event: a task was just picked (stop=false) or finished (stop=true).
#[derive(Debug, Clone)]
pub struct LiveEvent {
    pub item: LiveItem,
    pub stop: bool,
}

/// Sending half used by Workers to report pick/complete events.
pub type LiveEventSender = mpsc::UnboundedSender<LiveEvent>;

struct Batch {
    items: Mutex<Vec<LiveItem>>,
    started: std::sync::atomic::AtomicBool,
    broker: Arc<Broker>,
}

#[async_trait]
impl TimerTasker for Batch {
    async fn clean(&self) -> (Duration, bool) {
        let items = self.items.lock().await;
        if items.is_empty() {
            return (Duration::ZERO, true);
        }
        let started = self
            .started
            .swap(true, std::sync::atomic::Ordering::SeqCst);
        let _ = self.broker.live_tasks_change(&items, started).await;
        (LIVE_TTL, false)
    }
}

/// Consumes [`LiveEvent`]s and drives heartbeat batching.
pub struct HeartbeatService {
    broker: Arc<Broker>,
    timer: TimerWheel,
    current: Mutex<Arc<Batch>>,
    window_start: Mutex<tokio::time::Instant>,
    batches: Mutex<Vec<Arc<Batch>>>,
}

impl HeartbeatService {
    pub fn new(broker: Arc<Broker>, timer: TimerWheel) -> Arc<Self> {
        let batch = Arc::new(Batch {
            items: Mutex::new(Vec::new()),
            started: std::sync::atomic::AtomicBool::new(false),
            broker: broker.clone(),
        });
        Arc::new(HeartbeatService {
            broker,
            timer,
            current: Mutex::new(batch),
            window_start: Mutex::new(tokio::time::Instant::now()),
            batches: Mutex::new(Vec::new()),
        })
    }

    /// Run the event loop until `rx` closes or a shutdown is requested via
    /// `stop_rx`. Intended to be spawned as its own task.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<LiveEvent>,
        mut stop_rx: tokio_util::sync::CancellationToken,
    ) {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(ev) => self.handle_event(ev).await,
                        None => break,
                    }
                }
                _ = stop_rx.cancelled() => {
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    async fn handle_event(&self, ev: LiveEvent) {
        if ev.stop {
            self.handle_stop(ev.item).await;
            return;
        }
        let now = tokio::time::Instant::now();
        let mut window_start = self.window_start.lock().await;
        let elapsed_past_window = now.saturating_duration_since(*window_start) > BATCH_WINDOW;
        if !elapsed_past_window {
            let current = self.current.lock().await;
            current.items.lock().await.push(ev.item);
            return;
        }
        // Window elapsed: register the current batch (if non-empty) with the
        // timer wheel, and rotate in a fresh one.
        *window_start = now;
        let mut current_guard = self.current.lock().await;
        let had_items = !current_guard.items.lock().await.is_empty();
        if had_items {
            self.timer
                .register(current_guard.clone() as Arc<dyn TimerTasker>, LIVE_TTL);
            self.batches.lock().await.push(current_guard.clone());
        }
        let fresh = Arc::new(Batch {
            items: Mutex::new(vec![ev.item]),
            started: std::sync::atomic::AtomicBool::new(false),
            broker: self.broker.clone(),
        });
        *current_guard = fresh;
    }

    async fn handle_stop(&self, item: LiveItem) {
        // Remove from the current (not-yet-registered) batch if present there.
        {
            let current = self.current.lock().await;
            let mut items = current.items.lock().await;
            if let Some(pos) = items.iter().position(|i| i.task_id == item.task_id) {
                items.remove(pos);
                return;
            }
        }
        // Otherwise it may be in an already-started batch: best-effort direct
        // ZREM rather than waiting for the batch's own next tick, so a graceful
        // task completion doesn't leave a stale marker for up to `LIVE_TTL`.
        let _ = self.broker.delete_live_tasks(std::slice::from_ref(&item)).await;
    }

    /// Remove every started batch's members from `live`. Called on service
    /// shutdown (§4.3: "all started batches have their members bulk-removed").
    async fn shutdown(&self) {
        let batches = self.batches.lock().await;
        let mut all_items = Vec::new();
        for batch in batches.iter() {
            if batch.started.load(std::sync::atomic::Ordering::SeqCst) {
                all_items.extend(batch.items.lock().await.iter().cloned());
            }
        }
        let current = self.current.lock().await;
        if current.started.load(std::sync::atomic::Ordering::SeqCst) {
            all_items.extend(current.items.lock().await.iter().cloned());
        }
        if !all_items.is_empty() {
            let _ = self.broker.delete_live_tasks(&all_items).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_window_shorter_than_live_ttl() {
        assert!(BATCH_WINDOW < LIVE_TTL);
    }
}
