//! All atomic multi-key operations against the remote store.
//!
//! The Broker is the sole mutator of store state (§4.1). Every multi-key
//! transition runs as one Lua script (see [`crate::scripts`]) so partial failure
//! mid-transition is impossible. Concurrency/network errors that the store
//! surfaces as an empty reply are flattened to success, matching the original's
//! `rueidis.Nil => nil` handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::BrokerError;
use crate::keys::KeyInfo;
use crate::scripts;
use crate::task::{state, TaskInfo};

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A single task's liveness heartbeat target: which queue (hence which `live`
/// sorted set) and which task id.
#[derive(Debug, Clone)]
pub struct LiveItem {
    pub queue: String,
    pub task_id: String,
}

/// Independent pagination cursors for [`Broker::cleanup_archive`]. Each queue's
/// `successful`/`failed` lists drain on their own schedule rather than sharing one
/// clobbered offset (see SPEC_FULL.md §C ArchiveCleaner).
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanerCursor {
    pub success_pos: i64,
    pub failed_pos: i64,
}

impl CleanerCursor {
    pub fn is_drained(&self) -> bool {
        self.success_pos == 0 && self.failed_pos == 0
    }
}

pub struct Broker {
    conn: MultiplexedConnection,
    key_infos: Mutex<HashMap<String, Arc<KeyInfo>>>,
}

impl Broker {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Broker {
            conn,
            key_infos: Mutex::new(HashMap::new()),
        }
    }

    /// Register a queue so later calls can resolve its keys. Idempotent.
    pub async fn register_queue(&self, queue: &str) {
        let mut guard = self.key_infos.lock().await;
        guard
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(KeyInfo::new(queue)));
    }

    async fn key_info(&self, queue: &str) -> Arc<KeyInfo> {
        {
            let guard = self.key_infos.lock().await;
            if let Some(k) = guard.get(queue) {
                return k.clone();
            }
        }
        self.register_queue(queue).await;
        self.key_infos.lock().await.get(queue).unwrap().clone()
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Atomically promote due scheduled/retry members into pending, then pop up to
    /// `count` tasks into `active`. Iterates `queues` in the caller's priority
    /// order until `count` is satisfied or every queue has been drained once.
    pub async fn pick_tasks(
        &self,
        queues: &[String],
        count: usize,
    ) -> Result<Vec<TaskInfo>, BrokerError> {
        let mut result = Vec::new();
        let mut remaining = count;
        for queue in queues {
            if remaining == 0 {
                break;
            }
            let picked = self.pick_tasks_one(queue, remaining).await?;
            if picked.is_empty() {
                continue;
            }
            remaining -= picked.len();
            result.extend(picked);
        }
        Ok(result)
    }

    async fn pick_tasks_one(
        &self,
        queue: &str,
        count: usize,
    ) -> Result<Vec<TaskInfo>, BrokerError> {
        let k = self.key_info(queue).await;
        let mut conn = self.conn();
        let raw: Vec<String> = scripts::PICK_TASKS
            .key(k.pending_key())
            .key(k.active_key())
            .key(k.scheduled_key())
            .key(k.retry_key())
            .arg(count)
            .arg(state::PENDING)
            .arg(state::ACTIVE)
            .invoke_async(&mut conn)
            .await
            .or_else(empty_ok_vec)?;
        let mut tasks = Vec::with_capacity(raw.len());
        for doc in raw {
            match serde_json::from_str::<TaskInfo>(&doc) {
                Ok(t) => tasks.push(t),
                Err(e) => {
                    // Skip this task in the pick result, but surface it: a
                    // document that fails to decode here was already moved
                    // into `active` by the script and would otherwise go
                    // missing silently.
                    warn!(error = %e, queue = %queue, "malformed task JSON, skipping");
                }
            }
        }
        Ok(tasks)
    }

    /// Write tasks to their `t:<id>` document and push into `pending` or
    /// `scheduled`, partitioned per queue and due-now vs. future `start_at`.
    pub async fn enqueue_tasks(&self, tasks: &[TaskInfo]) -> Result<(), BrokerError> {
        let now = now();
        let mut pending: HashMap<&str, Vec<&TaskInfo>> = HashMap::new();
        let mut scheduled: HashMap<&str, Vec<&TaskInfo>> = HashMap::new();
        for t in tasks {
            if t.is_scheduled(now) {
                scheduled.entry(&t.queue).or_default().push(t);
            } else {
                pending.entry(&t.queue).or_default().push(t);
            }
        }
        for (queue, ts) in pending {
            self.enqueue_group(queue, &ts, false).await?;
        }
        for (queue, ts) in scheduled {
            self.enqueue_group(queue, &ts, true).await?;
        }
        Ok(())
    }

    async fn enqueue_group(
        &self,
        queue: &str,
        tasks: &[&TaskInfo],
        scheduled: bool,
    ) -> Result<(), BrokerError> {
        let k = self.key_info(queue).await;
        let mut conn = self.conn();
        let script = if scheduled {
            &*scripts::ENQUEUE_SCHEDULED
        } else {
            &*scripts::ENQUEUE_PENDING
        };
        let mut invocation = script.prepare_invoke();
        invocation = invocation.key(if scheduled {
            k.scheduled_key()
        } else {
            k.pending_key()
        });
        let mut docs = Vec::with_capacity(tasks.len());
        for t in tasks {
            invocation = invocation.key(k.task_key(&t.id));
            docs.push(serde_json::to_string(t)?);
        }
        for doc in &docs {
            invocation = invocation.arg(doc);
        }
        invocation
            .invoke_async::<()>(&mut conn)
            .await
            .or_else(empty_ok_unit)?;
        Ok(())
    }

    /// Move tasks from `active` into `retry`, writing the caller-computed
    /// `pending_at`/`retried` fields.
    pub async fn retry_tasks(&self, tasks: &[TaskInfo]) -> Result<(), BrokerError> {
        let mut by_queue: HashMap<&str, Vec<&TaskInfo>> = HashMap::new();
        for t in tasks {
            by_queue.entry(&t.queue).or_default().push(t);
        }
        for (queue, ts) in by_queue {
            self.retry_group(queue, &ts).await?;
        }
        Ok(())
    }

    async fn retry_group(&self, queue: &str, tasks: &[&TaskInfo]) -> Result<(), BrokerError> {
        let k = self.key_info(queue).await;
        let mut conn = self.conn();
        let mut invocation = scripts::RETRY_TASKS
            .prepare_invoke()
            .key(k.retry_key())
            .key(k.active_key());
        for t in tasks {
            invocation = invocation.key(k.task_key(&t.id));
        }
        invocation = invocation.arg(state::RETRIED);
        for t in tasks {
            invocation = invocation.arg(t.pending_at).arg(t.retried);
        }
        invocation
            .invoke_async::<()>(&mut conn)
            .await
            .or_else(empty_ok_unit)?;
        Ok(())
    }

    /// Cede active tasks back to pending (graceful shutdown / recovery reclaim).
    pub async fn active_to_pending(&self, tasks: &[TaskInfo]) -> Result<(), BrokerError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut by_queue: HashMap<&str, Vec<&TaskInfo>> = HashMap::new();
        for t in tasks {
            by_queue.entry(&t.queue).or_default().push(t);
        }
        for (queue, ts) in by_queue {
            let k = self.key_info(queue).await;
            let mut conn = self.conn();
            let mut invocation = scripts::ACTIVE_TO_PENDING
                .prepare_invoke()
                .key(k.pending_key())
                .key(k.active_key());
            for t in &ts {
                invocation = invocation.key(k.task_key(&t.id));
            }
            invocation
                .invoke_async::<()>(&mut conn)
                .await
                .or_else(empty_ok_unit)?;
        }
        Ok(())
    }

    /// Archive active tasks as successful or failed, honoring each task's
    /// retention policy.
    pub async fn active_to_archive(
        &self,
        tasks: &[TaskInfo],
        successful: bool,
    ) -> Result<(), BrokerError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut by_queue: HashMap<&str, Vec<&TaskInfo>> = HashMap::new();
        for t in tasks {
            by_queue.entry(&t.queue).or_default().push(t);
        }
        let archived_state = state::ARCHIVED
            | if successful {
                state::SUCCESSFUL
            } else {
                state::FAILED
            };
        for (queue, ts) in by_queue {
            let k = self.key_info(queue).await;
            let mut conn = self.conn();
            let archive_key = if successful {
                k.successful_key()
            } else {
                k.failed_key()
            };
            let mut invocation = scripts::ACTIVE_TO_ARCHIVE
                .prepare_invoke()
                .key(archive_key)
                .key(k.active_key())
                .key(k.todel_key());
            for t in &ts {
                invocation = invocation.key(k.task_key(&t.id));
            }
            invocation = invocation.arg(archived_state);
            for t in &ts {
                invocation = invocation.arg(t.retention);
            }
            invocation
                .invoke_async::<()>(&mut conn)
                .await
                .or_else(empty_ok_unit)?;
        }
        Ok(())
    }

    /// Write the cached `error_msg` field for a task (best-effort visibility; the
    /// authoritative terminal state still flows through retry/archive).
    pub async fn set_error_msg(&self, task: &TaskInfo) -> Result<(), BrokerError> {
        let k = self.key_info(&task.queue).await;
        let mut conn = self.conn();
        let quoted = serde_json::to_string(&task.error_msg)?;
        redis::cmd("JSON.SET")
            .arg(k.task_key(&task.id))
            .arg("$.error_msg")
            .arg(quoted)
            .query_async::<()>(&mut conn)
            .await
            .or_else(empty_ok_unit)?;
        Ok(())
    }

    /// Reclaim zombie active tasks (owner stopped heartbeating) back to pending.
    pub async fn recovery_tasks(
        &self,
        queues: &[String],
        idle_timeout: Duration,
    ) -> Result<(), BrokerError> {
        for queue in queues {
            let k = self.key_info(queue).await;
            let mut conn = self.conn();
            scripts::RECOVERY
                .key(k.active_key())
                .key(k.live_key())
                .key(k.pending_key())
                .arg(idle_timeout.as_secs())
                .arg(state::PENDING)
                .invoke_async::<()>(&mut conn)
                .await
                .or_else(empty_ok_unit)?;
        }
        Ok(())
    }

    /// NX-or-XX ZADD liveness markers for a batch of tasks, grouped by queue.
    pub async fn live_tasks_change(
        &self,
        items: &[LiveItem],
        update: bool,
    ) -> Result<(), BrokerError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut by_queue: HashMap<&str, Vec<&LiveItem>> = HashMap::new();
        for item in items {
            by_queue.entry(&item.queue).or_default().push(item);
        }
        let ts = now();
        for (queue, its) in by_queue {
            let k = self.key_info(queue).await;
            let mut conn = self.conn();
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(k.live_key());
            cmd.arg(if update { "XX" } else { "NX" });
            for item in its {
                cmd.arg(ts).arg(k.task_key(&item.task_id));
            }
            cmd.query_async::<()>(&mut conn)
                .await
                .or_else(empty_ok_unit)?;
        }
        Ok(())
    }

    /// Remove liveness markers for a batch of tasks (stop event / shutdown drain).
    pub async fn delete_live_tasks(&self, items: &[LiveItem]) -> Result<(), BrokerError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut by_queue: HashMap<&str, Vec<&LiveItem>> = HashMap::new();
        for item in items {
            by_queue.entry(&item.queue).or_default().push(item);
        }
        for (queue, its) in by_queue {
            let k = self.key_info(queue).await;
            let mut conn = self.conn();
            let members: Vec<String> = its.iter().map(|i| k.task_key(&i.task_id)).collect();
            conn.zrem::<_, _, ()>(k.live_key(), members)
                .await
                .or_else(empty_ok_unit)?;
        }
        Ok(())
    }

    /// Paginate `todel`/`successful`/`failed` for every registered queue, one page
    /// per call. Returns the next cursor per queue; a drained cursor reads 0/0.
    pub async fn cleanup_archive(
        &self,
        batch_len: i64,
        cursors: &mut HashMap<String, CleanerCursor>,
    ) -> Result<bool, BrokerError> {
        let queues: Vec<String> = {
            let guard = self.key_infos.lock().await;
            guard.keys().cloned().collect()
        };
        let mut any_remaining = false;
        for queue in queues {
            let k = self.key_info(&queue).await;
            let cursor = cursors.entry(queue.clone()).or_default();
            let mut conn = self.conn();
            let (next_success, next_failed): (i64, i64) = scripts::CLEANER
                .key(k.todel_key())
                .key(k.successful_key())
                .key(k.failed_key())
                .arg(cursor.success_pos)
                .arg(cursor.success_pos + batch_len - 1)
                .arg(cursor.failed_pos)
                .arg(cursor.failed_pos + batch_len - 1)
                .invoke_async(&mut conn)
                .await?;
            cursor.success_pos = next_success;
            cursor.failed_pos = next_failed;
            if !cursor.is_drained() {
                any_remaining = true;
            }
        }
        Ok(any_remaining)
    }

    /// Attempt to claim a uniqueness fingerprint for `ttl_secs`. Returns `true`
    /// when the claim succeeded (no prior task held it).
    pub async fn claim_unique(
        &self,
        queue: &str,
        hash: &str,
        task_id: &str,
        ttl_secs: i64,
    ) -> Result<bool, BrokerError> {
        let k = self.key_info(queue).await;
        let mut conn = self.conn();
        let claimed: i64 = scripts::CLAIM_UNIQUE
            .key(k.unique_key(hash))
            .arg(task_id)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed == 1)
    }
}

/// Normalizes a store "no-op" (nil reply) into success, per §4.1: "Concurrency and
/// network errors that indicate 'no-op' (empty result) are flattened to success."
fn empty_ok_unit(e: redis::RedisError) -> Result<(), redis::RedisError> {
    if e.kind() == redis::ErrorKind::TypeError && e.to_string().contains("nil") {
        Ok(())
    } else {
        Err(e)
    }
}

fn empty_ok_vec<T>(e: redis::RedisError) -> Result<Vec<T>, redis::RedisError> {
    if e.kind() == redis::ErrorKind::TypeError && e.to_string().contains("nil") {
        Ok(Vec::new())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaner_cursor_drained_detection() {
        let c = CleanerCursor {
            success_pos: 0,
            failed_pos: 0,
        };
        assert!(c.is_drained());
        let c2 = CleanerCursor {
            success_pos: 500,
            failed_pos: 0,
        };
        assert!(!c2.is_drained());
    }
}
