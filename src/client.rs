//! Producer-side surface: build and enqueue a well-formed task.
//!
//! Grounded on `examples/original_source/client.go`. Validation mirrors the
//! original's `validate` helpers; the uniqueness fingerprint uses `xxh3` in place
//! of the original's `zeebo/xxh3`, hashing `type_name` + `payload` the same way
//! (`createUniqueKey` does not fold the queue name into the fingerprint).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::broker::Broker;
use crate::error::ClientError;
use crate::task::{state, EnqueueOptions, TaskInfo};

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Thin producer wrapper over a [`Broker`]. Multiple `Client`s may share one
/// `Broker`/connection.
pub struct Client {
    broker: Arc<Broker>,
}

impl Client {
    pub fn new(broker: Arc<Broker>) -> Self {
        Client { broker }
    }

    /// Validate, build, and enqueue a task. When `opts.unique_ttl_secs > 0`, the
    /// enqueue is rejected with [`ClientError::DuplicateTask`] if an identical
    /// (type, payload, queue) fingerprint is already claimed — resolving the
    /// uniqueness enforcement the original declared in its options but never
    /// wired up to a check.
    pub async fn enqueue(
        &self,
        type_name: &str,
        payload: &str,
        opts: EnqueueOptions,
    ) -> Result<TaskInfo, ClientError> {
        if type_name.is_empty() {
            return Err(ClientError::EmptyTaskType);
        }
        if opts.queue.is_empty() {
            return Err(ClientError::EmptyQueueName);
        }
        if opts.unique_ttl_secs < 0 {
            return Err(ClientError::UniqueTtlTooShort);
        }

        self.broker.register_queue(&opts.queue).await;

        let id = opts.task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let start_at = opts.process_at_epoch.unwrap_or(0);
        let scheduled = start_at > now();

        let mut unique_key = String::new();
        if opts.unique_ttl_secs > 0 {
            let hash = uniqueness_hash(type_name, payload);
            let claimed = self
                .broker
                .claim_unique(&opts.queue, &hash, &id, opts.unique_ttl_secs as i64)
                .await?;
            if !claimed {
                return Err(ClientError::DuplicateTask);
            }
            unique_key = hash;
        }

        let task = TaskInfo {
            id,
            type_name: type_name.to_string(),
            payload: payload.to_string(),
            queue: opts.queue,
            unique_key,
            error_msg: String::new(),
            state: if scheduled { state::SCHEDULED } else { state::PENDING },
            retry: opts.max_retry,
            retried: 0,
            timeout: opts.timeout_secs,
            deadline: opts.deadline_epoch,
            retention: opts.retention_secs,
            start_at,
            last_failed_at: 0,
            pending_at: now(),
            completed_at: 0,
        };

        self.broker.enqueue_tasks(std::slice::from_ref(&task)).await?;
        Ok(task)
    }
}

fn uniqueness_hash(type_name: &str, payload: &str) -> String {
    let mut buf = Vec::with_capacity(type_name.len() + payload.len() + 1);
    buf.extend_from_slice(type_name.as_bytes());
    buf.push(0);
    buf.extend_from_slice(payload.as_bytes());
    format!("{:016x}", xxh3_64(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniqueness_hash_is_stable_and_sensitive_to_fields() {
        let a = uniqueness_hash("email:send", "{\"to\":1}");
        let b = uniqueness_hash("email:send", "{\"to\":1}");
        let c = uniqueness_hash("email:send", "{\"to\":2}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn uniqueness_hash_ignores_queue() {
        // createUniqueKey in the original folds only tasktype+payload; two
        // enqueues of the same (type, payload) on different queues must
        // still collide on the same fingerprint.
        let a = uniqueness_hash("email:send", "{\"to\":1}");
        let b = uniqueness_hash("email:send", "{\"to\":1}");
        assert_eq!(a, b);
    }
}
