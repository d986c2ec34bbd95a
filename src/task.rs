//! In-memory/JSON representation of a task and its state bits.
//!
//! Mirrors `acornq`'s Go `TaskInfo` (see `task.go` in the original source): field
//! names are literal so the JSON document stored at `acornq:{queue}:t:<id>` is
//! bit-compatible across implementations.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bit-flag set over a task's lifecycle state.
///
/// A non-archived task is in exactly one of {Scheduled, Pending, Active, Retried}.
/// Archived tasks additionally carry one of {Successful, Failed}.
pub mod state {
    pub const ACTIVE: u32 = 1 << 0;
    pub const SCHEDULED: u32 = 1 << 1;
    pub const PENDING: u32 = 1 << 2;
    pub const FAILED: u32 = 1 << 3;
    pub const RETRIED: u32 = 1 << 4;
    pub const SUCCESSFUL: u32 = 1 << 5;
    pub const ARCHIVED: u32 = 1 << 6;
}

/// Sentinel returned by a handler to force immediate failed-archive, ignoring any
/// retries remaining.
pub const SKIP_RETRY_MARKER: &str = "__acornq_skip_retry__";

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A task record as stored in the remote store's JSON document.
///
/// Field names are literal and must not be renamed; zero-valued scalar fields are
/// omitted from the wire representation to match the original schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub payload: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unique_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_msg: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub state: u32,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub retry: i32,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub retried: i32,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub timeout: i32,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub deadline: i64,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub retention: i32,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub start_at: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub last_failed_at: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub pending_at: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub completed_at: i64,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}
fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

impl TaskInfo {
    /// True when `start_at` is still in the future relative to `now`.
    pub fn is_scheduled(&self, now: i64) -> bool {
        self.start_at > now
    }

    pub fn has_state(&self, flag: u32) -> bool {
        self.state & flag == flag
    }
}

/// Options collected by a producer before enqueueing a task. Producer-side option
/// parsing proper (validation, CLI surface) is out of scope; this builder exists
/// only to hand the Broker a well-formed `TaskInfo`.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub queue: String,
    pub task_id: Option<String>,
    pub max_retry: i32,
    pub timeout_secs: i32,
    pub deadline_epoch: i64,
    pub unique_ttl_secs: i32,
    pub process_at_epoch: Option<i64>,
    pub retention_secs: i32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        EnqueueOptions {
            queue: "default".to_string(),
            task_id: None,
            max_retry: 25,
            timeout_secs: 0,
            deadline_epoch: 0,
            unique_ttl_secs: 0,
            process_at_epoch: None,
            retention_secs: 0,
        }
    }
}

impl EnqueueOptions {
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = name.into();
        self
    }

    pub fn task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn max_retry(mut self, n: i32) -> Self {
        self.max_retry = n.max(0);
        self
    }

    pub fn timeout_secs(mut self, secs: i32) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn deadline_epoch(mut self, epoch: i64) -> Self {
        self.deadline_epoch = epoch;
        self
    }

    pub fn unique_ttl_secs(mut self, secs: i32) -> Self {
        self.unique_ttl_secs = secs;
        self
    }

    pub fn process_in_secs(mut self, secs: i64) -> Self {
        self.process_at_epoch = Some(now() + secs);
        self
    }

    pub fn process_at_epoch(mut self, epoch: i64) -> Self {
        self.process_at_epoch = Some(epoch);
        self
    }

    pub fn retention_secs(mut self, secs: i32) -> Self {
        self.retention_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_omits_zero_fields() {
        let t = TaskInfo {
            id: "abc".into(),
            type_name: "email:send".into(),
            payload: "{}".into(),
            queue: "default".into(),
            unique_key: String::new(),
            error_msg: String::new(),
            state: state::PENDING,
            retry: 3,
            retried: 0,
            timeout: 0,
            deadline: 0,
            retention: 0,
            start_at: 0,
            last_failed_at: 0,
            pending_at: 100,
            completed_at: 0,
        };
        let encoded = serde_json::to_string(&t).unwrap();
        assert!(!encoded.contains("\"retried\""));
        assert!(!encoded.contains("\"deadline\""));
        let decoded: TaskInfo = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, t);
    }

    #[test]
    fn scheduled_detection() {
        let mut t = TaskInfo {
            id: "a".into(),
            type_name: "x".into(),
            payload: String::new(),
            queue: "default".into(),
            unique_key: String::new(),
            error_msg: String::new(),
            state: 0,
            retry: 0,
            retried: 0,
            timeout: 0,
            deadline: 0,
            retention: 0,
            start_at: 1000,
            last_failed_at: 0,
            pending_at: 0,
            completed_at: 0,
        };
        assert!(t.is_scheduled(500));
        t.start_at = 500;
        assert!(!t.is_scheduled(500));
    }

    #[test]
    fn state_bitmask_combines() {
        let s = state::ARCHIVED | state::SUCCESSFUL;
        let t = TaskInfo {
            id: "a".into(),
            type_name: "x".into(),
            payload: String::new(),
            queue: "default".into(),
            unique_key: String::new(),
            error_msg: String::new(),
            state: s,
            retry: 0,
            retried: 0,
            timeout: 0,
            deadline: 0,
            retention: 0,
            start_at: 0,
            last_failed_at: 0,
            pending_at: 0,
            completed_at: 0,
        };
        assert!(t.has_state(state::ARCHIVED));
        assert!(t.has_state(state::SUCCESSFUL));
        assert!(!t.has_state(state::FAILED));
    }
}
