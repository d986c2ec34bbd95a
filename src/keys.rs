//! Derives stable remote-store key names per queue.
//!
//! Grounded on `examples/original_source/name.go`. The hash-tag braces in the
//! per-queue prefix are not cosmetic: they pin every key for one queue to the same
//! cluster shard so the Lua scripts in [`crate::broker`] can run atomically. Do not
//! reformat this prefix.

/// Precomputed Redis key names for one queue. Computed once at registration time to
/// avoid repeated `format!` allocation on every Broker call.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub queue: String,
    prefix: String,
    pending: String,
    active: String,
    scheduled: String,
    retry: String,
    live: String,
    todel: String,
    successful: String,
    failed: String,
}

impl KeyInfo {
    pub fn new(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        let prefix = format!("acornq:{{{queue}}}:");
        KeyInfo {
            pending: format!("{prefix}pending"),
            active: format!("{prefix}active"),
            scheduled: format!("{prefix}scheduled"),
            retry: format!("{prefix}retry"),
            live: format!("{prefix}live"),
            todel: format!("{prefix}todel"),
            successful: format!("{prefix}successful"),
            failed: format!("{prefix}failed"),
            prefix,
            queue,
        }
    }

    pub fn task_key(&self, id: &str) -> String {
        format!("{}t:{}", self.prefix, id)
    }

    pub fn unique_key(&self, hash: &str) -> String {
        format!("{}unique:{}", self.prefix, hash)
    }

    pub fn pending_key(&self) -> &str {
        &self.pending
    }
    pub fn active_key(&self) -> &str {
        &self.active
    }
    pub fn scheduled_key(&self) -> &str {
        &self.scheduled
    }
    pub fn retry_key(&self) -> &str {
        &self.retry
    }
    pub fn live_key(&self) -> &str {
        &self.live
    }
    pub fn todel_key(&self) -> &str {
        &self.todel
    }
    pub fn successful_key(&self) -> &str {
        &self.successful
    }
    pub fn failed_key(&self) -> &str {
        &self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_hash_tagged_and_stable() {
        let k = KeyInfo::new("default");
        assert_eq!(k.pending_key(), "acornq:{default}:pending");
        assert_eq!(k.active_key(), "acornq:{default}:active");
        assert_eq!(k.scheduled_key(), "acornq:{default}:scheduled");
        assert_eq!(k.retry_key(), "acornq:{default}:retry");
        assert_eq!(k.live_key(), "acornq:{default}:live");
        assert_eq!(k.todel_key(), "acornq:{default}:todel");
        assert_eq!(k.successful_key(), "acornq:{default}:successful");
        assert_eq!(k.failed_key(), "acornq:{default}:failed");
        assert_eq!(k.task_key("abc"), "acornq:{default}:t:abc");
    }
}
