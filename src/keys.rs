// src/keys.rs
//! Key naming for every per-queue structure in Redis.
//!
//! All keys for a queue live under a single `<prefix>:<name>:` namespace so
//! that the atomic scripts can derive per-job keys server-side without extra
//! round-trips. In a cluster deployment the prefix should carry a hash tag
//! (e.g. `{myqueue}`) so every key lands on one shard.

/// Fully-qualified key factory for one queue.
#[derive(Debug, Clone)]
pub struct KeySpace {
    root: String,
    name: String,
    base: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        let root = prefix.into();
        let name = name.into();
        let base = format!("{}:{}:", root, name);
        Self { root, name, base }
    }

    /// The `<prefix>:<name>:` namespace handed to scripts so they can build
    /// per-job keys themselves.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn suffixed(&self, suffix: &str) -> String {
        format!("{}{}", self.base, suffix)
    }

    pub fn wait(&self) -> String {
        self.suffixed("wait")
    }

    pub fn paused(&self) -> String {
        self.suffixed("paused")
    }

    pub fn active(&self) -> String {
        self.suffixed("active")
    }

    pub fn delayed(&self) -> String {
        self.suffixed("delayed")
    }

    pub fn priority(&self) -> String {
        self.suffixed("priority")
    }

    pub fn completed(&self) -> String {
        self.suffixed("completed")
    }

    pub fn failed(&self) -> String {
        self.suffixed("failed")
    }

    pub fn waiting_children(&self) -> String {
        self.suffixed("waiting-children")
    }

    pub fn stalled(&self) -> String {
        self.suffixed("stalled")
    }

    pub fn stalled_check(&self) -> String {
        self.suffixed("stalled-check")
    }

    pub fn meta(&self) -> String {
        self.suffixed("meta")
    }

    pub fn events(&self) -> String {
        self.suffixed("events")
    }

    /// List pushed by `add`/`moveToDelayed` when a new earliest delayed entry
    /// appears, so the delay pump can wake before its scheduled deadline.
    pub fn marker(&self) -> String {
        self.suffixed("marker")
    }

    pub fn limiter(&self) -> String {
        self.suffixed("limiter")
    }

    pub fn repeat(&self) -> String {
        self.suffixed("repeat")
    }

    pub fn job(&self, job_id: &str) -> String {
        self.suffixed(job_id)
    }

    pub fn lock(&self, job_id: &str) -> String {
        format!("{}:lock", self.job(job_id))
    }

    pub fn dependencies(&self, job_id: &str) -> String {
        format!("{}:dependencies", self.job(job_id))
    }

    pub fn processed(&self, job_id: &str) -> String {
        format!("{}:processed", self.job(job_id))
    }

    /// Job key in a sibling queue under the same root prefix. Used for
    /// parent/child links across queues.
    pub fn sibling_job(&self, queue: &str, job_id: &str) -> String {
        format!("{}:{}:{}", self.root, queue, job_id)
    }

    pub fn sibling_base(&self, queue: &str) -> String {
        format!("{}:{}:", self.root, queue)
    }

    /// Pattern matching every key owned by this queue, for scan sweeps.
    pub fn scan_pattern(&self) -> String {
        format!("{}*", self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_one_namespace() {
        let keys = KeySpace::new("bull", "mail");
        assert_eq!(keys.base(), "bull:mail:");
        assert_eq!(keys.wait(), "bull:mail:wait");
        assert_eq!(keys.waiting_children(), "bull:mail:waiting-children");
        assert_eq!(keys.job("42"), "bull:mail:42");
        assert_eq!(keys.lock("42"), "bull:mail:42:lock");
        assert_eq!(keys.dependencies("42"), "bull:mail:42:dependencies");
        assert_eq!(keys.scan_pattern(), "bull:mail:*");
    }

    #[test]
    fn sibling_keys_stay_under_the_root_prefix() {
        let keys = KeySpace::new("bull", "mail");
        assert_eq!(keys.sibling_job("billing", "7"), "bull:billing:7");
        assert_eq!(keys.sibling_base("billing"), "bull:billing:");
    }
}
