// src/limiter.rs
//! Rolling-window rate limiting for `moveToActive`.
//!
//! The counters themselves live in Redis (`limiter` or `limiter:<group>`)
//! and are read and advanced inside the claim script; this module carries
//! the configuration and resolves group values out of job payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterOptions {
    /// Maximum number of claims per window.
    pub max: u32,
    /// Window length in milliseconds.
    pub duration_ms: u64,
    /// Dotted path into the job payload selecting the group value. When set,
    /// each group gets its own counter and job ids gain a `:<group>` suffix.
    pub group_key: Option<String>,
}

impl RateLimiterOptions {
    pub fn grouped(&self) -> bool {
        self.group_key.is_some()
    }

    /// Resolves this limiter's group for a payload, if configured.
    pub fn group_for(&self, data: &Value) -> Option<String> {
        let path = self.group_key.as_deref()?;
        lookup_path(data, path).map(render_group)
    }
}

fn lookup_path<'a>(data: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in dotted.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn render_group(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limiter(path: &str) -> RateLimiterOptions {
        RateLimiterOptions {
            max: 10,
            duration_ms: 1_000,
            group_key: Some(path.to_string()),
        }
    }

    #[test]
    fn resolves_nested_group_values() {
        let data = json!({"customer": {"id": "acme"}, "n": 4});
        assert_eq!(
            limiter("customer.id").group_for(&data),
            Some("acme".to_string())
        );
        assert_eq!(limiter("n").group_for(&data), Some("4".to_string()));
        assert_eq!(limiter("customer.name").group_for(&data), None);
    }

    #[test]
    fn ungrouped_limiter_has_no_group() {
        let ungrouped = RateLimiterOptions {
            max: 5,
            duration_ms: 500,
            group_key: None,
        };
        assert!(!ungrouped.grouped());
        assert_eq!(ungrouped.group_for(&json!({"a": 1})), None);
    }
}
