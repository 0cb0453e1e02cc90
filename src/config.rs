//! Engine configuration.
//!
//! Settings live in the database so every process sharing a deployment sees
//! the same values. Unset keys fall back to the defaults below; unknown
//! keys are stored verbatim for forward compatibility.

/// Well-known configuration keys.
pub mod keys {
    /// Seconds a lease lives without a heartbeat before the job counts as
    /// stalled.
    pub const HEARTBEAT_TIMEOUT: &str = "heartbeat-timeout";
    /// Seconds a completed or canceled job is retained before purging.
    pub const JOBS_HISTORY: &str = "jobs-history";
    /// Maximum completed/canceled jobs retained; oldest evicted first.
    pub const JOBS_HISTORY_COUNT: &str = "jobs-history-count";
    /// Bucket count for wait/run histograms.
    pub const HISTOGRAM_BUCKETS: &str = "histogram-buckets";
}

/// Built-in defaults, applied when a key is unset.
#[derive(Debug, Clone, Copy)]
pub struct Defaults {
    pub heartbeat_timeout: i64,
    pub jobs_history: i64,
    pub jobs_history_count: i64,
    pub histogram_buckets: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            heartbeat_timeout: 60,
            jobs_history: 604_800, // 7 days
            jobs_history_count: 50_000,
            histogram_buckets: 32,
        }
    }
}

impl Defaults {
    /// Default value for a well-known key, if it has one.
    pub fn value_for(&self, key: &str) -> Option<String> {
        match key {
            keys::HEARTBEAT_TIMEOUT => Some(self.heartbeat_timeout.to_string()),
            keys::JOBS_HISTORY => Some(self.jobs_history.to_string()),
            keys::JOBS_HISTORY_COUNT => Some(self.jobs_history_count.to_string()),
            keys::HISTOGRAM_BUCKETS => Some(self.histogram_buckets.to_string()),
            _ => None,
        }
    }
}

/// Parse a stored config value as an integer, failing fast on garbage.
pub fn parse_int(key: &str, value: &str) -> crate::error::Result<i64> {
    value.trim().parse().map_err(|_| crate::error::Error::Config {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_well_known_keys() {
        let defaults = Defaults::default();
        assert_eq!(
            defaults.value_for(keys::HEARTBEAT_TIMEOUT).as_deref(),
            Some("60")
        );
        assert_eq!(
            defaults.value_for(keys::JOBS_HISTORY).as_deref(),
            Some("604800")
        );
        assert_eq!(defaults.value_for("no-such-key"), None);
    }

    #[test]
    fn parse_int_rejects_garbage() {
        assert_eq!(parse_int("heartbeat-timeout", " 90 ").unwrap(), 90);
        assert!(parse_int("heartbeat-timeout", "soon").is_err());
    }
}
