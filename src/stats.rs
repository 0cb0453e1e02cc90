//! Wait-time and run-time aggregates.
//!
//! Distributions update incrementally (Welford) so a bucket never needs the
//! raw samples back. Stored as JSON per queue per day alongside plain
//! failure/retry counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds in a day; stats buckets are keyed by UTC day.
const DAY_SECONDS: i64 = 86_400;

/// Truncate a timestamp to its UTC day (unix seconds at midnight).
pub fn day_of(at: DateTime<Utc>) -> i64 {
    let ts = at.timestamp();
    ts - ts.rem_euclid(DAY_SECONDS)
}

/// Incremental duration distribution: count, mean, variance, and a
/// geometric histogram (power-of-two second buckets, so second-scale
/// durations resolve finely and day-scale ones coarsely).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deviations (Welford's M2). Variance = m2 / count.
    pub m2: f64,
    pub histogram: Vec<u64>,
}

impl Distribution {
    pub fn new(buckets: usize) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            histogram: vec![0; buckets.max(1)],
        }
    }

    /// Record one duration sample, in seconds.
    pub fn record(&mut self, seconds: f64) {
        let seconds = seconds.max(0.0);
        self.count += 1;
        let delta = seconds - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (seconds - self.mean);

        let bucket = Self::bucket_of(seconds).min(self.histogram.len() - 1);
        self.histogram[bucket] += 1;
    }

    /// Population variance of the recorded samples.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Bucket index for a duration: floor(log2(1 + whole seconds)).
    fn bucket_of(seconds: f64) -> usize {
        (1u64 + seconds as u64).ilog2() as usize
    }
}

/// Stats for one queue on one day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    /// Unix seconds at the UTC midnight this row covers.
    pub day: i64,
    /// Put-to-pop durations.
    pub wait: Distribution,
    /// Pop-to-complete durations.
    pub run: Distribution,
    /// Jobs failed this day (explicit fails and exhausted retries).
    pub failed: u64,
    /// Retries consumed this day (stall drops and retry calls).
    pub retries: u64,
}

impl QueueStats {
    pub fn empty(queue: impl Into<String>, day: i64, buckets: usize) -> Self {
        Self {
            queue: queue.into(),
            day,
            wait: Distribution::new(buckets),
            run: Distribution::new(buckets),
            failed: 0,
            retries: 0,
        }
    }
}
