//! Rolling-window failure ratio for one endpoint.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::{GantryError, GantryResult};
use crate::request::Attempt;
use crate::timeutils::SharedClock;

/// Predicate that decides if the attempt resulted in an error.
pub type FailPredicate = Arc<dyn Fn(&Attempt) -> bool + Send + Sync>;

/// Default predicate: the attempt carried a transport error.
pub fn is_network_error(attempt: &Attempt) -> bool {
    attempt.error.is_some()
}

/// Calculates the in-memory failure rate of an endpoint over a fixed ring of
/// time buckets. A bucket covers `resolution` of wall-clock time; buckets
/// that fall out of the `buckets * resolution` window are zeroed before they
/// are read or written, so after long inactivity the rate decays to 0.
pub struct FailRateMeter {
    endpoint_id: String,
    buckets: usize,
    resolution: Duration,
    success: Vec<u32>,
    failure: Vec<u32>,
    is_failure: FailPredicate,
    clock: SharedClock,
    last_updated: Option<DateTime<Utc>>,
    // how many samples in different buckets have we collected so far
    counted_buckets: usize,
    // last recorded bucket
    last_bucket: i64,
}

impl FailRateMeter {
    pub fn new(
        endpoint_id: &str,
        buckets: usize,
        resolution: Duration,
        clock: SharedClock,
        is_failure: Option<FailPredicate>,
    ) -> GantryResult<Self> {
        if buckets < 1 {
            return Err(GantryError::config("Buckets should be >= 1"));
        }
        if resolution < Duration::seconds(1) {
            return Err(GantryError::config(
                "Resolution should be larger than a second",
            ));
        }
        if endpoint_id.is_empty() {
            return Err(GantryError::config("Select an endpoint"));
        }
        Ok(Self {
            endpoint_id: endpoint_id.to_string(),
            buckets,
            resolution,
            success: vec![0; buckets],
            failure: vec![0; buckets],
            is_failure: is_failure.unwrap_or_else(|| Arc::new(is_network_error)),
            clock,
            last_updated: None,
            counted_buckets: 0,
            last_bucket: -1,
        })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// True once observations have touched `buckets` distinct buckets over
    /// the lifetime of the meter.
    pub fn is_ready(&self) -> bool {
        self.counted_buckets >= self.buckets
    }

    pub fn reset(&mut self) {
        self.last_bucket = -1;
        self.counted_buckets = 0;
        self.last_updated = None;
        self.success.iter_mut().for_each(|v| *v = 0);
        self.failure.iter_mut().for_each(|v| *v = 0);
    }

    /// Feeds one attempt into the meter. Attempts against other endpoints
    /// are ignored.
    pub fn record(&mut self, attempt: &Attempt) {
        if attempt.endpoint.id() != self.endpoint_id {
            return;
        }
        self.cleanup();

        let now = self.clock.utc_now();
        let bucket = self.bucket(now);
        if (self.is_failure)(attempt) {
            self.failure[bucket] += 1;
        } else {
            self.success[bucket] += 1;
        }
        self.last_updated = Some(now);
        // update usage stats if we haven't collected enough
        if !self.is_ready() && self.last_bucket != bucket as i64 {
            self.last_bucket = bucket as i64;
            self.counted_buckets += 1;
        }
    }

    /// Failure ratio over the window, in `[0, 1]`. Returns 0 when there are
    /// no samples.
    pub fn rate(&mut self) -> f64 {
        // Drop the data that was here in case the endpoint has been
        // inactive for some time
        self.cleanup();

        let success: u64 = self.success.iter().map(|&v| v as u64).sum();
        let failure: u64 = self.failure.iter().map(|&v| v as u64).sum();
        if success + failure == 0 {
            return 0.0;
        }
        failure as f64 / (success + failure) as f64
    }

    fn resolution_secs(&self) -> i64 {
        self.resolution.num_seconds()
    }

    /// Ring slot for the given instant: `floor(t / resolution) mod buckets`.
    fn bucket(&self, t: DateTime<Utc>) -> usize {
        let periods = t.timestamp().div_euclid(self.resolution_secs());
        periods.rem_euclid(self.buckets as i64) as usize
    }

    fn truncate(&self, t: DateTime<Utc>) -> i64 {
        t.timestamp().div_euclid(self.resolution_secs())
    }

    /// Zeroes buckets that were not updated within the window.
    fn cleanup(&mut self) {
        let last_updated = match self.last_updated {
            Some(t) => t,
            None => return,
        };
        let now = self.clock.utc_now();
        let window = self.resolution * self.buckets as i32;
        if now - last_updated >= window {
            self.success.iter_mut().for_each(|v| *v = 0);
            self.failure.iter_mut().for_each(|v| *v = 0);
            return;
        }
        for i in 0..self.buckets {
            let t = now - self.resolution * i as i32;
            if self.truncate(t) > self.truncate(last_updated) {
                let bucket = self.bucket(t);
                self.success[bucket] = 0;
                self.failure[bucket] = 0;
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for FailRateMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailRateMeter")
            .field("endpoint_id", &self.endpoint_id)
            .field("buckets", &self.buckets)
            .field("counted_buckets", &self.counted_buckets)
            .finish()
    }
}
