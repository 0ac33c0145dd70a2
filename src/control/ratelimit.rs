//! Rate accounting against a pluggable counter backend.
//!
//! Unlike the in-process token buckets, these counters live in whatever
//! store the [`RateBackend`] wraps, so several proxies can share them. The
//! proxy only asks two questions: is this key over any of its rates, and
//! by when should the client retry.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::GantryResult;
use crate::rate::Rate;
use crate::timeutils::SharedClock;

/// Counter storage for rate accounting.
#[async_trait]
pub trait RateBackend: Send + Sync {
    /// Hits recorded for the key within the current bucket of the rate.
    async fn get_count(&self, key: &str, rate: &Rate) -> GantryResult<i64>;

    /// Adds hits to the key's current bucket.
    async fn update_count(&self, key: &str, rate: &Rate, amount: i64) -> GantryResult<()>;

    fn utc_now(&self) -> DateTime<Utc>;
}

/// Checks request admission across a `key -> [rate]` table.
pub struct RateChecker {
    backend: std::sync::Arc<dyn RateBackend>,
}

impl RateChecker {
    pub fn new(backend: std::sync::Arc<dyn RateBackend>) -> Self {
        Self { backend }
    }

    /// Returns 0 when all rates admit the request, otherwise the seconds
    /// until the first exhausted rate opens its next bucket.
    pub async fn retry_seconds(&self, rates: &HashMap<String, Vec<Rate>>) -> GantryResult<i64> {
        for (key, list) in rates {
            for rate in list {
                let counter = self.backend.get_count(key, rate).await?;
                if counter > rate.units {
                    debug!("key '{}' is out of capacity for {}", key, rate);
                    return Ok(rate.retry_seconds(self.backend.utc_now()));
                }
            }
        }
        Ok(0)
    }

    /// Posts this request's usage to every rate of every key. Counting
    /// happens before the request is forwarded, so admission is predictable
    /// under concurrency.
    pub async fn update_stats(
        &self,
        request_bytes: i64,
        rates: &HashMap<String, Vec<Rate>>,
    ) -> GantryResult<()> {
        for (key, list) in rates {
            for rate in list {
                self.backend
                    .update_count(key, rate, rate.amount_for(request_bytes))
                    .await?;
            }
        }
        Ok(())
    }
}

/// In-memory counter backend. Buckets are keyed by the rate period and the
/// bucket start, so expired buckets are simply never read again.
pub struct MemoryBackend {
    hits: Mutex<HashMap<String, i64>>,
    clock: SharedClock,
}

impl MemoryBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            hits: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn hit_key(&self, key: &str, rate: &Rate) -> String {
        format!(
            "{}_{}s_{}",
            key,
            rate.period_secs(),
            rate.current_bucket(self.clock.utc_now()).timestamp()
        )
    }
}

#[async_trait]
impl RateBackend for MemoryBackend {
    async fn get_count(&self, key: &str, rate: &Rate) -> GantryResult<i64> {
        let hits = self.hits.lock().unwrap();
        Ok(hits.get(&self.hit_key(key, rate)).copied().unwrap_or(0))
    }

    async fn update_count(&self, key: &str, rate: &Rate, amount: i64) -> GantryResult<()> {
        let mut hits = self.hits.lock().unwrap();
        *hits.entry(self.hit_key(key, rate)).or_insert(0) += amount;
        Ok(())
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.clock.utc_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeutils::ManualClock;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    fn checker() -> (RateChecker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2014, 8, 1, 0, 0, 0).unwrap(),
        ));
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        (RateChecker::new(backend), clock)
    }

    fn table(units: i64) -> HashMap<String, Vec<Rate>> {
        let mut rates = HashMap::new();
        rates.insert(
            "client-ip".to_string(),
            vec![Rate::per_period(units, StdDuration::from_secs(60)).unwrap()],
        );
        rates
    }

    #[tokio::test]
    async fn test_admits_until_over_capacity() {
        let (checker, _clock) = checker();
        let rates = table(1);

        assert_eq!(checker.retry_seconds(&rates).await.unwrap(), 0);
        checker.update_stats(0, &rates).await.unwrap();
        assert_eq!(checker.retry_seconds(&rates).await.unwrap(), 0);
        checker.update_stats(0, &rates).await.unwrap();

        // Counter is now past the limit; retry points at the next bucket
        let retry = checker.retry_seconds(&rates).await.unwrap();
        assert!(retry > 0 && retry <= 60);
    }

    #[tokio::test]
    async fn test_next_bucket_resets_counters() {
        let (checker, clock) = checker();
        let rates = table(1);

        checker.update_stats(0, &rates).await.unwrap();
        checker.update_stats(0, &rates).await.unwrap();
        assert!(checker.retry_seconds(&rates).await.unwrap() > 0);

        clock.advance(Duration::seconds(60));
        assert_eq!(checker.retry_seconds(&rates).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_kilobyte_rates_count_bytes() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2014, 8, 1, 0, 0, 0).unwrap(),
        ));
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        let checker = RateChecker::new(backend.clone());

        let mut rates = HashMap::new();
        let rate = Rate::new(
            10,
            StdDuration::from_secs(60),
            crate::rate::UnitType::Kilobytes,
        )
        .unwrap();
        rates.insert("acct".to_string(), vec![rate]);

        checker.update_stats(8 * 1024, &rates).await.unwrap();
        assert_eq!(backend.get_count("acct", &rate).await.unwrap(), 8);

        checker.update_stats(4 * 1024, &rates).await.unwrap();
        assert!(checker.retry_seconds(&rates).await.unwrap() > 0);
    }
}
