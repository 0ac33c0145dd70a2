//! Token bucket rate limiting
//! (<http://en.wikipedia.org/wiki/Token_bucket>) and the request limiter
//! built on it.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hyper::{Body, Response};
use tracing::debug;

use crate::error::{GantryError, GantryResult};
use crate::limit::ttlmap::TtlMap;
use crate::limit::{Limiter, MapperFn};
use crate::middleware::Middleware;
use crate::rate::Rate;
use crate::request::ProxyRequest;
use crate::timeutils::SharedClock;

/// Default bound on the number of tracked keys.
pub const DEFAULT_CAPACITY: usize = 32768;

/// Per-key token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    // Maximum amount of tokens available at a given time (controls burst)
    max_tokens: i64,
    // Time to produce one token
    refill_period: Duration,
    tokens: i64,
    last_refill: DateTime<Utc>,
    clock: SharedClock,
}

impl TokenBucket {
    pub fn new(rate: Rate, max_burst: i64, clock: SharedClock) -> GantryResult<Self> {
        if max_burst <= 0 {
            return Err(GantryError::config("Max burst should be >= 1"));
        }
        let refill_period = Duration::nanoseconds((rate.period.as_nanos() as i64) / rate.units);
        Ok(Self {
            max_tokens: max_burst,
            refill_period,
            tokens: max_burst,
            last_refill: clock.utc_now(),
            clock,
        })
    }

    /// Tries to take `tokens` from the bucket.
    ///
    /// Returns zero when the tokens were consumed, or the duration to wait
    /// until enough tokens accumulate, in which case nothing is consumed and
    /// the caller decides whether to wait or reject. Asking for more than
    /// the bucket can ever hold fails with `OverCapacity`.
    pub fn consume(&mut self, tokens: i64) -> GantryResult<Duration> {
        self.refill();
        if tokens > self.max_tokens {
            return Err(GantryError::OverCapacity);
        }
        if self.tokens < tokens {
            return Ok(self.time_to_refill(tokens));
        }
        self.tokens -= tokens;
        Ok(Duration::zero())
    }

    pub fn tokens(&self) -> i64 {
        self.tokens
    }

    fn time_to_refill(&self, tokens: i64) -> Duration {
        let missing = tokens - self.tokens;
        self.refill_period * missing as i32
    }

    fn refill(&mut self) {
        let now = self.clock.utc_now();
        if now < self.last_refill {
            // Clock went backwards; never drain tokens from here
            self.last_refill = now;
            return;
        }
        let elapsed = now - self.last_refill;
        let new_tokens = elapsed.num_nanoseconds().unwrap_or(0)
            / self.refill_period.num_nanoseconds().unwrap_or(1).max(1);
        self.tokens = (self.tokens + new_tokens).min(self.max_tokens);
        self.last_refill = now;
    }
}

/// Settings for [`TokenLimiter`].
#[derive(Clone)]
pub struct TokenLimiterSettings {
    /// Average allowed rate
    pub rate: Rate,
    /// Maximum burst size
    pub max_burst: i64,
    /// Overall bound on simultaneously tracked keys
    pub capacity: usize,
    pub clock: SharedClock,
}

impl TokenLimiterSettings {
    pub fn new(rate: Rate, clock: SharedClock) -> Self {
        Self {
            rate,
            max_burst: 1,
            capacity: DEFAULT_CAPACITY,
            clock,
        }
    }

    pub fn max_burst(mut self, max_burst: i64) -> Self {
        self.max_burst = max_burst;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Rate limiter keeping one token bucket per mapped key in a TTL map.
pub struct TokenLimiter {
    settings: TokenLimiterSettings,
    mapper: MapperFn,
    buckets: Mutex<TtlMap<TokenBucket>>,
}

impl TokenLimiter {
    pub fn new(mapper: MapperFn, settings: TokenLimiterSettings) -> GantryResult<Self> {
        if settings.max_burst <= 0 {
            return Err(GantryError::config("Max burst should be >= 1"));
        }
        let buckets = TtlMap::new(settings.capacity, settings.clock.clone())?;
        Ok(Self {
            settings,
            mapper,
            buckets: Mutex::new(buckets),
        })
    }

    /// Limits request rate per client IP.
    pub fn client_ip(settings: TokenLimiterSettings) -> GantryResult<Self> {
        Self::new(crate::limit::map_client_ip(), settings)
    }

    /// Counters for a key expire after ten rate periods of inactivity, e.g.
    /// a 100 req/second limit forgets an ip after 10 seconds of silence.
    fn bucket_ttl_seconds(&self) -> i64 {
        self.settings.rate.period_secs() * 10 + 1
    }
}

#[async_trait]
impl Middleware for TokenLimiter {
    async fn before(&self, req: &mut ProxyRequest) -> GantryResult<Option<Response<Body>>> {
        let (key, amount) = (self.mapper)(req)?;

        let mut buckets = self.buckets.lock().unwrap();
        if buckets.get_mut(&key).is_none() {
            let bucket = TokenBucket::new(
                self.settings.rate,
                self.settings.max_burst,
                self.settings.clock.clone(),
            )?;
            buckets.set(&key, bucket, self.bucket_ttl_seconds())?;
        }
        let bucket = buckets
            .get_mut(&key)
            .ok_or_else(|| GantryError::internal("bucket vanished during acquisition"))?;

        let delay = bucket.consume(amount)?;
        if delay > Duration::zero() {
            debug!("request {} rate limited on key '{}'", req.id(), key);
            return Err(GantryError::RateLimited {
                message: format!("retry in {}", delay),
                retry_seconds: Some(delay.num_seconds().max(1)),
            });
        }
        Ok(None)
    }

    async fn after(&self, _req: &mut ProxyRequest) -> GantryResult<()> {
        Ok(())
    }
}

impl Limiter for TokenLimiter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::testutil;
    use crate::timeutils::ManualClock;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2014, 4, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn one_per_second(clock: Arc<ManualClock>, burst: i64) -> TokenBucket {
        TokenBucket::new(
            Rate::per_period(1, StdDuration::from_secs(1)).unwrap(),
            burst,
            clock,
        )
        .unwrap()
    }

    #[test]
    fn test_consume_within_burst() {
        let c = clock();
        let mut bucket = one_per_second(c.clone(), 3);
        for _ in 0..3 {
            assert_eq!(bucket.consume(1).unwrap(), Duration::zero());
        }
        // Bucket is drained, the next consume reports the wait
        let delay = bucket.consume(1).unwrap();
        assert_eq!(delay, Duration::seconds(1));
        // And nothing was taken
        assert_eq!(bucket.tokens(), 0);
    }

    #[test]
    fn test_over_capacity() {
        let c = clock();
        let mut bucket = one_per_second(c, 3);
        assert!(matches!(
            bucket.consume(4),
            Err(GantryError::OverCapacity)
        ));
    }

    #[test]
    fn test_refill_caps_at_max() {
        let c = clock();
        let mut bucket = one_per_second(c.clone(), 2);
        assert_eq!(bucket.consume(2).unwrap(), Duration::zero());

        // A long time passes; tokens never exceed the burst
        c.advance(Duration::seconds(100));
        assert_eq!(bucket.consume(1).unwrap(), Duration::zero());
        assert_eq!(bucket.tokens(), 1);
    }

    #[test]
    fn test_refill_is_monotonic_under_clock_skew() {
        let c = clock();
        let mut bucket = one_per_second(c.clone(), 1);
        assert_eq!(bucket.consume(1).unwrap(), Duration::zero());

        // Clock jumps backwards; the bucket neither gains nor loses
        c.advance(Duration::seconds(-30));
        bucket.refill();
        assert_eq!(bucket.tokens(), 0);

        // Once the clock moves forward again, refill resumes
        c.advance(Duration::seconds(1));
        assert_eq!(bucket.consume(1).unwrap(), Duration::zero());
    }

    #[tokio::test]
    async fn test_token_limiter_rejects_after_burst() {
        let c = clock();
        let settings = TokenLimiterSettings::new(
            Rate::per_period(1, StdDuration::from_secs(1)).unwrap(),
            c.clone(),
        );
        let limiter = TokenLimiter::client_ip(settings).unwrap();

        let mut req = testutil::get("http://proxy/", "1.2.3.4:1000").await;
        assert!(limiter.before(&mut req).await.unwrap().is_none());

        // Same second, same ip: rejected with a retry hint
        match limiter.before(&mut req).await {
            Err(GantryError::RateLimited { retry_seconds, .. }) => {
                assert_eq!(retry_seconds, Some(1));
            }
            other => panic!("expected RateLimited, got {:?}", other.map(|_| ())),
        }

        // A different ip is unaffected
        let mut other = testutil::get("http://proxy/", "5.6.7.8:1000").await;
        assert!(limiter.before(&mut other).await.unwrap().is_none());

        // One second later the first ip is admitted again
        c.advance(Duration::seconds(1));
        assert!(limiter.before(&mut req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_token_limiter_amount_larger_than_burst() {
        let c = clock();
        let settings = TokenLimiterSettings::new(
            Rate::per_period(10, StdDuration::from_secs(1)).unwrap(),
            c.clone(),
        )
        .max_burst(1);
        // Bandwidth-style mapper: consume body bytes
        let limiter =
            TokenLimiter::new(crate::limit::map_client_ip_bytes(), settings).unwrap();

        let mut req = testutil::request(
            hyper::Method::POST,
            "http://proxy/",
            "1.2.3.4:1000",
            "four bytes or more",
        )
        .await;
        assert!(matches!(
            limiter.before(&mut req).await,
            Err(GantryError::OverCapacity)
        ));
    }
}
