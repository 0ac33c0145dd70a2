//! Smooth weighted round-robin selection with adaptive reweighting.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hyper::{Body, Response};
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::{GantryError, GantryResult};
use crate::loadbalance::fsm::FsmHandler;
use crate::loadbalance::{LoadBalancer, WeightedEndpoint};
use crate::metrics::FailRateMeter;
use crate::middleware::Middleware;
use crate::request::{Attempt, ProxyRequest};
use crate::timeutils::SharedClock;

#[derive(Clone)]
pub struct RoundRobinOptions {
    pub clock: SharedClock,
    /// How long the state machine freezes after a weight change
    pub probing_period: Duration,
    /// Ring size of each endpoint's failure meter
    pub meter_buckets: usize,
    /// Bucket width of each endpoint's failure meter
    pub meter_resolution: Duration,
}

impl RoundRobinOptions {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            probing_period: crate::loadbalance::fsm::default_probing_period(),
            meter_buckets: 10,
            meter_resolution: Duration::seconds(1),
        }
    }
}

/// Weighted round-robin balancer.
///
/// Selection interleaves endpoints proportionally to their effective weight
/// without bursts to any one of them. The embedded state machine shifts
/// effective weights away from endpoints with significantly higher failure
/// rates and reverts on harm. Every mutation of the endpoint set resets the
/// selection cursor and the state machine.
pub struct RoundRobin {
    options: RoundRobinOptions,
    inner: Mutex<Inner>,
}

struct Inner {
    endpoints: Vec<WeightedEndpoint>,
    index: i64,
    current_weight: i32,
    cursor_dirty: bool,
    fsm: FsmHandler,
}

impl RoundRobin {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_options(RoundRobinOptions::new(clock))
    }

    pub fn with_options(options: RoundRobinOptions) -> Self {
        let fsm = FsmHandler::with_backoff(options.clock.clone(), options.probing_period)
            .unwrap_or_else(|_| FsmHandler::new(options.clock.clone()));
        Self {
            options,
            inner: Mutex::new(Inner {
                endpoints: Vec::new(),
                index: -1,
                current_weight: 0,
                cursor_dirty: false,
                fsm,
            }),
        }
    }

    /// Adds an endpoint with the given weight. Fails if the endpoint is
    /// already registered.
    pub fn add_endpoint(&self, endpoint: Arc<Endpoint>, weight: i32) -> GantryResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.endpoints.iter().any(|e| e.id() == endpoint.id()) {
            return Err(GantryError::config(format!(
                "Endpoint {} already exists",
                endpoint.id()
            )));
        }
        let meter = FailRateMeter::new(
            endpoint.id(),
            self.options.meter_buckets,
            self.options.meter_resolution,
            self.options.clock.clone(),
            None,
        )?;
        let weighted = WeightedEndpoint::new(endpoint, weight, meter)?;
        inner.endpoints.push(weighted);
        inner.reset_cursor();
        Ok(())
    }

    pub fn remove_endpoint(&self, id: &str) -> GantryResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .endpoints
            .iter()
            .position(|e| e.id() == id)
            .ok_or_else(|| GantryError::config(format!("Endpoint {} not found", id)))?;
        inner.endpoints.remove(pos);
        inner.reset_cursor();
        Ok(())
    }

    /// Changes the configured weight of an endpoint; the effective weight is
    /// reset along with it.
    pub fn update_endpoint_weight(&self, id: &str, weight: i32) -> GantryResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let meter = FailRateMeter::new(
            id,
            self.options.meter_buckets,
            self.options.meter_resolution,
            self.options.clock.clone(),
            None,
        )?;
        let pos = inner
            .endpoints
            .iter()
            .position(|e| e.id() == id)
            .ok_or_else(|| GantryError::config(format!("Endpoint {} not found", id)))?;
        let endpoint = Arc::clone(inner.endpoints[pos].endpoint());
        inner.endpoints[pos] = WeightedEndpoint::new(endpoint, weight, meter)?;
        inner.reset_cursor();
        Ok(())
    }

    /// Takes an endpoint out of rotation until the given instant.
    pub fn disable_endpoint_until(&self, id: &str, until: DateTime<Utc>) -> GantryResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner
            .endpoints
            .iter_mut()
            .find(|e| e.id() == id)
            .ok_or_else(|| GantryError::config(format!("Endpoint {} not found", id)))?;
        endpoint.disable_until(until);
        inner.reset_cursor();
        Ok(())
    }

    /// Effective weights keyed by endpoint id, in registration order.
    pub fn endpoint_weights(&self) -> Vec<(String, i32)> {
        let inner = self.inner.lock().unwrap();
        inner
            .endpoints
            .iter()
            .map(|e| (e.id().to_string(), e.effective_weight()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Middleware for RoundRobin {
    async fn before(&self, _req: &mut ProxyRequest) -> GantryResult<Option<Response<Body>>> {
        Ok(None)
    }

    async fn after(&self, req: &mut ProxyRequest) -> GantryResult<()> {
        if let Some(attempt) = req.last_attempt() {
            let attempt = attempt.clone();
            self.observe_response(req, &attempt);
        }
        Ok(())
    }
}

impl LoadBalancer for RoundRobin {
    fn next_endpoint(&self, req: &ProxyRequest) -> GantryResult<Arc<Endpoint>> {
        let now = self.options.clock.utc_now();
        let inner = &mut *self.inner.lock().unwrap();

        // Give the state machine a chance to shift weights between
        // selections
        let suggestions = inner.fsm.adjust_weights(&mut inner.endpoints);
        if !suggestions.is_empty() {
            for suggestion in suggestions {
                if let Some(e) = inner
                    .endpoints
                    .iter_mut()
                    .find(|e| e.id() == suggestion.id)
                {
                    debug!("adjusting weight of {} to {}", suggestion.id, suggestion.weight);
                    e.set_effective_weight(suggestion.weight);
                }
            }
            inner.cursor_dirty = true;
        }

        let chosen = inner.select(now)?;

        // Avoid immediately re-picking the endpoint the previous attempt
        // just failed on, when there is an alternative
        if let Some(last) = req.last_attempt() {
            if chosen.id() == last.endpoint.id() && inner.enabled_count(now) > 1 {
                return inner.select(now);
            }
        }
        Ok(chosen)
    }

    fn observe_response(&self, _req: &ProxyRequest, attempt: &Attempt) {
        let mut inner = self.inner.lock().unwrap();
        let id = attempt.endpoint.id().to_string();
        if let Some(e) = inner.endpoints.iter_mut().find(|e| e.id() == id) {
            e.meter_mut().record(attempt);
        }
    }
}

impl Inner {
    fn reset_cursor(&mut self) {
        self.index = -1;
        self.current_weight = 0;
        self.cursor_dirty = false;
        self.fsm.reset();
    }

    fn enabled_count(&self, now: DateTime<Utc>) -> usize {
        self.endpoints.iter().filter(|e| !e.is_disabled(now)).count()
    }

    fn select(&mut self, now: DateTime<Utc>) -> GantryResult<Arc<Endpoint>> {
        if self.endpoints.is_empty() {
            return Err(GantryError::no_endpoints("No endpoints registered"));
        }
        if self.enabled_count(now) == 0 {
            warn!("all endpoints are disabled");
            return Err(GantryError::no_endpoints("All endpoints are disabled"));
        }
        if self.cursor_dirty {
            self.index = -1;
            self.current_weight = 0;
            self.cursor_dirty = false;
        }

        let weights: Vec<i32> = self
            .endpoints
            .iter()
            .filter(|e| !e.is_disabled(now))
            .map(|e| e.effective_weight())
            .filter(|&w| w > 0)
            .collect();
        let max = weights.iter().copied().max().unwrap_or(0);
        if max == 0 {
            return Err(GantryError::no_endpoints("All endpoints have 0 weight"));
        }
        let step = weights.into_iter().fold(0, gcd);

        let n = self.endpoints.len() as i64;
        // A full sweep visits every endpoint at every weight level once;
        // anything beyond that means no endpoint can ever match
        let limit = n * (max as i64 / step as i64 + 2);
        for _ in 0..limit {
            self.index = (self.index + 1) % n;
            if self.index == 0 {
                self.current_weight -= step;
                if self.current_weight <= 0 {
                    self.current_weight = max;
                }
            }
            let e = &self.endpoints[self.index as usize];
            if !e.is_disabled(now) && e.effective_weight() >= self.current_weight {
                return Ok(Arc::clone(e.endpoint()));
            }
        }
        Err(GantryError::internal(
            "round robin failed to converge on an endpoint",
        ))
    }
}

fn gcd(a: i32, b: i32) -> i32 {
    if a == 0 {
        return b;
    }
    gcd(b % a, a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::testutil;
    use crate::timeutils::{ManualClock, TimeProvider};
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2014, 6, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn endpoint(port: u16) -> Arc<Endpoint> {
        Arc::new(Endpoint::from_str(&format!("http://localhost:{}", port)).unwrap())
    }

    fn balancer(clock: Arc<ManualClock>, weights: &[(u16, i32)]) -> RoundRobin {
        let rr = RoundRobin::new(clock);
        for &(port, weight) in weights {
            rr.add_endpoint(endpoint(port), weight).unwrap();
        }
        rr
    }

    async fn tally(rr: &RoundRobin, picks: usize) -> HashMap<String, usize> {
        let req = testutil::get("http://proxy/", "1.2.3.4:1000").await;
        let mut counts = HashMap::new();
        for _ in 0..picks {
            let e = rr.next_endpoint(&req).unwrap();
            *counts.entry(e.id().to_string()).or_insert(0) += 1;
        }
        counts
    }

    #[tokio::test]
    async fn test_equal_weights_are_fair() {
        let rr = balancer(clock(), &[(5000, 1), (5001, 1), (5002, 1)]);
        let counts = tally(&rr, 9).await;
        for port in [5000, 5001, 5002] {
            assert_eq!(counts[&format!("http://localhost:{}", port)], 3);
        }
    }

    #[tokio::test]
    async fn test_selection_proportional_to_weight() {
        let rr = balancer(clock(), &[(5000, 1), (5001, 2), (5002, 3)]);
        let counts = tally(&rr, 6).await;
        assert_eq!(counts[&"http://localhost:5000".to_string()], 1);
        assert_eq!(counts[&"http://localhost:5001".to_string()], 2);
        assert_eq!(counts[&"http://localhost:5002".to_string()], 3);
    }

    #[tokio::test]
    async fn test_no_endpoints() {
        let rr = RoundRobin::new(clock());
        let req = testutil::get("http://proxy/", "1.2.3.4:1000").await;
        assert!(matches!(
            rr.next_endpoint(&req),
            Err(GantryError::NoEndpoints { .. })
        ));
    }

    #[tokio::test]
    async fn test_all_disabled() {
        let c = clock();
        let rr = balancer(c.clone(), &[(5000, 1)]);
        rr.disable_endpoint_until("http://localhost:5000", c.utc_now() + Duration::seconds(60))
            .unwrap();
        let req = testutil::get("http://proxy/", "1.2.3.4:1000").await;
        assert!(rr.next_endpoint(&req).is_err());

        // Endpoint comes back after the disable window elapses
        c.advance(Duration::seconds(61));
        assert!(rr.next_endpoint(&req).is_ok());
    }

    #[tokio::test]
    async fn test_mutation_resets_cursor() {
        let rr = balancer(clock(), &[(5000, 1), (5001, 1)]);
        let req = testutil::get("http://proxy/", "1.2.3.4:1000").await;

        let first = rr.next_endpoint(&req).unwrap().id().to_string();
        let _ = rr.next_endpoint(&req).unwrap();

        // Adding an endpoint rewinds selection to the start of the cycle
        rr.add_endpoint(endpoint(5002), 1).unwrap();
        let after_mutation = rr.next_endpoint(&req).unwrap().id().to_string();
        assert_eq!(first, after_mutation);
    }

    #[tokio::test]
    async fn test_two_adds_without_selection_equal_one() {
        let req = testutil::get("http://proxy/", "1.2.3.4:1000").await;

        let a = balancer(clock(), &[(5000, 1), (5001, 1)]);
        let b = balancer(clock(), &[(5000, 1)]);
        b.add_endpoint(endpoint(5001), 1).unwrap();

        // Cursor state is indistinguishable: the selection sequences match
        for _ in 0..4 {
            assert_eq!(
                a.next_endpoint(&req).unwrap().id(),
                b.next_endpoint(&req).unwrap().id()
            );
        }
    }

    #[tokio::test]
    async fn test_avoids_repicking_failed_endpoint() {
        let rr = balancer(clock(), &[(5000, 1), (5001, 1)]);
        let mut req = testutil::get("http://proxy/", "1.2.3.4:1000").await;

        // A fresh cursor would pick 5000 first, but the previous attempt
        // already failed there, so one extra pick moves selection along
        req.add_attempt(Attempt {
            endpoint: endpoint(5000),
            duration: std::time::Duration::from_millis(1),
            status: None,
            error: Some(GantryError::network("connection refused")),
        });
        let second = rr.next_endpoint(&req).unwrap();
        assert_eq!(second.id(), "http://localhost:5001");
    }

    #[tokio::test]
    async fn test_update_weight_resets_effective() {
        let rr = balancer(clock(), &[(5000, 1), (5001, 1)]);
        rr.update_endpoint_weight("http://localhost:5001", 3).unwrap();
        let weights: HashMap<_, _> = rr.endpoint_weights().into_iter().collect();
        assert_eq!(weights[&"http://localhost:5001".to_string()], 3);
    }

    #[tokio::test]
    async fn test_remove_endpoint() {
        let rr = balancer(clock(), &[(5000, 1), (5001, 1)]);
        rr.remove_endpoint("http://localhost:5000").unwrap();
        assert_eq!(rr.len(), 1);
        assert!(rr.remove_endpoint("http://localhost:5000").is_err());

        let counts = tally(&rr, 3).await;
        assert_eq!(counts[&"http://localhost:5001".to_string()], 3);
    }
}
