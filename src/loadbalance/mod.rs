//! Endpoint selection.
//!
//! The load balancer hands out endpoints for each request and watches the
//! outcome of every attempt through its [`Middleware::after`] hook, feeding
//! per-endpoint failure meters that drive the adaptive weight adjustment.

pub mod fsm;
pub mod roundrobin;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::endpoint::Endpoint;
use crate::error::{GantryError, GantryResult};
use crate::metrics::FailRateMeter;
use crate::middleware::Middleware;
use crate::request::{Attempt, ProxyRequest};

pub use fsm::{FsmHandler, FsmState, FSM_GROW_FACTOR, FSM_MAX_WEIGHT};
pub use roundrobin::{RoundRobin, RoundRobinOptions};

/// Picks the endpoint the next attempt goes to. Implementations also act as
/// middleware so they can observe attempt outcomes in `after`.
pub trait LoadBalancer: Middleware {
    fn next_endpoint(&self, req: &ProxyRequest) -> GantryResult<Arc<Endpoint>>;

    /// Feeds the attempt outcome to the meter of the endpoint it targeted.
    fn observe_response(&self, req: &ProxyRequest, attempt: &Attempt);
}

/// An endpoint plus its balancing state. The original weight is what the
/// operator configured and never changes; the effective weight is what
/// selection actually uses and is what the state machine plays with.
pub struct WeightedEndpoint {
    endpoint: Arc<Endpoint>,
    original_weight: i32,
    effective_weight: i32,
    disabled_until: Option<DateTime<Utc>>,
    meter: FailRateMeter,
}

impl WeightedEndpoint {
    pub(crate) fn new(
        endpoint: Arc<Endpoint>,
        weight: i32,
        meter: FailRateMeter,
    ) -> GantryResult<Self> {
        if weight < 1 {
            return Err(GantryError::config(format!(
                "Endpoint weight should be >= 1, got {}",
                weight
            )));
        }
        Ok(Self {
            endpoint,
            original_weight: weight,
            effective_weight: weight,
            disabled_until: None,
            meter,
        })
    }

    pub fn id(&self) -> &str {
        self.endpoint.id()
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn original_weight(&self) -> i32 {
        self.original_weight
    }

    pub fn effective_weight(&self) -> i32 {
        self.effective_weight
    }

    pub(crate) fn set_effective_weight(&mut self, weight: i32) {
        self.effective_weight = weight.clamp(0, fsm::FSM_MAX_WEIGHT);
    }

    /// Takes the endpoint out of rotation until the given instant.
    pub(crate) fn disable_until(&mut self, until: DateTime<Utc>) {
        self.disabled_until = Some(until);
    }

    pub fn is_disabled(&self, now: DateTime<Utc>) -> bool {
        match self.disabled_until {
            Some(until) => now < until,
            None => false,
        }
    }

    pub(crate) fn meter(&self) -> &FailRateMeter {
        &self.meter
    }

    pub(crate) fn meter_mut(&mut self) -> &mut FailRateMeter {
        &mut self.meter
    }

    /// Current failure rate of this endpoint.
    pub(crate) fn fail_rate(&mut self) -> f64 {
        self.meter.rate()
    }
}

impl std::fmt::Debug for WeightedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightedEndpoint")
            .field("id", &self.endpoint.id())
            .field("original_weight", &self.original_weight)
            .field("effective_weight", &self.effective_weight)
            .finish()
    }
}
