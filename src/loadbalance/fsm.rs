//! Weight-adjustment state machine.
//!
//! A tiny feedback controller that plays with endpoint weights to improve
//! the overall error rate and falls back if taking load off the bad
//! endpoints makes the situation worse. It cycles through four states:
//!
//! * `Start` — looks at the failure meters. When some endpoints fail
//!   significantly more than average, it boosts the good ones and goes
//!   probing; when everything is clean it walks altered weights back toward
//!   their originals.
//! * `Probing` — freezes for the probing period, then compares each probed
//!   endpoint's failure rate against its snapshot; any significant
//!   regression restores the previous weights.
//! * `Rollback` / `Revert` — cool-down after undoing or unwinding a change,
//!   so meters can accumulate fresh stats before the next experiment.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::error::{GantryError, GantryResult};
use crate::loadbalance::WeightedEndpoint;
use crate::timeutils::SharedClock;

/// Hard ceiling for any effective weight.
pub const FSM_MAX_WEIGHT: i32 = 4096;

/// Geometric step used when boosting or unwinding weights.
pub const FSM_GROW_FACTOR: i32 = 8;

/// Default time the machine freezes after changing weights to accumulate
/// stats.
pub fn default_probing_period() -> Duration {
    Duration::seconds(4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Start,
    Probing,
    Rollback,
    Revert,
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsmState::Start => write!(f, "START"),
            FsmState::Probing => write!(f, "PROBING"),
            FsmState::Rollback => write!(f, "ROLLBACK"),
            FsmState::Revert => write!(f, "REVERT"),
        }
    }
}

/// Weight change proposed by the state machine; applied by the balancer
/// under its own lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestedWeight {
    pub id: String,
    pub weight: i32,
}

// Probing changes endpoint weights and remembers where they were so it can
// go back in case of failure.
#[derive(Debug, Clone)]
struct ProbedEndpoint {
    id: String,
    weight_before: i32,
    fail_rate_before: f64,
}

pub struct FsmHandler {
    clock: SharedClock,
    // Freezes the state machine to accumulate stats after weight updates
    backoff: Duration,
    state: FsmState,
    timer: DateTime<Utc>,
    probed: Vec<ProbedEndpoint>,
}

impl FsmHandler {
    pub fn new(clock: SharedClock) -> Self {
        // Default probing period always passes validation
        Self::with_backoff(clock, default_probing_period()).unwrap()
    }

    pub fn with_backoff(clock: SharedClock, backoff: Duration) -> GantryResult<Self> {
        if backoff < Duration::seconds(1) {
            return Err(GantryError::config(
                "Supply some backoff duration >= 1 second",
            ));
        }
        let timer = clock.utc_now() - Duration::seconds(1);
        Ok(Self {
            clock,
            backoff,
            state: FsmState::Start,
            timer,
            probed: Vec::new(),
        })
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = FsmState::Start;
        self.timer = self.clock.utc_now() - Duration::seconds(1);
        self.probed.clear();
    }

    /// One adjustment step. May propose new effective weights for some
    /// endpoints; proposals are keyed by endpoint id.
    pub(crate) fn adjust_weights(
        &mut self,
        endpoints: &mut [WeightedEndpoint],
    ) -> Vec<SuggestedWeight> {
        if endpoints.len() < 2 {
            return Vec::new();
        }
        match self.state {
            FsmState::Start => self.on_start(endpoints),
            FsmState::Probing => self.on_probing(endpoints),
            FsmState::Rollback | FsmState::Revert => self.on_cooldown(),
        }
    }

    fn on_start(&mut self, endpoints: &mut [WeightedEndpoint]) -> Vec<SuggestedWeight> {
        let avg = avg_fail_rate(endpoints);

        if avg == 0.0 {
            // No errors, so walk previously altered weights back toward the
            // original state, in stages
            let suggestions: Vec<SuggestedWeight> = endpoints
                .iter()
                .filter(|e| e.effective_weight() != e.original_weight())
                .map(|e| SuggestedWeight {
                    id: e.id().to_string(),
                    weight: decrease(e.original_weight(), e.effective_weight()),
                })
                .collect();
            if !suggestions.is_empty() {
                self.set_timer();
                self.state = FsmState::Revert;
            }
            return suggestions;
        }

        info!("FSM(state={}) average fail rate {}", self.state, avg);
        if !endpoints.iter().all(|e| e.meter().is_ready()) {
            debug!("FSM(state={}) skip cycle, metrics are not ready yet", self.state);
            return Vec::new();
        }

        // Split endpoints by quality relative to the average
        let rates: Vec<f64> = endpoints.iter_mut().map(|e| e.fail_rate()).collect();
        let bad: Vec<usize> = (0..endpoints.len())
            .filter(|&i| greater(rates[i], avg))
            .collect();
        let good: Vec<usize> = (0..endpoints.len())
            .filter(|&i| !greater(rates[i], avg))
            .collect();
        if bad.is_empty() || good.is_empty() {
            debug!(
                "FSM(state={}) all endpoints have roughly the same error rate",
                self.state
            );
            return Vec::new();
        }

        // Boost the weight of the good endpoints and remember where they
        // were so the probe can be undone
        let mut suggestions = Vec::new();
        let mut probed = Vec::new();
        for &i in &good {
            let e = &endpoints[i];
            let next = increase(e.effective_weight());
            if next <= FSM_MAX_WEIGHT {
                info!(
                    "FSM(state={}) proposing weight of {} to {}",
                    self.state,
                    e.id(),
                    next
                );
                probed.push(ProbedEndpoint {
                    id: e.id().to_string(),
                    weight_before: e.effective_weight(),
                    fail_rate_before: rates[i],
                });
                suggestions.push(SuggestedWeight {
                    id: e.id().to_string(),
                    weight: next,
                });
            }
        }
        if !suggestions.is_empty() {
            self.state = FsmState::Probing;
            self.probed = probed;
            self.set_timer();
        }
        suggestions
    }

    fn on_probing(&mut self, endpoints: &mut [WeightedEndpoint]) -> Vec<SuggestedWeight> {
        if !self.timer_expired() {
            return Vec::new();
        }

        // Revise the probed endpoints and see if we made the situation worse
        let mut made_worse = false;
        for probe in &self.probed {
            if let Some(e) = endpoints.iter_mut().find(|e| e.id() == probe.id) {
                if greater(e.fail_rate(), probe.fail_rate_before) {
                    made_worse = true;
                    break;
                }
            }
        }

        if made_worse {
            info!(
                "FSM(state={}) probing made things worse, restoring weights",
                self.state
            );
            let suggestions = self
                .probed
                .iter()
                .map(|p| SuggestedWeight {
                    id: p.id.clone(),
                    weight: p.weight_before,
                })
                .collect();
            self.probed.clear();
            self.state = FsmState::Rollback;
            self.set_timer();
            return suggestions;
        }

        info!(
            "FSM(state={}) probing new rates was successful, committing",
            self.state
        );
        self.probed.clear();
        self.state = FsmState::Start;
        Vec::new()
    }

    fn on_cooldown(&mut self) -> Vec<SuggestedWeight> {
        if self.timer_expired() {
            debug!("FSM(state={}) timer expired", self.state);
            self.state = FsmState::Start;
        }
        Vec::new()
    }

    fn set_timer(&mut self) {
        self.timer = self.clock.utc_now() + self.backoff;
    }

    fn timer_expired(&self) -> bool {
        self.timer < self.clock.utc_now()
    }
}

impl std::fmt::Debug for FsmHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsmHandler")
            .field("state", &self.state)
            .field("probed", &self.probed.len())
            .finish()
    }
}

/// Compares two fail rates, neglecting insignificant differences.
fn greater(a: f64, b: f64) -> bool {
    (a * 10.0).floor() > (b * 10.0).ceil()
}

fn avg_fail_rate(endpoints: &mut [WeightedEndpoint]) -> f64 {
    if endpoints.is_empty() {
        return 0.0;
    }
    let total: f64 = endpoints.iter_mut().map(|e| e.fail_rate()).sum();
    total / endpoints.len() as f64
}

fn increase(weight: i32) -> i32 {
    weight * FSM_GROW_FACTOR
}

fn decrease(target: i32, current: i32) -> i32 {
    (current / FSM_GROW_FACTOR).max(target)
}
