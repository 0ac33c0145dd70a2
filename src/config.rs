//! File configuration.
//!
//! The proxy is usually assembled programmatically, but deployments that
//! want a static setup can describe the router, locations, upstream weights
//! and limits in TOML and get a ready [`Proxy`] out of [`Config::build`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::endpoint::Endpoint;
use crate::error::GantryResult;
use crate::failover;
use crate::limit::{
    ConnectionLimiter, Limiter, LimiterChain, TokenLimiter, TokenLimiterSettings,
};
use crate::loadbalance::RoundRobin;
use crate::location::{HttpLocation, HttpLocationOptions, Timeouts};
use crate::proxy::Proxy;
use crate::rate::Rate;
use crate::route::PathRouter;
use crate::timeutils::SharedClock;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address, e.g. "127.0.0.1:8080"
    pub bind: String,
    /// Reported in X-Forwarded-Server; the local host name when omitted
    #[serde(default)]
    pub hostname: String,
    /// Append to client-supplied X-Forwarded-For instead of replacing
    #[serde(default)]
    pub trust_forward_header: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocationConfig {
    pub name: String,
    /// Path pattern, a regular expression
    pub path: String,
    pub upstreams: Vec<UpstreamConfig>,
    pub limits: Option<LimitsConfig>,
    pub timeouts: Option<TimeoutsConfig>,
    pub failover: Option<FailoverConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    pub rate: Option<RateLimitConfig>,
    pub max_connections: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub requests: i64,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_burst")]
    pub burst: i64,
    /// Limiting variable: "client.ip", "request.host" or
    /// "request.header.<Name>"
    #[serde(default = "default_limit_by")]
    pub by: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_timeout_secs")]
    pub dial_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub response_header_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FailoverConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Response codes that trigger failover in addition to network errors
    #[serde(default)]
    pub codes: Vec<u16>,
}

fn default_weight() -> i32 {
    1
}

fn default_period_secs() -> u64 {
    1
}

fn default_burst() -> i64 {
    1
}

fn default_limit_by() -> String {
    "client.ip".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> usize {
    2
}

impl Config {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {:?}", path.as_ref()))?;
        let config = Self::from_str(&content)?;
        info!("configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("invalid bind address '{}': {}", self.server.bind, e))?;

        if self.locations.is_empty() {
            return Err(anyhow!("at least one location must be configured"));
        }
        for location in &self.locations {
            if location.name.is_empty() {
                return Err(anyhow!("location without a name"));
            }
            if location.upstreams.is_empty() {
                return Err(anyhow!(
                    "location '{}' needs at least one upstream",
                    location.name
                ));
            }
            for upstream in &location.upstreams {
                Endpoint::from_str(&upstream.url).map_err(|e| {
                    anyhow!("location '{}' upstream: {}", location.name, e)
                })?;
                if upstream.weight < 1 {
                    return Err(anyhow!(
                        "location '{}': upstream weight should be >= 1",
                        location.name
                    ));
                }
            }
            if let Some(limits) = &location.limits {
                if let Some(rate) = &limits.rate {
                    Rate::per_period(rate.requests, Duration::from_secs(rate.period_secs))
                        .map_err(|e| anyhow!("location '{}': {}", location.name, e))?;
                }
                if let Some(max) = limits.max_connections {
                    if max < 1 {
                        return Err(anyhow!(
                            "location '{}': max_connections should be >= 1",
                            location.name
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Assembles the proxy: one location per entry, path-routed, each with
    /// its own balancer, limiter chain and transport.
    pub fn build(&self, clock: SharedClock) -> GantryResult<Proxy> {
        let router = Arc::new(PathRouter::new());
        for location in &self.locations {
            let built = location.build(&self.server, clock.clone())?;
            router.add_location(&location.path, built)?;
        }
        Ok(Proxy::new(router))
    }
}

impl LocationConfig {
    fn build(
        &self,
        server: &ServerConfig,
        clock: SharedClock,
    ) -> GantryResult<Arc<HttpLocation>> {
        let balancer = Arc::new(RoundRobin::new(clock.clone()));
        for upstream in &self.upstreams {
            balancer.add_endpoint(
                Arc::new(Endpoint::from_str(&upstream.url)?),
                upstream.weight,
            )?;
        }

        let limiter = self.build_limiter(clock.clone())?;
        let timeouts = match &self.timeouts {
            Some(t) => Timeouts {
                dial: Duration::from_secs(t.dial_secs),
                response_header: Duration::from_secs(t.response_header_secs),
            },
            None => Timeouts::default(),
        };
        let should_failover = self.failover.as_ref().map(|f| {
            failover::and(vec![
                failover::max_attempts(f.max_attempts),
                failover::or(vec![
                    failover::on_errors(),
                    failover::response_code_is(f.codes.clone()),
                ]),
            ])
        });

        let options = HttpLocationOptions {
            timeouts,
            should_failover,
            limiter,
            hostname: server.hostname.clone(),
            trust_forward_header: server.trust_forward_header,
            clock,
        };
        Ok(Arc::new(HttpLocation::with_options(
            &self.name, balancer, options,
        )))
    }

    fn build_limiter(&self, clock: SharedClock) -> GantryResult<Option<Arc<dyn Limiter>>> {
        let limits = match &self.limits {
            Some(limits) => limits,
            None => return Ok(None),
        };
        let mut chain: Vec<Arc<dyn Limiter>> = Vec::new();
        if let Some(rate) = &limits.rate {
            let mapper = crate::limit::mapper_from_variable(&rate.by)?;
            let settings = TokenLimiterSettings::new(
                Rate::per_period(rate.requests, Duration::from_secs(rate.period_secs))?,
                clock,
            )
            .max_burst(rate.burst);
            chain.push(Arc::new(TokenLimiter::new(mapper, settings)?));
        }
        if let Some(max) = limits.max_connections {
            chain.push(Arc::new(ConnectionLimiter::client_ip(max)?));
        }
        Ok(match chain.len() {
            0 => None,
            1 => Some(chain.into_iter().next().unwrap()),
            _ => Some(Arc::new(LimiterChain::new(chain))),
        })
    }
}
