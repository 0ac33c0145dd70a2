//! Control plane interfaces.
//!
//! The proxy core does not decide policy on its own; a control plane does.
//! On every request an [`InstructionProvider`] returns either a `Forward`
//! command describing where and how to proxy, or a `Reply` that
//! short-circuits with a canned response. How instructions are produced
//! (scripts, config stores, remote services) is not the core's business.

pub mod command;
pub mod location;
pub mod ratelimit;

use async_trait::async_trait;
use url::Url;

use crate::error::GantryResult;
use crate::request::ProxyRequest;

pub use command::{Failover, Forward, Instruction, Reply, Upstream};
pub use location::{ControlLocation, ControlLocationOptions};
pub use ratelimit::{MemoryBackend, RateBackend, RateChecker};

/// Decides what to do with each request.
#[async_trait]
pub trait InstructionProvider: Send + Sync {
    async fn get_instructions(&self, req: &ProxyRequest) -> GantryResult<Instruction>;
}

/// Resolves a service name to the URLs of its instances.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn get(&self, name: &str) -> GantryResult<Vec<Url>>;
}

/// Adds the discovered instances of a service to a balancer, skipping the
/// ones already registered. Returns how many endpoints were added.
pub async fn seed_from_discovery(
    discovery: &dyn ServiceDiscovery,
    name: &str,
    weight: i32,
    balancer: &crate::loadbalance::RoundRobin,
) -> GantryResult<usize> {
    let urls = discovery.get(name).await?;
    let known: std::collections::HashSet<String> = balancer
        .endpoint_weights()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    let mut added = 0;
    for url in urls {
        let endpoint = crate::endpoint::Endpoint::new(url)?;
        if known.contains(endpoint.id()) {
            continue;
        }
        balancer.add_endpoint(std::sync::Arc::new(endpoint), weight)?;
        added += 1;
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadbalance::RoundRobin;
    use crate::timeutils::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    struct StaticDiscovery {
        urls: Vec<&'static str>,
    }

    #[async_trait]
    impl ServiceDiscovery for StaticDiscovery {
        async fn get(&self, _name: &str) -> GantryResult<Vec<Url>> {
            Ok(self.urls.iter().map(|u| Url::parse(u).unwrap()).collect())
        }
    }

    #[tokio::test]
    async fn test_seed_from_discovery_skips_known() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2014, 9, 1, 0, 0, 0).unwrap(),
        ));
        let balancer = RoundRobin::new(clock);
        let discovery = StaticDiscovery {
            urls: vec!["http://localhost:5000", "http://localhost:5001"],
        };

        let added = seed_from_discovery(&discovery, "api", 1, &balancer)
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(balancer.len(), 2);

        // A second sweep finds nothing new
        let added = seed_from_discovery(&discovery, "api", 1, &balancer)
            .await
            .unwrap();
        assert_eq!(added, 0);
        assert_eq!(balancer.len(), 2);
    }
}
