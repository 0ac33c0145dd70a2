pub mod config;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod failover;
pub mod limit;
pub mod loadbalance;
pub mod location;
pub mod metrics;
pub mod middleware;
pub mod netutils;
pub mod proxy;
pub mod rate;
pub mod request;
pub mod route;
pub mod timeutils;

// Re-export commonly used types
pub use endpoint::Endpoint;
pub use error::{ErrorFormatter, GantryError, GantryResult, HttpError, JsonFormatter};
pub use location::{HttpLocation, HttpLocationOptions, Location};
pub use proxy::{Proxy, ProxyOptions};
pub use rate::{Rate, UnitType};
pub use request::{Attempt, ProxyRequest};
pub use route::{ConstRouter, HostRouter, PathRouter, Router};
pub use timeutils::{ManualClock, RealTime, SharedClock, TimeProvider};
