//! Virtual destinations: a location bundles a load balancer, limiters,
//! timeouts and an outbound transport behind one `round_trip` call.

pub mod httploc;

use async_trait::async_trait;
use hyper::{Body, Response};

use crate::error::GantryResult;
use crate::request::ProxyRequest;

pub use httploc::{HttpLocation, HttpLocationOptions, Timeouts};

/// A location accepts a proxy request and produces a response or an error.
#[async_trait]
pub trait Location: Send + Sync {
    fn id(&self) -> &str;

    async fn round_trip(&self, req: &mut ProxyRequest) -> GantryResult<Response<Body>>;
}
