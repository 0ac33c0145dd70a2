//! Request lifecycle hooks.
//!
//! A [`Middleware`] sees the request on its way in (`before`) and on its way
//! out (`after`). `before` runs ahead of the upstream round trip and may
//! short-circuit by returning a response; `after` runs once an attempt has
//! been recorded and may veto the response by returning an error. After
//! hooks run in the exact reverse of the before order, symmetric around the
//! transport call.

pub mod chain;

use async_trait::async_trait;
use hyper::{Body, Response};

use crate::error::GantryResult;
use crate::request::{Attempt, ProxyRequest};

pub use chain::{MiddlewareChain, ObserverChain};

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Called before the request is proxied to the endpoint selected by the
    /// load balancer.
    ///
    /// Returning an error rejects the request. Returning a response streams
    /// that response to the client without proxying to any upstream.
    /// Returning `Ok(None)` lets the request proceed. Mutating request
    /// headers here is fine.
    async fn before(&self, req: &mut ProxyRequest) -> GantryResult<Option<Response<Body>>>;

    /// Called right after an upstream attempt has completed and been
    /// recorded. An error returned here is streamed to the client instead of
    /// the response and no further after hooks run.
    async fn after(&self, req: &mut ProxyRequest) -> GantryResult<()>;
}

/// Passive watcher of the request lifecycle; never affects the outcome.
pub trait Observer: Send + Sync {
    fn observe_request(&self, req: &ProxyRequest);
    fn observe_response(&self, req: &ProxyRequest, attempt: &Attempt);
}

/// A middleware that does nothing. Useful as a chain placeholder in tests
/// and as a default hook.
#[derive(Debug, Default)]
pub struct NoopMiddleware;

#[async_trait]
impl Middleware for NoopMiddleware {
    async fn before(&self, _req: &mut ProxyRequest) -> GantryResult<Option<Response<Body>>> {
        Ok(None)
    }

    async fn after(&self, _req: &mut ProxyRequest) -> GantryResult<()> {
        Ok(())
    }
}
