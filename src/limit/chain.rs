//! Composition of several limiters into one.

use std::sync::Arc;

use async_trait::async_trait;
use hyper::{Body, Response};

use crate::error::GantryResult;
use crate::limit::Limiter;
use crate::middleware::Middleware;
use crate::request::ProxyRequest;

/// Runs limiters in order on the way in and in reverse on the way out, so
/// the limiter that admitted last releases first. The first rejection wins;
/// limiters admitted before a rejection are rolled back.
pub struct LimiterChain {
    limiters: Vec<Arc<dyn Limiter>>,
}

impl LimiterChain {
    pub fn new(limiters: Vec<Arc<dyn Limiter>>) -> Self {
        Self { limiters }
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[async_trait]
impl Middleware for LimiterChain {
    async fn before(&self, req: &mut ProxyRequest) -> GantryResult<Option<Response<Body>>> {
        for (i, limiter) in self.limiters.iter().enumerate() {
            match limiter.before(req).await {
                Ok(None) => continue,
                Ok(Some(response)) => return Ok(Some(response)),
                Err(err) => {
                    // Release what earlier limiters already took
                    for admitted in self.limiters[..i].iter().rev() {
                        let _ = admitted.after(req).await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(None)
    }

    async fn after(&self, req: &mut ProxyRequest) -> GantryResult<()> {
        for limiter in self.limiters.iter().rev() {
            limiter.after(req).await?;
        }
        Ok(())
    }
}

impl Limiter for LimiterChain {}
