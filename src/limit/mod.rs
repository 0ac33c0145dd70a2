//! Request limiting: token-bucket rate limits and in-flight connection caps.
//!
//! A limiter is a [`Middleware`]: `before` admits or rejects the request,
//! `after` releases whatever `before` took. Requests are attributed to a
//! limiting key by a [`MapperFn`], e.g. client IP -> 1 request, or client
//! IP -> body bytes.

pub mod chain;
pub mod connlimit;
pub mod tokenbucket;
pub mod ttlmap;

use std::sync::Arc;

use crate::error::{GantryError, GantryResult};
use crate::middleware::Middleware;
use crate::request::ProxyRequest;

pub use chain::LimiterChain;
pub use connlimit::ConnectionLimiter;
pub use tokenbucket::{TokenBucket, TokenLimiter, TokenLimiterSettings};
pub use ttlmap::TtlMap;

/// Marker for middlewares that limit requests.
pub trait Limiter: Middleware {}

/// Maps a request to the limiting key and the amount of units this request
/// consumes. A mapper error rejects the request.
pub type MapperFn = Arc<dyn Fn(&ProxyRequest) -> GantryResult<(String, i64)> + Send + Sync>;

/// Maps the request to the limiting key only.
pub type KeyMapperFn = Arc<dyn Fn(&ProxyRequest) -> GantryResult<String> + Send + Sync>;

/// Maps the request to the amount of units to consume.
pub type AmountMapperFn = Arc<dyn Fn(&ProxyRequest) -> GantryResult<i64> + Send + Sync>;

/// Composes a key mapper and an amount mapper into a full mapper.
pub fn make_mapper(key: KeyMapperFn, amount: AmountMapperFn) -> MapperFn {
    Arc::new(move |req: &ProxyRequest| {
        let token = key(req)?;
        let units = amount(req)?;
        Ok((token, units))
    })
}

/// One request per client IP.
pub fn map_client_ip() -> MapperFn {
    Arc::new(|req: &ProxyRequest| Ok((req.client_ip()?, 1)))
}

/// One request per Host header value.
pub fn map_request_host() -> MapperFn {
    Arc::new(|req: &ProxyRequest| Ok((req.host().to_string(), 1)))
}

/// One request per value of the given header.
pub fn map_request_header(header: &str) -> MapperFn {
    let header = header.to_string();
    Arc::new(move |req: &ProxyRequest| {
        let value = req
            .headers()
            .get(&header)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Ok((value, 1))
    })
}

/// Body bytes per client IP, for bandwidth shaped limits.
pub fn map_client_ip_bytes() -> MapperFn {
    Arc::new(|req: &ProxyRequest| Ok((req.client_ip()?, req.body().total_size() as i64)))
}

/// Resolves a limiting variable string to a mapper: `client.ip`,
/// `request.host` or `request.header.<Name>`.
pub fn mapper_from_variable(variable: &str) -> GantryResult<MapperFn> {
    if variable == "client.ip" {
        return Ok(map_client_ip());
    }
    if variable == "request.host" {
        return Ok(map_request_host());
    }
    if let Some(header) = variable.strip_prefix("request.header.") {
        if header.is_empty() {
            return Err(GantryError::config(format!("Wrong header: {}", variable)));
        }
        return Ok(map_request_header(header));
    }
    Err(GantryError::config(format!(
        "Unsupported limiting variable: '{}'",
        variable
    )))
}
