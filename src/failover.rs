//! Predicates that decide whether a request may be retried on another
//! endpoint.
//!
//! Predicates are pure functions of the request's attempt history and
//! compose with [`and`], [`or`] and [`not`]:
//!
//! ```
//! use gantry::failover;
//!
//! // GET requests, at most 2 attempts, retried on network errors or when
//! // the upstream replied 408
//! let p = failover::and(vec![
//!     failover::on_gets(),
//!     failover::max_attempts(2),
//!     failover::or(vec![failover::on_errors(), failover::response_code_is(vec![408])]),
//! ]);
//! ```

use std::sync::Arc;

use hyper::Method;

use crate::request::ProxyRequest;

/// Decides whether the request is allowed to fail over to another endpoint.
pub type Predicate = Arc<dyn Fn(&ProxyRequest) -> bool + Send + Sync>;

/// True while the request has had fewer than `max` attempts.
pub fn max_attempts(max: usize) -> Predicate {
    Arc::new(move |req: &ProxyRequest| req.attempts().len() < max)
}

/// True when the last attempt failed with a transport error.
pub fn on_errors() -> Predicate {
    Arc::new(|req: &ProxyRequest| {
        req.last_attempt()
            .map(|a| a.is_network_error())
            .unwrap_or(false)
    })
}

/// True for GET requests only.
pub fn on_gets() -> Predicate {
    Arc::new(|req: &ProxyRequest| req.method() == Method::GET)
}

/// True when the last attempt's response carried one of the given codes.
pub fn response_code_is(codes: Vec<u16>) -> Predicate {
    Arc::new(move |req: &ProxyRequest| {
        req.last_attempt()
            .and_then(|a| a.status)
            .map(|s| codes.contains(&s.as_u16()))
            .unwrap_or(false)
    })
}

pub fn and(predicates: Vec<Predicate>) -> Predicate {
    Arc::new(move |req: &ProxyRequest| predicates.iter().all(|p| p(req)))
}

pub fn or(predicates: Vec<Predicate>) -> Predicate {
    Arc::new(move |req: &ProxyRequest| predicates.iter().any(|p| p(req)))
}

pub fn not(predicate: Predicate) -> Predicate {
    Arc::new(move |req: &ProxyRequest| !predicate(req))
}

/// Failover on errors, 2 attempts maximum, GET requests only.
pub fn default_predicate() -> Predicate {
    and(vec![max_attempts(2), on_errors(), on_gets()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::error::GantryError;
    use crate::request::{testutil, Attempt};
    use hyper::StatusCode;
    use std::time::Duration;

    fn failed_attempt() -> Attempt {
        Attempt {
            endpoint: Arc::new(Endpoint::from_str("http://localhost:5000").unwrap()),
            duration: Duration::from_millis(1),
            status: None,
            error: Some(GantryError::network("connection refused")),
        }
    }

    fn ok_attempt(status: StatusCode) -> Attempt {
        Attempt {
            endpoint: Arc::new(Endpoint::from_str("http://localhost:5000").unwrap()),
            duration: Duration::from_millis(1),
            status: Some(status),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_default_predicate_retries_failed_get() {
        let p = default_predicate();
        let mut req = testutil::get("http://proxy/", "1.2.3.4:1000").await;

        // No attempts yet: nothing failed, no reason to fail over
        assert!(!p(&req));

        req.add_attempt(failed_attempt());
        assert!(p(&req));

        // Second failure uses up the allowed attempts
        req.add_attempt(failed_attempt());
        assert!(!p(&req));
    }

    #[tokio::test]
    async fn test_default_predicate_ignores_posts() {
        let p = default_predicate();
        let mut req =
            testutil::request(Method::POST, "http://proxy/", "1.2.3.4:1000", "payload").await;
        req.add_attempt(failed_attempt());
        assert!(!p(&req));
    }

    #[tokio::test]
    async fn test_default_predicate_ignores_success() {
        let p = default_predicate();
        let mut req = testutil::get("http://proxy/", "1.2.3.4:1000").await;
        req.add_attempt(ok_attempt(StatusCode::OK));
        assert!(!p(&req));
    }

    #[tokio::test]
    async fn test_response_code_predicate() {
        let p = response_code_is(vec![301, 408]);
        let mut req = testutil::get("http://proxy/", "1.2.3.4:1000").await;
        req.add_attempt(ok_attempt(StatusCode::MOVED_PERMANENTLY));
        assert!(p(&req));

        let mut req = testutil::get("http://proxy/", "1.2.3.4:1000").await;
        req.add_attempt(ok_attempt(StatusCode::OK));
        assert!(!p(&req));
    }

    #[tokio::test]
    async fn test_combinators() {
        let yes: Predicate = Arc::new(|_| true);
        let no: Predicate = Arc::new(|_| false);
        let req = testutil::get("http://proxy/", "1.2.3.4:1000").await;

        assert!(and(vec![yes.clone(), yes.clone()])(&req));
        assert!(!and(vec![yes.clone(), no.clone()])(&req));
        assert!(or(vec![no.clone(), yes.clone()])(&req));
        assert!(!or(vec![no.clone(), no.clone()])(&req));
        assert!(not(no)(&req));
    }
}
