//! HTTP location with built-in failover, limiting and load balancing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::HeaderValue;
use hyper::{Body, Client, Request, Response, Uri, Version};
use tracing::{debug, error, warn};

use crate::endpoint::Endpoint;
use crate::error::{GantryError, GantryResult};
use crate::failover::{self, Predicate};
use crate::limit::Limiter;
use crate::loadbalance::LoadBalancer;
use crate::location::Location;
use crate::middleware::MiddlewareChain;
use crate::netutils::headers::{
    copy_headers, remove_headers, HOP_HEADERS, X_FORWARDED_FOR, X_FORWARDED_HOST,
    X_FORWARDED_PROTO, X_FORWARDED_SERVER,
};
use crate::request::{Attempt, ProxyRequest};
use crate::timeutils::{self, SharedClock};

/// Standard dial and response-header timeouts, can be overridden in options.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Socket connect timeout
    pub dial: Duration,
    /// Time to wait for the first response header
    pub response_header: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            dial: DEFAULT_DIAL_TIMEOUT,
            response_header: DEFAULT_RESPONSE_HEADER_TIMEOUT,
        }
    }
}

/// Additional parameters controlling a location.
#[derive(Clone)]
pub struct HttpLocationOptions {
    pub timeouts: Timeouts,
    /// Predicate that defines when requests are allowed to fail over.
    /// Defaults to: errors only, GET requests only, 2 attempts maximum.
    pub should_failover: Option<Predicate>,
    /// Used for the X-Forwarded-Server header; defaults to the local host
    /// name when left empty
    pub hostname: String,
    /// Rate limiting algorithm, if any
    pub limiter: Option<Arc<dyn Limiter>>,
    /// Append to an existing X-Forwarded-For list instead of replacing it
    pub trust_forward_header: bool,
    pub clock: SharedClock,
}

impl Default for HttpLocationOptions {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            should_failover: None,
            limiter: None,
            hostname: String::new(),
            trust_forward_header: false,
            clock: timeutils::real_clock(),
        }
    }
}

/// A destination with load balancing, failover and limiting support. Owns
/// the outbound transport; connections are pooled per location.
pub struct HttpLocation {
    id: String,
    balancer: Arc<dyn LoadBalancer>,
    transport: Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>,
    middleware: MiddlewareChain,
    should_failover: Predicate,
    options: HttpLocationOptions,
}

impl HttpLocation {
    pub fn new(id: &str, balancer: Arc<dyn LoadBalancer>) -> Self {
        Self::with_options(id, balancer, HttpLocationOptions::default())
    }

    pub fn with_options(
        id: &str,
        balancer: Arc<dyn LoadBalancer>,
        mut options: HttpLocationOptions,
    ) -> Self {
        if options.hostname.is_empty() {
            options.hostname = crate::netutils::local_hostname();
        }
        let should_failover = options
            .should_failover
            .clone()
            .unwrap_or_else(failover::default_predicate);
        Self {
            id: id.to_string(),
            balancer,
            transport: build_transport(&options.timeouts),
            middleware: MiddlewareChain::new(),
            should_failover,
            options,
        }
    }

    /// Custom hooks executed around every upstream attempt, ahead of the
    /// balancer and limiter hooks.
    pub fn middleware(&self) -> &MiddlewareChain {
        &self.middleware
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    /// Alters the outbound request: swaps scheme and host to the endpoint,
    /// keeps the original path and query, manages forwarded headers and
    /// strips hop-by-hop headers.
    fn rewrite_request(
        &self,
        req: &ProxyRequest,
        endpoint: &Endpoint,
    ) -> GantryResult<Request<Body>> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!(
            "{}://{}{}",
            endpoint.scheme(),
            endpoint.authority(),
            path_and_query
        )
        .parse()?;

        let mut builder = Request::builder()
            .method(req.method().clone())
            .uri(uri)
            // Force a persistent HTTP/1.1 upstream connection regardless of
            // what the client spoke to us
            .version(Version::HTTP_11);

        let headers = builder
            .headers_mut()
            .ok_or_else(|| GantryError::internal("request builder in error state"))?;
        copy_headers(headers, req.headers());

        if let Ok(client_ip) = req.client_ip() {
            let forwarded_for = match headers.get(X_FORWARDED_FOR) {
                Some(prior) if self.options.trust_forward_header => {
                    format!("{}, {}", prior.to_str().unwrap_or(""), client_ip)
                }
                _ => client_ip,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(if req.is_tls() { "https" } else { "http" }),
        );
        if !req.host().is_empty() {
            if let Ok(value) = HeaderValue::from_str(req.host()) {
                headers.insert(X_FORWARDED_HOST, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&self.options.hostname) {
            headers.insert(X_FORWARDED_SERVER, value);
        }

        remove_headers(HOP_HEADERS, headers);

        Ok(builder.body(req.body().replay())?)
    }
}

#[async_trait]
impl Location for HttpLocation {
    fn id(&self) -> &str {
        &self.id
    }

    /// Round trips the request to one of the endpoints, failing over per
    /// the configured predicate with the buffered body rewound for every
    /// attempt.
    async fn round_trip(&self, req: &mut ProxyRequest) -> GantryResult<Response<Body>> {
        loop {
            let endpoint = match self.balancer.next_endpoint(req) {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    error!("load balancer failure: {}", err);
                    return Err(err);
                }
            };

            // The body replays from the start on every attempt
            let out = self.rewrite_request(req, &endpoint)?;

            // Before hooks: custom chain first, then balancer, then limiter.
            // A response short-circuits, an error rejects.
            for hook in self.middleware.snapshot() {
                if let Some(response) = hook.before(req).await? {
                    return Ok(response);
                }
            }
            if let Some(response) = self.balancer.before(req).await? {
                return Ok(response);
            }
            if let Some(limiter) = &self.options.limiter {
                match limiter.before(req).await {
                    Ok(None) => {}
                    Ok(Some(response)) => return Ok(response),
                    Err(err) => {
                        warn!("limiter rejects request {}: {}", req.id(), err);
                        return Err(err);
                    }
                }
            }

            let start = self.options.clock.utc_now();
            let result = tokio::time::timeout(
                self.options.timeouts.response_header,
                self.transport.request(out),
            )
            .await;
            let duration = (self.options.clock.utc_now() - start)
                .to_std()
                .unwrap_or_default();

            let (response, err) = match result {
                Ok(Ok(response)) => (Some(response), None),
                Ok(Err(e)) => (None, Some(GantryError::from(e))),
                Err(_) => (
                    None,
                    Some(GantryError::timeout(
                        self.options.timeouts.response_header,
                        "HTTP request",
                    )),
                ),
            };
            req.add_attempt(Attempt {
                endpoint: Arc::clone(&endpoint),
                duration,
                status: response.as_ref().map(|r| r.status()),
                error: err.clone(),
            });

            // After hooks in reverse: limiter releases first, the balancer
            // feeds its failure meters, custom hooks observe last. An error
            // here intercepts the response.
            if let Some(limiter) = &self.options.limiter {
                limiter.after(req).await?;
            }
            self.balancer.after(req).await?;
            for hook in self.middleware.snapshot_rev() {
                hook.after(req).await?;
            }

            if (self.should_failover)(req) {
                debug!(
                    "request {} fails over after attempt on {}",
                    req.id(),
                    endpoint.id()
                );
                continue;
            }

            return match response {
                Some(response) => Ok(response),
                None => {
                    let err = err.unwrap_or(GantryError::AllEndpointsFailed);
                    error!("request {} failed: {}", req.id(), err);
                    // Keep timeouts visible to the client; everything else
                    // collapses into the generic failure once several
                    // endpoints were tried
                    if req.attempts().len() > 1 && !matches!(err, GantryError::Timeout { .. }) {
                        Err(GantryError::AllEndpointsFailed)
                    } else {
                        Err(err)
                    }
                }
            };
        }
    }
}

fn build_transport(timeouts: &Timeouts) -> Client<hyper_rustls::HttpsConnector<HttpConnector>, Body> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(timeouts.dial));

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .build::<_, Body>(https)
}
