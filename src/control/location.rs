//! Location driven by control plane instructions.
//!
//! Instead of a configured balancer, this location asks its
//! [`InstructionProvider`] what to do on every request: replies
//! short-circuit, forwards are checked against the rate backend and then
//! proxied across the command's upstreams with failover on errors and on
//! the command's failover codes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::HeaderValue;
use hyper::{Body, Client, Request, Response, Uri, Version};
use tracing::{debug, error, warn};

use crate::control::command::{Forward, Instruction, Reply, Upstream};
use crate::control::ratelimit::RateChecker;
use crate::control::InstructionProvider;
use crate::error::{GantryError, GantryResult};
use crate::location::httploc::Timeouts;
use crate::location::Location;
use crate::netutils::headers::{
    copy_headers, remove_headers, HOP_HEADERS, X_FORWARDED_FOR, X_FORWARDED_HOST,
    X_FORWARDED_PROTO, X_FORWARDED_SERVER,
};
use crate::request::{Attempt, ProxyRequest};
use crate::timeutils::{self, SharedClock};

#[derive(Clone)]
pub struct ControlLocationOptions {
    pub timeouts: Timeouts,
    /// Used for the X-Forwarded-Server header; defaults to the local host
    /// name when left empty
    pub hostname: String,
    pub trust_forward_header: bool,
    pub clock: SharedClock,
}

impl Default for ControlLocationOptions {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            hostname: String::new(),
            trust_forward_header: false,
            clock: timeutils::real_clock(),
        }
    }
}

pub struct ControlLocation {
    id: String,
    provider: Arc<dyn InstructionProvider>,
    checker: Option<RateChecker>,
    transport: Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>,
    // Rotates the starting upstream across requests
    cursor: AtomicUsize,
    options: ControlLocationOptions,
}

impl ControlLocation {
    pub fn new(id: &str, provider: Arc<dyn InstructionProvider>) -> Self {
        Self::with_options(id, provider, None, ControlLocationOptions::default())
    }

    pub fn with_options(
        id: &str,
        provider: Arc<dyn InstructionProvider>,
        checker: Option<RateChecker>,
        mut options: ControlLocationOptions,
    ) -> Self {
        if options.hostname.is_empty() {
            options.hostname = crate::netutils::local_hostname();
        }
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(options.timeouts.dial));
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);
        Self {
            id: id.to_string(),
            provider,
            checker,
            transport: Client::builder().build::<_, Body>(https),
            cursor: AtomicUsize::new(0),
            options,
        }
    }

    fn reply_response(&self, reply: &Reply) -> GantryResult<Response<Body>> {
        let body = serde_json::to_vec(&reply.body)?;
        Ok(Response::builder()
            .status(reply.code)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))?)
    }

    async fn forward(&self, req: &mut ProxyRequest, cmd: &Forward) -> GantryResult<Response<Body>> {
        if let Some(checker) = &self.checker {
            if !cmd.rates.is_empty() {
                // A broken backend should not take the proxy down with it;
                // log and let the request through
                match checker.retry_seconds(&cmd.rates).await {
                    Ok(0) => {
                        if let Err(err) = checker
                            .update_stats(req.body().total_size() as i64, &cmd.rates)
                            .await
                        {
                            warn!("rate backend failed to update stats: {}", err);
                        }
                    }
                    Ok(retry) => {
                        return Err(GantryError::RateLimited {
                            message: format!("retry in {} seconds", retry),
                            retry_seconds: Some(retry),
                        })
                    }
                    Err(err) => {
                        warn!("rate backend failure: {}, continuing with the request", err)
                    }
                }
            }
        }

        let failover_active = cmd
            .failover
            .as_ref()
            .map(|f| f.active)
            .unwrap_or(false);
        let failover_codes: &[u16] = cmd
            .failover
            .as_ref()
            .map(|f| f.codes.as_slice())
            .unwrap_or(&[]);

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let count = cmd.upstreams.len();
        for i in 0..count {
            let upstream = &cmd.upstreams[(start + i) % count];
            let endpoint = Arc::new(upstream.to_endpoint()?);
            debug!("request {} proxying to {}", req.id(), upstream);

            let out = self.rewrite_request(req, cmd, upstream)?;
            let t0 = self.options.clock.utc_now();
            let result = tokio::time::timeout(
                self.options.timeouts.response_header,
                self.transport.request(out),
            )
            .await;
            let duration = (self.options.clock.utc_now() - t0).to_std().unwrap_or_default();

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

            match response {
                Some(response) => {
                    // Upstreams can ask for failover with special response
                    // codes, e.g. while shutting down
                    if failover_codes.contains(&response.status().as_u16()) {
                        error!(
                            "upstream {} initiated failover with status {}",
                            upstream,
                            response.status()
                        );
                        continue;
                    }
                    return Ok(response);
                }
                None => {
                    let err = err.unwrap_or(GantryError::AllEndpointsFailed);
                    if !failover_active {
                        return Err(err);
                    }
                    error!("upstream {} error: {}, falling back to another", upstream, err);
                }
            }
        }

        error!("request {}: all upstreams failed", req.id());
        Err(GantryError::AllEndpointsFailed)
    }

    /// Alters the outbound request per the command: swaps the origin,
    /// applies path rewrites and header edits, manages forwarded headers
    /// and strips hop-by-hop headers.
    fn rewrite_request(
        &self,
        req: &ProxyRequest,
        cmd: &Forward,
        upstream: &Upstream,
    ) -> GantryResult<Request<Body>> {
        // The upstream's rewrite path wins over the command's; with neither
        // present the original path is kept
        let path = upstream
            .rewrite_path
            .as_deref()
            .or(cmd.rewrite_path.as_deref())
            .unwrap_or_else(|| req.uri().path());
        let uri: Uri = match req.uri().query() {
            Some(query) => format!(
                "{}://{}:{}{}?{}",
                upstream.scheme, upstream.host, upstream.port, path, query
            ),
            None => format!("{}://{}:{}{}", upstream.scheme, upstream.host, upstream.port, path),
        }
        .parse()?;

        let mut builder = Request::builder()
            .method(req.method().clone())
            .uri(uri)
            .version(Version::HTTP_11);
        let headers = builder
            .headers_mut()
            .ok_or_else(|| GantryError::internal("request builder in error state"))?;
        copy_headers(headers, req.headers());

        remove_headers(&upstream.remove_headers, headers);
        copy_headers(headers, &upstream.add_headers);
        remove_headers(&cmd.remove_headers, headers);
        copy_headers(headers, &cmd.add_headers);

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
impl Location for ControlLocation {
    fn id(&self) -> &str {
        &self.id
    }

    async fn round_trip(&self, req: &mut ProxyRequest) -> GantryResult<Response<Body>> {
        let instruction = self.provider.get_instructions(req).await?;
        match instruction {
            Instruction::Reply(reply) => {
                debug!("request {} short-circuited by control plane", req.id());
                self.reply_response(&reply)
            }
            Instruction::Forward(cmd) => self.forward(req, &cmd).await,
        }
    }
}
