//! Per-request orchestration: buffer the body, route, round trip, stream
//! the response, format failures.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{ErrorFormatter, GantryError, GantryResult, JsonFormatter};
use crate::netutils::body::{BufferedBody, DEFAULT_MEMORY_BUFFER_LIMIT};
use crate::request::ProxyRequest;
use crate::route::Router;

pub struct ProxyOptions {
    /// Renders proxy-generated errors; the JSON formatter by default
    pub error_formatter: Arc<dyn ErrorFormatter>,
    /// Per-request cap on the in-memory part of the body buffer
    pub memory_buffer_limit: usize,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            error_formatter: Arc::new(JsonFormatter),
            memory_buffer_limit: DEFAULT_MEMORY_BUFFER_LIMIT,
        }
    }
}

/// The proxy handler. Owns the router; everything else hangs off the
/// locations the router returns.
pub struct Proxy {
    router: Arc<dyn Router>,
    options: ProxyOptions,
    counter: AtomicI64,
}

impl Proxy {
    pub fn new(router: Arc<dyn Router>) -> Self {
        Self::with_options(router, ProxyOptions::default())
    }

    pub fn with_options(router: Arc<dyn Router>, options: ProxyOptions) -> Self {
        Self {
            router,
            options,
            counter: AtomicI64::new(0),
        }
    }

    /// Handles one request end to end. Never fails: panics in hooks and
    /// every error on the way are converted to formatted responses, with
    /// headers written exactly once.
    pub async fn serve(&self, req: Request<Body>, remote_addr: Option<SocketAddr>) -> Response<Body> {
        match std::panic::AssertUnwindSafe(self.handle(req, remote_addr))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("panic while serving request: {}", message);
                // The request context and its body buffer were dropped by
                // the unwind, releasing any spill file
                self.options
                    .error_formatter
                    .from_status(StatusCode::INTERNAL_SERVER_ERROR)
                    .into_response()
            }
        }
    }

    async fn handle(&self, req: Request<Body>, remote_addr: Option<SocketAddr>) -> Response<Body> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (parts, body) = req.into_parts();
        debug!("request {}: {} {}", id, parts.method, parts.uri);

        // Buffering drains the inbound body completely, so by the time any
        // error is written the client is able to receive it
        let body = match BufferedBody::with_memory_limit(body, self.options.memory_buffer_limit).await
        {
            Ok(body) => body,
            Err(err) => {
                warn!("request {}: failed to buffer body: {}", id, err);
                return self.error_response(&err);
            }
        };

        let mut preq = ProxyRequest::new(
            id,
            parts.method,
            parts.uri,
            parts.version,
            parts.headers,
            remote_addr,
            body,
        );

        let location = match self.router.route(&preq) {
            Ok(Some(location)) => location,
            Ok(None) => {
                debug!("request {}: no location matched", id);
                return self
                    .options
                    .error_formatter
                    .from_status(StatusCode::NOT_FOUND)
                    .into_response();
            }
            Err(err) => {
                error!("request {}: router failure: {}", id, err);
                return self
                    .options
                    .error_formatter
                    .from_status(StatusCode::BAD_GATEWAY)
                    .into_response();
            }
        };

        match location.round_trip(&mut preq).await {
            Ok(response) => response,
            Err(err) => self.error_response(&err),
        }
    }

    fn error_response(&self, err: &GantryError) -> Response<Body> {
        self.options.error_formatter.format(err).into_response()
    }
}

/// Binds the proxy to an address and serves it on a background task.
/// Returns the bound address, useful with port 0.
pub fn spawn_server(
    proxy: Arc<Proxy>,
    addr: SocketAddr,
) -> GantryResult<(SocketAddr, JoinHandle<()>)> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let proxy = Arc::clone(&proxy);
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let proxy = Arc::clone(&proxy);
                async move { Ok::<_, Infallible>(proxy.serve(req, Some(remote)).await) }
            }))
        }
    });

    let server = hyper::Server::try_bind(&addr)
        .map_err(|e| GantryError::config(format!("failed to bind {}: {}", addr, e)))?
        .serve(make_svc);
    let local_addr = server.local_addr();
    let handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("proxy server error: {}", e);
        }
    });
    Ok((local_addr, handle))
}
