//! Per-request context carried through the pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::HeaderMap;
use hyper::{Method, StatusCode, Uri, Version};

use crate::endpoint::Endpoint;
use crate::error::{GantryError, GantryResult};
use crate::netutils::BufferedBody;

/// One try at proxying the request to an endpoint.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub endpoint: Arc<Endpoint>,
    pub duration: Duration,
    /// Status of the upstream response, when one was received
    pub status: Option<StatusCode>,
    /// Transport error, when the round trip failed
    pub error: Option<GantryError>,
}

impl Attempt {
    /// Default failure predicate: the attempt carried a transport error.
    pub fn is_network_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Wrapper around the inbound HTTP request: head fields, the fully buffered
/// body and the history of upstream attempts. Owned exclusively by the task
/// handling the request.
#[derive(Debug)]
pub struct ProxyRequest {
    id: i64,
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    /// Whether the client connection arrived over TLS (set by the server
    /// wiring; the core itself never terminates TLS)
    tls: bool,
    body: BufferedBody,
    attempts: Vec<Attempt>,
}

impl ProxyRequest {
    pub fn new(
        id: i64,
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        remote_addr: Option<SocketAddr>,
        body: BufferedBody,
    ) -> Self {
        Self {
            id,
            method,
            uri,
            version,
            headers,
            remote_addr,
            tls: false,
            body,
            attempts: Vec::new(),
        }
    }

    /// Request id, unique within this process.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn set_tls(&mut self, tls: bool) {
        self.tls = tls;
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Host header value, empty string when the client sent none.
    pub fn host(&self) -> &str {
        self.headers
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
    }

    pub fn body(&self) -> &BufferedBody {
        &self.body
    }

    /// Client IP without the port, derived from the socket address.
    pub fn client_ip(&self) -> GantryResult<String> {
        match self.remote_addr {
            Some(addr) => Ok(addr.ip().to_string()),
            None => Err(GantryError::internal("Failed to parse client IP")),
        }
    }

    pub fn add_attempt(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }
}
