//! Upstream origin identity.

use std::fmt;

use url::Url;

use crate::error::{GantryError, GantryResult};
use crate::netutils;

/// One upstream origin. Identity is `scheme://host[:port]` with no path or
/// query; two endpoints with the same id are the same origin.
#[derive(Debug, Clone)]
pub struct Endpoint {
    id: String,
    url: Url,
}

impl Endpoint {
    pub fn new(url: Url) -> GantryResult<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| GantryError::config(format!("Endpoint url without host: {}", url)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(GantryError::config(format!(
                "Unsupported scheme: {}",
                url.scheme()
            )));
        }
        let id = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };
        Ok(Self { id, url })
    }

    pub fn from_str(input: &str) -> GantryResult<Self> {
        Self::new(netutils::parse_url(input)?)
    }

    /// Stable identity: scheme://host[:port].
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// host[:port] as it appears in a URI authority.
    pub fn authority(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.url.host_str().unwrap_or(""), port),
            None => self.url.host_str().unwrap_or("").to_string(),
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.id)
    }
}
