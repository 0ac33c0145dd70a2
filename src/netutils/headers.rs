//! Header names and helpers used when rewriting proxied requests.

use hyper::header::{HeaderMap, HeaderName};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_SERVER: &str = "x-forwarded-server";

/// Hop-by-hop headers. These are removed when the request is sent to the
/// backend: <http://www.w3.org/Protocols/rfc2616/rfc2616-sec13.html>
/// "Connection" is the important one, we want a persistent upstream
/// connection regardless of what the client sent to us.
pub const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Copies headers from source to destination. Does not override, adds
/// repeated headers as additional values.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src.iter() {
        dst.append(name.clone(), value.clone());
    }
}

/// Removes the headers with the given names from the map.
pub fn remove_headers(names: &[impl AsRef<str>], headers: &mut HeaderMap) {
    for name in names {
        if let Ok(name) = HeaderName::try_from(name.as_ref().to_ascii_lowercase().as_str()) {
            headers.remove(&name);
        }
    }
}

/// Whether any of the given header names is present in the map.
pub fn has_headers(names: &[impl AsRef<str>], headers: &HeaderMap) -> bool {
    names.iter().any(|name| {
        HeaderName::try_from(name.as_ref().to_ascii_lowercase().as_str())
            .map(|n| headers.contains_key(&n))
            .unwrap_or(false)
    })
}
