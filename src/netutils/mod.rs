//! Small HTTP utilities shared across the proxy: header copying, basic auth
//! parsing, strict URL parsing and the replayable request body buffer.

pub mod body;
pub mod headers;

use base64::Engine;
use url::Url;

use crate::error::{GantryError, GantryResult};

pub use body::{BufferedBody, DEFAULT_MEMORY_BUFFER_LIMIT};

/// Parsed `Authorization: Basic` credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Parses an `Authorization: Basic <base64>` header value.
pub fn parse_basic_auth(header: &str) -> GantryResult<BasicAuth> {
    let mut fields = header.split_whitespace();
    let (auth_type, encoded) = match (fields.next(), fields.next(), fields.next()) {
        (Some(t), Some(v), None) => (t, v),
        _ => {
            return Err(GantryError::bad_auth(format!(
                "Failed to parse header '{}'",
                header
            )))
        }
    };

    if !auth_type.eq_ignore_ascii_case("basic") {
        return Err(GantryError::bad_auth(format!(
            "Expected basic auth type, got '{}'",
            auth_type
        )));
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| {
            GantryError::bad_auth(format!(
                "Failed to parse header '{}', base64 failed: {}",
                header, e
            ))
        })?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| GantryError::bad_auth("Credentials are not valid utf-8"))?;

    match decoded.split_once(':') {
        Some((username, password)) => Ok(BasicAuth {
            username: username.to_string(),
            password: password.to_string(),
        }),
        None => Err(GantryError::bad_auth(format!(
            "Failed to parse header '{}', expected separator ':'",
            header
        ))),
    }
}

/// Name of the machine the proxy runs on, used for forwarded headers when
/// no hostname is configured.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Standard URL parsing is very generous; this wrapper demands scheme and
/// host to be present.
pub fn parse_url(input: &str) -> GantryResult<Url> {
    let parsed =
        Url::parse(input).map_err(|e| GantryError::config(format!("Invalid url {}: {}", input, e)))?;
    if parsed.host_str().is_none() || parsed.scheme().is_empty() {
        return Err(GantryError::config(format!(
            "Url without scheme or host is not allowed: {}",
            input
        )));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(creds: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(creds)
    }

    #[test]
    fn test_parse_basic_auth_success() {
        let header = format!("Basic {}", encode("user:secret"));
        let auth = parse_basic_auth(&header).unwrap();
        assert_eq!(auth.username, "user");
        assert_eq!(auth.password, "secret");
    }

    #[test]
    fn test_parse_basic_auth_password_with_colon() {
        let header = format!("basic {}", encode("user:se:cret"));
        let auth = parse_basic_auth(&header).unwrap();
        assert_eq!(auth.username, "user");
        assert_eq!(auth.password, "se:cret");
    }

    #[test]
    fn test_parse_basic_auth_failures() {
        for header in [
            "",
            "Basic",
            "Bearer abc",
            "Basic not-base64!!!",
            &format!("Basic {}", encode("no-separator")),
            &format!("Basic {} extra", encode("a:b")),
        ] {
            assert!(
                parse_basic_auth(header).is_err(),
                "expected failure for '{}'",
                header
            );
        }
    }

    #[test]
    fn test_parse_url_strict() {
        assert!(parse_url("http://example.com:5000").is_ok());
        assert!(parse_url("https://example.com/path?x=1").is_ok());
        assert!(parse_url("example.com").is_err());
        assert!(parse_url("/relative/path").is_err());
        assert!(parse_url("").is_err());
    }
}
