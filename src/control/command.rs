//! Control plane command model.
//!
//! Replies are heterogeneous JSON discriminated by the presence of the
//! `code` field: with it the command is a [`Reply`], without it a
//! [`Forward`]. Fields are validated eagerly; anything off surfaces as
//! `BadControlReply` before the request touches an upstream.

use std::collections::HashMap;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::StatusCode;
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::error::{GantryError, GantryResult};
use crate::netutils;
use crate::rate::{rates_from_json, Rate};

/// What the control plane wants done with a request.
#[derive(Debug, Clone)]
pub enum Instruction {
    Forward(Forward),
    Reply(Reply),
}

impl Instruction {
    pub fn from_json(value: &Value) -> GantryResult<Self> {
        let obj = value.as_object().ok_or_else(|| {
            GantryError::bad_control_reply(format!("Expected dictionary, got {}", value))
        })?;
        if obj.contains_key("code") {
            Ok(Instruction::Reply(Reply::from_json(value)?))
        } else {
            Ok(Instruction::Forward(Forward::from_json(value)?))
        }
    }
}

/// Short-circuit response: the proxy replies with this instead of
/// forwarding anywhere.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: StatusCode,
    pub body: Value,
}

impl Reply {
    pub fn from_json(value: &Value) -> GantryResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| GantryError::bad_control_reply("Reply should be a dictionary"))?;
        let code = obj
            .get("code")
            .and_then(|c| c.as_u64())
            .ok_or_else(|| GantryError::bad_control_reply("Proper HTTP code is required"))?;
        let code = StatusCode::from_u16(code as u16).map_err(|_| {
            GantryError::bad_control_reply(format!("Proper HTTP code is required, got {}", code))
        })?;
        let body = obj
            .get("body")
            .cloned()
            .ok_or_else(|| GantryError::bad_control_reply("Expected body"))?;
        Ok(Self { code, body })
    }
}

/// Controls whether the proxy may fall back to the next upstream, and which
/// response codes the upstream uses to ask for failover.
#[derive(Debug, Clone, Default)]
pub struct Failover {
    pub active: bool,
    pub codes: Vec<u16>,
}

impl Failover {
    pub fn from_json(value: &Value) -> GantryResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| GantryError::bad_control_reply("Failover should be a dictionary"))?;
        let active = obj
            .get("active")
            .map(|v| {
                v.as_bool().ok_or_else(|| {
                    GantryError::bad_control_reply("Failover 'active' should be a boolean")
                })
            })
            .transpose()?
            .unwrap_or(false);
        let codes = match obj.get("codes") {
            None => Vec::new(),
            Some(list) => list
                .as_array()
                .ok_or_else(|| GantryError::bad_control_reply("Failover 'codes' should be a list"))?
                .iter()
                .map(|c| {
                    c.as_u64()
                        .filter(|&c| c >= 100 && c < 600)
                        .map(|c| c as u16)
                        .ok_or_else(|| {
                            GantryError::bad_control_reply(format!(
                                "Failover code should be an HTTP status, got {}",
                                c
                            ))
                        })
                })
                .collect::<GantryResult<Vec<u16>>>()?,
        };
        Ok(Self { active, codes })
    }
}

/// One HTTP server that will actually serve the proxied request.
#[derive(Debug, Clone)]
pub struct Upstream {
    id: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub rewrite_path: Option<String>,
    pub add_headers: HeaderMap,
    pub remove_headers: Vec<String>,
}

impl Upstream {
    pub fn new(scheme: &str, host: &str, port: u16) -> GantryResult<Self> {
        if scheme.is_empty() {
            return Err(GantryError::bad_control_reply("Expected scheme"));
        }
        if scheme != "http" && scheme != "https" {
            return Err(GantryError::bad_control_reply(format!(
                "Unsupported scheme: {}",
                scheme
            )));
        }
        if host.is_empty() {
            return Err(GantryError::bad_control_reply("Expected host"));
        }
        Ok(Self {
            id: format!("{}://{}:{}", scheme, host, port),
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            rewrite_path: None,
            add_headers: HeaderMap::new(),
            remove_headers: Vec::new(),
        })
    }

    /// Accepts either a URL string (its path, if any, becomes the rewrite
    /// path) or a `{scheme, host, port, ...}` dictionary.
    pub fn from_json(value: &Value) -> GantryResult<Self> {
        match value {
            Value::String(s) => Self::from_url_str(s),
            Value::Object(_) => Self::from_dict(value),
            other => Err(GantryError::bad_control_reply(format!(
                "Unsupported upstream type: {}",
                other
            ))),
        }
    }

    fn from_url_str(input: &str) -> GantryResult<Self> {
        let url = netutils::parse_url(input)
            .map_err(|e| GantryError::bad_control_reply(e.to_string()))?;
        let host = url.host_str().unwrap_or("");
        let port = url.port_or_known_default().ok_or_else(|| {
            GantryError::bad_control_reply(format!("Expected port in {}", input))
        })?;
        let mut upstream = Self::new(url.scheme(), host, port)?;
        if url.path() != "/" && !url.path().is_empty() {
            upstream.rewrite_path = Some(url.path().to_string());
        }
        Ok(upstream)
    }

    fn from_dict(value: &Value) -> GantryResult<Self> {
        let obj = value.as_object().unwrap();
        let scheme = obj
            .get("scheme")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GantryError::bad_control_reply("Expected scheme"))?;
        let host = obj
            .get("host")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GantryError::bad_control_reply("Expected host"))?;
        let port = obj
            .get("port")
            .and_then(|v| v.as_u64())
            .filter(|&p| p > 0 && p <= u16::MAX as u64)
            .ok_or_else(|| GantryError::bad_control_reply("Port should be an integer"))?;

        let mut upstream = Self::new(scheme, host, port as u16)?;
        upstream.rewrite_path = obj
            .get("rewrite-path")
            .map(|v| {
                v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                    GantryError::bad_control_reply("'rewrite-path' should be a string")
                })
            })
            .transpose()?;
        if let Some(headers) = obj.get("add-headers") {
            upstream.add_headers = headers_from_json(headers)?;
        }
        if let Some(names) = obj.get("remove-headers") {
            upstream.remove_headers = header_names_from_json(names)?;
        }
        Ok(upstream)
    }

    /// scheme://host:port, matching the endpoint identity scheme.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn to_endpoint(&self) -> GantryResult<Endpoint> {
        Endpoint::from_str(&self.id)
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Upstream({})", self.id)
    }
}

/// Forwarding command: where the request may go and under what limits.
#[derive(Debug, Clone)]
pub struct Forward {
    pub failover: Option<Failover>,
    /// Limiting tokens and their rates; keys identify the requester
    pub rates: HashMap<String, Vec<Rate>>,
    /// At least one upstream is required
    pub upstreams: Vec<Upstream>,
    pub add_headers: HeaderMap,
    pub remove_headers: Vec<String>,
    pub rewrite_path: Option<String>,
}

impl Forward {
    pub fn from_json(value: &Value) -> GantryResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| GantryError::bad_control_reply("Forward should be a dictionary"))?;

        let upstreams_value = obj
            .get("upstreams")
            .ok_or_else(|| GantryError::bad_control_reply("Upstreams are required"))?;
        let upstreams_list = upstreams_value
            .as_array()
            .ok_or_else(|| GantryError::bad_control_reply("Upstreams should be a list"))?;
        if upstreams_list.is_empty() {
            return Err(GantryError::bad_control_reply(
                "Upstreams: at least one is required",
            ));
        }
        let upstreams = upstreams_list
            .iter()
            .map(Upstream::from_json)
            .collect::<GantryResult<Vec<Upstream>>>()?;

        let rates = match obj.get("rates") {
            None => HashMap::new(),
            Some(value) => rates_from_json(value)?,
        };
        let failover = obj.get("failover").map(Failover::from_json).transpose()?;
        let add_headers = match obj.get("add-headers") {
            None => HeaderMap::new(),
            Some(value) => headers_from_json(value)?,
        };
        let remove_headers = match obj.get("remove-headers") {
            None => Vec::new(),
            Some(value) => header_names_from_json(value)?,
        };
        let rewrite_path = obj
            .get("rewrite_path")
            .map(|v| {
                v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                    GantryError::bad_control_reply("'rewrite_path' should be a string")
                })
            })
            .transpose()?;

        Ok(Self {
            failover,
            rates,
            upstreams,
            add_headers,
            remove_headers,
            rewrite_path,
        })
    }
}

/// Parses `{"Header": "value"}` or `{"Header": ["v1", "v2"]}`.
fn headers_from_json(value: &Value) -> GantryResult<HeaderMap> {
    let obj = value
        .as_object()
        .ok_or_else(|| GantryError::bad_control_reply("Headers should be a dictionary"))?;
    let mut headers = HeaderMap::new();
    for (name, values) in obj {
        let name = HeaderName::try_from(name.as_str()).map_err(|_| {
            GantryError::bad_control_reply(format!("Invalid header name: {}", name))
        })?;
        let values: Vec<&str> = match values {
            Value::String(s) => vec![s.as_str()],
            Value::Array(list) => list
                .iter()
                .map(|v| {
                    v.as_str().ok_or_else(|| {
                        GantryError::bad_control_reply("Header values should be strings")
                    })
                })
                .collect::<GantryResult<Vec<&str>>>()?,
            other => {
                return Err(GantryError::bad_control_reply(format!(
                    "Header value should be a string or a list, got {}",
                    other
                )))
            }
        };
        for value in values {
            let value = HeaderValue::from_str(value).map_err(|_| {
                GantryError::bad_control_reply(format!("Invalid header value: {}", value))
            })?;
            headers.append(name.clone(), value);
        }
    }
    Ok(headers)
}

/// Accepts a list of names or a dictionary whose keys are the names.
fn header_names_from_json(value: &Value) -> GantryResult<Vec<String>> {
    match value {
        Value::Array(list) => list
            .iter()
            .map(|v| {
                v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                    GantryError::bad_control_reply("Header names should be strings")
                })
            })
            .collect(),
        Value::Object(obj) => Ok(obj.keys().cloned().collect()),
        other => Err(GantryError::bad_control_reply(format!(
            "Header names should be a list, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::UnitType;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_reply_discriminated_by_code() {
        let instruction =
            Instruction::from_json(&json!({"code": 429, "body": {"error": "slow down"}})).unwrap();
        match instruction {
            Instruction::Reply(reply) => {
                assert_eq!(reply.code, StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(reply.body["error"], "slow down");
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_forward_minimal() {
        let instruction =
            Instruction::from_json(&json!({"upstreams": ["http://localhost:5000"]})).unwrap();
        match instruction {
            Instruction::Forward(cmd) => {
                assert_eq!(cmd.upstreams.len(), 1);
                assert_eq!(cmd.upstreams[0].id(), "http://localhost:5000");
                assert!(cmd.rates.is_empty());
                assert!(cmd.failover.is_none());
            }
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[test]
    fn test_forward_full() {
        let value = json!({
            "failover": {"active": true, "codes": [301, 302]},
            "rates": {
                "$request.ip": ["1 req/second", {"MB": 8, "period": "hour"}],
            },
            "upstreams": [
                "http://localhost:5000/rewrite-path",
                {
                    "scheme": "http",
                    "host": "localhost",
                    "port": 5001,
                    "rewrite-path": "/p2",
                    "add-headers": {"A": "b"},
                    "remove-headers": {"B": "c"},
                }
            ],
            "add-headers": {"N": ["v1"]},
            "remove-headers": ["M"],
            "rewrite_path": "/new/path",
        });
        let cmd = Forward::from_json(&value).unwrap();

        let failover = cmd.failover.unwrap();
        assert!(failover.active);
        assert_eq!(failover.codes, vec![301, 302]);

        let rates = &cmd.rates["$request.ip"];
        assert_eq!(rates[0].units, 1);
        assert_eq!(rates[1].unit_type, UnitType::Megabytes);
        assert_eq!(rates[1].period, Duration::from_secs(3600));

        assert_eq!(cmd.upstreams[0].id(), "http://localhost:5000");
        assert_eq!(cmd.upstreams[0].rewrite_path.as_deref(), Some("/rewrite-path"));
        assert_eq!(cmd.upstreams[1].id(), "http://localhost:5001");
        assert_eq!(cmd.upstreams[1].rewrite_path.as_deref(), Some("/p2"));
        assert_eq!(cmd.upstreams[1].add_headers.get("A").unwrap(), "b");
        assert_eq!(cmd.upstreams[1].remove_headers, vec!["B"]);

        assert_eq!(cmd.add_headers.get("N").unwrap(), "v1");
        assert_eq!(cmd.remove_headers, vec!["M"]);
        assert_eq!(cmd.rewrite_path.as_deref(), Some("/new/path"));
    }

    #[test]
    fn test_forward_requires_upstreams() {
        assert!(Instruction::from_json(&json!({})).is_err());
        assert!(Instruction::from_json(&json!({"upstreams": []})).is_err());
        assert!(Instruction::from_json(&json!({"upstreams": "not-a-list"})).is_err());
    }

    #[test]
    fn test_upstream_scheme_validation() {
        assert!(Upstream::from_json(&json!("ftp://localhost:21")).is_err());
        assert!(Upstream::from_json(&json!({"scheme": "gopher", "host": "x", "port": 70})).is_err());
        assert!(Upstream::from_json(&json!({"scheme": "http", "host": "x"})).is_err());
        assert!(Upstream::from_json(&json!(42)).is_err());
    }

    #[test]
    fn test_upstream_default_port_from_scheme() {
        let upstream = Upstream::from_json(&json!("https://example.com")).unwrap();
        assert_eq!(upstream.port, 443);
        assert_eq!(upstream.id(), "https://example.com:443");
    }

    #[test]
    fn test_reply_validation() {
        assert!(Reply::from_json(&json!({"code": 200})).is_err());
        assert!(Reply::from_json(&json!({"code": 9999, "body": "x"})).is_err());
        assert!(Reply::from_json(&json!({"code": "ok", "body": "x"})).is_err());
    }
}
