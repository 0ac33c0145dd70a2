//! In-flight connection caps per mapped key.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use hyper::{Body, Response};
use tracing::debug;

use crate::error::{GantryError, GantryResult};
use crate::limit::{Limiter, MapperFn};
use crate::middleware::Middleware;
use crate::request::ProxyRequest;

/// Tracks concurrent requests per key and rejects past `max_connections`.
/// `before` takes a slot, `after` releases it; counters are removed when
/// they reach zero so the map only holds active keys.
pub struct ConnectionLimiter {
    mapper: MapperFn,
    max_connections: i64,
    state: Mutex<ConnState>,
}

struct ConnState {
    connections: HashMap<String, i64>,
    total: i64,
}

impl ConnectionLimiter {
    pub fn new(mapper: MapperFn, max_connections: i64) -> GantryResult<Self> {
        if max_connections <= 0 {
            return Err(GantryError::config("Max connections should be >= 1"));
        }
        Ok(Self {
            mapper,
            max_connections,
            state: Mutex::new(ConnState {
                connections: HashMap::new(),
                total: 0,
            }),
        })
    }

    /// Caps concurrent requests per client IP.
    pub fn client_ip(max_connections: i64) -> GantryResult<Self> {
        Self::new(crate::limit::map_client_ip(), max_connections)
    }

    /// Total in-flight connections across all keys.
    pub fn connection_count(&self) -> i64 {
        self.state.lock().unwrap().total
    }
}

#[async_trait]
impl Middleware for ConnectionLimiter {
    async fn before(&self, req: &mut ProxyRequest) -> GantryResult<Option<Response<Body>>> {
        let (key, amount) = (self.mapper)(req)?;

        let mut state = self.state.lock().unwrap();
        let current = state.connections.get(&key).copied().unwrap_or(0);
        if current >= self.max_connections {
            debug!("request {} connection limited on key '{}'", req.id(), key);
            return Err(GantryError::ConnectionLimited {
                max: self.max_connections,
                current,
            });
        }
        *state.connections.entry(key).or_insert(0) += amount;
        state.total += amount;
        Ok(None)
    }

    async fn after(&self, req: &mut ProxyRequest) -> GantryResult<()> {
        let (key, amount) = (self.mapper)(req)?;

        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.connections.get_mut(&key) {
            *count -= amount;
            // Otherwise the map would grow forever
            if *count <= 0 {
                state.connections.remove(&key);
            }
        }
        state.total -= amount;
        Ok(())
    }
}

impl Limiter for ConnectionLimiter {}
