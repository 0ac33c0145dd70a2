//! Routes requests by exact Host header match.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{GantryError, GantryResult};
use crate::location::Location;
use crate::request::ProxyRequest;
use crate::route::Router;

pub struct HostRouter {
    locations: RwLock<HashMap<String, Arc<dyn Location>>>,
}

impl Default for HostRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRouter {
    pub fn new() -> Self {
        Self {
            locations: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_location(&self, host: &str, location: Arc<dyn Location>) -> GantryResult<()> {
        if host.is_empty() {
            return Err(GantryError::config("Host can not be empty"));
        }
        self.locations
            .write()
            .unwrap()
            .insert(host.to_ascii_lowercase(), location);
        Ok(())
    }

    pub fn remove_location(&self, host: &str) {
        self.locations
            .write()
            .unwrap()
            .remove(&host.to_ascii_lowercase());
    }
}

impl Router for HostRouter {
    fn route(&self, req: &ProxyRequest) -> GantryResult<Option<Arc<dyn Location>>> {
        let host = req.host().to_ascii_lowercase();
        Ok(self.locations.read().unwrap().get(&host).cloned())
    }
}
