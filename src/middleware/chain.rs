//! Ordered hook registry with stable iteration.
//!
//! A chain is a map with guaranteed iteration order, in-place updates that
//! do not change the order, and snapshot iteration that does not hold locks.
//! Mutations take the exclusive lock; `snapshot`/`snapshot_rev` clone the
//! entry list under the shared lock, so an in-flight iteration never
//! observes a concurrent mutation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{GantryError, GantryResult};
use crate::middleware::{Middleware, Observer};
use crate::request::{Attempt, ProxyRequest};

pub struct Chain<T: ?Sized> {
    inner: RwLock<ChainInner<T>>,
}

struct ChainInner<T: ?Sized> {
    entries: Vec<(String, Arc<T>)>,
    // Indexes for in place updates
    index: HashMap<String, usize>,
}

impl<T: ?Sized> Default for Chain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Chain<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ChainInner {
                entries: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Adds a hook at the end of the chain. Fails if the id is taken.
    pub fn append(&self, id: &str, value: Arc<T>) -> GantryResult<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.index.contains_key(id) {
            return Err(GantryError::internal(format!(
                "Callback with id: {} already exists",
                id
            )));
        }
        inner.entries.push((id.to_string(), value));
        let pos = inner.entries.len() - 1;
        inner.index.insert(id.to_string(), pos);
        Ok(())
    }

    /// Replaces the hook with the given id, keeping its position.
    pub fn update(&self, id: &str, value: Arc<T>) -> GantryResult<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.index.get(id).copied() {
            Some(pos) => {
                inner.entries[pos].1 = value;
                Ok(())
            }
            None => Err(GantryError::internal(format!(
                "Callback with id: {} not found",
                id
            ))),
        }
    }

    /// Update in place if present, append otherwise.
    pub fn upsert(&self, id: &str, value: Arc<T>) {
        let mut inner = self.inner.write().unwrap();
        match inner.index.get(id).copied() {
            Some(pos) => inner.entries[pos].1 = value,
            None => {
                inner.entries.push((id.to_string(), value));
                let pos = inner.entries.len() - 1;
                inner.index.insert(id.to_string(), pos);
            }
        }
    }

    pub fn remove(&self, id: &str) -> GantryResult<()> {
        let mut inner = self.inner.write().unwrap();
        let pos = match inner.index.get(id).copied() {
            Some(pos) => pos,
            None => {
                return Err(GantryError::internal(format!(
                    "Callback with id: {} not found",
                    id
                )))
            }
        };
        inner.entries.remove(pos);
        inner.index.clear();
        let ids: Vec<(String, usize)> = inner
            .entries
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id.clone(), i))
            .collect();
        inner.index.extend(ids);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        let inner = self.inner.read().unwrap();
        inner
            .index
            .get(id)
            .map(|&pos| Arc::clone(&inner.entries[pos].1))
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pinned view of the chain in registration order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        let inner = self.inner.read().unwrap();
        inner.entries.iter().map(|(_, v)| Arc::clone(v)).collect()
    }

    /// Pinned view of the chain in reverse registration order.
    pub fn snapshot_rev(&self) -> Vec<Arc<T>> {
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .iter()
            .rev()
            .map(|(_, v)| Arc::clone(v))
            .collect()
    }
}

/// Chain of [`Middleware`] hooks attached to a location.
pub type MiddlewareChain = Chain<dyn Middleware>;

/// Chain of passive [`Observer`]s; requests are observed in registration
/// order, responses in reverse.
pub type ObserverChain = Chain<dyn Observer>;

impl ObserverChain {
    pub fn observe_request(&self, req: &ProxyRequest) {
        for observer in self.snapshot() {
            observer.observe_request(req);
        }
    }

    pub fn observe_response(&self, req: &ProxyRequest, attempt: &Attempt) {
        for observer in self.snapshot_rev() {
            observer.observe_response(req, attempt);
        }
    }
}
