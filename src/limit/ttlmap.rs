//! Bounded map with access-TTL eviction.
//!
//! Limiters key their state by client attributes, so the map has to stay
//! bounded no matter what clients show up. Every read or write of an entry
//! refreshes its TTL; entries that stay untouched past their TTL are
//! evicted lazily, and when the map is at capacity the entry closest to
//! expiry is dropped to make room.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Duration, Utc};

use crate::error::{GantryError, GantryResult};
use crate::timeutils::SharedClock;

struct Entry<V> {
    value: V,
    ttl: Duration,
    expires_at: DateTime<Utc>,
    seq: u64,
}

pub struct TtlMap<V> {
    capacity: usize,
    entries: HashMap<String, Entry<V>>,
    // Expiry queue with lazy deletion: stale heap items are recognized by a
    // sequence mismatch and skipped.
    expiry: BinaryHeap<Reverse<(DateTime<Utc>, u64, String)>>,
    next_seq: u64,
    clock: SharedClock,
}

impl<V> TtlMap<V> {
    pub fn new(capacity: usize, clock: SharedClock) -> GantryResult<Self> {
        if capacity == 0 {
            return Err(GantryError::config("Capacity should be >= 1"));
        }
        Ok(Self {
            capacity,
            entries: HashMap::new(),
            expiry: BinaryHeap::new(),
            next_seq: 0,
            clock,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a live entry, refreshing its TTL.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.purge_expired();
        let now = self.clock.utc_now();
        let (seq, expires_at) = match self.entries.get_mut(key) {
            None => return None,
            Some(entry) => {
                entry.seq = next_seq(&mut self.next_seq);
                entry.expires_at = now + entry.ttl;
                (entry.seq, entry.expires_at)
            }
        };
        self.expiry.push(Reverse((expires_at, seq, key.to_string())));
        self.entries.get_mut(key).map(|e| &mut e.value)
    }

    /// Inserts or replaces an entry with the given TTL in seconds.
    pub fn set(&mut self, key: &str, value: V, ttl_seconds: i64) -> GantryResult<()> {
        if ttl_seconds <= 0 {
            return Err(GantryError::config(format!(
                "TTL should be >= 1 second, got {}",
                ttl_seconds
            )));
        }
        self.purge_expired();
        if !self.entries.contains_key(key) && self.entries.len() >= self.capacity {
            self.evict_soonest();
        }

        let now = self.clock.utc_now();
        let ttl = Duration::seconds(ttl_seconds);
        let seq = next_seq(&mut self.next_seq);
        let expires_at = now + ttl;
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                ttl,
                expires_at,
                seq,
            },
        );
        self.expiry.push(Reverse((expires_at, seq, key.to_string())));
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drops every entry whose TTL has elapsed.
    fn purge_expired(&mut self) {
        let now = self.clock.utc_now();
        while let Some(Reverse((expires_at, seq, key))) = self.expiry.peek().cloned() {
            if expires_at > now {
                break;
            }
            self.expiry.pop();
            // Only remove if this heap item is the entry's latest lease
            if let Some(entry) = self.entries.get(&key) {
                if entry.seq == seq && entry.expires_at <= now {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Makes room by dropping the live entry closest to expiry.
    fn evict_soonest(&mut self) {
        while let Some(Reverse((_, seq, key))) = self.expiry.pop() {
            let live = self
                .entries
                .get(&key)
                .map(|entry| entry.seq == seq)
                .unwrap_or(false);
            if live {
                self.entries.remove(&key);
                return;
            }
        }
    }
}

fn next_seq(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}
