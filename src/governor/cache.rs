//! Fingerprint-keyed decision cache with FIFO eviction.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use super::types::DecisionRecord;
use crate::crypto::Digest;

/// Hit/miss counters and occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Entries held.
    pub len: usize,
    /// Maximum entries.
    pub capacity: usize,
    /// Whether lookups may hit.
    pub enabled: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    record: DecisionRecord,
    epoch: u64,
}

/// Bounded decision cache.
///
/// Entries are tagged with the policy epoch they were decided under; an
/// entry from an older epoch never hits. Disabling the cache makes every
/// lookup miss but leaves stored entries untouched.
#[derive(Debug)]
pub struct DecisionCache {
    capacity: usize,
    enabled: bool,
    order: VecDeque<Digest>,
    entries: HashMap<Digest, Entry>,
    hits: u64,
    misses: u64,
    last_inserted: Option<Digest>,
}

impl DecisionCache {
    /// Create an enabled cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            enabled: true,
            order: VecDeque::new(),
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
            last_inserted: None,
        }
    }

    /// Stored decision for `fingerprint` under `epoch`, without touching counters.
    pub fn peek(&self, fingerprint: &Digest, epoch: u64) -> Option<&DecisionRecord> {
        if !self.enabled {
            return None;
        }
        self.entries
            .get(fingerprint)
            .filter(|e| e.epoch == epoch)
            .map(|e| &e.record)
    }

    /// Look up and count a hit or miss.
    pub fn lookup(&mut self, fingerprint: &Digest, epoch: u64) -> Option<DecisionRecord> {
        let found = self.peek(fingerprint, epoch).cloned();
        self.record_lookup(found.is_some());
        found
    }

    /// Count a lookup outcome decided elsewhere.
    pub fn record_lookup(&mut self, hit: bool) {
        if hit {
            self.hits = self.hits.saturating_add(1);
        } else {
            self.misses = self.misses.saturating_add(1);
        }
    }

    /// Store a decision, evicting the oldest entries past capacity.
    ///
    /// Re-inserting a fingerprint moves it to the back of the queue. Does
    /// nothing while the cache is disabled.
    pub fn insert(&mut self, fingerprint: Digest, record: DecisionRecord, epoch: u64) {
        if !self.enabled {
            return;
        }
        if self.entries.remove(&fingerprint).is_some() {
            self.order.retain(|d| *d != fingerprint);
        }
        self.entries.insert(fingerprint, Entry { record, epoch });
        self.order.push_back(fingerprint);
        self.last_inserted = Some(fingerprint);
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Drop one entry. Returns whether it existed.
    pub fn invalidate(&mut self, fingerprint: &Digest) -> bool {
        if self.entries.remove(fingerprint).is_none() {
            return false;
        }
        self.order.retain(|d| d != fingerprint);
        true
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Enable or disable lookups.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether lookups may hit.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `fingerprint` is stored, regardless of epoch or enablement.
    pub fn contains(&self, fingerprint: &Digest) -> bool {
        self.entries.contains_key(fingerprint)
    }

    /// Fingerprint most recently inserted.
    pub fn last_inserted(&self) -> Option<Digest> {
        self.last_inserted
    }

    /// Counters and occupancy.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            len: self.entries.len(),
            capacity: self.capacity,
            enabled: self.enabled,
        }
    }
}
