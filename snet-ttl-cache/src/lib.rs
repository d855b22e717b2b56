//! A bounded, ordered LRU cache with per-entry TTL, hit counting, and
//! popularity-driven prefetch ranking.
//!
//! Grounded in `original_source/cache/lru.go`: a doubly-linked list ordered
//! most-recently-used at the front, plus a key index into the list. The
//! `container/list` + `map[interface{}]*list.Element` pair there becomes an
//! arena of slots (`Vec<Option<Slot<K, V>>>` with a free list) indexed by a
//! `HashMap<K, usize>`, per the REDESIGN FLAGS note to avoid a hand-rolled
//! pointer-chasing linked list.
//!
//! All mutating and reading operations take the single internal
//! [`parking_lot::Mutex`] for their duration, matching the linearizability
//! guarantee the spec requires.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use thiserror::Error;

const PREFETCH_MIN_HIT_COUNT: u64 = 10;
const PREFETCH_LEFT_TTL_PCT: f64 = 0.10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache capacity must be greater than zero")]
    InvalidCapacity,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    New,
    Existed,
}

/// A snapshot of a cache entry's prefetch-relevant metadata. Never carries
/// the value itself — the prefetcher is expected to issue a fresh
/// resolution rather than reuse the cached bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo<K> {
    pub key: K,
    pub hit_count: u64,
    pub ttl: Duration,
}

struct Slot<K, V> {
    key: K,
    value: V,
    hit_count: u64,
    created_at: Instant,
    ttl: Duration,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<K, V> Slot<K, V> {
    fn expires_at(&self) -> Instant {
        self.created_at + self.ttl
    }
}

struct Inner<K, V> {
    capacity: usize,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().expect("unlink of empty slot");
            (slot.prev, slot.next)
        };

        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[idx].as_mut().unwrap();
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove_slot(&mut self, idx: usize) -> Slot<K, V> {
        self.unlink(idx);
        let slot = self.slots[idx].take().expect("remove of empty slot");
        self.index.remove(&slot.key);
        self.free.push(idx);
        slot
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn evict_tail_if_over_capacity(&mut self) {
        while self.len() > self.capacity {
            if let Some(tail) = self.tail {
                self.remove_slot(tail);
            } else {
                break;
            }
        }
    }
}

/// A bounded, ordered doubly-linked map from `K` to `V` with TTL-based
/// expiry, hit counting, and prefetch ranking. Guarded by a single mutex.
pub struct TtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::InvalidCapacity);
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                capacity,
                slots: Vec::new(),
                free: Vec::new(),
                index: HashMap::new(),
                head: None,
                tail: None,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// On hit: increments `hit_count`, moves the entry to the front, and
    /// returns the value. An expired entry is removed and treated as a
    /// miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(key)?;

        let now = Instant::now();
        let expired = inner.slots[idx].as_ref().unwrap().expires_at() <= now;
        if expired {
            inner.remove_slot(idx);
            return None;
        }

        let slot = inner.slots[idx].as_mut().unwrap();
        slot.hit_count += 1;
        let value = slot.value.clone();
        inner.move_to_front(idx);

        Some(value)
    }

    /// On an existing key: updates the value and TTL in place (leaving
    /// `created_at` untouched), refreshes recency, and increments
    /// `hit_count`. On a new key: inserts at the front and evicts the tail
    /// if the cache is now over capacity.
    pub fn add(&self, key: K, value: V, ttl: Duration) -> AddOutcome {
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.index.get(&key) {
            let slot = inner.slots[idx].as_mut().unwrap();
            slot.value = value;
            slot.ttl = ttl;
            slot.hit_count += 1;
            inner.move_to_front(idx);
            return AddOutcome::Existed;
        }

        let slot = Slot {
            key: key.clone(),
            value,
            hit_count: 1,
            created_at: Instant::now(),
            ttl,
            prev: None,
            next: None,
        };

        let idx = match inner.free.pop() {
            Some(idx) => {
                inner.slots[idx] = Some(slot);
                idx
            }
            None => {
                inner.slots.push(Some(slot));
                inner.slots.len() - 1
            }
        };

        inner.index.insert(key, idx);
        inner.push_front(idx);
        inner.evict_tail_if_over_capacity();

        AddOutcome::New
    }

    pub fn evict(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        match inner.index.get(key).copied() {
            Some(idx) => {
                inner.remove_slot(idx);
                true
            }
            None => false,
        }
    }

    /// Snapshot the first `n` entries from the MRU side whose hit count is
    /// at least [`PREFETCH_MIN_HIT_COUNT`] and whose remaining-TTL fraction
    /// is at most [`PREFETCH_LEFT_TTL_PCT`].
    pub fn prefetch_top_n(&self, n: usize) -> Vec<ItemInfo<K>> {
        let inner = self.inner.lock();
        let now = Instant::now();

        let mut out = Vec::with_capacity(n.min(inner.len()));
        let mut cur = inner.head;
        let mut seen = 0;

        while let Some(idx) = cur {
            if seen >= n {
                break;
            }
            let slot = inner.slots[idx].as_ref().unwrap();

            if should_prefetch(slot, now) {
                out.push(ItemInfo {
                    key: slot.key.clone(),
                    hit_count: slot.hit_count,
                    ttl: slot.ttl,
                });
            }

            cur = slot.next;
            seen += 1;
        }

        out
    }
}

fn should_prefetch<K, V>(slot: &Slot<K, V>, now: Instant) -> bool {
    if slot.hit_count < PREFETCH_MIN_HIT_COUNT {
        return false;
    }

    let remaining = slot.expires_at().saturating_duration_since(now);
    let fraction = remaining.as_secs_f64() / slot.ttl.as_secs_f64();

    fraction <= PREFETCH_LEFT_TTL_PCT
}
