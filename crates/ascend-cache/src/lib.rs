// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! A segmented LRU cache with per-entry TTL.
//!
//! The cache is split into 16 shards indexed by an FNV-1a hash of the key so
//! that unrelated keys do not contend on one lock. LRU order is maintained
//! per shard: any read or write moves the entry to the front of the shard's
//! list and eviction removes the tail.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Number of shards. Must stay a power of two so the hash can be masked.
const SEGMENTS: usize = 16;

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// TTLs longer than this are configuration mistakes, not cache policy.
const MAX_TTL: Duration = Duration::from_secs(20 * 365 * 24 * 60 * 60);

const NIL: usize = usize::MAX;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    #[error("expiry time exceeds the supported range")]
    TtlOutOfRange,
    #[error("counter overflow")]
    Overflow,
}

/// Per-entry time to live. `None` disables expiry.
pub type Ttl = Option<Duration>;

struct Node<V> {
    key: String,
    value: V,
    expires_at: Option<Instant>,
    prev: usize,
    next: usize,
}

struct ShardInner<V> {
    index: HashMap<String, usize>,
    nodes: Vec<Node<V>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

pub struct ShardedCache<V> {
    shards: Vec<Mutex<ShardInner<V>>>,
}

fn check_ttl(ttl: Ttl) -> Result<(), CacheError> {
    match ttl {
        Some(d) if d > MAX_TTL => Err(CacheError::TtlOutOfRange),
        _ => Ok(()),
    }
}

fn expiry(ttl: Ttl) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

impl<V> ShardInner<V> {
    fn with_capacity(capacity: usize) -> Self {
        ShardInner {
            index: HashMap::with_capacity(capacity.min(SEGMENTS)),
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.nodes[i].prev, self.nodes[i].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[i].prev = NIL;
        self.nodes[i].next = NIL;
    }

    fn push_front(&mut self, i: usize) {
        self.nodes[i].prev = NIL;
        self.nodes[i].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = i;
        }
        self.head = i;
        if self.tail == NIL {
            self.tail = i;
        }
    }

    fn touch(&mut self, i: usize) {
        if self.head != i {
            self.unlink(i);
            self.push_front(i);
        }
    }

    fn remove(&mut self, i: usize) {
        self.unlink(i);
        self.index.remove(&self.nodes[i].key);
        self.free.push(i);
    }

    fn evict_tail(&mut self) {
        let tail = self.tail;
        if tail != NIL {
            self.remove(tail);
        }
    }

    /// Insert a fresh entry at the front, evicting the tail when full.
    fn insert(&mut self, key: &str, value: V, expires_at: Option<Instant>) {
        if self.index.len() >= self.capacity {
            self.evict_tail();
        }
        let node = Node {
            key: key.to_owned(),
            value,
            expires_at,
            prev: NIL,
            next: NIL,
        };
        let i = match self.free.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.push_front(i);
        self.index.insert(key.to_owned(), i);
    }

    fn is_expired(&self, i: usize, now: Instant) -> bool {
        matches!(self.nodes[i].expires_at, Some(at) if now > at)
    }

    /// Look up a live entry, expiring it on the spot if its TTL has passed.
    fn find_live(&mut self, key: &str, now: Instant) -> Option<usize> {
        let i = *self.index.get(key)?;
        if self.is_expired(i, now) {
            self.remove(i);
            return None;
        }
        Some(i)
    }
}

impl<V: Clone> ShardedCache<V> {
    /// Create a cache holding at most `max_entries` entries, spread evenly
    /// over the shards (each shard gets `ceil(max_entries / 16)` slots).
    pub fn new(max_entries: usize) -> Self {
        let per_shard = max_entries.div_ceil(SEGMENTS).max(1);
        ShardedCache {
            shards: (0..SEGMENTS)
                .map(|_| Mutex::new(ShardInner::with_capacity(per_shard)))
                .collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<ShardInner<V>> {
        let mut hash = FNV_OFFSET;
        for b in key.bytes() {
            hash = hash.wrapping_mul(FNV_PRIME);
            hash ^= u32::from(b);
        }
        &self.shards[(hash as usize) & (SEGMENTS - 1)]
    }

    fn lock(&self, key: &str) -> std::sync::MutexGuard<'_, ShardInner<V>> {
        // a poisoned shard only ever means a panic mid-operation elsewhere;
        // the map/list structure is still consistent
        match self.shard(key).lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut shard = self.lock(key);
        let i = shard.find_live(key, now)?;
        shard.touch(i);
        Some(shard.nodes[i].value.clone())
    }

    /// Create or replace the entry under `key`.
    pub fn set(&self, key: &str, value: V, ttl: Ttl) -> Result<(), CacheError> {
        check_ttl(ttl)?;
        let now = Instant::now();
        let expires_at = expiry(ttl);
        let mut shard = self.lock(key);
        match shard.find_live(key, now) {
            Some(i) => {
                shard.touch(i);
                shard.nodes[i].value = value;
                shard.nodes[i].expires_at = expires_at;
            }
            None => shard.insert(key, value, expires_at),
        }
        Ok(())
    }

    /// Store `value` only when no live entry exists. Returns whether this
    /// caller won; at most one concurrent caller can see `true`.
    pub fn set_if_absent(&self, key: &str, value: V, ttl: Ttl) -> Result<bool, CacheError> {
        check_ttl(ttl)?;
        let now = Instant::now();
        let expires_at = expiry(ttl);
        let mut shard = self.lock(key);
        match shard.find_live(key, now) {
            Some(i) => {
                shard.touch(i);
                Ok(false)
            }
            None => {
                shard.insert(key, value, expires_at);
                Ok(true)
            }
        }
    }

    pub fn delete(&self, key: &str) {
        let mut shard = self.lock(key);
        if let Some(&i) = shard.index.get(key) {
            shard.remove(i);
        }
    }

    /// Shard (list length, index size) pairs, for integrity checks.
    pub fn shard_sizes(&self) -> Vec<(usize, usize)> {
        self.shards
            .iter()
            .map(|s| {
                let shard = match s.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let mut len = 0;
                let mut i = shard.head;
                while i != NIL {
                    len += 1;
                    i = shard.nodes[i].next;
                }
                (len, shard.index.len())
            })
            .collect()
    }
}

impl ShardedCache<i64> {
    /// Add one to the counter under `key`, initializing a missing or expired
    /// entry to 1. The whole operation holds the shard lock.
    pub fn increment(&self, key: &str, ttl: Ttl) -> Result<i64, CacheError> {
        self.adjust(key, ttl, 1)
    }

    /// Subtract one from the counter under `key`, initializing a missing or
    /// expired entry to -1.
    pub fn decrement(&self, key: &str, ttl: Ttl) -> Result<i64, CacheError> {
        self.adjust(key, ttl, -1)
    }

    fn adjust(&self, key: &str, ttl: Ttl, delta: i64) -> Result<i64, CacheError> {
        check_ttl(ttl)?;
        let now = Instant::now();
        let expires_at = expiry(ttl);
        let mut shard = self.lock(key);
        match shard.find_live(key, now) {
            Some(i) => {
                let next = shard.nodes[i]
                    .value
                    .checked_add(delta)
                    .ok_or(CacheError::Overflow)?;
                shard.touch(i);
                shard.nodes[i].value = next;
                shard.nodes[i].expires_at = expires_at;
                Ok(next)
            }
            None => {
                shard.insert(key, delta, expires_at);
                Ok(delta)
            }
        }
    }
}
