// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cross-thread behavior of the sharded cache.
//!
//! These tests verify:
//! - Shard list/index integrity under a concurrent mixed workload
//! - At most one winner for concurrent set-if-absent on one key
//! - Counter adjustments are not lost across threads

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ascend_cache::ShardedCache;

#[test]
fn mixed_workload_keeps_shards_consistent() {
    let cache = Arc::new(ShardedCache::new(256));
    let mut handles = Vec::new();
    for t in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for n in 0..500 {
                let key = format!("worker-{t}-key-{}", n % 40);
                match n % 5 {
                    0 => {
                        let _ = cache.set(&key, n as i64, Some(Duration::from_millis(50)));
                    }
                    1 => {
                        let _ = cache.get(&key);
                    }
                    2 => {
                        let _ = cache.set_if_absent(&key, n as i64, None);
                    }
                    3 => cache.delete(&key),
                    _ => {
                        let _ = cache.set(&key, n as i64, None);
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    for (list_len, index_len) in cache.shard_sizes() {
        assert_eq!(list_len, index_len);
    }
}

#[test]
fn concurrent_set_if_absent_has_one_winner_per_key() {
    let cache = Arc::new(ShardedCache::new(512));
    for round in 0..20 {
        let key = format!("round-{round}");
        let mut handles = Vec::new();
        for n in 0..8 {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            handles.push(thread::spawn(move || {
                cache.set_if_absent(&key, n as i64, None).unwrap()
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1, "round {round} had {winners} winners");
    }
}

#[test]
fn counter_adjustments_are_not_lost() {
    let cache = Arc::new(ShardedCache::new(64));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                cache.increment("hits", None).unwrap();
            }
            for _ in 0..400 {
                cache.decrement("hits", None).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(cache.get("hits"), Some(8 * (1000 - 400)));
}
