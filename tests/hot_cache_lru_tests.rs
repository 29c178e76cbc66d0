//! Unit tests for the HotCache LRU eviction policy backing dimension id
//! resolution.
//!
//! Tests verify:
//! - Capacity enforcement and eviction triggers
//! - LRU ordering (oldest entries evicted first)
//! - Statistics tracking
//! - Concurrent access safety

use metric_store::storage::HotCache;
use std::sync::Arc;
use std::thread;

fn key(i: usize) -> String {
    format!("dimension-{}", i)
}

fn filled(capacity: usize, count: usize) -> HotCache<String, u64> {
    let cache = HotCache::with_capacity(capacity);
    for i in 0..count {
        cache.insert(key(i), i as u64);
    }
    cache
}

// ============================================================================
// BASIC FUNCTIONALITY TESTS
// ============================================================================

#[test]
fn test_insert_and_get() {
    let cache = HotCache::with_capacity(100);
    cache.insert(key(1), 1u64);

    assert!(cache.contains(&key(1)));
    assert_eq!(cache.get(&key(1)), Some(1));
}

#[test]
fn test_update_existing_entry() {
    let cache = HotCache::with_capacity(100);
    cache.insert(key(1), 1u64);
    cache.insert(key(1), 2u64);

    let stats = cache.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.total_evictions, 0);
    assert_eq!(cache.get(&key(1)), Some(2));
}

#[test]
fn test_remove_and_clear() {
    let cache = filled(100, 5);

    assert_eq!(cache.remove(&key(2)), Some(2));
    assert_eq!(cache.stats().entries, 4);
    assert!(!cache.contains(&key(2)));

    cache.clear();
    assert!(cache.is_empty());
    assert!(!cache.contains(&key(0)));
}

// ============================================================================
// CAPACITY AND EVICTION TESTS
// ============================================================================

#[test]
fn test_capacity_enforcement() {
    let cache = filled(10, 10);

    let stats = cache.stats();
    assert_eq!(stats.entries, 10, "Cache should be exactly at capacity");
    assert_eq!(stats.total_evictions, 0, "No eviction should have occurred yet");

    cache.insert(key(10), 10);

    let stats = cache.stats();
    assert_eq!(stats.entries, 10, "Cache should remain at capacity after eviction");
    assert_eq!(stats.total_evictions, 1);
    assert_eq!(stats.total_evicted, 1, "10% of 10 is one entry");
}

#[test]
fn test_evicts_least_recently_used() {
    let cache = filled(10, 10);

    // Touch the oldest entry so the next oldest goes first.
    assert_eq!(cache.get_and_mark(&key(0)), Some(0));
    cache.insert(key(10), 10);

    assert!(cache.contains(&key(0)), "Recently used entry should survive");
    assert!(!cache.contains(&key(1)), "Oldest entry should be evicted first");
}

#[test]
fn test_get_does_not_refresh_recency() {
    let cache = filled(3, 3);

    assert_eq!(cache.get(&key(0)), Some(0));
    cache.insert(key(3), 3);

    assert!(!cache.contains(&key(0)));
    assert!(cache.contains(&key(1)));
}

#[test]
fn test_evicts_a_tenth_per_pass() {
    let cache = filled(100, 100);
    cache.insert(key(100), 100);

    let stats = cache.stats();
    assert_eq!(stats.total_evictions, 1);
    assert_eq!(stats.total_evicted, 10);
    assert_eq!(stats.entries, 91);
    for i in 0..10 {
        assert!(!cache.contains(&key(i)));
    }
    assert!(cache.contains(&key(10)));
}

#[test]
fn test_multiple_evictions() {
    let cache = filled(5, 15);

    let stats = cache.stats();
    assert_eq!(stats.total_evictions, 10);
    assert_eq!(stats.total_evicted, 10);
    assert_eq!(stats.entries, 5, "Cache should remain at capacity");
    assert!(cache.contains(&key(14)));
    assert!(!cache.contains(&key(9)));
}

// ============================================================================
// STATISTICS TESTS
// ============================================================================

#[test]
fn test_hit_and_miss_counts() {
    let cache = filled(10, 2);

    cache.get(&key(0));
    cache.get_and_mark(&key(1));
    cache.get(&key(7));

    let stats = cache.stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
}

#[test]
fn test_cache_stats_accuracy() {
    let cache = filled(20, 15);

    let stats = cache.stats();
    assert_eq!(stats.entries, 15);
    assert_eq!(stats.capacity, 20);
    assert_eq!(stats.total_evictions, 0);

    for i in 0..5 {
        cache.remove(&key(i));
    }
    assert_eq!(cache.stats().entries, 10);
}

// ============================================================================
// CONCURRENT ACCESS TESTS
// ============================================================================

#[test]
fn test_concurrent_inserts() {
    let cache: Arc<HotCache<String, u64>> = Arc::new(HotCache::with_capacity(100));
    let mut handles = vec![];

    for thread_id in 0..4 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for i in 0..10 {
                cache.insert(format!("dimension-{}-{}", thread_id, i), i);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.stats().entries, 40);
}

#[test]
fn test_concurrent_eviction_stress() {
    let cache: Arc<HotCache<String, u64>> = Arc::new(HotCache::with_capacity(20));
    let mut handles = vec![];

    for thread_id in 0..3 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for i in 0..20 {
                let key = format!("dimension-{}-{}", thread_id, i);
                cache.insert(key.clone(), i);
                let _ = cache.get_and_mark(&key);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.stats();
    assert!(stats.entries <= 20);
    assert!(stats.total_evictions > 0, "Evictions should have occurred");
}

// ============================================================================
// EDGE CASES
// ============================================================================

#[test]
fn test_small_capacity() {
    let cache = filled(1, 1);
    cache.insert(key(2), 2);

    assert_eq!(cache.stats().entries, 1);
    assert!(!cache.contains(&key(0)));
    assert!(cache.contains(&key(2)));
}

#[test]
fn test_zero_capacity_holds_one() {
    let cache: HotCache<String, u64> = HotCache::with_capacity(0);
    assert_eq!(cache.capacity(), 1);
    cache.insert(key(0), 0);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_missing_entries() {
    let cache: HotCache<String, u64> = HotCache::with_capacity(10);

    assert!(cache.get(&key(0)).is_none());
    assert!(cache.get_and_mark(&key(0)).is_none());
    assert!(cache.remove(&key(0)).is_none());
    cache.clear();
    assert_eq!(cache.stats().entries, 0);
}

#[test]
fn test_default_capacity() {
    let cache: HotCache<String, u64> = HotCache::new();
    assert_eq!(cache.stats().capacity, 10_000, "Default capacity should be 10K");
}
