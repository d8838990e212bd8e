//! Tests for [`ByteBudgetCache`].

use std::sync::Arc;

use bytes::Bytes;

use tessera::{ByteBudgetCache, CacheStats, TesseraError};

fn buffer(size: usize) -> Bytes {
    Bytes::from(vec![3u8; size])
}

// =========================================================================
// Budget
// =========================================================================

#[test]
fn size_never_exceeds_budget() {
    let cache = ByteBudgetCache::new(1000);
    for i in 0..50 {
        cache.put(format!("tile-{i}"), buffer(30 + i * 7)).unwrap();
        let stats = cache.stats();
        assert!(stats.size_bytes <= stats.max_bytes, "after insert {i}: {stats:?}");
    }
}

#[test]
fn least_recently_used_is_evicted_first() {
    let cache = ByteBudgetCache::new(300);
    cache.put("a", buffer(100)).unwrap();
    cache.put("b", buffer(100)).unwrap();
    cache.put("c", buffer(100)).unwrap();
    cache.get("a");

    cache.put("d", buffer(100)).unwrap();

    assert!(cache.contains("a"));
    assert!(!cache.contains("b"));
    assert!(cache.contains("c"));
    assert!(cache.contains("d"));
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn large_insert_evicts_several_entries() {
    let cache = ByteBudgetCache::new(300);
    cache.put("a", buffer(100)).unwrap();
    cache.put("b", buffer(100)).unwrap();
    cache.put("c", buffer(100)).unwrap();

    cache.put("big", buffer(250)).unwrap();

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().size_bytes, 250);
    assert_eq!(cache.stats().evictions, 3);
}

#[test]
fn oversized_item_is_rejected_after_emptying() {
    let cache = ByteBudgetCache::new(100);
    cache.put("a", buffer(50)).unwrap();

    let err = cache.put("huge", buffer(101)).unwrap_err();
    assert!(matches!(
        err,
        TesseraError::CacheCapacityExceeded { size: 101, max: 100 }
    ));
    assert!(cache.is_empty());
    assert_eq!(cache.stats().size_bytes, 0);
}

#[test]
fn item_exactly_at_budget_fits() {
    let cache = ByteBudgetCache::new(100);
    cache.put("full", buffer(100)).unwrap();
    assert_eq!(cache.stats().utilization(), 1.0);
}

// =========================================================================
// Entries and statistics
// =========================================================================

#[test]
fn get_returns_the_same_buffer() {
    let cache = ByteBudgetCache::new(100);
    let data = buffer(10);
    let ptr = data.as_ptr();
    cache.put("a", data).unwrap();
    assert_eq!(cache.get("a").unwrap().as_ptr(), ptr);
}

#[test]
fn entry_carries_metadata() {
    let cache = ByteBudgetCache::new(100);
    cache.put_with_level("img#level=4", buffer(10), 4).unwrap();
    let entry = cache.get_entry("img#level=4").unwrap();
    assert_eq!(entry.key, "img#level=4");
    assert_eq!(entry.size_bytes, 10);
    assert_eq!(entry.quality_level, 4);
}

#[test]
fn hit_rate_counts_lookups() {
    let cache = ByteBudgetCache::new(100);
    cache.put("a", buffer(1)).unwrap();
    cache.get("a");
    cache.get("a");
    cache.get("a");
    cache.get("missing");

    let stats = cache.stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hit_rate(), 0.75);
    assert_eq!(CacheStats::default().hit_rate(), 0.0);
}

#[test]
fn remove_and_clear() {
    let cache = ByteBudgetCache::new(100);
    cache.put("a", buffer(10)).unwrap();
    cache.put("b", buffer(20)).unwrap();

    assert_eq!(cache.remove("a").map(|b| b.len()), Some(10));
    assert!(cache.remove("a").is_none());
    assert_eq!(cache.stats().size_bytes, 20);

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.stats().size_bytes, 0);
}

#[test]
fn concurrent_writers_respect_budget() {
    let cache = Arc::new(ByteBudgetCache::new(4096));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    cache.put(format!("{t}/{i}"), buffer(64)).unwrap();
                    cache.get(&format!("{t}/{}", i / 2));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.stats();
    assert!(stats.size_bytes <= 4096);
    assert_eq!(stats.size_bytes, stats.entry_count * 64);
}
