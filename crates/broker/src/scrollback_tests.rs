// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use proptest::prelude::*;

use super::*;

fn cache() -> ScrollbackCache {
    ScrollbackCache::new(Duration::from_secs(7 * 24 * 3600), 64)
}

#[test]
fn append_and_read_all() {
    let cache = cache();
    cache.append(1, b"hello");
    cache.append(1, b" world");
    assert_eq!(cache.read_all(1), b"hello world");
    assert_eq!(cache.read_all(2), b"");
}

#[test]
fn tail_returns_last_n() {
    let cache = cache();
    cache.append(1, b"0123456789");
    assert_eq!(cache.read_tail(1, 4), b"6789");
    assert_eq!(cache.read_tail(1, 100), b"0123456789");
    assert_eq!(cache.read_tail(9, 4), b"");
}

#[test]
fn cap_drops_oldest() {
    let cache = ScrollbackCache::new(Duration::from_secs(60), 8);
    cache.append(1, b"abcdef");
    cache.append(1, b"ghij");
    assert_eq!(cache.read_all(1), b"cdefghij");
}

#[test]
fn empty_append_is_a_no_op() {
    let cache = ScrollbackCache::new(Duration::from_millis(0), 64);
    cache.append(1, b"");
    assert!(cache.is_empty());

    // A zero TTL expires everything on the next sweep; an empty append must
    // not have created (or refreshed) a buffer.
    cache.append(2, b"x");
    std::thread::sleep(Duration::from_millis(5));
    cache.append(2, b"");
    let evicted = cache.sweep();
    assert_eq!(evicted, vec![2]);
}

#[test]
fn clear_and_take() {
    let cache = cache();
    cache.append(1, b"bytes");
    assert_eq!(cache.take(1), b"bytes");
    assert_eq!(cache.read_all(1), b"");

    cache.append(2, b"more");
    cache.clear(2);
    assert_eq!(cache.read_all(2), b"");
}

#[test]
fn sweep_only_evicts_idle_buffers() {
    let cache = ScrollbackCache::new(Duration::from_millis(20), 64);
    cache.append(1, b"old");
    std::thread::sleep(Duration::from_millis(30));
    cache.append(2, b"fresh");
    let mut evicted = cache.sweep();
    evicted.sort_unstable();
    assert_eq!(evicted, vec![1]);
    assert_eq!(cache.read_all(2), b"fresh");
}

proptest! {
    /// Whatever the append pattern, read_all sees the suffix of the
    /// concatenated input bounded by the cap, and read_tail(n) is the last
    /// n bytes of that.
    #[test]
    fn reads_are_suffixes(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 0..16), tail in 0usize..96) {
        let cap = 48;
        let cache = ScrollbackCache::new(Duration::from_secs(60), cap);
        let mut reference: Vec<u8> = Vec::new();
        for chunk in &chunks {
            cache.append(1, chunk);
            reference.extend_from_slice(chunk);
        }
        let expected: Vec<u8> = {
            let skip = reference.len().saturating_sub(cap);
            reference[skip..].to_vec()
        };
        prop_assert_eq!(cache.read_all(1), expected.clone());

        let skip = expected.len().saturating_sub(tail);
        prop_assert_eq!(cache.read_tail(1, tail), expected[skip..].to_vec());
    }
}
