//! Round-robin acquisition properties of the client pool.
//!
//! Pools here use a shared transport so that large sizes stay cheap to build;
//! the rotation logic does not depend on the transport mode.

use conn_reuse_probe::services::{HttpClientPool, PoolConfig, ProxyMode, TransportMode, TransportParams};
use proptest::prelude::*;
use std::sync::Mutex;
use std::thread;

fn pool(size: usize) -> HttpClientPool {
    HttpClientPool::new(PoolConfig {
        size,
        transport_mode: TransportMode::Shared,
        transport: TransportParams {
            proxy: ProxyMode::Disabled,
            ..TransportParams::default()
        },
        ..PoolConfig::default()
    })
    .unwrap()
}

/// Spawns `callers` threads that each acquire `per_caller` times and returns
/// every index handed out.
fn acquire_concurrently(pool: &HttpClientPool, callers: usize, per_caller: usize) -> Vec<usize> {
    let seen = Mutex::new(Vec::with_capacity(callers * per_caller));
    thread::scope(|scope| {
        for _ in 0..callers {
            scope.spawn(|| {
                let local: Vec<usize> = (0..per_caller).map(|_| pool.acquire().index()).collect();
                seen.lock().unwrap().extend(local);
            });
        }
    });
    seen.into_inner().unwrap()
}

fn assert_balanced(size: usize, indices: &[usize]) {
    let total = indices.len();
    let mut counts = vec![0usize; size];
    for &index in indices {
        assert!(index < size, "index {index} out of range for pool of {size}");
        counts[index] += 1;
    }

    let full_cycles = total / size;
    let remainder = total % size;
    for (index, count) in counts.iter().enumerate() {
        let expected = full_cycles + usize::from(index < remainder);
        assert_eq!(*count, expected, "index {index} handed out {count} times");
    }
}

#[test]
fn test_wraparound_returns_first_client() {
    for size in [1, 2, 3, 10, 64] {
        let pool = pool(size);
        let first = pool.acquire().index();
        for _ in 1..size {
            pool.acquire();
        }
        assert_eq!(first, 0);
        assert_eq!(pool.acquire().index(), 0, "call {} should wrap for size {size}", size + 1);
    }
}

#[test]
fn test_concurrent_acquire_is_balanced() {
    let pool = pool(10);
    let indices = acquire_concurrently(&pool, 16, 125);
    assert_eq!(indices.len(), 2000);
    assert_balanced(10, &indices);

    // rotation keeps going from where the racing callers left it
    assert_eq!(pool.acquire().index(), 0);
}

#[test]
fn test_uneven_concurrent_acquire() {
    let pool = pool(7);
    let indices = acquire_concurrently(&pool, 1000, 3);
    assert_balanced(7, &indices);
    assert_eq!(pool.acquire().index(), 3000 % 7);
}

#[test]
fn test_large_pool_under_contention() {
    let pool = pool(10_000);
    let indices = acquire_concurrently(&pool, 1000, 12);
    assert_balanced(10_000, &indices);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    #[test]
    fn sequential_acquire_follows_index_order(size in 1usize..64, calls in 1usize..300) {
        let pool = pool(size);
        for k in 0..calls {
            prop_assert_eq!(pool.acquire().index(), k % size);
        }
    }

    #[test]
    fn concurrent_acquire_never_skips_or_duplicates(
        size in 1usize..50,
        callers in 1usize..16,
        per_caller in 1usize..40,
    ) {
        let pool = pool(size);
        let indices = acquire_concurrently(&pool, callers, per_caller);
        prop_assert_eq!(indices.len(), callers * per_caller);
        assert_balanced(size, &indices);
        prop_assert_eq!(pool.acquire().index(), (callers * per_caller) % size);
    }
}
