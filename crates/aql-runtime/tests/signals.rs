//! Signal values, waits and cross-thread ordering.

use aql_runtime::{Condition, MemoryOrder, Runtime, RuntimeConfig, RuntimeError, WaitState};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

const WAIT_NS: u64 = 5_000_000_000;

fn runtime() -> Runtime {
    Runtime::open(RuntimeConfig::default().with_worker_threads(1)).unwrap()
}

#[test]
fn test_or_accumulates_every_bit() {
    let runtime = runtime();
    let signal = runtime.signal_create(0, 0, &[]).unwrap();

    // 8 threads, 8 single-bit masks each, covering the sign bit and high word
    thread::scope(|scope| {
        for thread in 0..8 {
            let runtime = &runtime;
            scope.spawn(move || {
                for bit in (thread..64).step_by(8) {
                    runtime.signal_or(signal, 1i64 << bit, MemoryOrder::AcqRel).unwrap();
                }
            });
        }
    });
    assert_eq!(runtime.signal_load(signal, MemoryOrder::Acquire), Ok(-1));

    assert_eq!(runtime.signal_and(signal, 0x00FF, MemoryOrder::AcqRel), Ok(-1));
    assert_eq!(runtime.signal_xor(signal, 0x0F, MemoryOrder::AcqRel), Ok(0x00FF));
    assert_eq!(runtime.signal_load(signal, MemoryOrder::Relaxed), Ok(0xF0));
}

#[test]
fn test_concurrent_compare_and_swap_has_one_winner() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 1000;

    let runtime = runtime();
    let signal = runtime.signal_create(0, 0, &[]).unwrap();
    let wins: Vec<AtomicUsize> = (0..ROUNDS).map(|_| AtomicUsize::new(0)).collect();
    let barrier = Barrier::new(THREADS + 1);

    thread::scope(|scope| {
        for id in 0..THREADS {
            let (runtime, wins, barrier) = (&runtime, &wins, &barrier);
            scope.spawn(move || {
                for round in &wins[..] {
                    barrier.wait();
                    let seen = runtime
                        .signal_compare_and_swap(signal, 0, id as i64 + 1, MemoryOrder::AcqRel)
                        .unwrap();
                    if seen == 0 {
                        round.fetch_add(1, Ordering::Relaxed);
                    }
                    barrier.wait();
                }
            });
        }
        for _ in 0..ROUNDS {
            runtime.signal_store(signal, 0, MemoryOrder::Release).unwrap();
            barrier.wait();
            barrier.wait();
            let winner = runtime.signal_load(signal, MemoryOrder::Acquire).unwrap();
            assert!((1..=THREADS as i64).contains(&winner));
        }
    });

    for (round, count) in wins.iter().enumerate() {
        assert_eq!(count.load(Ordering::Relaxed), 1, "round {round}");
    }
}

#[test]
fn test_arithmetic_returns_previous_value() {
    let runtime = runtime();
    let signal = runtime.signal_create(10, 0, &[]).unwrap();

    assert_eq!(runtime.signal_add(signal, 5, MemoryOrder::Relaxed), Ok(10));
    assert_eq!(runtime.signal_subtract(signal, 20, MemoryOrder::Relaxed), Ok(15));
    assert_eq!(runtime.signal_exchange(signal, 7, MemoryOrder::AcqRel), Ok(-5));
    assert_eq!(runtime.signal_compare_and_swap(signal, 0, 1, MemoryOrder::AcqRel), Ok(7));
    assert_eq!(runtime.signal_compare_and_swap(signal, 7, 1, MemoryOrder::AcqRel), Ok(7));
    assert_eq!(runtime.signal_load(signal, MemoryOrder::Relaxed), Ok(1));
}

#[test]
fn test_release_acquire_is_transitive() {
    let runtime = runtime();
    let first = runtime.signal_create(0, 0, &[]).unwrap();
    let second = runtime.signal_create(0, 0, &[]).unwrap();
    let data = AtomicU64::new(0);

    for _ in 0..100 {
        data.store(0, Ordering::Relaxed);
        runtime.signal_store(first, 0, MemoryOrder::Relaxed).unwrap();
        runtime.signal_store(second, 0, MemoryOrder::Relaxed).unwrap();

        thread::scope(|scope| {
            let (runtime, data) = (&runtime, &data);
            let reader = scope.spawn(move || {
                let deadline = runtime.system_timestamp().unwrap() + WAIT_NS;
                runtime
                    .signal_wait(second, Condition::Eq, 1, deadline, WaitState::Active)
                    .unwrap();
                data.load(Ordering::Relaxed)
            });
            scope.spawn(move || {
                let deadline = runtime.system_timestamp().unwrap() + WAIT_NS;
                runtime
                    .signal_wait(first, Condition::Eq, 1, deadline, WaitState::Active)
                    .unwrap();
                runtime.signal_store(second, 1, MemoryOrder::Release).unwrap();
            });
            scope.spawn(move || {
                data.store(42, Ordering::Relaxed);
                runtime.signal_store(first, 1, MemoryOrder::Release).unwrap();
            });
            assert_eq!(reader.join().unwrap(), 42);
        });
    }
}

#[test]
fn test_blocked_wait_wakes_on_subtract() {
    let runtime = runtime();
    let signal = runtime.signal_create(1, 0, &[]).unwrap();

    thread::scope(|scope| {
        let runtime = &runtime;
        let waiter = scope.spawn(move || {
            let deadline = runtime.system_timestamp().unwrap() + WAIT_NS;
            runtime.signal_wait(signal, Condition::Lt, 1, deadline, WaitState::Blocked)
        });
        thread::sleep(Duration::from_millis(10));
        runtime.signal_subtract(signal, 1, MemoryOrder::Release).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(0));
    });
}

#[test]
fn test_wait_timeout_returns_current_value() {
    let runtime = runtime();
    let signal = runtime.signal_create(3, 0, &[]).unwrap();
    let deadline = runtime.system_timestamp().unwrap() + 2_000_000;

    let value = runtime
        .signal_wait(signal, Condition::Eq, 0, deadline, WaitState::Blocked)
        .unwrap();
    assert_eq!(value, 3);
    assert!(runtime.system_timestamp().unwrap() >= deadline);
}

#[test]
fn test_destroyed_signal_is_stale() {
    let runtime = runtime();
    let signal = runtime.signal_create(0, 0, &[]).unwrap();
    let resolved = runtime.signal(signal).unwrap();
    runtime.signal_destroy(signal).unwrap();

    let stale = Err(RuntimeError::InvalidSignal(signal.to_raw()));
    assert_eq!(runtime.signal_load(signal, MemoryOrder::Relaxed), stale);
    assert_eq!(resolved.load(MemoryOrder::Relaxed), stale);
    assert_eq!(runtime.signal_destroy(signal), Err(RuntimeError::InvalidSignal(signal.to_raw())));

    // The slot is reused under a new generation
    let reused = runtime.signal_create(0, 0, &[]).unwrap();
    assert_ne!(reused, signal);
    assert_eq!(runtime.signal_load(signal, MemoryOrder::Relaxed), stale);
}
