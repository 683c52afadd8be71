//! Queue index semantics: initial values, cumulative reservation, CAS races
//! and ordering between producers that publish out of order.

use aql_runtime::{
    BarrierAndPacket, Condition, Features, MemoryOrder, PacketHeader, PacketType, Queue, QueueOptions, QueueType,
    Runtime, RuntimeConfig, RuntimeError, SignalHandle, WaitState,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT_NS: u64 = 5_000_000_000;

fn runtime() -> Runtime {
    Runtime::open(RuntimeConfig::default().with_worker_threads(2)).unwrap()
}

fn soft_queue(runtime: &Runtime, size: u32) -> Arc<aql_runtime::Queue> {
    let system = runtime.find_region(|r| r.name() == "system").unwrap();
    let doorbell = runtime.signal_create(-1, 0, &[]).unwrap();
    runtime
        .soft_queue_create(system.handle(), size, QueueType::Multi, Features::AGENT_DISPATCH, doorbell)
        .unwrap()
}

#[test]
fn test_new_queue_indices_start_at_zero() {
    let runtime = runtime();
    let gpu = runtime.find_agent(|a| a.name() == "gpu0").unwrap();
    let queue = runtime
        .queue_create(gpu.handle(), 256, QueueType::Multi, QueueOptions::default())
        .unwrap();

    assert_eq!(queue.size(), 256);
    assert_eq!(queue.load_read_index(MemoryOrder::Acquire), Ok(0));
    assert_eq!(queue.load_write_index(MemoryOrder::Acquire), Ok(0));
    assert_eq!(queue.base_address() % 64, 0);
}

#[test]
fn test_add_write_index_is_cumulative() {
    let runtime = runtime();
    let queue = soft_queue(&runtime, 64);

    let mut expected = 0u64;
    for jj in 0..64u64 {
        let previous = queue.add_write_index(jj, MemoryOrder::AcqRel).unwrap();
        assert_eq!(previous, expected);
        expected += jj;
    }
    assert_eq!(queue.load_write_index(MemoryOrder::Relaxed), Ok(expected));
}

#[test]
fn test_compare_and_swap_has_one_winner() {
    let runtime = runtime();
    let queue = soft_queue(&runtime, 64);

    for _ in 0..1000 {
        queue.store_write_index(0, MemoryOrder::Release).unwrap();
        let observed: Vec<u64> = thread::scope(|scope| {
            let contenders: Vec<_> = (1..=2u64)
                .map(|value| {
                    let queue = &queue;
                    scope.spawn(move || {
                        queue
                            .compare_and_swap_write_index(0, value, MemoryOrder::AcqRel)
                            .unwrap()
                    })
                })
                .collect();
            contenders.into_iter().map(|c| c.join().unwrap()).collect()
        });

        let winners = observed.iter().filter(|&&o| o == 0).count();
        assert_eq!(winners, 1, "observed {observed:?}");
        let loser = observed.iter().find(|&&o| o != 0).copied().unwrap();
        assert_eq!(queue.load_write_index(MemoryOrder::Acquire), Ok(loser));
    }
}

#[test]
fn test_reserve_rejects_bad_counts() {
    let runtime = runtime();
    let queue = soft_queue(&runtime, 64);
    assert!(matches!(queue.reserve(0), Err(RuntimeError::InvalidArgument(_))));
    assert!(matches!(queue.reserve(65), Err(RuntimeError::InvalidArgument(_))));
    assert_eq!(queue.reserve(64), Ok(0));
    assert_eq!(queue.load_write_index(MemoryOrder::Relaxed), Ok(64));
}

fn publish_barriers(queue: &Queue, first: u64, completions: &[SignalHandle]) {
    for (index, &completion) in (first..).zip(completions) {
        let packet = BarrierAndPacket {
            completion_signal: completion.to_raw(),
            ..Default::default()
        };
        queue.write_barrier_and(index, &packet).unwrap();
        queue.publish(index, PacketHeader::new(PacketType::BarrierAnd), 0).unwrap();
    }
    queue.ring_doorbell(first + completions.len() as u64 - 1).unwrap();
}

fn wait_read_index(runtime: &Runtime, queue: &Queue, target: u64) -> u64 {
    let deadline = runtime.system_timestamp().unwrap() + WAIT_NS;
    let mut read = queue.load_read_index(MemoryOrder::Acquire).unwrap();
    while read < target && runtime.system_timestamp().unwrap() < deadline {
        thread::yield_now();
        read = queue.load_read_index(MemoryOrder::Acquire).unwrap();
    }
    read
}

#[test]
fn test_processor_stops_at_the_first_unpublished_range() {
    let runtime = runtime();
    let gpu = runtime.find_agent(|a| a.name() == "gpu0").unwrap();
    let queue = runtime
        .queue_create(gpu.handle(), 64, QueueType::Multi, QueueOptions::default())
        .unwrap();
    let signals = |n: usize| -> Vec<SignalHandle> {
        (0..n).map(|_| runtime.signal_create(1, 0, &[]).unwrap()).collect()
    };
    let (a, b, c) = (signals(3), signals(2), signals(4));
    let value = |signal: SignalHandle| runtime.signal_load(signal, MemoryOrder::Acquire).unwrap();

    // Three producers reserve back to back; only the first one publishes
    let first_a = queue.reserve(a.len() as u64).unwrap();
    let first_b = queue.reserve(b.len() as u64).unwrap();
    let first_c = queue.reserve(c.len() as u64).unwrap();
    assert_eq!((first_a, first_b, first_c), (0, 3, 5));
    publish_barriers(&queue, first_a, &a);

    assert_eq!(wait_read_index(&runtime, &queue, 3), 3);
    assert!(a.iter().all(|&s| value(s) == 0));
    thread::sleep(Duration::from_millis(20));
    assert!(b.iter().chain(&c).all(|&s| value(s) == 1));
    assert_eq!(queue.load_read_index(MemoryOrder::Acquire), Ok(3));

    // The last range publishes before the middle one
    publish_barriers(&queue, first_c, &c);
    thread::sleep(Duration::from_millis(20));
    assert!(b.iter().chain(&c).all(|&s| value(s) == 1));
    assert_eq!(queue.load_read_index(MemoryOrder::Acquire), Ok(3));

    publish_barriers(&queue, first_b, &b);
    assert_eq!(wait_read_index(&runtime, &queue, 9), 9);
    let deadline = runtime.system_timestamp().unwrap() + WAIT_NS;
    for &signal in b.iter().chain(&c) {
        let done = runtime.signal_wait(signal, Condition::Eq, 0, deadline, WaitState::Blocked);
        assert_eq!(done, Ok(0));
    }
    assert_eq!(queue.load_write_index(MemoryOrder::Acquire), Ok(9));
}

#[test]
fn test_many_producers_fill_every_slot() {
    let runtime = runtime();
    let gpu = runtime.find_agent(|a| a.name() == "gpu0").unwrap();
    let queue = runtime
        .queue_create(gpu.handle(), 64, QueueType::Multi, QueueOptions::default())
        .unwrap();
    let done = runtime.signal_create(4 * 100, 0, &[]).unwrap();

    thread::scope(|scope| {
        for _ in 0..4 {
            let queue = &queue;
            scope.spawn(move || {
                for _ in 0..100 {
                    queue.barrier_and(&[], Some(done)).unwrap();
                }
            });
        }
    });

    let deadline = runtime.system_timestamp().unwrap() + WAIT_NS;
    let value = runtime
        .signal_wait(done, Condition::Eq, 0, deadline, WaitState::Blocked)
        .unwrap();
    assert_eq!(value, 0);
    assert_eq!(queue.load_write_index(MemoryOrder::Acquire), Ok(400));
}
