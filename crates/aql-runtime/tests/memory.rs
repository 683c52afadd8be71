//! Region allocation, registration, copies and ownership transfer.

use aql_runtime::{
    AccessPermission, AgentHandle, DevicePtr, Features, QueueType, Runtime, RuntimeConfig, RuntimeError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn runtime() -> Runtime {
    Runtime::open(RuntimeConfig::default().with_worker_threads(1)).unwrap()
}

fn region(runtime: &Runtime, name: &str) -> Arc<aql_runtime::Region> {
    runtime.find_region(|r| r.name() == name).unwrap()
}

#[test]
fn test_allocate_free_round_trip_on_every_region() {
    let runtime = runtime();
    let mut seen = HashSet::new();

    for agent in runtime.agents() {
        for region in runtime.agent_regions(agent.handle()).unwrap() {
            if !seen.insert(region.handle()) {
                continue;
            }
            let info = region.info().clone();
            if !info.alloc_allowed {
                assert!(matches!(
                    runtime.allocate(region.handle(), 1),
                    Err(RuntimeError::InvalidAllocation(_))
                ));
                continue;
            }

            let ptr = runtime.allocate(region.handle(), info.granule + 1).unwrap();
            assert_eq!(ptr.address() % info.alignment as u64, 0);
            assert_eq!(runtime.region_of(ptr), Ok(Some(region.handle())));
            assert_eq!(runtime.region_of(ptr.offset(info.granule as u64)), Ok(Some(region.handle())));

            let allocation = runtime.allocation_info(ptr).unwrap().unwrap();
            assert_eq!(allocation.size, 2 * info.granule);
            assert_eq!(region.bytes_in_use(), 2 * info.granule);

            runtime.free(ptr).unwrap();
            assert_eq!(region.bytes_in_use(), 0);
            assert_eq!(runtime.region_of(ptr), Ok(None));
            assert!(matches!(runtime.free(ptr), Err(RuntimeError::InvalidArgument(_))));
        }
    }
    assert_eq!(seen.len(), 4);
}

#[test]
fn test_allocation_limits() {
    let runtime = runtime();
    let dsp = region(&runtime, "dsp0-local");
    let info = dsp.info().clone();

    assert!(matches!(runtime.allocate(dsp.handle(), 0), Err(RuntimeError::InvalidArgument(_))));
    assert!(matches!(
        runtime.allocate(dsp.handle(), info.max_allocation + 1),
        Err(RuntimeError::InvalidAllocation(_))
    ));

    let fits = info.capacity / info.max_allocation;
    let blocks: Vec<_> = (0..fits)
        .map(|_| runtime.allocate(dsp.handle(), info.max_allocation).unwrap())
        .collect();
    assert!(matches!(
        runtime.allocate(dsp.handle(), info.granule),
        Err(RuntimeError::OutOfResources(_))
    ));
    for ptr in blocks {
        runtime.free(ptr).unwrap();
    }
    assert!(runtime.allocate(dsp.handle(), info.granule).is_ok());
    assert_eq!(
        runtime.allocate(aql_runtime::RegionHandle::NULL, 1),
        Err(RuntimeError::InvalidRegion(0))
    );
}

#[test]
fn test_concurrent_allocations_never_overlap() {
    let runtime = runtime();
    let system = region(&runtime, "system");

    let mut ranges: Vec<(u64, u64)> = thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let runtime = &runtime;
                let system = system.handle();
                scope.spawn(move || {
                    (0..32)
                        .map(|i| {
                            let size = 4096 * (1 + (worker + i) % 3);
                            let ptr = runtime.allocate(system, size).unwrap();
                            runtime.memory_write(ptr, &[worker as u8; 16]).unwrap();
                            (ptr.address(), size as u64)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
    });

    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (start, size) = pair[0];
        assert!(start + size <= pair[1].0, "{pair:?} overlap");
    }
    assert_eq!(runtime.live_allocations(), 8 * 32);
}

#[test]
fn test_copy_between_allocation_and_registered_memory() {
    let runtime = runtime();
    let system = region(&runtime, "system");
    let src = runtime.allocate(system.handle(), 64).unwrap();
    runtime.memory_write(src, &(0..64).collect::<Vec<u8>>()).unwrap();

    let mut host = vec![0u8; 64];
    let dst = DevicePtr::from_host(host.as_mut_ptr());
    assert_eq!(runtime.is_accessible(dst, 64), Ok(false));
    assert!(matches!(runtime.copy(dst, src, 64), Err(RuntimeError::InvalidArgument(_))));

    // SAFETY: `host` outlives both registrations and is not touched until the
    // copy has returned.
    unsafe {
        runtime.register(dst, 64).unwrap();
        runtime.register(dst, 64).unwrap();
    }
    runtime.copy(dst, src, 64).unwrap();
    runtime.deregister(dst, 64).unwrap();
    assert_eq!(runtime.is_accessible(dst, 64), Ok(true));
    runtime.deregister(dst, 64).unwrap();
    assert_eq!(runtime.is_accessible(dst, 64), Ok(false));
    assert!(matches!(runtime.deregister(dst, 64), Err(RuntimeError::InvalidArgument(_))));

    assert_eq!(host, (0..64).collect::<Vec<u8>>());
}

#[test]
fn test_assign_agent_moves_coarse_ownership() {
    let runtime = runtime();
    let cpu = runtime.find_agent(|a| a.name() == "cpu0").unwrap();
    let local = region(&runtime, "gpu0-local");
    let ptr = runtime.allocate(local.handle(), 4096).unwrap();

    let before = runtime.allocation_info(ptr).unwrap().unwrap();
    assert_eq!(before.owner, local.owners().first().copied());

    runtime.assign_agent(ptr, cpu.handle(), AccessPermission::ReadOnly).unwrap();
    let after = runtime.allocation_info(ptr).unwrap().unwrap();
    assert_eq!(after.owner, Some(cpu.handle()));
    assert_eq!(after.access, AccessPermission::ReadOnly);

    assert_eq!(
        runtime.assign_agent(ptr, AgentHandle::NULL, AccessPermission::ReadWrite),
        Err(RuntimeError::InvalidAgent(0))
    );
}

#[test]
fn test_registration_cannot_cover_runtime_memory() {
    let runtime = runtime();
    let system = region(&runtime, "system");
    let ptr = runtime.allocate(system.handle(), 256).unwrap();

    // SAFETY: rejected before anything is recorded.
    let overlapping = unsafe { runtime.register(ptr.offset(128), 512) };
    assert!(matches!(overlapping, Err(RuntimeError::InvalidArgument(_))));
    assert!(matches!(
        unsafe { runtime.register(DevicePtr::NULL, 8) },
        Err(RuntimeError::InvalidArgument(_))
    ));
}

#[test]
fn test_soft_queue_ring_is_not_plain_memory() {
    let runtime = runtime();
    let system = region(&runtime, "system");
    let doorbell = runtime.signal_create(-1, 0, &[]).unwrap();
    let queue = runtime
        .soft_queue_create(system.handle(), 16, QueueType::Multi, Features::AGENT_DISPATCH, doorbell)
        .unwrap();
    let ring = DevicePtr::new(queue.base_address());
    let data = runtime.allocate(system.handle(), 64).unwrap();

    // The ring is still an allocation of its region
    assert_eq!(runtime.region_of(ring), Ok(Some(system.handle())));
    assert_eq!(runtime.is_accessible(ring, 8), Ok(false));
    assert!(matches!(runtime.memory_write(ring, &[0xff; 8]), Err(RuntimeError::InvalidArgument(_))));
    assert!(matches!(runtime.memory_read(ring.offset(64), 4), Err(RuntimeError::InvalidArgument(_))));
    assert!(matches!(runtime.copy(ring, data, 64), Err(RuntimeError::InvalidArgument(_))));
    assert!(matches!(runtime.copy(data, ring, 64), Err(RuntimeError::InvalidArgument(_))));
    assert!(!runtime.global_memory().write(queue.base_address(), 1u32));
    assert!(matches!(runtime.free(ring), Err(RuntimeError::InvalidArgument(_))));

    // Untouched by the rejected writes
    queue.barrier_and(&[], None).unwrap();
    let mut consumer = queue.consumer().unwrap();
    let first = consumer
        .process(|view| aql_runtime::ProcessResult::Exit(view.index()))
        .unwrap();
    assert_eq!(first, 0);

    runtime.queue_destroy(queue.handle()).unwrap();
    assert_eq!(runtime.region_of(ring), Ok(None));
}

#[test]
fn test_offset_wraps_instead_of_overflowing() {
    let runtime = runtime();
    let end = DevicePtr::new(u64::MAX - 3);
    assert_eq!(end.offset(8), DevicePtr::new(4));
    assert_eq!(runtime.is_accessible(end, 8), Ok(false));
    assert!(runtime.memory_read(end, 8).is_err());
}
