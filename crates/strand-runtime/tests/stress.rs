//! Stress: many dependent tasks across regions and workers
//!
//! Every region is a little counter; in/out tasks increment it. The
//! dependency engine must serialize writers per region while keeping
//! distinct regions parallel, whatever order the scheduler picks.

use std::mem::size_of;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use strand_config::RuntimeConfig;
use strand_core::{AccessMode, CopyDescriptor};
use strand_runtime::Runtime;

#[repr(C)]
struct BumpArgs {
    len: u64,
}

fn bump_task(base: *mut u8) {
    unsafe {
        let off = (size_of::<BumpArgs>() + 7) & !7;
        let data = std::ptr::read(base.add(off).cast::<u64>()) as *mut u64;
        let value = std::ptr::read(data);
        std::ptr::write(data, value + 1);
    }
}

fn as_bytes<T>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), size_of::<T>()) }
}

#[test]
fn randomized_write_chains_drain_clean() {
    let config = RuntimeConfig {
        num_pes: 4,
        ..Default::default()
    };
    let rt = Runtime::new(config).unwrap();

    const REGIONS: usize = 8;
    const TASKS: usize = 200;

    let mut counters = vec![0u64; REGIONS];
    let mut expected = vec![0u64; REGIONS];
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut ids = Vec::with_capacity(TASKS);
    for _ in 0..TASKS {
        let region = rng.gen_range(0..REGIONS);
        let addr = &mut counters[region] as *mut u64 as u64;
        expected[region] += 1;

        let mut builder = rt
            .create_task(bump_task, size_of::<BumpArgs>(), 8, vec![])
            .unwrap();
        builder.write_args(as_bytes(&BumpArgs { len: 8 }));
        builder
            .attach_copies(&[CopyDescriptor::contiguous(addr, 8, AccessMode::InOut)])
            .unwrap();
        ids.push(rt.submit(builder).unwrap());
    }

    for id in ids {
        rt.wait(id);
    }

    assert_eq!(counters, expected);
    assert_eq!(rt.live_tasks(), 0);
    rt.directory().check_invariant().unwrap();
    rt.shutdown().unwrap();
}

#[test]
fn mixed_readers_and_writers_converge() {
    let config = RuntimeConfig {
        num_pes: 4,
        schedule: "fifo".to_string(),
        ..Default::default()
    };
    let rt = Runtime::new(config).unwrap();

    let mut counter = 0u64;
    let addr = &mut counter as *mut u64 as u64;
    let mut rng = StdRng::seed_from_u64(42);

    let mut writes = 0u64;
    let mut ids = Vec::new();
    for _ in 0..100 {
        let mode = if rng.gen_bool(0.5) {
            writes += 1;
            AccessMode::InOut
        } else {
            AccessMode::In
        };
        let mut builder = rt
            .create_task(bump_or_read, size_of::<BumpArgs>(), 8, vec![])
            .unwrap();
        builder.write_args(as_bytes(&BumpArgs {
            len: matches!(mode, AccessMode::InOut) as u64,
        }));
        builder
            .attach_copies(&[CopyDescriptor::contiguous(addr, 8, mode)])
            .unwrap();
        ids.push(rt.submit(builder).unwrap());
    }

    for id in ids {
        rt.wait(id);
    }
    assert_eq!(counter, writes);
    rt.shutdown().unwrap();
}

fn bump_or_read(base: *mut u8) {
    unsafe {
        let args = &*(base.cast::<BumpArgs>());
        let off = (size_of::<BumpArgs>() + 7) & !7;
        let data = std::ptr::read(base.add(off).cast::<u64>()) as *mut u64;
        if args.len == 1 {
            let value = std::ptr::read(data);
            std::ptr::write(data, value + 1);
        } else {
            std::ptr::read_volatile(data);
        }
    }
}
