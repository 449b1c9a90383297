use core::ptr::NonNull;

use pool_allocator::{Config, Location, PoolAllocator, ToyHeap};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_log::test;

const SLOTS: usize = 128;

fn stress_config() -> Config {
    Config::new()
        .class(32, 64)
        .class(64, 64)
        .class(128, 32)
        .class(512, 16)
        .oversize(16 * 1024)
        .double_free_guard(true)
        .size_tags(true)
        .strict_free(true)
}

// Blocks handed out per class, by what the test itself has kept track of
fn check(allocator: &PoolAllocator<&mut ToyHeap>, live: &[(Option<NonNull<u8>>, usize)]) {
    let validity = allocator.validate();
    assert!(validity.is_valid(), "{:?}", validity);

    let stats = allocator.stats();
    for class in &stats.per_class {
        let held = live
            .iter()
            .filter_map(|&(ptr, _)| ptr)
            .filter(|ptr| {
                allocator.locate(ptr.as_ptr())
                    == Location::Pool {
                        block_size: class.block_size,
                    }
            })
            .count();
        assert_eq!(class.in_use(), held, "{} byte class", class.block_size);
    }
}

#[test]
fn test_stress() {
    let mut heap = ToyHeap::new(1024 * 1024, 64);
    let mut allocator = PoolAllocator::new(&mut heap, stress_config()).unwrap();

    // A None pointer means the slot is empty; the size is meaningless
    let mut live: [(Option<NonNull<u8>>, usize); SLOTS] = [(None, 0); SLOTS];
    let mut allocated: u64 = 0;
    let mut freed: u64 = 0;
    let mut resets: u64 = 0;

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 32);

    for _ in 0..1024 * 10 {
        let chosen = live.choose_mut(&mut rng).unwrap();
        let (held, held_size) = *chosen;
        match held {
            None => {
                let size = range.sample(&mut rng) * range.sample(&mut rng);
                log::debug!("Allocating {}", size);
                match allocator.allocate(size) {
                    Ok(ptr) => {
                        assert_eq!(ptr.as_ptr() as usize % pool_allocator::ALIGNMENT, 0);
                        // Scribble over the whole allocation
                        unsafe { ptr.as_ptr().write_bytes(0x5A, size) };
                        *chosen = (Some(ptr), size);
                        allocated += 1;
                    }
                    Err(err) => {
                        // Only the bump region can run out here
                        log::info!("{}; resetting the oversize region", err);
                        for slot in live.iter_mut() {
                            if let (Some(ptr), size) = *slot {
                                if allocator.locate(ptr.as_ptr()) == Location::Oversize {
                                    unsafe { allocator.free(ptr, size).unwrap() };
                                    freed += 1;
                                    *slot = (None, 0);
                                }
                            }
                        }
                        unsafe { allocator.reset_oversize() };
                        resets += 1;
                    }
                }
            }
            Some(ptr) => {
                let size = held_size;
                let location = allocator.locate(ptr.as_ptr());
                log::debug!("Freeing {:p} ({} bytes, {:?})", ptr, size, location);
                unsafe { allocator.free(ptr, size).unwrap() };
                if let Location::Pool { .. } = location {
                    // A second free of a pooled block is always caught
                    assert!(unsafe { allocator.free(ptr, size) }.is_err());
                }
                *chosen = (None, 0);
                freed += 1;
            }
        }

        check(&allocator, &live);
    }

    let stats = allocator.stats();
    log::info!("Final stats:\n{}", stats);
    assert_eq!(stats.total_allocations, allocated);
    assert_eq!(stats.total_frees, freed);
    assert_eq!(stats.failed_allocations, resets);
    assert_eq!(stats.direct_allocations, 0);
    assert_eq!(allocator.oversize_generation(), Some(resets));

    allocator.destroy();
    assert_eq!(heap.live_bytes(), 0);
}
