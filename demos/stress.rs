//! An example program that builds an allocator with the default layout,
//! creates and destroys a large number of objects through it, and checks
//! validity along the way.

use std::ptr::NonNull;

use pool_allocator::{Config, DefaultPageSource, PoolAllocator};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

// Minimum number of allocations before we start deallocating
const MIN_ALLOCATIONS: usize = 1024;
// Total number of allocations / deallocations
const ALLOCATIONS: usize = 64 * 1024;
// Log_2 of the maximum sized object to allocate
const LOG2_MAX_SIZE: usize = 14;

struct RandomObjects {
    allocator: PoolAllocator<DefaultPageSource>,
    allocated: Vec<(NonNull<u8>, usize)>,
    log2_max_size: usize,
    failures: usize,
}

impl RandomObjects {
    fn new(allocator: PoolAllocator<DefaultPageSource>, log2_max_size: usize) -> Self {
        RandomObjects {
            allocator,
            allocated: Vec::new(),
            log2_max_size: log2_max_size.max(4),
            failures: 0,
        }
    }

    fn create<R: Rng>(&mut self, rng: &mut R) {
        let shift = Uniform::new_inclusive(4usize, self.log2_max_size).sample(rng);
        let size = rng.gen_range(1..=1usize << shift);
        match self.allocator.allocate(size) {
            Ok(ptr) => {
                unsafe { ptr.as_ptr().write_bytes(0xA5, size) };
                self.allocated.push((ptr, size));
            }
            Err(err) => {
                log::debug!("{}", err);
                self.failures += 1;
            }
        }
    }

    fn destroy<R: Rng>(&mut self, rng: &mut R) {
        if self.allocated.is_empty() {
            return;
        }
        let ix = Uniform::new(0, self.allocated.len()).sample(rng);
        let (ptr, size) = self.allocated.swap_remove(ix);
        if let Err(err) = unsafe { self.allocator.free(ptr, size) } {
            panic!("freeing {:p} ({} bytes): {}", ptr, size, err);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!(
            "USAGE: {} [ALLOCATIONS] [MIN_ALLOCATIONS] [LOG2_MAX_SIZE]",
            args[0]
        );
        return;
    }
    let mut allocations: usize = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(ALLOCATIONS);
    let min_allocations: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MIN_ALLOCATIONS);
    if allocations < min_allocations {
        allocations = min_allocations;
    }
    let log2_max_size: usize = args
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(LOG2_MAX_SIZE);

    env_logger::init();
    println!("Running Stress Test.\n\nParameters:");
    println!("    {} total allocations", allocations);
    println!(
        "    {} allocations before any deallocations",
        min_allocations
    );
    println!("    2^{} max allocated object size", log2_max_size);

    let allocator = match PoolAllocator::new(DefaultPageSource::default(), Config::default()) {
        Ok(allocator) => allocator,
        Err(err) => {
            eprintln!("Could not build the allocator: {}", err);
            std::process::exit(1);
        }
    };

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut objects = RandomObjects::new(allocator, log2_max_size);
    let mut allocation_run: isize = min_allocations as isize;

    for i in 1..=allocations {
        // Decide if we should allocate some new objects, or destroy an old one.
        while allocation_run == 0 {
            let max_allocations = objects.allocated.len().max(min_allocations) as isize;
            let max_deallocations = objects.allocated.len() as isize;
            allocation_run = Uniform::new(-max_deallocations, max_allocations).sample(&mut rng);
        }

        if allocation_run > 0 {
            objects.create(&mut rng);
            allocation_run -= 1;
        } else {
            objects.destroy(&mut rng);
            allocation_run += 1;
        }

        if i % 4096 == 0 {
            let validity = objects.allocator.validate();
            assert!(validity.is_valid(), "{:?}", validity);
            log::info!(
                "{} operations, {} live objects",
                i,
                objects.allocated.len()
            );
        }
    }

    while !objects.allocated.is_empty() {
        objects.destroy(&mut rng);
    }

    let stats = objects.allocator.stats();
    println!("\nDone. {} allocations failed.\n", objects.failures);
    println!("{}", stats);
    println!("Pool hit rate: {:.1}%", stats.pool_hit_rate() * 100.0);

    objects.allocator.destroy();
}
