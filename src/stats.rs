//! Allocation counters and the snapshots built from them.
//!
//! The recorder only ever counts; nothing in the allocator reads it back to
//! make a decision.

use alloc::vec::Vec;
use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::oversize::BumpRegion;
use crate::pool::Pool;

#[derive(Debug, Default, Clone, Copy)]
struct ClassCounters {
    hits: u64,
    perfect_fits: u64,
    frees: u64,
}

/// Counters updated by the allocator on every operation.
#[derive(Debug, Default, Clone)]
pub(crate) struct StatsRecorder {
    total_allocations: u64,
    total_frees: u64,
    fallback_count: u64,
    direct_allocations: u64,
    failed_allocations: u64,
    oversize_leaks: u64,
    per_class: Vec<ClassCounters>,
}

impl StatsRecorder {
    pub(crate) fn new(classes: usize) -> Self {
        let mut per_class = Vec::with_capacity(classes);
        per_class.resize(classes, ClassCounters::default());
        StatsRecorder {
            per_class,
            ..Default::default()
        }
    }

    /// A pooled allocation served by class `index`.
    pub(crate) fn record_hit(&mut self, index: usize, perfect_fit: bool) {
        self.total_allocations += 1;
        let class = &mut self.per_class[index];
        class.hits += 1;
        if perfect_fit {
            class.perfect_fits += 1;
        }
    }

    /// An allocation served by the bump region, or by the page source
    /// directly.
    pub(crate) fn record_fallback(&mut self, direct: bool) {
        self.total_allocations += 1;
        self.fallback_count += 1;
        if direct {
            self.direct_allocations += 1;
        }
    }

    pub(crate) fn record_failure(&mut self) {
        self.failed_allocations += 1;
    }

    /// A block returned to class `index`.
    pub(crate) fn record_pool_free(&mut self, index: usize) {
        self.total_frees += 1;
        self.per_class[index].frees += 1;
    }

    /// A free that didn't go to a pool: a bump-region leak or a direct
    /// mapping handed back.
    pub(crate) fn record_fallback_free(&mut self, leaked: bool) {
        self.total_frees += 1;
        if leaked {
            self.oversize_leaks += 1;
        }
    }

    pub(crate) fn snapshot(&self, pools: &[Pool], oversize: Option<&BumpRegion>) -> Stats {
        let per_class = pools
            .iter()
            .zip(self.per_class.iter())
            .map(|(pool, counters)| ClassStats {
                block_size: pool.block_size(),
                blocks_total: pool.blocks_total(),
                free_count: pool.free_count(),
                hits: counters.hits,
                perfect_fits: counters.perfect_fits,
                frees: counters.frees,
            })
            .collect();

        Stats {
            total_allocations: self.total_allocations,
            total_frees: self.total_frees,
            fallback_count: self.fallback_count,
            direct_allocations: self.direct_allocations,
            failed_allocations: self.failed_allocations,
            oversize_leaks: self.oversize_leaks,
            per_class,
            oversize: oversize.map(|region| OversizeStats {
                capacity: region.capacity(),
                used: region.used(),
                generation: region.generation(),
                allocations: region.allocations(),
            }),
        }
    }
}

/// A point-in-time copy of the allocator's counters.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Stats {
    /// Successful allocations, from any source.
    pub total_allocations: u64,
    pub total_frees: u64,
    /// Allocations served outside the pools.
    pub fallback_count: u64,
    /// The part of `fallback_count` that went straight to the page source.
    pub direct_allocations: u64,
    pub failed_allocations: u64,
    /// Frees of bump-region pointers, which reclaim nothing.
    pub oversize_leaks: u64,
    /// One entry per size class, smallest first.
    pub per_class: Vec<ClassStats>,
    pub oversize: Option<OversizeStats>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClassStats {
    pub block_size: usize,
    pub blocks_total: usize,
    pub free_count: usize,
    pub hits: u64,
    /// Hits where the requested size was exactly the block size.
    pub perfect_fits: u64,
    pub frees: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OversizeStats {
    pub capacity: usize,
    pub used: usize,
    pub generation: u64,
    pub allocations: u64,
}

impl Stats {
    /// The entry for the class with exactly this block size.
    pub fn class(&self, block_size: usize) -> Option<&ClassStats> {
        self.per_class.iter().find(|c| c.block_size == block_size)
    }

    /// Fraction of successful allocations served by a pool.
    pub fn pool_hit_rate(&self) -> f64 {
        if self.total_allocations == 0 {
            return 0.0;
        }
        (self.total_allocations - self.fallback_count) as f64 / self.total_allocations as f64
    }
}

impl ClassStats {
    pub fn in_use(&self) -> usize {
        self.blocks_total - self.free_count
    }

    /// Fraction of the class's blocks currently handed out.
    pub fn utilization(&self) -> f64 {
        self.in_use() as f64 / self.blocks_total as f64
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "allocations: {} ({} fallback, {} direct, {} failed), frees: {}",
            self.total_allocations,
            self.fallback_count,
            self.direct_allocations,
            self.failed_allocations,
            self.total_frees,
        )?;
        for class in &self.per_class {
            writeln!(
                f,
                "  {:>6} B: {:>6}/{:<6} in use ({:5.1}%), {} hits, {} perfect fits",
                class.block_size,
                class.in_use(),
                class.blocks_total,
                class.utilization() * 100.0,
                class.hits,
                class.perfect_fits,
            )?;
        }
        if let Some(oversize) = &self.oversize {
            writeln!(
                f,
                "  oversize: {}/{} bytes, generation {}, {} leaked frees",
                oversize.used, oversize.capacity, oversize.generation, self.oversize_leaks,
            )?;
        }
        Ok(())
    }
}
