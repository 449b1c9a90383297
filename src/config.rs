//! Allocator configuration: the size classes and the policy switches.

use alloc::vec::Vec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::AllocError;
use crate::pool::HEADER_SIZE;
use crate::ALIGNMENT;

/// One pool: `blocks` blocks of `block_size` bytes each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SizeClass {
    pub block_size: usize,
    pub blocks: usize,
}

/// How a [`PoolAllocator`](crate::PoolAllocator) is laid out and how it
/// behaves on the slow paths.
///
/// Size classes may be given in any order; they are served smallest first.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    pub classes: Vec<SizeClass>,

    /// Bytes reserved for the bump region. Zero means no bump region.
    pub oversize_capacity: usize,

    /// When the best-fitting pool is exhausted, try the larger pools before
    /// falling back.
    pub allow_class_overflow: bool,

    /// Requests larger than the whole bump region go straight to the page
    /// source. When off they fail with `OutOfMemory`.
    pub direct_fallback: bool,

    /// Detect double frees by tracking which blocks are handed out, one bit
    /// per block kept outside the pool.
    pub double_free_guard: bool,

    /// Prefix each pooled block with a tag holding the requested size, and
    /// check it on free. Costs 16 bytes per block.
    pub size_tags: bool,

    /// Report frees of pointers this allocator never handed out as errors,
    /// rather than ignoring them.
    pub strict_free: bool,
}

impl Default for Config {
    /// 64, 256, 1024 and 4096 byte classes of 128 KiB, 256 KiB, 512 KiB and
    /// 1 MiB, and a 16 MiB bump region.
    fn default() -> Self {
        Config::new()
            .class(64, 2048)
            .class(256, 1024)
            .class(1024, 512)
            .class(4096, 256)
            .oversize(16 * 1024 * 1024)
    }
}

impl Config {
    /// No classes, no bump region; guard and strict frees in debug builds.
    pub fn new() -> Self {
        Config {
            classes: Vec::new(),
            oversize_capacity: 0,
            allow_class_overflow: false,
            direct_fallback: true,
            double_free_guard: cfg!(debug_assertions),
            size_tags: false,
            strict_free: cfg!(debug_assertions),
        }
    }

    #[must_use]
    pub fn class(mut self, block_size: usize, blocks: usize) -> Self {
        self.classes.push(SizeClass { block_size, blocks });
        self
    }

    #[must_use]
    pub fn oversize(mut self, capacity: usize) -> Self {
        self.oversize_capacity = capacity;
        self
    }

    #[must_use]
    pub fn allow_class_overflow(mut self, allow: bool) -> Self {
        self.allow_class_overflow = allow;
        self
    }

    #[must_use]
    pub fn direct_fallback(mut self, enabled: bool) -> Self {
        self.direct_fallback = enabled;
        self
    }

    #[must_use]
    pub fn double_free_guard(mut self, enabled: bool) -> Self {
        self.double_free_guard = enabled;
        self
    }

    #[must_use]
    pub fn size_tags(mut self, enabled: bool) -> Self {
        self.size_tags = enabled;
        self
    }

    #[must_use]
    pub fn strict_free(mut self, strict: bool) -> Self {
        self.strict_free = strict;
        self
    }

    /// The size classes sorted by block size, after checking that each one
    /// can be laid out.
    pub fn sorted_classes(&self) -> Result<Vec<SizeClass>, AllocError> {
        let mut classes = self.classes.clone();
        classes.sort_by_key(|c| c.block_size);

        for (i, class) in classes.iter().enumerate() {
            let invalid = AllocError::InvalidSizeClass {
                block_size: class.block_size,
                blocks: class.blocks,
            };

            if class.block_size < HEADER_SIZE
                || class.block_size % ALIGNMENT != 0
                || class.blocks == 0
                || class.block_size.checked_mul(class.blocks).is_none()
            {
                return Err(invalid);
            }
            if i > 0 && classes[i - 1].block_size == class.block_size {
                return Err(invalid);
            }
        }

        Ok(classes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::vec;

    use test_log::test;

    #[test]
    fn test_default_layout() {
        let config = Config::default();
        let block_sizes: Vec<usize> = config.classes.iter().map(|c| c.block_size).collect();
        assert_eq!(block_sizes, vec![64, 256, 1024, 4096]);
        assert_eq!(config.oversize_capacity, 16 * 1024 * 1024);
        assert!(!config.allow_class_overflow);
        assert!(config.direct_fallback);
        assert!(!config.size_tags);
    }

    #[test]
    fn test_classes_are_sorted() {
        let config = Config::new().class(256, 2).class(64, 4).class(128, 1);
        let sorted = config.sorted_classes().unwrap();
        assert_eq!(
            sorted,
            vec![
                SizeClass {
                    block_size: 64,
                    blocks: 4
                },
                SizeClass {
                    block_size: 128,
                    blocks: 1
                },
                SizeClass {
                    block_size: 256,
                    blocks: 2
                },
            ]
        );
    }

    #[test]
    fn test_rejects_bad_classes() {
        let bad = [
            Config::new().class(8, 4),
            Config::new().class(40, 4),
            Config::new().class(64, 0),
            Config::new().class(64, 4).class(64, 8),
            Config::new().class(usize::MAX - 15, 2),
        ];
        for config in bad.iter() {
            let err = config.sorted_classes().unwrap_err();
            assert!(
                matches!(err, AllocError::InvalidSizeClass { .. }),
                "{:?} gave {:?}",
                config,
                err
            );
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "classes": [{"block_size": 64, "blocks": 4}, {"block_size": 256, "blocks": 2}],
            "allow_class_overflow": true
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.classes.len(), 2);
        assert!(config.allow_class_overflow);
        // Missing fields take their defaults
        assert_eq!(config.oversize_capacity, 16 * 1024 * 1024);
    }
}
