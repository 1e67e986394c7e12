//! Sub-allocation inside one device memory block.

use crate::backend::RawMemory;
use std::collections::BTreeMap;
use stratum_core::math::align_up;

/// Placement strategy inside a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    /// Smallest free range that fits; least fragmentation.
    #[default]
    BestFit,
    /// First free range that fits; cheapest search.
    FirstFit,
}

/// Tiling of the resource bound to an allocation.
///
/// Linear and optimal resources in one memory object have to sit on
/// separate pages of the device's buffer-image granularity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// Not known; treated as clashing with both other kinds.
    #[default]
    Unknown,
    /// Buffers and linear images.
    Linear,
    /// Optimal-tiling images.
    Optimal,
}

impl AllocationKind {
    const fn conflicts_with(self, other: Self) -> bool {
        !matches!(
            (self, other),
            (Self::Linear, Self::Linear) | (Self::Optimal, Self::Optimal)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Taken {
    size: u64,
    kind: AllocationKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRange {
    offset: u64,
    size: u64,
}

/// A device memory object carved into sub-allocations.
///
/// The free list is kept sorted by offset so neighbours can be coalesced.
/// Live ranges are tracked with their kind so placements keep linear and
/// optimal neighbours `granularity` apart.
pub(crate) struct MemoryBlock {
    pub id: u64,
    pub memory: RawMemory,
    pub dedicated: bool,
    granularity: u64,
    free: Vec<FreeRange>,
    taken: BTreeMap<u64, Taken>,
    used: u64,
}

impl MemoryBlock {
    pub fn new(id: u64, memory: RawMemory, dedicated: bool, granularity: u64) -> Self {
        Self {
            id,
            memory,
            dedicated,
            granularity: granularity.max(1),
            free: vec![FreeRange {
                offset: 0,
                size: memory.size,
            }],
            taken: BTreeMap::new(),
            used: 0,
        }
    }

    /// Bytes handed out.
    #[inline]
    pub const fn used(&self) -> u64 {
        self.used
    }

    /// Live sub-allocations.
    #[inline]
    pub fn allocation_count(&self) -> u32 {
        self.taken.len() as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.taken.is_empty()
    }

    /// Offset for `size` bytes inside the free `range`, if they fit.
    fn place(&self, range: FreeRange, size: u64, alignment: u64, kind: AllocationKind) -> Option<u64> {
        let end = range.offset + range.size;
        let mut offset = align_up(range.offset, alignment);
        let granularity = self.granularity;
        if granularity > 1 {
            let same_page = |a: u64, b: u64| a / granularity == b / granularity;
            if let Some((&prev_offset, prev)) = self.taken.range(..range.offset).next_back() {
                if prev.kind.conflicts_with(kind) && same_page(prev_offset + prev.size - 1, offset) {
                    offset = align_up(offset, granularity);
                }
            }
            if let Some((&next_offset, next)) = self.taken.range(end..).next() {
                if next.kind.conflicts_with(kind)
                    && offset + size <= end
                    && same_page(offset + size - 1, next_offset)
                {
                    return None;
                }
            }
        }
        (offset + size <= end).then_some(offset)
    }

    /// Reserve `size` bytes aligned to `alignment` for a resource of `kind`,
    /// returning the offset.
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        kind: AllocationKind,
        strategy: AllocationStrategy,
    ) -> Option<u64> {
        if size == 0 {
            return None;
        }

        let mut chosen: Option<(usize, u64, u64)> = None;
        for (index, range) in self.free.iter().enumerate() {
            let Some(aligned) = self.place(*range, size, alignment, kind) else {
                continue;
            };
            let leftover = range.offset + range.size - aligned - size;
            match strategy {
                AllocationStrategy::FirstFit => {
                    chosen = Some((index, aligned, leftover));
                    break;
                }
                AllocationStrategy::BestFit => {
                    if chosen.map_or(true, |(_, _, best)| leftover < best) {
                        chosen = Some((index, aligned, leftover));
                    }
                }
            }
        }

        let (index, offset, leftover) = chosen?;
        let range = self.free[index];
        let mut replacement = Vec::with_capacity(2);
        if offset > range.offset {
            replacement.push(FreeRange {
                offset: range.offset,
                size: offset - range.offset,
            });
        }
        if leftover > 0 {
            replacement.push(FreeRange {
                offset: offset + size,
                size: leftover,
            });
        }
        self.free.splice(index..=index, replacement);

        self.taken.insert(offset, Taken { size, kind });
        self.used += size;
        Some(offset)
    }

    /// Return a range previously handed out by [`allocate`](Self::allocate).
    pub fn free(&mut self, offset: u64, size: u64) {
        let index = self.free.partition_point(|range| range.offset < offset);
        self.free.insert(index, FreeRange { offset, size });

        // Merge with the following range, then with the preceding one.
        if index + 1 < self.free.len() {
            let next = self.free[index + 1];
            if offset + size == next.offset {
                self.free[index].size += next.size;
                self.free.remove(index + 1);
            }
        }
        if index > 0 {
            let prev = self.free[index - 1];
            if prev.offset + prev.size == offset {
                self.free[index - 1].size += self.free[index].size;
                self.free.remove(index);
            }
        }

        self.taken.remove(&offset);
        self.used -= size;
    }

    /// Number of disjoint free ranges.
    #[cfg(test)]
    fn fragments(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryId;

    fn new_block(size: u64) -> MemoryBlock {
        granular_block(size, 1)
    }

    fn granular_block(size: u64, granularity: u64) -> MemoryBlock {
        MemoryBlock::new(
            1,
            RawMemory {
                id: MemoryId(1),
                size,
                memory_type: 0,
                mapped: None,
            },
            false,
            granularity,
        )
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut block = new_block(4096);
        let a = block.allocate(100, 256, AllocationKind::Linear, AllocationStrategy::BestFit).unwrap();
        let b = block.allocate(100, 256, AllocationKind::Linear, AllocationStrategy::BestFit).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 256);
        assert_eq!(block.used(), 200);
        assert_eq!(block.allocation_count(), 2);
    }

    #[test]
    fn free_coalesces_neighbours() {
        let mut block = new_block(1024);
        let a = block.allocate(256, 1, AllocationKind::Linear, AllocationStrategy::FirstFit).unwrap();
        let b = block.allocate(256, 1, AllocationKind::Linear, AllocationStrategy::FirstFit).unwrap();
        let c = block.allocate(256, 1, AllocationKind::Linear, AllocationStrategy::FirstFit).unwrap();
        block.free(a, 256);
        block.free(c, 256);
        assert_eq!(block.fragments(), 2);
        block.free(b, 256);
        assert_eq!(block.fragments(), 1);
        assert!(block.is_empty());
        assert_eq!(block.allocate(1024, 1, AllocationKind::Linear, AllocationStrategy::BestFit), Some(0));
    }

    #[test]
    fn best_fit_prefers_smallest_hole() {
        let mut block = new_block(1024);
        let a = block.allocate(512, 1, AllocationKind::Linear, AllocationStrategy::FirstFit).unwrap();
        let _guard = block.allocate(128, 1, AllocationKind::Linear, AllocationStrategy::FirstFit).unwrap();
        let c = block.allocate(128, 1, AllocationKind::Linear, AllocationStrategy::FirstFit).unwrap();
        let _tail = block.allocate(256, 1, AllocationKind::Linear, AllocationStrategy::FirstFit).unwrap();
        block.free(a, 512);
        block.free(c, 128);

        let mut first = new_block(1024);
        first.free = block.free.clone();
        assert_eq!(first.allocate(100, 1, AllocationKind::Linear, AllocationStrategy::FirstFit), Some(0));
        assert_eq!(block.allocate(100, 1, AllocationKind::Linear, AllocationStrategy::BestFit), Some(640));
    }

    #[test]
    fn full_block_rejects_allocation() {
        let mut block = new_block(512);
        assert!(block.allocate(512, 1, AllocationKind::Linear, AllocationStrategy::BestFit).is_some());
        assert!(block.allocate(1, 1, AllocationKind::Linear, AllocationStrategy::BestFit).is_none());
        assert!(block.allocate(0, 1, AllocationKind::Linear, AllocationStrategy::BestFit).is_none());
    }

    #[test]
    fn linear_and_optimal_neighbours_use_separate_pages() {
        use super::AllocationKind::{Linear, Optimal};
        const PAGE: u64 = 64 * 1024;
        let mut block = granular_block(2 * 1024 * 1024, PAGE);
        let image = block.allocate(4096, 1024, Optimal, AllocationStrategy::BestFit).unwrap();
        let vertices = block.allocate(256, 256, Linear, AllocationStrategy::BestFit).unwrap();
        let indices = block.allocate(256, 256, Linear, AllocationStrategy::BestFit).unwrap();
        let normal = block.allocate(4096, 1024, Optimal, AllocationStrategy::BestFit).unwrap();
        assert_eq!(image, 0);
        assert_eq!(vertices, PAGE);
        assert_eq!(indices, PAGE + 256);
        // Same-kind neighbours pack tightly.
        assert_eq!(normal, 4096);

        let uniforms = block.allocate(256, 256, Linear, AllocationStrategy::FirstFit).unwrap();
        assert_eq!(uniforms, PAGE + 512);
    }

    #[test]
    fn holes_respect_the_following_neighbour() {
        use super::AllocationKind::{Linear, Optimal, Unknown};
        let mut block = granular_block(8192, 1024);
        let head = block.allocate(512, 256, Linear, AllocationStrategy::FirstFit).unwrap();
        let image = block.allocate(1024, 256, Optimal, AllocationStrategy::FirstFit).unwrap();
        assert_eq!((head, image), (0, 1024));

        // The hole at 512..1024 sits on the linear head's page.
        assert_eq!(
            block.allocate(256, 256, Optimal, AllocationStrategy::FirstFit),
            Some(2048)
        );
        assert_eq!(
            block.allocate(256, 256, Linear, AllocationStrategy::FirstFit),
            Some(512)
        );
        // Unknown clashes with both kinds, so it only fits on a page of its own.
        assert_eq!(
            block.allocate(256, 1, Unknown, AllocationStrategy::FirstFit),
            Some(3072)
        );
    }

    #[test]
    fn unit_granularity_ignores_kinds() {
        let mut block = granular_block(4096, 1);
        let a = block.allocate(100, 256, AllocationKind::Optimal, AllocationStrategy::BestFit);
        let b = block.allocate(100, 256, AllocationKind::Linear, AllocationStrategy::BestFit);
        assert_eq!((a, b), (Some(0), Some(256)));
    }
}
