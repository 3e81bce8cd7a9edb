use slab::Slab;
use tandem_tracing::trace_span;

use super::Region;

/// A binary buddy allocator over a power-of-two sized block.
///
/// Every allocation is rounded up to the next power of two. Freed blocks are merged
/// with their buddy as long as both halves are free.
#[derive(Clone, Debug)]
pub struct BuddyAllocator {
    blocks: Slab<Block>,
    root: usize,
    stack: Vec<usize>,
    used: u64,
}

impl BuddyAllocator {
    /// Creates a new allocator managing `[0, size)`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a power of two.
    pub fn new(size: u64) -> Self {
        assert!(size.is_power_of_two());

        let mut blocks = Slab::new();
        let root = blocks.insert(Block {
            offset: 0,
            size,
            state: State::Free,
            parent: None,
        });

        Self {
            blocks,
            root,
            // The walk keeps at most one right child per tree level plus the left
            // child about to be popped.
            stack: Vec::with_capacity((size.ilog2() + 2) as usize),
            used: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.blocks[self.root].size
    }

    /// Bytes currently handed out, including the power-of-two rounding.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Returns `None` if no free block is large enough.
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<Region> {
        let _span = trace_span!("BuddyAllocator::alloc").entered();

        let size = size.max(1).next_power_of_two();
        let align = align.max(1);
        debug_assert!(align.is_power_of_two());

        self.stack.clear();
        self.stack.push(self.root);

        while let Some(index) = self.stack.pop() {
            let block = &mut self.blocks[index];

            if size > block.size {
                continue;
            }

            match block.state {
                State::Free => (),
                State::Used => continue,
                State::Split { left, right } => {
                    // Visit the left half first so small allocations pack at the
                    // start of the block. The right half starts at `offset + size / 2`
                    // and is only usable if that satisfies the alignment.
                    if (block.offset + block.size / 2) % align == 0 {
                        self.stack.push(right);
                    }

                    self.stack.push(left);
                    continue;
                }
            }

            if block.size == size {
                block.state = State::Used;
                debug_assert!(block.offset % align == 0);

                self.used += block.size;
                return Some(Region {
                    offset: block.offset,
                    size: block.size,
                });
            }

            let half = block.size / 2;
            let offset = block.offset;

            let left = self.blocks.insert(Block {
                offset,
                size: half,
                state: State::Free,
                parent: Some(index),
            });
            let right = self.blocks.insert(Block {
                offset: offset + half,
                size: half,
                state: State::Free,
                parent: Some(index),
            });

            self.blocks[index].state = State::Split { left, right };

            // Both halves fit `size`, the left one is always aligned.
            self.stack.push(left);
        }

        None
    }

    /// Returns a region previously returned by [`alloc`] to the allocator.
    ///
    /// [`alloc`]: Self::alloc
    pub fn free(&mut self, region: Region) {
        let _span = trace_span!("BuddyAllocator::free").entered();

        let mut index = self.root;
        loop {
            let block = &self.blocks[index];
            if block.offset == region.offset && block.size == region.size {
                break;
            }

            let State::Split { left, right } = block.state else {
                debug_assert!(false, "freed region {:?} was never allocated", region);
                return;
            };

            let mid = block.offset + block.size / 2;
            index = if region.offset < mid { left } else { right };
        }

        let block = &mut self.blocks[index];
        debug_assert!(matches!(block.state, State::Used));
        block.state = State::Free;
        self.used -= block.size;

        // Merge with the buddy as long as both halves are free.
        while let Some(parent) = self.blocks[index].parent {
            let State::Split { left, right } = self.blocks[parent].state else {
                unreachable!();
            };

            let buddy = if index == left { right } else { left };
            if !self.blocks[buddy].state.is_free() {
                break;
            }

            self.blocks.remove(left);
            self.blocks.remove(right);
            self.blocks[parent].state = State::Free;

            index = parent;
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Block {
    offset: u64,
    size: u64,
    state: State,
    parent: Option<usize>,
}

#[derive(Copy, Clone, Debug)]
enum State {
    Free,
    Used,
    Split { left: usize, right: usize },
}

impl State {
    const fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::allocator::Region;

    use super::BuddyAllocator;

    fn find_overlapping_regions(regions: &[Region]) -> Option<(Region, Region)> {
        for (lhs_i, lhs) in regions.iter().enumerate() {
            for rhs in &regions[lhs_i + 1..] {
                if lhs.overlaps(rhs) {
                    return Some((*lhs, *rhs));
                }
            }
        }

        None
    }

    #[test]
    fn buddy_allocator_rounds_to_power_of_two() {
        let mut allocator = BuddyAllocator::new(128);
        let region = allocator.alloc(5, 1).unwrap();
        assert_eq!(region.size, 8);
        assert_eq!(allocator.used(), 8);
    }

    #[test]
    fn buddy_allocator_no_overlap() {
        let mut allocator = BuddyAllocator::new(256 * 64);

        let regions: Vec<_> = (0..64).map(|_| allocator.alloc(256, 1).unwrap()).collect();
        assert!(allocator.alloc(1, 1).is_none());

        if let Some((lhs, rhs)) = find_overlapping_regions(&regions) {
            panic!("regions overlap: {:?}, {:?}", lhs, rhs);
        }
    }

    #[test]
    fn buddy_allocator_free_merges_everything() {
        let mut allocator = BuddyAllocator::new(4096);

        let regions: Vec<_> = (0..16).map(|_| allocator.alloc(200, 1).unwrap()).collect();
        for region in regions {
            allocator.free(region);
        }

        assert_eq!(allocator.blocks.len(), 1);
        assert_eq!(allocator.used(), 0);
        assert_eq!(allocator.alloc(4096, 1).unwrap(), Region::new(0, 4096));
    }

    #[test]
    fn buddy_allocator_reuses_freed_half() {
        let mut allocator = BuddyAllocator::new(1024);

        let first = allocator.alloc(512, 1).unwrap();
        let second = allocator.alloc(512, 1).unwrap();
        allocator.free(first);

        let third = allocator.alloc(300, 1).unwrap();
        assert_eq!(third, first);
        assert!(!third.overlaps(&second));
    }

    #[test]
    fn buddy_allocator_respects_alignment() {
        let mut allocator = BuddyAllocator::new(4096);

        for _ in 0..4 {
            allocator.alloc(1, 1).unwrap();
            let region = allocator.alloc(128, 512).unwrap();
            assert_eq!(region.offset % 512, 0);
        }
    }
}
