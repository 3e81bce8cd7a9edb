//! Sub-allocation of large linear memory blocks.

mod buddy;

pub use buddy::BuddyAllocator;

/// A range of bytes inside a larger block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

impl Region {
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub const fn start(&self) -> u64 {
        self.offset
    }

    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start() < other.end() && other.start() < self.end()
    }
}
