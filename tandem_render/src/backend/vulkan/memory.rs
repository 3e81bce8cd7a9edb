//! Device memory sub-allocation.
//!
//! Small resources are placed into pages of one memory type, each page managed by a
//! [`BuddyAllocator`]. Page sizes start at [`MIN_PAGE_SIZE`] and grow with every new
//! page of a memory type. Resources of at least [`DEDICATED_THRESHOLD`] bytes get
//! their own memory object.

use std::collections::HashMap;
use std::ptr::NonNull;

use ash::vk;
use slab::Slab;
use tandem_tracing::trace_span;

use crate::backend::allocator::{BuddyAllocator, Region};
use crate::backend::MemoryLocation;
use crate::error::{Error, Result};

const MIN_PAGE_SIZE: u64 = 1 << 20;
const MAX_PAGE_SIZE: u64 = 1 << 28;
const GROWTH_FACTOR: u64 = 2;
const DEDICATED_THRESHOLD: u64 = 1 << 25;

#[derive(Debug)]
pub struct Allocation {
    memory: vk::DeviceMemory,
    region: Region,
    ptr: Option<NonNull<u8>>,
    strategy: Strategy,
}

// SAFETY: The mapping is owned by the allocator and stays valid until the allocation
// is returned to it. Access through the pointer is synchronized by the caller.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn offset(&self) -> u64 {
        self.region.offset
    }

    /// Start of the host mapping for host-visible allocations.
    pub fn ptr(&self) -> Option<NonNull<u8>> {
        self.ptr
    }
}

#[derive(Copy, Clone, Debug)]
enum Strategy {
    Dedicated,
    Page { memory_type: u32, page: usize },
}

#[derive(Debug)]
pub struct MemoryAllocator {
    types: Vec<vk::MemoryPropertyFlags>,
    pools: HashMap<u32, PagePool>,
}

impl MemoryAllocator {
    pub fn new(properties: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let types = properties
            .memory_types
            .iter()
            .take(properties.memory_type_count as usize)
            .map(|ty| ty.property_flags)
            .collect::<Vec<_>>();

        Self {
            pools: HashMap::with_capacity(types.len()),
            types,
        }
    }

    pub fn alloc(
        &mut self,
        device: &ash::Device,
        req: vk::MemoryRequirements,
        location: MemoryLocation,
    ) -> Result<Allocation> {
        let _span = trace_span!("MemoryAllocator::alloc").entered();

        let candidates = memory_type_candidates(&self.types, req.memory_type_bits, location);
        if candidates.is_empty() {
            tracing::error!(
                "no memory type for {:?} in {:?} memory",
                req,
                location
            );
            return Err(Error::OutOfMemory);
        }

        let host_visible = location == MemoryLocation::HostVisible;

        if req.size >= DEDICATED_THRESHOLD {
            for &memory_type in &candidates {
                match allocate_memory(device, req.size, memory_type, host_visible) {
                    Ok((memory, ptr)) => {
                        return Ok(Allocation {
                            memory,
                            region: Region::new(0, req.size),
                            ptr,
                            strategy: Strategy::Dedicated,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            "dedicated allocation of {} bytes in memory type {} failed: {}",
                            req.size,
                            memory_type,
                            err
                        );
                    }
                }
            }

            return Err(Error::OutOfMemory);
        }

        for &memory_type in &candidates {
            let pool = self.pools.entry(memory_type).or_insert_with(|| PagePool {
                pages: Slab::new(),
                next_page_size: MIN_PAGE_SIZE,
            });

            match pool.alloc(device, &req, memory_type, host_visible) {
                Ok(allocation) => return Ok(allocation),
                Err(err) => {
                    tracing::warn!(
                        "allocation of {} bytes in memory type {} failed: {}",
                        req.size,
                        memory_type,
                        err
                    );
                }
            }
        }

        Err(Error::OutOfMemory)
    }

    /// # Safety
    ///
    /// The allocation must have been created by this allocator and no resource bound
    /// to it may be in use.
    pub unsafe fn dealloc(&mut self, device: &ash::Device, allocation: Allocation) {
        let _span = trace_span!("MemoryAllocator::dealloc").entered();

        match allocation.strategy {
            Strategy::Dedicated => {
                // Freeing implicitly unmaps the memory.
                unsafe {
                    device.free_memory(allocation.memory, None);
                }
            }
            Strategy::Page { memory_type, page } => {
                let Some(pool) = self.pools.get_mut(&memory_type) else {
                    debug_assert!(false, "dealloc from unknown memory type {}", memory_type);
                    return;
                };

                unsafe {
                    pool.dealloc(device, page, allocation.region);
                }
            }
        }
    }

    /// Frees all pages.
    ///
    /// # Safety
    ///
    /// No allocation of this allocator may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for (_, pool) in self.pools.drain() {
            for (_, page) in pool.pages {
                unsafe {
                    device.free_memory(page.memory, None);
                }
            }
        }
    }
}

#[derive(Debug)]
struct PagePool {
    pages: Slab<Page>,
    next_page_size: u64,
}

#[derive(Debug)]
struct Page {
    memory: vk::DeviceMemory,
    allocator: BuddyAllocator,
    ptr: Option<NonNull<u8>>,
    num_allocs: usize,
}

// SAFETY: The pointer is the mapping of `memory`, which is not bound to a thread.
unsafe impl Send for Page {}

impl PagePool {
    fn alloc(
        &mut self,
        device: &ash::Device,
        req: &vk::MemoryRequirements,
        memory_type: u32,
        host_visible: bool,
    ) -> Result<Allocation> {
        for (index, page) in &mut self.pages {
            let Some(region) = page.allocator.alloc(req.size, req.alignment) else {
                continue;
            };

            page.num_allocs += 1;
            return Ok(Allocation {
                memory: page.memory,
                region,
                // SAFETY: The region is inside of the page mapping.
                ptr: page.ptr.map(|ptr| unsafe { ptr.add(region.offset as usize) }),
                strategy: Strategy::Page {
                    memory_type,
                    page: index,
                },
            });
        }

        let size = page_size(self.next_page_size, req.size);
        let (memory, ptr) = allocate_memory(device, size, memory_type, host_visible)?;
        self.next_page_size = (size * GROWTH_FACTOR).min(MAX_PAGE_SIZE);

        tracing::debug!(
            "allocated page of {} bytes in memory type {}",
            size,
            memory_type
        );

        let mut allocator = BuddyAllocator::new(size);
        let Some(region) = allocator.alloc(req.size, req.alignment) else {
            // The page is a power of two at least as large as the request, so this
            // is only reached for alignments larger than the page.
            unsafe {
                device.free_memory(memory, None);
            }
            return Err(Error::OutOfMemory);
        };

        let index = self.pages.insert(Page {
            memory,
            allocator,
            ptr,
            num_allocs: 1,
        });

        Ok(Allocation {
            memory,
            region,
            // SAFETY: The region is inside of the page mapping.
            ptr: ptr.map(|ptr| unsafe { ptr.add(region.offset as usize) }),
            strategy: Strategy::Page {
                memory_type,
                page: index,
            },
        })
    }

    unsafe fn dealloc(&mut self, device: &ash::Device, index: usize, region: Region) {
        let Some(page) = self.pages.get_mut(index) else {
            debug_assert!(false, "dealloc from unknown page {}", index);
            return;
        };

        page.allocator.free(region);
        page.num_allocs -= 1;

        // Keep one page around to avoid reallocating it for the next resource.
        if page.num_allocs == 0 && self.pages.len() > 1 {
            let page = self.pages.remove(index);
            unsafe {
                device.free_memory(page.memory, None);
            }
        }
    }
}

fn page_size(next_page_size: u64, request: u64) -> u64 {
    next_page_size.max(request).next_power_of_two()
}

fn allocate_memory(
    device: &ash::Device,
    size: u64,
    memory_type: u32,
    host_visible: bool,
) -> Result<(vk::DeviceMemory, Option<NonNull<u8>>)> {
    let info = vk::MemoryAllocateInfo::default()
        .allocation_size(size)
        .memory_type_index(memory_type);

    let memory = unsafe { device.allocate_memory(&info, None)? };

    if !host_visible {
        return Ok((memory, None));
    }

    // Host-visible memory stays mapped for its whole lifetime.
    let ptr = match unsafe {
        device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
    } {
        Ok(ptr) => ptr,
        Err(err) => {
            unsafe {
                device.free_memory(memory, None);
            }
            return Err(err.into());
        }
    };

    Ok((memory, NonNull::new(ptr.cast::<u8>())))
}

/// Returns the memory types usable for `location`, most preferred first.
fn memory_type_candidates(
    types: &[vk::MemoryPropertyFlags],
    type_bits: u32,
    location: MemoryLocation,
) -> Vec<u32> {
    let mut candidates: Vec<u32> = (0..types.len() as u32)
        .filter(|index| type_bits & (1 << index) != 0)
        .collect();

    match location {
        MemoryLocation::HostVisible => {
            // Coherent memory is required since mapped writes are never flushed.
            candidates.retain(|index| {
                types[*index as usize].contains(
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )
            });

            // System memory first, the device-local host-visible heap is small.
            candidates.sort_by_key(|index| {
                types[*index as usize].contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            });
        }
        MemoryLocation::DeviceLocal => {
            // Preference as follows:
            // 1. Memory that is exactly `DEVICE_LOCAL`.
            // 2. Memory that is `DEVICE_LOCAL` with other flags.
            // 3. Memory that is not `HOST_COHERENT`.
            candidates.sort_by_key(|index| {
                let flags = types[*index as usize];
                let prefs = [
                    flags == vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL),
                    !flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
                ];

                let weight = prefs
                    .iter()
                    .enumerate()
                    .map(|(index, pref)| u8::from(*pref) << (prefs.len() - index))
                    .sum::<u8>();

                // Highest first.
                std::cmp::Reverse(weight)
            });
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use ash::vk::MemoryPropertyFlags as Flags;

    use crate::backend::MemoryLocation;

    use super::{memory_type_candidates, page_size, MIN_PAGE_SIZE};

    #[test]
    fn device_local_prefers_pure_device_memory() {
        let types = [
            Flags::HOST_VISIBLE | Flags::HOST_COHERENT,
            Flags::DEVICE_LOCAL | Flags::HOST_VISIBLE | Flags::HOST_COHERENT,
            Flags::DEVICE_LOCAL,
        ];

        assert_eq!(
            memory_type_candidates(&types, 0b111, MemoryLocation::DeviceLocal),
            vec![2, 1, 0]
        );
        assert_eq!(
            memory_type_candidates(&types, 0b011, MemoryLocation::DeviceLocal),
            vec![1, 0]
        );
    }

    #[test]
    fn host_visible_requires_coherent_memory() {
        let types = [
            Flags::DEVICE_LOCAL,
            Flags::DEVICE_LOCAL | Flags::HOST_VISIBLE | Flags::HOST_COHERENT,
            Flags::HOST_VISIBLE,
            Flags::HOST_VISIBLE | Flags::HOST_COHERENT | Flags::HOST_CACHED,
        ];

        assert_eq!(
            memory_type_candidates(&types, 0b1111, MemoryLocation::HostVisible),
            vec![3, 1]
        );
        assert!(memory_type_candidates(&types, 0b0001, MemoryLocation::HostVisible).is_empty());
    }

    #[test]
    fn page_size_covers_request() {
        assert_eq!(page_size(MIN_PAGE_SIZE, 1024), MIN_PAGE_SIZE);
        assert_eq!(page_size(MIN_PAGE_SIZE, 3 << 20), 4 << 20);
    }
}
