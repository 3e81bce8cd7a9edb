use std::fmt::{self, Debug, Formatter};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{
    BufferDescriptor, BufferResource, DescriptorHeap, DescriptorKind, MemoryLocation,
    RootTable, SamplerDescriptor, ShaderBytecode, Subresource, TextureDescriptor,
    TextureViewDescriptor,
};

use super::NullDevice;

/// Host memory standing in for device memory.
///
/// The allocation never moves, so pointers returned by [`as_ptr`] stay valid while
/// the memory is alive. Writes through them are synchronized by submission order, like
/// writes to real mapped device memory.
///
/// [`as_ptr`]: Self::as_ptr
pub struct Memory {
    bytes: Mutex<Box<[u8]>>,
    len: usize,
}

impl Memory {
    fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0; len].into_boxed_slice()),
            len,
        })
    }

    pub(super) fn len(&self) -> usize {
        self.len
    }

    pub(super) fn as_ptr(&self) -> *mut u8 {
        self.bytes.lock().as_mut_ptr()
    }

    /// Copies `len` bytes from `src[src_offset..]` to `self[dst_offset..]`.
    ///
    /// # Panics
    ///
    /// Panics if either range is out of bounds.
    pub(super) fn copy_from(&self, dst_offset: usize, src: &Self, src_offset: usize, len: usize) {
        assert!(src_offset + len <= src.len(), "copy source out of bounds");
        assert!(dst_offset + len <= self.len(), "copy destination out of bounds");

        if std::ptr::eq(self, src) {
            self.bytes
                .lock()
                .copy_within(src_offset..src_offset + len, dst_offset);
            return;
        }

        // Lock in address order so that concurrent copies in opposite directions
        // cannot deadlock.
        let (mut dst, src) = if (self as *const Self) < (src as *const Self) {
            let dst = self.bytes.lock();
            (dst, src.bytes.lock())
        } else {
            let src = src.bytes.lock();
            (self.bytes.lock(), src)
        };

        dst[dst_offset..dst_offset + len].copy_from_slice(&src[src_offset..src_offset + len]);
    }

    pub(super) fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        self.bytes.lock()[offset..offset + len].to_vec()
    }

    pub(super) fn write(&self, offset: usize, data: &[u8]) {
        self.bytes.lock()[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl Debug for Memory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory").field("len", &self.len()).finish()
    }
}

pub struct NullBuffer {
    pub(super) memory: Arc<Memory>,
    descriptor: BufferDescriptor,
    device: NullDevice,
}

impl NullBuffer {
    pub(super) fn new(descriptor: BufferDescriptor, device: NullDevice) -> Self {
        Self {
            memory: Memory::new(descriptor.size as usize),
            descriptor,
            device,
        }
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    /// Reads the current contents of the buffer.
    pub fn read_bytes(&self, offset: u64, len: u64) -> Vec<u8> {
        self.memory.read(offset as usize, len as usize)
    }

    /// Overwrites the contents of the buffer from the host.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) {
        self.memory.write(offset as usize, data);
    }
}

impl BufferResource for NullBuffer {
    fn size(&self) -> u64 {
        self.descriptor.size
    }

    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        match self.descriptor.location {
            MemoryLocation::HostVisible => NonNull::new(self.memory.as_ptr()),
            MemoryLocation::DeviceLocal => None,
        }
    }
}

impl Debug for NullBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NullBuffer")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl Drop for NullBuffer {
    fn drop(&mut self) {
        self.device.shared.stats.lock().live_buffers -= 1;
    }
}

/// A texture stored as tightly packed subresources.
///
/// Subresource `mip + layer * mip_levels` starts at `offsets[index]`.
pub struct NullTexture {
    pub(super) id: u64,
    pub(super) memory: Arc<Memory>,
    offsets: Vec<u64>,
    descriptor: TextureDescriptor,
    /// `None` for swapchain images which are not counted as live textures.
    device: Option<NullDevice>,
}

impl NullTexture {
    pub(super) fn new(
        descriptor: TextureDescriptor,
        id: u64,
        device: Option<NullDevice>,
    ) -> Self {
        let mut offsets = Vec::with_capacity(descriptor.subresource_count() as usize);
        let mut size = 0;
        for _ in 0..descriptor.array_layers {
            for mip in 0..descriptor.mip_levels {
                offsets.push(size);

                let extent = descriptor.mip_size(mip);
                size += u64::from(extent.x)
                    * u64::from(extent.y)
                    * u64::from(descriptor.format.bytes_per_texel());
            }
        }

        Self {
            id,
            memory: Memory::new(size as usize),
            offsets,
            descriptor,
            device,
        }
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    /// Returns `(offset, row_size, row_count)` of a subresource in texture memory.
    pub(super) fn subresource_layout(&self, subresource: Subresource) -> (u64, u64, u32) {
        let index = subresource.mip_level + subresource.array_layer * self.descriptor.mip_levels;
        let extent = self.descriptor.mip_size(subresource.mip_level);
        let row_size = u64::from(extent.x) * u64::from(self.descriptor.format.bytes_per_texel());
        (self.offsets[index as usize], row_size, extent.y)
    }

    /// Reads the tightly packed texel data of a subresource.
    pub fn read_subresource(&self, subresource: Subresource) -> Vec<u8> {
        let (offset, row_size, rows) = self.subresource_layout(subresource);
        self.memory
            .read(offset as usize, (row_size * u64::from(rows)) as usize)
    }
}

impl Debug for NullTexture {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NullTexture")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl Drop for NullTexture {
    fn drop(&mut self) {
        if let Some(device) = &self.device {
            device.shared.stats.lock().live_textures -= 1;
        }
    }
}

#[derive(Debug)]
pub struct NullTextureView {
    texture: u64,
    descriptor: TextureViewDescriptor,
}

impl NullTextureView {
    pub(super) fn new(texture: &NullTexture, descriptor: TextureViewDescriptor) -> Self {
        Self {
            texture: texture.id,
            descriptor,
        }
    }

    /// Id of the texture this view was created from.
    pub fn id(&self) -> u64 {
        self.texture
    }

    pub fn descriptor(&self) -> &TextureViewDescriptor {
        &self.descriptor
    }
}

#[derive(Debug)]
pub struct NullSampler {
    pub(super) descriptor: SamplerDescriptor,
}

impl NullSampler {
    pub fn descriptor(&self) -> &SamplerDescriptor {
        &self.descriptor
    }
}

/// Summary of a descriptor written into a [`NullDescriptorHeap`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NullDescriptor {
    UniformBuffer { offset: u64, size: u64 },
    StorageBuffer { offset: u64, size: u64 },
    SampledTexture(u64),
    StorageTexture(u64),
    Sampler,
}

#[derive(Debug)]
pub struct NullDescriptorHeap {
    kind: DescriptorKind,
    capacity: u32,
    base: u64,
    slots: Mutex<Vec<Option<NullDescriptor>>>,
}

impl NullDescriptorHeap {
    const STRIDE: u64 = 32;

    pub(super) fn new(kind: DescriptorKind, capacity: u32, id: u64) -> Self {
        Self {
            kind,
            capacity,
            base: id << 32,
            slots: Mutex::new(vec![None; capacity as usize]),
        }
    }

    pub(super) fn write(&self, slot: u32, descriptor: NullDescriptor) {
        self.slots.lock()[slot as usize] = Some(descriptor);
    }

    /// Returns the descriptor last written into `slot`.
    pub fn get(&self, slot: u32) -> Option<NullDescriptor> {
        self.slots.lock().get(slot as usize).copied().flatten()
    }
}

impl DescriptorHeap for NullDescriptorHeap {
    fn kind(&self) -> DescriptorKind {
        self.kind
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn cpu_base(&self) -> u64 {
        self.base
    }

    fn gpu_base(&self) -> Option<u64> {
        Some(self.base | (1 << 63))
    }

    fn stride(&self) -> u64 {
        Self::STRIDE
    }
}

#[derive(Debug)]
pub struct NullShaderModule {
    pub(super) code: ShaderBytecode,
}

#[derive(Debug)]
pub struct NullPipelineLayout {
    pub(super) tables: Vec<RootTable>,
    pub(super) static_samplers: usize,
}

impl NullPipelineLayout {
    pub fn tables(&self) -> &[RootTable] {
        &self.tables
    }

    pub fn static_sampler_count(&self) -> usize {
        self.static_samplers
    }
}

#[derive(Debug)]
pub struct NullPipeline {
    pub(super) label: String,
    pub(super) blob: Vec<u8>,
}

impl NullPipeline {
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// A monotonic counter standing in for a timeline fence.
#[derive(Clone, Debug)]
pub struct NullFence {
    value: Arc<AtomicU64>,
}

impl NullFence {
    pub(super) fn new(initial_value: u64) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(initial_value)),
        }
    }

    pub(super) fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub(super) fn signal(&self, value: u64) {
        let prev = self.value.fetch_max(value, Ordering::AcqRel);
        debug_assert!(prev <= value, "fence moved backwards: {} -> {}", prev, value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::Memory;

    #[test]
    fn memory_copy_within_same_allocation() {
        let memory = Memory::new(8);
        memory.write(0, &[1, 2, 3, 4]);
        memory.copy_from(2, &memory, 0, 4);
        assert_eq!(memory.read(0, 8), [1, 2, 1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn memory_is_shared_between_threads() {
        let a = Memory::new(64);
        let b = Memory::new(64);

        let threads: Vec<_> = (0..4u8)
            .map(|index| {
                let (a, b) = (Arc::clone(&a), Arc::clone(&b));
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        a.write(index as usize * 16, &[index; 16]);
                        if index % 2 == 0 {
                            b.copy_from(0, &a, 0, 64);
                        } else {
                            a.copy_from(0, &b, 0, 64);
                        }
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(a.read(0, 64).len(), 64);
        assert_eq!(b.len(), 64);
    }
}
