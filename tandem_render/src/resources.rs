//! Textures and buffers owned by the renderer.

use std::fmt::{self, Debug, Formatter};

use bytemuck::Pod;
use glam::UVec2;

use crate::backend::{
    Api, BufferDescriptor, BufferResource, BufferUsage, CommandEncoder, Device,
    MemoryLocation, TextureBarrier, TextureDescriptor, TextureFormat, TextureLayout,
    TextureViewDescriptor,
};
use crate::error::{Error, Result};

/// A texture together with the layout it was last transitioned to.
pub struct Texture<A: Api> {
    raw: A::Texture,
    descriptor: TextureDescriptor,
    layout: TextureLayout,
}

impl<A: Api> Texture<A> {
    pub fn raw(&self) -> &A::Texture {
        &self.raw
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    pub fn size(&self) -> UVec2 {
        self.descriptor.size
    }

    pub fn format(&self) -> TextureFormat {
        self.descriptor.format
    }

    pub fn layout(&self) -> TextureLayout {
        self.layout
    }

    /// Records a barrier moving the texture into `layout`.
    ///
    /// Does nothing if the texture already is in `layout`.
    pub fn transition(&mut self, encoder: &mut A::CommandEncoder, layout: TextureLayout) {
        if let Some(barrier) = self.transition_barrier(layout) {
            encoder.texture_barriers(&[barrier]);
        }
    }

    /// Returns the barrier moving the texture into `layout` and assumes it will be
    /// recorded.
    pub fn transition_barrier(&mut self, layout: TextureLayout) -> Option<TextureBarrier<'_, A>> {
        if self.layout == layout {
            return None;
        }

        let src = std::mem::replace(&mut self.layout, layout);
        Some(TextureBarrier {
            texture: &self.raw,
            src,
            dst: layout,
        })
    }

    pub fn create_view(
        &self,
        device: &A::Device,
        descriptor: &TextureViewDescriptor,
    ) -> Result<A::TextureView> {
        device.create_texture_view(&self.raw, descriptor)
    }

    /// Creates a view of all mip levels and layers.
    pub fn create_full_view(&self, device: &A::Device) -> Result<A::TextureView> {
        self.create_view(
            device,
            &TextureViewDescriptor {
                base_mip_level: 0,
                mip_levels: self.descriptor.mip_levels,
                base_array_layer: 0,
                array_layers: self.descriptor.array_layers,
            },
        )
    }
}

impl<A: Api> Debug for Texture<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("raw", &self.raw)
            .field("descriptor", &self.descriptor)
            .field("layout", &self.layout)
            .finish()
    }
}

pub struct Buffer<A: Api> {
    raw: A::Buffer,
    descriptor: BufferDescriptor,
}

impl<A: Api> Buffer<A> {
    pub fn raw(&self) -> &A::Buffer {
        &self.raw
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn is_mapped(&self) -> bool {
        self.raw.mapped_ptr().is_some()
    }

    /// Copies `data` into the persistent mapping at `offset`.
    ///
    /// The caller must make sure the GPU is not reading the written range.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self.raw.mapped_ptr().ok_or_else(|| {
            Error::Backend("buffer is not mapped into host memory".to_owned())
        })?;

        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= self.descriptor.size)
            .ok_or_else(|| {
                Error::Backend(format!(
                    "write of {} bytes at {} exceeds buffer size {}",
                    data.len(),
                    offset,
                    self.descriptor.size
                ))
            })?;
        debug_assert!(end <= self.descriptor.size);

        // SAFETY: The mapping covers the whole buffer and the range was checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }

        Ok(())
    }

    pub fn write_pod<T: Pod>(&self, offset: u64, value: &T) -> Result<()> {
        self.write(offset, bytemuck::bytes_of(value))
    }

    /// Reads `len` bytes from the persistent mapping at `offset`.
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let ptr = self.raw.mapped_ptr().ok_or_else(|| {
            Error::Backend("buffer is not mapped into host memory".to_owned())
        })?;

        if offset.saturating_add(len) > self.descriptor.size {
            return Err(Error::Backend(format!(
                "read of {} bytes at {} exceeds buffer size {}",
                len, offset, self.descriptor.size
            )));
        }

        let mut out = vec![0; len as usize];
        // SAFETY: The range was checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                len as usize,
            );
        }
        Ok(out)
    }
}

impl<A: Api> Debug for Buffer<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("raw", &self.raw)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Creates device-local resources and host-visible staging buffers.
pub struct ResourceAllocator<'a, A: Api> {
    device: &'a A::Device,
}

impl<A: Api> Clone for ResourceAllocator<'_, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: Api> Copy for ResourceAllocator<'_, A> {}

impl<'a, A: Api> ResourceAllocator<'a, A> {
    pub fn new(device: &'a A::Device) -> Self {
        Self { device }
    }

    /// Creates a device-local texture in [`TextureLayout::Undefined`].
    pub fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<Texture<A>> {
        let raw = self.device.create_texture(descriptor)?;
        Ok(Texture {
            raw,
            descriptor: *descriptor,
            layout: TextureLayout::Undefined,
        })
    }

    pub fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        location: MemoryLocation,
    ) -> Result<Buffer<A>> {
        let descriptor = BufferDescriptor {
            size,
            usage,
            location,
        };

        let raw = self.device.create_buffer(&descriptor)?;
        if location == MemoryLocation::HostVisible && raw.mapped_ptr().is_none() {
            return Err(Error::Backend(
                "host-visible buffer has no host mapping".to_owned(),
            ));
        }

        Ok(Buffer { raw, descriptor })
    }

    /// Creates a persistently mapped buffer used as a copy source.
    pub fn create_staging_buffer(&self, size: u64) -> Result<Buffer<A>> {
        self.create_buffer(size, BufferUsage::TRANSFER_SRC, MemoryLocation::HostVisible)
    }

    /// Creates a persistently mapped buffer used as a copy destination.
    pub fn create_readback_buffer(&self, size: u64) -> Result<Buffer<A>> {
        self.create_buffer(size, BufferUsage::TRANSFER_DST, MemoryLocation::HostVisible)
    }

    /// Creates a host-visible buffer holding `data`.
    pub fn create_buffer_init(&self, data: &[u8], usage: BufferUsage) -> Result<Buffer<A>> {
        let buffer = self.create_buffer(data.len() as u64, usage, MemoryLocation::HostVisible)?;
        buffer.write(0, data)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use glam::UVec2;

    use crate::backend::null::Null;
    use crate::backend::{
        BufferUsage, MemoryLocation, TextureDescriptor, TextureFormat, TextureLayout,
        TextureUsage,
    };
    use crate::test_util::null_device;

    use super::ResourceAllocator;

    #[test]
    fn buffer_write_bounds() {
        let device = null_device();
        let allocator = ResourceAllocator::<Null>::new(&device);

        let buffer = allocator.create_staging_buffer(16).unwrap();
        buffer.write(8, &[1; 8]).unwrap();
        assert!(buffer.write(9, &[1; 8]).is_err());
        assert!(buffer.write(u64::MAX, &[1]).is_err());
        assert_eq!(buffer.read(6, 4).unwrap(), vec![0, 0, 1, 1]);
    }

    #[test]
    fn device_local_buffer_is_not_mapped() {
        let device = null_device();
        let allocator = ResourceAllocator::<Null>::new(&device);

        let buffer = allocator
            .create_buffer(64, BufferUsage::VERTEX, MemoryLocation::DeviceLocal)
            .unwrap();
        assert!(!buffer.is_mapped());
        assert!(buffer.write(0, &[0]).is_err());
    }

    #[test]
    fn texture_transition_skips_same_layout() {
        let device = null_device();
        let allocator = ResourceAllocator::<Null>::new(&device);

        let mut texture = allocator
            .create_texture(&TextureDescriptor::new_2d(
                UVec2::new(8, 8),
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST,
            ))
            .unwrap();
        assert_eq!(texture.layout(), TextureLayout::Undefined);

        let barrier = texture.transition_barrier(TextureLayout::CopyDst).unwrap();
        assert_eq!(barrier.src, TextureLayout::Undefined);
        assert!(texture.transition_barrier(TextureLayout::CopyDst).is_none());
        assert_eq!(texture.layout(), TextureLayout::CopyDst);
    }
}
