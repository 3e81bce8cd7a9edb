//! Passes of the default frame graph.
//!
//! ```text
//! model ─┐
//! debug ─┼─> composite ─> blit ─> backbuffer
//! ui ────┘
//! ```

mod blit;
mod composite;
mod debug_geometry;
mod model;
mod ui;

use bytemuck::Pod;

use crate::backend::{
    Api, BufferUsage, DescriptorKind, DescriptorRange, DescriptorWrite, MemoryLocation,
    SamplerDescriptor, TextureFormat,
};
use crate::descriptors::DescriptorHandle;
use crate::device::RenderDevice;
use crate::error::{Error, Result};
use crate::graph::{
    AttachmentDesc, AttachmentExtent, AttachmentLoad, FrameGraphBuilder, FrameGraphDescription,
    PassDesc,
};
use crate::resources::{Buffer, ResourceAllocator};
use crate::scene::SharedScene;

pub use blit::BlitPass;
pub use composite::CompositePass;
pub use debug_geometry::{DebugGeometryPass, DebugVertex};
pub use model::ModelPass;
pub use ui::UiPass;

pub const MODEL_PASS: &str = "model";
pub const DEBUG_PASS: &str = "debug";
pub const UI_PASS: &str = "ui";
pub const COMPOSITE_PASS: &str = "composite";
pub const BLIT_PASS: &str = "blit";

pub const SCENE_COLOR: &str = "scene_color";
pub const SCENE_DEPTH: &str = "scene_depth";
pub const DEBUG_OVERLAY: &str = "debug_overlay";
pub const UI_OVERLAY: &str = "ui_overlay";
pub const FINAL_COLOR: &str = "final_color";

/// Format of the intermediate color attachments.
pub const HDR_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
pub const OVERLAY_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// Static sampler used by all passes.
pub(crate) fn linear_sampler(_: &DescriptorRange) -> SamplerDescriptor {
    SamplerDescriptor::LINEAR_CLAMP
}

/// The graph rendering the scene, debug lines and UI to the backbuffer.
pub fn default_graph() -> FrameGraphDescription {
    let relative = |format, load| AttachmentDesc::new(format, AttachmentExtent::Swapchain, load);

    FrameGraphDescription::new()
        .pass(
            PassDesc::new(MODEL_PASS)
                .write_attachment(SCENE_COLOR, relative(HDR_FORMAT, AttachmentLoad::CLEAR_BLACK))
                .write_attachment(
                    SCENE_DEPTH,
                    relative(TextureFormat::Depth32Float, AttachmentLoad::CLEAR_DEPTH),
                ),
        )
        .pass(PassDesc::new(DEBUG_PASS).write_attachment(
            DEBUG_OVERLAY,
            relative(OVERLAY_FORMAT, AttachmentLoad::CLEAR_TRANSPARENT),
        ))
        .pass(PassDesc::new(UI_PASS).write_attachment(
            UI_OVERLAY,
            relative(OVERLAY_FORMAT, AttachmentLoad::CLEAR_TRANSPARENT),
        ))
        .pass(
            PassDesc::new(COMPOSITE_PASS)
                .read_attachment(SCENE_COLOR)
                .read_attachment(DEBUG_OVERLAY)
                .read_attachment(UI_OVERLAY)
                .write_attachment(
                    FINAL_COLOR,
                    relative(OVERLAY_FORMAT, AttachmentLoad::DontCare),
                ),
        )
        .pass(
            PassDesc::new(BLIT_PASS)
                .read_attachment(FINAL_COLOR)
                .write_backbuffer(AttachmentLoad::DontCare),
        )
}

/// Registers the passes of [`default_graph`].
///
/// `wireframe` requires [`AdapterFeatures::FILL_MODE_NON_SOLID`].
///
/// [`AdapterFeatures::FILL_MODE_NON_SOLID`]: crate::backend::AdapterFeatures::FILL_MODE_NON_SOLID
pub fn register_default_passes<A: Api>(
    builder: &mut FrameGraphBuilder<A>,
    scene: &SharedScene<A>,
    wireframe: bool,
) {
    builder
        .register(
            MODEL_PASS,
            ModelPass::new(scene.clone()).with_wireframe(wireframe),
        )
        .register(DEBUG_PASS, DebugGeometryPass::new(scene.clone()))
        .register(UI_PASS, UiPass::new(scene.clone()))
        .register(
            COMPOSITE_PASS,
            CompositePass::new([SCENE_COLOR, DEBUG_OVERLAY, UI_OVERLAY]),
        )
        .register(BLIT_PASS, BlitPass::new(FINAL_COLOR));
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment.max(1)) * alignment.max(1)
}

struct UniformSlot<A: Api> {
    // The descriptor references the buffer.
    descriptor: DescriptorHandle<A>,
    buffer: Buffer<A>,
}

/// One host-visible uniform buffer per frame in flight.
pub(crate) struct FrameUniforms<A: Api> {
    slots: Vec<UniformSlot<A>>,
}

impl<A: Api> FrameUniforms<A> {
    pub fn new(device: &RenderDevice<A>, frames: usize, size: u64) -> Result<Self> {
        let size = align_up(size, device.limits().uniform_buffer_alignment);
        let allocator = ResourceAllocator::<A>::new(device.raw());

        let slots = (0..frames.max(1))
            .map(|_| {
                let buffer =
                    allocator.create_buffer(size, BufferUsage::UNIFORM, MemoryLocation::HostVisible)?;
                let descriptor = device.allocate_descriptor(DescriptorKind::UniformBuffer)?;
                descriptor.write(
                    device.raw(),
                    &DescriptorWrite::UniformBuffer {
                        buffer: buffer.raw(),
                        offset: 0,
                        size,
                    },
                );
                Ok(UniformSlot { descriptor, buffer })
            })
            .collect::<Result<_>>()?;

        Ok(Self { slots })
    }

    /// Writes `value` into the buffer of `frame_slot` and returns its descriptor.
    pub fn write<T: Pod>(&self, frame_slot: usize, value: &T) -> Result<&DescriptorHandle<A>> {
        let slot = &self.slots[frame_slot % self.slots.len()];
        slot.buffer.write_pod(0, value)?;
        Ok(&slot.descriptor)
    }
}

struct DrawSlots<A: Api> {
    descriptors: Vec<DescriptorHandle<A>>,
    buffer: Option<Buffer<A>>,
}

/// Uniform data of individual draws, one region per draw and frame in flight.
///
/// Every frame slot grows independently when more draws are recorded than it has
/// regions for.
pub(crate) struct DrawUniforms<A: Api> {
    frames: Vec<DrawSlots<A>>,
    size: u64,
    stride: u64,
}

impl<A: Api> DrawUniforms<A> {
    const MIN_DRAWS: usize = 16;

    pub fn new(device: &RenderDevice<A>, frames: usize, size: u64) -> Self {
        Self {
            frames: (0..frames.max(1))
                .map(|_| DrawSlots {
                    descriptors: Vec::new(),
                    buffer: None,
                })
                .collect(),
            size,
            stride: align_up(size, device.limits().uniform_buffer_alignment),
        }
    }

    /// Number of draws the slots of `frame_slot` hold.
    pub fn capacity(&self, frame_slot: usize) -> usize {
        self.frames[frame_slot % self.frames.len()].descriptors.len()
    }

    /// Makes room for `count` draws in `frame_slot`.
    ///
    /// The GPU must not use the regions of `frame_slot`.
    pub fn reserve(&mut self, device: &RenderDevice<A>, frame_slot: usize, count: usize) -> Result<()> {
        let len = self.frames.len();
        let slots = &mut self.frames[frame_slot % len];
        if slots.descriptors.len() >= count {
            return Ok(());
        }

        let capacity = count.next_power_of_two().max(Self::MIN_DRAWS);
        tracing::debug!("growing draw uniforms of frame {} to {}", frame_slot, capacity);

        let buffer = ResourceAllocator::<A>::new(device.raw()).create_buffer(
            self.stride * capacity as u64,
            BufferUsage::UNIFORM,
            MemoryLocation::HostVisible,
        )?;

        let mut descriptors = Vec::with_capacity(capacity);
        device
            .descriptor_pool(DescriptorKind::UniformBuffer)
            .allocate_n(capacity as u32, &mut descriptors)?;

        for (index, descriptor) in descriptors.iter().enumerate() {
            descriptor.write(
                device.raw(),
                &DescriptorWrite::UniformBuffer {
                    buffer: buffer.raw(),
                    offset: index as u64 * self.stride,
                    size: self.stride,
                },
            );
        }

        // Old descriptors are released before the buffer they reference.
        slots.descriptors = descriptors;
        slots.buffer = Some(buffer);
        Ok(())
    }

    /// Writes `value` into region `index` of `frame_slot` and returns its descriptor.
    pub fn write<T: Pod>(
        &self,
        frame_slot: usize,
        index: usize,
        value: &T,
    ) -> Result<&DescriptorHandle<A>> {
        debug_assert!(std::mem::size_of::<T>() as u64 <= self.size);

        let slots = &self.frames[frame_slot % self.frames.len()];
        let (Some(buffer), Some(descriptor)) = (&slots.buffer, slots.descriptors.get(index)) else {
            return Err(Error::OutOfCapacity("draw uniforms"));
        };

        buffer.write_pod(index as u64 * self.stride, value)?;
        Ok(descriptor)
    }
}

/// Host-visible vertex or index data rewritten every frame, one buffer per frame slot.
pub(crate) struct FrameBuffers<A: Api> {
    buffers: Vec<Option<Buffer<A>>>,
    usage: BufferUsage,
}

impl<A: Api> FrameBuffers<A> {
    const MIN_SIZE: u64 = 4096;

    pub fn new(frames: usize, usage: BufferUsage) -> Self {
        Self {
            buffers: (0..frames.max(1)).map(|_| None).collect(),
            usage,
        }
    }

    /// Copies `data` into the buffer of `frame_slot`, growing it if needed.
    ///
    /// The GPU must not use the buffer of `frame_slot`.
    pub fn write(
        &mut self,
        device: &RenderDevice<A>,
        frame_slot: usize,
        data: &[u8],
    ) -> Result<&Buffer<A>> {
        let len = self.buffers.len();
        let buffer = &mut self.buffers[frame_slot % len];

        let required = (data.len() as u64).max(1);
        if buffer.as_ref().map_or(true, |buffer| buffer.size() < required) {
            let size = required.next_power_of_two().max(Self::MIN_SIZE);
            *buffer = Some(ResourceAllocator::<A>::new(device.raw()).create_buffer(
                size,
                self.usage,
                MemoryLocation::HostVisible,
            )?);
        }

        let Some(buffer) = buffer.as_ref() else {
            return Err(Error::OutOfCapacity("frame buffer"));
        };
        buffer.write(0, data)?;
        Ok(buffer)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use crate::backend::null::{Null, NullCommand};
    use crate::backend::{ShaderTarget, TextureFormat};
    use crate::descriptors::DescriptorHandle;
    use crate::graph::GraphTarget;
    use crate::shader::{ShaderCache, ShaderCompiler};
    use crate::test_util::render_device;

    use super::{align_up, DrawUniforms, FrameBuffers, FrameUniforms};

    pub fn shader_cache() -> ShaderCache {
        let root = PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/assets/shaders"));
        ShaderCache::new(ShaderCompiler::new(root, ShaderTarget::SpirV, false))
    }

    pub fn target() -> GraphTarget {
        GraphTarget {
            extent: glam::UVec2::new(320, 240),
            format: TextureFormat::Bgra8UnormSrgb,
        }
    }

    /// Labels of the pipelines bound by `commands`, in order.
    pub fn bound_pipelines(commands: &[NullCommand]) -> Vec<&str> {
        commands
            .iter()
            .filter_map(|command| match command {
                NullCommand::BindPipeline { label } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn frame_uniforms_per_slot() {
        let device = render_device();
        let uniforms = FrameUniforms::<Null>::new(&device, 3, 64).unwrap();

        let a = uniforms.write(0, &[1.0f32; 4]).unwrap().index();
        let b = uniforms.write(1, &[1.0f32; 4]).unwrap().index();
        let c = uniforms.write(3, &[1.0f32; 4]).unwrap().index();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn draw_uniforms_grow() {
        let device = render_device();
        let mut uniforms = DrawUniforms::<Null>::new(&device, 2, 128);
        assert!(uniforms.write(0, 0, &[0u8; 128]).is_err());

        uniforms.reserve(&device, 0, 3).unwrap();
        assert_eq!(uniforms.capacity(0), 16);
        assert_eq!(uniforms.capacity(1), 0);

        uniforms.reserve(&device, 0, 17).unwrap();
        assert_eq!(uniforms.capacity(0), 32);

        let first: &DescriptorHandle<Null> = uniforms.write(0, 31, &[0u8; 128]).unwrap();
        assert!(!first.is_empty());
        assert!(uniforms.write(0, 32, &[0u8; 128]).is_err());
    }

    #[test]
    fn frame_buffers_grow_per_slot() {
        let device = render_device();
        let mut buffers = FrameBuffers::<Null>::new(2, crate::backend::BufferUsage::VERTEX);

        assert_eq!(buffers.write(&device, 0, &[1; 16]).unwrap().size(), 4096);
        assert_eq!(buffers.write(&device, 1, &[2; 5000]).unwrap().size(), 8192);
        assert_eq!(buffers.write(&device, 0, &[3; 8]).unwrap().read(0, 2).unwrap(), [3, 3]);
    }
}
