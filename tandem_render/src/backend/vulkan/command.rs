use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use crate::backend::{
    BufferBarrier, DescriptorHeap, IndexFormat, LoadOp, PlacedFootprint, RenderPassDescriptor,
    ScissorRect, Subresource, TextureBarrier, Viewport,
};
use crate::error::Error;

use super::device::{
    DeviceShared, VulkanBuffer, VulkanDescriptorHeap, VulkanPipeline, VulkanPipelineLayout,
    VulkanTexture,
};
use super::{conv, Vulkan};

#[derive(Debug)]
pub struct VulkanCommandPool {
    raw: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    shared: Arc<DeviceShared>,
}

impl VulkanCommandPool {
    pub(super) fn new(shared: Arc<DeviceShared>, family: u32) -> Result<Self, Error> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let raw = unsafe { shared.raw.create_command_pool(&info, None)? };
        Ok(Self {
            raw,
            buffers: Vec::new(),
            shared,
        })
    }
}

impl crate::backend::CommandPool<Vulkan> for VulkanCommandPool {
    unsafe fn reset(&mut self) -> Result<(), Error> {
        unsafe {
            self.shared
                .raw
                .reset_command_pool(self.raw, vk::CommandPoolResetFlags::empty())?;
        }

        Ok(())
    }

    fn create_encoder(&mut self) -> Result<VulkanCommandEncoder, Error> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.raw)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.shared.raw.allocate_command_buffers(&info)? };
        self.buffers.extend(&buffers);

        let raw = buffers
            .first()
            .copied()
            .ok_or_else(|| Error::Backend("driver allocated no command buffer".to_owned()))?;

        Ok(VulkanCommandEncoder {
            raw,
            shared: self.shared.clone(),
            labeled: false,
        })
    }
}

impl Drop for VulkanCommandPool {
    fn drop(&mut self) {
        unsafe {
            if !self.buffers.is_empty() {
                self.shared
                    .raw
                    .free_command_buffers(self.raw, &self.buffers);
            }

            self.shared.raw.destroy_command_pool(self.raw, None);
        }
    }
}

/// A primary command buffer.
///
/// The buffer is owned by its pool and freed when the pool is dropped.
#[derive(Debug)]
pub struct VulkanCommandEncoder {
    raw: vk::CommandBuffer,
    shared: Arc<DeviceShared>,
    /// A debug label is open for the active render pass.
    labeled: bool,
}

impl VulkanCommandEncoder {
    pub(super) fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    fn begin_label(&mut self, label: &str) {
        let Some(debug_utils) = &self.shared.debug_utils else {
            return;
        };

        // Labels with nul bytes are skipped.
        let Ok(name) = CString::new(label) else {
            return;
        };

        let info = vk::DebugUtilsLabelEXT::default().label_name(&name);
        unsafe {
            debug_utils.cmd_begin_debug_utils_label(self.raw, &info);
        }
        self.labeled = true;
    }

    fn end_label(&mut self) {
        if !self.labeled {
            return;
        }

        if let Some(debug_utils) = &self.shared.debug_utils {
            unsafe {
                debug_utils.cmd_end_debug_utils_label(self.raw);
            }
        }
        self.labeled = false;
    }
}

impl crate::backend::CommandEncoder<Vulkan> for VulkanCommandEncoder {
    unsafe fn begin(&mut self) -> Result<(), Error> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.shared.raw.begin_command_buffer(self.raw, &info)?;
        }

        self.labeled = false;
        Ok(())
    }

    unsafe fn end(&mut self) -> Result<(), Error> {
        unsafe {
            self.shared.raw.end_command_buffer(self.raw)?;
        }

        Ok(())
    }

    fn bind_descriptor_heaps(&mut self) {
        // Descriptor sets are bound individually by `set_descriptor_table`.
    }

    fn texture_barriers(&mut self, barriers: &[TextureBarrier<'_, Vulkan>]) {
        if barriers.is_empty() {
            return;
        }

        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();

        let image_barriers: Vec<_> = barriers
            .iter()
            .map(|barrier| {
                let (old_layout, src_stage, src_access) = conv::texture_layout(barrier.src);
                let (new_layout, dst_stage, dst_access) = conv::texture_layout(barrier.dst);
                src_stages |= src_stage;
                dst_stages |= dst_stage;

                vk::ImageMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .old_layout(old_layout)
                    .new_layout(new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(barrier.texture.raw)
                    .subresource_range(full_range(barrier.texture))
            })
            .collect();

        unsafe {
            self.shared.raw.cmd_pipeline_barrier(
                self.raw,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &image_barriers,
            );
        }
    }

    fn buffer_barriers(&mut self, barriers: &[BufferBarrier<'_, Vulkan>]) {
        if barriers.is_empty() {
            return;
        }

        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();

        let buffer_barriers: Vec<_> = barriers
            .iter()
            .map(|barrier| {
                let (src_stage, src_access) = conv::buffer_state(barrier.src);
                let (dst_stage, dst_access) = conv::buffer_state(barrier.dst);
                src_stages |= src_stage;
                dst_stages |= dst_stage;

                vk::BufferMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(barrier.buffer.raw)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
            })
            .collect();

        unsafe {
            self.shared.raw.cmd_pipeline_barrier(
                self.raw,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &buffer_barriers,
                &[],
            );
        }
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: &VulkanBuffer,
        src_offset: u64,
        dst: &VulkanBuffer,
        dst_offset: u64,
        size: u64,
    ) {
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);

        unsafe {
            self.shared
                .raw
                .cmd_copy_buffer(self.raw, src.raw, dst.raw, &[region]);
        }
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: &VulkanBuffer,
        footprint: &PlacedFootprint,
        dst: &VulkanTexture,
        subresource: Subresource,
    ) {
        let region = buffer_image_copy(dst, footprint, subresource);

        unsafe {
            self.shared.raw.cmd_copy_buffer_to_image(
                self.raw,
                src.raw,
                dst.raw,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn copy_texture_to_buffer(
        &mut self,
        src: &VulkanTexture,
        subresource: Subresource,
        dst: &VulkanBuffer,
        footprint: &PlacedFootprint,
    ) {
        let region = buffer_image_copy(src, footprint, subresource);

        unsafe {
            self.shared.raw.cmd_copy_image_to_buffer(
                self.raw,
                src.raw,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.raw,
                &[region],
            );
        }
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor<'_, Vulkan>) {
        self.begin_label(desc.label);

        let color_attachments: Vec<_> = desc
            .color_attachments
            .iter()
            .map(|attachment| {
                let clear_value = match attachment.load_op {
                    LoadOp::Clear(color) => vk::ClearValue {
                        color: vk::ClearColorValue { float32: color },
                    },
                    LoadOp::Load | LoadOp::DontCare => vk::ClearValue::default(),
                };

                vk::RenderingAttachmentInfo::default()
                    .image_view(attachment.view.raw)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(conv::load_op(&attachment.load_op))
                    .store_op(conv::store_op(attachment.store_op))
                    .clear_value(clear_value)
            })
            .collect();

        let depth_attachment = desc.depth_attachment.as_ref().map(|attachment| {
            let depth = match attachment.load_op {
                LoadOp::Clear(depth) => depth,
                LoadOp::Load | LoadOp::DontCare => 0.0,
            };

            vk::RenderingAttachmentInfo::default()
                .image_view(attachment.view.raw)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(conv::load_op(&attachment.load_op))
                .store_op(conv::store_op(attachment.store_op))
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
                })
        });

        let mut info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: desc.extent.x,
                    height: desc.extent.y,
                },
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = &depth_attachment {
            info = info.depth_attachment(depth_attachment);
        }

        unsafe {
            self.shared.raw.cmd_begin_rendering(self.raw, &info);
        }

        self.set_viewport(&Viewport::from_extent(desc.extent));
        self.set_scissor(&ScissorRect::from_extent(desc.extent));
    }

    fn end_render_pass(&mut self) {
        unsafe {
            self.shared.raw.cmd_end_rendering(self.raw);
        }

        self.end_label();
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        // Flip the y axis to match the D3D12 clip space.
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y + viewport.height,
            width: viewport.width,
            height: -viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };

        unsafe {
            self.shared.raw.cmd_set_viewport(self.raw, 0, &[viewport]);
        }
    }

    fn set_scissor(&mut self, scissor: &ScissorRect) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: scissor.x,
                y: scissor.y,
            },
            extent: vk::Extent2D {
                width: scissor.width,
                height: scissor.height,
            },
        };

        unsafe {
            self.shared.raw.cmd_set_scissor(self.raw, 0, &[scissor]);
        }
    }

    fn bind_pipeline(&mut self, layout: &VulkanPipelineLayout, pipeline: &VulkanPipeline) {
        unsafe {
            self.shared.raw.cmd_bind_pipeline(
                self.raw,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.raw,
            );

            for (set, descriptor_set) in &layout.static_sets {
                self.shared.raw.cmd_bind_descriptor_sets(
                    self.raw,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout.raw,
                    *set,
                    &[*descriptor_set],
                    &[],
                );
            }
        }
    }

    fn set_descriptor_table(
        &mut self,
        layout: &VulkanPipelineLayout,
        table: u32,
        heap: &VulkanDescriptorHeap,
        slot: u32,
    ) {
        let Some(set) = layout.table_sets.get(table as usize) else {
            tracing::error!("descriptor table {} is not part of the pipeline layout", table);
            return;
        };

        // Dynamic buffers are bound with the offset written into the descriptor.
        let dynamic_offsets: &[u32] = if conv::is_dynamic(heap.kind()) {
            &[0]
        } else {
            &[]
        };

        unsafe {
            self.shared.raw.cmd_bind_descriptor_sets(
                self.raw,
                vk::PipelineBindPoint::GRAPHICS,
                layout.raw,
                *set,
                &[heap.set(slot)],
                dynamic_offsets,
            );
        }
    }

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: &VulkanBuffer, offset: u64, _stride: u32) {
        // The stride is part of the pipeline.
        unsafe {
            self.shared
                .raw
                .cmd_bind_vertex_buffers(self.raw, slot, &[buffer.raw], &[offset]);
        }
    }

    fn bind_index_buffer(&mut self, buffer: &VulkanBuffer, offset: u64, format: IndexFormat) {
        unsafe {
            self.shared.raw.cmd_bind_index_buffer(
                self.raw,
                buffer.raw,
                offset,
                conv::index_type(format),
            );
        }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        unsafe {
            self.shared
                .raw
                .cmd_draw(self.raw, vertex_count, instance_count, first_vertex, 0);
        }
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
    ) {
        unsafe {
            self.shared.raw.cmd_draw_indexed(
                self.raw,
                index_count,
                instance_count,
                first_index,
                base_vertex,
                0,
            );
        }
    }
}

fn full_range(texture: &VulkanTexture) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(conv::aspect(texture.desc.format))
        .base_mip_level(0)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
}

fn buffer_image_copy(
    texture: &VulkanTexture,
    footprint: &PlacedFootprint,
    subresource: Subresource,
) -> vk::BufferImageCopy {
    // `buffer_row_length` is in texels.
    let row_length = footprint.row_pitch / u64::from(texture.desc.format.bytes_per_texel());

    vk::BufferImageCopy::default()
        .buffer_offset(footprint.offset)
        .buffer_row_length(row_length as u32)
        .buffer_image_height(footprint.row_count)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(conv::aspect(texture.desc.format))
                .mip_level(subresource.mip_level)
                .base_array_layer(subresource.array_layer)
                .layer_count(1),
        )
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width: footprint.width,
            height: footprint.height,
            depth: footprint.depth,
        })
}
