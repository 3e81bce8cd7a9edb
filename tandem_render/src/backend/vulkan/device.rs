use std::collections::HashMap;
use std::ffi::CString;
use std::fmt::{self, Debug, Formatter};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tandem_tracing::trace_span;

use crate::backend::traits::color_targets_valid;
use crate::backend::{
    AdapterFeatures, BufferDescriptor, BufferResource, DescriptorKind, DescriptorWrite,
    DeviceLimits, GraphicsPipelineDescriptor, MemoryLocation, PipelineLayoutDescriptor,
    QueueKind, SamplerDescriptor, ShaderBytecode, TextureDescriptor, TextureViewDescriptor,
};
use crate::error::Error;

use super::command::VulkanCommandPool;
use super::memory::{Allocation, MemoryAllocator};
use super::swapchain::VulkanQueue;
use super::{conv, InstanceShared, Vulkan};

/// Size of `VkPipelineCacheHeaderVersionOne`.
const PIPELINE_CACHE_HEADER_SIZE: usize = 32;

pub(crate) struct DeviceShared {
    pub(super) raw: ash::Device,
    pub(super) instance: Arc<InstanceShared>,
    pub(super) physical_device: vk::PhysicalDevice,
    pub(super) properties: vk::PhysicalDeviceProperties,
    pub(super) features: AdapterFeatures,
    pub(super) graphics_family: u32,
    pub(super) transfer_family: u32,
    pub(super) swapchain_fns: ash::khr::swapchain::Device,
    pub(super) debug_utils: Option<ash::ext::debug_utils::Device>,
    memory: Mutex<MemoryAllocator>,
    /// Set layouts with a single descriptor at binding 0, `None` is the empty layout.
    set_layouts: Mutex<HashMap<Option<DescriptorKind>, vk::DescriptorSetLayout>>,
    queue_locks: Mutex<Vec<Arc<Mutex<()>>>>,
    next_heap_id: AtomicU64,
}

impl DeviceShared {
    /// Queue families that access resources. Resources are shared concurrently
    /// between a distinct transfer family and the graphics family.
    fn queue_families(&self) -> Vec<u32> {
        if self.graphics_family == self.transfer_family {
            Vec::new()
        } else {
            vec![self.graphics_family, self.transfer_family]
        }
    }

    fn set_layout(&self, kind: Option<DescriptorKind>) -> Result<vk::DescriptorSetLayout, Error> {
        let mut layouts = self.set_layouts.lock();
        if let Some(layout) = layouts.get(&kind) {
            return Ok(*layout);
        }

        let bindings = match kind {
            Some(kind) => vec![vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(conv::descriptor_type(kind))
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::ALL_GRAPHICS)],
            None => Vec::new(),
        };

        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe { self.raw.create_descriptor_set_layout(&info, None)? };
        layouts.insert(kind, layout);
        Ok(layout)
    }

    fn alloc_memory(
        &self,
        req: vk::MemoryRequirements,
        location: MemoryLocation,
    ) -> Result<Allocation, Error> {
        self.memory.lock().alloc(&self.raw, req, location)
    }

    /// # Safety
    ///
    /// No resource bound to the allocation may be in use.
    unsafe fn dealloc_memory(&self, allocation: Allocation) {
        unsafe {
            self.memory.lock().dealloc(&self.raw, allocation);
        }
    }
}

impl Debug for DeviceShared {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceShared")
            .field("physical_device", &self.physical_device)
            .field("graphics_family", &self.graphics_family)
            .field("transfer_family", &self.transfer_family)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        // Every object created from the device holds a reference to it, so this is
        // the last user of the device.
        unsafe {
            self.memory.get_mut().destroy(&self.raw);

            for (_, layout) in self.set_layouts.get_mut().drain() {
                self.raw.destroy_descriptor_set_layout(layout, None);
            }

            self.raw.destroy_device(None);
        }
    }
}

#[derive(Debug)]
pub struct VulkanDevice {
    shared: Arc<DeviceShared>,
}

impl VulkanDevice {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        instance: Arc<InstanceShared>,
        raw: ash::Device,
        physical_device: vk::PhysicalDevice,
        properties: vk::PhysicalDeviceProperties,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        features: AdapterFeatures,
        graphics_family: u32,
        transfer_family: u32,
    ) -> Self {
        let swapchain_fns = ash::khr::swapchain::Device::new(instance.raw(), &raw);
        let debug_utils = instance
            .has_debug_utils()
            .then(|| ash::ext::debug_utils::Device::new(instance.raw(), &raw));

        Self {
            shared: Arc::new(DeviceShared {
                raw,
                physical_device,
                properties,
                features,
                graphics_family,
                transfer_family,
                swapchain_fns,
                debug_utils,
                memory: Mutex::new(MemoryAllocator::new(memory_properties)),
                set_layouts: Mutex::new(HashMap::new()),
                queue_locks: Mutex::new(Vec::new()),
                next_heap_id: AtomicU64::new(0),
                instance,
            }),
        }
    }

    pub(super) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// Returns queue 0 of `family`. Queues backed by the same `VkQueue` must pass
    /// the queue created first as `share`.
    pub(super) fn queue(
        &self,
        family: u32,
        kind: QueueKind,
        share: Option<&VulkanQueue>,
    ) -> VulkanQueue {
        let raw = unsafe { self.shared.raw.get_device_queue(family, 0) };

        let lock = match share {
            Some(queue) => queue.lock().clone(),
            None => {
                let lock = Arc::new(Mutex::new(()));
                self.shared.queue_locks.lock().push(lock.clone());
                lock
            }
        };

        VulkanQueue::new(self.shared.clone(), raw, kind, lock)
    }
}

impl crate::backend::Device<Vulkan> for VulkanDevice {
    fn limits(&self) -> DeviceLimits {
        let limits = &self.shared.properties.limits;

        DeviceLimits {
            row_pitch_alignment: limits.optimal_buffer_copy_row_pitch_alignment.max(4),
            placement_alignment: limits.optimal_buffer_copy_offset_alignment.max(16),
            uniform_buffer_alignment: limits.min_uniform_buffer_offset_alignment,
            max_sampler_anisotropy: limits.max_sampler_anisotropy,
            max_texture_dimension: limits.max_image_dimension2_d,
        }
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<VulkanBuffer, Error> {
        let _span = trace_span!("VulkanDevice::create_buffer").entered();

        let usage = conv::buffer_usage(desc.usage);
        if desc.size == 0 || usage.is_empty() {
            return Err(Error::Backend(format!(
                "invalid buffer descriptor {:?}",
                desc
            )));
        }

        let families = self.shared.queue_families();
        let info = vk::BufferCreateInfo::default()
            // - `size` must be greater than 0.
            .size(desc.size)
            // - `usage` must not be 0.
            .usage(usage)
            .sharing_mode(sharing_mode(&families))
            .queue_family_indices(&families);

        let raw = unsafe { self.shared.raw.create_buffer(&info, None)? };
        let mut buffer = VulkanBuffer {
            raw,
            size: desc.size,
            allocation: None,
            shared: self.shared.clone(),
        };

        let req = unsafe { self.shared.raw.get_buffer_memory_requirements(raw) };
        let allocation = self.shared.alloc_memory(req, desc.location)?;
        unsafe {
            self.shared
                .raw
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())?;
        }
        buffer.allocation = Some(allocation);

        Ok(buffer)
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<VulkanTexture, Error> {
        let _span = trace_span!("VulkanDevice::create_texture").entered();

        let families = self.shared.queue_families();
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(conv::texture_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.size.x,
                height: desc.size.y,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conv::texture_usage(desc.usage))
            .sharing_mode(sharing_mode(&families))
            .queue_family_indices(&families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let raw = unsafe { self.shared.raw.create_image(&info, None)? };
        let mut texture = VulkanTexture {
            raw,
            desc: *desc,
            allocation: None,
            owned: true,
            shared: self.shared.clone(),
        };

        let req = unsafe { self.shared.raw.get_image_memory_requirements(raw) };
        let allocation = self.shared.alloc_memory(req, MemoryLocation::DeviceLocal)?;
        unsafe {
            self.shared
                .raw
                .bind_image_memory(raw, allocation.memory(), allocation.offset())?;
        }
        texture.allocation = Some(allocation);

        Ok(texture)
    }

    fn create_texture_view(
        &self,
        texture: &VulkanTexture,
        desc: &TextureViewDescriptor,
    ) -> Result<VulkanTextureView, Error> {
        let view_type = if desc.array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(conv::aspect(texture.desc.format))
            .base_mip_level(desc.base_mip_level)
            .level_count(desc.mip_levels)
            .base_array_layer(desc.base_array_layer)
            .layer_count(desc.array_layers);

        let info = vk::ImageViewCreateInfo::default()
            .image(texture.raw)
            .view_type(view_type)
            .format(conv::texture_format(texture.desc.format))
            .components(vk::ComponentMapping::default())
            .subresource_range(subresource_range);

        let raw = unsafe { self.shared.raw.create_image_view(&info, None)? };
        Ok(VulkanTextureView {
            raw,
            shared: self.shared.clone(),
        })
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> Result<VulkanSampler, Error> {
        let raw = create_sampler(&self.shared, desc)?;
        Ok(VulkanSampler {
            raw,
            shared: self.shared.clone(),
        })
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorKind,
        capacity: u32,
    ) -> Result<VulkanDescriptorHeap, Error> {
        let _span = trace_span!("VulkanDevice::create_descriptor_heap").entered();

        let layout = self.shared.set_layout(Some(kind))?;

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(conv::descriptor_type(kind))
            .descriptor_count(capacity)];
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(capacity)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { self.shared.raw.create_descriptor_pool(&info, None)? };
        let mut heap = VulkanDescriptorHeap {
            pool,
            sets: Vec::new(),
            kind,
            capacity,
            id: self.shared.next_heap_id.fetch_add(1, Ordering::Relaxed),
            shared: self.shared.clone(),
        };

        let layouts = vec![layout; capacity as usize];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        heap.sets = unsafe { self.shared.raw.allocate_descriptor_sets(&info)? };

        Ok(heap)
    }

    unsafe fn write_descriptor(
        &self,
        heap: &VulkanDescriptorHeap,
        slot: u32,
        write: &DescriptorWrite<'_, Vulkan>,
    ) {
        let set = heap.sets[slot as usize];
        let ty = conv::descriptor_type(heap.kind);

        let mut buffer_info = [vk::DescriptorBufferInfo::default()];
        let mut image_info = [vk::DescriptorImageInfo::default()];

        let info = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(ty);

        let info = match write {
            DescriptorWrite::UniformBuffer {
                buffer,
                offset,
                size,
            }
            | DescriptorWrite::StorageBuffer {
                buffer,
                offset,
                size,
            } => {
                buffer_info[0] = buffer_info[0]
                    .buffer(buffer.raw)
                    .offset(*offset)
                    .range(*size);
                info.buffer_info(&buffer_info)
            }
            DescriptorWrite::SampledTexture(view) => {
                image_info[0] = image_info[0]
                    .image_view(view.raw)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                info.image_info(&image_info)
            }
            DescriptorWrite::StorageTexture(view) => {
                image_info[0] = image_info[0]
                    .image_view(view.raw)
                    .image_layout(vk::ImageLayout::GENERAL);
                info.image_info(&image_info)
            }
            DescriptorWrite::Sampler(sampler) => {
                image_info[0] = image_info[0].sampler(sampler.raw);
                info.image_info(&image_info)
            }
        };

        // SAFETY: The caller guarantees that the set is not in use.
        unsafe {
            self.shared.raw.update_descriptor_sets(&[info], &[]);
        }
    }

    fn create_shader_module(&self, code: &ShaderBytecode) -> Result<VulkanShaderModule, Error> {
        let ShaderBytecode::SpirV(words) = code else {
            return Err(Error::Backend(
                "vulkan shader modules require SPIR-V bytecode".to_owned(),
            ));
        };

        // Code size must be greater than 0.
        if words.is_empty() {
            return Err(Error::Backend("empty shader bytecode".to_owned()));
        }

        let info = vk::ShaderModuleCreateInfo::default().code(words);
        let raw = unsafe { self.shared.raw.create_shader_module(&info, None)? };
        Ok(VulkanShaderModule {
            raw,
            shared: self.shared.clone(),
        })
    }

    fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDescriptor<'_>,
    ) -> Result<VulkanPipelineLayout, Error> {
        let _span = trace_span!("VulkanDevice::create_pipeline_layout").entered();

        // Partially created objects are destroyed by the drop impl on error.
        let mut layout = VulkanPipelineLayout {
            raw: vk::PipelineLayout::null(),
            table_sets: Vec::with_capacity(desc.tables.len()),
            static_pool: vk::DescriptorPool::null(),
            static_sets: Vec::new(),
            static_set_layouts: Vec::new(),
            samplers: Vec::new(),
            shared: self.shared.clone(),
        };

        let mut sets: Vec<Option<vk::DescriptorSetLayout>> = Vec::new();
        let mut claim_set = |space: u32, set_layout: vk::DescriptorSetLayout| -> Result<(), Error> {
            let index = space as usize;
            if sets.len() <= index {
                sets.resize(index + 1, None);
            }

            if sets[index].is_some() {
                return Err(Error::PipelineCreate(format!(
                    "more than one binding in descriptor set {}",
                    space
                )));
            }

            sets[index] = Some(set_layout);
            Ok(())
        };

        for table in desc.tables {
            let range = &table.range;
            if range.register != 0 || range.count != 1 {
                return Err(Error::PipelineCreate(format!(
                    "descriptor table {:?} must bind a single descriptor at binding 0",
                    range
                )));
            }

            claim_set(range.space, self.shared.set_layout(Some(range.kind))?)?;
            layout.table_sets.push(range.space);
        }

        for sampler in desc.static_samplers {
            let raw = create_sampler(&self.shared, &sampler.descriptor)?;
            layout.samplers.push(raw);

            let immutable = [raw];
            let bindings = [vk::DescriptorSetLayoutBinding::default()
                .binding(sampler.register)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(conv::shader_stages(sampler.visibility))
                .immutable_samplers(&immutable)];

            let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            let set_layout = unsafe { self.shared.raw.create_descriptor_set_layout(&info, None)? };
            layout.static_set_layouts.push(set_layout);

            claim_set(sampler.space, set_layout)?;
        }

        let empty = self.shared.set_layout(None)?;
        let set_layouts: Vec<_> = sets.iter().map(|set| set.unwrap_or(empty)).collect();

        let info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        layout.raw = unsafe { self.shared.raw.create_pipeline_layout(&info, None)? };

        if !desc.static_samplers.is_empty() {
            let count = desc.static_samplers.len() as u32;
            let pool_sizes = [vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLER)
                .descriptor_count(count)];
            let info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(count)
                .pool_sizes(&pool_sizes);
            layout.static_pool = unsafe { self.shared.raw.create_descriptor_pool(&info, None)? };

            let info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(layout.static_pool)
                .set_layouts(&layout.static_set_layouts);
            let static_sets = unsafe { self.shared.raw.allocate_descriptor_sets(&info)? };

            // Immutable samplers need no descriptor writes.
            layout.static_sets = desc
                .static_samplers
                .iter()
                .map(|sampler| sampler.space)
                .zip(static_sets)
                .collect();
        }

        Ok(layout)
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor<'_, Vulkan>,
        cached_blob: Option<&[u8]>,
    ) -> Result<VulkanPipeline, Error> {
        let _span = trace_span!("VulkanDevice::create_graphics_pipeline").entered();

        if !color_targets_valid(desc.color_targets) {
            return Err(Error::PipelineCreate(format!(
                "{}: depth format used as color target",
                desc.label
            )));
        }

        if desc.wireframe && !self.shared.features.contains(AdapterFeatures::FILL_MODE_NON_SOLID)
        {
            return Err(Error::PipelineCreate(format!(
                "{}: wireframe rendering is not supported",
                desc.label
            )));
        }

        let initial_data = match cached_blob {
            Some(blob) => {
                let props = &self.shared.properties;
                validate_cache_header(
                    blob,
                    props.vendor_id,
                    props.device_id,
                    &props.pipeline_cache_uuid,
                )
                .map_err(|err| Error::PipelineCreate(format!("{}: {}", desc.label, err)))?;
                blob
            }
            None => &[],
        };

        let info = vk::PipelineCacheCreateInfo::default().initial_data(initial_data);
        let cache = unsafe { self.shared.raw.create_pipeline_cache(&info, None) }
            .map_err(|err| pipeline_error(desc.label, err))?;

        let mut pipeline = VulkanPipeline {
            raw: vk::Pipeline::null(),
            cache,
            shared: self.shared.clone(),
        };

        let vertex_entry = entry_name(desc.label, desc.vertex.entry)?;
        let fragment_entry = entry_name(desc.label, desc.fragment.entry)?;
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(desc.vertex.module.raw)
                .name(&vertex_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(desc.fragment.module.raw)
                .name(&fragment_entry),
        ];

        let mut vertex_bindings = Vec::new();
        let mut vertex_attributes = Vec::new();
        if let Some(layout) = desc.vertex_layout {
            vertex_bindings.push(
                vk::VertexInputBindingDescription::default()
                    .binding(0)
                    .stride(layout.stride)
                    .input_rate(vk::VertexInputRate::VERTEX),
            );
            vertex_attributes.extend(layout.attributes.iter().map(|attribute| {
                vk::VertexInputAttributeDescription::default()
                    .location(attribute.location)
                    .binding(0)
                    .format(conv::vertex_format(attribute.format))
                    .offset(attribute.offset)
            }));
        }

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(conv::topology(desc.topology))
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic, only the counts are used.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let polygon_mode = if desc.wireframe {
            vk::PolygonMode::LINE
        } else {
            vk::PolygonMode::FILL
        };

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(polygon_mode)
            .cull_mode(conv::cull_mode(desc.cull_mode))
            .front_face(conv::front_face(desc.front_face))
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil_state = desc.depth.map(|depth| {
            vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(depth.write_enabled)
                .depth_compare_op(conv::compare_op(depth.compare_op))
                .depth_bounds_test_enable(false)
                .stencil_test_enable(false)
        });

        let attachments: Vec<_> = desc
            .color_targets
            .iter()
            .map(|target| conv::blend_attachment(target.blend))
            .collect();
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&attachments)
            .blend_constants([0.0, 0.0, 0.0, 0.0]);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: Vec<_> = desc
            .color_targets
            .iter()
            .map(|target| conv::texture_format(target.format))
            .collect();
        let depth_format = desc
            .depth
            .map(|depth| conv::texture_format(depth.format))
            .unwrap_or(vk::Format::UNDEFINED);
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format);

        let mut info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout.raw)
            // Not needed since we are using dynamic rendering.
            .render_pass(vk::RenderPass::null())
            .subpass(0)
            .push_next(&mut rendering_info);
        if let Some(depth_stencil_state) = &depth_stencil_state {
            info = info.depth_stencil_state(depth_stencil_state);
        }

        let pipelines = unsafe {
            self.shared
                .raw
                .create_graphics_pipelines(cache, &[info], None)
        }
        .map_err(|(_, err)| pipeline_error(desc.label, err))?;

        pipeline.raw = pipelines.first().copied().ok_or_else(|| {
            Error::PipelineCreate(format!("{}: driver returned no pipeline", desc.label))
        })?;

        Ok(pipeline)
    }

    fn pipeline_cache_blob(&self, pipeline: &VulkanPipeline) -> Result<Vec<u8>, Error> {
        Ok(unsafe { self.shared.raw.get_pipeline_cache_data(pipeline.cache)? })
    }

    fn create_command_pool(&self, queue: QueueKind) -> Result<VulkanCommandPool, Error> {
        let family = match queue {
            QueueKind::Graphics => self.shared.graphics_family,
            QueueKind::Transfer => self.shared.transfer_family,
        };

        VulkanCommandPool::new(self.shared.clone(), family)
    }

    fn create_fence(&self, initial_value: u64) -> Result<VulkanFence, Error> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let raw = unsafe { self.shared.raw.create_semaphore(&info, None)? };
        Ok(VulkanFence {
            raw,
            shared: self.shared.clone(),
        })
    }

    fn fence_value(&self, fence: &VulkanFence) -> Result<u64, Error> {
        Ok(unsafe { self.shared.raw.get_semaphore_counter_value(fence.raw)? })
    }

    fn wait_fence(&self, fence: &VulkanFence, value: u64) -> Result<(), Error> {
        let _span = trace_span!("VulkanDevice::wait_fence").entered();

        let semaphores = [fence.raw];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        // Waits are bounded by GPU progress. A lost device returns `ERROR_DEVICE_LOST`.
        unsafe { self.shared.raw.wait_semaphores(&info, u64::MAX)? };
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), Error> {
        // Host access to all queues must be externally synchronized.
        let locks = self.shared.queue_locks.lock();
        let _guards: Vec<_> = locks.iter().map(|lock| lock.lock()).collect();

        unsafe { self.shared.raw.device_wait_idle()? };
        Ok(())
    }
}

fn sharing_mode(families: &[u32]) -> vk::SharingMode {
    if families.is_empty() {
        vk::SharingMode::EXCLUSIVE
    } else {
        vk::SharingMode::CONCURRENT
    }
}

fn create_sampler(shared: &DeviceShared, desc: &SamplerDescriptor) -> Result<vk::Sampler, Error> {
    let anisotropy = desc.max_anisotropy > 1.0
        && shared.features.contains(AdapterFeatures::SAMPLER_ANISOTROPY);

    let info = vk::SamplerCreateInfo::default()
        .mag_filter(conv::filter(desc.mag_filter))
        .min_filter(conv::filter(desc.min_filter))
        .mipmap_mode(conv::mipmap_mode(desc.mipmap_filter))
        .address_mode_u(conv::address_mode(desc.address_mode_u))
        .address_mode_v(conv::address_mode(desc.address_mode_v))
        .address_mode_w(conv::address_mode(desc.address_mode_w))
        .anisotropy_enable(anisotropy)
        .max_anisotropy(
            desc.max_anisotropy
                .clamp(1.0, shared.properties.limits.max_sampler_anisotropy),
        )
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE)
        .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);

    Ok(unsafe { shared.raw.create_sampler(&info, None)? })
}

fn entry_name(label: &str, entry: &str) -> Result<CString, Error> {
    CString::new(entry).map_err(|_| {
        Error::PipelineCreate(format!("{}: entry point {:?} contains a nul byte", label, entry))
    })
}

fn pipeline_error(label: &str, err: vk::Result) -> Error {
    match Error::from(err) {
        Error::Backend(msg) => Error::PipelineCreate(format!("{}: {}", label, msg)),
        err => err,
    }
}

/// Checks that a pipeline cache blob was created by a device with the same
/// `vendor_id`, `device_id` and `uuid`.
///
/// The header is `VkPipelineCacheHeaderVersionOne`, which is always little endian.
fn validate_cache_header(
    blob: &[u8],
    vendor_id: u32,
    device_id: u32,
    uuid: &[u8; vk::UUID_SIZE],
) -> Result<(), String> {
    if blob.len() < PIPELINE_CACHE_HEADER_SIZE {
        return Err(format!("cache blob of {} bytes has no header", blob.len()));
    }

    let read_u32 = |offset: usize| {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&blob[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    };

    let header_size = read_u32(0);
    let version = read_u32(4);

    if (header_size as usize) < PIPELINE_CACHE_HEADER_SIZE || header_size as usize > blob.len() {
        return Err(format!("invalid cache header size {}", header_size));
    }

    if version != vk::PipelineCacheHeaderVersion::ONE.as_raw() as u32 {
        return Err(format!("unknown cache header version {}", version));
    }

    if read_u32(8) != vendor_id || read_u32(12) != device_id || blob[16..32] != uuid[..] {
        return Err("cache blob was created by a different device or driver".to_owned());
    }

    Ok(())
}

#[derive(Debug)]
pub struct VulkanBuffer {
    pub(super) raw: vk::Buffer,
    size: u64,
    allocation: Option<Allocation>,
    shared: Arc<DeviceShared>,
}

impl BufferResource for VulkanBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation.as_ref().and_then(|allocation| allocation.ptr())
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.shared.raw.destroy_buffer(self.raw, None);
            if let Some(allocation) = self.allocation.take() {
                self.shared.dealloc_memory(allocation);
            }
        }
    }
}

#[derive(Debug)]
pub struct VulkanTexture {
    pub(super) raw: vk::Image,
    pub(super) desc: TextureDescriptor,
    allocation: Option<Allocation>,
    /// `false` for swapchain images.
    owned: bool,
    shared: Arc<DeviceShared>,
}

impl VulkanTexture {
    /// Wraps an image owned by a swapchain.
    pub(super) fn from_swapchain(
        shared: Arc<DeviceShared>,
        raw: vk::Image,
        desc: TextureDescriptor,
    ) -> Self {
        Self {
            raw,
            desc,
            allocation: None,
            owned: false,
            shared,
        }
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }

        unsafe {
            self.shared.raw.destroy_image(self.raw, None);
            if let Some(allocation) = self.allocation.take() {
                self.shared.dealloc_memory(allocation);
            }
        }
    }
}

#[derive(Debug)]
pub struct VulkanTextureView {
    pub(super) raw: vk::ImageView,
    shared: Arc<DeviceShared>,
}

impl Drop for VulkanTextureView {
    fn drop(&mut self) {
        unsafe {
            self.shared.raw.destroy_image_view(self.raw, None);
        }
    }
}

#[derive(Debug)]
pub struct VulkanSampler {
    raw: vk::Sampler,
    shared: Arc<DeviceShared>,
}

impl Drop for VulkanSampler {
    fn drop(&mut self) {
        unsafe {
            self.shared.raw.destroy_sampler(self.raw, None);
        }
    }
}

/// A descriptor pool with one set per slot.
///
/// Slot addresses are `id << 32 | slot` in both address spaces.
#[derive(Debug)]
pub struct VulkanDescriptorHeap {
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    kind: DescriptorKind,
    capacity: u32,
    id: u64,
    shared: Arc<DeviceShared>,
}

impl VulkanDescriptorHeap {
    pub(super) fn set(&self, slot: u32) -> vk::DescriptorSet {
        self.sets[slot as usize]
    }
}

impl crate::backend::DescriptorHeap for VulkanDescriptorHeap {
    fn kind(&self) -> DescriptorKind {
        self.kind
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn cpu_base(&self) -> u64 {
        self.id << 32
    }

    fn gpu_base(&self) -> Option<u64> {
        Some(self.id << 32)
    }

    fn stride(&self) -> u64 {
        1
    }
}

impl Drop for VulkanDescriptorHeap {
    fn drop(&mut self) {
        // Destroying the pool frees all sets.
        unsafe {
            self.shared.raw.destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[derive(Debug)]
pub struct VulkanShaderModule {
    raw: vk::ShaderModule,
    shared: Arc<DeviceShared>,
}

impl Drop for VulkanShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.shared.raw.destroy_shader_module(self.raw, None);
        }
    }
}

#[derive(Debug)]
pub struct VulkanPipelineLayout {
    pub(super) raw: vk::PipelineLayout,
    /// Set index of every table.
    pub(super) table_sets: Vec<u32>,
    static_pool: vk::DescriptorPool,
    /// Set index and set of every static sampler.
    pub(super) static_sets: Vec<(u32, vk::DescriptorSet)>,
    static_set_layouts: Vec<vk::DescriptorSetLayout>,
    samplers: Vec<vk::Sampler>,
    shared: Arc<DeviceShared>,
}

impl Drop for VulkanPipelineLayout {
    fn drop(&mut self) {
        // Destroying null handles is a no-op.
        unsafe {
            self.shared.raw.destroy_pipeline_layout(self.raw, None);
            self.shared
                .raw
                .destroy_descriptor_pool(self.static_pool, None);

            for layout in &self.static_set_layouts {
                self.shared.raw.destroy_descriptor_set_layout(*layout, None);
            }

            for sampler in &self.samplers {
                self.shared.raw.destroy_sampler(*sampler, None);
            }
        }
    }
}

/// A graphics pipeline and the driver cache it was created with.
#[derive(Debug)]
pub struct VulkanPipeline {
    pub(super) raw: vk::Pipeline,
    cache: vk::PipelineCache,
    shared: Arc<DeviceShared>,
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            self.shared.raw.destroy_pipeline(self.raw, None);
            self.shared.raw.destroy_pipeline_cache(self.cache, None);
        }
    }
}

/// A timeline semaphore.
#[derive(Debug)]
pub struct VulkanFence {
    pub(super) raw: vk::Semaphore,
    shared: Arc<DeviceShared>,
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            self.shared.raw.destroy_semaphore(self.raw, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::validate_cache_header;

    const VENDOR: u32 = 0x10de;
    const DEVICE: u32 = 0x2684;
    const UUID: [u8; 16] = [7; 16];

    fn header(vendor: u32, device: u32, uuid: [u8; 16]) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&32u32.to_le_bytes());
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&vendor.to_le_bytes());
        blob.extend_from_slice(&device.to_le_bytes());
        blob.extend_from_slice(&uuid);
        blob.extend_from_slice(&[0xab; 64]);
        blob
    }

    #[test]
    fn matching_header_is_accepted() {
        validate_cache_header(&header(VENDOR, DEVICE, UUID), VENDOR, DEVICE, &UUID).unwrap();
    }

    #[test]
    fn foreign_device_is_rejected() {
        assert!(validate_cache_header(&header(VENDOR, 1, UUID), VENDOR, DEVICE, &UUID).is_err());

        let mut uuid = UUID;
        uuid[15] = 0;
        assert!(validate_cache_header(&header(VENDOR, DEVICE, uuid), VENDOR, DEVICE, &UUID).is_err());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let blob = header(VENDOR, DEVICE, UUID);
        assert!(validate_cache_header(&blob[..20], VENDOR, DEVICE, &UUID).is_err());
        assert!(validate_cache_header(&[], VENDOR, DEVICE, &UUID).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut blob = header(VENDOR, DEVICE, UUID);
        blob[4] = 2;
        assert!(validate_cache_header(&blob, VENDOR, DEVICE, &UUID).is_err());
    }
}
