//! Headless backend that executes all work in host memory.
//!
//! Buffers and textures are plain byte arrays, copies run when a submission executes
//! and fences are counters. Draws and render passes are recorded but rasterize nothing.
//! Submissions execute immediately unless the adapter was created in deferred mode, in
//! which case work only completes when it is waited on or [`NullDevice::flush`] is
//! called.

mod command;
mod resources;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use glam::UVec2;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::Error;

use super::traits::color_targets_valid;
use super::{
    AcquiredImage, AdapterFeatures, AdapterInfo, AdapterKind, Api, BackendKind,
    BufferDescriptor, DescriptorKind, DescriptorWrite, DeviceDescriptor, DeviceLimits,
    GraphicsPipelineDescriptor, InstanceDescriptor, OpenDevice, PipelineLayoutDescriptor,
    PresentMode, PresentStatus, QueueKind, SamplerDescriptor, ShaderBytecode, Submission,
    SurfaceCapabilities, SwapchainConfig, TextureDescriptor, TextureFormat, TextureUsage,
    TextureViewDescriptor,
};

pub use command::{NullCommand, NullCommandEncoder, NullCommandPool};
pub use resources::{
    NullBuffer, NullDescriptor, NullDescriptorHeap, NullFence, NullPipeline,
    NullPipelineLayout, NullSampler, NullShaderModule, NullTexture, NullTextureView,
};

/// Version tag embedded in pipeline cache blobs.
const PIPELINE_BLOB_MAGIC: &[u8; 8] = b"TNDMNULL";
const PIPELINE_BLOB_VERSION: u32 = 1;

/// Largest single allocation the null device accepts.
const MAX_ALLOCATION: u64 = 1 << 30;

#[derive(Copy, Clone, Debug)]
pub enum Null {}

impl Api for Null {
    const KIND: BackendKind = BackendKind::Null;

    type Instance = NullInstance;
    type Adapter = NullAdapter;
    type Device = NullDevice;
    type Queue = NullQueue;
    type CommandPool = NullCommandPool;
    type CommandEncoder = NullCommandEncoder;
    type Fence = NullFence;
    type Buffer = NullBuffer;
    type Texture = NullTexture;
    type TextureView = NullTextureView;
    type Sampler = NullSampler;
    type DescriptorHeap = NullDescriptorHeap;
    type PipelineLayout = NullPipelineLayout;
    type Pipeline = NullPipeline;
    type ShaderModule = NullShaderModule;
    type Surface = NullSurface;
    type Swapchain = NullSwapchain;
}

/// Description of a simulated adapter.
#[derive(Clone, Debug)]
pub struct NullAdapterDesc {
    pub info: AdapterInfo,
    pub features: AdapterFeatures,
    pub dedicated_transfer: bool,
    /// Submitted work only completes when waited on or flushed.
    pub deferred: bool,
}

impl Default for NullAdapterDesc {
    fn default() -> Self {
        Self {
            info: AdapterInfo {
                name: "Null Device".to_owned(),
                kind: AdapterKind::DiscreteGpu,
                vendor_id: 0,
                device_id: 0,
            },
            features: AdapterFeatures::all(),
            dedicated_transfer: true,
            deferred: false,
        }
    }
}

/// Test hooks shared by every object created from one [`NullInstance`].
#[derive(Debug, Default)]
pub struct NullControl {
    lose_device: AtomicBool,
    out_of_date: AtomicBool,
    surface_size: Mutex<Option<UVec2>>,
}

impl NullControl {
    /// Makes the next submission fail with [`Error::DeviceLost`].
    pub fn lose_device(&self) {
        self.lose_device.store(true, Ordering::Release);
    }

    /// Makes the next present report [`Error::SwapchainOutOfDate`].
    pub fn invalidate_swapchain(&self) {
        self.out_of_date.store(true, Ordering::Release);
    }

    /// Sets the extent reported by surface capabilities.
    pub fn set_surface_size(&self, size: UVec2) {
        *self.surface_size.lock() = Some(size);
    }
}

#[derive(Debug)]
pub struct NullInstance {
    adapters: Vec<NullAdapterDesc>,
    control: Arc<NullControl>,
}

impl NullInstance {
    pub fn with_adapters(adapters: Vec<NullAdapterDesc>) -> Self {
        Self {
            adapters,
            control: Arc::default(),
        }
    }

    pub fn control(&self) -> Arc<NullControl> {
        self.control.clone()
    }
}

impl super::Instance<Null> for NullInstance {
    fn new(desc: &InstanceDescriptor<'_>) -> Result<Self, Error> {
        tracing::debug!("creating null instance for {}", desc.app_name);
        Ok(Self::with_adapters(vec![NullAdapterDesc::default()]))
    }

    fn adapters(&self) -> Result<Vec<NullAdapter>, Error> {
        Ok(self
            .adapters
            .iter()
            .map(|desc| NullAdapter {
                desc: desc.clone(),
                control: self.control.clone(),
            })
            .collect())
    }

    unsafe fn create_surface(
        &self,
        _display: RawDisplayHandle,
        _window: RawWindowHandle,
    ) -> Result<NullSurface, Error> {
        Ok(NullSurface {
            control: self.control.clone(),
        })
    }
}

#[derive(Debug)]
pub struct NullAdapter {
    desc: NullAdapterDesc,
    control: Arc<NullControl>,
}

impl super::Adapter<Null> for NullAdapter {
    fn info(&self) -> AdapterInfo {
        self.desc.info.clone()
    }

    fn features(&self) -> AdapterFeatures {
        self.desc.features
    }

    fn open(&self, desc: &DeviceDescriptor) -> Result<OpenDevice<Null>, Error> {
        if !self.desc.features.contains(AdapterFeatures::REQUIRED) {
            return Err(Error::Backend(format!(
                "adapter {} misses features {:?}",
                self.desc.info.name,
                AdapterFeatures::REQUIRED - self.desc.features
            )));
        }

        tracing::debug!(
            "opening null device with {} resource and {} sampler descriptors",
            desc.resource_descriptors,
            desc.sampler_descriptors
        );

        let shared = Arc::new(DeviceShared {
            limits: DeviceLimits {
                row_pitch_alignment: 256,
                placement_alignment: 512,
                uniform_buffer_alignment: 256,
                max_sampler_anisotropy: 16.0,
                max_texture_dimension: 16384,
            },
            deferred: self.desc.deferred,
            pending: Mutex::new(VecDeque::new()),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            stats: Mutex::new(NullStats::default()),
            control: self.control.clone(),
            next_id: AtomicU64::new(1),
        });

        Ok(OpenDevice {
            device: NullDevice {
                shared: shared.clone(),
            },
            graphics_queue: NullQueue {
                kind: QueueKind::Graphics,
                shared: shared.clone(),
            },
            transfer_queue: NullQueue {
                kind: QueueKind::Transfer,
                shared,
            },
            dedicated_transfer: self.desc.dedicated_transfer,
        })
    }
}

/// Counters of the work performed by a [`NullDevice`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NullStats {
    pub submissions: u64,
    pub presents: u64,
    pub pipelines_created: u64,
    pub pipelines_from_cache: u64,
    pub live_buffers: u64,
    pub live_textures: u64,
    pub copies_executed: u64,
    pub draws_executed: u64,
}

#[derive(Debug)]
struct DeviceShared {
    limits: DeviceLimits,
    deferred: bool,
    pending: Mutex<VecDeque<PendingWork>>,
    /// Serial of the last submission.
    submitted: AtomicU64,
    /// Serial of the last submission that executed.
    completed: AtomicU64,
    stats: Mutex<NullStats>,
    control: Arc<NullControl>,
    next_id: AtomicU64,
}

impl DeviceShared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, work: PendingWork) {
        if self.deferred {
            self.pending.lock().push_back(work);
        } else {
            self.execute(work);
        }
    }

    fn execute(&self, work: PendingWork) {
        let mut stats = self.stats.lock();
        for command in &work.commands {
            command.execute(&mut stats);
        }
        drop(stats);

        self.completed.fetch_max(work.serial, Ordering::AcqRel);
        for (fence, value) in work.signals {
            fence.signal(value);
        }
    }

    /// Executes pending work until `done` returns `true` or the queue is empty.
    fn execute_until(&self, mut done: impl FnMut() -> bool) {
        while !done() {
            let Some(work) = self.pending.lock().pop_front() else {
                return;
            };
            self.execute(work);
        }
    }
}

#[derive(Debug)]
struct PendingWork {
    /// Zero for work that only signals fences.
    serial: u64,
    commands: Vec<NullCommand>,
    signals: Vec<(NullFence, u64)>,
}

#[derive(Clone, Debug)]
pub struct NullDevice {
    shared: Arc<DeviceShared>,
}

impl NullDevice {
    pub fn stats(&self) -> NullStats {
        *self.shared.stats.lock()
    }

    /// Executes all pending work of a deferred device.
    pub fn flush(&self) {
        self.shared.execute_until(|| false);
    }

    /// Number of submissions that have not executed yet.
    pub fn pending_submissions(&self) -> usize {
        self.shared.pending.lock().len()
    }

    fn pipeline_blob(desc: &GraphicsPipelineDescriptor<'_, Null>) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(desc.vertex.module.code.as_bytes());
        hasher.update(desc.vertex.entry.as_bytes());
        hasher.update(desc.fragment.module.code.as_bytes());
        hasher.update(desc.fragment.entry.as_bytes());
        hasher.update(format!("{:?}", desc.layout.tables).as_bytes());
        hasher.update(
            format!(
                "{:?}{:?}{:?}{:?}{:?}{:?}{:?}",
                desc.vertex_layout,
                desc.topology,
                desc.cull_mode,
                desc.front_face,
                desc.wireframe,
                desc.depth,
                desc.color_targets,
            )
            .as_bytes(),
        );

        let mut blob = Vec::with_capacity(8 + 4 + 32);
        blob.extend_from_slice(PIPELINE_BLOB_MAGIC);
        blob.extend_from_slice(&PIPELINE_BLOB_VERSION.to_le_bytes());
        blob.extend_from_slice(hasher.finalize().as_bytes());
        blob
    }
}

impl super::Device<Null> for NullDevice {
    fn limits(&self) -> DeviceLimits {
        self.shared.limits
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<NullBuffer, Error> {
        if desc.size == 0 {
            return Err(Error::Backend("cannot create zero-sized buffer".to_owned()));
        }
        if desc.size > MAX_ALLOCATION {
            return Err(Error::OutOfMemory);
        }

        self.shared.stats.lock().live_buffers += 1;
        Ok(NullBuffer::new(*desc, self.clone()))
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<NullTexture, Error> {
        let max = self.shared.limits.max_texture_dimension;
        if desc.size.x == 0 || desc.size.y == 0 || desc.mip_levels == 0 || desc.array_layers == 0
        {
            return Err(Error::Backend(format!("invalid texture descriptor {:?}", desc)));
        }
        if desc.size.x > max || desc.size.y > max {
            return Err(Error::OutOfMemory);
        }

        self.shared.stats.lock().live_textures += 1;
        Ok(NullTexture::new(
            *desc,
            self.shared.next_id(),
            Some(self.clone()),
        ))
    }

    fn create_texture_view(
        &self,
        texture: &NullTexture,
        desc: &TextureViewDescriptor,
    ) -> Result<NullTextureView, Error> {
        let tex = texture.descriptor();
        if desc.base_mip_level + desc.mip_levels > tex.mip_levels
            || desc.base_array_layer + desc.array_layers > tex.array_layers
        {
            return Err(Error::Backend(format!(
                "view {:?} out of range of {:?}",
                desc, tex
            )));
        }

        Ok(NullTextureView::new(texture, *desc))
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> Result<NullSampler, Error> {
        Ok(NullSampler {
            descriptor: *desc,
        })
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorKind,
        capacity: u32,
    ) -> Result<NullDescriptorHeap, Error> {
        Ok(NullDescriptorHeap::new(kind, capacity, self.shared.next_id()))
    }

    unsafe fn write_descriptor(
        &self,
        heap: &NullDescriptorHeap,
        slot: u32,
        write: &DescriptorWrite<'_, Null>,
    ) {
        let descriptor = match write {
            DescriptorWrite::UniformBuffer { offset, size, .. } => NullDescriptor::UniformBuffer {
                offset: *offset,
                size: *size,
            },
            DescriptorWrite::StorageBuffer { offset, size, .. } => NullDescriptor::StorageBuffer {
                offset: *offset,
                size: *size,
            },
            DescriptorWrite::SampledTexture(view) => NullDescriptor::SampledTexture(view.id()),
            DescriptorWrite::StorageTexture(view) => NullDescriptor::StorageTexture(view.id()),
            DescriptorWrite::Sampler(_) => NullDescriptor::Sampler,
        };

        heap.write(slot, descriptor);
    }

    fn create_shader_module(&self, code: &ShaderBytecode) -> Result<NullShaderModule, Error> {
        match code {
            ShaderBytecode::SpirV(words) if words.first() == Some(&0x0723_0203) => {
                Ok(NullShaderModule { code: code.clone() })
            }
            ShaderBytecode::SpirV(_) => {
                Err(Error::Backend("shader module is not valid SPIR-V".to_owned()))
            }
            ShaderBytecode::Dxil(_) => Err(Error::Backend(
                "null backend only accepts SPIR-V".to_owned(),
            )),
        }
    }

    fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDescriptor<'_>,
    ) -> Result<NullPipelineLayout, Error> {
        Ok(NullPipelineLayout {
            tables: desc.tables.to_vec(),
            static_samplers: desc.static_samplers.len(),
        })
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor<'_, Null>,
        cached_blob: Option<&[u8]>,
    ) -> Result<NullPipeline, Error> {
        if desc.color_targets.is_empty() && desc.depth.is_none() {
            return Err(Error::PipelineCreate(format!(
                "{}: pipeline has no attachments",
                desc.label
            )));
        }
        if !color_targets_valid(desc.color_targets) {
            return Err(Error::PipelineCreate(format!(
                "{}: depth format used as color target",
                desc.label
            )));
        }

        let blob = Self::pipeline_blob(desc);

        let mut stats = self.shared.stats.lock();
        match cached_blob {
            Some(cached) if cached == blob.as_slice() => stats.pipelines_from_cache += 1,
            Some(_) => {
                return Err(Error::PipelineCreate(format!(
                    "{}: cached blob does not match pipeline",
                    desc.label
                )));
            }
            None => stats.pipelines_created += 1,
        }

        Ok(NullPipeline {
            label: desc.label.to_owned(),
            blob,
        })
    }

    fn pipeline_cache_blob(&self, pipeline: &NullPipeline) -> Result<Vec<u8>, Error> {
        Ok(pipeline.blob.clone())
    }

    fn create_command_pool(&self, queue: QueueKind) -> Result<NullCommandPool, Error> {
        Ok(NullCommandPool::new(queue, self.shared.clone()))
    }

    fn create_fence(&self, initial_value: u64) -> Result<NullFence, Error> {
        Ok(NullFence::new(initial_value))
    }

    fn fence_value(&self, fence: &NullFence) -> Result<u64, Error> {
        Ok(fence.value())
    }

    fn wait_fence(&self, fence: &NullFence, value: u64) -> Result<(), Error> {
        self.shared.execute_until(|| fence.value() >= value);

        if fence.value() >= value {
            Ok(())
        } else {
            Err(Error::Backend(format!(
                "waiting for fence value {} that is never signaled (current {})",
                value,
                fence.value()
            )))
        }
    }

    fn wait_idle(&self) -> Result<(), Error> {
        self.flush();
        Ok(())
    }
}

#[derive(Debug)]
pub struct NullQueue {
    kind: QueueKind,
    shared: Arc<DeviceShared>,
}

impl super::Queue<Null> for NullQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    unsafe fn submit(&self, submission: &Submission<'_, Null>) -> Result<(), Error> {
        if self.shared.control.lose_device.swap(false, Ordering::AcqRel) {
            return Err(Error::DeviceLost);
        }

        let mut commands = Vec::new();
        for encoder in submission.encoders {
            if !encoder.is_executable() {
                return Err(Error::Backend(
                    "submitted encoder that is not finished".to_owned(),
                ));
            }
            commands.extend(encoder.commands().iter().cloned());
        }

        let serial = self.shared.submitted.fetch_add(1, Ordering::AcqRel) + 1;
        for encoder in submission.encoders {
            encoder.mark_submitted(serial);
        }

        self.shared.stats.lock().submissions += 1;
        self.shared.enqueue(PendingWork {
            serial,
            commands,
            signals: submission
                .signal
                .iter()
                .map(|(fence, value)| ((*fence).clone(), *value))
                .collect(),
        });

        Ok(())
    }

    unsafe fn signal(&self, fence: &NullFence, value: u64) -> Result<(), Error> {
        self.shared.enqueue(PendingWork {
            serial: 0,
            commands: Vec::new(),
            signals: vec![(fence.clone(), value)],
        });
        Ok(())
    }

    unsafe fn present(
        &self,
        swapchain: &mut NullSwapchain,
        _vsync: bool,
    ) -> Result<PresentStatus, Error> {
        if swapchain.acquired.take().is_none() {
            return Err(Error::Backend("present without acquired image".to_owned()));
        }

        self.shared.stats.lock().presents += 1;

        if self.shared.control.out_of_date.swap(false, Ordering::AcqRel) {
            return Err(Error::SwapchainOutOfDate);
        }

        Ok(PresentStatus::Optimal)
    }
}

#[derive(Debug)]
pub struct NullSurface {
    control: Arc<NullControl>,
}

impl super::Surface<Null> for NullSurface {
    fn capabilities(&self, _device: &NullDevice) -> Result<SurfaceCapabilities, Error> {
        Ok(SurfaceCapabilities {
            min_images: 2,
            max_images: Some(8),
            current_extent: *self.control.surface_size.lock(),
            min_extent: UVec2::ONE,
            max_extent: UVec2::splat(16384),
            formats: vec![
                TextureFormat::Bgra8UnormSrgb,
                TextureFormat::Bgra8Unorm,
                TextureFormat::Rgba8Unorm,
            ],
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox, PresentMode::Immediate],
        })
    }

    unsafe fn create_swapchain(
        &self,
        device: &NullDevice,
        _queue: &NullQueue,
        config: &SwapchainConfig,
        old: Option<NullSwapchain>,
    ) -> Result<NullSwapchain, Error> {
        drop(old);

        let desc = TextureDescriptor::new_2d(
            config.extent,
            config.format,
            TextureUsage::RENDER_TARGET | TextureUsage::TRANSFER_SRC,
        );

        let images = (0..config.image_count)
            .map(|_| NullTexture::new(desc, device.shared.next_id(), None))
            .collect();

        Ok(NullSwapchain {
            config: *config,
            images,
            next: 0,
            acquired: None,
        })
    }
}

#[derive(Debug)]
pub struct NullSwapchain {
    config: SwapchainConfig,
    images: Vec<NullTexture>,
    next: u32,
    acquired: Option<u32>,
}

impl super::Swapchain<Null> for NullSwapchain {
    fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    fn images(&self) -> &[NullTexture] {
        &self.images
    }

    unsafe fn acquire(&mut self) -> Result<AcquiredImage, Error> {
        if self.acquired.is_some() {
            return Err(Error::Backend(
                "acquired swapchain image twice without presenting".to_owned(),
            ));
        }

        let index = self.next;
        self.next = (self.next + 1) % self.config.image_count;
        self.acquired = Some(index);

        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use glam::UVec2;

    use crate::backend::{
        Adapter, BufferDescriptor, BufferResource, BufferUsage, CommandEncoder, CommandPool,
        Device, Instance, InstanceDescriptor, MemoryLocation, QueueKind, Submission,
        TextureDescriptor, TextureFormat, TextureUsage,
    };

    use super::{NullAdapterDesc, NullInstance};

    fn instance() -> NullInstance {
        NullInstance::new(&InstanceDescriptor {
            app_name: "test",
            validation: false,
        })
        .unwrap()
    }

    #[test]
    fn null_buffer_copy_executes_on_submit() {
        let adapter = instance().adapters().unwrap().remove(0);
        let open = adapter.open(&crate::device::DEFAULT_DEVICE_DESCRIPTOR).unwrap();
        let device = open.device;

        let src = device
            .create_buffer(&BufferDescriptor {
                size: 16,
                usage: BufferUsage::TRANSFER_SRC,
                location: MemoryLocation::HostVisible,
            })
            .unwrap();
        let dst = device
            .create_buffer(&BufferDescriptor {
                size: 16,
                usage: BufferUsage::TRANSFER_DST,
                location: MemoryLocation::DeviceLocal,
            })
            .unwrap();
        assert!(dst.mapped_ptr().is_none());

        src.write_bytes(0, &[7; 16]);

        let mut pool = device.create_command_pool(QueueKind::Transfer).unwrap();
        let mut encoder = pool.create_encoder().unwrap();
        let fence = device.create_fence(0).unwrap();
        unsafe {
            encoder.begin().unwrap();
            encoder.copy_buffer_to_buffer(&src, 0, &dst, 0, 16);
            encoder.end().unwrap();

            crate::backend::Queue::submit(
                &open.transfer_queue,
                &Submission {
                    encoders: &[&encoder],
                    wait: &[],
                    signal: &[(&fence, 1)],
                    swapchain: None,
                },
            )
            .unwrap();
        }

        assert_eq!(device.fence_value(&fence).unwrap(), 1);
        assert_eq!(dst.read_bytes(0, 16), vec![7; 16]);
        assert_eq!(device.stats().copies_executed, 1);
    }

    #[test]
    fn null_deferred_device_completes_on_wait() {
        let instance = NullInstance::with_adapters(vec![NullAdapterDesc {
            deferred: true,
            ..Default::default()
        }]);
        let adapter = instance.adapters().unwrap().remove(0);
        let open = adapter.open(&crate::device::DEFAULT_DEVICE_DESCRIPTOR).unwrap();

        let fence = open.device.create_fence(0).unwrap();
        unsafe {
            crate::backend::Queue::signal(&open.graphics_queue, &fence, 1).unwrap();
        }

        assert_eq!(open.device.fence_value(&fence).unwrap(), 0);
        assert_eq!(open.device.pending_submissions(), 1);

        open.device.wait_fence(&fence, 1).unwrap();
        assert_eq!(open.device.fence_value(&fence).unwrap(), 1);
        assert!(open.device.wait_fence(&fence, 2).is_err());
    }

    #[test]
    fn null_pool_reset_fails_while_in_flight() {
        let instance = NullInstance::with_adapters(vec![NullAdapterDesc {
            deferred: true,
            ..Default::default()
        }]);
        let adapter = instance.adapters().unwrap().remove(0);
        let open = adapter.open(&crate::device::DEFAULT_DEVICE_DESCRIPTOR).unwrap();

        let mut pool = open.device.create_command_pool(QueueKind::Graphics).unwrap();
        let mut encoder = pool.create_encoder().unwrap();
        unsafe {
            pool.reset().unwrap();
            encoder.begin().unwrap();
            encoder.end().unwrap();

            crate::backend::Queue::submit(
                &open.graphics_queue,
                &Submission {
                    encoders: &[&encoder],
                    wait: &[],
                    signal: &[],
                    swapchain: None,
                },
            )
            .unwrap();

            assert!(pool.reset().is_err());
            open.device.flush();
            pool.reset().unwrap();
        }
    }

    #[test]
    fn null_resources_are_counted() {
        let adapter = instance().adapters().unwrap().remove(0);
        let device = adapter
            .open(&crate::device::DEFAULT_DEVICE_DESCRIPTOR)
            .unwrap()
            .device;

        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                UVec2::new(4, 4),
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED,
            ))
            .unwrap();
        assert_eq!(device.stats().live_textures, 1);

        drop(texture);
        assert_eq!(device.stats().live_textures, 0);
    }
}
