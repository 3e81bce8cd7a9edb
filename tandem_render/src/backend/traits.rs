use std::fmt::Debug;
use std::ptr::NonNull;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::Error;

use super::{
    AcquiredImage, AdapterFeatures, AdapterInfo, BackendKind, BufferBarrier, BufferDescriptor,
    ColorTarget, DescriptorKind, DescriptorWrite, DeviceDescriptor, DeviceLimits,
    GraphicsPipelineDescriptor, IndexFormat, InstanceDescriptor, PipelineLayoutDescriptor,
    PlacedFootprint, PresentStatus, QueueKind, RenderPassDescriptor, SamplerDescriptor,
    ScissorRect, ShaderBytecode, Submission, Subresource, SurfaceCapabilities, SwapchainConfig,
    TextureBarrier, TextureDescriptor, TextureViewDescriptor, Viewport,
};

/// A graphics API implementation.
///
/// All objects created from a [`Device`] keep the device alive internally. Dropping
/// an object destroys the underlying API object immediately, so the caller must make
/// sure the GPU no longer uses it.
pub trait Api: Sized + 'static {
    const KIND: BackendKind;

    type Instance: Instance<Self>;
    type Adapter: Adapter<Self>;
    type Device: Device<Self>;
    type Queue: Queue<Self>;
    type CommandPool: CommandPool<Self>;
    type CommandEncoder: CommandEncoder<Self>;
    type Fence: Debug;
    type Buffer: BufferResource;
    type Texture: Debug;
    type TextureView: Debug;
    type Sampler: Debug;
    type DescriptorHeap: DescriptorHeap;
    type PipelineLayout: Debug;
    type Pipeline: Debug;
    type ShaderModule: Debug;
    type Surface: Surface<Self>;
    type Swapchain: Swapchain<Self>;
}

pub trait Instance<A: Api>: Sized {
    fn new(desc: &InstanceDescriptor<'_>) -> Result<Self, Error>;

    /// Returns all adapters exposed by the API, in driver order.
    fn adapters(&self) -> Result<Vec<A::Adapter>, Error>;

    /// Creates a new surface for a window.
    ///
    /// # Safety
    ///
    /// The handles must be valid and outlive the returned surface.
    unsafe fn create_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<A::Surface, Error>;
}

pub trait Adapter<A: Api> {
    fn info(&self) -> AdapterInfo;

    fn features(&self) -> AdapterFeatures;

    /// Creates the logical device together with its graphics and transfer queue.
    fn open(&self, desc: &DeviceDescriptor) -> Result<OpenDevice<A>, Error>;
}

pub struct OpenDevice<A: Api> {
    pub device: A::Device,
    pub graphics_queue: A::Queue,
    pub transfer_queue: A::Queue,
    /// Whether the transfer queue is backed by a separate hardware queue.
    pub dedicated_transfer: bool,
}

pub trait Device<A: Api> {
    fn limits(&self) -> DeviceLimits;

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<A::Buffer, Error>;

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<A::Texture, Error>;

    fn create_texture_view(
        &self,
        texture: &A::Texture,
        desc: &TextureViewDescriptor,
    ) -> Result<A::TextureView, Error>;

    fn create_sampler(&self, desc: &SamplerDescriptor) -> Result<A::Sampler, Error>;

    /// Creates a heap holding `capacity` descriptors of the given `kind`.
    fn create_descriptor_heap(
        &self,
        kind: DescriptorKind,
        capacity: u32,
    ) -> Result<A::DescriptorHeap, Error>;

    /// Writes a descriptor into slot `slot` of `heap`.
    ///
    /// # Safety
    ///
    /// `slot` must be less than the capacity of `heap` and the slot must not be used
    /// by any pending GPU work.
    unsafe fn write_descriptor(
        &self,
        heap: &A::DescriptorHeap,
        slot: u32,
        write: &DescriptorWrite<'_, A>,
    );

    fn create_shader_module(&self, code: &ShaderBytecode) -> Result<A::ShaderModule, Error>;

    fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDescriptor<'_>,
    ) -> Result<A::PipelineLayout, Error>;

    /// Creates a graphics pipeline.
    ///
    /// If `cached_blob` is given the backend tries to create the pipeline from it. A
    /// blob that does not match the device or the pipeline state is rejected with
    /// [`Error::PipelineCreate`].
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor<'_, A>,
        cached_blob: Option<&[u8]>,
    ) -> Result<A::Pipeline, Error>;

    /// Returns the driver cache blob of a pipeline.
    fn pipeline_cache_blob(&self, pipeline: &A::Pipeline) -> Result<Vec<u8>, Error>;

    fn create_command_pool(&self, queue: QueueKind) -> Result<A::CommandPool, Error>;

    fn create_fence(&self, initial_value: u64) -> Result<A::Fence, Error>;

    /// Returns the last value the fence reached.
    fn fence_value(&self, fence: &A::Fence) -> Result<u64, Error>;

    /// Blocks until `fence` reaches at least `value`.
    fn wait_fence(&self, fence: &A::Fence, value: u64) -> Result<(), Error>;

    /// Blocks until all queues are idle.
    fn wait_idle(&self) -> Result<(), Error>;
}

pub trait Queue<A: Api> {
    fn kind(&self) -> QueueKind;

    /// # Safety
    ///
    /// All encoders must be finished and every resource they reference must stay
    /// alive until the signaled fence values are reached.
    unsafe fn submit(&self, submission: &Submission<'_, A>) -> Result<(), Error>;

    /// Signals `fence` with `value` once all previously submitted work completed.
    ///
    /// # Safety
    ///
    /// `value` must be greater than any value previously signaled on `fence`.
    unsafe fn signal(&self, fence: &A::Fence, value: u64) -> Result<(), Error>;

    /// Presents the image last acquired from `swapchain`.
    ///
    /// # Safety
    ///
    /// The image must have been acquired and the submission rendering to it must have
    /// been submitted with [`Submission::swapchain`] set.
    unsafe fn present(
        &self,
        swapchain: &mut A::Swapchain,
        vsync: bool,
    ) -> Result<PresentStatus, Error>;
}

pub trait CommandPool<A: Api> {
    /// Resets all encoders allocated from this pool.
    ///
    /// # Safety
    ///
    /// No encoder allocated from this pool may still be executing on the GPU.
    unsafe fn reset(&mut self) -> Result<(), Error>;

    fn create_encoder(&mut self) -> Result<A::CommandEncoder, Error>;
}

pub trait CommandEncoder<A: Api> {
    /// Starts recording.
    ///
    /// # Safety
    ///
    /// The pool of the encoder must have been reset since the last submission.
    unsafe fn begin(&mut self) -> Result<(), Error>;

    /// Finishes recording.
    ///
    /// # Safety
    ///
    /// The encoder must be recording and no render pass may be active.
    unsafe fn end(&mut self) -> Result<(), Error>;

    /// Binds the shader-visible descriptor heaps of the device.
    fn bind_descriptor_heaps(&mut self);

    fn texture_barriers(&mut self, barriers: &[TextureBarrier<'_, A>]);

    fn buffer_barriers(&mut self, barriers: &[BufferBarrier<'_, A>]);

    fn copy_buffer_to_buffer(
        &mut self,
        src: &A::Buffer,
        src_offset: u64,
        dst: &A::Buffer,
        dst_offset: u64,
        size: u64,
    );

    fn copy_buffer_to_texture(
        &mut self,
        src: &A::Buffer,
        footprint: &PlacedFootprint,
        dst: &A::Texture,
        subresource: Subresource,
    );

    fn copy_texture_to_buffer(
        &mut self,
        src: &A::Texture,
        subresource: Subresource,
        dst: &A::Buffer,
        footprint: &PlacedFootprint,
    );

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor<'_, A>);

    fn end_render_pass(&mut self);

    fn set_viewport(&mut self, viewport: &Viewport);

    fn set_scissor(&mut self, scissor: &ScissorRect);

    fn bind_pipeline(&mut self, layout: &A::PipelineLayout, pipeline: &A::Pipeline);

    /// Binds slot `slot` of `heap` to table `table` of `layout`.
    fn set_descriptor_table(
        &mut self,
        layout: &A::PipelineLayout,
        table: u32,
        heap: &A::DescriptorHeap,
        slot: u32,
    );

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: &A::Buffer, offset: u64, stride: u32);

    fn bind_index_buffer(&mut self, buffer: &A::Buffer, offset: u64, format: IndexFormat);

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32);

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
    );
}

pub trait DescriptorHeap: Debug {
    fn kind(&self) -> DescriptorKind;

    fn capacity(&self) -> u32;

    /// Address of slot 0 in the CPU descriptor space.
    fn cpu_base(&self) -> u64;

    /// Address of slot 0 in the shader-visible descriptor space, if the heap is
    /// shader visible.
    fn gpu_base(&self) -> Option<u64>;

    /// Distance between two slots in both address spaces.
    fn stride(&self) -> u64;
}

pub trait BufferResource: Debug {
    fn size(&self) -> u64;

    /// Returns the persistent host mapping for host-visible buffers.
    fn mapped_ptr(&self) -> Option<NonNull<u8>>;
}

pub trait Surface<A: Api> {
    fn capabilities(&self, device: &A::Device) -> Result<SurfaceCapabilities, Error>;

    /// Creates a swapchain, reusing `old` if given.
    ///
    /// # Safety
    ///
    /// No image of `old` may be in use by the GPU.
    unsafe fn create_swapchain(
        &self,
        device: &A::Device,
        queue: &A::Queue,
        config: &SwapchainConfig,
        old: Option<A::Swapchain>,
    ) -> Result<A::Swapchain, Error>;
}

pub trait Swapchain<A: Api> {
    fn config(&self) -> &SwapchainConfig;

    fn images(&self) -> &[A::Texture];

    /// Acquires the next image to render to.
    ///
    /// # Safety
    ///
    /// The previously acquired image must have been presented.
    unsafe fn acquire(&mut self) -> Result<AcquiredImage, Error>;
}

/// Blend mode compatible color targets. Used to validate pipeline descriptors.
pub(crate) fn color_targets_valid(targets: &[ColorTarget]) -> bool {
    targets.iter().all(|target| !target.format.is_depth())
}
