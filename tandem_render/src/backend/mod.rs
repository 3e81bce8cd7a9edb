//! Backend abstraction shared by the Vulkan, D3D12 and null implementations.
//!
//! This module contains the vocabulary types passed to the backends and the traits in
//! [`traits`] that each backend implements. Code outside of `backend` is generic over
//! [`Api`] and never touches a raw graphics API object.

pub mod allocator;
pub mod null;
pub mod traits;
pub mod vulkan;

#[cfg(all(windows, feature = "dx12"))]
pub mod dx12;

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use bitflags::bitflags;
use glam::UVec2;

pub use traits::{
    Adapter, Api, BufferResource, CommandEncoder, CommandPool, DescriptorHeap, Device,
    Instance, OpenDevice, Queue, Surface, Swapchain,
};

/// Offset of a descriptor range that directly follows the previous range of the same
/// table.
pub const OFFSET_APPEND: u32 = u32::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Vulkan,
    Dx12,
    /// Headless backend executing all work in host memory.
    Null,
}

impl BackendKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Vulkan => "vulkan",
            Self::Dx12 => "dx12",
            Self::Null => "null",
        }
    }

    /// Returns `true` if this backend was compiled into the current build.
    pub const fn is_available(self) -> bool {
        match self {
            Self::Vulkan | Self::Null => true,
            Self::Dx12 => cfg!(all(windows, feature = "dx12")),
        }
    }

    /// Returns the native backend of the current platform.
    pub const fn platform_default() -> Self {
        if Self::Dx12.is_available() {
            Self::Dx12
        } else {
            Self::Vulkan
        }
    }

    pub const fn shader_target(self) -> ShaderTarget {
        match self {
            Self::Vulkan | Self::Null => ShaderTarget::SpirV,
            Self::Dx12 => ShaderTarget::Dxil,
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vulkan" | "vk" => Ok(Self::Vulkan),
            "dx12" | "d3d12" => Ok(Self::Dx12),
            "null" | "headless" => Ok(Self::Null),
            _ => Err(UnknownBackend(s.to_owned())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown backend: {0}")]
pub struct UnknownBackend(pub String);

/// Bytecode format consumed by a backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderTarget {
    SpirV,
    Dxil,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceDescriptor<'a> {
    pub app_name: &'a str,
    /// Enables the API validation layers if they are installed.
    pub validation: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    DiscreteGpu,
    IntegratedGpu,
    VirtualGpu,
    Cpu,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub kind: AdapterKind,
    pub vendor_id: u32,
    pub device_id: u32,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct AdapterFeatures: u32 {
        const SWAPCHAIN = 1 << 0;
        const DYNAMIC_RENDERING = 1 << 1;
        const DEPTH_STENCIL_RESOLVE = 1 << 2;
        const CREATE_RENDERPASS_2 = 1 << 3;
        const MULTIVIEW = 1 << 4;
        const MAINTENANCE_2 = 1 << 5;
        const SAMPLER_ANISOTROPY = 1 << 6;
        /// 64-bit monotonic fences that can be waited on from the host.
        const TIMELINE_FENCE = 1 << 7;
        /// Line and point polygon modes. Used for wireframe pipelines.
        const FILL_MODE_NON_SOLID = 1 << 8;
    }
}

impl AdapterFeatures {
    /// Features an adapter must support to be selected.
    pub const REQUIRED: Self = Self::SWAPCHAIN
        .union(Self::DYNAMIC_RENDERING)
        .union(Self::DEPTH_STENCIL_RESOLVE)
        .union(Self::CREATE_RENDERPASS_2)
        .union(Self::MULTIVIEW)
        .union(Self::MAINTENANCE_2)
        .union(Self::SAMPLER_ANISOTROPY)
        .union(Self::TIMELINE_FENCE);
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DeviceLimits {
    /// Required alignment of the row pitch in buffer <-> texture copies.
    pub row_pitch_alignment: u64,
    /// Required alignment of each subresource in buffer <-> texture copies.
    pub placement_alignment: u64,
    pub uniform_buffer_alignment: u64,
    pub max_sampler_anisotropy: f32,
    pub max_texture_dimension: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Total number of CBV/SRV/UAV descriptors that must be shader visible at once.
    pub resource_descriptors: u32,
    /// Total number of sampler descriptors that must be shader visible at once.
    pub sampler_descriptors: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Transfer,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Memory only accessible by the GPU.
    DeviceLocal,
    /// Memory that is persistently mapped into the host address space.
    HostVisible,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Depth32Float,
}

impl TextureFormat {
    pub const fn is_srgb(&self) -> bool {
        matches!(self, Self::Bgra8UnormSrgb | Self::Rgba8UnormSrgb)
    }

    pub const fn is_depth(&self) -> bool {
        matches!(self, Self::Depth32Float)
    }

    pub const fn bytes_per_texel(&self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const RENDER_TARGET = 1 << 4;
        const DEPTH_STENCIL = 1 << 5;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const VERTEX = 1 << 2;
        const INDEX = 1 << 3;
        const UNIFORM = 1 << 4;
        const STORAGE = 1 << 5;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub size: UVec2,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDescriptor {
    pub fn new_2d(size: UVec2, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            size,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage,
        }
    }

    pub const fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_layers
    }

    /// Returns the extent of the given mip level.
    pub fn mip_size(&self, mip_level: u32) -> UVec2 {
        UVec2::new(
            u32::max(self.size.x >> mip_level, 1),
            u32::max(self.size.y >> mip_level, 1),
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureViewDescriptor {
    pub base_mip_level: u32,
    pub mip_levels: u32,
    pub base_array_layer: u32,
    pub array_layers: u32,
}

impl TextureViewDescriptor {
    /// A view of the first mip level of the first layer.
    pub const FIRST: Self = Self {
        base_mip_level: 0,
        mip_levels: 1,
        base_array_layer: 0,
        array_layers: 1,
    };
}

/// Logical layout (or resource state) of a texture.
///
/// Layouts are transitioned with [`TextureBarrier`]s.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureLayout {
    /// Contents are undefined and may be discarded.
    Undefined,
    /// Usable by all queues and operations with reduced performance.
    Common,
    CopyDst,
    CopySrc,
    ShaderRead,
    ColorAttachment,
    DepthAttachment,
    Present,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferState {
    Common,
    CopyDst,
    CopySrc,
    Vertex,
    Index,
    Uniform,
    ShaderRead,
    ShaderWrite,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    MirrorRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SamplerDescriptor {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    /// Anisotropic filtering is disabled for values `<= 1.0`.
    pub max_anisotropy: f32,
}

impl SamplerDescriptor {
    pub const LINEAR_CLAMP: Self = Self {
        min_filter: FilterMode::Linear,
        mag_filter: FilterMode::Linear,
        mipmap_filter: FilterMode::Linear,
        address_mode_u: AddressMode::ClampToEdge,
        address_mode_v: AddressMode::ClampToEdge,
        address_mode_w: AddressMode::ClampToEdge,
        max_anisotropy: 1.0,
    };

    pub const LINEAR_REPEAT: Self = Self {
        min_filter: FilterMode::Linear,
        mag_filter: FilterMode::Linear,
        mipmap_filter: FilterMode::Linear,
        address_mode_u: AddressMode::Repeat,
        address_mode_v: AddressMode::Repeat,
        address_mode_w: AddressMode::Repeat,
        max_anisotropy: 16.0,
    };
}

/// The kind of descriptor stored in a descriptor pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorKind {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
    InputAttachment,
}

impl DescriptorKind {
    pub const ALL: [Self; 11] = [
        Self::Sampler,
        Self::CombinedImageSampler,
        Self::SampledImage,
        Self::StorageImage,
        Self::UniformTexelBuffer,
        Self::StorageTexelBuffer,
        Self::UniformBuffer,
        Self::StorageBuffer,
        Self::UniformBufferDynamic,
        Self::StorageBufferDynamic,
        Self::InputAttachment,
    ];

    /// Returns the shader-visible range type this descriptor kind occupies.
    pub const fn range_type(self) -> RangeType {
        match self {
            Self::Sampler => RangeType::Sampler,
            Self::UniformBuffer | Self::UniformBufferDynamic => RangeType::Cbv,
            Self::CombinedImageSampler
            | Self::SampledImage
            | Self::UniformTexelBuffer
            | Self::InputAttachment => RangeType::Srv,
            Self::StorageImage
            | Self::StorageTexelBuffer
            | Self::StorageBuffer
            | Self::StorageBufferDynamic => RangeType::Uav,
        }
    }
}

/// Register class of a descriptor range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RangeType {
    /// Constant buffer view.
    Cbv,
    /// Shader resource view (read-only).
    Srv,
    /// Unordered access view (read-write).
    Uav,
    Sampler,
}

/// A contiguous range of descriptors bound to consecutive shader registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub ty: RangeType,
    pub kind: DescriptorKind,
    pub register: u32,
    pub space: u32,
    pub count: u32,
    /// Offset from the start of the table, or [`OFFSET_APPEND`].
    pub offset: u32,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub const fn stages(self) -> ShaderStages {
        match self {
            Self::Vertex => ShaderStages::VERTEX,
            Self::Fragment => ShaderStages::FRAGMENT,
        }
    }
}

/// A descriptor table of a pipeline layout. Each table holds a single range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RootTable {
    pub range: DescriptorRange,
    pub visibility: ShaderStages,
}

/// A sampler baked into the pipeline layout.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StaticSampler {
    pub register: u32,
    pub space: u32,
    pub visibility: ShaderStages,
    pub descriptor: SamplerDescriptor,
}

#[derive(Copy, Clone, Debug)]
pub struct PipelineLayoutDescriptor<'a> {
    pub tables: &'a [RootTable],
    pub static_samplers: &'a [StaticSampler],
}

/// Compiled shader code in the format of a [`ShaderTarget`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderBytecode {
    SpirV(Vec<u32>),
    Dxil(Vec<u8>),
}

impl ShaderBytecode {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::SpirV(words) => bytemuck::cast_slice(words),
            Self::Dxil(bytes) => bytes,
        }
    }

    pub const fn target(&self) -> ShaderTarget {
        match self {
            Self::SpirV(_) => ShaderTarget::SpirV,
            Self::Dxil(_) => ShaderTarget::Dxil,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
    Unorm8x4,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Shader input location. D3D12 binds it to the semantic `LOC<location>`.
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    TriangleList,
    LineList,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrontFace {
    Cw,
    Ccw,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub format: TextureFormat,
    pub write_enabled: bool,
    pub compare_op: CompareOp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// Overwrite the destination.
    Replace,
    /// `src * src_alpha + dst * (1 - src_alpha)`
    Alpha,
    /// `src + dst * (1 - src_alpha)`
    PremultipliedAlpha,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColorTarget {
    pub format: TextureFormat,
    pub blend: BlendMode,
}

#[derive(Copy, Clone, Debug)]
pub struct ShaderEntry<'a, M> {
    pub module: &'a M,
    pub entry: &'a str,
}

pub struct GraphicsPipelineDescriptor<'a, A: Api> {
    pub label: &'a str,
    pub layout: &'a A::PipelineLayout,
    pub vertex: ShaderEntry<'a, A::ShaderModule>,
    pub fragment: ShaderEntry<'a, A::ShaderModule>,
    /// `None` for pipelines without vertex buffers.
    pub vertex_layout: Option<&'a VertexLayout>,
    pub topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub wireframe: bool,
    pub depth: Option<DepthState>,
    pub color_targets: &'a [ColorTarget],
}

pub enum DescriptorWrite<'a, A: Api> {
    UniformBuffer {
        buffer: &'a A::Buffer,
        offset: u64,
        size: u64,
    },
    StorageBuffer {
        buffer: &'a A::Buffer,
        offset: u64,
        size: u64,
    },
    SampledTexture(&'a A::TextureView),
    StorageTexture(&'a A::TextureView),
    Sampler(&'a A::Sampler),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LoadOp<T> {
    Clear(T),
    Load,
    DontCare,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    Discard,
}

pub struct ColorAttachment<'a, A: Api> {
    pub view: &'a A::TextureView,
    pub load_op: LoadOp<[f32; 4]>,
    pub store_op: StoreOp,
}

pub struct DepthAttachment<'a, A: Api> {
    pub view: &'a A::TextureView,
    pub load_op: LoadOp<f32>,
    pub store_op: StoreOp,
}

pub struct RenderPassDescriptor<'a, A: Api> {
    pub label: &'a str,
    pub extent: UVec2,
    pub color_attachments: &'a [ColorAttachment<'a, A>],
    pub depth_attachment: Option<DepthAttachment<'a, A>>,
}

pub struct TextureBarrier<'a, A: Api> {
    pub texture: &'a A::Texture,
    pub src: TextureLayout,
    pub dst: TextureLayout,
}

pub struct BufferBarrier<'a, A: Api> {
    pub buffer: &'a A::Buffer,
    pub src: BufferState,
    pub dst: BufferState,
}

/// Layout of one subresource inside a buffer used for buffer <-> texture copies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlacedFootprint {
    /// Byte offset of the subresource in the buffer.
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Bytes between the start of two rows.
    pub row_pitch: u64,
    /// Bytes of texel data in one row.
    pub row_size: u64,
    pub row_count: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subresource {
    pub mip_level: u32,
    pub array_layer: u32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn from_extent(extent: UVec2) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.x as f32,
            height: extent.y as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    pub fn from_extent(extent: UVec2) -> Self {
        Self {
            x: 0,
            y: 0,
            width: extent.x,
            height: extent.y,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub const fn size(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PresentMode {
    /// Wait for vertical blank. Always supported.
    Fifo,
    Mailbox,
    Immediate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub min_images: u32,
    /// `None` if there is no upper limit.
    pub max_images: Option<u32>,
    pub current_extent: Option<UVec2>,
    pub min_extent: UVec2,
    pub max_extent: UVec2,
    pub formats: Vec<TextureFormat>,
    pub present_modes: Vec<PresentMode>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SwapchainConfig {
    pub extent: UVec2,
    pub format: TextureFormat,
    pub image_count: u32,
    pub present_mode: PresentMode,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AcquiredImage {
    pub index: u32,
    /// The swapchain no longer matches the surface exactly but can still be used.
    pub suboptimal: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
}

/// A batch of recorded command encoders submitted to a queue.
pub struct Submission<'a, A: Api> {
    pub encoders: &'a [&'a A::CommandEncoder],
    /// Fence values that must be reached before the GPU starts executing.
    pub wait: &'a [(&'a A::Fence, u64)],
    /// Fence values signaled once all encoders completed.
    pub signal: &'a [(&'a A::Fence, u64)],
    /// Synchronize with the image acquired from this swapchain.
    pub swapchain: Option<&'a A::Swapchain>,
}

#[cfg(test)]
mod tests {
    use glam::UVec2;

    use super::{
        AdapterFeatures, BackendKind, DescriptorKind, RangeType, TextureDescriptor,
        TextureFormat, TextureUsage,
    };

    #[test]
    fn backend_kind_from_str() {
        assert_eq!("Vulkan".parse::<BackendKind>().unwrap(), BackendKind::Vulkan);
        assert_eq!("d3d12".parse::<BackendKind>().unwrap(), BackendKind::Dx12);
        assert_eq!("null".parse::<BackendKind>().unwrap(), BackendKind::Null);
        assert!("metal".parse::<BackendKind>().is_err());
    }

    #[test]
    fn required_features_exclude_wireframe() {
        assert!(!AdapterFeatures::REQUIRED.contains(AdapterFeatures::FILL_MODE_NON_SOLID));
        assert!(AdapterFeatures::REQUIRED.contains(AdapterFeatures::TIMELINE_FENCE));
    }

    #[test]
    fn descriptor_kind_range_types() {
        assert_eq!(DescriptorKind::UniformBuffer.range_type(), RangeType::Cbv);
        assert_eq!(DescriptorKind::SampledImage.range_type(), RangeType::Srv);
        assert_eq!(DescriptorKind::StorageImage.range_type(), RangeType::Uav);
        assert_eq!(DescriptorKind::Sampler.range_type(), RangeType::Sampler);
    }

    #[test]
    fn texture_mip_size_clamps_to_one() {
        let desc = TextureDescriptor {
            size: UVec2::new(16, 4),
            mip_levels: 5,
            array_layers: 2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLED,
        };

        assert_eq!(desc.subresource_count(), 10);
        assert_eq!(desc.mip_size(0), UVec2::new(16, 4));
        assert_eq!(desc.mip_size(2), UVec2::new(4, 1));
        assert_eq!(desc.mip_size(4), UVec2::new(1, 1));
    }
}
