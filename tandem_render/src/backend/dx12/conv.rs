use windows::Win32::Graphics::Direct3D::{
    D3D_PRIMITIVE_TOPOLOGY, D3D_PRIMITIVE_TOPOLOGY_LINELIST, D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::backend::{
    AddressMode, BlendMode, BufferState, CompareOp, CullMode, FilterMode, IndexFormat,
    PrimitiveTopology, RangeType, SamplerDescriptor, ShaderStages, TextureFormat, TextureLayout,
    TextureUsage, VertexFormat,
};

pub fn texture_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::R8Unorm => DXGI_FORMAT_R8_UNORM,
        TextureFormat::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        TextureFormat::Bgra8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
        TextureFormat::Rgba16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
        TextureFormat::Depth32Float => DXGI_FORMAT_D32_FLOAT,
    }
}

/// Format of the resource itself.
///
/// Sampled depth textures are typeless so that both depth and shader resource views
/// can be created.
pub fn resource_format(format: TextureFormat, usage: TextureUsage) -> DXGI_FORMAT {
    match format {
        TextureFormat::Depth32Float if usage.contains(TextureUsage::SAMPLED) => {
            DXGI_FORMAT_R32_TYPELESS
        }
        _ => texture_format(format),
    }
}

/// Format of shader resource and unordered access views.
pub fn view_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::Depth32Float => DXGI_FORMAT_R32_FLOAT,
        _ => texture_format(format),
    }
}

/// Flip model swapchains only accept the linear variant of sRGB formats. Render
/// target views of the buffers may still use the sRGB format.
pub fn swapchain_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::Rgba8UnormSrgb => DXGI_FORMAT_R8G8B8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => DXGI_FORMAT_B8G8R8A8_UNORM,
        _ => texture_format(format),
    }
}

pub fn resource_flags(usage: TextureUsage) -> D3D12_RESOURCE_FLAGS {
    let mut flags = D3D12_RESOURCE_FLAG_NONE;

    if usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
    }

    if usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;

        if !usage.contains(TextureUsage::SAMPLED) {
            flags |= D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE;
        }
    }

    if usage.contains(TextureUsage::STORAGE) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
    }

    flags
}

pub fn texture_state(layout: TextureLayout) -> D3D12_RESOURCE_STATES {
    match layout {
        TextureLayout::Undefined | TextureLayout::Common => D3D12_RESOURCE_STATE_COMMON,
        TextureLayout::CopyDst => D3D12_RESOURCE_STATE_COPY_DEST,
        TextureLayout::CopySrc => D3D12_RESOURCE_STATE_COPY_SOURCE,
        TextureLayout::ShaderRead => {
            D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE
                | D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE
        }
        TextureLayout::ColorAttachment => D3D12_RESOURCE_STATE_RENDER_TARGET,
        TextureLayout::DepthAttachment => D3D12_RESOURCE_STATE_DEPTH_WRITE,
        TextureLayout::Present => D3D12_RESOURCE_STATE_PRESENT,
    }
}

pub fn buffer_state(state: BufferState) -> D3D12_RESOURCE_STATES {
    match state {
        BufferState::Common => D3D12_RESOURCE_STATE_COMMON,
        BufferState::CopyDst => D3D12_RESOURCE_STATE_COPY_DEST,
        BufferState::CopySrc => D3D12_RESOURCE_STATE_COPY_SOURCE,
        BufferState::Vertex | BufferState::Uniform => {
            D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER
        }
        BufferState::Index => D3D12_RESOURCE_STATE_INDEX_BUFFER,
        BufferState::ShaderRead => {
            D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE
                | D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE
        }
        BufferState::ShaderWrite => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
    }
}

pub fn range_type(ty: RangeType) -> D3D12_DESCRIPTOR_RANGE_TYPE {
    match ty {
        RangeType::Cbv => D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
        RangeType::Srv => D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
        RangeType::Uav => D3D12_DESCRIPTOR_RANGE_TYPE_UAV,
        RangeType::Sampler => D3D12_DESCRIPTOR_RANGE_TYPE_SAMPLER,
    }
}

pub fn visibility(stages: ShaderStages) -> D3D12_SHADER_VISIBILITY {
    if stages == ShaderStages::VERTEX {
        D3D12_SHADER_VISIBILITY_VERTEX
    } else if stages == ShaderStages::FRAGMENT {
        D3D12_SHADER_VISIBILITY_PIXEL
    } else {
        D3D12_SHADER_VISIBILITY_ALL
    }
}

pub fn vertex_format(format: VertexFormat) -> DXGI_FORMAT {
    match format {
        VertexFormat::Float32x2 => DXGI_FORMAT_R32G32_FLOAT,
        VertexFormat::Float32x3 => DXGI_FORMAT_R32G32B32_FLOAT,
        VertexFormat::Float32x4 => DXGI_FORMAT_R32G32B32A32_FLOAT,
        VertexFormat::Unorm8x4 => DXGI_FORMAT_R8G8B8A8_UNORM,
    }
}

pub fn topology(topology: PrimitiveTopology) -> D3D_PRIMITIVE_TOPOLOGY {
    match topology {
        PrimitiveTopology::TriangleList => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
        PrimitiveTopology::LineList => D3D_PRIMITIVE_TOPOLOGY_LINELIST,
    }
}

pub fn topology_type(topology: PrimitiveTopology) -> D3D12_PRIMITIVE_TOPOLOGY_TYPE {
    match topology {
        PrimitiveTopology::TriangleList => D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
        PrimitiveTopology::LineList => D3D12_PRIMITIVE_TOPOLOGY_TYPE_LINE,
    }
}

pub fn cull_mode(mode: CullMode) -> D3D12_CULL_MODE {
    match mode {
        CullMode::None => D3D12_CULL_MODE_NONE,
        CullMode::Front => D3D12_CULL_MODE_FRONT,
        CullMode::Back => D3D12_CULL_MODE_BACK,
    }
}

pub fn compare_op(op: CompareOp) -> D3D12_COMPARISON_FUNC {
    match op {
        CompareOp::Never => D3D12_COMPARISON_FUNC_NEVER,
        CompareOp::Less => D3D12_COMPARISON_FUNC_LESS,
        CompareOp::Equal => D3D12_COMPARISON_FUNC_EQUAL,
        CompareOp::LessEqual => D3D12_COMPARISON_FUNC_LESS_EQUAL,
        CompareOp::Greater => D3D12_COMPARISON_FUNC_GREATER,
        CompareOp::NotEqual => D3D12_COMPARISON_FUNC_NOT_EQUAL,
        CompareOp::GreaterEqual => D3D12_COMPARISON_FUNC_GREATER_EQUAL,
        CompareOp::Always => D3D12_COMPARISON_FUNC_ALWAYS,
    }
}

pub fn blend(mode: BlendMode) -> D3D12_RENDER_TARGET_BLEND_DESC {
    let (enable, src) = match mode {
        BlendMode::Replace => (false, D3D12_BLEND_ONE),
        BlendMode::Alpha => (true, D3D12_BLEND_SRC_ALPHA),
        BlendMode::PremultipliedAlpha => (true, D3D12_BLEND_ONE),
    };

    D3D12_RENDER_TARGET_BLEND_DESC {
        BlendEnable: enable.into(),
        LogicOpEnable: false.into(),
        SrcBlend: src,
        DestBlend: if enable {
            D3D12_BLEND_INV_SRC_ALPHA
        } else {
            D3D12_BLEND_ZERO
        },
        BlendOp: D3D12_BLEND_OP_ADD,
        SrcBlendAlpha: D3D12_BLEND_ONE,
        DestBlendAlpha: if enable {
            D3D12_BLEND_INV_SRC_ALPHA
        } else {
            D3D12_BLEND_ZERO
        },
        BlendOpAlpha: D3D12_BLEND_OP_ADD,
        LogicOp: D3D12_LOGIC_OP_NOOP,
        RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
    }
}

pub fn sampler(desc: &SamplerDescriptor, max_anisotropy: f32) -> D3D12_SAMPLER_DESC {
    let anisotropy = desc.max_anisotropy.clamp(1.0, max_anisotropy);

    D3D12_SAMPLER_DESC {
        Filter: filter(desc, anisotropy > 1.0),
        AddressU: address_mode(desc.address_mode_u),
        AddressV: address_mode(desc.address_mode_v),
        AddressW: address_mode(desc.address_mode_w),
        MipLODBias: 0.0,
        MaxAnisotropy: anisotropy as u32,
        ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
        BorderColor: [0.0; 4],
        MinLOD: 0.0,
        MaxLOD: D3D12_FLOAT32_MAX,
    }
}

pub fn static_sampler(
    desc: &SamplerDescriptor,
    max_anisotropy: f32,
    register: u32,
    space: u32,
    stages: ShaderStages,
) -> D3D12_STATIC_SAMPLER_DESC {
    let sampler = sampler(desc, max_anisotropy);

    D3D12_STATIC_SAMPLER_DESC {
        Filter: sampler.Filter,
        AddressU: sampler.AddressU,
        AddressV: sampler.AddressV,
        AddressW: sampler.AddressW,
        MipLODBias: sampler.MipLODBias,
        MaxAnisotropy: sampler.MaxAnisotropy,
        ComparisonFunc: sampler.ComparisonFunc,
        BorderColor: D3D12_STATIC_BORDER_COLOR_TRANSPARENT_BLACK,
        MinLOD: sampler.MinLOD,
        MaxLOD: sampler.MaxLOD,
        ShaderRegister: register,
        RegisterSpace: space,
        ShaderVisibility: visibility(stages),
    }
}

fn filter(desc: &SamplerDescriptor, anisotropic: bool) -> D3D12_FILTER {
    if anisotropic {
        return D3D12_FILTER_ANISOTROPIC;
    }

    // `D3D12_ENCODE_BASIC_FILTER`: mip at bit 0, mag at bit 2, min at bit 4.
    let bit = |mode: FilterMode| match mode {
        FilterMode::Nearest => 0,
        FilterMode::Linear => 1,
    };

    D3D12_FILTER(bit(desc.mipmap_filter) | bit(desc.mag_filter) << 2 | bit(desc.min_filter) << 4)
}

fn address_mode(mode: AddressMode) -> D3D12_TEXTURE_ADDRESS_MODE {
    match mode {
        AddressMode::Repeat => D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressMode::MirrorRepeat => D3D12_TEXTURE_ADDRESS_MODE_MIRROR,
        AddressMode::ClampToEdge => D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressMode::ClampToBorder => D3D12_TEXTURE_ADDRESS_MODE_BORDER,
    }
}

pub fn index_format(format: IndexFormat) -> DXGI_FORMAT {
    match format {
        IndexFormat::U16 => DXGI_FORMAT_R16_UINT,
        IndexFormat::U32 => DXGI_FORMAT_R32_UINT,
    }
}

#[cfg(test)]
mod tests {
    use windows::Win32::Graphics::Direct3D12::*;
    use windows::Win32::Graphics::Dxgi::Common::*;

    use crate::backend::{SamplerDescriptor, TextureFormat, TextureUsage};

    use super::{resource_format, sampler, swapchain_format, view_format};

    #[test]
    fn sampled_depth_is_typeless() {
        let usage = TextureUsage::DEPTH_STENCIL | TextureUsage::SAMPLED;
        assert_eq!(
            resource_format(TextureFormat::Depth32Float, usage),
            DXGI_FORMAT_R32_TYPELESS
        );
        assert_eq!(
            resource_format(TextureFormat::Depth32Float, TextureUsage::DEPTH_STENCIL),
            DXGI_FORMAT_D32_FLOAT
        );
        assert_eq!(view_format(TextureFormat::Depth32Float), DXGI_FORMAT_R32_FLOAT);
    }

    #[test]
    fn swapchain_buffers_are_linear() {
        assert_eq!(
            swapchain_format(TextureFormat::Bgra8UnormSrgb),
            DXGI_FORMAT_B8G8R8A8_UNORM
        );
        assert_eq!(
            swapchain_format(TextureFormat::Rgba8Unorm),
            DXGI_FORMAT_R8G8B8A8_UNORM
        );
    }

    #[test]
    fn sampler_filter_encoding() {
        let linear = sampler(&SamplerDescriptor::LINEAR_CLAMP, 16.0);
        assert_eq!(linear.Filter, D3D12_FILTER_MIN_MAG_MIP_LINEAR);

        let mut desc = SamplerDescriptor::LINEAR_REPEAT;
        desc.max_anisotropy = 8.0;
        let aniso = sampler(&desc, 4.0);
        assert_eq!(aniso.Filter, D3D12_FILTER_ANISOTROPIC);
        assert_eq!(aniso.MaxAnisotropy, 4);
    }
}
