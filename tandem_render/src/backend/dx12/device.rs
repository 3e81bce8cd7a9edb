use std::ffi::c_void;
use std::fmt::{self, Debug, Formatter};
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::AtomicI32;
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_tracing::trace_span;
use windows::core::s;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D::{
    ID3DBlob, D3D_PRIMITIVE_TOPOLOGY, D3D_ROOT_SIGNATURE_VERSION_1,
};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

use crate::backend::allocator::{BuddyAllocator, Region};
use crate::backend::traits::color_targets_valid;
use crate::backend::{
    AdapterFeatures, AdapterInfo, BufferDescriptor, BufferResource, BufferUsage, DescriptorKind,
    DescriptorWrite, DeviceDescriptor, DeviceLimits, FrontFace, GraphicsPipelineDescriptor,
    MemoryLocation, PipelineLayoutDescriptor, QueueKind, SamplerDescriptor, ShaderBytecode,
    TextureDescriptor, TextureFormat, TextureUsage, TextureViewDescriptor,
};
use crate::error::Error;

use super::command::Dx12CommandPool;
use super::{borrow_interface, check_device, conv, Dx12};

const RTV_CAPACITY: u32 = 1024;
const DSV_CAPACITY: u32 = 256;

/// Upper limit of shader-visible sampler descriptors.
const MAX_SAMPLER_DESCRIPTORS: u32 = 2048;

/// A shader-visible descriptor heap sub-allocated into [`Dx12DescriptorHeap`]s.
pub(super) struct ShaderVisibleHeap {
    pub(super) raw: ID3D12DescriptorHeap,
    cpu_start: usize,
    gpu_start: u64,
    stride: u32,
    allocator: Mutex<BuddyAllocator>,
}

impl ShaderVisibleHeap {
    fn new(
        device: &ID3D12Device,
        ty: D3D12_DESCRIPTOR_HEAP_TYPE,
        capacity: u32,
    ) -> Result<Self, Error> {
        let capacity = capacity.max(1).next_power_of_two();

        let desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: ty,
            NumDescriptors: capacity,
            Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
            NodeMask: 0,
        };

        let raw: ID3D12DescriptorHeap = unsafe { device.CreateDescriptorHeap(&desc)? };
        let cpu_start = unsafe { raw.GetCPUDescriptorHandleForHeapStart() }.ptr;
        let gpu_start = unsafe { raw.GetGPUDescriptorHandleForHeapStart() }.ptr;
        let stride = unsafe { device.GetDescriptorHandleIncrementSize(ty) };

        Ok(Self {
            raw,
            cpu_start,
            gpu_start,
            stride,
            allocator: Mutex::new(BuddyAllocator::new(u64::from(capacity))),
        })
    }
}

/// A CPU-only heap of render target or depth stencil views.
struct CpuHeap {
    raw: ID3D12DescriptorHeap,
    start: usize,
    stride: u32,
    free: Mutex<Vec<u32>>,
}

impl CpuHeap {
    fn new(
        device: &ID3D12Device,
        ty: D3D12_DESCRIPTOR_HEAP_TYPE,
        capacity: u32,
    ) -> Result<Self, Error> {
        let desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: ty,
            NumDescriptors: capacity,
            Flags: D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
            NodeMask: 0,
        };

        let raw: ID3D12DescriptorHeap = unsafe { device.CreateDescriptorHeap(&desc)? };
        let start = unsafe { raw.GetCPUDescriptorHandleForHeapStart() }.ptr;
        let stride = unsafe { device.GetDescriptorHandleIncrementSize(ty) };

        Ok(Self {
            raw,
            start,
            stride,
            free: Mutex::new((0..capacity).rev().collect()),
        })
    }

    fn alloc(&self) -> Result<u32, Error> {
        self.free
            .lock()
            .pop()
            .ok_or(Error::OutOfCapacity("render target views"))
    }

    fn free(&self, index: u32) {
        self.free.lock().push(index);
    }

    fn handle(&self, index: u32) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: self.start + index as usize * self.stride as usize,
        }
    }
}

pub(crate) struct DeviceShared {
    pub(super) raw: ID3D12Device,
    features: AdapterFeatures,
    pub(super) resource_heap: ShaderVisibleHeap,
    pub(super) sampler_heap: ShaderVisibleHeap,
    rtv_heap: CpuHeap,
    dsv_heap: CpuHeap,
    queues: [ID3D12CommandQueue; 2],
    idle_fence: Dx12Fence,
    idle_value: Mutex<u64>,
}

impl DeviceShared {
    pub(super) fn rtv(&self, index: u32) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        self.rtv_heap.handle(index)
    }

    pub(super) fn dsv(&self, index: u32) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        self.dsv_heap.handle(index)
    }
}

impl Debug for DeviceShared {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceShared")
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Dx12Device {
    shared: Arc<DeviceShared>,
}

impl Dx12Device {
    pub(super) fn new(
        raw: ID3D12Device,
        info: &AdapterInfo,
        features: AdapterFeatures,
        desc: &DeviceDescriptor,
        queues: [ID3D12CommandQueue; 2],
    ) -> Result<Self, Error> {
        let resource_heap = ShaderVisibleHeap::new(
            &raw,
            D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
            desc.resource_descriptors,
        )?;
        let sampler_heap = ShaderVisibleHeap::new(
            &raw,
            D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
            desc.sampler_descriptors.min(MAX_SAMPLER_DESCRIPTORS),
        )?;
        let rtv_heap = CpuHeap::new(&raw, D3D12_DESCRIPTOR_HEAP_TYPE_RTV, RTV_CAPACITY)?;
        let dsv_heap = CpuHeap::new(&raw, D3D12_DESCRIPTOR_HEAP_TYPE_DSV, DSV_CAPACITY)?;
        let idle_fence = create_fence(&raw, 0)?;

        tracing::debug!(
            "created descriptor heaps for {} ({} resource, {} sampler descriptors)",
            info.name,
            desc.resource_descriptors,
            desc.sampler_descriptors,
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                raw,
                features,
                resource_heap,
                sampler_heap,
                rtv_heap,
                dsv_heap,
                queues,
                idle_fence,
                idle_value: Mutex::new(0),
            }),
        })
    }
}

impl crate::backend::Device<Dx12> for Dx12Device {
    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            row_pitch_alignment: u64::from(D3D12_TEXTURE_DATA_PITCH_ALIGNMENT),
            placement_alignment: u64::from(D3D12_TEXTURE_DATA_PLACEMENT_ALIGNMENT),
            uniform_buffer_alignment: u64::from(D3D12_CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT),
            max_sampler_anisotropy: D3D12_MAX_MAXANISOTROPY as f32,
            max_texture_dimension: D3D12_REQ_TEXTURE2D_U_OR_V_DIMENSION,
        }
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<Dx12Buffer, Error> {
        let _span = trace_span!("Dx12Device::create_buffer").entered();

        if desc.size == 0 {
            return Err(Error::Backend(format!(
                "invalid buffer descriptor {:?}",
                desc
            )));
        }

        let heap = BufferHeap::new(desc);

        // Constant buffer views cover multiples of 256 bytes.
        let width = if desc.usage.contains(BufferUsage::UNIFORM) {
            desc.size
                .next_multiple_of(u64::from(D3D12_CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT))
        } else {
            desc.size
        };

        let flags = if heap == BufferHeap::Default && desc.usage.contains(BufferUsage::STORAGE) {
            D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
        } else {
            D3D12_RESOURCE_FLAG_NONE
        };

        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: width,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: flags,
        };

        let raw = create_committed(&self.shared.raw, heap.ty(), &resource_desc, heap.state())?;

        let ptr = match heap {
            BufferHeap::Default => None,
            BufferHeap::Upload | BufferHeap::Readback => {
                let mut ptr: *mut c_void = std::ptr::null_mut();
                unsafe { raw.Map(0, None, Some(&mut ptr))? };
                NonNull::new(ptr.cast::<u8>())
            }
        };

        let gpu_address = unsafe { raw.GetGPUVirtualAddress() };

        Ok(Dx12Buffer {
            raw,
            size: desc.size,
            gpu_address,
            ptr,
            host_visible: heap != BufferHeap::Default,
        })
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<Dx12Texture, Error> {
        let _span = trace_span!("Dx12Device::create_texture").entered();

        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Alignment: 0,
            Width: u64::from(desc.size.x),
            Height: desc.size.y,
            DepthOrArraySize: desc.array_layers as u16,
            MipLevels: desc.mip_levels as u16,
            Format: conv::resource_format(desc.format, desc.usage),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: conv::resource_flags(desc.usage),
        };

        let raw = create_committed(
            &self.shared.raw,
            D3D12_HEAP_TYPE_DEFAULT,
            &resource_desc,
            D3D12_RESOURCE_STATE_COMMON,
        )?;

        Ok(Dx12Texture::new(raw, *desc))
    }

    fn create_texture_view(
        &self,
        texture: &Dx12Texture,
        desc: &TextureViewDescriptor,
    ) -> Result<Dx12TextureView, Error> {
        let mut view = Dx12TextureView {
            resource: texture.raw.clone(),
            format: texture.desc.format,
            desc: *desc,
            rtv: None,
            dsv: None,
            shared: self.shared.clone(),
        };

        let array = desc.array_layers > 1;

        if texture.desc.usage.contains(TextureUsage::RENDER_TARGET) {
            let mut rtv = D3D12_RENDER_TARGET_VIEW_DESC {
                Format: conv::texture_format(texture.desc.format),
                ..Default::default()
            };
            if array {
                rtv.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE2DARRAY;
                rtv.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_RTV {
                    MipSlice: desc.base_mip_level,
                    FirstArraySlice: desc.base_array_layer,
                    ArraySize: desc.array_layers,
                    PlaneSlice: 0,
                };
            } else {
                rtv.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE2D;
                rtv.Anonymous.Texture2D = D3D12_TEX2D_RTV {
                    MipSlice: desc.base_mip_level,
                    PlaneSlice: 0,
                };
            }

            let index = self.shared.rtv_heap.alloc()?;
            view.rtv = Some(index);
            unsafe {
                self.shared.raw.CreateRenderTargetView(
                    &texture.raw,
                    Some(&rtv),
                    self.shared.rtv_heap.handle(index),
                );
            }
        }

        if texture.desc.usage.contains(TextureUsage::DEPTH_STENCIL) {
            let mut dsv = D3D12_DEPTH_STENCIL_VIEW_DESC {
                Format: conv::texture_format(texture.desc.format),
                Flags: D3D12_DSV_FLAG_NONE,
                ..Default::default()
            };
            if array {
                dsv.ViewDimension = D3D12_DSV_DIMENSION_TEXTURE2DARRAY;
                dsv.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_DSV {
                    MipSlice: desc.base_mip_level,
                    FirstArraySlice: desc.base_array_layer,
                    ArraySize: desc.array_layers,
                };
            } else {
                dsv.ViewDimension = D3D12_DSV_DIMENSION_TEXTURE2D;
                dsv.Anonymous.Texture2D = D3D12_TEX2D_DSV {
                    MipSlice: desc.base_mip_level,
                };
            }

            let index = self.shared.dsv_heap.alloc()?;
            view.dsv = Some(index);
            unsafe {
                self.shared.raw.CreateDepthStencilView(
                    &texture.raw,
                    Some(&dsv),
                    self.shared.dsv_heap.handle(index),
                );
            }
        }

        Ok(view)
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> Result<Dx12Sampler, Error> {
        let mut max_anisotropy = D3D12_MAX_MAXANISOTROPY as f32;
        if !self.shared.features.contains(AdapterFeatures::SAMPLER_ANISOTROPY) {
            max_anisotropy = 1.0;
        }

        Ok(Dx12Sampler {
            desc: conv::sampler(desc, max_anisotropy),
        })
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorKind,
        capacity: u32,
    ) -> Result<Dx12DescriptorHeap, Error> {
        let _span = trace_span!("Dx12Device::create_descriptor_heap").entered();

        let sampler = kind == DescriptorKind::Sampler;
        let heap = if sampler {
            &self.shared.sampler_heap
        } else {
            &self.shared.resource_heap
        };

        let region = heap
            .allocator
            .lock()
            .alloc(u64::from(capacity), 1)
            .ok_or(Error::OutOfCapacity("shader visible descriptors"))?;

        let offset = region.offset * u64::from(heap.stride);

        Ok(Dx12DescriptorHeap {
            kind,
            capacity,
            sampler,
            region,
            cpu_base: heap.cpu_start as u64 + offset,
            gpu_base: heap.gpu_start + offset,
            stride: u64::from(heap.stride),
            shared: self.shared.clone(),
        })
    }

    unsafe fn write_descriptor(
        &self,
        heap: &Dx12DescriptorHeap,
        slot: u32,
        write: &DescriptorWrite<'_, Dx12>,
    ) {
        let handle = D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: (heap.cpu_base + u64::from(slot) * heap.stride) as usize,
        };

        let device = &self.shared.raw;

        // SAFETY: The caller guarantees that the slot is in bounds and not in use.
        unsafe {
            match write {
                DescriptorWrite::UniformBuffer {
                    buffer,
                    offset,
                    size,
                } => {
                    let desc = D3D12_CONSTANT_BUFFER_VIEW_DESC {
                        BufferLocation: buffer.gpu_address + offset,
                        SizeInBytes: size.next_multiple_of(u64::from(
                            D3D12_CONSTANT_BUFFER_DATA_PLACEMENT_ALIGNMENT,
                        )) as u32,
                    };
                    device.CreateConstantBufferView(Some(&desc), handle);
                }
                DescriptorWrite::StorageBuffer {
                    buffer,
                    offset,
                    size,
                } => {
                    // Storage buffers are raw buffers addressed in 4 byte words.
                    let mut desc = D3D12_UNORDERED_ACCESS_VIEW_DESC {
                        Format: DXGI_FORMAT_R32_TYPELESS,
                        ViewDimension: D3D12_UAV_DIMENSION_BUFFER,
                        ..Default::default()
                    };
                    desc.Anonymous.Buffer = D3D12_BUFFER_UAV {
                        FirstElement: offset / 4,
                        NumElements: (size / 4) as u32,
                        StructureByteStride: 0,
                        CounterOffsetInBytes: 0,
                        Flags: D3D12_BUFFER_UAV_FLAG_RAW,
                    };
                    device.CreateUnorderedAccessView(
                        &buffer.raw,
                        None::<&ID3D12Resource>,
                        Some(&desc),
                        handle,
                    );
                }
                DescriptorWrite::SampledTexture(view) => {
                    device.CreateShaderResourceView(&view.resource, Some(&view.srv_desc()), handle);
                }
                DescriptorWrite::StorageTexture(view) => {
                    device.CreateUnorderedAccessView(
                        &view.resource,
                        None::<&ID3D12Resource>,
                        Some(&view.uav_desc()),
                        handle,
                    );
                }
                DescriptorWrite::Sampler(sampler) => {
                    device.CreateSampler(&sampler.desc, handle);
                }
            }
        }
    }

    fn create_shader_module(&self, code: &ShaderBytecode) -> Result<Dx12ShaderModule, Error> {
        match code {
            ShaderBytecode::Dxil(bytes) if !bytes.is_empty() => Ok(Dx12ShaderModule {
                code: bytes.clone(),
            }),
            ShaderBytecode::Dxil(_) => Err(Error::Backend("empty shader bytecode".to_owned())),
            ShaderBytecode::SpirV(_) => Err(Error::Backend(
                "d3d12 shader modules require DXIL bytecode".to_owned(),
            )),
        }
    }

    fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDescriptor<'_>,
    ) -> Result<Dx12PipelineLayout, Error> {
        let _span = trace_span!("Dx12Device::create_pipeline_layout").entered();

        // `OFFSET_APPEND` has the same value as `D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND`.
        let ranges: Vec<_> = desc
            .tables
            .iter()
            .map(|table| D3D12_DESCRIPTOR_RANGE {
                RangeType: conv::range_type(table.range.ty),
                NumDescriptors: table.range.count,
                BaseShaderRegister: table.range.register,
                RegisterSpace: table.range.space,
                OffsetInDescriptorsFromTableStart: table.range.offset,
            })
            .collect();

        // `ranges` must not be modified while `parameters` points into it.
        let parameters: Vec<_> = desc
            .tables
            .iter()
            .zip(&ranges)
            .map(|(table, range)| D3D12_ROOT_PARAMETER {
                ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
                Anonymous: D3D12_ROOT_PARAMETER_0 {
                    DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                        NumDescriptorRanges: 1,
                        pDescriptorRanges: range,
                    },
                },
                ShaderVisibility: conv::visibility(table.visibility),
            })
            .collect();

        let max_anisotropy = D3D12_MAX_MAXANISOTROPY as f32;
        let static_samplers: Vec<_> = desc
            .static_samplers
            .iter()
            .map(|sampler| {
                conv::static_sampler(
                    &sampler.descriptor,
                    max_anisotropy,
                    sampler.register,
                    sampler.space,
                    sampler.visibility,
                )
            })
            .collect();

        let root_desc = D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: parameters.as_ptr(),
            NumStaticSamplers: static_samplers.len() as u32,
            pStaticSamplers: static_samplers.as_ptr(),
            Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
        };

        let mut blob: Option<ID3DBlob> = None;
        let mut error: Option<ID3DBlob> = None;
        let res = unsafe {
            D3D12SerializeRootSignature(
                &root_desc,
                D3D_ROOT_SIGNATURE_VERSION_1,
                &mut blob,
                Some(&mut error),
            )
        };

        if let Err(err) = res {
            let msg = error
                .as_ref()
                .map(|blob| String::from_utf8_lossy(blob_bytes(blob)).into_owned())
                .unwrap_or_else(|| err.to_string());
            return Err(Error::PipelineCreate(format!(
                "invalid root signature: {}",
                msg.trim_end_matches('\0')
            )));
        }

        let blob = blob
            .ok_or_else(|| Error::PipelineCreate("root signature serialized to nothing".to_owned()))?;
        let raw: ID3D12RootSignature =
            unsafe { self.shared.raw.CreateRootSignature(0, blob_bytes(&blob))? };

        Ok(Dx12PipelineLayout { raw })
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor<'_, Dx12>,
        cached_blob: Option<&[u8]>,
    ) -> Result<Dx12Pipeline, Error> {
        let _span = trace_span!("Dx12Device::create_graphics_pipeline").entered();

        if !color_targets_valid(desc.color_targets) {
            return Err(Error::PipelineCreate(format!(
                "{}: depth format used as color target",
                desc.label
            )));
        }

        if desc.color_targets.len() > D3D12_SIMULTANEOUS_RENDER_TARGET_COUNT as usize {
            return Err(Error::PipelineCreate(format!(
                "{}: too many color targets",
                desc.label
            )));
        }

        let input_elements: Vec<_> = desc
            .vertex_layout
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|attribute| D3D12_INPUT_ELEMENT_DESC {
                        SemanticName: s!("LOC"),
                        SemanticIndex: attribute.location,
                        Format: conv::vertex_format(attribute.format),
                        InputSlot: 0,
                        AlignedByteOffset: attribute.offset,
                        InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
                        InstanceDataStepRate: 0,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut blend = D3D12_BLEND_DESC {
            AlphaToCoverageEnable: false.into(),
            IndependentBlendEnable: true.into(),
            RenderTarget: Default::default(),
        };
        let mut rtv_formats = [DXGI_FORMAT_UNKNOWN; 8];
        for (index, target) in desc.color_targets.iter().enumerate() {
            blend.RenderTarget[index] = conv::blend(target.blend);
            rtv_formats[index] = conv::texture_format(target.format);
        }

        let depth_stencil = match desc.depth {
            Some(depth) => D3D12_DEPTH_STENCIL_DESC {
                DepthEnable: true.into(),
                DepthWriteMask: if depth.write_enabled {
                    D3D12_DEPTH_WRITE_MASK_ALL
                } else {
                    D3D12_DEPTH_WRITE_MASK_ZERO
                },
                DepthFunc: conv::compare_op(depth.compare_op),
                StencilEnable: false.into(),
                ..Default::default()
            },
            None => D3D12_DEPTH_STENCIL_DESC {
                DepthEnable: false.into(),
                StencilEnable: false.into(),
                ..Default::default()
            },
        };

        let rasterizer = D3D12_RASTERIZER_DESC {
            FillMode: if desc.wireframe {
                D3D12_FILL_MODE_WIREFRAME
            } else {
                D3D12_FILL_MODE_SOLID
            },
            CullMode: conv::cull_mode(desc.cull_mode),
            FrontCounterClockwise: (desc.front_face == FrontFace::Ccw).into(),
            DepthBias: 0,
            DepthBiasClamp: 0.0,
            SlopeScaledDepthBias: 0.0,
            DepthClipEnable: true.into(),
            MultisampleEnable: false.into(),
            AntialiasedLineEnable: false.into(),
            ForcedSampleCount: 0,
            ConservativeRaster: D3D12_CONSERVATIVE_RASTERIZATION_MODE_OFF,
        };

        let cached_pso = match cached_blob {
            Some(blob) => D3D12_CACHED_PIPELINE_STATE {
                pCachedBlob: blob.as_ptr().cast(),
                CachedBlobSizeInBytes: blob.len(),
            },
            None => D3D12_CACHED_PIPELINE_STATE::default(),
        };

        let pso_desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
            // SAFETY: The layout outlives the call.
            pRootSignature: unsafe { borrow_interface(&desc.layout.raw) },
            VS: bytecode(&desc.vertex.module.code),
            PS: bytecode(&desc.fragment.module.code),
            BlendState: blend,
            SampleMask: u32::MAX,
            RasterizerState: rasterizer,
            DepthStencilState: depth_stencil,
            InputLayout: D3D12_INPUT_LAYOUT_DESC {
                pInputElementDescs: input_elements.as_ptr(),
                NumElements: input_elements.len() as u32,
            },
            PrimitiveTopologyType: conv::topology_type(desc.topology),
            NumRenderTargets: desc.color_targets.len() as u32,
            RTVFormats: rtv_formats,
            DSVFormat: desc
                .depth
                .map(|depth| conv::texture_format(depth.format))
                .unwrap_or(DXGI_FORMAT_UNKNOWN),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            CachedPSO: cached_pso,
            Flags: D3D12_PIPELINE_STATE_FLAG_NONE,
            ..Default::default()
        };

        let res = unsafe {
            self.shared
                .raw
                .CreateGraphicsPipelineState::<ID3D12PipelineState>(&pso_desc)
        };

        let raw = match res {
            Ok(raw) => raw,
            // Blobs from another adapter or driver are rejected with
            // `D3D12_ERROR_ADAPTER_NOT_FOUND`, `D3D12_ERROR_DRIVER_VERSION_MISMATCH`
            // or `E_INVALIDARG`.
            Err(err) if cached_blob.is_some() => {
                return Err(Error::PipelineCreate(format!(
                    "{}: cached blob rejected: {}",
                    desc.label, err
                )));
            }
            Err(err) => match Error::from(err) {
                Error::Backend(msg) => {
                    return Err(Error::PipelineCreate(format!("{}: {}", desc.label, msg)))
                }
                err => return Err(err),
            },
        };

        Ok(Dx12Pipeline {
            raw,
            topology: conv::topology(desc.topology),
        })
    }

    fn pipeline_cache_blob(&self, pipeline: &Dx12Pipeline) -> Result<Vec<u8>, Error> {
        let blob = unsafe { pipeline.raw.GetCachedBlob()? };
        Ok(blob_bytes(&blob).to_vec())
    }

    fn create_command_pool(&self, queue: QueueKind) -> Result<Dx12CommandPool, Error> {
        Dx12CommandPool::new(self.shared.clone(), queue)
    }

    fn create_fence(&self, initial_value: u64) -> Result<Dx12Fence, Error> {
        create_fence(&self.shared.raw, initial_value)
    }

    fn fence_value(&self, fence: &Dx12Fence) -> Result<u64, Error> {
        let value = unsafe { fence.raw.GetCompletedValue() };

        // Fences of a removed device report `u64::MAX`.
        if value == u64::MAX {
            check_device(&self.shared.raw)?;
        }

        Ok(value)
    }

    fn wait_fence(&self, fence: &Dx12Fence, value: u64) -> Result<(), Error> {
        let _span = trace_span!("Dx12Device::wait_fence").entered();

        if self.fence_value(fence)? >= value {
            return Ok(());
        }

        let event = fence.event.lock();
        unsafe { fence.raw.SetEventOnCompletion(value, *event)? };

        // Fences of a removed device complete with `u64::MAX`, which wakes the wait.
        if unsafe { WaitForSingleObject(*event, INFINITE) } != WAIT_OBJECT_0 {
            return Err(windows::core::Error::from_win32().into());
        }

        self.fence_value(fence).map(|_| ())
    }

    fn wait_idle(&self) -> Result<(), Error> {
        let mut idle_value = self.shared.idle_value.lock();

        for queue in &self.shared.queues {
            *idle_value += 1;
            unsafe { queue.Signal(&self.shared.idle_fence.raw, *idle_value)? };
        }

        self.wait_fence(&self.shared.idle_fence, *idle_value)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BufferHeap {
    Default,
    Upload,
    /// Host-visible buffers only written by copies.
    Readback,
}

impl BufferHeap {
    fn new(desc: &BufferDescriptor) -> Self {
        match desc.location {
            MemoryLocation::DeviceLocal => Self::Default,
            MemoryLocation::HostVisible
                if desc.usage.contains(BufferUsage::TRANSFER_DST)
                    && !desc.usage.contains(BufferUsage::TRANSFER_SRC) =>
            {
                Self::Readback
            }
            MemoryLocation::HostVisible => Self::Upload,
        }
    }

    fn ty(self) -> D3D12_HEAP_TYPE {
        match self {
            Self::Default => D3D12_HEAP_TYPE_DEFAULT,
            Self::Upload => D3D12_HEAP_TYPE_UPLOAD,
            Self::Readback => D3D12_HEAP_TYPE_READBACK,
        }
    }

    /// Initial state. Buffers in upload and readback heaps never leave it.
    fn state(self) -> D3D12_RESOURCE_STATES {
        match self {
            Self::Default => D3D12_RESOURCE_STATE_COMMON,
            Self::Upload => D3D12_RESOURCE_STATE_GENERIC_READ,
            Self::Readback => D3D12_RESOURCE_STATE_COPY_DEST,
        }
    }
}

fn create_committed(
    device: &ID3D12Device,
    heap: D3D12_HEAP_TYPE,
    desc: &D3D12_RESOURCE_DESC,
    state: D3D12_RESOURCE_STATES,
) -> Result<ID3D12Resource, Error> {
    let heap_properties = D3D12_HEAP_PROPERTIES {
        Type: heap,
        CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
        MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
        CreationNodeMask: 1,
        VisibleNodeMask: 1,
    };

    let mut resource: Option<ID3D12Resource> = None;
    unsafe {
        device.CreateCommittedResource(
            &heap_properties,
            D3D12_HEAP_FLAG_NONE,
            desc,
            state,
            None,
            &mut resource,
        )?;
    }

    resource.ok_or_else(|| Error::Backend("driver returned no resource".to_owned()))
}

fn create_fence(device: &ID3D12Device, initial_value: u64) -> Result<Dx12Fence, Error> {
    let raw: ID3D12Fence = unsafe { device.CreateFence(initial_value, D3D12_FENCE_FLAG_NONE)? };
    let event = unsafe { CreateEventW(None, false, false, None)? };

    Ok(Dx12Fence {
        raw,
        event: Mutex::new(event),
    })
}

fn bytecode(code: &[u8]) -> D3D12_SHADER_BYTECODE {
    D3D12_SHADER_BYTECODE {
        pShaderBytecode: code.as_ptr().cast(),
        BytecodeLength: code.len(),
    }
}

fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe { slice::from_raw_parts(blob.GetBufferPointer().cast::<u8>(), blob.GetBufferSize()) }
}

#[derive(Debug)]
pub struct Dx12Buffer {
    pub(super) raw: ID3D12Resource,
    size: u64,
    pub(super) gpu_address: u64,
    ptr: Option<NonNull<u8>>,
    /// Upload and readback buffers stay in their initial state.
    pub(super) host_visible: bool,
}

// The mapping is owned by the resource and valid from any thread.
unsafe impl Send for Dx12Buffer {}
unsafe impl Sync for Dx12Buffer {}

impl BufferResource for Dx12Buffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.ptr
    }
}

#[derive(Debug)]
pub struct Dx12Texture {
    pub(super) raw: ID3D12Resource,
    pub(super) desc: TextureDescriptor,
    /// Resource state after all recorded barriers.
    pub(super) state: Arc<AtomicI32>,
}

impl Dx12Texture {
    pub(super) fn new(raw: ID3D12Resource, desc: TextureDescriptor) -> Self {
        Self {
            raw,
            desc,
            state: Arc::new(AtomicI32::new(D3D12_RESOURCE_STATE_COMMON.0)),
        }
    }
}

#[derive(Debug)]
pub struct Dx12TextureView {
    pub(super) resource: ID3D12Resource,
    format: TextureFormat,
    desc: TextureViewDescriptor,
    pub(super) rtv: Option<u32>,
    pub(super) dsv: Option<u32>,
    shared: Arc<DeviceShared>,
}

impl Dx12TextureView {
    fn srv_desc(&self) -> D3D12_SHADER_RESOURCE_VIEW_DESC {
        let mut desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
            Format: conv::view_format(self.format),
            Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
            ..Default::default()
        };

        if self.desc.array_layers > 1 {
            desc.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE2DARRAY;
            desc.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_SRV {
                MostDetailedMip: self.desc.base_mip_level,
                MipLevels: self.desc.mip_levels,
                FirstArraySlice: self.desc.base_array_layer,
                ArraySize: self.desc.array_layers,
                PlaneSlice: 0,
                ResourceMinLODClamp: 0.0,
            };
        } else {
            desc.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE2D;
            desc.Anonymous.Texture2D = D3D12_TEX2D_SRV {
                MostDetailedMip: self.desc.base_mip_level,
                MipLevels: self.desc.mip_levels,
                PlaneSlice: 0,
                ResourceMinLODClamp: 0.0,
            };
        }

        desc
    }

    fn uav_desc(&self) -> D3D12_UNORDERED_ACCESS_VIEW_DESC {
        let mut desc = D3D12_UNORDERED_ACCESS_VIEW_DESC {
            Format: conv::view_format(self.format),
            ..Default::default()
        };

        if self.desc.array_layers > 1 {
            desc.ViewDimension = D3D12_UAV_DIMENSION_TEXTURE2DARRAY;
            desc.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_UAV {
                MipSlice: self.desc.base_mip_level,
                FirstArraySlice: self.desc.base_array_layer,
                ArraySize: self.desc.array_layers,
                PlaneSlice: 0,
            };
        } else {
            desc.ViewDimension = D3D12_UAV_DIMENSION_TEXTURE2D;
            desc.Anonymous.Texture2D = D3D12_TEX2D_UAV {
                MipSlice: self.desc.base_mip_level,
                PlaneSlice: 0,
            };
        }

        desc
    }
}

impl Drop for Dx12TextureView {
    fn drop(&mut self) {
        if let Some(index) = self.rtv {
            self.shared.rtv_heap.free(index);
        }

        if let Some(index) = self.dsv {
            self.shared.dsv_heap.free(index);
        }
    }
}

#[derive(Debug)]
pub struct Dx12Sampler {
    desc: D3D12_SAMPLER_DESC,
}

/// A range of one of the shader-visible heaps of the device.
#[derive(Debug)]
pub struct Dx12DescriptorHeap {
    kind: DescriptorKind,
    capacity: u32,
    sampler: bool,
    region: Region,
    cpu_base: u64,
    gpu_base: u64,
    stride: u64,
    shared: Arc<DeviceShared>,
}

impl Dx12DescriptorHeap {
    pub(super) fn gpu_handle(&self, slot: u32) -> D3D12_GPU_DESCRIPTOR_HANDLE {
        D3D12_GPU_DESCRIPTOR_HANDLE {
            ptr: self.gpu_base + u64::from(slot) * self.stride,
        }
    }
}

impl crate::backend::DescriptorHeap for Dx12DescriptorHeap {
    fn kind(&self) -> DescriptorKind {
        self.kind
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn cpu_base(&self) -> u64 {
        self.cpu_base
    }

    fn gpu_base(&self) -> Option<u64> {
        Some(self.gpu_base)
    }

    fn stride(&self) -> u64 {
        self.stride
    }
}

impl Drop for Dx12DescriptorHeap {
    fn drop(&mut self) {
        let heap = if self.sampler {
            &self.shared.sampler_heap
        } else {
            &self.shared.resource_heap
        };

        heap.allocator.lock().free(self.region);
    }
}

#[derive(Debug)]
pub struct Dx12ShaderModule {
    code: Vec<u8>,
}

#[derive(Debug)]
pub struct Dx12PipelineLayout {
    pub(super) raw: ID3D12RootSignature,
}

#[derive(Debug)]
pub struct Dx12Pipeline {
    pub(super) raw: ID3D12PipelineState,
    pub(super) topology: D3D_PRIMITIVE_TOPOLOGY,
}

#[derive(Debug)]
pub struct Dx12Fence {
    pub(super) raw: ID3D12Fence,
    /// Event signaled by `SetEventOnCompletion`. Locked for the duration of a wait.
    event: Mutex<HANDLE>,
}

unsafe impl Send for Dx12Fence {}
unsafe impl Sync for Dx12Fence {}

impl Drop for Dx12Fence {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = CloseHandle(*self.event.get_mut()) {
                tracing::warn!("failed to close fence event: {}", err);
            }
        }
    }
}
