//! Direct3D 12 backend.
//!
//! The device owns one shader-visible heap for CBV/SRV/UAV descriptors and one for
//! samplers. Descriptor heaps handed out by the device are ranges of these heaps, so
//! both stay bound for the whole command list. Render target and depth stencil views
//! live in CPU-only heaps owned by the device.

mod command;
mod conv;
mod device;
mod swapchain;

use std::ffi::c_void;
use std::mem::size_of;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tandem_tracing::trace_span;
use windows::core::Interface;
use windows::Win32::Foundation::{E_OUTOFMEMORY, HWND};
use windows::Win32::Graphics::Direct3D::{D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_12_0};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::*;

use crate::error::Error;

use super::{
    AdapterFeatures, AdapterInfo, AdapterKind, Api, BackendKind, DeviceDescriptor,
    InstanceDescriptor, OpenDevice, QueueKind,
};

pub use command::{Dx12CommandEncoder, Dx12CommandPool};
pub use device::{
    Dx12Buffer, Dx12DescriptorHeap, Dx12Device, Dx12Fence, Dx12Pipeline, Dx12PipelineLayout,
    Dx12Sampler, Dx12ShaderModule, Dx12Texture, Dx12TextureView,
};
pub use swapchain::{Dx12Queue, Dx12Surface, Dx12Swapchain};

const FEATURE_LEVEL: D3D_FEATURE_LEVEL = D3D_FEATURE_LEVEL_12_0;

#[derive(Copy, Clone, Debug)]
pub enum Dx12 {}

impl Api for Dx12 {
    const KIND: BackendKind = BackendKind::Dx12;

    type Instance = Dx12Instance;
    type Adapter = Dx12Adapter;
    type Device = Dx12Device;
    type Queue = Dx12Queue;
    type CommandPool = Dx12CommandPool;
    type CommandEncoder = Dx12CommandEncoder;
    type Fence = Dx12Fence;
    type Buffer = Dx12Buffer;
    type Texture = Dx12Texture;
    type TextureView = Dx12TextureView;
    type Sampler = Dx12Sampler;
    type DescriptorHeap = Dx12DescriptorHeap;
    type PipelineLayout = Dx12PipelineLayout;
    type Pipeline = Dx12Pipeline;
    type ShaderModule = Dx12ShaderModule;
    type Surface = Dx12Surface;
    type Swapchain = Dx12Swapchain;
}

impl From<windows::core::Error> for Error {
    fn from(err: windows::core::Error) -> Self {
        match err.code() {
            code if code == E_OUTOFMEMORY => Self::OutOfMemory,
            code if code == DXGI_ERROR_DEVICE_REMOVED
                || code == DXGI_ERROR_DEVICE_RESET
                || code == DXGI_ERROR_DEVICE_HUNG =>
            {
                Self::DeviceLost
            }
            _ => Self::Backend(err.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct Dx12Instance {
    factory: IDXGIFactory4,
}

impl super::Instance<Dx12> for Dx12Instance {
    fn new(desc: &InstanceDescriptor<'_>) -> Result<Self, Error> {
        let _span = trace_span!("Dx12Instance::new").entered();

        let mut flags = DXGI_CREATE_FACTORY_FLAGS(0);
        if desc.validation {
            let mut debug: Option<ID3D12Debug> = None;
            match unsafe { D3D12GetDebugInterface(&mut debug) } {
                Ok(()) => {
                    if let Some(debug) = debug {
                        unsafe {
                            debug.EnableDebugLayer();
                        }
                        flags = DXGI_CREATE_FACTORY_DEBUG;
                    }
                }
                Err(err) => {
                    tracing::warn!("validation requested but the debug layer is missing: {}", err);
                }
            }
        }

        let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory2(flags)? };
        Ok(Self { factory })
    }

    fn adapters(&self) -> Result<Vec<Dx12Adapter>, Error> {
        let mut adapters = Vec::new();

        for index in 0.. {
            let adapter = match unsafe { self.factory.EnumAdapters1(index) } {
                Ok(adapter) => adapter,
                Err(err) if err.code() == DXGI_ERROR_NOT_FOUND => break,
                Err(err) => return Err(err.into()),
            };

            adapters.push(Dx12Adapter::new(adapter)?);
        }

        Ok(adapters)
    }

    unsafe fn create_surface(
        &self,
        _display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Dx12Surface, Error> {
        let RawWindowHandle::Win32(window) = window else {
            return Err(Error::Backend(format!(
                "unsupported window handle: {:?}",
                window
            )));
        };

        let hwnd = HWND(window.hwnd.get() as *mut c_void);
        Dx12Surface::new(self.factory.clone(), hwnd)
    }
}

#[derive(Debug)]
pub struct Dx12Adapter {
    raw: IDXGIAdapter1,
    info: AdapterInfo,
    features: AdapterFeatures,
}

impl Dx12Adapter {
    fn new(raw: IDXGIAdapter1) -> Result<Self, Error> {
        let desc = unsafe { raw.GetDesc1()? };

        let len = desc
            .Description
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(desc.Description.len());
        let name = String::from_utf16_lossy(&desc.Description[..len]);

        let software = desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0;

        // Creating a device is the only way to check for feature level support.
        let mut device: Option<ID3D12Device> = None;
        let supported = unsafe { D3D12CreateDevice(&raw, FEATURE_LEVEL, &mut device) }.is_ok();

        let kind = match device {
            _ if software => AdapterKind::Cpu,
            Some(device) => {
                let mut arch = D3D12_FEATURE_DATA_ARCHITECTURE::default();
                let res = unsafe {
                    device.CheckFeatureSupport(
                        D3D12_FEATURE_ARCHITECTURE,
                        &mut arch as *mut _ as *mut c_void,
                        size_of::<D3D12_FEATURE_DATA_ARCHITECTURE>() as u32,
                    )
                };

                match res {
                    Ok(()) if arch.UMA.as_bool() => AdapterKind::IntegratedGpu,
                    Ok(()) => AdapterKind::DiscreteGpu,
                    Err(_) => AdapterKind::Other,
                }
            }
            None => AdapterKind::Other,
        };

        // All other features are core in feature level 12_0.
        let features = if supported {
            AdapterFeatures::REQUIRED | AdapterFeatures::FILL_MODE_NON_SOLID
        } else {
            AdapterFeatures::empty()
        };

        Ok(Self {
            raw,
            info: AdapterInfo {
                name,
                kind,
                vendor_id: desc.VendorId,
                device_id: desc.DeviceId,
            },
            features,
        })
    }
}

impl super::Adapter<Dx12> for Dx12Adapter {
    fn info(&self) -> AdapterInfo {
        self.info.clone()
    }

    fn features(&self) -> AdapterFeatures {
        self.features
    }

    fn open(&self, desc: &DeviceDescriptor) -> Result<OpenDevice<Dx12>, Error> {
        let _span = trace_span!("Dx12Adapter::open").entered();

        if !self.features.contains(AdapterFeatures::REQUIRED) {
            return Err(Error::NoSuitableAdapter);
        }

        let mut device: Option<ID3D12Device> = None;
        unsafe { D3D12CreateDevice(&self.raw, FEATURE_LEVEL, &mut device)? };
        let device = device.ok_or(Error::NoSuitableAdapter)?;

        let graphics = create_queue(&device, D3D12_COMMAND_LIST_TYPE_DIRECT)?;
        let transfer = create_queue(&device, D3D12_COMMAND_LIST_TYPE_COPY)?;

        let device = Dx12Device::new(
            device,
            &self.info,
            self.features,
            desc,
            [graphics.clone(), transfer.clone()],
        )?;

        tracing::debug!("opened device on {}", self.info.name);

        Ok(OpenDevice {
            graphics_queue: Dx12Queue::new(graphics, QueueKind::Graphics),
            transfer_queue: Dx12Queue::new(transfer, QueueKind::Transfer),
            device,
            dedicated_transfer: true,
        })
    }
}

fn create_queue(
    device: &ID3D12Device,
    ty: D3D12_COMMAND_LIST_TYPE,
) -> Result<ID3D12CommandQueue, Error> {
    let desc = D3D12_COMMAND_QUEUE_DESC {
        Type: ty,
        Priority: D3D12_COMMAND_QUEUE_PRIORITY_NORMAL.0,
        Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
        NodeMask: 0,
    };

    Ok(unsafe { device.CreateCommandQueue(&desc)? })
}

/// Returns [`Error::DeviceLost`] if `device` was removed.
fn check_device(device: &ID3D12Device) -> Result<(), Error> {
    match unsafe { device.GetDeviceRemovedReason() } {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::error!("device removed: {}", err);
            Err(Error::DeviceLost)
        }
    }
}

/// Reinterprets an interface as the non-owning pointer stored in D3D12 descriptor
/// structs.
///
/// # Safety
///
/// The returned value must not outlive `interface` and must not be dropped.
unsafe fn borrow_interface<T: Interface>(interface: &T) -> std::mem::ManuallyDrop<Option<T>> {
    unsafe { std::mem::transmute_copy(interface) }
}
