//! Vulkan 1.3 backend.
//!
//! Rendering uses `VK_KHR_dynamic_rendering` and fences are timeline semaphores.
//! Descriptor heaps are emulated with a descriptor pool holding one single-binding
//! descriptor set per slot. A pipeline layout maps every table to the set index of
//! its register space.

mod command;
mod conv;
mod device;
mod memory;
mod swapchain;

use std::borrow::Cow;
use std::ffi::{c_void, CStr, CString};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use ash::ext::debug_utils;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tandem_tracing::trace_span;

use crate::error::Error;

use super::{
    AdapterFeatures, AdapterInfo, AdapterKind, Api, BackendKind, DeviceDescriptor,
    InstanceDescriptor, OpenDevice,
};

pub use command::{VulkanCommandEncoder, VulkanCommandPool};
pub use device::{
    VulkanBuffer, VulkanDescriptorHeap, VulkanDevice, VulkanFence, VulkanPipeline,
    VulkanPipelineLayout, VulkanSampler, VulkanShaderModule, VulkanTexture, VulkanTextureView,
};
pub use swapchain::{VulkanQueue, VulkanSurface, VulkanSwapchain};

/// The highest version of Vulkan that we support.
///
/// See <https://registry.khronos.org/vulkan/specs/latest/man/html/VkApplicationInfo.html>
const API_VERSION: u32 = vk::API_VERSION_1_3;

const ENGINE_NAME: &CStr = c"tandem";

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const SURFACE_EXTENSIONS: &[&CStr] = &[
    // Required to create any surface.
    ash::khr::surface::NAME,
    // Wayland
    #[cfg(target_os = "linux")]
    ash::khr::wayland_surface::NAME,
    // X11
    #[cfg(target_os = "linux")]
    ash::khr::xcb_surface::NAME,
    #[cfg(target_os = "linux")]
    ash::khr::xlib_surface::NAME,
    // Windows
    #[cfg(target_os = "windows")]
    ash::khr::win32_surface::NAME,
];

const DEVICE_EXTENSIONS: &[&CStr] = &[ash::khr::swapchain::NAME];

#[derive(Copy, Clone, Debug)]
pub enum Vulkan {}

impl Api for Vulkan {
    const KIND: BackendKind = BackendKind::Vulkan;

    type Instance = VulkanInstance;
    type Adapter = VulkanAdapter;
    type Device = VulkanDevice;
    type Queue = VulkanQueue;
    type CommandPool = VulkanCommandPool;
    type CommandEncoder = VulkanCommandEncoder;
    type Fence = VulkanFence;
    type Buffer = VulkanBuffer;
    type Texture = VulkanTexture;
    type TextureView = VulkanTextureView;
    type Sampler = VulkanSampler;
    type DescriptorHeap = VulkanDescriptorHeap;
    type PipelineLayout = VulkanPipelineLayout;
    type Pipeline = VulkanPipeline;
    type ShaderModule = VulkanShaderModule;
    type Surface = VulkanSurface;
    type Swapchain = VulkanSwapchain;
}

impl From<vk::Result> for Error {
    fn from(err: vk::Result) -> Self {
        match err {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::OutOfMemory
            }
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            vk::Result::SUBOPTIMAL_KHR => Self::Suboptimal,
            vk::Result::TIMEOUT => Self::Timeout,
            err => Self::Backend(err.to_string()),
        }
    }
}

pub(crate) struct InstanceShared {
    entry: ash::Entry,
    raw: ash::Instance,
    debug_utils: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface: ash::khr::surface::Instance,
}

impl InstanceShared {
    pub(crate) fn raw(&self) -> &ash::Instance {
        &self.raw
    }

    pub(crate) fn surface_fns(&self) -> &ash::khr::surface::Instance {
        &self.surface
    }

    pub(crate) fn has_debug_utils(&self) -> bool {
        self.debug_utils.is_some()
    }
}

impl Debug for InstanceShared {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceShared")
            .field("instance", &self.raw.handle())
            .field("debug_utils", &self.has_debug_utils())
            .finish_non_exhaustive()
    }
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        if let Some((debug_utils, messenger)) = self.debug_utils.take() {
            unsafe {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
        }

        // All objects created from the instance hold a reference to it, so no child
        // object is alive anymore.
        unsafe {
            self.raw.destroy_instance(None);
        }
    }
}

pub struct VulkanInstance {
    shared: Arc<InstanceShared>,
}

impl super::Instance<Vulkan> for VulkanInstance {
    fn new(desc: &InstanceDescriptor<'_>) -> Result<Self, Error> {
        let _span = trace_span!("VulkanInstance::new").entered();

        let entry = unsafe { ash::Entry::load() }
            .map_err(|err| Error::Backend(format!("failed to load vulkan: {}", err)))?;

        let app_name = CString::new(desc.app_name)
            .map_err(|_| Error::Backend("application name contains a nul byte".to_owned()))?;

        let app = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .engine_name(ENGINE_NAME)
            .api_version(API_VERSION);

        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None)? };

        let has_layer = |name: &CStr| {
            available_layers
                .iter()
                .any(|layer| layer.layer_name_as_c_str().is_ok_and(|layer| layer == name))
        };
        let has_extension = |name: &CStr| {
            available_extensions
                .iter()
                .any(|ext| ext.extension_name_as_c_str().is_ok_and(|ext| ext == name))
        };

        let mut layers = Vec::new();
        let mut extensions = Vec::new();

        for name in SURFACE_EXTENSIONS {
            if has_extension(name) {
                extensions.push(name.as_ptr());
            } else {
                tracing::debug!("instance extension {:?} is not available", name);
            }
        }

        if !has_extension(ash::khr::surface::NAME) {
            return Err(Error::Backend(
                "VK_KHR_surface is not supported by the driver".to_owned(),
            ));
        }

        let mut validation = false;
        if desc.validation {
            if has_layer(VALIDATION_LAYER) && has_extension(debug_utils::NAME) {
                layers.push(VALIDATION_LAYER.as_ptr());
                extensions.push(debug_utils::NAME.as_ptr());
                validation = true;
            } else {
                tracing::warn!(
                    "validation requested but {:?} is not installed",
                    VALIDATION_LAYER
                );
            }
        }

        let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let mut info = vk::InstanceCreateInfo::default()
            .application_info(&app)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);
        if validation {
            // Also reports messages of instance creation and destruction.
            info = info.push_next(&mut debug_info);
        }

        let raw = unsafe { entry.create_instance(&info, None)? };

        let debug_utils = if validation {
            let debug_utils = debug_utils::Instance::new(&entry, &raw);
            match unsafe { debug_utils.create_debug_utils_messenger(&debug_info, None) } {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(err) => {
                    tracing::warn!("failed to create debug messenger: {}", err);
                    None
                }
            }
        } else {
            None
        };

        let surface = ash::khr::surface::Instance::new(&entry, &raw);

        Ok(Self {
            shared: Arc::new(InstanceShared {
                entry,
                raw,
                debug_utils,
                surface,
            }),
        })
    }

    fn adapters(&self) -> Result<Vec<VulkanAdapter>, Error> {
        let physical_devices = unsafe { self.shared.raw.enumerate_physical_devices()? };

        Ok(physical_devices
            .into_iter()
            .map(|physical_device| VulkanAdapter::new(self.shared.clone(), physical_device))
            .collect())
    }

    unsafe fn create_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<VulkanSurface, Error> {
        let entry = &self.shared.entry;
        let instance = &self.shared.raw;

        let raw = match (display, window) {
            #[cfg(target_os = "linux")]
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
                let info = vk::WaylandSurfaceCreateInfoKHR::default()
                    .display(display.display.as_ptr())
                    .surface(window.surface.as_ptr());

                let instance = ash::khr::wayland_surface::Instance::new(entry, instance);
                unsafe { instance.create_wayland_surface(&info, None)? }
            }
            #[cfg(target_os = "linux")]
            (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
                let info = vk::XcbSurfaceCreateInfoKHR::default()
                    .connection(display.connection.map(|v| v.as_ptr()).unwrap_or(std::ptr::null_mut()))
                    .window(window.window.get());

                let instance = ash::khr::xcb_surface::Instance::new(entry, instance);
                unsafe { instance.create_xcb_surface(&info, None)? }
            }
            #[cfg(target_os = "linux")]
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
                let info = vk::XlibSurfaceCreateInfoKHR::default()
                    .dpy(display.display.map(|v| v.as_ptr()).unwrap_or(std::ptr::null_mut()))
                    .window(window.window);

                let instance = ash::khr::xlib_surface::Instance::new(entry, instance);
                unsafe { instance.create_xlib_surface(&info, None)? }
            }
            #[cfg(target_os = "windows")]
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
                let info = vk::Win32SurfaceCreateInfoKHR::default()
                    .hinstance(window.hinstance.map(|v| v.get()).unwrap_or_default())
                    .hwnd(window.hwnd.get());

                let instance = ash::khr::win32_surface::Instance::new(entry, instance);
                unsafe { instance.create_win32_surface(&info, None)? }
            }
            (display, window) => {
                return Err(Error::Backend(format!(
                    "unsupported window handles {:?} / {:?}",
                    display, window
                )));
            }
        };

        Ok(VulkanSurface::new(self.shared.clone(), raw))
    }
}

impl std::fmt::Debug for VulkanInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanInstance")
            .field("validation", &self.shared.has_debug_utils())
            .finish_non_exhaustive()
    }
}

pub struct VulkanAdapter {
    instance: Arc<InstanceShared>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    info: AdapterInfo,
    features: AdapterFeatures,
}

impl VulkanAdapter {
    fn new(instance: Arc<InstanceShared>, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe {
            instance
                .raw
                .get_physical_device_properties(physical_device)
        };

        // `device_name` is a null-terminated UTF-8 string.
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "(unnamed)".to_owned());

        let kind = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => AdapterKind::DiscreteGpu,
            vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterKind::IntegratedGpu,
            vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterKind::VirtualGpu,
            vk::PhysicalDeviceType::CPU => AdapterKind::Cpu,
            _ => AdapterKind::Other,
        };

        let features = query_features(&instance.raw, physical_device, &properties);

        Self {
            info: AdapterInfo {
                name,
                kind,
                vendor_id: properties.vendor_id,
                device_id: properties.device_id,
            },
            instance,
            physical_device,
            properties,
            features,
        }
    }
}

impl super::Adapter<Vulkan> for VulkanAdapter {
    fn info(&self) -> AdapterInfo {
        self.info.clone()
    }

    fn features(&self) -> AdapterFeatures {
        self.features
    }

    fn open(&self, desc: &DeviceDescriptor) -> Result<OpenDevice<Vulkan>, Error> {
        let _span = trace_span!("VulkanAdapter::open").entered();

        if !self.features.contains(AdapterFeatures::REQUIRED) {
            return Err(Error::NoSuitableAdapter);
        }

        let families = unsafe {
            self.instance
                .raw
                .get_physical_device_queue_family_properties(self.physical_device)
        };
        let (graphics_family, transfer_family) = select_queue_families(&families)?;

        let priorities = [1.0];
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_family)
            .queue_priorities(&priorities)];
        if let Some(family) = transfer_family {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities),
            );
        }

        let extensions: Vec<_> = DEVICE_EXTENSIONS.iter().map(|name| name.as_ptr()).collect();

        let features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            .fill_mode_non_solid(self.features.contains(AdapterFeatures::FILL_MODE_NON_SOLID));
        let mut features11 = vk::PhysicalDeviceVulkan11Features::default().multiview(true);
        let mut features12 =
            vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);

        let info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut features11)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let raw = unsafe {
            self.instance
                .raw
                .create_device(self.physical_device, &info, None)?
        };

        let memory_properties = unsafe {
            self.instance
                .raw
                .get_physical_device_memory_properties(self.physical_device)
        };

        tracing::debug!(
            "opened {} with graphics family {} and transfer family {:?} ({} resource, {} sampler descriptors)",
            self.info.name,
            graphics_family,
            transfer_family,
            desc.resource_descriptors,
            desc.sampler_descriptors,
        );

        let device = VulkanDevice::new(
            self.instance.clone(),
            raw,
            self.physical_device,
            self.properties,
            &memory_properties,
            self.features,
            graphics_family,
            transfer_family.unwrap_or(graphics_family),
        );

        let graphics_queue = device.queue(graphics_family, super::QueueKind::Graphics, None);
        let transfer_queue = match transfer_family {
            Some(family) => device.queue(family, super::QueueKind::Transfer, None),
            // Both queues share the same `VkQueue` and must share its lock.
            None => device.queue(
                graphics_family,
                super::QueueKind::Transfer,
                Some(&graphics_queue),
            ),
        };

        Ok(OpenDevice {
            device,
            graphics_queue,
            transfer_queue,
            dedicated_transfer: transfer_family.is_some(),
        })
    }
}

impl std::fmt::Debug for VulkanAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanAdapter")
            .field("physical_device", &self.physical_device)
            .field("info", &self.info)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

fn query_features(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    properties: &vk::PhysicalDeviceProperties,
) -> AdapterFeatures {
    let mut features = AdapterFeatures::empty();

    let extensions =
        unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .unwrap_or_default();
    if extensions
        .iter()
        .any(|ext| {
            ext.extension_name_as_c_str()
                .is_ok_and(|ext| ext == ash::khr::swapchain::NAME)
        })
    {
        features |= AdapterFeatures::SWAPCHAIN;
    }

    // `VkPhysicalDeviceVulkan13Features` may only be chained on 1.3 devices.
    if vk::api_version_major(properties.api_version) != 1
        || vk::api_version_minor(properties.api_version) < 3
    {
        tracing::debug!(
            "device supports vulkan {}.{} only",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version)
        );

        let base = unsafe { instance.get_physical_device_features(physical_device) };
        if base.sampler_anisotropy != 0 {
            features |= AdapterFeatures::SAMPLER_ANISOTROPY;
        }
        if base.fill_mode_non_solid != 0 {
            features |= AdapterFeatures::FILL_MODE_NON_SOLID;
        }
        return features;
    }

    // `VK_KHR_create_renderpass2`, `VK_KHR_depth_stencil_resolve` and
    // `VK_KHR_maintenance2` are core in 1.2 and 1.1.
    features |= AdapterFeatures::CREATE_RENDERPASS_2
        | AdapterFeatures::DEPTH_STENCIL_RESOLVE
        | AdapterFeatures::MAINTENANCE_2;

    let mut features11 = vk::PhysicalDeviceVulkan11Features::default();
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut features11)
        .push_next(&mut features12)
        .push_next(&mut features13);

    unsafe {
        instance.get_physical_device_features2(physical_device, &mut features2);
    }
    let base = features2.features;

    let flags = [
        (features11.multiview, AdapterFeatures::MULTIVIEW),
        (features12.timeline_semaphore, AdapterFeatures::TIMELINE_FENCE),
        (features13.dynamic_rendering, AdapterFeatures::DYNAMIC_RENDERING),
        (base.sampler_anisotropy, AdapterFeatures::SAMPLER_ANISOTROPY),
        (base.fill_mode_non_solid, AdapterFeatures::FILL_MODE_NON_SOLID),
    ];
    for (supported, flag) in flags {
        if supported != vk::FALSE {
            features |= flag;
        }
    }

    features
}

/// Returns the graphics family and a transfer-only family if one exists.
fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
) -> Result<(u32, Option<u32>), Error> {
    let graphics = families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .ok_or_else(|| Error::Backend("adapter has no graphics queue".to_owned()))?;

    let transfer = families
        .iter()
        .enumerate()
        .filter(|(_, family)| {
            family.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        // Prefer pure copy queues over async compute queues.
        .min_by_key(|(_, family)| family.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|(index, _)| index as u32);

    Ok((graphics as u32, transfer))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    typ: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _: *mut c_void,
) -> vk::Bool32 {
    let message = match unsafe { data.as_ref() }.and_then(|data| unsafe { data.message_as_c_str() })
    {
        Some(msg) => msg.to_string_lossy(),
        None => Cow::Borrowed("(no message)"),
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "vulkan", "{:?} {}", typ, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "vulkan", "{:?} {}", typ, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::debug!(target: "vulkan", "{:?} {}", typ, message);
        }
        _ => {
            tracing::trace!(target: "vulkan", "{:?} {}", typ, message);
        }
    }

    // The application should always return `VK_FALSE`.
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use crate::error::Error;

    use super::select_queue_families;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_pure_transfer_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_families(&families).unwrap(), (0, Some(2)));
    }

    #[test]
    fn shares_graphics_family_without_transfer_family() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)];
        assert_eq!(select_queue_families(&families).unwrap(), (0, None));
    }

    #[test]
    fn no_graphics_family() {
        let families = [family(vk::QueueFlags::TRANSFER)];
        assert!(matches!(
            select_queue_families(&families),
            Err(Error::Backend(_))
        ));
    }

    #[test]
    fn vk_errors_map_to_renderer_errors() {
        assert!(matches!(
            Error::from(vk::Result::ERROR_DEVICE_LOST),
            Error::DeviceLost
        ));
        assert!(matches!(
            Error::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            Error::SwapchainOutOfDate
        ));
        assert!(matches!(
            Error::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            Error::OutOfMemory
        ));
        assert!(matches!(
            Error::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            Error::Backend(_)
        ));
    }
}
