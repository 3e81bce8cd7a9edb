use std::mem;
use std::sync::Arc;

use ash::vk;
use glam::UVec2;
use parking_lot::Mutex;
use tandem_tracing::trace_span;

use crate::backend::{
    AcquiredImage, PresentStatus, QueueKind, Submission, SurfaceCapabilities, SwapchainConfig,
    TextureDescriptor, TextureUsage,
};
use crate::error::Error;

use super::device::{DeviceShared, VulkanDevice, VulkanFence, VulkanTexture};
use super::{conv, InstanceShared, Vulkan};

#[derive(Debug)]
pub struct VulkanQueue {
    raw: vk::Queue,
    kind: QueueKind,
    /// Host access to a `VkQueue` must be externally synchronized.
    lock: Arc<Mutex<()>>,
    shared: Arc<DeviceShared>,
}

impl VulkanQueue {
    pub(super) fn new(
        shared: Arc<DeviceShared>,
        raw: vk::Queue,
        kind: QueueKind,
        lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            raw,
            kind,
            lock,
            shared,
        }
    }

    pub(super) fn lock(&self) -> &Arc<Mutex<()>> {
        &self.lock
    }
}

impl crate::backend::Queue<Vulkan> for VulkanQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    unsafe fn submit(&self, submission: &Submission<'_, Vulkan>) -> Result<(), Error> {
        let _span = trace_span!("VulkanQueue::submit").entered();

        let command_buffers: Vec<_> = submission
            .encoders
            .iter()
            .map(|encoder| encoder.raw())
            .collect();

        // Binary semaphores ignore their value in the timeline values array.
        let mut wait_semaphores = Vec::with_capacity(submission.wait.len() + 1);
        let mut wait_values = Vec::with_capacity(submission.wait.len() + 1);
        let mut wait_stages = Vec::with_capacity(submission.wait.len() + 1);
        for (fence, value) in submission.wait {
            wait_semaphores.push(fence.raw);
            wait_values.push(*value);
            wait_stages.push(vk::PipelineStageFlags::ALL_COMMANDS);
        }

        let mut signal_semaphores = Vec::with_capacity(submission.signal.len() + 1);
        let mut signal_values = Vec::with_capacity(submission.signal.len() + 1);
        for (fence, value) in submission.signal {
            signal_semaphores.push(fence.raw);
            signal_values.push(*value);
        }

        if let Some(swapchain) = submission.swapchain {
            let Some(index) = swapchain.acquired else {
                return Err(Error::Backend(
                    "submission references a swapchain without an acquired image".to_owned(),
                ));
            };

            wait_semaphores.push(swapchain.acquire_semaphores[index as usize]);
            wait_values.push(0);
            wait_stages.push(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);

            signal_semaphores.push(swapchain.present_semaphores[index as usize]);
            signal_values.push(0);
        }

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        let _guard = self.lock.lock();
        unsafe {
            self.shared
                .raw
                .queue_submit(self.raw, &[info], vk::Fence::null())?;
        }

        Ok(())
    }

    unsafe fn signal(&self, fence: &VulkanFence, value: u64) -> Result<(), Error> {
        let semaphores = [fence.raw];
        let values = [value];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&values);
        let info = vk::SubmitInfo::default()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        let _guard = self.lock.lock();
        unsafe {
            self.shared
                .raw
                .queue_submit(self.raw, &[info], vk::Fence::null())?;
        }

        Ok(())
    }

    unsafe fn present(
        &self,
        swapchain: &mut VulkanSwapchain,
        _vsync: bool,
    ) -> Result<PresentStatus, Error> {
        let _span = trace_span!("VulkanQueue::present").entered();

        // The present mode is fixed when the swapchain is created.
        let Some(index) = swapchain.acquired.take() else {
            return Err(Error::Backend(
                "present without an acquired swapchain image".to_owned(),
            ));
        };

        let wait_semaphores = [swapchain.present_semaphores[index as usize]];
        let swapchains = [swapchain.raw];
        let indices = [index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let _guard = self.lock.lock();
        let suboptimal = unsafe {
            self.shared
                .swapchain_fns
                .queue_present(self.raw, &info)?
        };

        if suboptimal {
            Ok(PresentStatus::Suboptimal)
        } else {
            Ok(PresentStatus::Optimal)
        }
    }
}

#[derive(Debug)]
pub struct VulkanSurface {
    raw: vk::SurfaceKHR,
    instance: Arc<InstanceShared>,
}

impl VulkanSurface {
    pub(super) fn new(instance: Arc<InstanceShared>, raw: vk::SurfaceKHR) -> Self {
        Self { raw, instance }
    }
}

impl crate::backend::Surface<Vulkan> for VulkanSurface {
    fn capabilities(&self, device: &VulkanDevice) -> Result<SurfaceCapabilities, Error> {
        let shared = device.shared();
        let fns = self.instance.surface_fns();

        let supported = unsafe {
            fns.get_physical_device_surface_support(
                shared.physical_device,
                shared.graphics_family,
                self.raw,
            )?
        };
        if !supported {
            return Err(Error::Backend(
                "surface cannot be presented from the graphics queue".to_owned(),
            ));
        }

        let caps = unsafe {
            fns.get_physical_device_surface_capabilities(shared.physical_device, self.raw)?
        };
        let formats = unsafe {
            fns.get_physical_device_surface_formats(shared.physical_device, self.raw)?
        };
        let present_modes = unsafe {
            fns.get_physical_device_surface_present_modes(shared.physical_device, self.raw)?
        };

        // A current extent of `u32::MAX` means that the swapchain determines the
        // surface size.
        let current_extent = (caps.current_extent.width != u32::MAX).then(|| {
            UVec2::new(caps.current_extent.width, caps.current_extent.height)
        });

        let mut supported_formats = Vec::new();
        for format in formats {
            if format.color_space != vk::ColorSpaceKHR::SRGB_NONLINEAR {
                continue;
            }

            if let Some(format) = conv::texture_format_from_vk(format.format) {
                if !supported_formats.contains(&format) {
                    supported_formats.push(format);
                }
            }
        }

        Ok(SurfaceCapabilities {
            min_images: caps.min_image_count,
            // 0 means there is no limit.
            max_images: (caps.max_image_count != 0).then_some(caps.max_image_count),
            current_extent,
            min_extent: UVec2::new(caps.min_image_extent.width, caps.min_image_extent.height),
            max_extent: UVec2::new(caps.max_image_extent.width, caps.max_image_extent.height),
            formats: supported_formats,
            present_modes: present_modes
                .into_iter()
                .filter_map(conv::present_mode_from_vk)
                .collect(),
        })
    }

    unsafe fn create_swapchain(
        &self,
        device: &VulkanDevice,
        _queue: &VulkanQueue,
        config: &SwapchainConfig,
        old: Option<VulkanSwapchain>,
    ) -> Result<VulkanSwapchain, Error> {
        let _span = trace_span!("VulkanSurface::create_swapchain").entered();

        let shared = device.shared();
        let caps = unsafe {
            self.instance
                .surface_fns()
                .get_physical_device_surface_capabilities(shared.physical_device, self.raw)?
        };

        let composite_alpha = if caps
            .supported_composite_alpha
            .contains(vk::CompositeAlphaFlagsKHR::OPAQUE)
        {
            vk::CompositeAlphaFlagsKHR::OPAQUE
        } else {
            vk::CompositeAlphaFlagsKHR::INHERIT
        };

        let usage = TextureUsage::RENDER_TARGET | TextureUsage::TRANSFER_DST;

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.raw)
            .min_image_count(config.image_count)
            .image_format(conv::texture_format(config.format))
            .image_color_space(vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .image_extent(vk::Extent2D {
                width: config.extent.x,
                height: config.extent.y,
            })
            .image_array_layers(1)
            .image_usage(conv::texture_usage(usage))
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(composite_alpha)
            .present_mode(conv::present_mode(config.present_mode))
            .clipped(true)
            .old_swapchain(old.as_ref().map_or(vk::SwapchainKHR::null(), |old| old.raw));

        let raw = unsafe { shared.swapchain_fns.create_swapchain(&info, None)? };

        // The old swapchain is retired by the create call and can be destroyed now.
        drop(old);

        let mut swapchain = VulkanSwapchain {
            raw,
            images: Vec::new(),
            config: *config,
            acquire_semaphores: Vec::new(),
            present_semaphores: Vec::new(),
            spare: vk::Semaphore::null(),
            acquired: None,
            shared: shared.clone(),
        };

        let images = unsafe { shared.swapchain_fns.get_swapchain_images(raw)? };
        let desc = TextureDescriptor::new_2d(config.extent, config.format, usage);

        let info = vk::SemaphoreCreateInfo::default();
        for image in images {
            swapchain
                .images
                .push(VulkanTexture::from_swapchain(shared.clone(), image, desc));

            unsafe {
                swapchain
                    .acquire_semaphores
                    .push(shared.raw.create_semaphore(&info, None)?);
                swapchain
                    .present_semaphores
                    .push(shared.raw.create_semaphore(&info, None)?);
            }
        }

        swapchain.spare = unsafe { shared.raw.create_semaphore(&info, None)? };

        // The driver may create more images than requested.
        swapchain.config.image_count = swapchain.images.len() as u32;

        tracing::debug!(
            "created swapchain {}x{} with {} images",
            config.extent.x,
            config.extent.y,
            swapchain.images.len(),
        );

        Ok(swapchain)
    }
}

impl Drop for VulkanSurface {
    fn drop(&mut self) {
        unsafe {
            self.instance
                .surface_fns()
                .destroy_surface(self.raw, None);
        }
    }
}

#[derive(Debug)]
pub struct VulkanSwapchain {
    raw: vk::SwapchainKHR,
    images: Vec<VulkanTexture>,
    config: SwapchainConfig,
    /// Semaphore signaled by the acquire of each image.
    acquire_semaphores: Vec<vk::Semaphore>,
    /// Semaphore signaled by the submission rendering to each image.
    present_semaphores: Vec<vk::Semaphore>,
    /// Unused semaphore for the next acquire. The image index is only known after
    /// the acquire returns.
    spare: vk::Semaphore,
    acquired: Option<u32>,
    shared: Arc<DeviceShared>,
}

impl crate::backend::Swapchain<Vulkan> for VulkanSwapchain {
    fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    fn images(&self) -> &[VulkanTexture] {
        &self.images
    }

    unsafe fn acquire(&mut self) -> Result<AcquiredImage, Error> {
        let _span = trace_span!("VulkanSwapchain::acquire").entered();

        let (index, suboptimal) = unsafe {
            self.shared.swapchain_fns.acquire_next_image(
                self.raw,
                u64::MAX,
                self.spare,
                vk::Fence::null(),
            )?
        };

        // The previous acquire semaphore of this image was waited on by the
        // submission that rendered to it.
        mem::swap(&mut self.spare, &mut self.acquire_semaphores[index as usize]);
        self.acquired = Some(index);

        Ok(AcquiredImage { index, suboptimal })
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        // Images are owned by the swapchain.
        self.images.clear();

        unsafe {
            for semaphore in self
                .acquire_semaphores
                .drain(..)
                .chain(self.present_semaphores.drain(..))
            {
                self.shared.raw.destroy_semaphore(semaphore, None);
            }

            self.shared.raw.destroy_semaphore(self.spare, None);
            self.shared.swapchain_fns.destroy_swapchain(self.raw, None);
        }
    }
}
