//! Back buffers of a window and the present timeline.

use std::fmt::{self, Debug, Formatter};

use glam::UVec2;
use tandem_tracing::trace_span;

use crate::backend::{
    Api, CommandEncoder, Device, PresentMode, PresentStatus, Queue, Surface,
    SurfaceCapabilities, Swapchain, SwapchainConfig, TextureBarrier, TextureDescriptor,
    TextureFormat, TextureLayout, TextureUsage, TextureViewDescriptor,
};
use crate::device::RenderDevice;
use crate::error::{Error, Result};
use crate::resources::{ResourceAllocator, Texture};

pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// The back buffer acquired for the current frame.
pub struct Backbuffer<'a, A: Api> {
    pub texture: &'a A::Texture,
    pub view: &'a A::TextureView,
    pub format: TextureFormat,
    pub extent: UVec2,
    /// Layout the image is currently in. Updated by whoever records a barrier.
    pub layout: &'a mut TextureLayout,
    pub depth: Option<(&'a mut Texture<A>, &'a A::TextureView)>,
}

impl<A: Api> Backbuffer<'_, A> {
    /// Records a barrier moving the image into `layout`.
    pub fn transition(&mut self, encoder: &mut A::CommandEncoder, layout: TextureLayout) {
        if *self.layout != layout {
            encoder.texture_barriers(&[TextureBarrier {
                texture: self.texture,
                src: *self.layout,
                dst: layout,
            }]);
            *self.layout = layout;
        }
    }
}

struct Images<A: Api> {
    views: Vec<A::TextureView>,
    layouts: Vec<TextureLayout>,
    depth_view: A::TextureView,
    depth: Texture<A>,
}

/// A swapchain with its views, depth buffer and present fence.
///
/// Every [`present`] signals the present fence with a value greater than all values
/// signaled before.
///
/// [`present`]: Self::present
pub struct WindowSwapchain<A: Api> {
    images: Option<Images<A>>,
    raw: Option<A::Swapchain>,
    surface: A::Surface,
    config: SwapchainConfig,
    vsync: bool,
    fence: A::Fence,
    fence_value: u64,
    acquired: Option<u32>,
    needs_rebuild: bool,
}

impl<A: Api> WindowSwapchain<A> {
    pub fn new(
        device: &RenderDevice<A>,
        surface: A::Surface,
        extent: UVec2,
        image_count: u32,
        vsync: bool,
    ) -> Result<Self> {
        let _span = trace_span!("WindowSwapchain::new").entered();

        let caps = surface.capabilities(device.raw())?;
        let config = create_swapchain_config(&caps, extent, image_count, vsync)?;

        let mut this = Self {
            images: None,
            raw: None,
            surface,
            config,
            vsync,
            fence: device.raw().create_fence(0)?,
            fence_value: 0,
            acquired: None,
            needs_rebuild: false,
        };

        if extent.x != 0 && extent.y != 0 {
            this.create(device)?;
        }

        Ok(this)
    }

    pub fn extent(&self) -> UVec2 {
        self.config.extent
    }

    pub fn format(&self) -> TextureFormat {
        self.config.format
    }

    pub fn image_count(&self) -> u32 {
        self.config.image_count
    }

    pub fn present_mode(&self) -> PresentMode {
        self.config.present_mode
    }

    pub fn vsync(&self) -> bool {
        self.vsync
    }

    /// Returns `true` if the extent is zero and nothing can be rendered.
    pub fn is_zero_sized(&self) -> bool {
        self.raw.is_none()
    }

    /// Last value signaled on the present fence.
    pub fn present_value(&self) -> u64 {
        self.fence_value
    }

    pub fn completed_value(&self, device: &RenderDevice<A>) -> Result<u64> {
        device.raw().fence_value(&self.fence)
    }

    pub fn raw(&self) -> Option<&A::Swapchain> {
        self.raw.as_ref()
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn mark_rebuild(&mut self) {
        self.needs_rebuild = true;
    }

    /// Acquires the next back buffer.
    ///
    /// Returns `None` if the swapchain has a zero extent.
    pub fn acquire(&mut self) -> Result<Option<u32>> {
        let _span = trace_span!("WindowSwapchain::acquire").entered();

        let Some(raw) = &mut self.raw else {
            return Ok(None);
        };

        debug_assert!(self.acquired.is_none(), "acquired twice without present");

        // SAFETY: The previously acquired image was presented.
        let image = match unsafe { raw.acquire() } {
            Ok(image) => image,
            Err(err) => {
                if err.is_recoverable() {
                    self.needs_rebuild = true;
                }
                return Err(err);
            }
        };

        if image.suboptimal {
            tracing::debug!("acquired suboptimal swapchain image");
            self.needs_rebuild = true;
        }

        self.acquired = Some(image.index);
        Ok(Some(image.index))
    }

    /// Releases the acquired image of a frame that failed before it was presented.
    ///
    /// The image stays acquired by the backend, so the swapchain is rebuilt before the
    /// next frame.
    pub fn abandon_frame(&mut self) {
        if self.acquired.take().is_some() {
            tracing::debug!("abandoned acquired swapchain image");
            self.needs_rebuild = true;
        }
    }

    /// Returns the acquired back buffer.
    pub fn backbuffer(&mut self) -> Option<Backbuffer<'_, A>> {
        let index = self.acquired? as usize;
        let raw = self.raw.as_ref()?;
        let images = self.images.as_mut()?;

        Some(Backbuffer {
            texture: &raw.images()[index],
            view: &images.views[index],
            format: self.config.format,
            extent: self.config.extent,
            layout: &mut images.layouts[index],
            depth: Some((&mut images.depth, &images.depth_view)),
        })
    }

    /// Presents the acquired image and signals the present fence.
    ///
    /// Returns the signaled fence value. An out of date swapchain is marked for rebuild
    /// but still advances the fence.
    pub fn present(&mut self, queue: &A::Queue) -> Result<u64> {
        let _span = trace_span!("WindowSwapchain::present").entered();

        let Some(raw) = &mut self.raw else {
            return Err(Error::Backend("present without swapchain".to_owned()));
        };

        if self.acquired.take().is_none() {
            return Err(Error::Backend("present without acquired image".to_owned()));
        }

        // SAFETY: The image was acquired and the frame rendering to it was submitted.
        match unsafe { queue.present(raw, self.vsync) } {
            Ok(PresentStatus::Optimal) => (),
            Ok(PresentStatus::Suboptimal) => self.needs_rebuild = true,
            Err(err) if err.is_recoverable() => {
                tracing::debug!("present failed: {}", err);
                self.needs_rebuild = true;
            }
            Err(err) => return Err(err),
        }

        self.signal_without_present(queue)
    }

    /// Signals the present fence for a frame that was submitted but not presented.
    pub fn signal_without_present(&mut self, queue: &A::Queue) -> Result<u64> {
        let value = self.fence_value + 1;
        // SAFETY: `value` is greater than every value signaled before.
        unsafe {
            queue.signal(&self.fence, value)?;
        }
        self.fence_value = value;
        Ok(value)
    }

    /// Blocks until the present fence reached `value`.
    pub fn wait_for_value(&self, device: &RenderDevice<A>, value: u64) -> Result<()> {
        if value == 0 {
            return Ok(());
        }

        let _span = trace_span!("WindowSwapchain::wait_for_value").entered();
        device.raw().wait_fence(&self.fence, value)
    }

    /// Blocks until the last presented frame completed.
    pub fn wait_for_last_frame(&self, device: &RenderDevice<A>) -> Result<()> {
        self.wait_for_value(device, self.fence_value)
    }

    /// Recreates the swapchain with a new extent, keeping format and present mode.
    pub fn resize(&mut self, device: &RenderDevice<A>, extent: UVec2) -> Result<()> {
        let _span = trace_span!("WindowSwapchain::resize").entered();

        self.wait_for_last_frame(device)?;
        self.acquired = None;
        self.images = None;

        let caps = self.surface.capabilities(device.raw())?;
        let extent = caps.current_extent.unwrap_or(extent);
        self.config.extent = if extent.x == 0 || extent.y == 0 {
            UVec2::ZERO
        } else {
            extent.clamp(caps.min_extent, caps.max_extent)
        };

        self.needs_rebuild = false;
        if self.config.extent == UVec2::ZERO {
            tracing::debug!("surface has zero extent, skipping rendering");
            self.raw = None;
            return Ok(());
        }

        self.create(device)
    }

    fn create(&mut self, device: &RenderDevice<A>) -> Result<()> {
        tracing::info!(
            "creating swapchain {}x{} with {} images ({:?}, {:?})",
            self.config.extent.x,
            self.config.extent.y,
            self.config.image_count,
            self.config.format,
            self.config.present_mode
        );

        // SAFETY: The last frame completed, so no image of the old swapchain is in use.
        let raw = unsafe {
            self.surface.create_swapchain(
                device.raw(),
                device.graphics_queue(),
                &self.config,
                self.raw.take(),
            )?
        };

        let views = raw
            .images()
            .iter()
            .map(|image| {
                device
                    .raw()
                    .create_texture_view(image, &TextureViewDescriptor::FIRST)
            })
            .collect::<Result<Vec<_>>>()?;

        let depth = ResourceAllocator::<A>::new(device.raw()).create_texture(
            &TextureDescriptor::new_2d(
                self.config.extent,
                DEPTH_FORMAT,
                TextureUsage::DEPTH_STENCIL,
            ),
        )?;
        let depth_view = depth.create_full_view(device.raw())?;

        self.images = Some(Images {
            layouts: vec![TextureLayout::Undefined; views.len()],
            views,
            depth_view,
            depth,
        });
        self.raw = Some(raw);
        Ok(())
    }
}

impl<A: Api> Debug for WindowSwapchain<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowSwapchain")
            .field("config", &self.config)
            .field("vsync", &self.vsync)
            .field("fence_value", &self.fence_value)
            .field("acquired", &self.acquired)
            .field("needs_rebuild", &self.needs_rebuild)
            .finish_non_exhaustive()
    }
}

fn create_swapchain_config(
    caps: &SurfaceCapabilities,
    extent: UVec2,
    image_count: u32,
    vsync: bool,
) -> Result<SwapchainConfig> {
    let max_images = caps.max_images.unwrap_or(u32::MAX);
    if image_count < caps.min_images || image_count > max_images {
        return Err(Error::Backend(format!(
            "surface does not support {} images ({}..={})",
            image_count, caps.min_images, max_images
        )));
    }

    let extent = caps.current_extent.unwrap_or(extent);
    let extent = if extent.x == 0 || extent.y == 0 {
        UVec2::ZERO
    } else {
        extent.clamp(caps.min_extent, caps.max_extent)
    };

    let format = get_surface_format(&caps.formats)
        .ok_or_else(|| Error::Backend("surface reports no formats".to_owned()))?;

    Ok(SwapchainConfig {
        extent,
        format,
        image_count,
        present_mode: get_surface_present_mode(&caps.present_modes, vsync),
    })
}

fn get_surface_format(formats: &[TextureFormat]) -> Option<TextureFormat> {
    formats
        .iter()
        .find(|format| format.is_srgb())
        .or_else(|| formats.first())
        .copied()
}

fn get_surface_present_mode(modes: &[PresentMode], vsync: bool) -> PresentMode {
    if vsync {
        return PresentMode::Fifo;
    }

    for preferred in [PresentMode::Mailbox, PresentMode::Immediate] {
        if modes.contains(&preferred) {
            return preferred;
        }
    }

    // FIFO is always supported.
    PresentMode::Fifo
}

#[cfg(test)]
mod tests {
    use glam::UVec2;

    use crate::backend::null::Null;
    use crate::backend::{Instance, PresentMode, TextureFormat, TextureLayout};
    use crate::test_util::render_device;
    use crate::window::{HeadlessWindow, WindowSurface};

    use super::{get_surface_format, get_surface_present_mode, WindowSwapchain};

    fn swapchain(size: UVec2, images: u32) -> (crate::device::RenderDevice<Null>, WindowSwapchain<Null>) {
        let device = render_device();
        let instance = crate::backend::null::NullInstance::with_adapters(Vec::new());
        let window = HeadlessWindow::new(size);
        let surface = unsafe {
            instance
                .create_surface(
                    window.raw_display_handle().unwrap(),
                    window.raw_window_handle().unwrap(),
                )
                .unwrap()
        };

        let swapchain = WindowSwapchain::new(&device, surface, size, images, true).unwrap();
        (device, swapchain)
    }

    #[test]
    fn present_mode_selection() {
        let all = [PresentMode::Fifo, PresentMode::Mailbox, PresentMode::Immediate];
        assert_eq!(get_surface_present_mode(&all, true), PresentMode::Fifo);
        assert_eq!(get_surface_present_mode(&all, false), PresentMode::Mailbox);
        assert_eq!(
            get_surface_present_mode(&[PresentMode::Fifo], false),
            PresentMode::Fifo
        );
    }

    #[test]
    fn surface_format_prefers_srgb() {
        assert_eq!(
            get_surface_format(&[TextureFormat::Bgra8Unorm, TextureFormat::Bgra8UnormSrgb]),
            Some(TextureFormat::Bgra8UnormSrgb)
        );
        assert_eq!(
            get_surface_format(&[TextureFormat::Rgba8Unorm]),
            Some(TextureFormat::Rgba8Unorm)
        );
        assert_eq!(get_surface_format(&[]), None);
    }

    #[test]
    fn present_values_increase() {
        let (device, mut swapchain) = swapchain(UVec2::new(32, 32), 3);

        let mut last = 0;
        for frame in 0..7 {
            let index = swapchain.acquire().unwrap().unwrap();
            assert_eq!(index, frame % 3);

            let mut backbuffer = swapchain.backbuffer().unwrap();
            assert_eq!(backbuffer.extent, UVec2::new(32, 32));
            *backbuffer.layout = TextureLayout::Present;

            let value = swapchain.present(device.graphics_queue()).unwrap();
            assert!(value > last);
            last = value;
        }

        assert_eq!(swapchain.present_value(), 7);
        swapchain.wait_for_last_frame(&device).unwrap();
        assert_eq!(swapchain.completed_value(&device).unwrap(), 7);
    }

    #[test]
    fn abandoned_frame_requests_rebuild() {
        let (device, mut swapchain) = swapchain(UVec2::new(32, 32), 2);

        swapchain.acquire().unwrap().unwrap();
        swapchain.abandon_frame();
        assert!(swapchain.needs_rebuild());
        assert!(swapchain.backbuffer().is_none());
        assert!(swapchain.present(device.graphics_queue()).is_err());

        swapchain.resize(&device, UVec2::new(32, 32)).unwrap();
        assert!(!swapchain.needs_rebuild());
        assert!(swapchain.acquire().unwrap().is_some());
        assert_eq!(swapchain.present(device.graphics_queue()).unwrap(), 1);
    }

    #[test]
    fn zero_extent_skips_frames() {
        let (device, mut swapchain) = swapchain(UVec2::new(16, 16), 2);

        swapchain.resize(&device, UVec2::new(0, 9)).unwrap();
        assert!(swapchain.is_zero_sized());
        assert_eq!(swapchain.acquire().unwrap(), None);

        swapchain.resize(&device, UVec2::new(40, 20)).unwrap();
        assert_eq!(swapchain.extent(), UVec2::new(40, 20));
        assert_eq!(swapchain.format(), TextureFormat::Bgra8UnormSrgb);
        assert_eq!(swapchain.acquire().unwrap(), Some(0));
    }

    #[test]
    fn unsupported_image_count_is_rejected() {
        let device = render_device();
        let instance = crate::backend::null::NullInstance::with_adapters(Vec::new());
        let window = HeadlessWindow::new(UVec2::ONE);
        let surface = unsafe {
            instance
                .create_surface(
                    window.raw_display_handle().unwrap(),
                    window.raw_window_handle().unwrap(),
                )
                .unwrap()
        };

        assert!(WindowSwapchain::new(&device, surface, UVec2::ONE, 1, true).is_err());
    }
}
