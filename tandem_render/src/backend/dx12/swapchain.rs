use std::ffi::c_void;
use std::mem::size_of;

use glam::UVec2;
use tandem_tracing::trace_span;
use windows::core::Interface;
use windows::Win32::Foundation::{BOOL, HWND};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

use crate::backend::{
    AcquiredImage, PresentMode, PresentStatus, QueueKind, Submission, SurfaceCapabilities,
    SwapchainConfig, TextureDescriptor, TextureFormat, TextureUsage,
};
use crate::error::Error;

use super::device::{Dx12Device, Dx12Fence, Dx12Texture};
use super::{conv, Dx12};

/// Swapchains created by DXGI must have at least two buffers.
const MIN_BUFFERS: u32 = 2;
const MAX_BUFFERS: u32 = DXGI_MAX_SWAP_CHAIN_BUFFERS;

#[derive(Debug)]
pub struct Dx12Queue {
    raw: ID3D12CommandQueue,
    kind: QueueKind,
}

impl Dx12Queue {
    pub(super) fn new(raw: ID3D12CommandQueue, kind: QueueKind) -> Self {
        Self { raw, kind }
    }
}

impl crate::backend::Queue<Dx12> for Dx12Queue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    unsafe fn submit(&self, submission: &Submission<'_, Dx12>) -> Result<(), Error> {
        let _span = trace_span!("Dx12Queue::submit").entered();

        for (fence, value) in submission.wait {
            unsafe { self.raw.Wait(&fence.raw, *value)? };
        }

        let lists = submission
            .encoders
            .iter()
            .map(|encoder| encoder.raw().cast::<ID3D12CommandList>().map(Some))
            .collect::<Result<Vec<_>, _>>()?;

        // Presentation is ordered with all work on the queue the swapchain was
        // created for, so swapchain submissions need no extra synchronization.
        unsafe { self.raw.ExecuteCommandLists(&lists) };

        for (fence, value) in submission.signal {
            unsafe { self.raw.Signal(&fence.raw, *value)? };
        }

        Ok(())
    }

    unsafe fn signal(&self, fence: &Dx12Fence, value: u64) -> Result<(), Error> {
        unsafe { self.raw.Signal(&fence.raw, value)? };
        Ok(())
    }

    unsafe fn present(
        &self,
        swapchain: &mut Dx12Swapchain,
        vsync: bool,
    ) -> Result<PresentStatus, Error> {
        let _span = trace_span!("Dx12Queue::present").entered();

        let (interval, flags) = if vsync {
            (1, DXGI_PRESENT(0))
        } else if swapchain.tearing {
            (0, DXGI_PRESENT_ALLOW_TEARING)
        } else {
            (0, DXGI_PRESENT(0))
        };

        // `DXGI_STATUS_OCCLUDED` is a success code. The frame is dropped but the
        // swapchain stays usable.
        unsafe { swapchain.raw.Present(interval, flags).ok()? };

        Ok(PresentStatus::Optimal)
    }
}

#[derive(Debug)]
pub struct Dx12Surface {
    factory: IDXGIFactory4,
    hwnd: HWND,
    tearing: bool,
}

impl Dx12Surface {
    pub(super) fn new(factory: IDXGIFactory4, hwnd: HWND) -> Result<Self, Error> {
        let tearing = factory
            .cast::<IDXGIFactory5>()
            .map(|factory| {
                let mut allowed = BOOL::default();
                let res = unsafe {
                    factory.CheckFeatureSupport(
                        DXGI_FEATURE_PRESENT_ALLOW_TEARING,
                        &mut allowed as *mut BOOL as *mut c_void,
                        size_of::<BOOL>() as u32,
                    )
                };
                res.is_ok() && allowed.as_bool()
            })
            .unwrap_or(false);

        // Fullscreen transitions are left to the window.
        unsafe { factory.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER)? };

        Ok(Self {
            factory,
            hwnd,
            tearing,
        })
    }

    fn flags(&self) -> DXGI_SWAP_CHAIN_FLAG {
        if self.tearing {
            DXGI_SWAP_CHAIN_FLAG_ALLOW_TEARING
        } else {
            DXGI_SWAP_CHAIN_FLAG(0)
        }
    }
}

impl crate::backend::Surface<Dx12> for Dx12Surface {
    fn capabilities(&self, _device: &Dx12Device) -> Result<SurfaceCapabilities, Error> {
        let mut present_modes = vec![PresentMode::Fifo];
        if self.tearing {
            present_modes.push(PresentMode::Immediate);
        }

        Ok(SurfaceCapabilities {
            min_images: MIN_BUFFERS,
            max_images: Some(MAX_BUFFERS),
            // DXGI swapchains take any size and are scaled to the window.
            current_extent: None,
            min_extent: UVec2::ONE,
            max_extent: UVec2::splat(D3D12_REQ_TEXTURE2D_U_OR_V_DIMENSION),
            formats: vec![
                TextureFormat::Bgra8UnormSrgb,
                TextureFormat::Bgra8Unorm,
                TextureFormat::Rgba8UnormSrgb,
                TextureFormat::Rgba8Unorm,
            ],
            present_modes,
        })
    }

    unsafe fn create_swapchain(
        &self,
        _device: &Dx12Device,
        queue: &Dx12Queue,
        config: &SwapchainConfig,
        old: Option<Dx12Swapchain>,
    ) -> Result<Dx12Swapchain, Error> {
        let _span = trace_span!("Dx12Surface::create_swapchain").entered();

        let image_count = config.image_count.clamp(MIN_BUFFERS, MAX_BUFFERS);
        let format = conv::swapchain_format(config.format);

        let raw = match old {
            Some(mut old) => {
                // All references to the back buffers must be released before resizing.
                old.images.clear();

                unsafe {
                    old.raw.ResizeBuffers(
                        image_count,
                        config.extent.x,
                        config.extent.y,
                        format,
                        self.flags(),
                    )?;
                }

                old.raw
            }
            None => {
                let desc = DXGI_SWAP_CHAIN_DESC1 {
                    Width: config.extent.x,
                    Height: config.extent.y,
                    Format: format,
                    Stereo: false.into(),
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                    BufferCount: image_count,
                    Scaling: DXGI_SCALING_STRETCH,
                    SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                    AlphaMode: DXGI_ALPHA_MODE_IGNORE,
                    Flags: self.flags().0 as u32,
                };

                let swapchain = unsafe {
                    self.factory
                        .CreateSwapChainForHwnd(&queue.raw, self.hwnd, &desc, None, None)?
                };
                swapchain.cast::<IDXGISwapChain3>()?
            }
        };

        let usage = TextureUsage::RENDER_TARGET | TextureUsage::TRANSFER_DST;
        let desc = TextureDescriptor::new_2d(config.extent, config.format, usage);

        let mut images = Vec::with_capacity(image_count as usize);
        for index in 0..image_count {
            let buffer: ID3D12Resource = unsafe { raw.GetBuffer(index)? };
            images.push(Dx12Texture::new(buffer, desc));
        }

        tracing::debug!(
            "created swapchain {}x{} with {} images",
            config.extent.x,
            config.extent.y,
            images.len(),
        );

        Ok(Dx12Swapchain {
            raw,
            images,
            config: SwapchainConfig {
                image_count,
                ..*config
            },
            tearing: self.tearing,
        })
    }
}

#[derive(Debug)]
pub struct Dx12Swapchain {
    raw: IDXGISwapChain3,
    images: Vec<Dx12Texture>,
    config: SwapchainConfig,
    tearing: bool,
}

impl crate::backend::Swapchain<Dx12> for Dx12Swapchain {
    fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    fn images(&self) -> &[Dx12Texture] {
        &self.images
    }

    unsafe fn acquire(&mut self) -> Result<AcquiredImage, Error> {
        // The flip model hands out back buffers in order. Waiting for the image is
        // done by the frame fences.
        let index = unsafe { self.raw.GetCurrentBackBufferIndex() };

        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }
}
