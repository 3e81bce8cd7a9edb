use std::sync::Arc;

use glam::UVec2;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use tandem_render::window::{handle_error, WindowSurface};
use winit::window::Window;

/// A winit window presented to by the renderer.
#[derive(Debug)]
pub struct ViewerWindow {
    window: Arc<Window>,
}

impl ViewerWindow {
    pub fn new(window: Arc<Window>) -> Self {
        Self { window }
    }
}

impl WindowSurface for ViewerWindow {
    fn raw_display_handle(&self) -> tandem_render::Result<RawDisplayHandle> {
        self.window
            .display_handle()
            .map(|handle| handle.as_raw())
            .map_err(handle_error)
    }

    fn raw_window_handle(&self) -> tandem_render::Result<RawWindowHandle> {
        self.window
            .window_handle()
            .map(|handle| handle.as_raw())
            .map_err(handle_error)
    }

    fn framebuffer_size(&self) -> UVec2 {
        let size = self.window.inner_size();
        UVec2::new(size.width, size.height)
    }
}
