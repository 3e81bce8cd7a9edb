//! Contract between the renderer and the windowing system.

use std::fmt::Debug;

use glam::UVec2;
use parking_lot::Mutex;
use raw_window_handle::{
    RawDisplayHandle, RawWindowHandle, WebDisplayHandle, WebWindowHandle,
};

use crate::error::{Error, Result};

/// A window the renderer presents to.
///
/// The native handles must stay valid as long as the value is alive.
pub trait WindowSurface: Debug + Send + Sync {
    fn raw_display_handle(&self) -> Result<RawDisplayHandle>;

    fn raw_window_handle(&self) -> Result<RawWindowHandle>;

    /// Size of the drawable area in physical pixels.
    fn framebuffer_size(&self) -> UVec2;
}

/// A window without a native surface. Only usable with the null backend.
#[derive(Debug)]
pub struct HeadlessWindow {
    size: Mutex<UVec2>,
}

impl HeadlessWindow {
    pub fn new(size: UVec2) -> Self {
        Self {
            size: Mutex::new(size),
        }
    }

    pub fn set_size(&self, size: UVec2) {
        *self.size.lock() = size;
    }
}

impl WindowSurface for HeadlessWindow {
    fn raw_display_handle(&self) -> Result<RawDisplayHandle> {
        Ok(RawDisplayHandle::Web(WebDisplayHandle::new()))
    }

    fn raw_window_handle(&self) -> Result<RawWindowHandle> {
        Ok(RawWindowHandle::Web(WebWindowHandle::new(1)))
    }

    fn framebuffer_size(&self) -> UVec2 {
        *self.size.lock()
    }
}

/// Converts a handle error of the windowing system.
pub fn handle_error(err: raw_window_handle::HandleError) -> Error {
    Error::Backend(format!("window handle unavailable: {}", err))
}
