//! Renderer core running on Direct3D 12 or Vulkan.
//!
//! The [`backend`] module abstracts the graphics API. Everything above it is written
//! once against [`backend::Api`]: descriptor pools, the staging engine, the shader and
//! pipeline caches, the swapchain, the submission ring and the frame graph with its
//! passes. [`renderer::Renderer`] ties them together.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod config;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
pub mod graph;
pub mod mesh;
pub mod passes;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod shader;
pub mod staging;
pub mod swapchain;
pub mod texture;
pub mod ui;
pub mod window;

pub use config::RendererConfig;
pub use error::{AssetError, Error, GraphError, Result, ShaderCompileError};
pub use renderer::{AnyRenderer, Renderer};

#[cfg(test)]
pub(crate) mod test_util {
    use crate::backend::null::{Null, NullAdapterDesc, NullDevice, NullInstance};
    use crate::backend::{Adapter, Instance};
    use crate::config::DescriptorCapacities;
    use crate::device::{RenderDevice, DEFAULT_DEVICE_DESCRIPTOR};

    /// Opens the default null adapter.
    pub fn null_device() -> NullDevice {
        NullInstance::with_adapters(vec![NullAdapterDesc::default()])
            .adapters()
            .unwrap()
            .remove(0)
            .open(&DEFAULT_DEVICE_DESCRIPTOR)
            .unwrap()
            .device
    }

    pub fn render_device() -> RenderDevice<Null> {
        render_device_with(NullAdapterDesc::default())
    }

    pub fn render_device_with(desc: NullAdapterDesc) -> RenderDevice<Null> {
        let adapter = NullInstance::with_adapters(vec![desc])
            .adapters()
            .unwrap()
            .remove(0);
        RenderDevice::from_adapter(adapter, 0, &DescriptorCapacities::default()).unwrap()
    }
}
