use glam::UVec2;

use crate::backend::{Api, TextureFormat};
use crate::descriptors::DescriptorHandle;
use crate::device::RenderDevice;
use crate::pipeline::PipelineCacheDir;
use crate::resources::Buffer;
use crate::shader::ShaderCache;

use super::{Allocation, GraphResource};

/// Passed to [`RenderPass::setup`] and [`RenderPass::reload`].
///
/// [`RenderPass::setup`]: super::RenderPass::setup
/// [`RenderPass::reload`]: super::RenderPass::reload
pub struct SetupContext<'a, A: Api> {
    pub device: &'a RenderDevice<A>,
    pub shaders: &'a mut ShaderCache,
    pub pipeline_cache: &'a PipelineCacheDir,
    pub frames_in_flight: usize,
    /// Formats of the color attachments the pass writes, in declaration order.
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
}

/// Passed to the per-frame methods of a [`RenderPass`].
///
/// [`RenderPass`]: super::RenderPass
pub struct PassContext<'a, A: Api> {
    pub device: &'a RenderDevice<A>,
    pub encoder: &'a mut A::CommandEncoder,
    /// Index of the submission context recording the frame.
    pub frame_slot: usize,
    /// Extent of the attachments the pass renders to.
    pub extent: UVec2,
    pub(super) resources: &'a [GraphResource<A>],
    pub(super) inputs: &'a [usize],
    pub(super) outputs: &'a [usize],
}

impl<'a, A: Api> PassContext<'a, A> {
    // Borrows from the graph rather than the context so that `encoder` stays usable.
    fn find(&self, ids: &[usize], name: &str) -> Option<&'a GraphResource<A>> {
        let resources = self.resources;
        ids.iter()
            .map(|id| &resources[*id])
            .find(|resource| resource.name == name)
    }

    /// Returns the sampled-image descriptor of the input attachment `name`.
    pub fn input_texture(&self, name: &str) -> Option<&'a DescriptorHandle<A>> {
        match &self.find(self.inputs, name)?.allocation {
            Allocation::Texture { descriptor, .. } => Some(descriptor),
            _ => None,
        }
    }

    pub fn input_buffer(&self, name: &str) -> Option<&'a Buffer<A>> {
        match &self.find(self.inputs, name)?.allocation {
            Allocation::Buffer { buffer, .. } => Some(buffer),
            _ => None,
        }
    }

    pub fn output_buffer(&self, name: &str) -> Option<&'a Buffer<A>> {
        match &self.find(self.outputs, name)?.allocation {
            Allocation::Buffer { buffer, .. } => Some(buffer),
            _ => None,
        }
    }
}
