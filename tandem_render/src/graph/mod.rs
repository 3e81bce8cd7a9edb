//! Declarative frame graph.
//!
//! A [`FrameGraphDescription`] lists passes with the resources they read and write.
//! [`FrameGraphBuilder::compile`] resolves every input to the single pass producing it
//! and orders the passes so that producers run before their consumers. The graph then
//! owns the attachments and buffers flowing between passes and records the layout
//! transitions around every pass, so passes only record their own draws.

mod ctx;
mod scheduler;

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};

use glam::UVec2;
use tandem_tracing::trace_span;

use crate::backend::{
    Api, BufferBarrier, BufferState, BufferUsage, ColorAttachment, CommandEncoder,
    DepthAttachment, DescriptorKind, DescriptorWrite, LoadOp, MemoryLocation,
    RenderPassDescriptor, ScissorRect, StoreOp, TextureDescriptor, TextureFormat,
    TextureLayout, TextureUsage, Viewport,
};
use crate::descriptors::DescriptorHandle;
use crate::device::RenderDevice;
use crate::error::{GraphError, Result};
use crate::pipeline::PipelineCacheDir;
use crate::resources::{Buffer, ResourceAllocator, Texture};
use crate::shader::{ShaderCache, ShaderKey};
use crate::swapchain::{Backbuffer, DEPTH_FORMAT};

pub use ctx::{PassContext, SetupContext};
pub use scheduler::topological_sort;

/// Name of the output bound to the acquired swapchain image.
pub const BACKBUFFER: &str = "backbuffer";
/// Name of the output bound to the depth buffer of the swapchain.
pub const BACKBUFFER_DEPTH: &str = "backbuffer_depth";

/// Work recorded by one node of the frame graph.
///
/// The graph sets viewport and scissor, records the barriers and begins the render
/// pass over the declared outputs before [`pre_render`]. It ends the render pass
/// after [`post_render`].
///
/// [`pre_render`]: Self::pre_render
/// [`post_render`]: Self::post_render
pub trait RenderPass<A: Api>: 'static {
    /// Creates pipelines and per-frame resources.
    fn setup(&mut self, ctx: &mut SetupContext<'_, A>) -> Result<()>;

    fn pre_render(&mut self, _ctx: &mut PassContext<'_, A>) -> Result<()> {
        Ok(())
    }

    fn render(&mut self, ctx: &mut PassContext<'_, A>) -> Result<()>;

    fn post_render(&mut self, _ctx: &mut PassContext<'_, A>) -> Result<()> {
        Ok(())
    }

    /// Rebuilds the pipelines using any of the `changed` shaders.
    fn reload(&mut self, _ctx: &mut SetupContext<'_, A>, _changed: &[ShaderKey]) -> Result<()> {
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AttachmentLoad {
    Clear(ClearValue),
    Load,
    DontCare,
}

impl AttachmentLoad {
    pub const CLEAR_BLACK: Self = Self::Clear(ClearValue::Color([0.0, 0.0, 0.0, 1.0]));
    pub const CLEAR_TRANSPARENT: Self = Self::Clear(ClearValue::Color([0.0; 4]));
    pub const CLEAR_DEPTH: Self = Self::Clear(ClearValue::Depth(1.0));

    fn color(self) -> LoadOp<[f32; 4]> {
        match self {
            Self::Clear(ClearValue::Color(color)) => LoadOp::Clear(color),
            Self::Clear(ClearValue::Depth(depth)) => LoadOp::Clear([depth; 4]),
            Self::Load => LoadOp::Load,
            Self::DontCare => LoadOp::DontCare,
        }
    }

    fn depth(self) -> LoadOp<f32> {
        match self {
            Self::Clear(ClearValue::Depth(depth)) => LoadOp::Clear(depth),
            Self::Clear(ClearValue::Color(color)) => LoadOp::Clear(color[0]),
            Self::Load => LoadOp::Load,
            Self::DontCare => LoadOp::DontCare,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AttachmentExtent {
    Fixed(UVec2),
    /// The extent of the swapchain. Reallocated on resize.
    Swapchain,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AttachmentDesc {
    pub format: TextureFormat,
    pub extent: AttachmentExtent,
    pub load: AttachmentLoad,
}

impl AttachmentDesc {
    pub fn new(format: TextureFormat, extent: AttachmentExtent, load: AttachmentLoad) -> Self {
        Self {
            format,
            extent,
            load,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OutputKind {
    Attachment(AttachmentDesc),
    Buffer(BufferDesc),
    Backbuffer(AttachmentLoad),
    BackbufferDepth(AttachmentLoad),
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutputDesc {
    pub name: String,
    pub kind: OutputKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum InputRef {
    Attachment(String),
    Buffer(String),
}

impl InputRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Attachment(name) | Self::Buffer(name) => name,
        }
    }
}

/// A pass with the resources it reads and writes.
#[derive(Clone, Debug, PartialEq)]
pub struct PassDesc {
    pub name: String,
    pub inputs: Vec<InputRef>,
    pub outputs: Vec<OutputDesc>,
}

impl PassDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn read_attachment(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputRef::Attachment(name.into()));
        self
    }

    pub fn read_buffer(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputRef::Buffer(name.into()));
        self
    }

    pub fn write_attachment(mut self, name: impl Into<String>, desc: AttachmentDesc) -> Self {
        self.outputs.push(OutputDesc {
            name: name.into(),
            kind: OutputKind::Attachment(desc),
        });
        self
    }

    pub fn write_buffer(mut self, name: impl Into<String>, desc: BufferDesc) -> Self {
        self.outputs.push(OutputDesc {
            name: name.into(),
            kind: OutputKind::Buffer(desc),
        });
        self
    }

    pub fn write_backbuffer(mut self, load: AttachmentLoad) -> Self {
        self.outputs.push(OutputDesc {
            name: BACKBUFFER.to_owned(),
            kind: OutputKind::Backbuffer(load),
        });
        self
    }

    pub fn write_backbuffer_depth(mut self, load: AttachmentLoad) -> Self {
        self.outputs.push(OutputDesc {
            name: BACKBUFFER_DEPTH.to_owned(),
            kind: OutputKind::BackbufferDepth(load),
        });
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameGraphDescription {
    pub passes: Vec<PassDesc>,
}

impl FrameGraphDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pass(mut self, pass: PassDesc) -> Self {
        self.passes.push(pass);
        self
    }
}

/// Properties of the swapchain the graph renders to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphTarget {
    pub extent: UVec2,
    pub format: TextureFormat,
}

/// Maps pass names to their implementation.
pub struct FrameGraphBuilder<A: Api> {
    passes: HashMap<String, Box<dyn RenderPass<A>>>,
}

impl<A: Api> FrameGraphBuilder<A> {
    pub fn new() -> Self {
        Self {
            passes: HashMap::new(),
        }
    }

    pub fn register<P>(&mut self, name: impl Into<String>, pass: P) -> &mut Self
    where
        P: RenderPass<A>,
    {
        self.passes.insert(name.into(), Box::new(pass));
        self
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.passes.contains_key(name)
    }

    /// Resolves the resources of `desc` and orders its passes.
    ///
    /// No GPU resources are created. Passes without a node in `desc` are dropped.
    pub fn compile(mut self, desc: &FrameGraphDescription) -> Result<FrameGraph<A>, GraphError> {
        let _span = trace_span!("FrameGraphBuilder::compile").entered();

        let mut nodes: Vec<GraphNode<A>> = Vec::with_capacity(desc.passes.len());
        for pass in &desc.passes {
            if nodes.iter().any(|node| node.name == pass.name) {
                return Err(GraphError::DuplicatePass(pass.name.clone()));
            }

            let imp = self
                .passes
                .remove(&pass.name)
                .ok_or_else(|| GraphError::UnregisteredPass(pass.name.clone()))?;

            nodes.push(GraphNode {
                name: pass.name.clone(),
                pass: imp,
                inputs: Vec::new(),
                outputs: Vec::new(),
                children: Vec::new(),
            });
        }

        let mut resources = Vec::new();
        let mut by_name: HashMap<&str, usize> = HashMap::new();
        for (index, pass) in desc.passes.iter().enumerate() {
            for output in &pass.outputs {
                if by_name.contains_key(output.name.as_str()) {
                    return Err(GraphError::DuplicateOutput(output.name.clone()));
                }

                by_name.insert(&output.name, resources.len());
                nodes[index].outputs.push(resources.len());
                resources.push(GraphResource {
                    name: output.name.clone(),
                    producer: index,
                    kind: output.kind,
                    allocation: Allocation::None,
                });
            }
        }

        for (index, pass) in desc.passes.iter().enumerate() {
            for input in &pass.inputs {
                let id = by_name
                    .get(input.name())
                    .copied()
                    .filter(|id| resources[*id].kind.matches(input))
                    .ok_or_else(|| GraphError::UnresolvedInput(input.name().to_owned()))?;

                nodes[index].inputs.push(id);
            }
        }

        for index in 0..nodes.len() {
            for input in 0..nodes[index].inputs.len() {
                let producer = resources[nodes[index].inputs[input]].producer;
                let children = &mut nodes[producer].children;
                if !children.contains(&index) {
                    children.push(index);
                }
            }
        }

        let children: Vec<_> = nodes.iter().map(|node| node.children.clone()).collect();
        let sorted = topological_sort(&children)?;

        if !self.passes.is_empty() {
            let mut unused: Vec<_> = self.passes.keys().collect();
            unused.sort();
            tracing::debug!("passes not used by the graph: {:?}", unused);
        }

        Ok(FrameGraph {
            nodes,
            resources,
            sorted,
            target: None,
        })
    }

    /// Compiles `desc`, allocates its resources and sets up every pass.
    pub fn build(
        self,
        desc: &FrameGraphDescription,
        env: &mut GraphEnv<'_, A>,
    ) -> Result<FrameGraph<A>> {
        let mut graph = self.compile(desc)?;
        graph.allocate(env.device, env.target)?;
        graph.setup(env)?;
        Ok(graph)
    }
}

impl<A: Api> Default for FrameGraphBuilder<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything passes need to create their pipelines.
pub struct GraphEnv<'a, A: Api> {
    pub device: &'a RenderDevice<A>,
    pub shaders: &'a mut ShaderCache,
    pub pipeline_cache: &'a PipelineCacheDir,
    pub frames_in_flight: usize,
    pub target: GraphTarget,
}

pub struct GraphNode<A: Api> {
    name: String,
    pass: Box<dyn RenderPass<A>>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    children: Vec<usize>,
}

impl<A: Api> GraphNode<A> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Indices of the nodes reading an output of this node.
    pub fn children(&self) -> &[usize] {
        &self.children
    }
}

impl<A: Api> Debug for GraphNode<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl OutputKind {
    fn matches(&self, input: &InputRef) -> bool {
        match input {
            InputRef::Attachment(_) => !matches!(self, Self::Buffer(_)),
            InputRef::Buffer(_) => matches!(self, Self::Buffer(_)),
        }
    }
}

pub(crate) struct GraphResource<A: Api> {
    name: String,
    producer: usize,
    kind: OutputKind,
    allocation: Allocation<A>,
}

pub(crate) enum Allocation<A: Api> {
    None,
    Texture {
        descriptor: DescriptorHandle<A>,
        view: A::TextureView,
        texture: Texture<A>,
    },
    Buffer {
        buffer: Buffer<A>,
        state: BufferState,
    },
}

pub struct FrameGraph<A: Api> {
    nodes: Vec<GraphNode<A>>,
    resources: Vec<GraphResource<A>>,
    sorted: Vec<usize>,
    target: Option<GraphTarget>,
}

impl<A: Api> FrameGraph<A> {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode<A>> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Nodes in execution order.
    pub fn sorted_nodes(&self) -> impl Iterator<Item = &GraphNode<A>> + '_ {
        self.sorted.iter().map(|index| &self.nodes[*index])
    }

    pub fn sorted_names(&self) -> Vec<&str> {
        self.sorted_nodes().map(|node| node.name()).collect()
    }

    /// Returns the texture allocated for the attachment `name`.
    pub fn attachment(&self, name: &str) -> Option<&Texture<A>> {
        self.resources
            .iter()
            .find(|resource| resource.name == name)
            .and_then(|resource| match &resource.allocation {
                Allocation::Texture { texture, .. } => Some(texture),
                _ => None,
            })
    }

    pub fn buffer(&self, name: &str) -> Option<&Buffer<A>> {
        self.resources
            .iter()
            .find(|resource| resource.name == name)
            .and_then(|resource| match &resource.allocation {
                Allocation::Buffer { buffer, .. } => Some(buffer),
                _ => None,
            })
    }

    pub fn target(&self) -> Option<GraphTarget> {
        self.target
    }

    /// Creates the attachments and buffers of all outputs.
    pub fn allocate(&mut self, device: &RenderDevice<A>, target: GraphTarget) -> Result<()> {
        let _span = trace_span!("FrameGraph::allocate").entered();

        self.target = Some(target);
        for resource in &mut self.resources {
            allocate_resource(device, resource, target, false)?;
        }

        Ok(())
    }

    /// Reallocates attachments whose extent follows the swapchain.
    ///
    /// The GPU must not use any resource of the graph.
    pub fn resize(&mut self, device: &RenderDevice<A>, extent: UVec2) -> Result<()> {
        let _span = trace_span!("FrameGraph::resize").entered();

        let Some(target) = &mut self.target else {
            return Ok(());
        };
        target.extent = extent;
        let target = *target;

        for resource in &mut self.resources {
            allocate_resource(device, resource, target, true)?;
        }

        Ok(())
    }

    /// Calls [`RenderPass::setup`] on every pass in execution order.
    pub fn setup(&mut self, env: &mut GraphEnv<'_, A>) -> Result<()> {
        for index in self.sorted.clone() {
            let mut ctx = self.setup_context(index, env);
            self.nodes[index].pass.setup(&mut ctx)?;
        }

        Ok(())
    }

    /// Lets every pass rebuild pipelines using one of the `changed` shaders.
    pub fn reload(&mut self, env: &mut GraphEnv<'_, A>, changed: &[ShaderKey]) -> Result<()> {
        let _span = trace_span!("FrameGraph::reload").entered();

        for index in self.sorted.clone() {
            let mut ctx = self.setup_context(index, env);
            self.nodes[index].pass.reload(&mut ctx, changed)?;
        }

        Ok(())
    }

    fn setup_context<'a>(&self, index: usize, env: &'a mut GraphEnv<'_, A>) -> SetupContext<'a, A> {
        let mut color_formats = Vec::new();
        let mut depth_format = None;

        for id in &self.nodes[index].outputs {
            match self.resources[*id].kind {
                OutputKind::Attachment(desc) if desc.format.is_depth() => {
                    depth_format = Some(desc.format);
                }
                OutputKind::Attachment(desc) => color_formats.push(desc.format),
                OutputKind::Backbuffer(_) => color_formats.push(env.target.format),
                OutputKind::BackbufferDepth(_) => depth_format = Some(DEPTH_FORMAT),
                OutputKind::Buffer(_) => (),
            }
        }

        SetupContext {
            device: env.device,
            shaders: &mut *env.shaders,
            pipeline_cache: env.pipeline_cache,
            frames_in_flight: env.frames_in_flight,
            color_formats,
            depth_format,
        }
    }

    /// Records all passes in execution order.
    ///
    /// `backbuffer` is the swapchain image bound to [`BACKBUFFER`]. The image is left in
    /// [`TextureLayout::Present`] after the pass writing it.
    pub fn render(
        &mut self,
        device: &RenderDevice<A>,
        encoder: &mut A::CommandEncoder,
        frame_slot: usize,
        mut backbuffer: Option<Backbuffer<'_, A>>,
    ) -> Result<()> {
        let _span = trace_span!("FrameGraph::render").entered();

        let fallback_extent = self.target.map_or(UVec2::ZERO, |target| target.extent);

        for &index in &self.sorted {
            let node = &mut self.nodes[index];

            barriers_in(encoder, &mut self.resources, node, backbuffer.as_mut());

            let resources = &self.resources;
            let extent = output_extent(resources, node, backbuffer.as_ref())
                .unwrap_or(fallback_extent);

            encoder.set_viewport(&Viewport::from_extent(extent));
            encoder.set_scissor(&ScissorRect::from_extent(extent));

            let in_pass = begin_render_pass(encoder, resources, node, backbuffer.as_ref(), extent);

            let mut ctx = PassContext {
                device,
                encoder: &mut *encoder,
                frame_slot,
                extent,
                resources,
                inputs: &node.inputs,
                outputs: &node.outputs,
            };

            let res = node
                .pass
                .pre_render(&mut ctx)
                .and_then(|()| node.pass.render(&mut ctx))
                .and_then(|()| node.pass.post_render(&mut ctx));

            // The render pass is closed even if the pass failed so that the encoder
            // can still be ended.
            if in_pass {
                encoder.end_render_pass();
            }
            res?;

            for id in &node.outputs {
                if let (OutputKind::Backbuffer(_), Some(backbuffer)) =
                    (resources[*id].kind, backbuffer.as_mut())
                {
                    backbuffer.transition(encoder, TextureLayout::Present);
                }
            }
        }

        Ok(())
    }
}

impl<A: Api> Debug for FrameGraph<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGraph")
            .field("nodes", &self.nodes)
            .field("sorted", &self.sorted)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

fn attachment_extent(desc: &AttachmentDesc, target: GraphTarget) -> UVec2 {
    match desc.extent {
        AttachmentExtent::Fixed(extent) => extent,
        AttachmentExtent::Swapchain => target.extent,
    }
}

fn allocate_resource<A: Api>(
    device: &RenderDevice<A>,
    resource: &mut GraphResource<A>,
    target: GraphTarget,
    only_relative: bool,
) -> Result<()> {
    match resource.kind {
        OutputKind::Attachment(desc) => {
            if only_relative && desc.extent != AttachmentExtent::Swapchain {
                return Ok(());
            }

            // Drop the old attachment before creating the new one.
            resource.allocation = Allocation::None;

            let extent = attachment_extent(&desc, target);
            if extent.x == 0 || extent.y == 0 {
                return Ok(());
            }

            let usage = if desc.format.is_depth() {
                TextureUsage::DEPTH_STENCIL | TextureUsage::SAMPLED
            } else {
                TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED
            };

            let texture = ResourceAllocator::<A>::new(device.raw())
                .create_texture(&TextureDescriptor::new_2d(extent, desc.format, usage))?;
            let view = texture.create_full_view(device.raw())?;
            let descriptor = device.allocate_descriptor(DescriptorKind::SampledImage)?;
            descriptor.write(device.raw(), &DescriptorWrite::SampledTexture(&view));

            tracing::debug!(
                "allocated attachment {} ({}x{} {:?})",
                resource.name,
                extent.x,
                extent.y,
                desc.format
            );

            resource.allocation = Allocation::Texture {
                descriptor,
                view,
                texture,
            };
        }
        OutputKind::Buffer(desc) => {
            if only_relative {
                return Ok(());
            }

            let buffer = ResourceAllocator::<A>::new(device.raw()).create_buffer(
                desc.size,
                desc.usage | BufferUsage::STORAGE,
                MemoryLocation::DeviceLocal,
            )?;
            resource.allocation = Allocation::Buffer {
                buffer,
                state: BufferState::Common,
            };
        }
        OutputKind::Backbuffer(_) | OutputKind::BackbufferDepth(_) => (),
    }

    Ok(())
}

fn output_extent<A: Api>(
    resources: &[GraphResource<A>],
    node: &GraphNode<A>,
    backbuffer: Option<&Backbuffer<'_, A>>,
) -> Option<UVec2> {
    node.outputs.iter().find_map(|id| match &resources[*id].allocation {
        Allocation::Texture { texture, .. } => Some(texture.size()),
        _ => match resources[*id].kind {
            OutputKind::Backbuffer(_) | OutputKind::BackbufferDepth(_) => {
                backbuffer.map(|backbuffer| backbuffer.extent)
            }
            _ => None,
        },
    })
}

fn barriers_in<A: Api>(
    encoder: &mut A::CommandEncoder,
    resources: &mut [GraphResource<A>],
    node: &GraphNode<A>,
    mut backbuffer: Option<&mut Backbuffer<'_, A>>,
) {
    let accesses = node
        .inputs
        .iter()
        .map(|id| (*id, false))
        .chain(node.outputs.iter().map(|id| (*id, true)));

    for (id, write) in accesses {
        let resource = &mut resources[id];
        match (&mut resource.allocation, resource.kind) {
            (Allocation::Texture { texture, .. }, _) => {
                let layout = match (write, texture.format().is_depth()) {
                    (false, _) => TextureLayout::ShaderRead,
                    (true, false) => TextureLayout::ColorAttachment,
                    (true, true) => TextureLayout::DepthAttachment,
                };
                texture.transition(encoder, layout);
            }
            (Allocation::Buffer { buffer, state }, _) => {
                let dst = if write {
                    BufferState::ShaderWrite
                } else {
                    BufferState::ShaderRead
                };

                if *state != dst {
                    encoder.buffer_barriers(&[BufferBarrier {
                        buffer: buffer.raw(),
                        src: *state,
                        dst,
                    }]);
                    *state = dst;
                }
            }
            (Allocation::None, OutputKind::Backbuffer(_)) => {
                if let Some(backbuffer) = backbuffer.as_deref_mut() {
                    let layout = if write {
                        TextureLayout::ColorAttachment
                    } else {
                        TextureLayout::ShaderRead
                    };
                    backbuffer.transition(encoder, layout);
                }
            }
            (Allocation::None, OutputKind::BackbufferDepth(_)) => {
                if let Some((depth, _)) = backbuffer
                    .as_deref_mut()
                    .and_then(|backbuffer| backbuffer.depth.as_mut())
                {
                    depth.transition(encoder, TextureLayout::DepthAttachment);
                }
            }
            (Allocation::None, _) => (),
        }
    }
}

/// Begins a render pass over the attachment outputs of `node`.
///
/// Returns `false` if the node has no attachment outputs.
fn begin_render_pass<A: Api>(
    encoder: &mut A::CommandEncoder,
    resources: &[GraphResource<A>],
    node: &GraphNode<A>,
    backbuffer: Option<&Backbuffer<'_, A>>,
    extent: UVec2,
) -> bool {
    let mut color_attachments = Vec::new();
    let mut depth_attachment = None;

    for id in &node.outputs {
        let resource = &resources[*id];
        match (&resource.allocation, resource.kind) {
            (Allocation::Texture { view, texture, .. }, OutputKind::Attachment(desc)) => {
                if texture.format().is_depth() {
                    depth_attachment = Some(DepthAttachment {
                        view,
                        load_op: desc.load.depth(),
                        store_op: StoreOp::Store,
                    });
                } else {
                    color_attachments.push(ColorAttachment {
                        view,
                        load_op: desc.load.color(),
                        store_op: StoreOp::Store,
                    });
                }
            }
            (Allocation::None, OutputKind::Backbuffer(load)) => {
                if let Some(backbuffer) = backbuffer {
                    color_attachments.push(ColorAttachment {
                        view: backbuffer.view,
                        load_op: load.color(),
                        store_op: StoreOp::Store,
                    });
                }
            }
            (Allocation::None, OutputKind::BackbufferDepth(load)) => {
                if let Some((_, view)) = backbuffer.and_then(|backbuffer| backbuffer.depth.as_ref())
                {
                    depth_attachment = Some(DepthAttachment {
                        view: *view,
                        load_op: load.depth(),
                        store_op: StoreOp::Store,
                    });
                }
            }
            _ => (),
        }
    }

    if color_attachments.is_empty() && depth_attachment.is_none() {
        return false;
    }

    encoder.begin_render_pass(&RenderPassDescriptor {
        label: &node.name,
        extent,
        color_attachments: &color_attachments,
        depth_attachment,
    });
    true
}

#[cfg(test)]
mod tests;
