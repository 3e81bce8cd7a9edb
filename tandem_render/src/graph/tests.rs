use std::sync::Arc;

use glam::UVec2;
use parking_lot::Mutex;

use crate::backend::null::{Null, NullCommand, NullCommandEncoder};
use crate::backend::{
    CommandEncoder, CommandPool, Device, QueueKind, ShaderTarget, TextureFormat, TextureLayout,
};
use crate::device::RenderDevice;
use crate::error::{GraphError, Result};
use crate::pipeline::PipelineCacheDir;
use crate::shader::{ShaderCache, ShaderCompiler};
use crate::test_util::render_device;

use super::{
    AttachmentDesc, AttachmentExtent, AttachmentLoad, BufferDesc, FrameGraph, FrameGraphBuilder,
    FrameGraphDescription, GraphEnv, GraphTarget, PassContext, PassDesc, RenderPass,
    SetupContext,
};

type Log = Arc<Mutex<Vec<String>>>;

/// Records its name into a shared log whenever a method is called.
struct Recorder {
    name: &'static str,
    log: Log,
    /// Inputs that must resolve to a texture descriptor while rendering.
    expect_inputs: Vec<&'static str>,
}

impl Recorder {
    fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: log.clone(),
            expect_inputs: Vec::new(),
        }
    }

    fn expecting(mut self, input: &'static str) -> Self {
        self.expect_inputs.push(input);
        self
    }
}

impl RenderPass<Null> for Recorder {
    fn setup(&mut self, ctx: &mut SetupContext<'_, Null>) -> Result<()> {
        assert!(ctx.frames_in_flight > 0);
        self.log.lock().push(format!("setup {}", self.name));
        Ok(())
    }

    fn render(&mut self, ctx: &mut PassContext<'_, Null>) -> Result<()> {
        for input in &self.expect_inputs {
            let descriptor = ctx.input_texture(input).unwrap();
            assert!(!descriptor.is_empty());
        }

        self.log.lock().push(self.name.to_owned());
        Ok(())
    }
}

fn color(size: u32) -> AttachmentDesc {
    AttachmentDesc::new(
        TextureFormat::Rgba8Unorm,
        AttachmentExtent::Fixed(UVec2::splat(size)),
        AttachmentLoad::CLEAR_BLACK,
    )
}

fn target() -> GraphTarget {
    GraphTarget {
        extent: UVec2::new(640, 480),
        format: TextureFormat::Bgra8UnormSrgb,
    }
}

fn build(
    device: &RenderDevice<Null>,
    builder: FrameGraphBuilder<Null>,
    desc: &FrameGraphDescription,
) -> FrameGraph<Null> {
    let dir = tempfile::tempdir().unwrap();
    let mut shaders = ShaderCache::new(ShaderCompiler::new(dir.path(), ShaderTarget::SpirV, false));
    let pipeline_cache = PipelineCacheDir::disabled();

    let mut env = GraphEnv {
        device,
        shaders: &mut shaders,
        pipeline_cache: &pipeline_cache,
        frames_in_flight: 3,
        target: target(),
    };
    builder.build(desc, &mut env).unwrap()
}

fn encoder(device: &RenderDevice<Null>) -> NullCommandEncoder {
    let mut pool = device.raw().create_command_pool(QueueKind::Graphics).unwrap();
    let mut encoder = pool.create_encoder().unwrap();
    unsafe {
        encoder.begin().unwrap();
    }
    encoder
}

fn compile_err(builder: FrameGraphBuilder<Null>, desc: &FrameGraphDescription) -> GraphError {
    builder.compile(desc).unwrap_err()
}

#[test]
fn empty_graph_records_nothing() {
    let device = render_device();
    let mut graph = build(&device, FrameGraphBuilder::new(), &FrameGraphDescription::new());
    assert!(graph.is_empty());

    let mut encoder = encoder(&device);
    graph.render(&device, &mut encoder, 0, None).unwrap();
    assert!(encoder.commands().is_empty());
}

#[test]
fn chain_runs_producer_first() {
    let device = render_device();
    let log = Log::default();

    let mut builder = FrameGraphBuilder::new();
    builder
        .register("A", Recorder::new("A", &log))
        .register("B", Recorder::new("B", &log).expecting("x"));

    // Declared consumer first.
    let desc = FrameGraphDescription::new()
        .pass(
            PassDesc::new("B")
                .read_attachment("x")
                .write_attachment("y", color(64)),
        )
        .pass(PassDesc::new("A").write_attachment("x", color(512)));

    let mut graph = build(&device, builder, &desc);
    assert_eq!(graph.sorted_names(), ["A", "B"]);
    assert_eq!(graph.attachment("x").unwrap().size(), UVec2::new(512, 512));
    assert_eq!(graph.node("A").unwrap().children().len(), 1);

    let mut encoder = encoder(&device);
    graph.render(&device, &mut encoder, 0, None).unwrap();
    assert_eq!(*log.lock(), ["setup A", "setup B", "A", "B"]);

    let x = graph.attachment("x").unwrap();
    assert_eq!(x.layout(), TextureLayout::ShaderRead);

    let commands = encoder.commands();
    let labels: Vec<_> = commands
        .iter()
        .filter_map(|command| match command {
            NullCommand::BeginRenderPass { label, extent, .. } => Some((label.as_str(), *extent)),
            _ => None,
        })
        .collect();
    assert_eq!(
        labels,
        [("A", UVec2::splat(512)), ("B", UVec2::splat(64))]
    );

    assert!(matches!(commands[0], NullCommand::TextureBarrier { .. }));
    let viewports: Vec<_> = commands
        .iter()
        .filter_map(|command| match command {
            NullCommand::SetViewport(viewport) => Some(viewport.width),
            _ => None,
        })
        .collect();
    assert_eq!(viewports, [512.0, 64.0]);

    let x_barriers: Vec<_> = commands
        .iter()
        .filter_map(|command| match command {
            NullCommand::TextureBarrier { src, dst, .. } => Some((*src, *dst)),
            _ => None,
        })
        .collect();
    assert_eq!(
        x_barriers,
        [
            (TextureLayout::Undefined, TextureLayout::ColorAttachment),
            (TextureLayout::ColorAttachment, TextureLayout::ShaderRead),
            (TextureLayout::Undefined, TextureLayout::ColorAttachment),
        ]
    );
}

#[test]
fn diamond_orders_source_and_sink() {
    let device = render_device();
    let log = Log::default();

    let mut builder = FrameGraphBuilder::new();
    for name in ["A", "B", "C", "D"] {
        builder.register(name, Recorder::new(name, &log));
    }

    let desc = FrameGraphDescription::new()
        .pass(
            PassDesc::new("D")
                .read_attachment("b")
                .read_attachment("c")
                .write_attachment("d", color(8)),
        )
        .pass(
            PassDesc::new("C")
                .read_attachment("a")
                .write_attachment("c", color(8)),
        )
        .pass(
            PassDesc::new("B")
                .read_attachment("a")
                .write_attachment("b", color(8)),
        )
        .pass(PassDesc::new("A").write_attachment("a", color(8)));

    let mut graph = build(&device, builder, &desc);
    let order = graph.sorted_names();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], "A");
    assert_eq!(order[3], "D");

    let mut encoder = encoder(&device);
    graph.render(&device, &mut encoder, 1, None).unwrap();
    let log = log.lock();
    assert_eq!(log.iter().filter(|entry| !entry.starts_with("setup")).count(), 4);
}

#[test]
fn duplicate_output_is_rejected() {
    let log = Log::default();
    let mut builder = FrameGraphBuilder::new();
    builder
        .register("gbuffer", Recorder::new("gbuffer", &log))
        .register("decals", Recorder::new("decals", &log));

    let desc = FrameGraphDescription::new()
        .pass(PassDesc::new("gbuffer").write_attachment("albedo", color(4)))
        .pass(PassDesc::new("decals").write_attachment("albedo", color(4)));

    assert_eq!(
        compile_err(builder, &desc),
        GraphError::DuplicateOutput("albedo".to_owned())
    );
}

#[test]
fn duplicate_pass_is_rejected() {
    let log = Log::default();
    let mut builder = FrameGraphBuilder::new();
    builder.register("gbuffer", Recorder::new("gbuffer", &log));

    let desc = FrameGraphDescription::new()
        .pass(PassDesc::new("gbuffer").write_attachment("albedo", color(4)))
        .pass(PassDesc::new("gbuffer").write_attachment("normals", color(4)));

    assert_eq!(
        compile_err(builder, &desc),
        GraphError::DuplicatePass("gbuffer".to_owned())
    );
}

#[test]
fn unresolved_input_is_rejected() {
    let log = Log::default();
    let mut builder = FrameGraphBuilder::new();
    builder.register("ssao", Recorder::new("ssao", &log));

    let desc = FrameGraphDescription::new().pass(
        PassDesc::new("ssao")
            .read_attachment("depth")
            .write_attachment("occlusion", color(4)),
    );

    assert_eq!(
        compile_err(builder, &desc),
        GraphError::UnresolvedInput("depth".to_owned())
    );
}

#[test]
fn input_kind_must_match_output() {
    let log = Log::default();
    let mut builder = FrameGraphBuilder::new();
    builder
        .register("cull", Recorder::new("cull", &log))
        .register("draw", Recorder::new("draw", &log));

    let desc = FrameGraphDescription::new()
        .pass(PassDesc::new("cull").write_buffer(
            "visible",
            BufferDesc {
                size: 256,
                usage: crate::backend::BufferUsage::STORAGE,
            },
        ))
        .pass(
            PassDesc::new("draw")
                .read_attachment("visible")
                .write_attachment("out", color(4)),
        );

    assert_eq!(
        compile_err(builder, &desc),
        GraphError::UnresolvedInput("visible".to_owned())
    );
}

#[test]
fn unregistered_pass_is_rejected() {
    let desc = FrameGraphDescription::new().pass(PassDesc::new("bloom"));
    assert_eq!(
        compile_err(FrameGraphBuilder::new(), &desc),
        GraphError::UnregisteredPass("bloom".to_owned())
    );
}

#[test]
fn cycle_is_rejected() {
    let log = Log::default();
    let mut builder = FrameGraphBuilder::new();
    builder
        .register("A", Recorder::new("A", &log))
        .register("B", Recorder::new("B", &log));

    let desc = FrameGraphDescription::new()
        .pass(
            PassDesc::new("A")
                .read_attachment("b")
                .write_attachment("a", color(4)),
        )
        .pass(
            PassDesc::new("B")
                .read_attachment("a")
                .write_attachment("b", color(4)),
        );

    assert_eq!(compile_err(builder, &desc), GraphError::CyclicGraph);
}

#[test]
fn resize_reallocates_relative_attachments() {
    let device = render_device();
    let log = Log::default();

    let mut builder = FrameGraphBuilder::new();
    builder.register("A", Recorder::new("A", &log));

    let desc = FrameGraphDescription::new().pass(
        PassDesc::new("A")
            .write_attachment(
                "relative",
                AttachmentDesc::new(
                    TextureFormat::Rgba16Float,
                    AttachmentExtent::Swapchain,
                    AttachmentLoad::CLEAR_TRANSPARENT,
                ),
            )
            .write_attachment(
                "depth",
                AttachmentDesc::new(
                    TextureFormat::Depth32Float,
                    AttachmentExtent::Swapchain,
                    AttachmentLoad::CLEAR_DEPTH,
                ),
            )
            .write_attachment("fixed", color(16)),
    );

    let mut graph = build(&device, builder, &desc);
    assert_eq!(graph.attachment("relative").unwrap().size(), UVec2::new(640, 480));

    graph.resize(&device, UVec2::new(100, 50)).unwrap();
    assert_eq!(graph.attachment("relative").unwrap().size(), UVec2::new(100, 50));
    assert_eq!(graph.attachment("depth").unwrap().size(), UVec2::new(100, 50));
    assert_eq!(graph.attachment("fixed").unwrap().size(), UVec2::splat(16));

    let mut encoder = encoder(&device);
    graph.render(&device, &mut encoder, 0, None).unwrap();
    let pass = encoder
        .commands()
        .iter()
        .find_map(|command| match command {
            NullCommand::BeginRenderPass {
                color_attachments,
                has_depth,
                clears,
                ..
            } => Some((*color_attachments, *has_depth, *clears)),
            _ => None,
        })
        .unwrap();
    assert_eq!(pass, (2, true, 3));
    assert_eq!(
        graph.attachment("depth").unwrap().layout(),
        TextureLayout::DepthAttachment
    );
}
