use tandem_tracing::trace_span;

use crate::backend::{Api, BlendMode, ColorTarget, CommandEncoder};
use crate::error::{Error, Result};
use crate::graph::{PassContext, RenderPass, SetupContext};
use crate::pipeline::{PipelineBundle, PipelineState};
use crate::shader::{FragmentShader, ShaderKey, VertexShader};

use super::linear_sampler;

const SHADER: &str = "blit";

pub const PIPELINE_LABEL: &str = "image-blit";

/// Copies an attachment to the color target of the pass with a fullscreen triangle.
///
/// The source is sampled, so the target may differ in size and format.
pub struct BlitPass<A: Api> {
    input: &'static str,
    pipeline: Option<PipelineBundle<A>>,
    source_table: u32,
}

impl<A: Api> BlitPass<A> {
    pub fn new(input: &'static str) -> Self {
        Self {
            input,
            pipeline: None,
            source_table: 0,
        }
    }

    pub fn pipeline(&self) -> Option<&PipelineBundle<A>> {
        self.pipeline.as_ref()
    }

    fn build_pipeline(&mut self, ctx: &mut SetupContext<'_, A>) -> Result<()> {
        let vertex = VertexShader::load(ctx.shaders, SHADER, "vs_main")?;
        let fragment = FragmentShader::load(ctx.shaders, SHADER, "fs_main")?;

        // No vertex input, no depth and never wireframe.
        let state = PipelineState {
            color_targets: ctx
                .color_formats
                .iter()
                .map(|format| ColorTarget {
                    format: *format,
                    blend: BlendMode::Replace,
                })
                .collect(),
            ..Default::default()
        };

        let bundle = PipelineBundle::new(
            ctx.device.raw(),
            ctx.pipeline_cache,
            PIPELINE_LABEL,
            &vertex,
            &fragment,
            &state,
            linear_sampler,
        )?;

        self.source_table = bundle.table_index(0, 0).ok_or_else(|| {
            Error::PipelineCreate(format!("{}: shader has no source texture", PIPELINE_LABEL))
        })?;
        self.pipeline = Some(bundle);
        Ok(())
    }
}

impl<A: Api> RenderPass<A> for BlitPass<A> {
    fn setup(&mut self, ctx: &mut SetupContext<'_, A>) -> Result<()> {
        self.build_pipeline(ctx)
    }

    fn render(&mut self, ctx: &mut PassContext<'_, A>) -> Result<()> {
        let _span = trace_span!("BlitPass::render").entered();

        let Some(pipeline) = &self.pipeline else {
            return Ok(());
        };

        let source = ctx.input_texture(self.input).ok_or_else(|| {
            Error::Backend(format!("blit input {} is not an attachment", self.input))
        })?;

        pipeline.bind(ctx.encoder);
        pipeline.set_table(ctx.encoder, self.source_table, source);
        ctx.encoder.draw(3, 1, 0);

        Ok(())
    }

    fn reload(&mut self, ctx: &mut SetupContext<'_, A>, changed: &[ShaderKey]) -> Result<()> {
        if changed.iter().any(|key| key.file == SHADER) {
            let previous = self.pipeline.take();
            if let Err(err) = self.build_pipeline(ctx) {
                tracing::error!("failed to rebuild {}: {}", PIPELINE_LABEL, err);
                self.pipeline = previous;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use glam::UVec2;

    use crate::backend::null::{Null, NullCommand};
    use crate::backend::{CommandEncoder, CommandPool, Device, QueueKind, TextureFormat};
    use crate::graph::{
        AttachmentDesc, AttachmentExtent, AttachmentLoad, FrameGraphBuilder,
        FrameGraphDescription, GraphEnv, PassDesc, RenderPass, SetupContext,
    };
    use crate::passes::tests::{bound_pipelines, shader_cache, target};
    use crate::pipeline::PipelineCacheDir;
    use crate::test_util::render_device;

    use super::BlitPass;

    #[test]
    fn blit_pipeline_layout() {
        let device = render_device();
        let mut shaders = shader_cache();
        let cache = PipelineCacheDir::disabled();

        let mut pass = BlitPass::<Null>::new("source");
        pass.setup(&mut SetupContext {
            device: &device,
            shaders: &mut shaders,
            pipeline_cache: &cache,
            frames_in_flight: 1,
            color_formats: vec![TextureFormat::Bgra8UnormSrgb],
            depth_format: None,
        })
        .unwrap();

        let pipeline = pass.pipeline().unwrap();
        assert_eq!(pipeline.label(), "image-blit");
        assert_eq!(pipeline.tables().len(), 1);
        assert_eq!(pipeline.static_samplers().len(), 1);
    }

    /// A pass that only declares an output.
    struct Produce;

    impl RenderPass<Null> for Produce {
        fn setup(&mut self, _: &mut SetupContext<'_, Null>) -> crate::Result<()> {
            Ok(())
        }

        fn render(&mut self, _: &mut crate::graph::PassContext<'_, Null>) -> crate::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn blit_draws_fullscreen_triangle() {
        let device = render_device();
        let mut builder = FrameGraphBuilder::new();
        builder
            .register("produce", Produce)
            .register("blit", BlitPass::new("image"));

        let desc = FrameGraphDescription::new()
            .pass(PassDesc::new("produce").write_attachment(
                "image",
                AttachmentDesc::new(
                    TextureFormat::Rgba8Unorm,
                    AttachmentExtent::Fixed(UVec2::new(64, 64)),
                    AttachmentLoad::CLEAR_BLACK,
                ),
            ))
            .pass(PassDesc::new("blit").read_attachment("image").write_attachment(
                "copy",
                AttachmentDesc::new(
                    TextureFormat::Rgba8Unorm,
                    AttachmentExtent::Swapchain,
                    AttachmentLoad::DontCare,
                ),
            ));

        let mut shaders = shader_cache();
        let cache = PipelineCacheDir::disabled();
        let mut graph = builder
            .build(
                &desc,
                &mut GraphEnv {
                    device: &device,
                    shaders: &mut shaders,
                    pipeline_cache: &cache,
                    frames_in_flight: 1,
                    target: target(),
                },
            )
            .unwrap();

        let mut pool = device.raw().create_command_pool(QueueKind::Graphics).unwrap();
        let mut encoder = pool.create_encoder().unwrap();
        unsafe { encoder.begin().unwrap() };
        graph.render(&device, &mut encoder, 0, None).unwrap();

        assert_eq!(bound_pipelines(encoder.commands()), ["image-blit"]);
        assert!(encoder.commands().iter().any(|command| matches!(
            command,
            NullCommand::Draw {
                vertex_count: 3,
                instance_count: 1
            }
        )));
        assert!(encoder
            .commands()
            .iter()
            .any(|command| matches!(command, NullCommand::SetDescriptorTable { .. })));
    }
}
