use tandem_tracing::trace_span;

use crate::backend::{Api, BlendMode, ColorTarget, CommandEncoder};
use crate::error::{Error, Result};
use crate::graph::{PassContext, RenderPass, SetupContext};
use crate::pipeline::{PipelineBundle, PipelineState};
use crate::shader::{FragmentShader, ShaderKey, VertexShader};

use super::linear_sampler;

const SHADER: &str = "composite";

pub const PIPELINE_LABEL: &str = "final-composite";

/// Tonemaps the scene and blends the debug and UI overlays over it.
pub struct CompositePass<A: Api> {
    /// Scene color, debug overlay and UI overlay, bound to groups 0 to 2.
    inputs: [&'static str; 3],
    pipeline: Option<PipelineBundle<A>>,
    tables: [u32; 3],
}

impl<A: Api> CompositePass<A> {
    pub fn new(inputs: [&'static str; 3]) -> Self {
        Self {
            inputs,
            pipeline: None,
            tables: [0; 3],
        }
    }

    pub fn pipeline(&self) -> Option<&PipelineBundle<A>> {
        self.pipeline.as_ref()
    }

    fn build_pipeline(&mut self, ctx: &mut SetupContext<'_, A>) -> Result<()> {
        let vertex = VertexShader::load(ctx.shaders, SHADER, "vs_main")?;
        let fragment = FragmentShader::load(ctx.shaders, SHADER, "fs_main")?;

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

        for (space, table) in self.tables.iter_mut().enumerate() {
            *table = bundle.table_index(space as u32, 0).ok_or_else(|| {
                Error::PipelineCreate(format!(
                    "{}: shader does not bind group {}",
                    PIPELINE_LABEL, space
                ))
            })?;
        }
        self.pipeline = Some(bundle);
        Ok(())
    }
}

impl<A: Api> RenderPass<A> for CompositePass<A> {
    fn setup(&mut self, ctx: &mut SetupContext<'_, A>) -> Result<()> {
        self.build_pipeline(ctx)
    }

    fn render(&mut self, ctx: &mut PassContext<'_, A>) -> Result<()> {
        let _span = trace_span!("CompositePass::render").entered();

        let Some(pipeline) = &self.pipeline else {
            return Ok(());
        };

        pipeline.bind(ctx.encoder);
        for (name, table) in self.inputs.iter().zip(self.tables) {
            let texture = ctx.input_texture(name).ok_or_else(|| {
                Error::Backend(format!("composite input {} is not an attachment", name))
            })?;
            pipeline.set_table(ctx.encoder, table, texture);
        }
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
    use crate::backend::null::Null;
    use crate::backend::TextureFormat;
    use crate::graph::{RenderPass, SetupContext};
    use crate::passes::tests::shader_cache;
    use crate::pipeline::PipelineCacheDir;
    use crate::test_util::render_device;

    use super::CompositePass;

    #[test]
    fn composite_pipeline_layout() {
        let device = render_device();
        let mut shaders = shader_cache();
        let cache = PipelineCacheDir::disabled();

        let mut pass = CompositePass::<Null>::new(["a", "b", "c"]);
        pass.setup(&mut SetupContext {
            device: &device,
            shaders: &mut shaders,
            pipeline_cache: &cache,
            frames_in_flight: 1,
            color_formats: vec![TextureFormat::Rgba8Unorm],
            depth_format: None,
        })
        .unwrap();

        let pipeline = pass.pipeline().unwrap();
        assert_eq!(pipeline.label(), "final-composite");
        assert_eq!(pipeline.tables().len(), 3);
        assert_eq!(pipeline.static_samplers().len(), 1);
        assert_eq!(pass.tables, [0, 1, 2]);
    }
}
