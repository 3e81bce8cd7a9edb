use bytemuck::{Pod, Zeroable};
use glam::{UVec2, Vec4};
use tandem_tracing::trace_span;

use crate::backend::{
    Api, BlendMode, BufferUsage, ColorTarget, CommandEncoder, IndexFormat, ScissorRect,
};
use crate::error::{Error, Result};
use crate::graph::{PassContext, RenderPass, SetupContext};
use crate::pipeline::{PipelineBundle, PipelineState};
use crate::scene::SharedScene;
use crate::shader::{FragmentShader, ShaderKey, VertexShader};
use crate::ui::{UiTexture, UiVertex};

use super::{linear_sampler, FrameBuffers, FrameUniforms};

const SHADER: &str = "ui";

pub const PIPELINE_LABEL: &str = "ui-overlay";

#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
struct ScreenUniform {
    size: Vec4,
}

/// Clamps `clip` to a target of `extent`.
fn clamp_scissor(clip: ScissorRect, extent: UVec2) -> ScissorRect {
    let x = clip.x.clamp(0, extent.x as i32);
    let y = clip.y.clamp(0, extent.y as i32);
    let right = (i64::from(clip.x) + i64::from(clip.width)).clamp(i64::from(x), i64::from(extent.x));
    let bottom =
        (i64::from(clip.y) + i64::from(clip.height)).clamp(i64::from(y), i64::from(extent.y));

    ScissorRect {
        x,
        y,
        width: (right - i64::from(x)) as u32,
        height: (bottom - i64::from(y)) as u32,
    }
}

/// Records the [`UiDrawData`] of the scene into a transparent overlay.
///
/// [`UiDrawData`]: crate::ui::UiDrawData
pub struct UiPass<A: Api> {
    scene: SharedScene<A>,
    pipeline: Option<PipelineBundle<A>>,
    screen_table: u32,
    texture_table: u32,
    screen: Option<FrameUniforms<A>>,
    vertices: Option<FrameBuffers<A>>,
    indices: Option<FrameBuffers<A>>,
}

impl<A: Api> UiPass<A> {
    pub fn new(scene: SharedScene<A>) -> Self {
        Self {
            scene,
            pipeline: None,
            screen_table: 0,
            texture_table: 0,
            screen: None,
            vertices: None,
            indices: None,
        }
    }

    pub fn pipeline(&self) -> Option<&PipelineBundle<A>> {
        self.pipeline.as_ref()
    }

    fn build_pipeline(&mut self, ctx: &mut SetupContext<'_, A>) -> Result<()> {
        let vertex = VertexShader::load(ctx.shaders, SHADER, "vs_main")?;
        let fragment = FragmentShader::load(ctx.shaders, SHADER, "fs_main")?;

        let state = PipelineState {
            vertex_layout: Some(UiVertex::layout()),
            color_targets: ctx
                .color_formats
                .iter()
                .map(|format| ColorTarget {
                    format: *format,
                    blend: BlendMode::Alpha,
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

        let missing = |space| {
            Error::PipelineCreate(format!(
                "{}: shader does not bind group {}",
                PIPELINE_LABEL, space
            ))
        };
        self.screen_table = bundle.table_index(0, 0).ok_or_else(|| missing(0))?;
        self.texture_table = bundle.table_index(1, 0).ok_or_else(|| missing(1))?;
        self.pipeline = Some(bundle);
        Ok(())
    }
}

impl<A: Api> RenderPass<A> for UiPass<A> {
    fn setup(&mut self, ctx: &mut SetupContext<'_, A>) -> Result<()> {
        self.build_pipeline(ctx)?;

        self.screen = Some(FrameUniforms::new(
            ctx.device,
            ctx.frames_in_flight,
            std::mem::size_of::<ScreenUniform>() as u64,
        )?);
        self.vertices = Some(FrameBuffers::new(ctx.frames_in_flight, BufferUsage::VERTEX));
        self.indices = Some(FrameBuffers::new(ctx.frames_in_flight, BufferUsage::INDEX));

        Ok(())
    }

    fn render(&mut self, ctx: &mut PassContext<'_, A>) -> Result<()> {
        let _span = trace_span!("UiPass::render").entered();

        let (Some(pipeline), Some(screen), Some(vertices), Some(indices)) = (
            &self.pipeline,
            &self.screen,
            &mut self.vertices,
            &mut self.indices,
        ) else {
            return Ok(());
        };

        let scene = self.scene.lock();
        let data = scene.ui();
        if data.is_empty() || data.indices.is_empty() {
            return Ok(());
        }

        let vertex_buffer =
            vertices.write(ctx.device, ctx.frame_slot, bytemuck::cast_slice(&data.vertices))?;
        let index_buffer =
            indices.write(ctx.device, ctx.frame_slot, bytemuck::cast_slice(&data.indices))?;

        // Draw data built for another size is stretched over the overlay.
        let size = if data.size == UVec2::ZERO {
            ctx.extent
        } else {
            data.size
        };
        let screen = screen.write(
            ctx.frame_slot,
            &ScreenUniform {
                size: Vec4::new(size.x as f32, size.y as f32, 0.0, 0.0),
            },
        )?;

        pipeline.bind(ctx.encoder);
        pipeline.set_table(ctx.encoder, self.screen_table, screen);
        ctx.encoder
            .bind_vertex_buffer(0, vertex_buffer.raw(), 0, UiVertex::STRIDE);
        ctx.encoder
            .bind_index_buffer(index_buffer.raw(), 0, IndexFormat::U32);

        for command in &data.commands {
            let scissor = clamp_scissor(command.clip, ctx.extent);
            if scissor.width == 0 || scissor.height == 0 || command.index_count == 0 {
                continue;
            }

            let slot = match command.texture {
                UiTexture::White => scene.white_texture(),
                UiTexture::Scene(id) => scene.texture_or_white(Some(id)),
            };
            let guard = slot.lock();
            let Some(texture) = guard.as_ref() else {
                continue;
            };

            ctx.encoder.set_scissor(&scissor);
            pipeline.set_table(ctx.encoder, self.texture_table, texture.descriptor());
            ctx.encoder
                .draw_indexed(command.index_count, 1, command.first_index, 0);
        }

        // Later passes expect the full scissor.
        ctx.encoder.set_scissor(&ScissorRect::from_extent(ctx.extent));

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
    use glam::{UVec2, Vec2};

    use crate::backend::null::{Null, NullCommand};
    use crate::backend::{
        CommandEncoder, CommandPool, Device, QueueKind, ScissorRect, TextureDescriptor,
        TextureFormat, TextureUsage,
    };
    use crate::graph::{FrameGraphBuilder, FrameGraphDescription, GraphEnv, PassDesc};
    use crate::passes::tests::{bound_pipelines, shader_cache, target};
    use crate::passes::UI_PASS;
    use crate::pipeline::PipelineCacheDir;
    use crate::resources::ResourceAllocator;
    use crate::scene::Scene;
    use crate::test_util::render_device;
    use crate::texture::GpuTexture;
    use crate::ui::{RectUi, UiContext};

    use super::{clamp_scissor, UiPass};

    #[test]
    fn scissor_is_clamped_to_target() {
        let extent = UVec2::new(100, 50);
        let clip = ScissorRect {
            x: -10,
            y: 40,
            width: 200,
            height: 20,
        };
        assert_eq!(
            clamp_scissor(clip, extent),
            ScissorRect {
                x: 0,
                y: 40,
                width: 100,
                height: 10,
            }
        );

        let outside = ScissorRect {
            x: 120,
            y: 0,
            width: 10,
            height: 10,
        };
        assert_eq!(clamp_scissor(outside, extent).width, 0);
    }

    #[test]
    fn ui_pass_draws_each_command() {
        let device = render_device();
        let scene = Scene::shared();

        {
            let allocator = ResourceAllocator::<Null>::new(device.raw());
            let white = allocator
                .create_texture(&TextureDescriptor::new_2d(
                    UVec2::ONE,
                    TextureFormat::Rgba8Unorm,
                    TextureUsage::SAMPLED,
                ))
                .unwrap();
            let mut scene = scene.lock();
            *scene.white_texture().lock() = Some(GpuTexture::new(&device, white).unwrap());

            let mut ui = RectUi::new();
            ui.begin_frame(UVec2::new(320, 240));
            ui.rect(Vec2::ZERO, Vec2::new(10.0, 10.0), [255; 4]);
            // A different clip starts a second command.
            ui.set_clip(Some(ScissorRect {
                x: 16,
                y: 16,
                width: 32,
                height: 32,
            }));
            ui.rect(Vec2::new(20.0, 20.0), Vec2::new(40.0, 40.0), [0, 0, 255, 128]);
            scene.set_ui(ui.end_frame());
        }

        let mut builder = FrameGraphBuilder::new();
        builder.register(UI_PASS, UiPass::new(scene.clone()));
        let desc = FrameGraphDescription {
            passes: crate::passes::default_graph()
                .passes
                .into_iter()
                .filter(|pass: &PassDesc| pass.name == UI_PASS)
                .collect(),
        };

        let mut shaders = shader_cache();
        let cache = PipelineCacheDir::disabled();
        let mut graph = builder
            .build(
                &desc,
                &mut GraphEnv {
                    device: &device,
                    shaders: &mut shaders,
                    pipeline_cache: &cache,
                    frames_in_flight: 2,
                    target: target(),
                },
            )
            .unwrap();

        let mut pool = device.raw().create_command_pool(QueueKind::Graphics).unwrap();
        let mut encoder = pool.create_encoder().unwrap();
        unsafe { encoder.begin().unwrap() };
        graph.render(&device, &mut encoder, 0, None).unwrap();

        assert_eq!(bound_pipelines(encoder.commands()), ["ui-overlay"]);
        let draws: Vec<_> = encoder
            .commands()
            .iter()
            .filter_map(|command| match command {
                NullCommand::DrawIndexed { index_count, .. } => Some(*index_count),
                _ => None,
            })
            .collect();
        assert_eq!(draws, [6, 6]);
    }
}
