use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use tandem_tracing::trace_span;

use crate::backend::{
    Api, BlendMode, BufferUsage, ColorTarget, CommandEncoder, PrimitiveTopology, VertexAttribute,
    VertexFormat, VertexLayout,
};
use crate::error::{Error, Result};
use crate::graph::{PassContext, RenderPass, SetupContext};
use crate::pipeline::{PipelineBundle, PipelineState};
use crate::scene::{DebugLine, SharedScene};
use crate::shader::{FragmentShader, ShaderKey, VertexShader};

use super::model::{ObjectUniform, ViewUniform};
use super::{linear_sampler, FrameBuffers, FrameUniforms};

const SHADER: &str = "debug";

pub const PIPELINE_LABEL: &str = "debug-geometry";

#[derive(Copy, Clone, Debug, Default, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct DebugVertex {
    pub position: [f32; 3],
    pub color: [u8; 4],
}

impl DebugVertex {
    pub const STRIDE: u32 = 16;

    pub fn layout() -> VertexLayout {
        VertexLayout {
            stride: Self::STRIDE,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Unorm8x4,
                    offset: 12,
                },
            ],
        }
    }
}

fn line_vertices(lines: &[DebugLine]) -> Vec<DebugVertex> {
    lines
        .iter()
        .flat_map(|line| {
            [line.start, line.end].map(|position: Vec3| DebugVertex {
                position: position.to_array(),
                color: line.color,
            })
        })
        .collect()
}

/// Draws the debug lines queued in the scene on top of a transparent overlay.
pub struct DebugGeometryPass<A: Api> {
    scene: SharedScene<A>,
    pipeline: Option<PipelineBundle<A>>,
    view_table: u32,
    object_table: u32,
    view: Option<FrameUniforms<A>>,
    object: Option<FrameUniforms<A>>,
    vertices: Option<FrameBuffers<A>>,
}

impl<A: Api> DebugGeometryPass<A> {
    pub fn new(scene: SharedScene<A>) -> Self {
        Self {
            scene,
            pipeline: None,
            view_table: 0,
            object_table: 0,
            view: None,
            object: None,
            vertices: None,
        }
    }

    pub fn pipeline(&self) -> Option<&PipelineBundle<A>> {
        self.pipeline.as_ref()
    }

    fn build_pipeline(&mut self, ctx: &mut SetupContext<'_, A>) -> Result<()> {
        let vertex = VertexShader::load(ctx.shaders, SHADER, "vs_main")?;
        let fragment = FragmentShader::load(ctx.shaders, SHADER, "fs_main")?;

        let state = PipelineState {
            vertex_layout: Some(DebugVertex::layout()),
            topology: PrimitiveTopology::LineList,
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
        self.view_table = bundle.table_index(0, 0).ok_or_else(|| missing(0))?;
        self.object_table = bundle.table_index(1, 0).ok_or_else(|| missing(1))?;
        self.pipeline = Some(bundle);
        Ok(())
    }
}

impl<A: Api> RenderPass<A> for DebugGeometryPass<A> {
    fn setup(&mut self, ctx: &mut SetupContext<'_, A>) -> Result<()> {
        self.build_pipeline(ctx)?;

        self.view = Some(FrameUniforms::new(
            ctx.device,
            ctx.frames_in_flight,
            std::mem::size_of::<ViewUniform>() as u64,
        )?);
        self.object = Some(FrameUniforms::new(
            ctx.device,
            ctx.frames_in_flight,
            std::mem::size_of::<ObjectUniform>() as u64,
        )?);
        self.vertices = Some(FrameBuffers::new(ctx.frames_in_flight, BufferUsage::VERTEX));

        Ok(())
    }

    fn render(&mut self, ctx: &mut PassContext<'_, A>) -> Result<()> {
        let _span = trace_span!("DebugGeometryPass::render").entered();

        let (Some(pipeline), Some(view), Some(object), Some(vertices)) =
            (&self.pipeline, &self.view, &self.object, &mut self.vertices)
        else {
            return Ok(());
        };

        let scene = self.scene.lock();
        if scene.debug_lines().is_empty() {
            return Ok(());
        }

        let data = line_vertices(scene.debug_lines());
        let buffer = vertices.write(ctx.device, ctx.frame_slot, bytemuck::cast_slice(&data))?;

        pipeline.bind(ctx.encoder);

        let view = view.write(ctx.frame_slot, &ViewUniform::new(&scene.camera))?;
        pipeline.set_table(ctx.encoder, self.view_table, view);
        let object = object.write(ctx.frame_slot, &ObjectUniform::new(Mat4::IDENTITY))?;
        pipeline.set_table(ctx.encoder, self.object_table, object);

        ctx.encoder
            .bind_vertex_buffer(0, buffer.raw(), 0, DebugVertex::STRIDE);
        ctx.encoder.draw(data.len() as u32, 1, 0);

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
    use std::mem::{offset_of, size_of};

    use glam::Vec3;

    use crate::backend::null::Null;
    use crate::backend::TextureFormat;
    use crate::graph::{RenderPass, SetupContext};
    use crate::passes::tests::shader_cache;
    use crate::pipeline::PipelineCacheDir;
    use crate::scene::{DebugLine, Scene};
    use crate::test_util::render_device;

    use super::{line_vertices, DebugGeometryPass, DebugVertex};

    #[test]
    fn debug_vertex_layout() {
        assert_eq!(size_of::<DebugVertex>(), DebugVertex::STRIDE as usize);
        assert_eq!(offset_of!(DebugVertex, color), 12);
        assert_eq!(DebugVertex::layout().attributes[1].offset, 12);
    }

    #[test]
    fn lines_become_vertex_pairs() {
        let vertices = line_vertices(&[DebugLine {
            start: Vec3::ZERO,
            end: Vec3::X,
            color: [255, 0, 0, 255],
        }]);
        assert_eq!(vertices.len(), 2);
        assert_eq!(vertices[1].position, [1.0, 0.0, 0.0]);
        assert_eq!(vertices[0].color, [255, 0, 0, 255]);
    }

    #[test]
    fn debug_pipeline_has_two_tables() {
        let device = render_device();
        let mut shaders = shader_cache();
        let cache = PipelineCacheDir::disabled();

        let mut pass = DebugGeometryPass::<Null>::new(Scene::shared());
        pass.setup(&mut SetupContext {
            device: &device,
            shaders: &mut shaders,
            pipeline_cache: &cache,
            frames_in_flight: 2,
            color_formats: vec![TextureFormat::Rgba8Unorm],
            depth_format: None,
        })
        .unwrap();

        let pipeline = pass.pipeline().unwrap();
        assert_eq!(pipeline.label(), "debug-geometry");
        assert_eq!(pipeline.tables().len(), 2);
        assert!(pipeline.static_samplers().is_empty());
    }
}
