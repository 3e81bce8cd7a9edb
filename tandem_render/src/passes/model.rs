use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use tandem_tracing::trace_span;

use crate::backend::{
    Api, BlendMode, ColorTarget, CommandEncoder, CompareOp, CullMode, DepthState, IndexFormat,
};
use crate::error::{Error, Result};
use crate::graph::{PassContext, RenderPass, SetupContext};
use crate::mesh::Vertex;
use crate::pipeline::{PipelineBundle, PipelineState};
use crate::scene::{Camera, DirectionalLight, SharedScene};
use crate::shader::{FragmentShader, ShaderKey, VertexShader};

use super::{linear_sampler, DrawUniforms, FrameUniforms};

const SHADER: &str = "model";

pub const PIPELINE_LABEL: &str = "draw-model";

#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct ViewUniform {
    view_proj: Mat4,
    position: Vec4,
}

impl ViewUniform {
    pub fn new(camera: &Camera) -> Self {
        Self {
            view_proj: camera.view_projection(),
            position: camera.position.extend(1.0),
        }
    }
}

#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct ObjectUniform {
    transform: Mat4,
    normal: Mat4,
}

impl ObjectUniform {
    pub fn new(transform: Mat4) -> Self {
        Self {
            transform,
            normal: transform.inverse().transpose(),
        }
    }
}

#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
struct LightUniform {
    direction: Vec4,
    color: Vec4,
}

impl LightUniform {
    fn new(light: &DirectionalLight) -> Self {
        Self {
            direction: light.direction.extend(0.0),
            color: light.color.extend(light.ambient),
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct Tables {
    view: u32,
    object: u32,
    light: u32,
    albedo: u32,
}

/// Draws all mesh instances of the scene with a directional light.
pub struct ModelPass<A: Api> {
    scene: SharedScene<A>,
    wireframe: bool,
    pipeline: Option<PipelineBundle<A>>,
    tables: Tables,
    view: Option<FrameUniforms<A>>,
    light: Option<FrameUniforms<A>>,
    objects: Option<DrawUniforms<A>>,
}

impl<A: Api> ModelPass<A> {
    pub fn new(scene: SharedScene<A>) -> Self {
        Self {
            scene,
            wireframe: false,
            pipeline: None,
            tables: Tables::default(),
            view: None,
            light: None,
            objects: None,
        }
    }

    /// Rasterizes triangle edges only. Requires [`AdapterFeatures::FILL_MODE_NON_SOLID`].
    ///
    /// [`AdapterFeatures::FILL_MODE_NON_SOLID`]: crate::backend::AdapterFeatures::FILL_MODE_NON_SOLID
    pub fn with_wireframe(mut self, wireframe: bool) -> Self {
        self.wireframe = wireframe;
        self
    }

    pub fn pipeline(&self) -> Option<&PipelineBundle<A>> {
        self.pipeline.as_ref()
    }

    fn build_pipeline(&mut self, ctx: &mut SetupContext<'_, A>) -> Result<()> {
        let vertex = VertexShader::load(ctx.shaders, SHADER, "vs_main")?;
        let fragment = FragmentShader::load(ctx.shaders, SHADER, "fs_main")?;

        let state = PipelineState {
            vertex_layout: Some(Vertex::layout()),
            cull_mode: CullMode::Back,
            wireframe: self.wireframe,
            depth: ctx.depth_format.map(|format| DepthState {
                format,
                write_enabled: true,
                compare_op: CompareOp::Less,
            }),
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

        let table = |space: u32| {
            bundle.table_index(space, 0).ok_or_else(|| {
                Error::PipelineCreate(format!(
                    "{}: shader does not bind group {}",
                    PIPELINE_LABEL, space
                ))
            })
        };

        self.tables = Tables {
            view: table(0)?,
            object: table(1)?,
            light: table(2)?,
            albedo: table(3)?,
        };
        self.pipeline = Some(bundle);
        Ok(())
    }
}

impl<A: Api> RenderPass<A> for ModelPass<A> {
    fn setup(&mut self, ctx: &mut SetupContext<'_, A>) -> Result<()> {
        self.build_pipeline(ctx)?;

        self.view = Some(FrameUniforms::new(
            ctx.device,
            ctx.frames_in_flight,
            std::mem::size_of::<ViewUniform>() as u64,
        )?);
        self.light = Some(FrameUniforms::new(
            ctx.device,
            ctx.frames_in_flight,
            std::mem::size_of::<LightUniform>() as u64,
        )?);
        self.objects = Some(DrawUniforms::new(
            ctx.device,
            ctx.frames_in_flight,
            std::mem::size_of::<ObjectUniform>() as u64,
        ));

        Ok(())
    }

    fn render(&mut self, ctx: &mut PassContext<'_, A>) -> Result<()> {
        let _span = trace_span!("ModelPass::render").entered();

        let (Some(pipeline), Some(view), Some(light), Some(objects)) = (
            &self.pipeline,
            &self.view,
            &self.light,
            &mut self.objects,
        ) else {
            return Ok(());
        };

        let scene = self.scene.lock();
        objects.reserve(ctx.device, ctx.frame_slot, scene.instances().count())?;

        pipeline.bind(ctx.encoder);

        let view = view.write(ctx.frame_slot, &ViewUniform::new(&scene.camera))?;
        pipeline.set_table(ctx.encoder, self.tables.view, view);

        let light = light.write(ctx.frame_slot, &LightUniform::new(&scene.light))?;
        pipeline.set_table(ctx.encoder, self.tables.light, light);

        let mut draws = 0;
        for instance in scene.instances() {
            let Some(mesh_slot) = scene.mesh_slot(instance.mesh) else {
                continue;
            };
            let mesh_guard = mesh_slot.lock();
            let texture_guard = scene.texture_or_white(instance.texture).lock();

            // Not uploaded yet.
            let (Some(mesh), Some(texture)) = (mesh_guard.as_ref(), texture_guard.as_ref()) else {
                continue;
            };

            let object = objects.write(
                ctx.frame_slot,
                draws,
                &ObjectUniform::new(instance.transform),
            )?;
            pipeline.set_table(ctx.encoder, self.tables.object, object);
            pipeline.set_table(ctx.encoder, self.tables.albedo, texture.descriptor());

            ctx.encoder
                .bind_vertex_buffer(0, mesh.vertices.raw(), 0, Vertex::STRIDE);
            ctx.encoder
                .bind_index_buffer(mesh.indices.raw(), 0, IndexFormat::U32);
            ctx.encoder.draw_indexed(mesh.index_count, 1, 0, 0);
            draws += 1;
        }

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
    use glam::{Mat4, UVec2, Vec3};

    use crate::backend::null::{Null, NullCommand, NullCommandEncoder};
    use crate::backend::{
        BufferUsage, CommandEncoder, CommandPool, Device, QueueKind, TextureDescriptor,
        TextureFormat, TextureUsage,
    };
    use crate::device::RenderDevice;
    use crate::graph::{FrameGraphBuilder, GraphEnv, PassDesc, FrameGraphDescription};
    use crate::mesh::{GpuMesh, MeshData};
    use crate::passes::tests::{bound_pipelines, shader_cache, target};
    use crate::passes::{MODEL_PASS, SCENE_COLOR, SCENE_DEPTH};
    use crate::pipeline::PipelineCacheDir;
    use crate::resources::ResourceAllocator;
    use crate::scene::{MeshInstance, Scene, SharedScene};
    use crate::test_util::render_device;
    use crate::texture::GpuTexture;

    use super::ModelPass;

    fn upload_cube(device: &RenderDevice<Null>, scene: &SharedScene<Null>) {
        let allocator = ResourceAllocator::<Null>::new(device.raw());
        let data = MeshData::cube(1.0);

        let mut scene = scene.lock();
        let (mesh, slot) = scene.insert_mesh();
        *slot.lock() = Some(GpuMesh {
            vertices: allocator
                .create_buffer_init(bytemuck::cast_slice(&data.vertices), BufferUsage::VERTEX)
                .unwrap(),
            indices: allocator
                .create_buffer_init(bytemuck::cast_slice(&data.indices), BufferUsage::INDEX)
                .unwrap(),
            index_count: data.indices.len() as u32,
        });

        let white = allocator
            .create_texture(&TextureDescriptor::new_2d(
                UVec2::ONE,
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED,
            ))
            .unwrap();
        *scene.white_texture().lock() = Some(GpuTexture::new(device, white).unwrap());

        for x in 0..3 {
            scene.add_instance(MeshInstance {
                mesh,
                texture: None,
                transform: Mat4::from_translation(Vec3::new(x as f32, 0.0, 0.0)),
            });
        }

        // Never uploaded, skipped while drawing.
        let (pending, _) = scene.insert_mesh();
        scene.add_instance(MeshInstance {
            mesh: pending,
            texture: None,
            transform: Mat4::IDENTITY,
        });
    }

    fn encoder(device: &RenderDevice<Null>) -> NullCommandEncoder {
        let mut pool = device.raw().create_command_pool(QueueKind::Graphics).unwrap();
        let mut encoder = pool.create_encoder().unwrap();
        unsafe { encoder.begin().unwrap() };
        encoder
    }

    #[test]
    fn model_pass_draws_loaded_instances() {
        let device = render_device();
        let scene = Scene::shared();
        upload_cube(&device, &scene);

        let mut builder = FrameGraphBuilder::new();
        builder.register(MODEL_PASS, ModelPass::new(scene.clone()));

        let desc = crate::passes::default_graph();
        let model_only = FrameGraphDescription {
            passes: desc
                .passes
                .into_iter()
                .filter(|pass: &PassDesc| pass.name == MODEL_PASS)
                .collect(),
        };

        let mut shaders = shader_cache();
        let cache = PipelineCacheDir::disabled();
        let mut env = GraphEnv {
            device: &device,
            shaders: &mut shaders,
            pipeline_cache: &cache,
            frames_in_flight: 2,
            target: target(),
        };
        let mut graph = builder.build(&model_only, &mut env).unwrap();
        assert!(graph.attachment(SCENE_COLOR).is_some());
        assert!(graph.attachment(SCENE_DEPTH).is_some());

        let mut encoder = encoder(&device);
        graph.render(&device, &mut encoder, 1, None).unwrap();

        assert_eq!(bound_pipelines(encoder.commands()), ["draw-model"]);
        let draws = encoder
            .commands()
            .iter()
            .filter(|command| matches!(command, NullCommand::DrawIndexed { index_count: 36, .. }))
            .count();
        assert_eq!(draws, 3);
    }

    #[test]
    fn model_pipeline_layout() {
        let device = render_device();
        let mut shaders = shader_cache();
        let cache = PipelineCacheDir::disabled();

        let mut pass = ModelPass::<Null>::new(Scene::shared());
        let mut ctx = crate::graph::SetupContext {
            device: &device,
            shaders: &mut shaders,
            pipeline_cache: &cache,
            frames_in_flight: 3,
            color_formats: vec![TextureFormat::Rgba16Float],
            depth_format: Some(TextureFormat::Depth32Float),
        };
        crate::graph::RenderPass::setup(&mut pass, &mut ctx).unwrap();

        let pipeline = pass.pipeline().unwrap();
        assert_eq!(pipeline.label(), "draw-model");
        assert_eq!(pipeline.tables().len(), 4);
        assert_eq!(pipeline.static_samplers().len(), 1);
        assert_eq!(pipeline.layout().tables().len(), 4);
        assert_eq!(pipeline.layout().static_sampler_count(), 1);
    }
}
