//! The per-frame render loop.
//!
//! A [`Renderer`] owns everything bound to one device: the swapchain of its window, the
//! submission ring, the staging engine and the frame graph. Meshes and images added to
//! the renderer are kept in host memory so that they can be uploaded again after the
//! device was lost or another adapter was selected.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use glam::UVec2;
use tandem_tracing::trace_span;

use crate::backend::null::Null;
use crate::backend::vulkan::Vulkan;
use crate::backend::{
    Adapter, AdapterFeatures, Api, BackendKind, Instance, InstanceDescriptor,
};
use crate::config::{AdapterPreference, RendererConfig};
use crate::device::{enumerate_adapters, AdapterEntry, RenderDevice};
use crate::error::{Error, Result};
use crate::frame::{FrameRing, FrameStats};
use crate::graph::{FrameGraph, FrameGraphBuilder, FrameGraphDescription, GraphEnv, GraphTarget};
use crate::mesh::{load_mesh, MeshData};
use crate::passes::{default_graph, register_default_passes};
use crate::pipeline::PipelineCacheDir;
use crate::scene::{
    Camera, DebugLine, DirectionalLight, InstanceId, MeshId, MeshInstance, Scene, SharedScene,
    TextureId,
};
use crate::shader::{ShaderCache, ShaderCompiler};
use crate::staging::UploadEngine;
use crate::swapchain::WindowSwapchain;
use crate::texture::{load_image, ImageData};
use crate::ui::UiDrawData;
use crate::window::WindowSurface;

#[cfg(all(windows, feature = "dx12"))]
use crate::backend::dx12::Dx12;

/// Outcome of [`Renderer::render_frame`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was presented. Contains the present fence value of the frame.
    Presented(u64),
    /// The window has no area, nothing was rendered.
    Skipped,
    /// The swapchain no longer matches the window and is rebuilt before the next frame.
    Rebuild,
    /// The device was lost and has been recreated. Assets are uploaded again.
    DeviceRestarted,
}

/// Host copies of every asset added to the renderer.
#[derive(Default)]
struct RetainedAssets {
    meshes: Vec<(MeshId, MeshData)>,
    textures: Vec<(TextureId, ImageData)>,
}

/// State bound to the logical device.
struct DeviceState<A: Api> {
    graph: Option<FrameGraph<A>>,
    uploads: UploadEngine<A>,
    ring: FrameRing<A>,
    swapchain: WindowSwapchain<A>,
    device: RenderDevice<A>,
    /// Window size the swapchain was last built for.
    window_size: UVec2,
}

impl<A: Api> Drop for DeviceState<A> {
    fn drop(&mut self) {
        // Objects of the graph, ring and swapchain may still be used by the GPU.
        if let Err(err) = self.device.wait_idle() {
            tracing::error!("failed to wait for device idle: {}", err);
        }
    }
}

pub struct Renderer<A: Api> {
    state: Option<DeviceState<A>>,
    /// Set by [`Renderer::shutdown`]. The device is not reopened afterwards.
    shut_down: bool,
    scene: SharedScene<A>,
    assets: RetainedAssets,
    graph_desc: FrameGraphDescription,
    shaders: ShaderCache,
    pipeline_cache: PipelineCacheDir,
    window: Arc<dyn WindowSurface>,
    instance: A::Instance,
    config: RendererConfig,
}

impl<A: Api> Renderer<A> {
    /// Creates the API instance and opens the adapter selected by `config`.
    pub fn new(config: RendererConfig, window: Arc<dyn WindowSurface>) -> Result<Self> {
        let instance = A::Instance::new(&InstanceDescriptor {
            app_name: &config.app_name,
            validation: config.validation,
        })?;

        Self::with_instance(config, instance, window)
    }

    pub fn with_instance(
        config: RendererConfig,
        instance: A::Instance,
        window: Arc<dyn WindowSurface>,
    ) -> Result<Self> {
        let _span = trace_span!("Renderer::new").entered();

        config
            .validate()
            .map_err(|err| Error::Backend(format!("invalid renderer config: {}", err)))?;

        let mut shaders = ShaderCache::new(ShaderCompiler::new(
            config.shader_dir.clone(),
            A::KIND.shader_target(),
            config.shader_debug,
        ));
        if config.shader_hot_reload {
            shaders.enable_hot_reload()?;
        }

        let pipeline_cache =
            PipelineCacheDir::resolve(config.pipeline_cache_dir.as_deref(), &config.app_name);
        match pipeline_cache.dir() {
            Some(dir) => tracing::info!("pipeline cache at {}", dir.display()),
            None => tracing::warn!("no pipeline cache directory, pipelines are not cached"),
        }

        let mut this = Self {
            state: None,
            shut_down: false,
            scene: Scene::shared(),
            assets: RetainedAssets::default(),
            graph_desc: default_graph(),
            shaders,
            pipeline_cache,
            window,
            instance,
            config,
        };

        let preference = this.config.adapter.clone();
        this.open(&preference)?;
        Ok(this)
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn scene(&self) -> &SharedScene<A> {
        &self.scene
    }

    /// Returns `None` after [`shutdown`](Self::shutdown).
    pub fn device(&self) -> Option<&RenderDevice<A>> {
        self.state.as_ref().map(|state| &state.device)
    }

    pub fn graph(&self) -> Option<&FrameGraph<A>> {
        self.state.as_ref()?.graph.as_ref()
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.state
            .as_ref()
            .map(|state| state.ring.stats())
            .unwrap_or_default()
    }

    /// Fence value signaled by the last present.
    pub fn present_value(&self) -> u64 {
        self.state
            .as_ref()
            .map_or(0, |state| state.swapchain.present_value())
    }

    /// Lists the adapters of the instance.
    pub fn adapters(&self) -> Result<Vec<AdapterEntry>> {
        enumerate_adapters::<A>(&self.instance)
    }

    /// Switches to the adapter at `index` of [`adapters`](Self::adapters).
    ///
    /// All device objects are recreated and assets are uploaded again.
    pub fn select_adapter(&mut self, index: usize) -> Result<()> {
        let _span = trace_span!("Renderer::select_adapter").entered();

        if self.shut_down {
            return Err(Error::Shutdown);
        }

        tracing::info!("switching to adapter {}", index);
        self.teardown();
        self.open(&AdapterPreference::Index(index))
    }

    pub fn add_mesh(&mut self, mesh: MeshData) -> Result<MeshId> {
        mesh.validate()
            .map_err(|err| Error::Backend(format!("invalid mesh: {}", err)))?;

        let (id, slot) = self.scene.lock().insert_mesh();
        if let Some(state) = &mut self.state {
            ensure_loading(state)?;
            load_mesh(&mut state.uploads, &state.device, &mesh, slot)?;
        }

        self.assets.meshes.push((id, mesh));
        Ok(id)
    }

    pub fn add_texture(&mut self, image: ImageData) -> Result<TextureId> {
        let (id, slot) = self.scene.lock().insert_texture();
        if let Some(state) = &mut self.state {
            ensure_loading(state)?;
            load_image(&mut state.uploads, &state.device, &image, slot)?;
        }

        self.assets.textures.push((id, image));
        Ok(id)
    }

    pub fn add_instance(&mut self, instance: MeshInstance) -> InstanceId {
        self.scene.lock().add_instance(instance)
    }

    pub fn remove_instance(&mut self, id: InstanceId) -> Option<MeshInstance> {
        self.scene.lock().remove_instance(id)
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.scene.lock().camera = camera;
    }

    pub fn set_light(&mut self, light: DirectionalLight) {
        self.scene.lock().light = light;
    }

    /// Queues a line for the next frame.
    pub fn push_line(&mut self, line: DebugLine) {
        self.scene.lock().push_line(line);
    }

    pub fn set_ui(&mut self, draw_data: UiDrawData) {
        self.scene.lock().set_ui(draw_data);
    }

    /// Blocks until all uploads completed and stored their resources in the scene.
    pub fn finish_uploads(&mut self) -> Result<()> {
        let _span = trace_span!("Renderer::finish_uploads").entered();

        if self.shut_down {
            return Err(Error::Shutdown);
        }
        let state = self.state.as_mut().ok_or(Error::DeviceLost)?;
        if state.uploads.is_loading() {
            state.uploads.finish_loading(&state.device)?;
        }

        // Finalise callbacks record their transitions into a frame of their own.
        let context = state.ring.begin_frame(&state.device, &state.swapchain)?;
        state
            .uploads
            .finalise_all(&state.device, context.encoder())?;
        context.finish_rendering(&state.device, None)?;
        state.device.wait_idle()
    }

    /// Records, submits and presents one frame.
    ///
    /// Swapchain rebuilds and device restarts are handled internally and reported in
    /// the returned status. Any other error aborts the frame.
    pub fn render_frame(&mut self) -> Result<FrameStatus> {
        let _span = trace_span!("Renderer::render_frame").entered();

        match self.try_render_frame() {
            Err(err) if err.requires_device_restart() => {
                tracing::error!("device lost, recreating device objects");
                self.restart_device()?;
                Ok(FrameStatus::DeviceRestarted)
            }
            Err(err) if err.is_recoverable() => {
                tracing::debug!("swapchain needs rebuild: {}", err);
                if let Some(state) = &mut self.state {
                    state.swapchain.mark_rebuild();
                }
                Ok(FrameStatus::Rebuild)
            }
            result => result,
        }
    }

    fn try_render_frame(&mut self) -> Result<FrameStatus> {
        if self.shut_down {
            return Err(Error::Shutdown);
        }
        // A failed device restart leaves no device behind. The next frame retries.
        let state = self.state.as_mut().ok_or(Error::DeviceLost)?;

        let changed = self.shaders.reload_changed();
        if !changed.is_empty() {
            tracing::info!("reloading {} shaders", changed.len());
            if let Some(graph) = &mut state.graph {
                graph.reload(
                    &mut GraphEnv {
                        device: &state.device,
                        shaders: &mut self.shaders,
                        pipeline_cache: &self.pipeline_cache,
                        frames_in_flight: state.ring.len(),
                        target: graph_target(&state.swapchain),
                    },
                    &changed,
                )?;
            }
        }

        let size = self.window.framebuffer_size();
        if size != state.window_size || state.swapchain.needs_rebuild() {
            rebuild_swapchain(state, size)?;
        }

        if state.uploads.is_loading() {
            state.uploads.finish_loading(&state.device)?;
        }

        if state.swapchain.is_zero_sized() {
            return Ok(FrameStatus::Skipped);
        }

        if state.graph.is_none() {
            let mut builder = FrameGraphBuilder::new();
            register_default_passes(&mut builder, &self.scene, wireframe(&self.config, state));
            state.graph = Some(builder.build(
                &self.graph_desc,
                &mut GraphEnv {
                    device: &state.device,
                    shaders: &mut self.shaders,
                    pipeline_cache: &self.pipeline_cache,
                    frames_in_flight: state.ring.len(),
                    target: graph_target(&state.swapchain),
                },
            )?);
        }

        if state.swapchain.acquire()?.is_none() {
            return Ok(FrameStatus::Skipped);
        }

        let value = match record_frame(state) {
            Ok(value) => value,
            Err(err) => {
                abandon_frame(state);
                return Err(err);
            }
        };

        self.scene.lock().clear_lines();
        Ok(FrameStatus::Presented(value))
    }

    /// Waits for all GPU work and destroys all device objects.
    ///
    /// Rendering after shutdown fails with [`Error::Shutdown`].
    pub fn shutdown(&mut self) -> Result<()> {
        let _span = trace_span!("Renderer::shutdown").entered();

        if let Some(state) = &mut self.state {
            state.swapchain.wait_for_last_frame(&state.device)?;
            state.uploads.wait_idle(&state.device)?;
            state.device.wait_idle()?;
        }

        self.teardown();
        self.shut_down = true;
        Ok(())
    }

    fn restart_device(&mut self) -> Result<()> {
        let _span = trace_span!("Renderer::restart_device").entered();

        let preference = match &self.state {
            Some(state) => AdapterPreference::Index(state.device.adapter_index()),
            None => self.config.adapter.clone(),
        };

        self.teardown();
        self.open(&preference)
    }

    fn teardown(&mut self) {
        if let Some(state) = &self.state {
            if let Err(err) = state.device.wait_idle() {
                tracing::warn!("failed to wait for device idle: {}", err);
            }
        }

        self.scene.lock().release_gpu_resources();
        self.state = None;
    }

    fn open(&mut self, preference: &AdapterPreference) -> Result<()> {
        let _span = trace_span!("Renderer::open").entered();

        let device = RenderDevice::<A>::new(&self.instance, preference, &self.config.descriptors)?;

        // SAFETY: The window outlives the renderer that holds it.
        let surface = unsafe {
            self.instance.create_surface(
                self.window.raw_display_handle()?,
                self.window.raw_window_handle()?,
            )?
        };

        let window_size = self.window.framebuffer_size();
        let swapchain = WindowSwapchain::new(
            &device,
            surface,
            window_size,
            self.config.swapchain_images,
            self.config.vsync,
        )?;
        let ring = FrameRing::new(&device, self.config.frames_in_flight)?;
        let uploads = UploadEngine::new(&device, self.config.staging_capacity)?;

        let mut state = DeviceState {
            graph: None,
            uploads,
            ring,
            swapchain,
            device,
            window_size,
        };

        self.upload_assets(&mut state)?;
        self.state = Some(state);
        Ok(())
    }

    /// Records the upload of the white texture and every retained asset.
    fn upload_assets(&self, state: &mut DeviceState<A>) -> Result<()> {
        ensure_loading(state)?;

        let scene = self.scene.lock();
        load_image(
            &mut state.uploads,
            &state.device,
            &ImageData::solid([255; 4]),
            scene.white_texture().clone(),
        )?;

        for (id, mesh) in &self.assets.meshes {
            if let Some(slot) = scene.mesh_slot(*id) {
                load_mesh(&mut state.uploads, &state.device, mesh, slot.clone())?;
            }
        }

        for (id, image) in &self.assets.textures {
            if let Some(slot) = scene.texture_slot(*id) {
                load_image(&mut state.uploads, &state.device, image, slot.clone())?;
            }
        }

        tracing::debug!(
            "queued upload of {} meshes and {} textures",
            self.assets.meshes.len(),
            self.assets.textures.len()
        );

        Ok(())
    }
}

impl<A: Api> Drop for Renderer<A> {
    fn drop(&mut self) {
        if self.state.is_some() {
            if let Err(err) = self.shutdown() {
                tracing::error!("failed to shut down renderer: {}", err);
                self.teardown();
            }
        }
    }
}

impl<A: Api> Debug for Renderer<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("backend", &A::KIND)
            .field("device", &self.device().map(|device| device.info()))
            .field("graph", &self.graph())
            .field("meshes", &self.assets.meshes.len())
            .field("textures", &self.assets.textures.len())
            .finish_non_exhaustive()
    }
}

/// Records the frame into the acquired back buffer, submits and presents it.
fn record_frame<A: Api>(state: &mut DeviceState<A>) -> Result<u64> {
    let context = state.ring.begin_frame(&state.device, &state.swapchain)?;
    let frame_slot = context.index();

    state
        .uploads
        .finalise_ready(&state.device, context.encoder())?;

    if let Some(graph) = &mut state.graph {
        graph.render(
            &state.device,
            context.encoder(),
            frame_slot,
            state.swapchain.backbuffer(),
        )?;
    }

    context.finish_rendering(&state.device, state.swapchain.raw())?;

    let value = state.swapchain.present(state.device.graphics_queue())?;
    context.set_present_fence_value(value);
    Ok(value)
}

/// Ends a frame that failed after its back buffer was acquired.
///
/// Commands recorded before the failure already changed the tracked layouts of the
/// graph and of finalised uploads, so they are submitted without presenting. The
/// swapchain is rebuilt before the next frame.
fn abandon_frame<A: Api>(state: &mut DeviceState<A>) {
    state.swapchain.abandon_frame();

    let Some(context) = state.ring.current().filter(|context| context.is_recording()) else {
        return;
    };

    if let Err(err) = context.finish_rendering(&state.device, state.swapchain.raw()) {
        tracing::warn!("failed to submit abandoned frame: {}", err);
        context.abandon();
        return;
    }

    match state
        .swapchain
        .signal_without_present(state.device.graphics_queue())
    {
        Ok(value) => context.set_present_fence_value(value),
        Err(err) => tracing::warn!("failed to signal present fence: {}", err),
    }
}

fn ensure_loading<A: Api>(state: &mut DeviceState<A>) -> Result<()> {
    if !state.uploads.is_loading() {
        state.uploads.begin_loading(&state.device)?;
    }

    Ok(())
}

fn graph_target<A: Api>(swapchain: &WindowSwapchain<A>) -> GraphTarget {
    GraphTarget {
        extent: swapchain.extent(),
        format: swapchain.format(),
    }
}

fn wireframe<A: Api>(config: &RendererConfig, state: &DeviceState<A>) -> bool {
    if !config.wireframe {
        return false;
    }

    let supported = state
        .device
        .adapter()
        .features()
        .contains(AdapterFeatures::FILL_MODE_NON_SOLID);
    if !supported {
        tracing::warn!("wireframe requested but not supported by the adapter");
    }

    supported
}

fn rebuild_swapchain<A: Api>(state: &mut DeviceState<A>, size: UVec2) -> Result<()> {
    let _span = trace_span!("Renderer::rebuild_swapchain").entered();

    state.swapchain.resize(&state.device, size)?;
    state.window_size = size;

    if let Some(graph) = &mut state.graph {
        if !state.swapchain.is_zero_sized() {
            graph.resize(&state.device, state.swapchain.extent())?;
        }
    }

    Ok(())
}

/// A [`Renderer`] on the backend chosen at runtime.
#[derive(Debug)]
pub enum AnyRenderer {
    Vulkan(Renderer<Vulkan>),
    #[cfg(all(windows, feature = "dx12"))]
    Dx12(Renderer<Dx12>),
    Null(Renderer<Null>),
}

macro_rules! dispatch {
    ($self:expr, $renderer:ident => $body:expr) => {
        match $self {
            AnyRenderer::Vulkan($renderer) => $body,
            #[cfg(all(windows, feature = "dx12"))]
            AnyRenderer::Dx12($renderer) => $body,
            AnyRenderer::Null($renderer) => $body,
        }
    };
}

impl AnyRenderer {
    /// Creates a renderer on the backend selected by [`RendererConfig::backend`].
    pub fn new(config: RendererConfig, window: Arc<dyn WindowSurface>) -> Result<Self> {
        let kind = config.backend.resolve();
        if !kind.is_available() {
            return Err(Error::Backend(format!(
                "backend {} is not available in this build",
                kind
            )));
        }

        tracing::info!("using {} backend", kind);

        match kind {
            BackendKind::Vulkan => Renderer::new(config, window).map(Self::Vulkan),
            #[cfg(all(windows, feature = "dx12"))]
            BackendKind::Dx12 => Renderer::new(config, window).map(Self::Dx12),
            #[cfg(not(all(windows, feature = "dx12")))]
            BackendKind::Dx12 => Err(Error::Backend("dx12 backend is not available".to_owned())),
            BackendKind::Null => Renderer::new(config, window).map(Self::Null),
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            Self::Vulkan(_) => BackendKind::Vulkan,
            #[cfg(all(windows, feature = "dx12"))]
            Self::Dx12(_) => BackendKind::Dx12,
            Self::Null(_) => BackendKind::Null,
        }
    }

    pub fn render_frame(&mut self) -> Result<FrameStatus> {
        dispatch!(self, renderer => renderer.render_frame())
    }

    pub fn finish_uploads(&mut self) -> Result<()> {
        dispatch!(self, renderer => renderer.finish_uploads())
    }

    pub fn add_mesh(&mut self, mesh: MeshData) -> Result<MeshId> {
        dispatch!(self, renderer => renderer.add_mesh(mesh))
    }

    pub fn add_texture(&mut self, image: ImageData) -> Result<TextureId> {
        dispatch!(self, renderer => renderer.add_texture(image))
    }

    pub fn add_instance(&mut self, instance: MeshInstance) -> InstanceId {
        dispatch!(self, renderer => renderer.add_instance(instance))
    }

    pub fn remove_instance(&mut self, id: InstanceId) -> Option<MeshInstance> {
        dispatch!(self, renderer => renderer.remove_instance(id))
    }

    pub fn set_camera(&mut self, camera: Camera) {
        dispatch!(self, renderer => renderer.set_camera(camera))
    }

    pub fn set_light(&mut self, light: DirectionalLight) {
        dispatch!(self, renderer => renderer.set_light(light))
    }

    pub fn push_line(&mut self, line: DebugLine) {
        dispatch!(self, renderer => renderer.push_line(line))
    }

    pub fn set_ui(&mut self, draw_data: UiDrawData) {
        dispatch!(self, renderer => renderer.set_ui(draw_data))
    }

    pub fn adapters(&self) -> Result<Vec<AdapterEntry>> {
        dispatch!(self, renderer => renderer.adapters())
    }

    pub fn select_adapter(&mut self, index: usize) -> Result<()> {
        dispatch!(self, renderer => renderer.select_adapter(index))
    }

    pub fn frame_stats(&self) -> FrameStats {
        dispatch!(self, renderer => renderer.frame_stats())
    }

    pub fn present_value(&self) -> u64 {
        dispatch!(self, renderer => renderer.present_value())
    }

    pub fn shutdown(&mut self) -> Result<()> {
        dispatch!(self, renderer => renderer.shutdown())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use glam::{Mat4, UVec2, Vec3};
    use tempfile::TempDir;

    use crate::backend::null::{Null, NullAdapterDesc, NullInstance};
    use crate::backend::{AdapterFeatures, AdapterInfo, AdapterKind, DescriptorKind};
    use crate::config::RendererConfig;
    use crate::mesh::MeshData;
    use crate::scene::{DebugLine, MeshInstance};
    use crate::texture::ImageData;
    use crate::window::HeadlessWindow;

    use super::{Error, FrameStatus, Renderer};

    fn config(cache: &TempDir) -> RendererConfig {
        RendererConfig {
            shader_dir: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/assets/shaders")),
            shader_debug: false,
            validation: false,
            pipeline_cache_dir: Some(cache.path().to_path_buf()),
            staging_capacity: 1 << 20,
            ..Default::default()
        }
    }

    fn renderer(size: UVec2) -> (Renderer<Null>, Arc<HeadlessWindow>, TempDir) {
        let cache = tempfile::tempdir().unwrap();
        let instance = NullInstance::with_adapters(vec![NullAdapterDesc::default()]);
        let window = Arc::new(HeadlessWindow::new(size));

        let renderer = Renderer::with_instance(config(&cache), instance, window.clone()).unwrap();
        (renderer, window, cache)
    }

    #[test]
    fn frames_present_increasing_values() {
        let (mut renderer, _window, _) = renderer(UVec2::new(64, 48));

        for frame in 1..=5 {
            assert_eq!(renderer.render_frame().unwrap(), FrameStatus::Presented(frame));
        }

        let graph = renderer.graph().unwrap();
        assert_eq!(
            graph.sorted_names().last().copied(),
            Some(crate::passes::BLIT_PASS)
        );
        assert_eq!(renderer.frame_stats().frames, 5);
        assert_eq!(renderer.frame_stats().reuse_violations, 0);
    }

    #[test]
    fn zero_sized_window_skips() {
        let (mut renderer, window, _) = renderer(UVec2::ZERO);
        assert_eq!(renderer.render_frame().unwrap(), FrameStatus::Skipped);
        assert!(renderer.graph().is_none());

        window.set_size(UVec2::new(32, 32));
        assert_eq!(renderer.render_frame().unwrap(), FrameStatus::Presented(1));
        assert!(renderer.graph().is_some());
    }

    #[test]
    fn resize_reallocates_graph() {
        let (mut renderer, window, _) = renderer(UVec2::new(64, 64));
        renderer.render_frame().unwrap();

        window.set_size(UVec2::new(100, 50));
        renderer.render_frame().unwrap();

        let color = renderer
            .graph()
            .unwrap()
            .attachment(crate::passes::SCENE_COLOR)
            .unwrap();
        assert_eq!(color.size(), UVec2::new(100, 50));
    }

    #[test]
    fn assets_become_visible_after_upload() {
        let (mut renderer, _window, _) = renderer(UVec2::new(32, 32));

        let mesh = renderer.add_mesh(MeshData::cube(1.0)).unwrap();
        let texture = renderer.add_texture(ImageData::solid([10, 20, 30, 255])).unwrap();
        renderer.add_instance(MeshInstance {
            mesh,
            texture: Some(texture),
            transform: Mat4::IDENTITY,
        });
        renderer.push_line(DebugLine {
            start: Vec3::ZERO,
            end: Vec3::Y,
            color: [0, 255, 0, 255],
        });

        renderer.render_frame().unwrap();

        let scene = renderer.scene().lock();
        assert!(scene.mesh_slot(mesh).unwrap().lock().is_some());
        assert!(scene.texture_slot(texture).unwrap().lock().is_some());
        assert!(scene.white_texture().lock().is_some());
        assert!(scene.debug_lines().is_empty());
    }

    #[test]
    fn invalid_mesh_is_rejected() {
        let (mut renderer, _window, _) = renderer(UVec2::new(8, 8));
        assert!(renderer.add_mesh(MeshData::new(Vec::new(), Vec::new())).is_err());
    }

    #[test]
    fn select_adapter_reuploads_assets() {
        let instance = NullInstance::with_adapters(vec![
            NullAdapterDesc::default(),
            NullAdapterDesc {
                info: AdapterInfo {
                    name: "Second".to_owned(),
                    kind: AdapterKind::IntegratedGpu,
                    vendor_id: 0,
                    device_id: 1,
                },
                features: AdapterFeatures::REQUIRED,
                ..Default::default()
            },
        ]);
        let cache = tempfile::tempdir().unwrap();
        let window = Arc::new(HeadlessWindow::new(UVec2::new(16, 16)));
        let mut renderer =
            Renderer::<Null>::with_instance(config(&cache), instance, window).unwrap();

        let mesh = renderer.add_mesh(MeshData::cube(1.0)).unwrap();
        renderer.render_frame().unwrap();

        assert_eq!(renderer.adapters().unwrap().len(), 2);
        renderer.select_adapter(1).unwrap();
        assert_eq!(renderer.device().unwrap().adapter_index(), 1);
        assert!(renderer.scene().lock().mesh_slot(mesh).unwrap().lock().is_none());

        renderer.render_frame().unwrap();
        assert!(renderer.scene().lock().mesh_slot(mesh).unwrap().lock().is_some());
    }

    #[test]
    fn failed_frame_does_not_block_next_frame() {
        let cache = tempfile::tempdir().unwrap();
        let mut config = config(&cache);
        config.descriptors.set(DescriptorKind::UniformBuffer, 40);

        let instance = NullInstance::with_adapters(vec![NullAdapterDesc::default()]);
        let window = Arc::new(HeadlessWindow::new(UVec2::new(32, 32)));
        let mut renderer = Renderer::<Null>::with_instance(config, instance, window).unwrap();

        let mesh = renderer.add_mesh(MeshData::cube(1.0)).unwrap();
        let instances: Vec<_> = (0..20)
            .map(|_| {
                renderer.add_instance(MeshInstance {
                    mesh,
                    texture: None,
                    transform: Mat4::IDENTITY,
                })
            })
            .collect();

        assert!(matches!(
            renderer.render_frame(),
            Err(Error::OutOfCapacity(_))
        ));
        // The partial frame was submitted but not presented.
        assert_eq!(renderer.present_value(), 1);
        assert_eq!(renderer.device().unwrap().raw().stats().presents, 0);

        for id in instances {
            renderer.remove_instance(id).unwrap();
        }

        assert_eq!(renderer.render_frame().unwrap(), FrameStatus::Presented(2));
        assert_eq!(renderer.render_frame().unwrap(), FrameStatus::Presented(3));
        assert_eq!(renderer.device().unwrap().raw().stats().presents, 2);
        assert_eq!(renderer.frame_stats().reuse_violations, 0);
    }

    #[test]
    fn shutdown_stops_rendering() {
        let (mut renderer, _window, _) = renderer(UVec2::new(16, 16));
        renderer.render_frame().unwrap();
        renderer.shutdown().unwrap();
        assert!(renderer.device().is_none());
        assert!(matches!(renderer.render_frame(), Err(Error::Shutdown)));
        assert!(matches!(renderer.finish_uploads(), Err(Error::Shutdown)));
        assert!(matches!(renderer.select_adapter(0), Err(Error::Shutdown)));
        assert!(renderer.device().is_none());
    }
}
