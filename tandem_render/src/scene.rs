//! State shared between the renderer and the passes drawing it.

use std::sync::Arc;

use glam::{Mat4, Vec3};
use parking_lot::Mutex;

use crate::backend::Api;
use crate::mesh::GpuMesh;
use crate::staging::ResourceSlot;
use crate::texture::GpuTexture;
use crate::ui::UiDrawData;

pub type SharedScene<A> = Arc<Mutex<Scene<A>>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub(crate) u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub(crate) u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) u32);

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Camera {
    pub view: Mat4,
    pub projection: Mat4,
    pub position: Vec3,
}

impl Camera {
    /// A right-handed perspective camera at `position` looking at `target`.
    pub fn look_at(position: Vec3, target: Vec3, aspect_ratio: f32) -> Self {
        Self {
            view: Mat4::look_at_rh(position, target, Vec3::Y),
            projection: Mat4::perspective_rh(60f32.to_radians(), aspect_ratio, 0.1, 1000.0),
            position,
        }
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, 16.0 / 9.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DirectionalLight {
    /// Direction the light travels in.
    pub direction: Vec3,
    pub color: Vec3,
    pub ambient: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.3, -1.0, -0.5).normalize(),
            color: Vec3::ONE,
            ambient: 0.1,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DebugLine {
    pub start: Vec3,
    pub end: Vec3,
    pub color: [u8; 4],
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MeshInstance {
    pub mesh: MeshId,
    /// `None` draws with a white albedo.
    pub texture: Option<TextureId>,
    pub transform: Mat4,
}

/// Meshes, textures and instances drawn by the passes.
///
/// Meshes and textures live in slots filled by the staging engine once their upload
/// completed. Instances referencing an empty slot are skipped.
pub struct Scene<A: Api> {
    pub camera: Camera,
    pub light: DirectionalLight,
    meshes: Vec<ResourceSlot<GpuMesh<A>>>,
    textures: Vec<ResourceSlot<GpuTexture<A>>>,
    white: ResourceSlot<GpuTexture<A>>,
    instances: Vec<Option<MeshInstance>>,
    debug_lines: Vec<DebugLine>,
    ui: UiDrawData,
}

impl<A: Api> Scene<A> {
    pub fn new() -> Self {
        Self {
            camera: Camera::default(),
            light: DirectionalLight::default(),
            meshes: Vec::new(),
            textures: Vec::new(),
            white: ResourceSlot::default(),
            instances: Vec::new(),
            debug_lines: Vec::new(),
            ui: UiDrawData::default(),
        }
    }

    pub fn shared() -> SharedScene<A> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Reserves a slot for a mesh that is being uploaded.
    pub fn insert_mesh(&mut self) -> (MeshId, ResourceSlot<GpuMesh<A>>) {
        let slot = ResourceSlot::default();
        self.meshes.push(Arc::clone(&slot));
        (MeshId(self.meshes.len() as u32 - 1), slot)
    }

    /// Reserves a slot for a texture that is being uploaded.
    pub fn insert_texture(&mut self) -> (TextureId, ResourceSlot<GpuTexture<A>>) {
        let slot = ResourceSlot::default();
        self.textures.push(Arc::clone(&slot));
        (TextureId(self.textures.len() as u32 - 1), slot)
    }

    pub fn mesh_slot(&self, id: MeshId) -> Option<&ResourceSlot<GpuMesh<A>>> {
        self.meshes.get(id.0 as usize)
    }

    pub fn texture_slot(&self, id: TextureId) -> Option<&ResourceSlot<GpuTexture<A>>> {
        self.textures.get(id.0 as usize)
    }

    /// A 1x1 white texture sampled by draws without a texture.
    pub fn white_texture(&self) -> &ResourceSlot<GpuTexture<A>> {
        &self.white
    }

    /// Resolves `texture` to its slot, falling back to the white texture.
    pub fn texture_or_white(&self, texture: Option<TextureId>) -> &ResourceSlot<GpuTexture<A>> {
        texture
            .and_then(|id| self.texture_slot(id))
            .unwrap_or(&self.white)
    }

    pub fn add_instance(&mut self, instance: MeshInstance) -> InstanceId {
        self.instances.push(Some(instance));
        InstanceId(self.instances.len() as u32 - 1)
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut MeshInstance> {
        self.instances.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn remove_instance(&mut self, id: InstanceId) -> Option<MeshInstance> {
        self.instances.get_mut(id.0 as usize)?.take()
    }

    pub fn instances(&self) -> impl Iterator<Item = &MeshInstance> + '_ {
        self.instances.iter().flatten()
    }

    pub fn push_line(&mut self, line: DebugLine) {
        self.debug_lines.push(line);
    }

    pub fn debug_lines(&self) -> &[DebugLine] {
        &self.debug_lines
    }

    /// Removes all queued debug lines. Called once per frame after recording.
    pub fn clear_lines(&mut self) {
        self.debug_lines.clear();
    }

    pub fn set_ui(&mut self, draw_data: UiDrawData) {
        self.ui = draw_data;
    }

    pub fn ui(&self) -> &UiDrawData {
        &self.ui
    }

    /// Drops the GPU copies of all meshes and textures. The slots stay valid and are
    /// filled again by the next upload.
    pub fn release_gpu_resources(&mut self) {
        for slot in &self.meshes {
            slot.lock().take();
        }
        for slot in &self.textures {
            slot.lock().take();
        }
        self.white.lock().take();
    }
}

impl<A: Api> Default for Scene<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use glam::Mat4;

    use crate::backend::null::Null;

    use super::{MeshInstance, Scene};

    #[test]
    fn instances_skip_removed() {
        let mut scene = Scene::<Null>::new();
        let (mesh, slot) = scene.insert_mesh();
        assert!(slot.lock().is_none());

        let a = scene.add_instance(MeshInstance {
            mesh,
            texture: None,
            transform: Mat4::IDENTITY,
        });
        let b = scene.add_instance(MeshInstance {
            mesh,
            texture: None,
            transform: Mat4::IDENTITY,
        });

        assert_eq!(scene.instances().count(), 2);
        scene.remove_instance(a).unwrap();
        assert!(scene.remove_instance(a).is_none());
        assert_eq!(scene.instances().count(), 1);
        assert!(scene.instance_mut(b).is_some());
    }
}
