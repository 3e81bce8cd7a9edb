use std::time::Instant;

use glam::{Mat4, UVec2, Vec2, Vec3};
use tandem_render::mesh::MeshData;
use tandem_render::renderer::FrameStatus;
use tandem_render::scene::{Camera, DebugLine, DirectionalLight, MeshInstance};
use tandem_render::texture::ImageData;
use tandem_render::ui::{RectUi, UiContext};
use tandem_render::AnyRenderer;

use crate::{Args, ViewerError};

/// Distance of the orbiting camera from the origin.
const ORBIT_RADIUS: f32 = 4.0;
/// Radians per second.
const ORBIT_SPEED: f32 = 0.5;

const AXES: [(Vec3, [u8; 4]); 3] = [
    (Vec3::X, [255, 0, 0, 255]),
    (Vec3::Y, [0, 255, 0, 255]),
    (Vec3::Z, [0, 0, 255, 255]),
];

/// A single mesh with an orbiting camera, axis lines and a status bar.
#[derive(Debug)]
pub struct Demo {
    start: Instant,
    frames: u64,
    max_frames: Option<u64>,
    ui: RectUi,
}

impl Demo {
    pub fn new(
        renderer: &mut AnyRenderer,
        args: &Args,
        max_frames: Option<u64>,
    ) -> Result<Self, ViewerError> {
        let mesh = match &args.mesh {
            Some(path) => MeshData::load_obj(path)?,
            None => MeshData::cube(1.5),
        };
        let mesh = renderer.add_mesh(mesh)?;

        let texture = match &args.texture {
            Some(path) => Some(renderer.add_texture(ImageData::load(path)?)?),
            None => None,
        };

        renderer.add_instance(MeshInstance {
            mesh,
            texture,
            transform: Mat4::IDENTITY,
        });
        renderer.set_light(DirectionalLight::default());

        // Present the first frame with all assets in place.
        renderer.finish_uploads()?;

        Ok(Self {
            start: Instant::now(),
            frames: 0,
            max_frames,
            ui: RectUi::new(),
        })
    }

    pub fn is_done(&self) -> bool {
        self.max_frames.is_some_and(|max| self.frames >= max)
    }

    pub fn frame(&mut self, renderer: &mut AnyRenderer, size: UVec2) -> Result<(), ViewerError> {
        let aspect_ratio = if size.y == 0 {
            1.0
        } else {
            size.x as f32 / size.y as f32
        };

        let angle = self.start.elapsed().as_secs_f32() * ORBIT_SPEED;
        let position = Vec3::new(angle.cos(), 0.5, angle.sin()) * ORBIT_RADIUS;
        renderer.set_camera(Camera::look_at(position, Vec3::ZERO, aspect_ratio));

        for (axis, color) in AXES {
            renderer.push_line(DebugLine {
                start: Vec3::ZERO,
                end: axis * 2.0,
                color,
            });
        }

        self.ui.begin_frame(size);
        self.ui.rect(
            Vec2::ZERO,
            Vec2::new(size.x as f32, 24.0),
            [20, 20, 20, 200],
        );
        // Bar filling up once per second.
        let progress = self.start.elapsed().as_secs_f32().fract();
        self.ui.rect(
            Vec2::new(4.0, 8.0),
            Vec2::new(4.0 + progress * 120.0, 16.0),
            [80, 160, 255, 255],
        );
        renderer.set_ui(self.ui.end_frame());

        match renderer.render_frame()? {
            FrameStatus::Presented(value) => {
                self.frames += 1;
                tracing::trace!("presented frame {} (fence value {})", self.frames, value);

                if self.frames % 600 == 0 {
                    let stats = renderer.frame_stats();
                    tracing::info!(
                        "{} frames, {:.1} fps, {} context reuse violations",
                        stats.frames,
                        self.frames as f32 / self.start.elapsed().as_secs_f32(),
                        stats.reuse_violations,
                    );
                }
            }
            FrameStatus::Skipped => (),
            FrameStatus::Rebuild => tracing::debug!("swapchain rebuild requested"),
            FrameStatus::DeviceRestarted => tracing::warn!("device restarted"),
        }

        Ok(())
    }
}
