//! Contract between the renderer and an immediate-mode UI library.
//!
//! A UI library implements [`UiContext`]. The application calls
//! [`UiContext::begin_frame`], builds its widgets and hands the [`UiDrawData`] returned
//! by [`UiContext::end_frame`] to the renderer which records it in the UI pass.

use bytemuck::{Pod, Zeroable};
use glam::{UVec2, Vec2};

use crate::backend::{ScissorRect, VertexAttribute, VertexFormat, VertexLayout};
use crate::scene::TextureId;

pub trait UiContext {
    fn begin_frame(&mut self, size: UVec2);

    fn end_frame(&mut self) -> UiDrawData;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct UiVertex {
    /// Position in physical pixels from the top-left corner.
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: [u8; 4],
}

impl UiVertex {
    pub const STRIDE: u32 = 20;

    pub fn layout() -> VertexLayout {
        VertexLayout {
            stride: Self::STRIDE,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x2,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x2,
                    offset: 8,
                },
                VertexAttribute {
                    location: 2,
                    format: VertexFormat::Unorm8x4,
                    offset: 16,
                },
            ],
        }
    }
}

/// Texture sampled by a draw command.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum UiTexture {
    /// A white texel. Used for untextured geometry.
    #[default]
    White,
    Scene(TextureId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct UiDrawCommand {
    pub clip: ScissorRect,
    pub texture: UiTexture,
    pub first_index: u32,
    pub index_count: u32,
}

/// Triangles of one UI frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UiDrawData {
    pub size: UVec2,
    pub vertices: Vec<UiVertex>,
    pub indices: Vec<u32>,
    pub commands: Vec<UiDrawCommand>,
}

impl UiDrawData {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// A minimal [`UiContext`] drawing solid and textured rectangles.
#[derive(Clone, Debug, Default)]
pub struct RectUi {
    data: UiDrawData,
    clip: Option<ScissorRect>,
}

impl RectUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clips all following rectangles. `None` clips to the whole frame.
    pub fn set_clip(&mut self, clip: Option<ScissorRect>) {
        self.clip = clip;
    }

    pub fn rect(&mut self, min: Vec2, max: Vec2, color: [u8; 4]) {
        self.textured_rect(min, max, color, UiTexture::White);
    }

    pub fn textured_rect(&mut self, min: Vec2, max: Vec2, color: [u8; 4], texture: UiTexture) {
        let clip = self
            .clip
            .unwrap_or_else(|| ScissorRect::from_extent(self.data.size));

        let base = self.data.vertices.len() as u32;
        for (x, y, u, v) in [
            (min.x, min.y, 0.0, 0.0),
            (max.x, min.y, 1.0, 0.0),
            (max.x, max.y, 1.0, 1.0),
            (min.x, max.y, 0.0, 1.0),
        ] {
            self.data.vertices.push(UiVertex {
                position: [x, y],
                uv: [u, v],
                color,
            });
        }

        let first_index = self.data.indices.len() as u32;
        self.data
            .indices
            .extend([base, base + 1, base + 2, base, base + 2, base + 3]);

        // Consecutive rectangles with the same state share one command.
        match self.data.commands.last_mut() {
            Some(last)
                if last.clip == clip
                    && last.texture == texture
                    && last.first_index + last.index_count == first_index =>
            {
                last.index_count += 6;
            }
            _ => self.data.commands.push(UiDrawCommand {
                clip,
                texture,
                first_index,
                index_count: 6,
            }),
        }
    }
}

impl UiContext for RectUi {
    fn begin_frame(&mut self, size: UVec2) {
        self.data = UiDrawData {
            size,
            ..Default::default()
        };
        self.clip = None;
    }

    fn end_frame(&mut self) -> UiDrawData {
        std::mem::take(&mut self.data)
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use glam::{UVec2, Vec2};

    use crate::backend::ScissorRect;

    use super::{RectUi, UiContext, UiTexture, UiVertex};

    #[test]
    fn ui_vertex_stride() {
        assert_eq!(size_of::<UiVertex>() as u32, UiVertex::STRIDE);
    }

    #[test]
    fn rect_ui_batches_commands() {
        let mut ui = RectUi::new();
        ui.begin_frame(UVec2::new(100, 50));
        ui.rect(Vec2::ZERO, Vec2::splat(10.0), [255; 4]);
        ui.rect(Vec2::splat(10.0), Vec2::splat(20.0), [255; 4]);
        ui.set_clip(Some(ScissorRect {
            x: 0,
            y: 0,
            width: 5,
            height: 5,
        }));
        ui.rect(Vec2::ZERO, Vec2::splat(10.0), [255; 4]);

        let data = ui.end_frame();
        assert_eq!(data.size, UVec2::new(100, 50));
        assert_eq!(data.vertices.len(), 12);
        assert_eq!(data.indices.len(), 18);
        assert_eq!(data.commands.len(), 2);
        assert_eq!(data.commands[0].index_count, 12);
        assert_eq!(data.commands[0].clip.width, 100);
        assert_eq!(data.commands[1].first_index, 12);
        assert_eq!(data.commands[1].texture, UiTexture::White);

        ui.begin_frame(UVec2::new(100, 50));
        assert!(ui.end_frame().is_empty());
    }
}
