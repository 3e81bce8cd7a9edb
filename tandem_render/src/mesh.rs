//! Interleaved vertex data and the mesh buffers uploaded from it.

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

use crate::backend::{
    Api, BufferBarrier, BufferState, BufferUsage, CommandEncoder, VertexAttribute, VertexFormat,
    VertexLayout,
};
use crate::device::RenderDevice;
use crate::error::{AssetError, AssetErrorKind, Error, Result};
use crate::resources::Buffer;
use crate::staging::{ResourceSlot, UploadEngine};

/// A vertex as read by the model and debug shaders.
///
/// `POSITION` at offset 0, `NORMAL` at offset 16 and `TEXCOORD` at offset 32.
#[derive(Copy, Clone, Debug, Default, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 3],
    _pad0: f32,
    pub normal: [f32; 3],
    _pad1: f32,
    pub uv: [f32; 2],
    _pad2: [f32; 2],
}

impl Vertex {
    pub const STRIDE: u32 = 48;

    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            uv: uv.to_array(),
            ..Default::default()
        }
    }

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
                    format: VertexFormat::Float32x3,
                    offset: 16,
                },
                VertexAttribute {
                    location: 2,
                    format: VertexFormat::Float32x2,
                    offset: 32,
                },
            ],
        }
    }
}

/// Vertices and triangle list indices of a mesh in host memory.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self { vertices, indices }
    }

    /// Checks that the mesh is a non-empty triangle list with in-bounds indices.
    pub fn validate(&self) -> Result<(), String> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err("mesh has no vertices or indices".to_owned());
        }

        if self.indices.len() % 3 != 0 {
            return Err(format!(
                "index count {} is not a multiple of 3",
                self.indices.len()
            ));
        }

        let len = self.vertices.len() as u32;
        if let Some(index) = self.indices.iter().find(|index| **index >= len) {
            return Err(format!("index {} out of bounds of {} vertices", index, len));
        }

        Ok(())
    }

    /// An axis-aligned cube with side length `size` centered at the origin.
    pub fn cube(size: f32) -> Self {
        let h = size / 2.0;
        let faces = [
            (Vec3::X, Vec3::Z, Vec3::Y),
            (Vec3::NEG_X, Vec3::NEG_Z, Vec3::Y),
            (Vec3::Y, Vec3::X, Vec3::Z),
            (Vec3::NEG_Y, Vec3::X, Vec3::NEG_Z),
            (Vec3::Z, Vec3::NEG_X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::X, Vec3::Y),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in faces {
            let base = vertices.len() as u32;
            for (x, y) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let position = (normal + u * x + v * y) * h;
                let uv = Vec2::new((x + 1.0) / 2.0, (1.0 - y) / 2.0);
                vertices.push(Vertex::new(position, normal, uv));
            }
            indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self { vertices, indices }
    }

    /// Loads a Wavefront OBJ file. Polygons are triangulated as fans.
    pub fn load_obj(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|err| AssetError {
            path: path.to_owned(),
            kind: err.into(),
        })?;

        parse_obj(&source).map_err(|msg| {
            AssetError {
                path: path.to_owned(),
                kind: AssetErrorKind::InvalidData(msg),
            }
            .into()
        })
    }
}

fn parse_obj(source: &str) -> Result<MeshData, String> {
    let mut positions: Vec<Vec3> = Vec::new();
    let mut normals: Vec<Vec3> = Vec::new();
    let mut uvs: Vec<Vec2> = Vec::new();

    let mut mesh = MeshData::default();
    // Vertices are deduplicated by their (position, uv, normal) index triple.
    let mut seen = std::collections::HashMap::new();

    for (line_number, line) in source.lines().enumerate() {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else {
            continue;
        };

        let err = |msg: &str| format!("line {}: {}", line_number + 1, msg);

        match keyword {
            "v" => positions.push(parse_vec3(&mut words).ok_or_else(|| err("invalid v"))?),
            "vn" => normals.push(parse_vec3(&mut words).ok_or_else(|| err("invalid vn"))?),
            "vt" => {
                let u: Option<f32> = words.next().and_then(|w| w.parse().ok());
                let v: Option<f32> = words.next().and_then(|w| w.parse().ok());
                match (u, v) {
                    (Some(u), Some(v)) => uvs.push(Vec2::new(u, 1.0 - v)),
                    _ => return Err(err("invalid vt")),
                }
            }
            "f" => {
                let mut polygon = Vec::new();
                for word in words {
                    let key = parse_face_vertex(word, positions.len(), uvs.len(), normals.len())
                        .ok_or_else(|| err("invalid face vertex"))?;

                    let index = *seen.entry(key).or_insert_with(|| {
                        let (p, t, n) = key;
                        mesh.vertices.push(Vertex::new(
                            positions[p],
                            n.map(|n| normals[n]).unwrap_or_default(),
                            t.map(|t| uvs[t]).unwrap_or_default(),
                        ));
                        mesh.vertices.len() as u32 - 1
                    });
                    polygon.push(index);
                }

                if polygon.len() < 3 {
                    return Err(err("face with less than 3 vertices"));
                }

                for i in 1..polygon.len() - 1 {
                    mesh.indices
                        .extend([polygon[0], polygon[i], polygon[i + 1]]);
                }
            }
            _ => (),
        }
    }

    mesh.validate()?;
    Ok(mesh)
}

fn parse_vec3<'a>(words: &mut impl Iterator<Item = &'a str>) -> Option<Vec3> {
    let x = words.next()?.parse().ok()?;
    let y = words.next()?.parse().ok()?;
    let z = words.next()?.parse().ok()?;
    Some(Vec3::new(x, y, z))
}

/// Parses `p`, `p/t`, `p//n` or `p/t/n` into zero-based indices.
fn parse_face_vertex(
    word: &str,
    positions: usize,
    uvs: usize,
    normals: usize,
) -> Option<(usize, Option<usize>, Option<usize>)> {
    let mut parts = word.split('/');

    let resolve = |part: &str, len: usize| -> Option<usize> {
        let index: i64 = part.parse().ok()?;
        let index = if index < 0 {
            len as i64 + index
        } else {
            index - 1
        };
        (0..len as i64).contains(&index).then_some(index as usize)
    };

    let position = resolve(parts.next()?, positions)?;
    let uv = match parts.next() {
        Some("") | None => None,
        Some(part) => Some(resolve(part, uvs)?),
    };
    let normal = match parts.next() {
        Some("") | None => None,
        Some(part) => Some(resolve(part, normals)?),
    };

    Some((position, uv, normal))
}

/// Device-local vertex and index buffers of a mesh.
pub struct GpuMesh<A: Api> {
    pub vertices: Buffer<A>,
    pub indices: Buffer<A>,
    pub index_count: u32,
}

impl<A: Api> std::fmt::Debug for GpuMesh<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuMesh")
            .field("vertices", &self.vertices)
            .field("indices", &self.indices)
            .field("index_count", &self.index_count)
            .finish()
    }
}

/// Records the upload of `mesh` and stores the buffers in `slot` once they are ready
/// for drawing.
pub fn load_mesh<A: Api>(
    uploads: &mut UploadEngine<A>,
    device: &RenderDevice<A>,
    mesh: &MeshData,
    slot: ResourceSlot<GpuMesh<A>>,
) -> Result<()> {
    mesh.validate().map_err(|err| Error::Backend(format!("invalid mesh: {}", err)))?;

    let vertices =
        uploads.upload_buffer(device, bytemuck::cast_slice(&mesh.vertices), BufferUsage::VERTEX)?;
    let indices =
        uploads.upload_buffer(device, bytemuck::cast_slice(&mesh.indices), BufferUsage::INDEX)?;
    let index_count = mesh.indices.len() as u32;

    uploads.on_finalise(move |ctx| {
        ctx.encoder.buffer_barriers(&[
            BufferBarrier {
                buffer: vertices.raw(),
                src: BufferState::CopyDst,
                dst: BufferState::Vertex,
            },
            BufferBarrier {
                buffer: indices.raw(),
                src: BufferState::CopyDst,
                dst: BufferState::Index,
            },
        ]);

        *slot.lock() = Some(GpuMesh {
            vertices,
            indices,
            index_count,
        });
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::mem::{offset_of, size_of};

    use super::{parse_obj, MeshData, Vertex};

    #[test]
    fn vertex_layout_offsets() {
        assert_eq!(size_of::<Vertex>(), 48);
        assert_eq!(offset_of!(Vertex, position), 0);
        assert_eq!(offset_of!(Vertex, normal), 16);
        assert_eq!(offset_of!(Vertex, uv), 32);

        let layout = Vertex::layout();
        assert_eq!(layout.stride, 48);
        let offsets: Vec<_> = layout.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, [0, 16, 32]);
    }

    #[test]
    fn cube_is_valid() {
        let cube = MeshData::cube(2.0);
        cube.validate().unwrap();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert!(cube
            .vertices
            .iter()
            .all(|v| v.position.iter().all(|c| c.abs() == 1.0)));
    }

    #[test]
    fn obj_quad_is_triangulated() {
        let source = "
            # quad
            v 0 0 0
            v 1 0 0
            v 1 1 0
            v 0 1 0
            vt 0 0
            vn 0 0 1
            f 1/1/1 2/1/1 3/1/1 4/1/1
        ";

        let mesh = parse_obj(source).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices, [0, 1, 2, 0, 2, 3]);
        assert_eq!(mesh.vertices[2].position, [1.0, 1.0, 0.0]);
        assert_eq!(mesh.vertices[0].normal, [0.0, 0.0, 1.0]);
        assert_eq!(mesh.vertices[0].uv, [0.0, 1.0]);
    }

    #[test]
    fn obj_negative_indices_and_errors() {
        let mesh = parse_obj("v 0 0 0\nv 1 0 0\nv 0 1 0\nf -3 -2 -1\n").unwrap();
        assert_eq!(mesh.indices, [0, 1, 2]);

        assert!(parse_obj("v 0 0 0\nf 1 2 3\n").is_err());
        assert!(parse_obj("v 0 0\n").is_err());
        assert!(parse_obj("").is_err());
    }
}
