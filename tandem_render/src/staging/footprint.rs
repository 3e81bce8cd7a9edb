//! Buffer layout of texture subresources for buffer <-> texture copies.
//!
//! Every subresource starts at an offset aligned to
//! [`DeviceLimits::placement_alignment`] and every row starts at a multiple of
//! [`DeviceLimits::row_pitch_alignment`]. Rows are copied one by one from the tightly
//! or loosely packed source data into that layout.

use crate::backend::{Api, DeviceLimits, PlacedFootprint, Subresource, TextureDescriptor};
use crate::error::{Error, Result};
use crate::resources::Buffer;

/// Host data of one texture subresource.
#[derive(Copy, Clone, Debug)]
pub struct SubresourceData<'a> {
    pub data: &'a [u8],
    /// Bytes between the start of two rows in `data`.
    pub row_pitch: u64,
    /// Bytes between the start of two depth slices in `data`.
    pub slice_pitch: u64,
}

impl<'a> SubresourceData<'a> {
    /// Tightly packed rows of `row_size` bytes.
    pub fn packed(data: &'a [u8], row_size: u64, row_count: u32) -> Self {
        Self {
            data,
            row_pitch: row_size,
            slice_pitch: row_size * u64::from(row_count),
        }
    }
}

/// Placed footprints of a range of subresources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyLayout {
    pub footprints: Vec<PlacedFootprint>,
    /// Bytes from `base_offset` to the end of the last subresource.
    pub total_size: u64,
}

pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Returns the mip level and array layer of subresource `index`.
pub fn subresource(desc: &TextureDescriptor, index: u32) -> Subresource {
    Subresource {
        mip_level: index % desc.mip_levels,
        array_layer: index / desc.mip_levels,
    }
}

/// Computes the footprints of `count` subresources starting at `first`, placed after
/// `base_offset`.
pub fn compute_footprints(
    desc: &TextureDescriptor,
    first: u32,
    count: u32,
    base_offset: u64,
    limits: &DeviceLimits,
) -> CopyLayout {
    let bytes_per_texel = u64::from(desc.format.bytes_per_texel());

    let mut footprints = Vec::with_capacity(count as usize);
    let mut cursor = base_offset;

    for index in first..first + count {
        let sub = subresource(desc, index);
        let extent = desc.mip_size(sub.mip_level);

        let row_size = u64::from(extent.x) * bytes_per_texel;
        let row_pitch = align_up(row_size, limits.row_pitch_alignment);
        let offset = align_up(cursor, limits.placement_alignment);

        let footprint = PlacedFootprint {
            offset,
            width: extent.x,
            height: extent.y,
            depth: 1,
            row_pitch,
            row_size,
            row_count: extent.y,
        };

        cursor = offset + row_pitch * u64::from(footprint.row_count) * u64::from(footprint.depth);
        footprints.push(footprint);
    }

    CopyLayout {
        footprints,
        total_size: cursor - base_offset,
    }
}

/// Copies `src` into `dst` row by row following `footprint`.
///
/// Returns an error if `src` is smaller than the footprint requires.
pub fn copy_subresource<A: Api>(
    dst: &Buffer<A>,
    footprint: &PlacedFootprint,
    src: &SubresourceData<'_>,
) -> Result<()> {
    let slices = u64::from(footprint.depth);
    let rows = u64::from(footprint.row_count);
    if rows == 0 || slices == 0 {
        return Ok(());
    }

    let required =
        (slices - 1) * src.slice_pitch + (rows - 1) * src.row_pitch + footprint.row_size;
    if (src.data.len() as u64) < required {
        return Err(Error::Backend(format!(
            "subresource data has {} bytes, footprint requires {}",
            src.data.len(),
            required
        )));
    }

    let dst_slice_pitch = footprint.row_pitch * rows;
    for z in 0..slices {
        for y in 0..rows {
            let src_start = (z * src.slice_pitch + y * src.row_pitch) as usize;
            let row = &src.data[src_start..src_start + footprint.row_size as usize];

            dst.write(
                footprint.offset + z * dst_slice_pitch + y * footprint.row_pitch,
                row,
            )?;
        }
    }

    Ok(())
}

/// Reads a subresource written in `footprint` layout and removes the row padding.
pub fn read_subresource<A: Api>(src: &Buffer<A>, footprint: &PlacedFootprint) -> Result<Vec<u8>> {
    let rows = footprint.row_count * footprint.depth;

    let mut out = Vec::with_capacity((footprint.row_size * u64::from(rows)) as usize);
    for y in 0..u64::from(rows) {
        let row = src.read(footprint.offset + y * footprint.row_pitch, footprint.row_size)?;
        out.extend_from_slice(&row);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use glam::UVec2;

    use crate::backend::null::Null;
    use crate::backend::{DeviceLimits, TextureDescriptor, TextureFormat, TextureUsage};
    use crate::resources::ResourceAllocator;
    use crate::test_util::null_device;

    use super::{
        align_up, compute_footprints, copy_subresource, read_subresource, subresource,
        SubresourceData,
    };

    const LIMITS: DeviceLimits = DeviceLimits {
        row_pitch_alignment: 256,
        placement_alignment: 512,
        uniform_buffer_alignment: 256,
        max_sampler_anisotropy: 16.0,
        max_texture_dimension: 16384,
    };

    #[test]
    fn align_up_values() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(7, 1), 7);
    }

    #[test]
    fn footprints_of_mip_chain() {
        let desc = TextureDescriptor {
            size: UVec2::new(100, 10),
            mip_levels: 3,
            array_layers: 2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLED,
        };

        let layout = compute_footprints(&desc, 0, desc.subresource_count(), 0, &LIMITS);
        assert_eq!(layout.footprints.len(), 6);

        let first = layout.footprints[0];
        assert_eq!(first.offset, 0);
        assert_eq!(first.row_size, 400);
        assert_eq!(first.row_pitch, 512);
        assert_eq!(first.row_count, 10);

        let second = layout.footprints[1];
        assert_eq!(second.width, 50);
        assert_eq!(second.row_count, 5);
        assert_eq!(second.offset, 512 * 10);
        assert_eq!(second.row_pitch, 256);

        for footprint in &layout.footprints {
            assert_eq!(footprint.offset % LIMITS.placement_alignment, 0);
            assert_eq!(footprint.row_pitch % LIMITS.row_pitch_alignment, 0);
        }

        assert_eq!(subresource(&desc, 4).mip_level, 1);
        assert_eq!(subresource(&desc, 4).array_layer, 1);
    }

    #[test]
    fn footprints_respect_base_offset() {
        let desc = TextureDescriptor::new_2d(
            UVec2::new(8, 8),
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED,
        );

        let layout = compute_footprints(&desc, 0, 1, 1000, &LIMITS);
        assert_eq!(layout.footprints[0].offset, 1024);
        assert_eq!(layout.total_size, 24 + 256 * 8);
    }

    #[test]
    fn copy_and_read_pitched_rows() {
        let device = null_device();
        let buffer = ResourceAllocator::<Null>::new(&device)
            .create_staging_buffer(4096)
            .unwrap();

        let desc = TextureDescriptor::new_2d(
            UVec2::new(3, 2),
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED,
        );
        let layout = compute_footprints(&desc, 0, 1, 0, &LIMITS);
        let footprint = layout.footprints[0];

        // Source rows padded to 16 bytes.
        let mut data = vec![0xff; 32];
        data[..12].copy_from_slice(&[1; 12]);
        data[16..28].copy_from_slice(&[2; 12]);
        let src = SubresourceData {
            data: &data,
            row_pitch: 16,
            slice_pitch: 32,
        };

        copy_subresource(&buffer, &footprint, &src).unwrap();
        assert_eq!(buffer.read(256, 12).unwrap(), vec![2; 12]);

        let packed = read_subresource(&buffer, &footprint).unwrap();
        assert_eq!(&packed[..12], &[1; 12]);
        assert_eq!(&packed[12..], &[2; 12]);

        let short = SubresourceData::packed(&data[..20], 12, 2);
        assert!(copy_subresource(&buffer, &footprint, &short).is_err());
    }
}
