//! RGBA8 images and their upload into sampled textures.

use std::fmt::{self, Debug, Formatter};
use std::path::Path;

use glam::UVec2;
use image::{ColorType, DynamicImage};

use crate::backend::{
    Api, DescriptorKind, DescriptorWrite, TextureDescriptor, TextureFormat, TextureLayout,
    TextureUsage,
};
use crate::descriptors::DescriptorHandle;
use crate::device::RenderDevice;
use crate::error::{AssetError, AssetErrorKind, Result};
use crate::resources::Texture;
use crate::staging::{ResourceSlot, SubresourceData, UploadEngine};

/// An 8-bit RGBA image in host memory.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    size: UVec2,
    srgb: bool,
    pixels: Vec<u8>,
}

impl ImageData {
    /// Creates an image from tightly packed RGBA8 pixels.
    pub fn new(size: UVec2, pixels: Vec<u8>) -> Result<Self, String> {
        Self::from_channels(size, 4, pixels)
    }

    /// Creates an image from tightly packed pixels with 1 to 4 channels.
    ///
    /// One channel is treated as luminance and two as luminance with alpha. Missing
    /// alpha is filled with 255.
    pub fn from_channels(size: UVec2, channels: u32, pixels: Vec<u8>) -> Result<Self, String> {
        if !(1..=4).contains(&channels) {
            return Err(format!("unsupported channel count {}", channels));
        }

        let expected = size.x as usize * size.y as usize * channels as usize;
        if size.x == 0 || size.y == 0 || pixels.len() != expected {
            return Err(format!(
                "expected {} bytes for a {}x{} image with {} channels, got {}",
                expected,
                size.x,
                size.y,
                channels,
                pixels.len()
            ));
        }

        Ok(Self {
            size,
            srgb: true,
            pixels: expand_to_rgba(&pixels, channels),
        })
    }

    /// A single-texel image.
    pub fn solid(color: [u8; 4]) -> Self {
        Self {
            size: UVec2::ONE,
            srgb: true,
            pixels: color.to_vec(),
        }
    }

    /// Loads and decodes an image file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let err = |kind: AssetErrorKind| AssetError {
            path: path.to_owned(),
            kind,
        };

        let image = image::open(path).map_err(|err_| err(err_.into()))?;
        Self::from_dynamic(image).map_err(|msg| err(AssetErrorKind::InvalidData(msg)).into())
    }

    /// Decodes an image from an in-memory file.
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let image = image::load_from_memory(bytes)?;
        // 8-bit and converted images always have a valid size.
        Self::from_dynamic(image).map_err(|msg| {
            image::ImageError::Decoding(image::error::DecodingError::new(
                image::error::ImageFormatHint::Unknown,
                msg,
            ))
        })
    }

    fn from_dynamic(image: DynamicImage) -> Result<Self, String> {
        let size = UVec2::new(image.width(), image.height());
        match image.color() {
            ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8 => {
                let channels = u32::from(image.color().channel_count());
                Self::from_channels(size, channels, image.into_bytes())
            }
            _ => Self::new(size, image.into_rgba8().into_raw()),
        }
    }

    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn is_srgb(&self) -> bool {
        self.srgb
    }

    /// Marks the image as linear data, e.g. a normal map.
    pub fn set_srgb(&mut self, srgb: bool) {
        self.srgb = srgb;
    }

    pub fn format(&self) -> TextureFormat {
        if self.srgb {
            TextureFormat::Rgba8UnormSrgb
        } else {
            TextureFormat::Rgba8Unorm
        }
    }

    pub fn descriptor(&self) -> TextureDescriptor {
        TextureDescriptor::new_2d(self.size, self.format(), TextureUsage::SAMPLED)
    }
}

impl Debug for ImageData {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("size", &self.size)
            .field("srgb", &self.srgb)
            .finish_non_exhaustive()
    }
}

/// Expands tightly packed pixels with `channels` channels to RGBA8.
pub fn expand_to_rgba(pixels: &[u8], channels: u32) -> Vec<u8> {
    match channels {
        4 => pixels.to_vec(),
        3 => pixels
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], u8::MAX])
            .collect(),
        2 => pixels
            .chunks_exact(2)
            .flat_map(|px| [px[0], px[0], px[0], px[1]])
            .collect(),
        1 => pixels
            .iter()
            .flat_map(|l| [*l, *l, *l, u8::MAX])
            .collect(),
        _ => unreachable!("invalid channel count {}", channels),
    }
}

/// A sampled texture with a view and a descriptor referencing it.
pub struct GpuTexture<A: Api> {
    // The descriptor references the view which references the texture.
    descriptor: DescriptorHandle<A>,
    view: A::TextureView,
    texture: Texture<A>,
}

impl<A: Api> GpuTexture<A> {
    /// Creates the view and descriptor of `texture`.
    pub fn new(device: &RenderDevice<A>, texture: Texture<A>) -> Result<Self> {
        let view = texture.create_full_view(device.raw())?;
        let descriptor = device.allocate_descriptor(DescriptorKind::SampledImage)?;
        descriptor.write(device.raw(), &DescriptorWrite::SampledTexture(&view));

        Ok(Self {
            descriptor,
            view,
            texture,
        })
    }

    pub fn texture(&self) -> &Texture<A> {
        &self.texture
    }

    pub fn view(&self) -> &A::TextureView {
        &self.view
    }

    pub fn descriptor(&self) -> &DescriptorHandle<A> {
        &self.descriptor
    }
}

impl<A: Api> Debug for GpuTexture<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuTexture")
            .field("texture", &self.texture)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Records the upload of `image` and stores the texture in `slot` once it is ready
/// for sampling.
pub fn load_image<A: Api>(
    uploads: &mut UploadEngine<A>,
    device: &RenderDevice<A>,
    image: &ImageData,
    slot: ResourceSlot<GpuTexture<A>>,
) -> Result<()> {
    let data = SubresourceData::packed(
        image.pixels(),
        u64::from(image.size().x) * 4,
        image.size().y,
    );
    let texture = uploads.upload_texture(device, &image.descriptor(), &[data])?;
    let mut texture = GpuTexture::new(device, texture)?;

    uploads.on_finalise(move |ctx| {
        texture
            .texture
            .transition(ctx.encoder, TextureLayout::ShaderRead);
        *slot.lock() = Some(texture);
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use glam::UVec2;

    use super::{expand_to_rgba, ImageData};

    #[test]
    fn expand_channels() {
        assert_eq!(expand_to_rgba(&[10], 1), [10, 10, 10, 255]);
        assert_eq!(expand_to_rgba(&[10, 20], 2), [10, 10, 10, 20]);
        assert_eq!(expand_to_rgba(&[1, 2, 3, 4, 5, 6], 3), [1, 2, 3, 255, 4, 5, 6, 255]);
        assert_eq!(expand_to_rgba(&[1, 2, 3, 4], 4), [1, 2, 3, 4]);
    }

    #[test]
    fn image_size_is_checked() {
        assert!(ImageData::new(UVec2::new(2, 2), vec![0; 16]).is_ok());
        assert!(ImageData::new(UVec2::new(2, 2), vec![0; 15]).is_err());
        assert!(ImageData::from_channels(UVec2::new(2, 2), 5, vec![0; 20]).is_err());
        assert!(ImageData::new(UVec2::new(0, 2), Vec::new()).is_err());

        let image = ImageData::from_channels(UVec2::new(2, 1), 3, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(image.pixels().len(), 8);
    }

    #[test]
    fn decode_png_gray() {
        let mut png = Vec::new();
        image::GrayImage::from_raw(2, 1, vec![7, 9])
            .unwrap()
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let image = ImageData::decode(&png).unwrap();
        assert_eq!(image.size(), UVec2::new(2, 1));
        assert_eq!(image.pixels(), [7, 7, 7, 255, 9, 9, 9, 255]);
    }
}
