//! In-process still-image encoder on the `image` crate.

use std::borrow::Cow;
use std::io::Cursor;

use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
#[cfg(target_arch = "wasm32")]
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, Frame, GenericImageView, ImageFormat, RgbImage};
use log::debug;

use super::{Encoded, ImageEncoder};
use crate::error::{CompressError, Result};
use crate::model::Dimensions;

const ENCODER: &str = "image";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
    Gif,
}

impl OutputFormat {
    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
            ImageFormat::Png => Some(OutputFormat::Png),
            ImageFormat::WebP => Some(OutputFormat::WebP),
            ImageFormat::Gif => Some(OutputFormat::Gif),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
            OutputFormat::Gif => "gif",
        }
    }

    /// Whether the quality argument changes the output size at all.
    pub fn has_quality_knob(&self) -> bool {
        match self {
            OutputFormat::Jpeg | OutputFormat::Png => true,
            // libwebp is not built for wasm; the fallback there is lossless
            OutputFormat::WebP => cfg!(not(target_arch = "wasm32")),
            OutputFormat::Gif => false,
        }
    }
}

/// A decoded source image plus what the output policy needs to know about it.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub pixels: DynamicImage,
    pub format: OutputFormat,
    pub dimensions: Dimensions,
    pub has_alpha: bool,
}

impl SourceImage {
    /// Output format for a given budget. Transparent PNGs that must shrink
    /// below `webp_ratio` of their size go to WebP; everything else keeps its format.
    pub fn output_format(
        &self,
        original_bytes: u64,
        target_bytes: u64,
        webp_ratio: f64,
    ) -> OutputFormat {
        if self.format == OutputFormat::Png
            && self.has_alpha
            && (target_bytes as f64) < original_bytes as f64 * webp_ratio
        {
            OutputFormat::WebP
        } else {
            self.format
        }
    }
}

fn encode_error(e: image::ImageError) -> CompressError {
    CompressError::failure(ENCODER, e.to_string())
}

/// Composites onto white; JPEG has no alpha channel.
fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in rgb.pixels_mut().zip(rgba.pixels()) {
        let alpha = src[3] as u16;
        for c in 0..3 {
            dst[c] = ((src[c] as u16 * alpha + 255 * (255 - alpha)) / 255) as u8;
        }
    }
    rgb
}

/// Narrows exotic pixel layouts (16-bit, float) to the 8-bit ones every codec accepts.
fn eight_bit(img: &DynamicImage) -> Cow<'_, DynamicImage> {
    match img {
        DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageRgb8(_)
        | DynamicImage::ImageRgba8(_) => Cow::Borrowed(img),
        other if other.color().has_alpha() => {
            Cow::Owned(DynamicImage::ImageRgba8(other.to_rgba8()))
        }
        other => Cow::Owned(DynamicImage::ImageRgb8(other.to_rgb8())),
    }
}

/// Quality 1..=100 to deflate effort. Lower quality means a harder squeeze.
fn png_compression(quality: u8) -> CompressionType {
    match quality {
        67..=u8::MAX => CompressionType::Fast,
        34..=66 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RasterEncoder;

impl RasterEncoder {
    fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
        match img {
            DynamicImage::ImageLuma8(gray) => encoder
                .encode(gray.as_raw(), gray.width(), gray.height(), ColorType::L8.into())
                .map_err(encode_error)?,
            _ => {
                let rgb = if img.color().has_alpha() {
                    flatten_onto_white(img)
                } else {
                    img.to_rgb8()
                };
                encoder
                    .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8.into())
                    .map_err(encode_error)?
            }
        }
        Ok(buffer)
    }

    fn encode_png(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let encoder = PngEncoder::new_with_quality(
            &mut buffer,
            png_compression(quality),
            PngFilter::Adaptive,
        );
        eight_bit(img).write_with_encoder(encoder).map_err(encode_error)?;
        Ok(buffer)
    }

    /// Lossy VP8 through libwebp; alpha is kept when the source has it.
    #[cfg(not(target_arch = "wasm32"))]
    fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
        let quality = quality.clamp(1, 100) as f32;
        let encoded = if img.color().has_alpha() {
            let rgba = img.to_rgba8();
            webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height())
                .encode_simple(false, quality)
        } else {
            let rgb = img.to_rgb8();
            webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height())
                .encode_simple(false, quality)
        };
        let memory = encoded.map_err(|e| CompressError::failure("webp", format!("{:?}", e)))?;
        Ok(memory.to_vec())
    }

    #[cfg(target_arch = "wasm32")]
    fn encode_webp(img: &DynamicImage, _quality: u8) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let encoder = WebPEncoder::new_lossless(&mut buffer);
        eight_bit(img).write_with_encoder(encoder).map_err(encode_error)?;
        Ok(buffer)
    }

    fn encode_gif(img: &DynamicImage) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut buffer);
            encoder
                .encode_frame(Frame::new(img.to_rgba8()))
                .map_err(encode_error)?;
        }
        Ok(buffer)
    }
}

impl ImageEncoder for RasterEncoder {
    fn decode(&self, bytes: &[u8]) -> Result<SourceImage> {
        let format = image::guess_format(bytes)
            .map_err(|e| CompressError::invalid(format!("unrecognised image: {}", e)))?;
        let output = OutputFormat::from_image_format(format).ok_or_else(|| {
            CompressError::invalid(format!("unsupported image format {:?}", format))
        })?;
        let pixels = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| CompressError::invalid(format!("cannot decode image: {}", e)))?;
        let (width, height) = pixels.dimensions();
        debug!("Decoded {:?} {}x{} ({:?})", format, width, height, pixels.color());
        Ok(SourceImage {
            has_alpha: pixels.color().has_alpha(),
            dimensions: Dimensions::new(width, height),
            format: output,
            pixels,
        })
    }

    fn encode(
        &self,
        image: &SourceImage,
        format: OutputFormat,
        quality: u8,
        dimensions: Option<Dimensions>,
    ) -> Result<Encoded> {
        let img = match dimensions {
            Some(d) if d != image.dimensions => Cow::Owned(image.pixels.resize_exact(
                d.width,
                d.height,
                FilterType::Lanczos3,
            )),
            _ => Cow::Borrowed(&image.pixels),
        };
        let bytes = match format {
            OutputFormat::Jpeg => Self::encode_jpeg(&img, quality)?,
            OutputFormat::Png => Self::encode_png(&img, quality)?,
            OutputFormat::WebP => Self::encode_webp(&img, quality)?,
            OutputFormat::Gif => Self::encode_gif(&img)?,
        };
        Ok(Encoded::from_bytes(bytes))
    }
}

/// Encodes `img` in `format` with default settings. Used to build fixtures.
pub fn encode_dynamic(img: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    eight_bit(img)
        .write_to(&mut cursor, format)
        .map_err(encode_error)?;
    Ok(cursor.into_inner())
}
