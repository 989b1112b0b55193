//! Browser entry point. Only the in-process image path is exported; PDF and
//! video compression need external tools.

use wasm_bindgen::prelude::*;

use crate::cancel::CancelToken;
use crate::config::CompressorConfig;
use crate::controller::Compressor;
use crate::encoder::{ImageEncoder, RasterEncoder};
use crate::error::{CompressError, Result};
use crate::model::{CompressionRequest, MediaKind, SourceArtifact};

/// Compresses an in-memory image to at most `target_bytes`, returning the
/// best effort even when the target cannot be met.
pub fn compress_image_bytes(input: &[u8], target_bytes: u64) -> Result<Vec<u8>> {
    let extension = RasterEncoder.decode(input)?.format.extension();
    let source = SourceArtifact::from_bytes(
        format!("input.{}", extension),
        MediaKind::Image,
        input.to_vec(),
    );
    let compressor = Compressor::new(CompressorConfig::default())?;
    let request = compressor.config().request(source, target_bytes);
    let outcome = compressor.compress(&request, &CancelToken::new())?;
    outcome.artifact.to_vec()
}

#[wasm_bindgen]
pub fn compress_image_to_target(
    input: &[u8],
    target_bytes: u32,
) -> std::result::Result<Vec<u8>, JsError> {
    compress_image_bytes(input, target_bytes as u64).map_err(|e| match e {
        CompressError::InvalidRequest(reason) => {
            JsError::new(&format!("invalid input: {}", reason))
        }
        other => JsError::new(&other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::raster::encode_dynamic;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    #[test]
    fn shrinks_a_png_in_memory() {
        let img = RgbImage::from_fn(64, 64, |x, y| {
            Rgb([(x * 4) as u8, (y * 4) as u8, (x ^ y) as u8])
        });
        let png = encode_dynamic(&DynamicImage::ImageRgb8(img), ImageFormat::Png).unwrap();
        let target = png.len() as u64 / 2;
        let out = compress_image_bytes(&png, target).unwrap();
        assert!(!out.is_empty());
        assert!(image::load_from_memory(&out).is_ok());
    }

    #[test]
    fn rejects_non_images() {
        assert!(matches!(
            compress_image_bytes(b"hello", 10),
            Err(CompressError::InvalidRequest(_))
        ));
    }
}
