//! In-process PDF encoder: re-encodes every embedded raster image as JPEG at
//! a tier's quality and pixel limit, leaving text and vector content alone.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, GrayImage, RgbImage};
use lopdf::{Document, Object, ObjectId, Stream};
use log::{debug, info, warn};

use super::{Encoded, PdfEncoder};
use crate::cancel::CancelToken;
use crate::error::{CompressError, Result};
use crate::search::{PdfPreset, QualityTier};
use crate::workspace::Workspace;

const ENCODER: &str = "lopdf";

/// Long side of a US letter page in inches; `dpi * PAGE_INCHES` bounds image pixels.
const PAGE_INCHES: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSettings {
    pub quality: u8,
    pub max_dim: u32,
}

impl ImageSettings {
    pub fn for_tier(tier: &QualityTier) -> Self {
        let quality = match tier.preset {
            PdfPreset::Screen => 40,
            PdfPreset::Ebook => 60,
            PdfPreset::Printer | PdfPreset::Default => 75,
            PdfPreset::Prepress => 85,
        };
        Self {
            quality,
            max_dim: tier.dpi.saturating_mul(PAGE_INCHES).max(1),
        }
    }
}

fn failure(reason: impl Into<String>) -> CompressError {
    CompressError::failure(ENCODER, reason)
}

fn decompress_stream(stream: &Stream) -> Result<Vec<u8>> {
    if stream.dict.get(b"Filter").is_err() {
        return Ok(stream.content.clone());
    }
    match stream.decompressed_content() {
        Ok(content) => Ok(content),
        Err(e) => match stream.dict.get(b"Filter") {
            Ok(Object::Name(name)) if name == b"FlateDecode" => {
                // lopdf rejects some predictor combinations; plain zlib still works
                let mut decoder = flate2::read::ZlibDecoder::new(&stream.content[..]);
                let mut buffer = Vec::new();
                decoder.read_to_end(&mut buffer)?;
                Ok(buffer)
            }
            _ => Err(failure(format!("cannot decompress stream: {:?}", e))),
        },
    }
}

/// Replaces indirect `Filter` / `DecodeParms` entries with the objects they point to.
fn inline_references(doc: &mut Document, id: ObjectId, key: &[u8]) {
    let resolved = match doc.objects.get(&id) {
        Some(Object::Stream(stream)) => match stream.dict.get(key) {
            Ok(Object::Reference(target)) => {
                Some(doc.objects.get(target).cloned().unwrap_or(Object::Null))
            }
            Ok(Object::Array(items)) if items.iter().any(|o| matches!(o, Object::Reference(_))) => {
                Some(Object::Array(
                    items
                        .iter()
                        .map(|item| match item {
                            Object::Reference(target) => {
                                doc.objects.get(target).cloned().unwrap_or_else(|| item.clone())
                            }
                            _ => item.clone(),
                        })
                        .collect(),
                ))
            }
            _ => None,
        },
        _ => None,
    };
    if let (Some(value), Some(Object::Stream(stream))) = (resolved, doc.objects.get_mut(&id)) {
        stream.dict.set(key.to_vec(), value);
    }
}

fn is_dct(filter: Option<&Object>) -> bool {
    match filter {
        Some(Object::Name(name)) => name == b"DCTDecode",
        Some(Object::Array(items)) => items
            .iter()
            .any(|o| matches!(o, Object::Name(name) if name == b"DCTDecode")),
        _ => false,
    }
}

fn dimension(stream: &Stream, key: &[u8]) -> u32 {
    stream
        .dict
        .get(key)
        .and_then(|o| o.as_i64())
        .unwrap_or(0)
        .clamp(0, u32::MAX as i64) as u32
}

fn cmyk_to_rgb(content: &[u8]) -> Vec<u8> {
    content
        .chunks_exact(4)
        .flat_map(|px| {
            let k = 1.0 - px[3] as f32 / 255.0;
            [0, 1, 2].map(|i| ((1.0 - px[i] as f32 / 255.0) * k * 255.0) as u8)
        })
        .collect()
}

/// Builds pixels from raw sample bytes, falling back to a container decode (DCT, PNG).
fn decode_samples(
    content: Vec<u8>,
    width: u32,
    height: u32,
    color_space: Option<&[u8]>,
) -> Result<DynamicImage> {
    let area = width as usize * height as usize;
    let components = match color_space {
        Some(b"DeviceGray") => 1,
        Some(b"DeviceRGB") => 3,
        Some(b"DeviceCMYK") => 4,
        Some(_) => 3,
        None if content.len() == area => 1,
        None if content.len() == area * 4 => 4,
        None => 3,
    };
    let container = || image::load_from_memory(&content).ok();
    let img = match components {
        1 => GrayImage::from_raw(width, height, content.clone())
            .map(DynamicImage::ImageLuma8)
            .or_else(|| container().map(|i| DynamicImage::ImageLuma8(i.to_luma8()))),
        3 => RgbImage::from_raw(width, height, content.clone())
            .map(DynamicImage::ImageRgb8)
            .or_else(|| container().map(|i| DynamicImage::ImageRgb8(i.to_rgb8()))),
        _ => container().or_else(|| {
            RgbImage::from_raw(width, height, cmyk_to_rgb(&content)).map(DynamicImage::ImageRgb8)
        }),
    };
    img.ok_or_else(|| {
        failure(format!(
            "cannot decode {}-component image {}x{}",
            components, width, height
        ))
    })
}

fn jpeg(pixels: &[u8], width: u32, height: u32, color: ColorType, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode(pixels, width, height, color.into())
        .map_err(|e| failure(e.to_string()))?;
    Ok(buffer)
}

fn replace_content(
    doc: &mut Document,
    id: ObjectId,
    content: Vec<u8>,
    filter: &[u8],
    color_space: &[u8],
    (w, h): (u32, u32),
) {
    if let Some(Object::Stream(stream)) = doc.objects.get_mut(&id) {
        stream.dict.set("Length", Object::Integer(content.len() as i64));
        stream.content = content;
        stream.dict.set("Filter", Object::Name(filter.to_vec()));
        stream.dict.set("Width", Object::Integer(w as i64));
        stream.dict.set("Height", Object::Integer(h as i64));
        stream.dict.set("ColorSpace", Object::Name(color_space.to_vec()));
        stream.dict.set("BitsPerComponent", Object::Integer(8));
        stream.dict.remove(b"DecodeParms");
        stream.dict.remove(b"Decode");
    }
}

/// Re-encodes one image XObject (and its soft mask, if any). Returns a short
/// description of what changed, or `None` when the original stream was kept.
pub fn recompress_image(
    doc: &mut Document,
    id: ObjectId,
    settings: ImageSettings,
) -> Result<Option<String>> {
    inline_references(doc, id, b"Filter");
    inline_references(doc, id, b"DecodeParms");

    let (original_len, smask, mut img) = {
        let stream = match doc.objects.get(&id) {
            Some(Object::Stream(s)) => s,
            _ => return Err(failure("image object is not a stream")),
        };
        let smask = match stream.dict.get(b"SMask") {
            Ok(Object::Reference(mask)) => Some(*mask),
            _ => None,
        };
        let content = if is_dct(stream.dict.get(b"Filter").ok()) {
            stream
                .decompressed_content()
                .unwrap_or_else(|_| stream.content.clone())
        } else {
            decompress_stream(stream)?
        };
        let color_space = match stream.dict.get(b"ColorSpace") {
            Ok(Object::Name(name)) => Some(name.as_slice()),
            _ => None,
        };
        let img = decode_samples(
            content,
            dimension(stream, b"Width"),
            dimension(stream, b"Height"),
            color_space,
        )?;
        (stream.content.len(), smask, img)
    };

    if let Some(mask_id) = smask {
        let mask = match doc.objects.get(&mask_id) {
            Some(Object::Stream(s)) => s,
            _ => return Err(failure("soft mask is not a stream")),
        };
        let (mw, mh) = (dimension(mask, b"Width"), dimension(mask, b"Height"));
        if (mw, mh) == img.dimensions() {
            let alpha = GrayImage::from_raw(mw, mh, decompress_stream(mask)?)
                .ok_or_else(|| failure("soft mask has the wrong sample count"))?;
            let mut rgba = img.to_rgba8();
            for (x, y, pixel) in rgba.enumerate_pixels_mut() {
                pixel[3] = alpha.get_pixel(x, y)[0];
            }
            img = DynamicImage::ImageRgba8(rgba);
        }
    }

    let (w0, h0) = img.dimensions();
    let resized = w0 > settings.max_dim || h0 > settings.max_dim;
    if resized {
        img = img.resize(settings.max_dim, settings.max_dim, FilterType::Lanczos3);
    }
    let (w, h) = img.dimensions();

    match smask {
        Some(mask_id) => {
            let rgba = img.to_rgba8();
            let mut rgb = Vec::with_capacity(w as usize * h as usize * 3);
            let mut alpha = Vec::with_capacity(w as usize * h as usize);
            for px in rgba.pixels() {
                rgb.extend_from_slice(&px.0[..3]);
                alpha.push(px[3]);
            }
            let body = jpeg(&rgb, w, h, ColorType::Rgb8, settings.quality)?;
            let mut deflate =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::best());
            deflate.write_all(&alpha)?;
            let mask = deflate.finish()?;
            replace_content(doc, id, body, b"DCTDecode", b"DeviceRGB", (w, h));
            replace_content(doc, mask_id, mask, b"FlateDecode", b"DeviceGray", (w, h));
            Ok(Some(format!("{}x{} -> {}x{} jpeg+mask q={}", w0, h0, w, h, settings.quality)))
        }
        None => {
            let (body, space) = match &img {
                DynamicImage::ImageLuma8(gray) => (
                    jpeg(gray.as_raw(), w, h, ColorType::L8, settings.quality)?,
                    &b"DeviceGray"[..],
                ),
                other => (
                    jpeg(other.to_rgb8().as_raw(), w, h, ColorType::Rgb8, settings.quality)?,
                    &b"DeviceRGB"[..],
                ),
            };
            if !resized && body.len() >= original_len {
                return Ok(None);
            }
            replace_content(doc, id, body, b"DCTDecode", space, (w, h));
            Ok(Some(format!("{}x{} -> {}x{} jpeg q={}", w0, h0, w, h, settings.quality)))
        }
    }
}

fn image_objects(doc: &Document) -> Vec<(ObjectId, Option<ObjectId>)> {
    doc.objects
        .iter()
        .filter_map(|(id, object)| match object {
            Object::Stream(stream)
                if matches!(stream.dict.get(b"Subtype").and_then(|s| s.as_name()), Ok(b"Image")) =>
            {
                let smask = match stream.dict.get(b"SMask") {
                    Ok(Object::Reference(mask)) => Some(*mask),
                    _ => None,
                };
                Some((*id, smask))
            }
            _ => None,
        })
        .collect()
}

/// Loads, rewrites every image and serialises the document again.
pub fn recompress_document(
    input: &[u8],
    settings: ImageSettings,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    let mut doc =
        Document::load_mem(input).map_err(|e| failure(format!("cannot load PDF: {}", e)))?;
    if doc.is_encrypted() {
        if let Err(e) = doc.decrypt(b"") {
            warn!("Could not decrypt PDF with an empty password: {}", e);
        }
    }

    let images = image_objects(&doc);
    let masks: HashSet<ObjectId> = images.iter().filter_map(|&(_, mask)| mask).collect();
    let mut rewritten = 0usize;
    for (id, _) in images {
        if masks.contains(&id) {
            continue;
        }
        cancel.check()?;
        match recompress_image(&mut doc, id, settings) {
            Ok(Some(action)) => {
                debug!("Image {} {}: {}", id.0, id.1, action);
                rewritten += 1;
            }
            Ok(None) => debug!("Image {} {}: kept original", id.0, id.1),
            Err(e) => debug!("Image {} {}: skipped ({})", id.0, id.1, e),
        }
    }
    info!(
        "Re-encoded {} images at q={} max {}px",
        rewritten, settings.quality, settings.max_dim
    );

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| failure(format!("cannot save PDF: {}", e)))?;
    Ok(buffer)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PdfImageEncoder;

impl PdfEncoder for PdfImageEncoder {
    fn name(&self) -> &str {
        "native"
    }

    fn check_available(&self) -> Result<()> {
        Ok(())
    }

    fn encode(
        &self,
        input: &Path,
        tier: &QualityTier,
        _workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<Encoded> {
        let bytes = std::fs::read(input)?;
        let output = recompress_document(&bytes, ImageSettings::for_tier(tier), cancel)?;
        Ok(Encoded::from_bytes(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{dictionary, Dictionary};

    /// One page showing a single noisy RGB image.
    fn pdf_with_image(width: u32, height: u32) -> Vec<u8> {
        let mut state = 7u32;
        let pixels: Vec<u8> = (0..width * height * 3)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect();

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let image = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width as i64,
                "Height" => height as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            pixels,
        );
        let image_id = doc.add_object(image);
        let content = Stream::new(Dictionary::new(), b"q 200 0 0 150 0 0 cm /Im0 Do Q".to_vec());
        let content_id = doc.add_object(content);
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "XObject" => dictionary! { "Im0" => image_id } },
            "MediaBox" => vec![0.into(), 0.into(), 200.into(), 150.into()],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    #[test]
    fn tier_settings_grow_with_the_tier() {
        let low = ImageSettings::for_tier(&QualityTier::new(0.0, PdfPreset::Screen, 36));
        let high = ImageSettings::for_tier(&QualityTier::new(1.0, PdfPreset::Prepress, 400));
        assert_eq!(low, ImageSettings { quality: 40, max_dim: 396 });
        assert_eq!(high, ImageSettings { quality: 85, max_dim: 4400 });
    }

    #[test]
    fn raw_images_are_rewritten_as_jpeg() {
        let input = pdf_with_image(200, 150);
        let output = recompress_document(
            &input,
            ImageSettings { quality: 30, max_dim: 100 },
            &CancelToken::new(),
        )
        .unwrap();
        assert!(output.len() < input.len());

        let doc = Document::load_mem(&output).unwrap();
        let images = image_objects(&doc);
        assert_eq!(images.len(), 1);
        let Some(Object::Stream(stream)) = doc.objects.get(&images[0].0) else {
            panic!("image stream missing");
        };
        assert_eq!(stream.dict.get(b"Filter").unwrap().as_name().unwrap(), b"DCTDecode");
        assert_eq!(stream.dict.get(b"Width").unwrap().as_i64().unwrap(), 100);
        assert_eq!(stream.dict.get(b"Height").unwrap().as_i64().unwrap(), 75);
    }

    #[test]
    fn garbage_is_an_encoder_failure() {
        let err = recompress_document(
            b"%PDF-1.4 truncated",
            ImageSettings { quality: 50, max_dim: 100 },
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(err.is_probe_failure());
    }

    #[test]
    fn cancellation_stops_before_the_first_image() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = recompress_document(
            &pdf_with_image(20, 20),
            ImageSettings { quality: 50, max_dim: 100 },
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, CompressError::Cancelled));
    }
}
