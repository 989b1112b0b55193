//! Encoder capabilities the searches drive, and their implementations.
//!
//! The searches only see `params -> Encoded`; these traits are what the
//! controller adapts into that shape per media kind.

pub mod ffmpeg;
pub mod ghostscript;
pub mod pdf_images;
pub mod process;
pub mod raster;

use std::path::Path;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::model::{Artifact, Dimensions};
use crate::search::QualityTier;
use crate::workspace::Workspace;

pub use ffmpeg::FfmpegEncoder;
pub use ghostscript::GhostscriptEncoder;
pub use pdf_images::PdfImageEncoder;
pub use raster::{OutputFormat, RasterEncoder, SourceImage};

/// Output of one encode call.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub size: u64,
    pub artifact: Artifact,
}

impl Encoded {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            size: bytes.len() as u64,
            artifact: Artifact::from_bytes(bytes),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let size = std::fs::metadata(path)?.len();
        Ok(Self {
            size,
            artifact: Artifact::File(path.to_path_buf()),
        })
    }
}

pub trait ImageEncoder: Send + Sync {
    /// Fails with `InvalidRequest` when the bytes are not a readable image.
    fn decode(&self, bytes: &[u8]) -> Result<SourceImage>;

    fn encode(
        &self,
        image: &SourceImage,
        format: OutputFormat,
        quality: u8,
        dimensions: Option<Dimensions>,
    ) -> Result<Encoded>;
}

pub trait PdfEncoder: Send + Sync {
    fn name(&self) -> &str;

    /// `EncoderUnavailable` when the backend cannot run at all.
    fn check_available(&self) -> Result<()>;

    fn encode(
        &self,
        input: &Path,
        tier: &QualityTier,
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<Encoded>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub duration_secs: f64,
    pub dimensions: Dimensions,
    /// Primary container name as reported by the probe (e.g. `mp4`, `matroska`).
    pub container: String,
}

#[derive(Debug, Clone, Copy)]
pub struct VideoJob<'a> {
    pub video_bitrate: u64,
    pub audio_bitrate: u64,
    pub dimensions: Option<Dimensions>,
    /// Output file extension.
    pub extension: &'a str,
}

pub trait VideoEncoder: Send + Sync {
    fn check_available(&self) -> Result<()>;

    /// Fails with `InvalidRequest` when the source has no readable video stream.
    fn inspect(&self, input: &Path, cancel: &CancelToken) -> Result<VideoInfo>;

    fn encode(
        &self,
        input: &Path,
        job: &VideoJob<'_>,
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<Encoded>;
}
