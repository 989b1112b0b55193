use std::fmt;
use std::hash::Hash;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CompressError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Pdf,
    Video,
}

impl MediaKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" => Some(MediaKind::Image),
            "pdf" => Some(MediaKind::Pdf),
            "mp4" | "avi" | "mov" | "mkv" | "webm" => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaKind::Image => "image",
            MediaKind::Pdf => "pdf",
            MediaKind::Video => "video",
        };
        f.write_str(name)
    }
}

/// Bytes produced or consumed by an encoder, either held in memory or on disk.
#[derive(Debug, Clone)]
pub enum Artifact {
    Memory(Arc<Vec<u8>>),
    File(PathBuf),
}

impl Artifact {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Artifact::Memory(Arc::new(bytes))
    }

    pub fn len(&self) -> Result<u64> {
        match self {
            Artifact::Memory(bytes) => Ok(bytes.len() as u64),
            Artifact::File(path) => Ok(std::fs::metadata(path)?.len()),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Copies a file-backed artifact into memory so it outlives the workspace it was written to.
    pub fn into_memory(self) -> Result<Self> {
        match self {
            Artifact::Memory(_) => Ok(self),
            Artifact::File(path) => Ok(Artifact::from_bytes(std::fs::read(path)?)),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        match self {
            Artifact::Memory(bytes) => Ok(bytes.as_ref().clone()),
            Artifact::File(path) => Ok(std::fs::read(path)?),
        }
    }

    /// Up to the first `limit` bytes.
    pub fn head(&self, limit: usize) -> Result<Vec<u8>> {
        match self {
            Artifact::Memory(bytes) => Ok(bytes[..bytes.len().min(limit)].to_vec()),
            Artifact::File(path) => {
                let mut head = Vec::with_capacity(limit);
                std::fs::File::open(path)?
                    .take(limit as u64)
                    .read_to_end(&mut head)?;
                Ok(head)
            }
        }
    }

    pub fn write_to(&self, dest: &Path) -> Result<()> {
        match self {
            Artifact::Memory(bytes) => std::fs::write(dest, bytes.as_slice())?,
            Artifact::File(path) => {
                std::fs::copy(path, dest)?;
            }
        }
        Ok(())
    }
}

/// The input of one request. `name` carries the original file name so the
/// output can keep its stem and container.
#[derive(Debug, Clone)]
pub struct SourceArtifact {
    pub name: String,
    pub kind: MediaKind,
    pub data: Artifact,
}

impl SourceArtifact {
    pub fn from_path(path: &Path, kind: MediaKind) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("input.{}", kind));
        Self {
            name,
            kind,
            data: Artifact::File(path.to_path_buf()),
        }
    }

    pub fn from_bytes(name: impl Into<String>, kind: MediaKind, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind,
            data: Artifact::from_bytes(bytes),
        }
    }

    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
    }

    pub fn stem(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Aspect-preserving scale, truncating, never below 1x1.
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            width: ((self.width as f64 * factor) as u32).max(1),
            height: ((self.height as f64 * factor) as u32).max(1),
        }
    }

    /// Rounds both sides down to even values (at least 2), as yuv420 codecs require.
    pub fn even(self) -> Self {
        Self {
            width: (self.width & !1).max(2),
            height: (self.height & !1).max(2),
        }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Parameter types that can key a probe.
pub trait Params: Clone + Eq + Hash + fmt::Debug {
    /// Whether the probe changed spatial resolution. Unscaled wins ties.
    fn is_scaled(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ImageParams {
    pub quality: u8,
    pub dimensions: Option<Dimensions>,
}

impl Params for ImageParams {
    fn is_scaled(&self) -> bool {
        self.dimensions.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PdfParams {
    pub tier: usize,
    pub preset: crate::search::tier::PdfPreset,
    pub dpi: u32,
}

impl Params for PdfParams {
    fn is_scaled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct VideoParams {
    pub video_bitrate: u64,
    pub dimensions: Option<Dimensions>,
}

impl Params for VideoParams {
    fn is_scaled(&self) -> bool {
        self.dimensions.is_some()
    }
}

/// What was used to produce the final artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ParameterVector {
    /// The source was returned untouched.
    Original,
    Image(ImageParams),
    Pdf {
        quality_factor: f64,
        #[serde(flatten)]
        params: PdfParams,
    },
    Video(VideoParams),
}

impl fmt::Display for ParameterVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterVector::Original => write!(f, "original"),
            ParameterVector::Image(p) => match p.dimensions {
                Some(d) => write!(f, "quality={} size={}", p.quality, d),
                None => write!(f, "quality={}", p.quality),
            },
            ParameterVector::Pdf {
                quality_factor,
                params,
            } => write!(
                f,
                "factor={:.2} preset={} dpi={}",
                quality_factor, params.preset, params.dpi
            ),
            ParameterVector::Video(p) => match p.dimensions {
                Some(d) => write!(f, "bitrate={}bps size={}", p.video_bitrate, d),
                None => write!(f, "bitrate={}bps", p.video_bitrate),
            },
        }
    }
}

/// Output of one encoder call.
#[derive(Debug, Clone)]
pub struct ProbeResult<P> {
    pub params: P,
    pub size: u64,
    pub artifact: Artifact,
}

impl<P: Clone> ProbeResult<P> {
    pub fn sample(&self) -> Sample<P> {
        Sample {
            params: self.params.clone(),
            size: self.size,
        }
    }
}

/// What the searches reason about: a parameter vector and the size it produced.
/// The bytes stay with the prober that made them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample<P> {
    pub params: P,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityBounds {
    pub min: u8,
    pub max: u8,
}

impl Default for QualityBounds {
    fn default() -> Self {
        Self { min: 1, max: 95 }
    }
}

/// Video bitrate bounds in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BitrateBounds {
    pub min: u64,
    pub max: u64,
}

impl Default for BitrateBounds {
    fn default() -> Self {
        Self {
            min: 100_000,
            max: 4_000_000,
        }
    }
}

impl BitrateBounds {
    pub fn clamp(&self, bitrate: f64) -> f64 {
        bitrate.max(self.min as f64).min(self.max as f64)
    }
}

#[derive(Debug, Clone)]
pub struct CompressionRequest {
    pub source: SourceArtifact,
    pub target_bytes: u64,
    pub tolerance_pct: f64,
    pub quality: QualityBounds,
    pub bitrate: BitrateBounds,
}

impl CompressionRequest {
    pub fn new(source: SourceArtifact, target_bytes: u64) -> Self {
        Self {
            source,
            target_bytes,
            tolerance_pct: 1.0,
            quality: QualityBounds::default(),
            bitrate: BitrateBounds::default(),
        }
    }

    pub fn with_tolerance_pct(mut self, pct: f64) -> Self {
        self.tolerance_pct = pct;
        self
    }

    pub fn with_quality_bounds(mut self, min: u8, max: u8) -> Self {
        self.quality = QualityBounds { min, max };
        self
    }

    pub fn with_bitrate_bounds(mut self, min: u64, max: u64) -> Self {
        self.bitrate = BitrateBounds { min, max };
        self
    }

    pub fn tolerance_bytes(&self) -> u64 {
        (self.target_bytes as f64 * self.tolerance_pct / 100.0) as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_bytes == 0 {
            return Err(CompressError::invalid("target size must be positive"));
        }
        if !self.tolerance_pct.is_finite() || self.tolerance_pct < 0.0 {
            return Err(CompressError::invalid(format!(
                "tolerance must be a non-negative percentage, got {}",
                self.tolerance_pct
            )));
        }
        let q = self.quality;
        if q.min == 0 || q.min > q.max || q.max > 100 {
            return Err(CompressError::invalid(format!(
                "quality bounds must satisfy 1 <= min <= max <= 100, got [{}, {}]",
                q.min, q.max
            )));
        }
        let b = self.bitrate;
        if b.min == 0 || b.min > b.max {
            return Err(CompressError::invalid(format!(
                "bitrate bounds must satisfy 0 < min <= max, got [{}, {}]",
                b.min, b.max
            )));
        }
        if self.source.data.is_empty()? {
            return Err(CompressError::invalid("source artifact is empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub artifact: Artifact,
    pub original_bytes: u64,
    pub achieved_bytes: u64,
    pub target_bytes: u64,
    pub parameters: ParameterVector,
    pub resized: bool,
    pub success: bool,
    pub reduction_percent: f64,
    /// File extension of the produced artifact.
    pub extension: String,
    /// Fresh encoder invocations spent on this request.
    pub probes: u32,
}

impl CompressionOutcome {
    pub fn passthrough(source: &SourceArtifact, size: u64, target_bytes: u64) -> Self {
        Self {
            artifact: source.data.clone(),
            original_bytes: size,
            achieved_bytes: size,
            target_bytes,
            parameters: ParameterVector::Original,
            resized: false,
            success: true,
            reduction_percent: 0.0,
            extension: source.extension().unwrap_or_default(),
            probes: 0,
        }
    }
}

/// Percentage saved, rounded to two decimals.
pub fn reduction_percent(original: u64, achieved: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    let pct = (1.0 - achieved as f64 / original as f64) * 100.0;
    (pct * 100.0).round() / 100.0
}
