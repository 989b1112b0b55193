//! Search policy. Everything here is tunable from a JSON file; every field
//! has a default so a partial file only overrides what it names.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CompressError, Result};
use crate::model::{BitrateBounds, CompressionRequest, QualityBounds, SourceArtifact};
use crate::search::{
    BitrateConverger, DimensionLadder, Margins, ScalarQualitySearch, TierTable, TierTableSearch,
};
use crate::size::MIB;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    pub image: ImagePolicy,
    pub pdf: PdfPolicy,
    pub video: VideoPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagePolicy {
    pub min_quality: u8,
    pub max_quality: u8,
    pub tolerance_pct: f64,
    pub max_iterations: u32,
    pub refine_span: u8,
    pub scale_steps: Vec<f64>,
    pub floor_scale: f64,
    /// PNGs with alpha switch to WebP when the target is below this share of the original.
    pub webp_switch_ratio: f64,
}

impl Default for ImagePolicy {
    fn default() -> Self {
        let ladder = DimensionLadder::default();
        Self {
            min_quality: 1,
            max_quality: 95,
            tolerance_pct: 1.0,
            max_iterations: 20,
            refine_span: 4,
            scale_steps: ladder.steps,
            floor_scale: ladder.floor_scale,
            webp_switch_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PdfBackend {
    /// Ghostscript pdfwrite subprocess
    Ghostscript,
    /// In-process re-encoding of embedded images
    Native,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfPolicy {
    pub backend: PdfBackend,
    pub ghostscript: String,
    pub tiers: TierTable,
    /// Early-stop slack of the tier search, as a share of the target. Separate
    /// from the image tolerance: adjacent tiers are far apart in size.
    pub tolerance_pct: f64,
    pub min_width: f64,
    pub max_iterations: u32,
}

impl PdfPolicy {
    pub fn tolerance_bytes(&self, target_bytes: u64) -> u64 {
        (target_bytes as f64 * self.tolerance_pct / 100.0) as u64
    }
}

impl Default for PdfPolicy {
    fn default() -> Self {
        let ghostscript = if cfg!(windows) { "gswin64c" } else { "gs" };
        Self {
            backend: PdfBackend::Ghostscript,
            ghostscript: ghostscript.to_string(),
            tiers: TierTable::default(),
            tolerance_pct: 0.0,
            min_width: 0.05,
            max_iterations: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoPolicy {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub preset: String,
    pub margin_min_bytes: u64,
    pub margin_max_bytes: u64,
    pub margin_cap_fraction: f64,
    pub audio_bitrate: u64,
    pub bitrate: BitrateBounds,
    pub downscale: f64,
    pub max_attempts: u32,
    pub shrink: f64,
    pub grow: f64,
}

impl Default for VideoPolicy {
    fn default() -> Self {
        let converger = BitrateConverger::default();
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            preset: "fast".to_string(),
            margin_min_bytes: MIB,
            margin_max_bytes: 2 * MIB,
            margin_cap_fraction: 0.2,
            audio_bitrate: converger.audio_bitrate,
            bitrate: converger.bounds,
            downscale: converger.downscale,
            max_attempts: converger.max_attempts,
            shrink: converger.shrink,
            grow: converger.grow,
        }
    }
}

fn invalid(reason: String) -> CompressError {
    CompressError::InvalidConfig(reason)
}

impl CompressorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| invalid(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let img = &self.image;
        if img.min_quality == 0 || img.min_quality > img.max_quality || img.max_quality > 100 {
            return Err(invalid(format!(
                "image quality bounds [{}, {}] must satisfy 1 <= min <= max <= 100",
                img.min_quality, img.max_quality
            )));
        }
        if !(img.tolerance_pct >= 0.0) {
            return Err(invalid("image tolerance must be non-negative".into()));
        }
        if img.scale_steps.iter().any(|&s| !(s > 0.0 && s < 1.0)) {
            return Err(invalid("scale steps must lie in (0, 1)".into()));
        }
        if img.scale_steps.windows(2).any(|w| w[0] <= w[1]) {
            return Err(invalid("scale steps must be strictly descending".into()));
        }
        if !(img.floor_scale > 0.0 && img.floor_scale < 1.0) {
            return Err(invalid("floor scale must lie in (0, 1)".into()));
        }

        self.pdf.tiers.validate()?;
        if !(self.pdf.tolerance_pct >= 0.0) {
            return Err(invalid("pdf tolerance must be non-negative".into()));
        }
        if !(self.pdf.min_width > 0.0) || self.pdf.max_iterations == 0 {
            return Err(invalid("pdf search needs a positive width and iteration cap".into()));
        }

        let v = &self.video;
        if v.margin_min_bytes > v.margin_max_bytes {
            return Err(invalid("video margin_min_bytes exceeds margin_max_bytes".into()));
        }
        if !(v.margin_cap_fraction > 0.0 && v.margin_cap_fraction < 1.0) {
            return Err(invalid("video margin_cap_fraction must lie in (0, 1)".into()));
        }
        if v.bitrate.min == 0 || v.bitrate.min > v.bitrate.max {
            return Err(invalid("video bitrate bounds are inverted".into()));
        }
        if !(v.shrink > 0.0 && v.shrink < 1.0) || !(v.grow > 1.0) {
            return Err(invalid("video shrink must lie in (0, 1) and grow above 1".into()));
        }
        if !(v.downscale > 0.0 && v.downscale < 1.0) {
            return Err(invalid("video downscale must lie in (0, 1)".into()));
        }
        Ok(())
    }

    /// A request carrying this policy's default tolerance and bounds.
    pub fn request(&self, source: SourceArtifact, target_bytes: u64) -> CompressionRequest {
        CompressionRequest::new(source, target_bytes)
            .with_tolerance_pct(self.image.tolerance_pct)
            .with_quality_bounds(self.image.min_quality, self.image.max_quality)
            .with_bitrate_bounds(self.video.bitrate.min, self.video.bitrate.max)
    }

    pub fn scalar_search(&self, bounds: QualityBounds) -> ScalarQualitySearch {
        ScalarQualitySearch {
            bounds,
            max_iterations: self.image.max_iterations,
            refine_span: self.image.refine_span,
        }
    }

    pub fn ladder(&self) -> DimensionLadder {
        DimensionLadder {
            steps: self.image.scale_steps.clone(),
            floor_scale: self.image.floor_scale,
        }
    }

    pub fn tier_search(&self) -> TierTableSearch<'_> {
        TierTableSearch {
            table: &self.pdf.tiers,
            min_width: self.pdf.min_width,
            max_iterations: self.pdf.max_iterations,
        }
    }

    pub fn converger(&self, bounds: BitrateBounds) -> BitrateConverger {
        let v = &self.video;
        BitrateConverger {
            bounds,
            audio_bitrate: v.audio_bitrate,
            downscale: v.downscale,
            max_attempts: v.max_attempts,
            shrink: v.shrink,
            grow: v.grow,
        }
    }

    pub fn margins(&self) -> Margins {
        Margins {
            smaller: self.video.margin_min_bytes,
            larger: self.video.margin_max_bytes,
            cap_fraction: self.video.margin_cap_fraction,
        }
    }
}
