//! Request entry point: validation, pass-through, per-kind dispatch and
//! outcome assembly.

use log::{info, warn};

use crate::cancel::CancelToken;
use crate::config::{CompressorConfig, PdfBackend};
use crate::encoder::ffmpeg::container_extension;
use crate::encoder::{
    FfmpegEncoder, GhostscriptEncoder, ImageEncoder, PdfEncoder, PdfImageEncoder, RasterEncoder,
    SourceImage, VideoEncoder, VideoJob,
};
use crate::error::{CompressError, Result};
use crate::model::{
    reduction_percent, Artifact, CompressionOutcome, CompressionRequest, ImageParams, MediaKind,
    ParameterVector, Params, PdfParams, QualityBounds, Sample, VideoParams,
};
use crate::search::{Prober, Resolution, SizeBand};
use crate::size::format_size;
use crate::workspace::Workspace;

/// How far into a file the `%PDF-` marker may appear.
const PDF_HEADER_WINDOW: usize = 1024;

/// Image escalation: quality first, resolution only when quality alone cannot fit.
#[derive(Debug)]
enum ImagePhase {
    QualitySearch,
    DimensionFallback,
    Converged(Sample<ImageParams>),
    Infeasible(Sample<ImageParams>),
}

/// A source that passed its format check. Runs before pass-through, so a
/// small but broken file is still rejected.
enum PreparedSource {
    Image(SourceImage),
    Pdf,
    Video,
}

/// The chosen probe of a finished search, detached from its workspace.
struct Finished {
    artifact: Artifact,
    size: u64,
    parameters: ParameterVector,
    resized: bool,
    extension: String,
    probes: u32,
}

impl Finished {
    fn into_outcome(self, request: &CompressionRequest, original: u64) -> CompressionOutcome {
        let success = self.size <= request.target_bytes;
        let outcome = CompressionOutcome {
            artifact: self.artifact,
            original_bytes: original,
            achieved_bytes: self.size,
            target_bytes: request.target_bytes,
            parameters: self.parameters,
            resized: self.resized,
            success,
            reduction_percent: reduction_percent(original, self.size),
            extension: self.extension,
            probes: self.probes,
        };
        if success {
            info!(
                "{}: {} -> {} ({}% smaller, {}, {} probes)",
                request.source.name,
                format_size(original),
                format_size(outcome.achieved_bytes),
                outcome.reduction_percent,
                outcome.parameters,
                outcome.probes
            );
        } else {
            warn!(
                "{}: target {} not reachable; best effort is {} ({})",
                request.source.name,
                format_size(request.target_bytes),
                format_size(outcome.achieved_bytes),
                outcome.parameters
            );
        }
        outcome
    }
}

/// Drives the target-size searches against a set of encoders.
pub struct Compressor {
    config: CompressorConfig,
    images: Box<dyn ImageEncoder>,
    pdfs: Box<dyn PdfEncoder>,
    videos: Box<dyn VideoEncoder>,
}

impl Compressor {
    /// Compressor backed by the in-process image encoder and the configured external tools.
    pub fn new(config: CompressorConfig) -> Result<Self> {
        let pdfs: Box<dyn PdfEncoder> = match config.pdf.backend {
            PdfBackend::Ghostscript => Box::new(GhostscriptEncoder::new(&config.pdf.ghostscript)),
            PdfBackend::Native => Box::new(PdfImageEncoder),
        };
        let v = &config.video;
        let videos = Box::new(FfmpegEncoder::new(&v.ffmpeg, &v.ffprobe, &v.preset));
        Self::with_encoders(config, Box::new(RasterEncoder), pdfs, videos)
    }

    /// Fails with `InvalidConfig` when `config` does not validate.
    pub fn with_encoders(
        config: CompressorConfig,
        images: Box<dyn ImageEncoder>,
        pdfs: Box<dyn PdfEncoder>,
        videos: Box<dyn VideoEncoder>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            images,
            pdfs,
            videos,
        })
    }

    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    /// Produces the largest artifact no bigger than the request's target, or
    /// the smallest achievable one with `success == false`.
    pub fn compress(
        &self,
        request: &CompressionRequest,
        cancel: &CancelToken,
    ) -> Result<CompressionOutcome> {
        request.validate()?;
        cancel.check()?;

        let original = request.source.data.len()?;
        let prepared = self.prepare(request)?;
        if original <= request.target_bytes {
            info!(
                "{} is already {} (target {}); returning it unchanged",
                request.source.name,
                format_size(original),
                format_size(request.target_bytes)
            );
            return Ok(CompressionOutcome::passthrough(
                &request.source,
                original,
                request.target_bytes,
            ));
        }

        info!(
            "Compressing {} {} from {} to at most {}",
            request.source.kind,
            request.source.name,
            format_size(original),
            format_size(request.target_bytes)
        );
        let finished = match prepared {
            PreparedSource::Image(image) => self.compress_image(request, image, original, cancel)?,
            PreparedSource::Pdf => self.compress_pdf(request, cancel)?,
            PreparedSource::Video => self.compress_video(request, cancel)?,
        };
        Ok(finished.into_outcome(request, original))
    }

    fn prepare(&self, request: &CompressionRequest) -> Result<PreparedSource> {
        match request.source.kind {
            MediaKind::Image => {
                let bytes = request.source.data.to_vec()?;
                Ok(PreparedSource::Image(self.images.decode(&bytes)?))
            }
            MediaKind::Pdf => {
                let head = request.source.data.head(PDF_HEADER_WINDOW)?;
                if !head.windows(5).any(|w| w == b"%PDF-") {
                    return Err(CompressError::invalid(format!(
                        "{} is not a PDF document",
                        request.source.name
                    )));
                }
                Ok(PreparedSource::Pdf)
            }
            // containers are only understood by the external prober
            MediaKind::Video => Ok(PreparedSource::Video),
        }
    }

    fn compress_image(
        &self,
        request: &CompressionRequest,
        image: SourceImage,
        original: u64,
        cancel: &CancelToken,
    ) -> Result<Finished> {
        let target = request.target_bytes;
        let tolerance = request.tolerance_bytes();
        let format = image.output_format(original, target, self.config.image.webp_switch_ratio);
        if format != image.format {
            info!("Switching output format {:?} -> {:?}", image.format, format);
        }
        // a format without a quality knob gets a single quality point
        let bounds = if format.has_quality_knob() {
            request.quality
        } else {
            QualityBounds {
                min: request.quality.max,
                max: request.quality.max,
            }
        };
        let quality = self.config.scalar_search(bounds);
        let ladder = self.config.ladder();

        let mut prober = Prober::new(
            |p: &ImageParams| self.images.encode(&image, format, p.quality, p.dimensions),
            cancel,
        );
        let mut phase = ImagePhase::QualitySearch;
        let sample = loop {
            phase = match phase {
                ImagePhase::QualitySearch => {
                    match quality.search(&mut prober, target, tolerance, None)? {
                        Some(found) => ImagePhase::Converged(found),
                        None => {
                            info!(
                                "Quality {} at {} is still over budget; trying smaller sizes",
                                bounds.min, image.dimensions
                            );
                            ImagePhase::DimensionFallback
                        }
                    }
                }
                ImagePhase::DimensionFallback => {
                    let original_dims = image.dimensions;
                    match ladder.search(&quality, &mut prober, original_dims, target, tolerance)? {
                        Resolution::Converged(found) => ImagePhase::Converged(found),
                        Resolution::Floor(floor) => ImagePhase::Infeasible(floor),
                    }
                }
                ImagePhase::Converged(found) | ImagePhase::Infeasible(found) => break found,
            };
        };
        let result = prober.retrieve(&sample)?;
        let probes = prober.fresh_probes();

        let extension = match request.source.extension() {
            Some(ext) if format == image.format => ext,
            _ => format.extension().to_string(),
        };
        Ok(Finished {
            resized: result.params.is_scaled(),
            parameters: ParameterVector::Image(result.params),
            size: result.size,
            artifact: result.artifact,
            extension,
            probes,
        })
    }

    fn compress_pdf(&self, request: &CompressionRequest, cancel: &CancelToken) -> Result<Finished> {
        self.pdfs.check_available()?;

        let workspace = Workspace::create()?;
        let finished = self.search_pdf(request, &workspace, cancel);
        workspace.close();
        finished
    }

    fn search_pdf(
        &self,
        request: &CompressionRequest,
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<Finished> {
        let input = workspace.materialize(&request.source.data, "pdf")?;
        let table = &self.config.pdf.tiers;
        let mut prober = Prober::new(
            |p: &PdfParams| {
                let tier = table.get(p.tier).ok_or_else(|| {
                    CompressError::InvalidConfig(format!("no quality tier {}", p.tier))
                })?;
                self.pdfs.encode(&input, tier, workspace, cancel)
            },
            cancel,
        );
        let resolution = self.config.tier_search().search(
            &mut prober,
            request.target_bytes,
            self.config.pdf.tolerance_bytes(request.target_bytes),
        )?;
        let found = prober.retrieve(resolution.result())?;
        let probes = prober.fresh_probes();
        drop(prober);

        let quality_factor = table
            .get(found.params.tier)
            .map(|t| t.quality_factor)
            .unwrap_or_default();
        Ok(Finished {
            artifact: found.artifact.into_memory()?,
            size: found.size,
            parameters: ParameterVector::Pdf {
                quality_factor,
                params: found.params,
            },
            resized: false,
            extension: "pdf".to_string(),
            probes,
        })
    }

    fn compress_video(
        &self,
        request: &CompressionRequest,
        cancel: &CancelToken,
    ) -> Result<Finished> {
        self.videos.check_available()?;

        let workspace = Workspace::create()?;
        let finished = self.search_video(request, &workspace, cancel);
        workspace.close();
        finished
    }

    fn search_video(
        &self,
        request: &CompressionRequest,
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<Finished> {
        let source_ext = request
            .source
            .extension()
            .filter(|ext| MediaKind::from_extension(ext) == Some(MediaKind::Video));
        let input = workspace.materialize(
            &request.source.data,
            source_ext.as_deref().unwrap_or("mp4"),
        )?;
        let info = self.videos.inspect(&input, cancel)?;
        if !(info.duration_secs > 0.0) {
            return Err(CompressError::invalid(format!(
                "{} has no usable duration ({})",
                request.source.name, info.duration_secs
            )));
        }
        let extension =
            source_ext.unwrap_or_else(|| container_extension(&info.container).to_string());

        let band = SizeBand::below(request.target_bytes, self.config.margins());
        let converger = self.config.converger(request.bitrate);
        let audio_bitrate = converger.audio_bitrate;
        let mut prober = Prober::new(
            |p: &VideoParams| {
                let job = VideoJob {
                    video_bitrate: p.video_bitrate,
                    audio_bitrate,
                    dimensions: p.dimensions,
                    extension: &extension,
                };
                self.videos.encode(&input, &job, workspace, cancel)
            },
            cancel,
        );
        let resolution = converger.converge(&mut prober, &info, band)?;
        let found = prober.retrieve(resolution.result())?;
        let probes = prober.fresh_probes();
        drop(prober);

        Ok(Finished {
            artifact: found.artifact.into_memory()?,
            size: found.size,
            resized: found.params.is_scaled(),
            parameters: ParameterVector::Video(found.params),
            extension,
            probes,
        })
    }
}

/// Output name for a compressed copy: `<stem>_compressed.<ext>`.
pub fn output_name(outcome: &CompressionOutcome, stem: &str) -> String {
    if outcome.extension.is_empty() {
        format!("{}_compressed", stem)
    } else {
        format!("{}_compressed.{}", stem, outcome.extension)
    }
}
