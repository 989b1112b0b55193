use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::{DynamicImage, RgbImage};

use media_compressor_rust::encoder::{
    Encoded, ImageEncoder, OutputFormat, PdfEncoder, SourceImage, VideoEncoder, VideoInfo,
    VideoJob,
};
use media_compressor_rust::model::Dimensions;
use media_compressor_rust::search::QualityTier;
use media_compressor_rust::size::MIB;
use media_compressor_rust::workspace::Workspace;
use media_compressor_rust::{
    CancelToken, CompressError, CompressionRequest, Compressor, CompressorConfig, MediaKind,
    ParameterVector, Result, SourceArtifact,
};

struct NoImages;

impl ImageEncoder for NoImages {
    fn decode(&self, _: &[u8]) -> Result<SourceImage> {
        Ok(SourceImage {
            pixels: DynamicImage::ImageRgb8(RgbImage::new(1, 1)),
            format: OutputFormat::Jpeg,
            dimensions: Dimensions::new(1, 1),
            has_alpha: false,
        })
    }

    fn encode(
        &self,
        _: &SourceImage,
        _: OutputFormat,
        _: u8,
        _: Option<Dimensions>,
    ) -> Result<Encoded> {
        Err(CompressError::failure("none", "no image encoder"))
    }
}

/// Writes a PDF-looking file of a fixed size per tier and remembers where.
struct TierPdf {
    sizes: [u64; 11],
    written: Arc<Mutex<Vec<PathBuf>>>,
    fail: bool,
    cancel_after_first: Option<CancelToken>,
}

impl TierPdf {
    fn new(sizes: [u64; 11]) -> Self {
        Self {
            sizes,
            written: Arc::new(Mutex::new(Vec::new())),
            fail: false,
            cancel_after_first: None,
        }
    }
}

impl PdfEncoder for TierPdf {
    fn name(&self) -> &str {
        "tier-mock"
    }

    fn check_available(&self) -> Result<()> {
        Ok(())
    }

    fn encode(
        &self,
        input: &Path,
        tier: &QualityTier,
        workspace: &Workspace,
        _cancel: &CancelToken,
    ) -> Result<Encoded> {
        assert!(input.exists());
        if self.fail {
            return Err(CompressError::failure("tier-mock", "exit status 1"));
        }
        if let Some(token) = &self.cancel_after_first {
            token.cancel();
        }
        let index = (tier.quality_factor * 10.0).round() as usize;
        let mut bytes = b"%PDF-1.4\n".to_vec();
        bytes.resize(self.sizes[index] as usize, b' ');
        let path = workspace.probe_path("pdf");
        std::fs::write(&path, &bytes)?;
        self.written.lock().unwrap().push(path.clone());
        Encoded::from_file(&path)
    }
}

/// Size follows bitrate, duration and resolution with a fixed container overhead.
struct ModelVideo {
    info: VideoInfo,
    overhead: f64,
    fail: bool,
    jobs: Arc<Mutex<Vec<(u64, Option<Dimensions>, String)>>>,
}

impl ModelVideo {
    fn new(duration_secs: f64, overhead: f64) -> Self {
        Self {
            info: VideoInfo {
                duration_secs,
                dimensions: Dimensions::new(1920, 1080),
                container: "mov,mp4,m4a,3gp,3g2,mj2".into(),
            },
            overhead,
            fail: false,
            jobs: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl VideoEncoder for ModelVideo {
    fn check_available(&self) -> Result<()> {
        Ok(())
    }

    fn inspect(&self, _: &Path, _: &CancelToken) -> Result<VideoInfo> {
        Ok(self.info.clone())
    }

    fn encode(
        &self,
        _: &Path,
        job: &VideoJob<'_>,
        _: &Workspace,
        _: &CancelToken,
    ) -> Result<Encoded> {
        if self.fail {
            return Err(CompressError::failure("ffmpeg", "exit status 1"));
        }
        self.jobs.lock().unwrap().push((
            job.video_bitrate,
            job.dimensions,
            job.extension.to_string(),
        ));
        let source = self.info.dimensions.pixels() as f64;
        let share = job
            .dimensions
            .map(|d| d.pixels() as f64 / source)
            .unwrap_or(1.0);
        let secs = self.info.duration_secs;
        let video = job.video_bitrate as f64 * secs / 8.0 * self.overhead * share.sqrt();
        let audio = job.audio_bitrate as f64 * secs / 8.0;
        Ok(Encoded {
            size: (video + audio) as u64,
            artifact: media_compressor_rust::Artifact::from_bytes(b"video".to_vec()),
        })
    }
}

fn pdf_compressor(pdf: TierPdf) -> Compressor {
    Compressor::with_encoders(
        CompressorConfig::default(),
        Box::new(NoImages),
        Box::new(pdf),
        Box::new(ModelVideo::new(1.0, 1.0)),
    )
    .unwrap()
}

fn video_compressor(video: ModelVideo) -> Compressor {
    Compressor::with_encoders(
        CompressorConfig::default(),
        Box::new(NoImages),
        Box::new(TierPdf::new([1; 11])),
        Box::new(video),
    )
    .unwrap()
}

fn pdf_request(size: usize, target: u64) -> CompressionRequest {
    let mut bytes = b"%PDF-1.7\n".to_vec();
    bytes.resize(size, b'x');
    CompressionRequest::new(
        SourceArtifact::from_bytes("report.pdf", MediaKind::Pdf, bytes),
        target,
    )
}

/// A sparse file standing in for a large video source.
fn video_source(dir: &Path, name: &str, len: u64) -> SourceArtifact {
    let path = dir.join(name);
    std::fs::File::create(&path).unwrap().set_len(len).unwrap();
    SourceArtifact::from_path(&path, MediaKind::Video)
}

const TIER_SIZES: [u64; 11] = [
    30_000, 45_000, 60_000, 80_000, 95_000, 120_000, 200_000, 300_000, 500_000, 800_000,
    1_200_000,
];

#[test]
fn pdf_picks_the_largest_tier_that_fits() {
    let pdf = TierPdf::new(TIER_SIZES);
    let written = pdf.written.clone();
    let outcome = pdf_compressor(pdf)
        .compress(&pdf_request(2_000_000, 100_000), &CancelToken::new())
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.achieved_bytes, 95_000);
    match outcome.parameters {
        ParameterVector::Pdf {
            quality_factor,
            params,
        } => {
            assert_eq!(params.tier, 4);
            assert_eq!(quality_factor, 0.4);
        }
        other => panic!("unexpected parameters {:?}", other),
    }
    assert_eq!(outcome.extension, "pdf");
    assert!(outcome.probes <= 11);

    // the result is detached from the workspace, which is gone
    let bytes = outcome.artifact.to_vec().unwrap();
    assert_eq!(bytes.len(), 95_000);
    assert!(bytes.starts_with(b"%PDF-"));
    let written = written.lock().unwrap();
    assert!(!written.is_empty());
    assert!(written.iter().all(|p| !p.exists()));
}

#[test]
fn pdf_search_ignores_the_image_tolerance() {
    // 50% image slack would settle on the 80_000 tier
    let request = pdf_request(2_000_000, 100_000).with_tolerance_pct(50.0);
    let outcome = pdf_compressor(TierPdf::new(TIER_SIZES))
        .compress(&request, &CancelToken::new())
        .unwrap();
    assert_eq!(outcome.achieved_bytes, 95_000);
}

#[test]
fn pdf_tolerance_comes_from_the_pdf_policy() {
    let mut config = CompressorConfig::default();
    config.pdf.tolerance_pct = 50.0;
    let compressor = Compressor::with_encoders(
        config,
        Box::new(NoImages),
        Box::new(TierPdf::new(TIER_SIZES)),
        Box::new(ModelVideo::new(1.0, 1.0)),
    )
    .unwrap();
    let outcome = compressor
        .compress(&pdf_request(2_000_000, 100_000), &CancelToken::new())
        .unwrap();
    assert!(outcome.success);
    assert!(outcome.achieved_bytes >= 50_000);
    assert!(outcome.achieved_bytes < 95_000);
}

#[test]
fn pdf_floor_when_even_the_lowest_tier_is_too_big() {
    let outcome = pdf_compressor(TierPdf::new(TIER_SIZES))
        .compress(&pdf_request(2_000_000, 10_000), &CancelToken::new())
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.achieved_bytes, 30_000);
    assert_eq!(outcome.probes, 1);
    assert!(matches!(
        outcome.parameters,
        ParameterVector::Pdf { params, .. } if params.tier == 0
    ));
}

#[test]
fn pdf_whose_best_tier_fits_skips_bisection() {
    let outcome = pdf_compressor(TierPdf::new(TIER_SIZES))
        .compress(&pdf_request(2_000_000, 1_500_000), &CancelToken::new())
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.achieved_bytes, 1_200_000);
    assert_eq!(outcome.probes, 2);
}

#[test]
fn pdf_encoder_failure_on_the_lowest_tier_is_fatal() {
    let mut pdf = TierPdf::new(TIER_SIZES);
    pdf.fail = true;
    let err = pdf_compressor(pdf)
        .compress(&pdf_request(2_000_000, 100_000), &CancelToken::new())
        .unwrap_err();
    assert!(err.is_probe_failure());
}

#[test]
fn cancellation_between_probes_cleans_up() {
    let cancel = CancelToken::new();
    let mut pdf = TierPdf::new(TIER_SIZES);
    pdf.cancel_after_first = Some(cancel.clone());
    let written = pdf.written.clone();
    let err = pdf_compressor(pdf)
        .compress(&pdf_request(2_000_000, 100_000), &cancel)
        .unwrap_err();
    assert!(matches!(err, CompressError::Cancelled));
    let written = written.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert!(!written[0].exists());
}

#[test]
fn video_lands_in_band_after_one_downscale() {
    let dir = tempfile::tempdir().unwrap();
    let source = video_source(dir.path(), "clip.mp4", 40 * MIB);
    // full resolution at the 4 Mbps ceiling overshoots the band; 80% scale lands inside it
    let video = ModelVideo::new(10.0, 7.5);
    let jobs = video.jobs.clone();
    let outcome = video_compressor(video)
        .compress(
            &CompressionRequest::new(source, 30 * MIB),
            &CancelToken::new(),
        )
        .unwrap();

    assert!(outcome.success);
    assert!(outcome.resized);
    assert!(outcome.achieved_bytes >= 28 * MIB);
    assert!(outcome.achieved_bytes <= 29 * MIB);
    assert_eq!(outcome.extension, "mp4");
    assert_eq!(outcome.probes, 2);
    assert_eq!(
        outcome.parameters,
        ParameterVector::Video(media_compressor_rust::model::VideoParams {
            video_bitrate: 4_000_000,
            dimensions: Some(Dimensions::new(1536, 864)),
        })
    );
    let jobs = jobs.lock().unwrap();
    assert!(jobs.iter().all(|(_, _, ext)| ext == "mp4"));
}

#[test]
fn video_below_band_is_still_a_success() {
    let dir = tempfile::tempdir().unwrap();
    let source = video_source(dir.path(), "clip.mkv", 40 * MIB);
    let outcome = video_compressor(ModelVideo::new(10.0, 1.0))
        .compress(
            &CompressionRequest::new(source, 30 * MIB),
            &CancelToken::new(),
        )
        .unwrap();
    assert!(outcome.success);
    assert!(!outcome.resized);
    assert!(outcome.achieved_bytes < 28 * MIB);
    assert_eq!(outcome.extension, "mkv");
}

#[test]
fn video_without_duration_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = video_source(dir.path(), "clip.mp4", 40 * MIB);
    let err = video_compressor(ModelVideo::new(0.0, 1.0))
        .compress(
            &CompressionRequest::new(source, 30 * MIB),
            &CancelToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, CompressError::InvalidRequest(_)));
}

#[test]
fn video_encoder_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let source = video_source(dir.path(), "clip.mp4", 40 * MIB);
    let mut video = ModelVideo::new(10.0, 1.0);
    video.fail = true;
    let err = video_compressor(video)
        .compress(
            &CompressionRequest::new(source, 30 * MIB),
            &CancelToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, CompressError::EncoderFailure { .. }));
}

#[test]
fn zero_target_is_rejected_before_any_probe() {
    let pdf = TierPdf::new(TIER_SIZES);
    let written = pdf.written.clone();
    let err = pdf_compressor(pdf)
        .compress(&pdf_request(2_000_000, 0), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, CompressError::InvalidRequest(_)));
    assert!(written.lock().unwrap().is_empty());
}
