use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

use log::{debug, info};
use serde::Deserialize;

use super::{process, Encoded, VideoEncoder, VideoInfo, VideoJob};
use crate::cancel::CancelToken;
use crate::error::{CompressError, Result};
use crate::model::Dimensions;
use crate::workspace::Workspace;

/// Largest `-bufsize` handed to the rate controller.
const MAX_BUFFER_BITS: f64 = 2_000_000.0;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    codec_type: Option<String>,
}

/// Reads the `ffprobe -of json` document for the first video stream.
pub fn parse_probe(json: &str) -> Result<VideoInfo> {
    let unreadable =
        |what: &str| CompressError::invalid(format!("cannot read video information: {}", what));
    let probe: ProbeOutput = serde_json::from_str(json).map_err(|e| unreadable(&e.to_string()))?;
    let format = probe.format.ok_or_else(|| unreadable("missing format section"))?;
    let duration_secs: f64 = format
        .duration
        .as_deref()
        .ok_or_else(|| unreadable("missing duration"))?
        .trim()
        .parse()
        .map_err(|_| unreadable("duration is not a number"))?;
    let container = format
        .format_name
        .as_deref()
        .and_then(|names| names.split(',').next())
        .unwrap_or_default()
        .to_string();
    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| unreadable("no video stream found"))?;
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err(unreadable("video stream has no dimensions"));
    };
    Ok(VideoInfo {
        duration_secs,
        dimensions: Dimensions::new(width, height),
        container,
    })
}

/// File extension for a probed container name.
pub fn container_extension(container: &str) -> &str {
    match container {
        "mov" => "mp4",
        "matroska" => "mkv",
        "" => "mp4",
        other => other,
    }
}

/// `ffprobe` for inspection, `ffmpeg` for average-bitrate transcodes.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: String,
    ffprobe: String,
    preset: String,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe", "fast")
    }
}

impl FfmpegEncoder {
    pub fn new(
        ffmpeg: impl Into<String>,
        ffprobe: impl Into<String>,
        preset: impl Into<String>,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            preset: preset.into(),
        }
    }

    pub fn probe_args(input: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-v",
            "error",
            "-show_entries",
            "format=duration,format_name:stream=width,height,codec_name,codec_type",
            "-select_streams",
            "v:0",
            "-of",
            "json",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        args.push(input.as_os_str().to_os_string());
        args
    }

    pub fn encode_args(&self, input: &Path, output: &Path, job: &VideoJob<'_>) -> Vec<OsString> {
        let bitrate = job.video_bitrate as f64;
        let buffer = (bitrate * 1.5).min(MAX_BUFFER_BITS) as u64;
        let maxrate = (bitrate * 1.2) as u64;
        let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), input.as_os_str().into()];
        let numeric = [
            ("-b:v", job.video_bitrate.to_string()),
            ("-b:a", job.audio_bitrate.to_string()),
            ("-bufsize", buffer.to_string()),
            ("-maxrate", maxrate.to_string()),
            ("-preset", self.preset.clone()),
            ("-movflags", "+faststart".to_string()),
            ("-loglevel", "error".to_string()),
        ];
        for (flag, value) in numeric {
            args.push(flag.into());
            args.push(value.into());
        }
        if let Some(d) = job.dimensions {
            args.push("-vf".into());
            args.push(format!("scale={}:{}", d.width, d.height).into());
        }
        args.push(output.as_os_str().into());
        args
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn check_available(&self) -> Result<()> {
        let ffmpeg = process::version(&self.ffmpeg, "-version")?;
        process::version(&self.ffprobe, "-version")?;
        info!("Using {}", ffmpeg);
        Ok(())
    }

    fn inspect(&self, input: &Path, cancel: &CancelToken) -> Result<VideoInfo> {
        let output = process::run(
            Command::new(&self.ffprobe).args(Self::probe_args(input)),
            "ffprobe",
            cancel,
        )
        .map_err(|e| match e {
            CompressError::EncoderFailure { reason, .. } => {
                CompressError::invalid(format!("cannot read video information: {}", reason))
            }
            other => other,
        })?;
        let info = parse_probe(&output.stdout)?;
        debug!(
            "Probed {:?}: {:.2}s {} {}",
            input, info.duration_secs, info.dimensions, info.container
        );
        Ok(info)
    }

    fn encode(
        &self,
        input: &Path,
        job: &VideoJob<'_>,
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<Encoded> {
        let output = workspace.probe_path(job.extension);
        process::run(
            Command::new(&self.ffmpeg).args(self.encode_args(input, &output, job)),
            "ffmpeg",
            cancel,
        )?;
        Encoded::from_file(&output)
    }
}
