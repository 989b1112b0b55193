use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

use log::{debug, info};

use super::{process, Encoded, PdfEncoder};
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::search::QualityTier;
use crate::workspace::Workspace;

/// Re-renders a PDF through Ghostscript's `pdfwrite` device.
#[derive(Debug, Clone)]
pub struct GhostscriptEncoder {
    program: String,
}

impl GhostscriptEncoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(input: &Path, output: &Path, tier: &QualityTier) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-sDEVICE=pdfwrite".to_string(),
            "-dCompatibilityLevel=1.5".to_string(),
            format!("-dPDFSETTINGS={}", tier.preset.as_gs_setting()),
            "-dDownsampleColorImages=true".to_string(),
            "-dDownsampleGrayImages=true".to_string(),
            "-dDownsampleMonoImages=true".to_string(),
            format!("-dColorImageResolution={}", tier.dpi),
            format!("-dGrayImageResolution={}", tier.dpi),
            format!("-dMonoImageResolution={}", tier.dpi),
            "-dNOPAUSE".to_string(),
            "-dBATCH".to_string(),
            "-dQUIET".to_string(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        let mut out = OsString::from("-sOutputFile=");
        out.push(output.as_os_str());
        args.push(out);
        args.push(input.as_os_str().to_os_string());
        args
    }
}

impl Default for GhostscriptEncoder {
    fn default() -> Self {
        Self::new(if cfg!(windows) { "gswin64c" } else { "gs" })
    }
}

impl PdfEncoder for GhostscriptEncoder {
    fn name(&self) -> &str {
        "ghostscript"
    }

    fn check_available(&self) -> Result<()> {
        let version = process::version(&self.program, "--version")?;
        info!("Using Ghostscript {} ({})", version, self.program);
        Ok(())
    }

    fn encode(
        &self,
        input: &Path,
        tier: &QualityTier,
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<Encoded> {
        let output = workspace.probe_path("pdf");
        debug!("Ghostscript preset={} dpi={}", tier.preset, tier.dpi);
        process::run(
            Command::new(&self.program).args(Self::args(input, &output, tier)),
            self.name(),
            cancel,
        )?;
        Encoded::from_file(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompressError;
    use crate::search::PdfPreset;

    #[test]
    fn command_line_carries_preset_and_resolution() {
        let tier = QualityTier::new(0.3, PdfPreset::Ebook, 100);
        let args = GhostscriptEncoder::args(Path::new("in.pdf"), Path::new("out.pdf"), &tier);
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"-dPDFSETTINGS=/ebook".to_string()));
        assert!(args.contains(&"-dColorImageResolution=100".to_string()));
        assert!(args.contains(&"-dMonoImageResolution=100".to_string()));
        assert_eq!(args[args.len() - 2], "-sOutputFile=out.pdf");
        assert_eq!(args[args.len() - 1], "in.pdf");
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let gs = GhostscriptEncoder::new("no-such-ghostscript-binary");
        assert!(matches!(
            gs.check_available(),
            Err(CompressError::EncoderUnavailable { .. })
        ));
    }
}
