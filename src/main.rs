use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rayon::prelude::*;

use media_compressor_rust::{
    format_size, output_name, parse_size, CancelToken, CompressionOutcome, Compressor,
    CompressorConfig, MediaKind, PdfBackend, SourceArtifact,
};

/// Compress images, PDFs and videos to a target file size
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input files
    #[arg(required_unless_present = "dump_config")]
    inputs: Vec<PathBuf>,

    /// Target size, e.g. 500KB, 1.5MB or a plain byte count
    #[arg(short, long, value_parser = parse_target, required_unless_present = "dump_config")]
    target: Option<u64>,

    /// Output file (single input only)
    #[arg(short, long, conflicts_with = "output_dir")]
    output: Option<PathBuf>,

    /// Directory for `<stem>_compressed.<ext>` outputs (default: next to each input)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Media kind, when the extension does not tell
    #[arg(long, value_enum)]
    kind: Option<MediaKind>,

    /// Acceptable shortfall below the target, in percent
    #[arg(long)]
    tolerance: Option<f64>,

    /// Lowest image quality the search may use (1-100)
    #[arg(long)]
    min_quality: Option<u8>,

    /// Highest image quality the search may use (1-100)
    #[arg(long)]
    max_quality: Option<u8>,

    /// PDF encoder
    #[arg(long, value_enum)]
    pdf_backend: Option<PdfBackend>,

    /// Give up after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// JSON policy file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    dump_config: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_target(s: &str) -> std::result::Result<u64, String> {
    parse_size(s).map_err(|e| e.to_string())
}

fn load_config(args: &Args) -> Result<CompressorConfig> {
    let mut config = match &args.config {
        Some(path) => CompressorConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => CompressorConfig::default(),
    };
    if let Some(tolerance) = args.tolerance {
        config.image.tolerance_pct = tolerance;
    }
    if let Some(q) = args.min_quality {
        config.image.min_quality = q;
    }
    if let Some(q) = args.max_quality {
        config.image.max_quality = q;
    }
    if let Some(backend) = args.pdf_backend {
        config.pdf.backend = backend;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn destination(args: &Args, input: &Path, stem: &str, outcome: &CompressionOutcome) -> PathBuf {
    if let Some(output) = &args.output {
        return output.clone();
    }
    let name = output_name(outcome, stem);
    match &args.output_dir {
        Some(dir) => dir.join(name),
        None => input.with_file_name(name),
    }
}

fn compress_one(
    compressor: &Compressor,
    args: &Args,
    input: &Path,
    target: u64,
    cancel: &CancelToken,
) -> Result<(PathBuf, CompressionOutcome)> {
    let kind = args
        .kind
        .or_else(|| MediaKind::from_path(input))
        .with_context(|| format!("Cannot tell the media kind of {:?}; pass --kind", input))?;
    let source = SourceArtifact::from_path(input, kind);
    let stem = source.stem();
    let request = compressor.config().request(source, target);
    let outcome = compressor
        .compress(&request, cancel)
        .with_context(|| format!("Failed to compress {:?}", input))?;
    let dest = destination(args, input, &stem, &outcome);
    outcome
        .artifact
        .write_to(&dest)
        .with_context(|| format!("Failed to write {:?}", dest))?;
    Ok((dest, outcome))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = load_config(&args)?;
    if args.dump_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }
    let target = args.target.context("--target is required")?;
    if args.output.is_some() && args.inputs.len() > 1 {
        bail!("--output takes a single input; use --output-dir for several");
    }
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }

    let compressor = Compressor::new(config)?;
    let cancel = match args.timeout {
        Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };

    let start = Instant::now();
    let results: Vec<_> = args
        .inputs
        .par_iter()
        .map(|input| (input, compress_one(&compressor, &args, input, target, &cancel)))
        .collect();

    let mut failures = 0;
    for (input, result) in results {
        match result {
            Ok((dest, outcome)) => {
                println!("{}", input.display());
                println!("  Original size: {}", format_size(outcome.original_bytes));
                println!("  New size:      {}", format_size(outcome.achieved_bytes));
                println!("  Target:        {}", format_size(outcome.target_bytes));
                println!("  Reduction:     {:.2}%", outcome.reduction_percent);
                println!("  Parameters:    {}", outcome.parameters);
                println!(
                    "  Target met:    {}",
                    if outcome.success { "yes" } else { "no (best effort)" }
                );
                println!("  Written to:    {}", dest.display());
            }
            Err(e) => {
                eprintln!("{}: {:#}", input.display(), e);
                failures += 1;
            }
        }
    }
    println!("Processed {} files in {:.2?}", args.inputs.len(), start.elapsed());

    if failures > 0 {
        bail!("{} of {} inputs failed", failures, args.inputs.len());
    }
    Ok(())
}
