//! Target-size media compression.
//!
//! Given a source image, PDF or video and a byte budget, search the
//! encoder's parameter space for the largest output that still fits.

pub mod cancel;
pub mod config;
pub mod controller;
pub mod encoder;
pub mod error;
pub mod model;
pub mod search;
pub mod size;
pub mod wasm;
pub mod workspace;

pub use cancel::CancelToken;
pub use config::{CompressorConfig, PdfBackend};
pub use controller::{output_name, Compressor};
pub use error::{CompressError, Result};
pub use model::{
    Artifact, CompressionOutcome, CompressionRequest, MediaKind, ParameterVector, SourceArtifact,
};
pub use size::{format_size, parse_size};
