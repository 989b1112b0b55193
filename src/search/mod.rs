//! Target-size search strategies.
//!
//! - [`scalar`]: bisection over an integer quality knob (images)
//! - [`ladder`]: resolution fallback around the scalar search (images)
//! - [`tier`]: bisection over a table of coarse presets (PDF)
//! - [`bitrate`]: damped bitrate convergence into a size band (video)
//!
//! All four run on the loop in [`engine`], share the dedup in [`cache`] and
//! pick their answer with [`selector`].

pub mod bitrate;
pub mod cache;
pub mod engine;
pub mod ladder;
pub mod scalar;
pub mod selector;
pub mod tier;

pub use bitrate::{BitrateConverger, Margins, SizeBand};
pub use cache::{ProbeCache, Prober};
pub use engine::{Acceptance, ConstrainedSearch, Monotonicity, Verdict};
pub use ladder::DimensionLadder;
pub use scalar::ScalarQualitySearch;
pub use selector::ResultSelector;
pub use tier::{PdfPreset, QualityTier, TierTable, TierTableSearch};

use crate::model::Sample;

/// How a strategy finished. The bytes behind the answer are fetched from the
/// prober with [`Prober::retrieve`].
#[derive(Debug, Clone)]
pub enum Resolution<P> {
    /// Within budget.
    Converged(Sample<P>),
    /// Best-effort result that is still over budget.
    Floor(Sample<P>),
}

impl<P> Resolution<P> {
    pub fn result(&self) -> &Sample<P> {
        match self {
            Resolution::Converged(r) | Resolution::Floor(r) => r,
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Resolution::Converged(_))
    }
}
