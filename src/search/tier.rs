//! Search over a fixed table of coarse encoder presets.
//!
//! The table is indexed by a quality factor in `[0, 1]`. Bisection runs on
//! the continuous factor and every midpoint is resolved to the first tier at
//! or above it, so adjacent midpoints can land on the same tier; the probe
//! cache turns those repeats into lookups.

use std::fmt;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::cache::Prober;
use super::engine::{Acceptance, ConstrainedSearch, ContinuousWalk, Monotonicity, MonotonicityWatch};
use super::selector::ResultSelector;
use super::Resolution;
use crate::encoder::Encoded;
use crate::error::{CompressError, Result};
use crate::model::PdfParams;

/// Ghostscript `-dPDFSETTINGS` rendering profile, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdfPreset {
    Screen,
    Ebook,
    Printer,
    Prepress,
    Default,
}

impl PdfPreset {
    pub fn as_gs_setting(&self) -> &'static str {
        match self {
            PdfPreset::Screen => "/screen",
            PdfPreset::Ebook => "/ebook",
            PdfPreset::Printer => "/printer",
            PdfPreset::Prepress => "/prepress",
            PdfPreset::Default => "/default",
        }
    }
}

impl fmt::Display for PdfPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_gs_setting()[1..])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityTier {
    pub quality_factor: f64,
    pub preset: PdfPreset,
    pub dpi: u32,
}

impl QualityTier {
    pub const fn new(quality_factor: f64, preset: PdfPreset, dpi: u32) -> Self {
        Self {
            quality_factor,
            preset,
            dpi,
        }
    }
}

/// Non-empty, strictly ascending list of tiers. Deserializing goes through
/// [`TierTable::new`], so a loaded table is always searchable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<QualityTier>", into = "Vec<QualityTier>")]
pub struct TierTable {
    tiers: Vec<QualityTier>,
}

impl TryFrom<Vec<QualityTier>> for TierTable {
    type Error = CompressError;

    fn try_from(tiers: Vec<QualityTier>) -> Result<Self> {
        Self::new(tiers)
    }
}

impl From<TierTable> for Vec<QualityTier> {
    fn from(table: TierTable) -> Self {
        table.tiers
    }
}

impl Default for TierTable {
    fn default() -> Self {
        use PdfPreset::*;
        Self {
            tiers: vec![
                QualityTier::new(0.0, Screen, 36),
                QualityTier::new(0.1, Screen, 50),
                QualityTier::new(0.2, Screen, 72),
                QualityTier::new(0.3, Ebook, 100),
                QualityTier::new(0.4, Ebook, 150),
                QualityTier::new(0.5, Ebook, 200),
                QualityTier::new(0.6, Printer, 225),
                QualityTier::new(0.7, Printer, 250),
                QualityTier::new(0.8, Printer, 300),
                QualityTier::new(0.9, Prepress, 300),
                QualityTier::new(1.0, Prepress, 400),
            ],
        }
    }
}

impl TierTable {
    pub fn new(tiers: Vec<QualityTier>) -> Result<Self> {
        let table = Self { tiers };
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(CompressError::InvalidConfig("tier table is empty".into()));
        }
        for pair in self.tiers.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.quality_factor >= b.quality_factor {
                return Err(CompressError::InvalidConfig(format!(
                    "tier quality factors must ascend ({} then {})",
                    a.quality_factor, b.quality_factor
                )));
            }
            if (a.preset, a.dpi) > (b.preset, b.dpi) {
                return Err(CompressError::InvalidConfig(format!(
                    "tiers must ascend by preset and dpi ({}@{} then {}@{})",
                    a.preset, a.dpi, b.preset, b.dpi
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&QualityTier> {
        self.tiers.get(index)
    }

    /// Index of the first tier whose factor is at least `factor`; the highest tier past the end.
    pub fn index_for(&self, factor: f64) -> usize {
        self.tiers
            .iter()
            .position(|t| factor <= t.quality_factor)
            .unwrap_or(self.tiers.len() - 1)
    }

    pub fn tier_for(&self, factor: f64) -> &QualityTier {
        &self.tiers[self.index_for(factor)]
    }

    pub fn params(&self, index: usize) -> PdfParams {
        let tier = &self.tiers[index];
        PdfParams {
            tier: index,
            preset: tier.preset,
            dpi: tier.dpi,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TierTableSearch<'t> {
    pub table: &'t TierTable,
    /// Bisection stops once the factor interval is narrower than this.
    pub min_width: f64,
    pub max_iterations: u32,
}

impl<'t> TierTableSearch<'t> {
    pub fn new(table: &'t TierTable) -> Self {
        Self {
            table,
            min_width: 0.05,
            max_iterations: 8,
        }
    }

    /// Always yields a usable artifact: the lowest tier is the floor when even it is too large.
    pub fn search<F>(
        &self,
        prober: &mut Prober<'_, PdfParams, F>,
        target: u64,
        tolerance: u64,
    ) -> Result<Resolution<PdfParams>>
    where
        F: FnMut(&PdfParams) -> Result<Encoded>,
    {
        prober.retain_within(target);
        let lowest = prober.probe(self.table.params(0))?;
        info!(
            "Lowest tier ({}@{}dpi): {} bytes, target {}",
            lowest.params.preset, lowest.params.dpi, lowest.size, target
        );
        if lowest.size > target {
            warn!("Cannot reach target even with maximum compression");
            return Ok(Resolution::Floor(lowest));
        }

        let highest = prober.probe(self.table.params(self.table.len() - 1))?;
        info!(
            "Highest tier ({}@{}dpi): {} bytes",
            highest.params.preset, highest.params.dpi, highest.size
        );
        if highest.size <= target {
            return Ok(Resolution::Converged(highest));
        }

        let mut selector = ResultSelector::new(target);
        selector.offer(&lowest);
        let mut watch = MonotonicityWatch::new(Monotonicity::Increasing);
        watch.observe(0.0, lowest.size, "pdf tier");
        watch.observe((self.table.len() - 1) as f64, highest.size, "pdf tier");

        let engine = ConstrainedSearch {
            acceptance: Acceptance::at_most(target, tolerance),
            monotonicity: Monotonicity::Increasing,
            max_iterations: self.max_iterations,
        };
        let state = engine.run(ContinuousWalk::new(0.0, 1.0, self.min_width), |factor| {
            let index = self.table.index_for(factor);
            let Some(result) = prober.probe_absorbing(self.table.params(index))? else {
                return Ok(None);
            };
            debug!(
                "factor={:.2} -> tier {} ({}@{}dpi): {} bytes",
                factor, index, result.params.preset, result.params.dpi, result.size
            );
            watch.observe(index as f64, result.size, "pdf tier");
            selector.offer(&result);
            Ok(Some(result.size))
        })?;
        debug!(
            "Tier bisection ended after {} steps ({:?})",
            state.iterations, state.stop
        );

        // the lowest tier already fits, so the selector always holds something
        Ok(Resolution::Converged(selector.into_best().unwrap_or(lowest)))
    }
}
