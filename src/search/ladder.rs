use log::{debug, info, warn};

use super::cache::Prober;
use super::scalar::ScalarQualitySearch;
use super::Resolution;
use crate::encoder::Encoded;
use crate::error::Result;
use crate::model::{Dimensions, ImageParams};

/// Shrinks resolution step by step when quality alone cannot reach the target.
#[derive(Debug, Clone)]
pub struct DimensionLadder {
    /// Strictly descending linear scale factors.
    pub steps: Vec<f64>,
    /// Scale of the last-resort probe at minimum quality.
    pub floor_scale: f64,
}

impl Default for DimensionLadder {
    fn default() -> Self {
        Self {
            steps: vec![0.9, 0.8, 0.7, 0.6, 0.5, 0.4, 0.3, 0.2],
            floor_scale: 0.1,
        }
    }
}

impl DimensionLadder {
    /// Distinct resolutions the ladder will visit, largest first. Scales that
    /// truncate to the original or to an already listed size are skipped.
    pub fn rungs(&self, original: Dimensions) -> Vec<(f64, Dimensions)> {
        let mut rungs: Vec<(f64, Dimensions)> = Vec::with_capacity(self.steps.len());
        for &scale in &self.steps {
            let dims = original.scaled(scale);
            if dims == original || rungs.iter().any(|&(_, d)| d == dims) {
                debug!("Skipping scale {} ({} already tried)", scale, dims);
                continue;
            }
            rungs.push((scale, dims));
        }
        rungs
    }

    pub fn search<F>(
        &self,
        quality: &ScalarQualitySearch,
        prober: &mut Prober<'_, ImageParams, F>,
        original: Dimensions,
        target: u64,
        tolerance: u64,
    ) -> Result<Resolution<ImageParams>>
    where
        F: FnMut(&ImageParams) -> Result<Encoded>,
    {
        prober.retain_within(target);
        for (scale, dims) in self.rungs(original) {
            info!("Resizing {} -> {} ({:.0}%)", original, dims, scale * 100.0);

            // cheap check before a nested search
            let top = prober.probe(ImageParams {
                quality: quality.bounds.max,
                dimensions: Some(dims),
            })?;
            if top.size <= target {
                return Ok(Resolution::Converged(top));
            }

            if let Some(found) = quality.search(prober, target, tolerance, Some(dims))? {
                return Ok(Resolution::Converged(found));
            }
        }

        let floor_dims = original.scaled(self.floor_scale);
        let floor = prober.probe(ImageParams {
            quality: quality.bounds.min,
            // a source too small to shrink is encoded at its own size
            dimensions: (floor_dims != original).then_some(floor_dims),
        })?;
        if floor.size <= target {
            return Ok(Resolution::Converged(floor));
        }
        warn!(
            "Could not reach {} bytes; smallest result is {} bytes at {}",
            target, floor.size, floor_dims
        );
        Ok(Resolution::Floor(floor))
    }
}
