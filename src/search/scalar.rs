//! Binary search over a single monotone quality knob.

use log::debug;

use super::cache::Prober;
use super::engine::{
    Acceptance, ConstrainedSearch, DiscreteWalk, Monotonicity, MonotonicityWatch,
};
use super::selector::ResultSelector;
use crate::encoder::Encoded;
use crate::error::Result;
use crate::model::{Dimensions, ImageParams, QualityBounds, Sample};

#[derive(Debug, Clone)]
pub struct ScalarQualitySearch {
    pub bounds: QualityBounds,
    pub max_iterations: u32,
    /// How many quality steps above the bisection result are tried linearly afterwards.
    pub refine_span: u8,
}

impl ScalarQualitySearch {
    pub fn new(bounds: QualityBounds) -> Self {
        Self {
            bounds,
            max_iterations: 20,
            refine_span: 4,
        }
    }

    /// Highest-size quality at `dimensions` that fits `target`, or `None` when
    /// even the minimum quality is over budget at this resolution.
    ///
    /// Encoder failures on the two bracket probes are returned as errors;
    /// failures inside the bisection count as "too large".
    pub fn search<F>(
        &self,
        prober: &mut Prober<'_, ImageParams, F>,
        target: u64,
        tolerance: u64,
        dimensions: Option<Dimensions>,
    ) -> Result<Option<Sample<ImageParams>>>
    where
        F: FnMut(&ImageParams) -> Result<Encoded>,
    {
        let QualityBounds { min, max } = self.bounds;
        prober.retain_within(target);
        let at = |quality: u8| ImageParams {
            quality,
            dimensions,
        };

        let top = prober.probe(at(max))?;
        if top.size <= target {
            debug!("Quality {} already fits ({} <= {})", max, top.size, target);
            return Ok(Some(top));
        }

        let bottom = prober.probe(at(min))?;
        if bottom.size > target {
            debug!(
                "Quality {} still too large at {:?} ({} > {})",
                min, dimensions, bottom.size, target
            );
            return Ok(None);
        }
        if target - bottom.size <= tolerance {
            return Ok(Some(bottom));
        }

        let mut selector = ResultSelector::new(target);
        selector.offer(&bottom);
        let mut watch = MonotonicityWatch::new(Monotonicity::Increasing);
        watch.observe(max as f64, top.size, "quality");
        watch.observe(min as f64, bottom.size, "quality");

        let engine = ConstrainedSearch {
            acceptance: Acceptance::at_most(target, tolerance),
            monotonicity: Monotonicity::Increasing,
            max_iterations: self.max_iterations,
        };
        let state = engine.run(DiscreteWalk::new(min as i64, max as i64), |q| {
            let Some(result) = prober.probe_absorbing(at(q as u8))? else {
                return Ok(None);
            };
            watch.observe(q as f64, result.size, "quality");
            selector.offer(&result);
            Ok(Some(result.size))
        })?;
        debug!(
            "Quality bisection ended after {} steps ({:?})",
            state.iterations, state.stop
        );

        // bisection only lands on midpoints; walk a few steps past the best one
        if let Some(best) = selector.best().map(|b| b.params.quality) {
            let upper = best.saturating_add(self.refine_span).min(max);
            for quality in best.saturating_add(1)..=upper {
                if let Some(result) = prober.probe_absorbing(at(quality))? {
                    watch.observe(quality as f64, result.size, "quality");
                    selector.offer(&result);
                }
            }
        }

        Ok(selector.into_best())
    }
}
