//! Video bitrate convergence into a size band.
//!
//! Encoders cannot hit an exact byte count, so success is a band below the
//! caller's limit rather than the limit itself. A single 80% downscale is
//! tried before any bitrate tightening because it buys the larger step.

use log::{debug, info, warn};

use super::cache::Prober;
use super::engine::{Acceptance, ConstrainedSearch, DampedWalk, Monotonicity, Verdict, Walk};
use super::selector::ResultSelector;
use super::Resolution;
use crate::encoder::{Encoded, VideoInfo};
use crate::error::{CompressError, Result};
use crate::model::{BitrateBounds, VideoParams};

/// Safety margins subtracted from the caller's limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Margins {
    pub smaller: u64,
    pub larger: u64,
    /// Neither margin may exceed this share of the limit.
    pub cap_fraction: f64,
}

/// Acceptable output sizes, all below the caller's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBand {
    pub min: u64,
    /// Where the first bitrate estimate aims.
    pub target: u64,
    pub max: u64,
    /// Aim of the last-resort probe when the band was never reached from above.
    pub floor: u64,
}

impl SizeBand {
    pub fn below(limit: u64, margins: Margins) -> Self {
        let cap = (limit as f64 * margins.cap_fraction) as u64;
        let larger = margins.larger.min(cap);
        // keep the configured ratio between the margins when capping
        let smaller = if margins.larger == 0 {
            0
        } else {
            (margins.smaller as u128 * larger as u128 / margins.larger as u128) as u64
        };
        let min = limit.saturating_sub(larger);
        Self {
            min,
            target: limit.saturating_sub((smaller + larger) / 2),
            max: limit.saturating_sub(smaller),
            floor: min.saturating_sub(larger),
        }
    }

    pub fn contains(&self, size: u64) -> bool {
        self.min <= size && size <= self.max
    }

    pub fn acceptance(&self) -> Acceptance {
        Acceptance::Band {
            min: self.min,
            max: self.max,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BitrateConverger {
    pub bounds: BitrateBounds,
    pub audio_bitrate: u64,
    /// Linear scale of the one-shot resolution fallback.
    pub downscale: f64,
    pub max_attempts: u32,
    pub shrink: f64,
    pub grow: f64,
}

impl Default for BitrateConverger {
    fn default() -> Self {
        Self {
            bounds: BitrateBounds::default(),
            audio_bitrate: 128_000,
            downscale: 0.8,
            max_attempts: 4,
            shrink: 0.9,
            grow: 1.1,
        }
    }
}

impl BitrateConverger {
    /// Video bitrate (bps) that would spend `bytes` over `duration_secs`, after audio, clamped.
    pub fn estimate(&self, bytes: u64, duration_secs: f64) -> f64 {
        let total = bytes as f64 * 8.0 / duration_secs;
        self.bounds.clamp(total - self.audio_bitrate as f64)
    }

    pub fn converge<F>(
        &self,
        prober: &mut Prober<'_, VideoParams, F>,
        source: &VideoInfo,
        band: SizeBand,
    ) -> Result<Resolution<VideoParams>>
    where
        F: FnMut(&VideoParams) -> Result<Encoded>,
    {
        if !(source.duration_secs > 0.0) {
            return Err(CompressError::invalid(format!(
                "invalid video duration: {}",
                source.duration_secs
            )));
        }
        let acceptance = band.acceptance();
        prober.retain_within(band.max);
        let mut selector = ResultSelector::new(band.max);
        let at = |rate: f64, dimensions| VideoParams {
            video_bitrate: rate.round() as u64,
            dimensions,
        };

        let bitrate = self.estimate(band.target, source.duration_secs);
        info!(
            "Band {}..={} bytes, initial video bitrate {:.0} bps",
            band.min, band.max, bitrate
        );
        let mut dimensions = None;
        let mut last = prober.probe(at(bitrate, None))?;
        selector.offer(&last);

        if last.size > band.max {
            let scaled = source.dimensions.scaled(self.downscale).even();
            info!(
                "{} bytes over band; downscaling {} -> {}",
                last.size, source.dimensions, scaled
            );
            dimensions = Some(scaled);
            last = prober.probe(at(bitrate, dimensions))?;
            selector.offer(&last);
        }

        let verdict = acceptance.judge(last.size);
        if verdict != Verdict::Settled {
            let mut walk = DampedWalk {
                value: bitrate,
                min: self.bounds.min as f64,
                max: self.bounds.max as f64,
                shrink: self.shrink,
                grow: self.grow,
            };
            walk.shift(bitrate, Monotonicity::Increasing.movement(verdict));
            let engine = ConstrainedSearch {
                acceptance,
                monotonicity: Monotonicity::Increasing,
                max_iterations: self.max_attempts,
            };
            let state = engine.run(walk, |rate| {
                let result = prober.probe(at(rate, dimensions))?;
                debug!("bitrate {:.0} bps -> {} bytes", rate, result.size);
                selector.offer(&result);
                let size = result.size;
                last = result;
                Ok(Some(size))
            })?;
            debug!(
                "Bitrate convergence: {} attempts, {:?}",
                state.iterations, state.stop
            );
        }

        if last.size > band.max {
            let rate = self.estimate(band.floor, source.duration_secs);
            warn!(
                "Still {} bytes over band after {} attempts; final pass at {:.0} bps",
                last.size - band.max,
                self.max_attempts,
                rate
            );
            last = prober.probe(at(rate, dimensions))?;
            selector.offer(&last);
        }

        Ok(match selector.into_best() {
            Some(best) => Resolution::Converged(best),
            None => Resolution::Floor(last),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::model::{Artifact, Dimensions};
    use crate::size::MIB;
    use proptest::prelude::*;

    fn margins() -> Margins {
        Margins {
            smaller: MIB,
            larger: 2 * MIB,
            cap_fraction: 0.2,
        }
    }

    fn info(secs: f64) -> VideoInfo {
        VideoInfo {
            duration_secs: secs,
            dimensions: Dimensions::new(1920, 1080),
            container: "mp4".into(),
        }
    }

    /// Roughly honest encoder: bytes = bitrate * duration / 8 * overhead, shrunk by resolution.
    fn encoder(secs: f64, overhead: f64) -> impl FnMut(&VideoParams) -> Result<Encoded> {
        move |p: &VideoParams| {
            let pixel_share = p
                .dimensions
                .map(|d| d.pixels() as f64 / (1920.0 * 1080.0))
                .unwrap_or(1.0);
            let video = p.video_bitrate as f64 * secs / 8.0 * overhead * pixel_share.sqrt();
            let audio = 128_000.0 * secs / 8.0;
            Ok(Encoded {
                size: (video + audio) as u64,
                artifact: Artifact::from_bytes(Vec::new()),
            })
        }
    }

    #[test]
    fn band_from_limit() {
        let band = SizeBand::below(30 * MIB, margins());
        assert_eq!(band.min, 28 * MIB);
        assert_eq!(band.max, 29 * MIB);
        assert_eq!(band.target, 30 * MIB - 3 * MIB / 2);
        assert_eq!(band.floor, 26 * MIB);
    }

    #[test]
    fn small_limits_scale_the_margins() {
        let band = SizeBand::below(5 * MIB, margins());
        assert_eq!(band.min, 4 * MIB);
        assert_eq!(band.max, 5 * MIB - MIB / 2);
        assert!(band.min < band.max);
    }

    #[test]
    fn estimate_is_clamped() {
        let c = BitrateConverger::default();
        assert_eq!(c.estimate(1, 10.0), 100_000.0);
        assert_eq!(c.estimate(1 << 40, 10.0), 4_000_000.0);
        let mid = c.estimate(2_000_000, 10.0);
        assert!((mid - (1_600_000.0 - 128_000.0)).abs() < 1e-6);
    }

    #[test]
    fn converges_into_band() {
        let cancel = CancelToken::new();
        // 120 s at ~1 Mbps lands around 16 MB; overshoot by 8% forces corrections
        let mut prober = Prober::new(encoder(120.0, 1.08), &cancel);
        let band = SizeBand::below(20 * MIB, margins());
        let res = BitrateConverger::default()
            .converge(&mut prober, &info(120.0), band)
            .unwrap();
        let Resolution::Converged(found) = res else {
            panic!("expected convergence");
        };
        assert!(found.size <= band.max);
        assert!(prober.fresh_probes() <= 1 + 1 + 4 + 1);
    }

    #[test]
    fn short_clip_stays_below_band_at_max_bitrate() {
        // 10 s at the 4 Mbps ceiling is ~5 MB, far under a 28..29 MB band
        let cancel = CancelToken::new();
        let mut prober = Prober::new(encoder(10.0, 1.0), &cancel);
        let band = SizeBand::below(30 * MIB, margins());
        let res = BitrateConverger::default()
            .converge(&mut prober, &info(10.0), band)
            .unwrap();
        let found = res.result();
        assert!(found.size < band.min);
        assert_eq!(found.params.video_bitrate, 4_000_000);
        assert_eq!(found.params.dimensions, None);
        // every attempt re-clamps to the same bitrate, so they are cache hits
        assert_eq!(prober.fresh_probes(), 1);
    }

    #[test]
    fn downscale_happens_once_before_bitrate_steps() {
        let cancel = CancelToken::new();
        let mut seen = Vec::new();
        let mut inner = encoder(60.0, 3.0);
        let mut prober = Prober::new(
            |p: &VideoParams| {
                seen.push(*p);
                inner(p)
            },
            &cancel,
        );
        let band = SizeBand::below(20 * MIB, margins());
        let res = BitrateConverger::default()
            .converge(&mut prober, &info(60.0), band)
            .unwrap();
        drop(prober);
        assert_eq!(seen[0].dimensions, None);
        assert_eq!(seen[1].dimensions, Some(Dimensions::new(1536, 864)));
        assert_eq!(seen[0].video_bitrate, seen[1].video_bitrate);
        assert!(seen[2..].iter().all(|p| p.dimensions == Some(Dimensions::new(1536, 864))));
        assert!(seen.len() <= 7);
        assert!(res.result().params.dimensions.is_some());
    }

    #[test]
    fn floor_when_nothing_fits() {
        let cancel = CancelToken::new();
        // absurd overhead: even 100 kbps is far too big
        let mut prober = Prober::new(encoder(600.0, 500.0), &cancel);
        let band = SizeBand::below(10 * MIB, margins());
        let res = BitrateConverger::default()
            .converge(&mut prober, &info(600.0), band)
            .unwrap();
        let Resolution::Floor(floor) = res else {
            panic!("expected floor");
        };
        assert!(floor.size > band.max);
    }

    #[test]
    fn encoder_errors_are_fatal() {
        let cancel = CancelToken::new();
        let mut prober = Prober::new(
            |_: &VideoParams| -> Result<Encoded> {
                Err(CompressError::failure("ffmpeg", "exit 1"))
            },
            &cancel,
        );
        let band = SizeBand::below(30 * MIB, margins());
        assert!(BitrateConverger::default()
            .converge(&mut prober, &info(10.0), band)
            .is_err());
    }

    proptest! {
        #[test]
        fn every_probed_bitrate_is_within_bounds(
            secs in 1.0f64..3_600.0,
            overhead in 0.2f64..5.0,
            limit_mb in 2u64..500,
        ) {
            let cancel = CancelToken::new();
            let mut rates = Vec::new();
            let mut inner = encoder(secs, overhead);
            let mut prober = Prober::new(
                |p: &VideoParams| {
                    rates.push(p.video_bitrate);
                    inner(p)
                },
                &cancel,
            );
            let band = SizeBand::below(limit_mb * MIB, margins());
            let res = BitrateConverger::default().converge(&mut prober, &info(secs), band);
            drop(prober);
            prop_assert!(res.is_ok());
            for rate in rates {
                prop_assert!((100_000..=4_000_000).contains(&rate));
            }
        }
    }
}
