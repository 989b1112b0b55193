//! Probe deduplication. The cache remembers sizes only; the prober keeps the
//! bytes of at most two results (the best one within budget and the most
//! recent encode), so a long search does not hold every intermediate output.

use std::collections::HashMap;

use log::{debug, warn};

use super::selector::ResultSelector;
use crate::cancel::CancelToken;
use crate::encoder::Encoded;
use crate::error::{CompressError, Result};
use crate::model::{Params, ProbeResult, Sample};

#[derive(Debug, Clone)]
enum Cached {
    Size(u64),
    Failed { encoder: String, reason: String },
}

/// Probe outcomes already taken during one search, keyed by parameter vector.
#[derive(Debug)]
pub struct ProbeCache<P> {
    entries: HashMap<P, Cached>,
    hits: u32,
}

impl<P: Params> Default for ProbeCache<P> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
        }
    }
}

impl<P: Params> ProbeCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&mut self, params: &P) -> Option<Result<Sample<P>>> {
        let entry = self.entries.get(params)?;
        self.hits += 1;
        Some(match entry {
            Cached::Size(size) => Ok(Sample {
                params: params.clone(),
                size: *size,
            }),
            Cached::Failed { encoder, reason } => {
                Err(CompressError::failure(encoder.clone(), reason.clone()))
            }
        })
    }

    fn record<T>(&mut self, params: P, outcome: &Result<T>, size: impl Fn(&T) -> u64) {
        let entry = match outcome {
            Ok(result) => Cached::Size(size(result)),
            Err(CompressError::EncoderFailure { encoder, reason }) => Cached::Failed {
                encoder: encoder.clone(),
                reason: reason.clone(),
            },
            // cancellation and IO problems say nothing about the parameter point
            Err(_) => return,
        };
        self.entries.insert(params, entry);
    }

    pub fn contains(&self, params: &P) -> bool {
        self.entries.contains_key(params)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }
}

/// Wraps an encode function with dedup, cancellation, probe accounting and
/// artifact retention.
pub struct Prober<'c, P, F> {
    encode: F,
    cache: ProbeCache<P>,
    cancel: &'c CancelToken,
    fresh: u32,
    /// Best result within the budget set by [`retain_within`](Self::retain_within).
    kept: Option<ResultSelector<ProbeResult<P>>>,
    /// Most recent encoder output, whatever its size.
    last: Option<ProbeResult<P>>,
}

impl<'c, P, F> Prober<'c, P, F>
where
    P: Params,
    F: FnMut(&P) -> Result<Encoded>,
{
    pub fn new(encode: F, cancel: &'c CancelToken) -> Self {
        Self {
            encode,
            cache: ProbeCache::new(),
            cancel,
            fresh: 0,
            kept: None,
            last: None,
        }
    }

    /// Keeps the bytes of the largest result no bigger than `limit`. Changing
    /// the limit forgets the previously kept result.
    pub fn retain_within(&mut self, limit: u64) {
        if self.kept.as_ref().map(|k| k.limit()) != Some(limit) {
            self.kept = Some(ResultSelector::new(limit));
        }
    }

    fn encode_fresh(&mut self, params: &P) -> Result<ProbeResult<P>> {
        self.cancel.check()?;
        self.fresh += 1;
        let result = (self.encode)(params).map(|encoded| ProbeResult {
            params: params.clone(),
            size: encoded.size,
            artifact: encoded.artifact,
        });
        match &result {
            Ok(r) => debug!("Probe {:?}: {} bytes", params, r.size),
            Err(e) => debug!("Probe {:?}: {}", params, e),
        }
        result
    }

    pub fn probe(&mut self, params: P) -> Result<Sample<P>> {
        if let Some(cached) = self.cache.lookup(&params) {
            debug!("Probe {:?}: cached", params);
            return cached;
        }
        let outcome = self.encode_fresh(&params);
        self.cache.record(params, &outcome, |r| r.size);
        let result = outcome?;
        let sample = result.sample();
        if let Some(kept) = self.kept.as_mut() {
            kept.offer(&result);
        }
        // replacing `last` releases the previous output unless it is the kept one
        self.last = Some(result);
        Ok(sample)
    }

    /// Like [`probe`](Self::probe), but an encoder failure becomes `Ok(None)`.
    pub fn probe_absorbing(&mut self, params: P) -> Result<Option<Sample<P>>> {
        match self.probe(params) {
            Ok(sample) => Ok(Some(sample)),
            Err(e) if e.is_probe_failure() => {
                warn!("Absorbing failed probe: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// The full result behind `sample`. Served from the kept or most recent
    /// output when it is one of them; otherwise the point is encoded again.
    pub fn retrieve(&mut self, sample: &Sample<P>) -> Result<ProbeResult<P>> {
        let retained = self
            .kept
            .as_ref()
            .and_then(|k| k.best())
            .into_iter()
            .chain(self.last.as_ref())
            .find(|r| r.params == sample.params);
        if let Some(result) = retained {
            return Ok(result.clone());
        }
        debug!("Re-encoding {:?}; its output was not retained", sample.params);
        self.encode_fresh(&sample.params)
    }

    pub fn has_probed(&self, params: &P) -> bool {
        self.cache.contains(params)
    }

    /// Encoder invocations actually made (cache hits excluded).
    pub fn fresh_probes(&self) -> u32 {
        self.fresh
    }

    pub fn cache(&self) -> &ProbeCache<P> {
        &self.cache
    }
}
