use crate::model::{Params, ProbeResult, Sample};

/// Something the selector can rank: a size and whether it was resized.
pub trait Candidate: Clone {
    fn size(&self) -> u64;
    fn is_scaled(&self) -> bool;
}

impl<P: Params> Candidate for Sample<P> {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_scaled(&self) -> bool {
        self.params.is_scaled()
    }
}

impl<P: Params> Candidate for ProbeResult<P> {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_scaled(&self) -> bool {
        self.params.is_scaled()
    }
}

/// Keeps the candidate with the largest size that still respects the budget.
/// Ties go to the unscaled one. Everything else offered is dropped.
#[derive(Debug, Clone)]
pub struct ResultSelector<T> {
    limit: u64,
    best: Option<T>,
}

impl<T: Candidate> ResultSelector<T> {
    pub fn new(limit: u64) -> Self {
        Self { limit, best: None }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Returns true when `candidate` became the new best.
    pub fn offer(&mut self, candidate: &T) -> bool {
        if candidate.size() > self.limit {
            return false;
        }
        let better = match &self.best {
            None => true,
            Some(best) => {
                candidate.size() > best.size()
                    || (candidate.size() == best.size()
                        && best.is_scaled()
                        && !candidate.is_scaled())
            }
        };
        if better {
            self.best = Some(candidate.clone());
        }
        better
    }

    pub fn best(&self) -> Option<&T> {
        self.best.as_ref()
    }

    pub fn best_size(&self) -> Option<u64> {
        self.best.as_ref().map(|b| b.size())
    }

    pub fn into_best(self) -> Option<T> {
        self.best
    }
}
