//! Constrained parameter search over a black-box encoder.
//!
//! Every strategy in this crate has the same shape: pick a parameter point,
//! probe the encoder, judge the observed size against an acceptance rule and
//! move the point up or down until the rule is settled, the interval
//! collapses or the iteration cap is hit. What differs is how the point moves
//! ([`Walk`]), what "good enough" means ([`Acceptance`]) and which way size
//! responds to the parameter ([`Monotonicity`]).

use log::warn;

use crate::error::Result;

/// How an observed size is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Fits when `size <= limit`; settled once within `slack` bytes of the limit.
    AtMost { limit: u64, slack: u64 },
    /// Settled when `min <= size <= max`.
    Band { min: u64, max: u64 },
}

impl Acceptance {
    pub fn at_most(limit: u64, slack: u64) -> Self {
        Acceptance::AtMost { limit, slack }
    }

    /// The largest size that respects the budget.
    pub fn limit(&self) -> u64 {
        match *self {
            Acceptance::AtMost { limit, .. } => limit,
            Acceptance::Band { max, .. } => max,
        }
    }

    pub fn judge(&self, size: u64) -> Verdict {
        match *self {
            Acceptance::AtMost { limit, slack } => {
                if size > limit {
                    Verdict::Over
                } else if limit - size <= slack {
                    Verdict::Settled
                } else {
                    Verdict::Under
                }
            }
            Acceptance::Band { min, max } => {
                if size > max {
                    Verdict::Over
                } else if size < min {
                    Verdict::Under
                } else {
                    Verdict::Settled
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Within budget but further from the target than acceptable.
    Under,
    Settled,
    /// Over budget, or the encoder failed at this point.
    Over,
}

/// Direction in which output size responds to the parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monotonicity {
    Increasing,
    Decreasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    Raise,
    Lower,
    Stop,
}

impl Monotonicity {
    /// Which way the parameter has to go to get closer to the target from below.
    pub fn movement(self, verdict: Verdict) -> Move {
        match (self, verdict) {
            (_, Verdict::Settled) => Move::Stop,
            (Monotonicity::Increasing, Verdict::Under) => Move::Raise,
            (Monotonicity::Increasing, Verdict::Over) => Move::Lower,
            (Monotonicity::Decreasing, Verdict::Under) => Move::Lower,
            (Monotonicity::Decreasing, Verdict::Over) => Move::Raise,
        }
    }
}

/// Produces the next parameter point and reacts to a move.
pub trait Walk {
    type Point: Copy + std::fmt::Debug;

    /// `None` once the search interval has collapsed.
    fn next(&self) -> Option<Self::Point>;

    fn shift(&mut self, from: Self::Point, movement: Move);
}

/// Integer bisection over `[low, high]`.
#[derive(Debug, Clone, Copy)]
pub struct DiscreteWalk {
    pub low: i64,
    pub high: i64,
}

impl DiscreteWalk {
    pub fn new(low: i64, high: i64) -> Self {
        Self { low, high }
    }
}

impl Walk for DiscreteWalk {
    type Point = i64;

    fn next(&self) -> Option<i64> {
        if self.low <= self.high {
            Some((self.low + self.high).div_euclid(2))
        } else {
            None
        }
    }

    fn shift(&mut self, from: i64, movement: Move) {
        match movement {
            Move::Raise => self.low = from + 1,
            Move::Lower => self.high = from - 1,
            Move::Stop => {}
        }
    }
}

/// Real-valued bisection over `[low, high]` until narrower than `min_width`.
#[derive(Debug, Clone, Copy)]
pub struct ContinuousWalk {
    pub low: f64,
    pub high: f64,
    pub min_width: f64,
}

impl ContinuousWalk {
    pub fn new(low: f64, high: f64, min_width: f64) -> Self {
        Self {
            low,
            high,
            min_width,
        }
    }
}

impl Walk for ContinuousWalk {
    type Point = f64;

    fn next(&self) -> Option<f64> {
        if self.high - self.low > self.min_width {
            Some((self.low + self.high) / 2.0)
        } else {
            None
        }
    }

    fn shift(&mut self, from: f64, movement: Move) {
        match movement {
            Move::Raise => self.low = from,
            Move::Lower => self.high = from,
            Move::Stop => {}
        }
    }
}

/// Multiplicative stepping of a continuous value, re-clamped after every step.
#[derive(Debug, Clone, Copy)]
pub struct DampedWalk {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub shrink: f64,
    pub grow: f64,
}

impl Walk for DampedWalk {
    type Point = f64;

    fn next(&self) -> Option<f64> {
        Some(self.value)
    }

    fn shift(&mut self, _from: f64, movement: Move) {
        let stepped = match movement {
            Move::Raise => self.value * self.grow,
            Move::Lower => self.value * self.shrink,
            Move::Stop => self.value,
        };
        self.value = stepped.max(self.min).min(self.max);
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Settled,
    Collapsed,
    Exhausted,
}

/// The loop state while a run is in progress; handed back when it ends.
#[derive(Debug, Clone)]
pub struct SearchState<W> {
    pub walk: W,
    pub iterations: u32,
    pub last: Option<Verdict>,
    pub stop: Stop,
}

impl<W> SearchState<W> {
    pub fn exhausted(&self) -> bool {
        self.stop == Stop::Exhausted
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConstrainedSearch {
    pub acceptance: Acceptance,
    pub monotonicity: Monotonicity,
    pub max_iterations: u32,
}

impl ConstrainedSearch {
    /// Drives `walk` until settled, collapsed or capped.
    ///
    /// `probe` returns the observed size, `None` for an absorbed encoder
    /// failure (judged as over budget), or an error to abort the run.
    pub fn run<W, F>(&self, walk: W, mut probe: F) -> Result<SearchState<W>>
    where
        W: Walk,
        F: FnMut(W::Point) -> Result<Option<u64>>,
    {
        let mut state = SearchState {
            walk,
            iterations: 0,
            last: None,
            stop: Stop::Exhausted,
        };
        while state.iterations < self.max_iterations {
            let Some(point) = state.walk.next() else {
                state.stop = Stop::Collapsed;
                return Ok(state);
            };
            state.iterations += 1;
            let verdict = match probe(point)? {
                Some(size) => self.acceptance.judge(size),
                None => Verdict::Over,
            };
            state.last = Some(verdict);
            match self.monotonicity.movement(verdict) {
                Move::Stop => {
                    state.stop = Stop::Settled;
                    return Ok(state);
                }
                movement => state.walk.shift(point, movement),
            }
        }
        Ok(state)
    }
}

/// Flags probes whose sizes contradict the assumed monotonic response.
/// Searches keep going either way; the warning is the only effect.
#[derive(Debug, Clone)]
pub struct MonotonicityWatch {
    direction: Monotonicity,
    seen: Vec<(f64, u64)>,
    violations: u32,
}

impl MonotonicityWatch {
    pub fn new(direction: Monotonicity) -> Self {
        Self {
            direction,
            seen: Vec::new(),
            violations: 0,
        }
    }

    pub fn observe(&mut self, point: f64, size: u64, label: &str) {
        let contradicts = self.seen.iter().find(|&&(p, s)| match self.direction {
            Monotonicity::Increasing => (p < point && s > size) || (p > point && s < size),
            Monotonicity::Decreasing => (p < point && s < size) || (p > point && s > size),
        });
        if let Some(&(p, s)) = contradicts {
            self.violations += 1;
            warn!(
                "{}: size is not monotonic ({} -> {} bytes, {} -> {} bytes)",
                label, p, s, point, size
            );
        }
        self.seen.push((point, size));
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(point: i64) -> u64 {
        (point as u64) * 100
    }

    #[test]
    fn point_acceptance() {
        let a = Acceptance::at_most(1000, 50);
        assert_eq!(a.judge(1001), Verdict::Over);
        assert_eq!(a.judge(960), Verdict::Settled);
        assert_eq!(a.judge(900), Verdict::Under);
        assert_eq!(a.limit(), 1000);
    }

    #[test]
    fn band_acceptance() {
        let a = Acceptance::Band { min: 100, max: 200 };
        assert_eq!(a.judge(99), Verdict::Under);
        assert_eq!(a.judge(150), Verdict::Settled);
        assert_eq!(a.judge(201), Verdict::Over);
        assert_eq!(a.limit(), 200);
    }

    #[test]
    fn discrete_bisection_finds_boundary() {
        let search = ConstrainedSearch {
            acceptance: Acceptance::at_most(4_250, 0),
            monotonicity: Monotonicity::Increasing,
            max_iterations: 20,
        };
        let mut best = 0;
        let state = search
            .run(DiscreteWalk::new(1, 95), |q| {
                let size = linear(q);
                if size <= 4_250 {
                    best = best.max(q);
                }
                Ok(Some(size))
            })
            .unwrap();
        assert_eq!(best, 42);
        assert_eq!(state.stop, Stop::Collapsed);
        assert!(state.iterations <= 7);
    }

    #[test]
    fn settles_early_within_slack() {
        let search = ConstrainedSearch {
            acceptance: Acceptance::at_most(5_000, 200),
            monotonicity: Monotonicity::Increasing,
            max_iterations: 20,
        };
        let state = search
            .run(DiscreteWalk::new(1, 95), |q| Ok(Some(linear(q))))
            .unwrap();
        assert_eq!(state.stop, Stop::Settled);
        assert_eq!(state.last, Some(Verdict::Settled));
    }

    #[test]
    fn iteration_cap_is_respected() {
        let search = ConstrainedSearch {
            acceptance: Acceptance::Band { min: 10, max: 20 },
            monotonicity: Monotonicity::Increasing,
            max_iterations: 4,
        };
        let mut calls = 0;
        let walk = DampedWalk {
            value: 1000.0,
            min: 100.0,
            max: 4000.0,
            shrink: 0.9,
            grow: 1.1,
        };
        let state = search
            .run(walk, |_| {
                calls += 1;
                Ok(Some(1_000))
            })
            .unwrap();
        assert_eq!(calls, 4);
        assert!(state.exhausted());
        assert!((state.walk.value - 1000.0 * 0.9f64.powi(4)).abs() < 1e-6);
    }

    #[test]
    fn decreasing_knob_moves_the_other_way() {
        // size falls as the knob (think CRF) rises
        let search = ConstrainedSearch {
            acceptance: Acceptance::at_most(3_000, 0),
            monotonicity: Monotonicity::Decreasing,
            max_iterations: 20,
        };
        let mut fitting = Vec::new();
        search
            .run(DiscreteWalk::new(0, 51), |crf| {
                let size = ((51 - crf) as u64) * 100;
                if size <= 3_000 {
                    fitting.push(crf);
                }
                Ok(Some(size))
            })
            .unwrap();
        assert_eq!(fitting.iter().min(), Some(&21));
    }

    #[test]
    fn failures_are_judged_over_budget() {
        let search = ConstrainedSearch {
            acceptance: Acceptance::at_most(100, 0),
            monotonicity: Monotonicity::Increasing,
            max_iterations: 8,
        };
        let state = search
            .run(ContinuousWalk::new(0.0, 1.0, 0.05), |_| Ok(None))
            .unwrap();
        assert_eq!(state.walk.low, 0.0);
        assert!(state.walk.high <= 0.05);
        assert_eq!(state.stop, Stop::Collapsed);
    }

    #[test]
    fn watch_counts_violations() {
        let mut watch = MonotonicityWatch::new(Monotonicity::Increasing);
        watch.observe(10.0, 100, "test");
        watch.observe(20.0, 200, "test");
        assert_eq!(watch.violations(), 0);
        watch.observe(30.0, 150, "test");
        assert_eq!(watch.violations(), 1);
    }
}
