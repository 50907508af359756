//! Composable convergence tests for the optimization loop.
//!
//! A [`ConvergenceTest`] owns an ordered set of criteria built from the
//! configuration (absent thresholds are simply not instantiated) and
//! combines their verdicts with AND/OR.  Minimum/maximum iteration guards
//! wrap the combined verdict: nothing converges before the minimum, and
//! the maximum always converges — with a distinct iteration-limit verdict
//! so reporting can tell the two outcomes apart.

use crate::types::{ComboType, ConvergenceConfig};
use log::info;
use std::collections::VecDeque;

/// Number of recent objective deltas a running-average criterion keeps.
const RUNNING_WINDOW: usize = 10;

// ─────────────────────────────────────────────────────────────
//  Verdict
// ─────────────────────────────────────────────────────────────

/// Outcome of one convergence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NotConverged,
    /// The configured criteria passed.
    CriteriaMet,
    /// The iteration budget ran out before the criteria passed.
    IterationLimit,
}

impl Verdict {
    pub fn converged(self) -> bool {
        !matches!(self, Verdict::NotConverged)
    }
}

// ─────────────────────────────────────────────────────────────
//  Individual criteria
// ─────────────────────────────────────────────────────────────

trait Criterion {
    /// Seed the baseline norms.  Called once per run, before the first
    /// check.
    fn init_norm(&mut self, _f0: f64, _p0: f64) {}

    /// Whether the criterion passes for the given global deltas.
    fn passed(&mut self, delta_f: f64, delta_p: f64, write: bool) -> bool;
}

struct AbsDesignChange {
    tol: f64,
}

impl Criterion for AbsDesignChange {
    fn passed(&mut self, _delta_f: f64, delta_p: f64, write: bool) -> bool {
        let status = delta_p.abs() < self.tol;
        if write {
            info!(
                "test: design change (absolute): |dp| = {:.6e} < {:e}: {status}",
                delta_p.abs(),
                self.tol
            );
        }
        status
    }
}

struct RelDesignChange {
    tol: f64,
    p0: f64,
}

impl Criterion for RelDesignChange {
    fn init_norm(&mut self, _f0: f64, p0: f64) {
        self.p0 = p0;
    }

    fn passed(&mut self, _delta_f: f64, delta_p: f64, write: bool) -> bool {
        // A zero baseline never passes; the ratio would be meaningless.
        let status = self.p0 != 0.0 && (delta_p / self.p0).abs() < self.tol;
        if write {
            info!(
                "test: design change (relative): |dp| = {:.6e}, |dp/p0| = {:.6e} < {:e}: {status}",
                delta_p.abs(),
                if self.p0 != 0.0 { (delta_p / self.p0).abs() } else { f64::INFINITY },
                self.tol
            );
        }
        status
    }
}

struct AbsObjectiveChange {
    tol: f64,
}

impl Criterion for AbsObjectiveChange {
    fn passed(&mut self, delta_f: f64, _delta_p: f64, write: bool) -> bool {
        let status = delta_f.abs() < self.tol;
        if write {
            info!(
                "test: objective change (absolute): |df| = {:.6e} < {:e}: {status}",
                delta_f.abs(),
                self.tol
            );
        }
        status
    }
}

struct RelObjectiveChange {
    tol: f64,
    f0: f64,
}

impl Criterion for RelObjectiveChange {
    fn init_norm(&mut self, f0: f64, _p0: f64) {
        self.f0 = f0;
    }

    fn passed(&mut self, delta_f: f64, _delta_p: f64, write: bool) -> bool {
        let status = self.f0 != 0.0 && (delta_f / self.f0).abs() < self.tol;
        if write {
            info!(
                "test: objective change (relative): |df| = {:.6e}, |df/f0| = {:.6e} < {:e}: {status}",
                delta_f.abs(),
                if self.f0 != 0.0 { (delta_f / self.f0).abs() } else { f64::INFINITY },
                self.tol
            );
        }
        status
    }
}

/// Bounded history of recent objective deltas.  The oldest sample is
/// evicted once the window is full, so the mean tracks the last
/// [`RUNNING_WINDOW`] iterations only.
struct RunningWindow {
    samples: VecDeque<f64>,
}

impl RunningWindow {
    fn new() -> Self {
        Self { samples: VecDeque::with_capacity(RUNNING_WINDOW) }
    }

    /// Push a sample and return the current window mean.
    fn push(&mut self, sample: f64) -> f64 {
        if self.samples.len() == RUNNING_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

struct AbsRunningObjectiveChange {
    tol: f64,
    history: RunningWindow,
}

impl Criterion for AbsRunningObjectiveChange {
    fn passed(&mut self, delta_f: f64, _delta_p: f64, write: bool) -> bool {
        let mean = self.history.push(delta_f);
        let status = mean.abs() < self.tol;
        if write {
            info!(
                "test: objective change running average (absolute): |<df>| = {:.6e} < {:e}: {status}",
                mean.abs(),
                self.tol
            );
        }
        status
    }
}

struct RelRunningObjectiveChange {
    tol: f64,
    f0: f64,
    history: RunningWindow,
}

impl Criterion for RelRunningObjectiveChange {
    fn init_norm(&mut self, f0: f64, _p0: f64) {
        self.f0 = f0;
    }

    fn passed(&mut self, delta_f: f64, _delta_p: f64, write: bool) -> bool {
        let mean = self.history.push(delta_f);
        let status = self.f0 != 0.0 && (mean / self.f0).abs() < self.tol;
        if write {
            info!(
                "test: objective change running average (relative): |<df>| = {:.6e}, |<df/f0>| = {:.6e} < {:e}: {status}",
                mean.abs(),
                if self.f0 != 0.0 { (mean / self.f0).abs() } else { f64::INFINITY },
                self.tol
            );
        }
        status
    }
}

// ─────────────────────────────────────────────────────────────
//  Combined test
// ─────────────────────────────────────────────────────────────

/// Combined convergence test with min/max iteration guards.
pub struct ConvergenceTest {
    criteria: Vec<Box<dyn Criterion>>,
    combo: ComboType,
    min_iterations: usize,
    max_iterations: usize,
}

impl ConvergenceTest {
    /// Instantiate the configured criteria, in a fixed evaluation order.
    pub fn new(config: &ConvergenceConfig) -> Self {
        let mut criteria: Vec<Box<dyn Criterion>> = Vec::new();
        if let Some(tol) = config.relative_design_change {
            criteria.push(Box::new(RelDesignChange { tol, p0: 0.0 }));
        }
        if let Some(tol) = config.absolute_design_change {
            criteria.push(Box::new(AbsDesignChange { tol }));
        }
        if let Some(tol) = config.relative_objective_change {
            criteria.push(Box::new(RelObjectiveChange { tol, f0: 0.0 }));
        }
        if let Some(tol) = config.absolute_objective_change {
            criteria.push(Box::new(AbsObjectiveChange { tol }));
        }
        if let Some(tol) = config.relative_objective_running_average {
            criteria.push(Box::new(RelRunningObjectiveChange {
                tol,
                f0: 0.0,
                history: RunningWindow::new(),
            }));
        }
        if let Some(tol) = config.absolute_objective_running_average {
            criteria.push(Box::new(AbsRunningObjectiveChange {
                tol,
                history: RunningWindow::new(),
            }));
        }
        Self {
            criteria,
            combo: config.combo_type,
            min_iterations: config.minimum_iterations,
            max_iterations: config.maximum_iterations,
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Seed the relative-criterion baselines.  Must be called exactly once
    /// per optimization run, before the first [`is_converged`] call.
    ///
    /// [`is_converged`]: Self::is_converged
    pub fn init_norm(&mut self, f0: f64, p0: f64) {
        for criterion in &mut self.criteria {
            criterion.init_norm(f0, p0);
        }
    }

    /// Evaluate all active criteria against the global objective delta and
    /// design-change norm for iteration `iter`.
    ///
    /// Iteration 0 never converges (there are no meaningful deltas yet).
    /// Verdict lines are logged on rank 0 only.
    pub fn is_converged(&mut self, delta_f: f64, delta_p: f64, iter: usize, rank: usize) -> Verdict {
        if iter == 0 {
            return Verdict::NotConverged;
        }

        let write = rank == 0;
        if write {
            info!("── optimization convergence check ──");
        }

        let results: Vec<bool> = self
            .criteria
            .iter_mut()
            .map(|criterion| criterion.passed(delta_f, delta_p, write))
            .collect();

        let mut converged = match self.combo {
            ComboType::And => results.iter().all(|&passed| passed),
            ComboType::Or => results.iter().any(|&passed| passed),
        };

        if write {
            if converged {
                if iter < self.min_iterations {
                    info!("converged, but continuing because min iterations not reached");
                } else {
                    info!("converged");
                }
            } else {
                info!("not converged");
            }
        }

        if iter < self.min_iterations {
            converged = false;
        }

        if iter >= self.max_iterations && !converged {
            if write {
                info!("not converged; exiting due to iteration limit");
            }
            return Verdict::IterationLimit;
        }

        if converged {
            Verdict::CriteriaMet
        } else {
            Verdict::NotConverged
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Unit tests (window arithmetic)
// ─────────────────────────────────────────────────────────────
