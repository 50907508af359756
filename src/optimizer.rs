//! Optimizer contract and backend factory.
//!
//! Both backends (the optimality-criteria update in [`crate::oc`] and the
//! external-library adapter in [`crate::external`]) implement the same
//! polymorphic contract: bind the simulation interface, `initialize`,
//! `optimize`.  The factory constructs one of them from the configured
//! package name; an unknown name is a construction-time error, never a
//! silent default.

use crate::external::NloptOptimizer;
use crate::oc::OcOptimizer;
use crate::types::{Communicator, DriverConfig, DriverError, Result, SolverInterface, Topology};
use env_logger::{Builder, Env};

/// Environment variable controlling the log filter, e.g.
/// `TOPOGRAD_LOG=debug`.
pub const TOPOGRAD_LOG: &str = "TOPOGRAD_LOG";

// ─────────────────────────────────────────────────────────────
//  Contract
// ─────────────────────────────────────────────────────────────

/// Final diagnostics of an optimization run.
#[derive(Debug, Clone)]
pub struct Report {
    /// Outer iterations executed.
    pub iterations: usize,
    /// Objective value at the final design.
    pub objective: f64,
    /// How the run terminated.
    pub verdict: crate::convergence::Verdict,
}

/// Polymorphic optimizer contract.
///
/// Lifecycle: construct (factory), [`set_interface`](Self::set_interface),
/// [`initialize`](Self::initialize), [`optimize`](Self::optimize).  The
/// optimizer owns the design vector; after `optimize` it holds the final
/// (optimized) field, readable through [`design`](Self::design).
pub trait Optimizer {
    /// Bind the simulation that evaluates objectives and volumes.
    fn set_interface(&mut self, interface: Box<dyn SolverInterface>);

    /// Allocate design and sensitivity storage sized to the interface's
    /// DOF count and fill the design vector with the topology's initial
    /// value.  Fails when no interface is bound.
    fn initialize(&mut self) -> Result<()>;

    /// Run the iterative loop to convergence or iteration exhaustion.
    fn optimize(&mut self) -> Result<Report>;

    /// The current (after `optimize`: final) design vector.
    fn design(&self) -> &[f64];
}

// ─────────────────────────────────────────────────────────────
//  Global norms
// ─────────────────────────────────────────────────────────────

/// Global Euclidean norm of `v`: local sum of squares, one blocking
/// sum-reduction, square root.  A non-positive reduced sum (reduction
/// round-off) yields 0.  Collective: every partition must call.
pub fn compute_norm(comm: &dyn Communicator, v: &[f64]) -> f64 {
    let local: f64 = v.iter().map(|x| x * x).sum();
    let global = comm.sum_all(local);
    if global > 0.0 {
        global.sqrt()
    } else {
        0.0
    }
}

/// Global Euclidean norm of the elementwise difference `a - b`, with the
/// same reduction discipline as [`compute_norm`].
pub fn compute_diff_norm(comm: &dyn Communicator, a: &[f64], b: &[f64]) -> f64 {
    let local: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    let global = comm.sum_all(local);
    if global > 0.0 {
        global.sqrt()
    } else {
        0.0
    }
}

// ─────────────────────────────────────────────────────────────
//  Factory
// ─────────────────────────────────────────────────────────────

/// Construct the optimizer backend selected by `config.package`.
///
/// Valid packages are `"OC"` (optimality criteria) and `"NLopt"` (the
/// external-library adapter); anything else fails.  Also initializes the
/// logging backend from the [`TOPOGRAD_LOG`] environment variable.
pub fn create(
    config: &DriverConfig,
    topology: Topology,
    comm: Box<dyn Communicator>,
) -> Result<Box<dyn Optimizer>> {
    let env = Env::new().filter_or(TOPOGRAD_LOG, "info");
    Builder::from_env(env).try_init().ok();

    match config.package.as_str() {
        "OC" => {
            let oc = config.oc.as_ref().ok_or_else(|| {
                DriverError::Config("missing 'oc' parameter block for package OC".into())
            })?;
            Ok(Box::new(OcOptimizer::new(oc.clone(), &config.convergence, topology, comm)))
        }
        "NLopt" => {
            let external = config.external.as_ref().ok_or_else(|| {
                DriverError::Config("missing 'external' parameter block for package NLopt".into())
            })?;
            Ok(Box::new(NloptOptimizer::new(
                external,
                &config.convergence,
                topology,
                comm,
            )?))
        }
        other => Err(DriverError::Config(format!(
            "optimization package '{other}' unknown; valid options are 'OC' (optimality \
             criteria), 'NLopt' (external library)"
        ))),
    }
}
