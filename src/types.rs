use serde::{Deserialize, Serialize};
use std::fmt;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every failure is fatal: there is no retry path for configuration
/// mistakes or for constraint enforcement that exhausts its iteration
/// budget.  Functions in the public API return `Result<T>` instead of
/// panicking.
#[derive(Debug)]
pub enum DriverError {
    /// Invalid configuration or invalid state: unknown package or method
    /// name, missing parameter block, unbound solver interface, volume
    /// enforcement that could not meet its acceptable tolerance.
    Config(String),
    /// The external optimization library reported a failure.
    Backend(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Backend(msg) => write!(f, "backend error: {msg}"),
        }
    }
}

impl std::error::Error for DriverError {}

pub type Result<T> = std::result::Result<T, DriverError>;

// ─────────────────────────────────────────────────────────────
//  Topology handle  (consumed slice of the external topology object)
// ─────────────────────────────────────────────────────────────

/// Design-variable bounds and initial value, as published by the topology
/// object of the surrounding application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Topology {
    pub min_density: f64,
    pub max_density: f64,
    pub initial_value: f64,
}

impl Topology {
    pub fn new(min_density: f64, max_density: f64, initial_value: f64) -> Self {
        Self { min_density, max_density, initial_value }
    }

    /// Elementwise bounds `(min, max)` for every design entry.
    pub fn bounds(&self) -> (f64, f64) {
        (self.min_density, self.max_density)
    }
}

// ─────────────────────────────────────────────────────────────
//  Simulation contract  (objective / volume evaluation)
// ─────────────────────────────────────────────────────────────

/// Result of one objective evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Evaluated {
    /// Objective value on the local partition.
    pub objective: f64,
    /// Secondary equality-constraint residual; 0.0 when the simulation
    /// defines none.
    pub residual: f64,
}

/// Evaluation contract implemented by the physical simulation.
///
/// All vectors are sized to [`num_opt_dofs`](Self::num_opt_dofs), the
/// number of optimization degrees of freedom on the local partition.
/// Gradient slices are filled in place; `dgdp` is requested only when the
/// driver is configured for adjoint constraint gradients.
pub trait SolverInterface {
    fn num_opt_dofs(&self) -> usize;

    /// Push the initial design field into the simulation.
    fn initialize_topology(&mut self, p: &[f64]);

    /// Volume of the reference (fully solid) design.
    fn reference_volume(&mut self) -> f64;

    /// Volume of the design `p`; fills the volume gradient when requested.
    fn volume(&mut self, p: &[f64], dvdp: Option<&mut [f64]>) -> f64;

    /// Objective (and secondary-constraint residual) at `p`, filling the
    /// objective gradient and, when requested, the constraint gradient.
    fn evaluate(&mut self, p: &[f64], dfdp: &mut [f64], dgdp: Option<&mut [f64]>) -> Evaluated;
}

// ─────────────────────────────────────────────────────────────
//  Communicator  (cross-partition reductions)
// ─────────────────────────────────────────────────────────────

/// Parallel communicator seam.  The only collective the driver needs is a
/// blocking scalar sum-reduction; every partition must reach each
/// reduction call collectively.
pub trait Communicator {
    /// Global sum of `local` across all partitions (blocking collective).
    fn sum_all(&self, local: f64) -> f64;
    fn rank(&self) -> usize;
    fn num_procs(&self) -> usize;
}

/// Single-partition communicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn sum_all(&self, local: f64) -> f64 {
        local
    }
    fn rank(&self) -> usize {
        0
    }
    fn num_procs(&self) -> usize {
        1
    }
}

// ─────────────────────────────────────────────────────────────
//  Configuration schema
// ─────────────────────────────────────────────────────────────

/// How the combined convergence verdict is formed from the individual
/// criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComboType {
    /// Every active criterion must pass.
    #[serde(alias = "and", alias = "AND")]
    And,
    /// Any single passing criterion suffices.
    #[serde(alias = "or", alias = "OR")]
    Or,
}

impl Default for ComboType {
    fn default() -> Self {
        Self::Or
    }
}

/// Convergence-test configuration.  Each criterion threshold is optional;
/// absent criteria are simply not instantiated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// No convergence is reported before this many iterations.
    #[serde(default)]
    pub minimum_iterations: usize,
    /// Convergence is forced (with an iteration-limit verdict) at this
    /// many iterations.
    pub maximum_iterations: usize,
    #[serde(default)]
    pub combo_type: ComboType,
    #[serde(default)]
    pub relative_design_change: Option<f64>,
    #[serde(default)]
    pub absolute_design_change: Option<f64>,
    #[serde(default)]
    pub relative_objective_change: Option<f64>,
    #[serde(default)]
    pub absolute_objective_change: Option<f64>,
    #[serde(default)]
    pub relative_objective_running_average: Option<f64>,
    #[serde(default)]
    pub absolute_objective_running_average: Option<f64>,
}

/// Secondary-constraint gradient mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintGradient {
    /// No secondary-constraint gradients; the volume-target adaptation
    /// falls back to an empirical slope history.
    None,
    /// The simulation supplies adjoint constraint gradients.
    Adjoint,
}

impl Default for ConstraintGradient {
    fn default() -> Self {
        Self::None
    }
}

/// Volume-constraint enforcement settings for the OC backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeEnforcement {
    /// Multiplier search stops once `|vol - target*ref| < tol*ref`.
    pub convergence_tolerance: f64,
    /// Constraint value as a fraction of the reference volume.
    pub target_volume_fraction: f64,
    /// Iteration budget for the multiplier search.
    pub max_iterations: usize,
    /// Lower clamp for the adapted target fraction.
    #[serde(default = "default_min_volume")]
    pub min_volume_fraction: f64,
    /// Upper clamp for the adapted target fraction.
    #[serde(default = "default_max_volume")]
    pub max_volume_fraction: f64,
    /// Widest residual accepted after the search; exceeding it is fatal.
    /// Defaults to the convergence tolerance.
    #[serde(default)]
    pub acceptable_tolerance: Option<f64>,
    /// Refine the bisection bracket with a secant search.
    #[serde(default = "default_true")]
    pub use_newton_search: bool,
}

impl VolumeEnforcement {
    pub fn acceptable_tolerance(&self) -> f64 {
        self.acceptable_tolerance.unwrap_or(self.convergence_tolerance)
    }
}

fn default_min_volume() -> f64 {
    0.1
}

fn default_max_volume() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// Optimality-criteria backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcConfig {
    /// Maximum per-iteration change of any single design entry.
    pub move_limit: f64,
    /// Exponent applied to the sensitivity ratio in the update rule.
    pub stabilization: f64,
    pub volume: VolumeEnforcement,
    #[serde(default)]
    pub constraint_gradient: ConstraintGradient,
}

/// External-library backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConfig {
    /// Algorithm name: `"MMA"` or `"CCSA"`.
    pub method: String,
    /// Volume constraint as a fraction of the reference volume.
    pub volume_fraction_constraint: f64,
    /// Inequality-constraint tolerance handed to the library, scaled by
    /// the reference volume.
    #[serde(default = "default_constraint_tolerance")]
    pub constraint_tolerance: f64,
}

fn default_constraint_tolerance() -> f64 {
    1e-4
}

/// Top-level driver configuration.  `package` selects the backend; the
/// matching backend block must be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub package: String,
    pub convergence: ConvergenceConfig,
    #[serde(default)]
    pub oc: Option<OcConfig>,
    #[serde(default)]
    pub external: Option<ExternalConfig>,
}
