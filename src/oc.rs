//! Optimality-criteria optimizer with volume-constraint enforcement.
//!
//! Each outer iteration evaluates objective and volume sensitivities, then
//! recomputes the constrained-optimal design: every entry is scaled by a
//! damped power of its sensitivity ratio, move-limited, and clamped, while
//! a scalar multiplier search (recursive bisection, optionally refined by
//! a secant iteration) picks the multiplier that makes the resulting
//! volume hit the target fraction of the reference volume.
//!
//! When the simulation reports a nonzero secondary-constraint residual,
//! the volume target itself is relaxed between outer iterations with a
//! secant step on an estimated `d(residual)/d(target)` slope.

use crate::convergence::ConvergenceTest;
use crate::optimizer::{compute_diff_norm, compute_norm, Optimizer, Report};
use crate::types::{
    Communicator, ConstraintGradient, ConvergenceConfig, DriverError, OcConfig, Result,
    SolverInterface, Topology,
};
use log::info;
use std::collections::VecDeque;

/// Number of empirical slope samples kept for the volume-target secant
/// update when no constraint gradients are available.
const SLOPE_WINDOW: usize = 10;

/// Probe step on the volume target, both for the finite-difference slope
/// estimate and as the fallback step when no slope is known yet.
const TARGET_PROBE: f64 = 1e-3;

pub struct OcOptimizer {
    config: OcConfig,
    topology: Topology,
    comm: Box<dyn Communicator>,
    convergence: ConvergenceTest,
    interface: Option<Box<dyn SolverInterface>>,

    num_opt_dofs: usize,
    /// Design vector; mutated in place every iteration.
    p: Vec<f64>,
    /// Snapshot of `p` at the start of the iteration; move-limit base.
    p_last: Vec<f64>,
    dfdp: Vec<f64>,
    dvdp: Vec<f64>,
    /// Secondary-constraint gradient, allocated only in adjoint mode.
    dgdp: Option<Vec<f64>>,

    f: f64,
    f_last: f64,
    g: f64,
    g_last: f64,

    /// Current volume target fraction, kept within the configured
    /// `[min_volume_fraction, max_volume_fraction]`.
    vol_constraint: f64,
    reference_volume: f64,
}

impl OcOptimizer {
    pub fn new(
        config: OcConfig,
        convergence: &ConvergenceConfig,
        topology: Topology,
        comm: Box<dyn Communicator>,
    ) -> Self {
        let vol_constraint = config.volume.target_volume_fraction;
        Self {
            config,
            topology,
            comm,
            convergence: ConvergenceTest::new(convergence),
            interface: None,
            num_opt_dofs: 0,
            p: Vec::new(),
            p_last: Vec::new(),
            dfdp: Vec::new(),
            dvdp: Vec::new(),
            dgdp: None,
            f: 0.0,
            f_last: 0.0,
            g: 0.0,
            g_last: 0.0,
            vol_constraint,
            reference_volume: 0.0,
        }
    }

    /// Current volume target fraction (adapted across outer iterations
    /// while the secondary constraint is active).
    pub fn volume_target(&self) -> f64 {
        self.vol_constraint
    }

    fn evaluate(&mut self, iface: &mut dyn SolverInterface) {
        let result = iface.evaluate(&self.p, &mut self.dfdp, self.dgdp.as_deref_mut());
        self.f = result.objective;
        self.g = result.residual;
    }

    /// One optimality-criteria sweep at multiplier `lambda`: for every
    /// entry, `p_new = (p_old - offset) * be^stab + offset` with
    /// `be = -dfdp/dvdp/lambda`, move-limited to `±move_limit` and clamped
    /// to the density bounds.  `p_old` is always read from `p_last`.
    fn update_design(&mut self, lambda: f64, offset: f64) {
        let (min_density, max_density) = self.topology.bounds();
        let move_limit = self.config.move_limit;
        let stab = self.config.stabilization;
        for i in 0..self.num_opt_dofs {
            let be = -self.dfdp[i] / self.dvdp[i] / lambda;
            let p_old = self.p_last[i];
            let mut p_new = (p_old - offset) * be.powf(stab) + offset;
            let dval = p_new - p_old;
            if dval.abs() > move_limit {
                p_new = p_old + dval.signum() * move_limit;
            }
            self.p[i] = p_new.clamp(min_density, max_density);
        }
    }

    /// Recompute the constrained-optimal design at the current volume
    /// target: bracket the multiplier by recursive bisection, optionally
    /// refine with a secant search, and fail if the final volume is
    /// outside the acceptable tolerance.
    fn enforce_volume(&mut self, iface: &mut dyn SolverInterface) -> Result<()> {
        let volume_cfg = self.config.volume.clone();
        let (min_density, max_density) = self.topology.bounds();
        let offset = min_density - 0.01 * (max_density - min_density);

        let mut dfdp_tot = 0.0;
        let mut dvdp_tot = 0.0;
        for i in 0..self.num_opt_dofs {
            dfdp_tot += self.dfdp[i];
            dvdp_tot += self.dvdp[i];
        }
        let g_dfdp_tot = self.comm.sum_all(dfdp_tot);
        let g_dvdp_tot = self.comm.sum_all(dvdp_tot);

        let mut v1 = 0.0;
        let mut v2 = -10.0 * g_dfdp_tot / g_dvdp_tot;

        let target = self.vol_constraint * self.reference_volume;
        let conv_tol = volume_cfg.convergence_tolerance * self.reference_volume;
        let use_newton = volume_cfg.use_newton_search;
        let write = self.comm.rank() == 0;

        if write {
            info!("volume enforcement: target = {}", self.vol_constraint);
            info!("volume enforcement: beginning search with recursive bisection");
        }

        let mut niters = 0usize;
        let mut resid_ratio = 0.0;
        let mut vol;

        // Bracketing phase.  With the secant refinement enabled the loop
        // breaks on the first positive residual, capturing the residual
        // ratio used to seed the refinement.
        loop {
            vol = 0.0;
            let vmid = 0.5 * (v1 + v2);
            self.update_design(vmid, offset);

            if use_newton {
                let prev_residual = vol - target;
                vol = iface.volume(&self.p, None);
                let new_residual = vol - target;
                if new_residual > 0.0 {
                    resid_ratio = new_residual / prev_residual;
                    v1 = vmid;
                    niters += 1;
                    break;
                } else {
                    v2 = vmid;
                }
            } else {
                vol = iface.volume(&self.p, None);
                if vol - target > 0.0 {
                    v1 = vmid;
                } else {
                    v2 = vmid;
                }
            }
            niters += 1;

            if write {
                info!(
                    "volume enforcement (iteration {niters}): residual = {:.6e}",
                    (vol - target) / self.reference_volume
                );
            }

            if niters >= volume_cfg.max_iterations || (vol - target).abs() <= conv_tol {
                break;
            }
        }

        if use_newton {
            if write {
                info!("volume enforcement: bounds found, switching to Newton search");
            }

            let newton_max_iters = niters + 10;
            let mut lambda = (resid_ratio * v2 - v1) / (resid_ratio - 1.0);
            let epsilon = lambda * 1e-5;
            let mut converged = false;

            if lambda > 0.0 {
                loop {
                    self.update_design(lambda, offset);
                    vol = iface.volume(&self.p, None);
                    let f0 = vol - target;

                    if write {
                        info!(
                            "volume enforcement (iteration {niters}): residual = {:.6e}",
                            f0 / self.reference_volume
                        );
                    }

                    if f0.abs() < conv_tol {
                        converged = true;
                        break;
                    }

                    self.update_design(lambda + epsilon, offset);
                    vol = iface.volume(&self.p, None);
                    let f1 = vol - target;

                    if f1 - f0 == 0.0 {
                        break;
                    }
                    lambda -= epsilon * f0 / (f1 - f0);

                    niters += 1;
                    if niters >= newton_max_iters {
                        break;
                    }
                }
            }

            if !converged {
                // The secant estimate is discarded on purpose; the search
                // restarts from the bracket it had when it switched.
                if write {
                    info!("volume enforcement: Newton search failed, switching back to recursive bisection");
                }
                niters = 0;
                loop {
                    let vmid = 0.5 * (v1 + v2);
                    self.update_design(vmid, offset);
                    vol = iface.volume(&self.p, None);
                    if vol - target > 0.0 {
                        v1 = vmid;
                    } else {
                        v2 = vmid;
                    }
                    niters += 1;

                    if write {
                        info!(
                            "volume enforcement (iteration {niters}): residual = {:.6e}",
                            (vol - target) / self.reference_volume
                        );
                    }

                    if niters >= volume_cfg.max_iterations || (vol - target).abs() <= conv_tol {
                        break;
                    }
                }
            }
        }

        if (vol - target).abs() > volume_cfg.acceptable_tolerance() * self.reference_volume {
            return Err(DriverError::Config(
                "enforcement of volume constraint failed: exceeded max iterations".into(),
            ));
        }
        Ok(())
    }

    /// Secant-style relaxation of the volume target while the secondary
    /// constraint residual is nonzero.
    ///
    /// With adjoint gradients the slope is estimated by a finite
    /// difference over a small probe of the target; otherwise a bounded
    /// history of empirical `Δg/Δtarget` ratios is averaged, falling back
    /// to a fixed probe step when the target has not moved since the
    /// previous iteration.  The step is clamped to ±10% of the current
    /// target, and the target itself to its configured fraction bounds.
    fn adapt_volume_target(
        &mut self,
        iface: &mut dyn SolverInterface,
        vol_constraint_last: &mut f64,
        slope_history: &mut VecDeque<f64>,
    ) -> Result<()> {
        let mut deltav = match self.config.constraint_gradient {
            ConstraintGradient::Adjoint => {
                let dv = TARGET_PROBE;
                self.vol_constraint += dv;
                self.enforce_volume(iface)?;
                self.vol_constraint -= dv;

                let mut dg = 0.0;
                if let Some(dgdp) = &self.dgdp {
                    for i in 0..self.num_opt_dofs {
                        dg += dgdp[i] * (self.p[i] - self.p_last[i]);
                    }
                }
                let dgdv = self.comm.sum_all(dg) / dv;
                -self.g / dgdv
            }
            ConstraintGradient::None => {
                if self.vol_constraint != *vol_constraint_last {
                    slope_history
                        .push_back((self.g - self.g_last) / (self.vol_constraint - *vol_constraint_last));
                    if slope_history.len() > SLOPE_WINDOW {
                        slope_history.pop_front();
                    }
                    let dgdv = slope_history.iter().sum::<f64>() / slope_history.len() as f64;
                    -self.g / dgdv
                } else {
                    TARGET_PROBE
                }
            }
        };

        let step_limit = 0.1 * self.vol_constraint;
        if deltav.abs() > step_limit {
            deltav = deltav.signum() * step_limit;
        }

        *vol_constraint_last = self.vol_constraint;
        let mut target = self.vol_constraint + deltav;
        if target < self.config.volume.min_volume_fraction {
            target = self.config.volume.min_volume_fraction;
        }
        if target > self.config.volume.max_volume_fraction {
            target = self.config.volume.max_volume_fraction;
        }
        self.vol_constraint = target;
        Ok(())
    }

    fn run(&mut self, iface: &mut dyn SolverInterface) -> Result<Report> {
        // Initial evaluation and enforcement seed the convergence
        // baselines before the loop proper.
        self.evaluate(iface);
        self.p_last.copy_from_slice(&self.p);
        iface.volume(&self.p, Some(&mut self.dvdp));
        self.enforce_volume(iface)?;

        let global_f = self.comm.sum_all(self.f);
        let pnorm = compute_norm(self.comm.as_ref(), &self.p);
        self.convergence.init_norm(global_f, pnorm);

        let mut iter = 0usize;
        let mut vol_constraint_last = self.vol_constraint;
        let mut slope_history: VecDeque<f64> = VecDeque::new();

        let verdict = loop {
            self.f_last = self.f;
            self.g_last = self.g;
            self.evaluate(iface);
            iface.volume(&self.p, Some(&mut self.dvdp));
            self.p_last.copy_from_slice(&self.p);

            // A nonzero secondary-constraint residual means the volume
            // budget itself has to move.
            if self.g != 0.0 {
                self.adapt_volume_target(iface, &mut vol_constraint_last, &mut slope_history)?;
            }

            self.enforce_volume(iface)?;

            if self.comm.rank() == 0 {
                info!("── optimization status ──");
                info!("objective = {:.6e}", self.f);
            }

            let delta_f = self.comm.sum_all(self.f - self.f_last);
            let delta_p = compute_diff_norm(self.comm.as_ref(), &self.p, &self.p_last);

            let verdict = self.convergence.is_converged(delta_f, delta_p, iter, self.comm.rank());
            iter += 1;
            if verdict.converged() {
                break verdict;
            }
        };

        Ok(Report { iterations: iter, objective: self.f, verdict })
    }
}

impl Optimizer for OcOptimizer {
    fn set_interface(&mut self, interface: Box<dyn SolverInterface>) {
        self.interface = Some(interface);
    }

    fn initialize(&mut self) -> Result<()> {
        let iface = self.interface.as_mut().ok_or_else(|| {
            DriverError::Config("optimizer requires a bound solver interface".into())
        })?;

        let n = iface.num_opt_dofs();
        let p = vec![self.topology.initial_value; n];
        let reference_volume = iface.reference_volume();
        iface.initialize_topology(&p);

        self.num_opt_dofs = n;
        self.p = p;
        self.p_last = vec![0.0; n];
        self.dfdp = vec![0.0; n];
        self.dvdp = vec![0.0; n];
        self.dgdp = match self.config.constraint_gradient {
            ConstraintGradient::None => None,
            ConstraintGradient::Adjoint => Some(vec![0.0; n]),
        };
        self.reference_volume = reference_volume;
        Ok(())
    }

    fn optimize(&mut self) -> Result<Report> {
        let mut iface = self.interface.take().ok_or_else(|| {
            DriverError::Config("optimizer requires a bound solver interface".into())
        })?;
        let result = self.run(iface.as_mut());
        self.interface = Some(iface);
        result
    }

    fn design(&self) -> &[f64] {
        &self.p
    }
}

// ─────────────────────────────────────────────────────────────
//  Unit tests (update-rule clamps)
// ─────────────────────────────────────────────────────────────
