//! External-library backend: delegates the optimization loop to NLopt's
//! gradient-based MMA/CCSA algorithms.
//!
//! The adapter keeps the same constraint semantics as the OC backend: the
//! library minimizes the simulation objective subject to one inequality
//! constraint `volume(p) - target*referenceVolume <= 0`, with the design
//! bounds taken from the topology.  Convergence is decided by the crate's
//! own [`ConvergenceTest`]; once it reports convergence the callbacks set
//! a cooperative stop token and return NaN, which halts the library.  The
//! library's native tolerance is set far too tight to ever trigger.
//!
//! This backend runs on a single partition only.

use crate::convergence::{ConvergenceTest, Verdict};
use crate::optimizer::{compute_diff_norm, compute_norm, Optimizer, Report};
use crate::types::{
    Communicator, ConvergenceConfig, DriverError, ExternalConfig, Result, SolverInterface,
    Topology,
};
use log::info;
use nlopt::{Algorithm, FailState, Nlopt, SuccessState, Target};
use std::cell::RefCell;

/// Map a library status result onto the crate error type.
fn lib(result: std::result::Result<SuccessState, FailState>) -> Result<()> {
    result
        .map(|_| ())
        .map_err(|state| DriverError::Backend(format!("library setup failed with status {state:?}")))
}

/// State shared between the objective and constraint callbacks.
struct CallbackCtx<'a> {
    iface: &'a mut dyn SolverInterface,
    convergence: &'a mut ConvergenceTest,
    comm: &'a dyn Communicator,
    /// Design at the previous objective evaluation; delta reference.
    p_last: &'a mut [f64],
    /// Gradient buffer for evaluations the library requests without one.
    scratch: &'a mut [f64],
    f: f64,
    f_last: f64,
    iterations: usize,
    /// Cooperative stop token: set once the convergence test passes,
    /// checked at every callback entry.
    stopped: bool,
    verdict: Verdict,
    /// `target_fraction * reference_volume`.
    vol_target: f64,
}

pub struct NloptOptimizer {
    topology: Topology,
    comm: Box<dyn Communicator>,
    convergence: ConvergenceTest,
    interface: Option<Box<dyn SolverInterface>>,
    algorithm: Algorithm,
    vol_constraint: f64,
    constraint_tolerance: f64,

    num_opt_dofs: usize,
    p: Vec<f64>,
    reference_volume: f64,
}

impl NloptOptimizer {
    /// Validates the method name; anything but `"MMA"` or `"CCSA"` is a
    /// configuration error.
    pub fn new(
        config: &ExternalConfig,
        convergence: &ConvergenceConfig,
        topology: Topology,
        comm: Box<dyn Communicator>,
    ) -> Result<Self> {
        let algorithm = match config.method.as_str() {
            "MMA" => Algorithm::Mma,
            "CCSA" => Algorithm::Ccsaq,
            other => {
                return Err(DriverError::Config(format!(
                    "optimization method '{other}' unknown; valid options are 'MMA', 'CCSA'"
                )))
            }
        };
        Ok(Self {
            topology,
            comm,
            convergence: ConvergenceTest::new(convergence),
            interface: None,
            algorithm,
            vol_constraint: config.volume_fraction_constraint,
            constraint_tolerance: config.constraint_tolerance,
            num_opt_dofs: 0,
            p: Vec::new(),
            reference_volume: 0.0,
        })
    }
}

impl Optimizer for NloptOptimizer {
    fn set_interface(&mut self, interface: Box<dyn SolverInterface>) {
        self.interface = Some(interface);
    }

    fn initialize(&mut self) -> Result<()> {
        let iface = self.interface.as_mut().ok_or_else(|| {
            DriverError::Config("optimizer requires a bound solver interface".into())
        })?;

        if self.comm.num_procs() != 1 {
            return Err(DriverError::Config(
                "the external-library backend does not run distributed; use the OC package".into(),
            ));
        }

        let n = iface.num_opt_dofs();
        let reference_volume = iface.reference_volume();

        self.num_opt_dofs = n;
        self.p = vec![self.topology.initial_value; n];
        self.reference_volume = reference_volume;
        Ok(())
    }

    fn optimize(&mut self) -> Result<Report> {
        let mut iface = self.interface.take().ok_or_else(|| {
            DriverError::Config("optimizer requires a bound solver interface".into())
        })?;

        let n = self.num_opt_dofs;
        let mut scratch = vec![0.0; n];

        // Seed the convergence baselines from an initial evaluation.
        let first = iface.evaluate(&self.p, &mut scratch, None);
        let global_f = self.comm.sum_all(first.objective);
        let pnorm = compute_norm(self.comm.as_ref(), &self.p);
        self.convergence.init_norm(global_f, pnorm);

        let mut x = std::mem::take(&mut self.p);
        let mut p_last = x.clone();
        let (min_density, max_density) = self.topology.bounds();
        let max_iterations = self.convergence.max_iterations();

        let ctx = RefCell::new(CallbackCtx {
            iface: iface.as_mut(),
            convergence: &mut self.convergence,
            comm: self.comm.as_ref(),
            p_last: &mut p_last,
            scratch: &mut scratch,
            f: first.objective,
            f_last: first.objective,
            iterations: 0,
            stopped: false,
            verdict: Verdict::NotConverged,
            vol_target: self.vol_constraint * self.reference_volume,
        });

        let objective = |x: &[f64], gradient: Option<&mut [f64]>, _: &mut ()| -> f64 {
            let mut state = ctx.borrow_mut();
            if state.stopped {
                return f64::NAN;
            }
            let state = &mut *state;

            state.f_last = state.f;
            let result = match gradient {
                Some(grad) => state.iface.evaluate(x, grad, None),
                None => state.iface.evaluate(x, state.scratch, None),
            };
            state.f = result.objective;

            let rank = state.comm.rank();
            if rank == 0 {
                info!("optimizer: objective value is {:.6e}", state.f);
            }

            let delta_f = state.comm.sum_all(state.f - state.f_last);
            let delta_p = compute_diff_norm(state.comm, x, state.p_last);
            state.p_last.copy_from_slice(x);

            let verdict = state.convergence.is_converged(delta_f, delta_p, state.iterations, rank);
            state.iterations += 1;
            if verdict.converged() {
                state.stopped = true;
                state.verdict = verdict;
            }
            state.f
        };

        let constraint = |x: &[f64], gradient: Option<&mut [f64]>, _: &mut ()| -> f64 {
            let mut state = ctx.borrow_mut();
            if state.stopped {
                return f64::NAN;
            }
            let state = &mut *state;

            let vol = state.iface.volume(x, gradient);
            if state.comm.rank() == 0 {
                info!("optimizer: computed volume is {:.6e}", vol);
            }
            vol - state.vol_target
        };

        let mut opt = Nlopt::new(self.algorithm, n, objective, Target::Minimize, ());
        lib(opt.set_lower_bounds(&vec![min_density; n]))?;
        lib(opt.set_upper_bounds(&vec![max_density; n]))?;
        // The library must not converge on its own; the crate's checker
        // decides.
        lib(opt.set_xtol_rel(1e-9))?;
        lib(opt.set_maxeval(max_iterations as u32))?;
        lib(opt.add_inequality_constraint(
            constraint,
            (),
            self.constraint_tolerance * self.reference_volume,
        ))?;

        let outcome = opt.optimize(&mut x);
        drop(opt);

        let (stopped, verdict, iterations, f) = {
            let state = ctx.borrow();
            (state.stopped, state.verdict, state.iterations, state.f)
        };
        drop(ctx);

        self.p = x;
        self.interface = Some(iface);

        let write = self.comm.rank() == 0;
        if stopped {
            // The adapter's forced stop: the convergence test passed and
            // the callbacks halted the library.
            if write {
                info!("optimizer converged, objective value = {f:.6e}");
            }
            return Ok(Report { iterations, objective: f, verdict });
        }

        match outcome {
            Ok((state, minf)) => {
                if write {
                    info!("optimizer finished with status {state:?}, objective value = {minf:.6e}");
                }
                let verdict = match state {
                    SuccessState::MaxEvalReached => Verdict::IterationLimit,
                    _ => Verdict::CriteriaMet,
                };
                Ok(Report { iterations, objective: minf, verdict })
            }
            Err((FailState::ForcedStop, minf)) => {
                if write {
                    info!("optimizer force-stopped, objective value = {minf:.6e}");
                }
                Ok(Report { iterations, objective: minf, verdict: Verdict::CriteriaMet })
            }
            Err((state, _)) => Err(DriverError::Backend(format!(
                "optimization failed with status {state:?}"
            ))),
        }
    }

    fn design(&self) -> &[f64] {
        &self.p
    }
}
