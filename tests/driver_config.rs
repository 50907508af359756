//! Factory and configuration-surface tests: package/method validation,
//! the external backend's single-partition precondition, and the serde
//! schema defaults.

use std::cell::Cell;
use std::rc::Rc;

use topograd::optimizer;
use topograd::types::{
    ComboType, Communicator, ConvergenceConfig, DriverConfig, Evaluated, ExternalConfig,
    SerialComm, SolverInterface, Topology,
};

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn convergence_config() -> ConvergenceConfig {
    ConvergenceConfig {
        minimum_iterations: 0,
        maximum_iterations: 50,
        combo_type: Default::default(),
        relative_design_change: None,
        absolute_design_change: None,
        relative_objective_change: None,
        absolute_objective_change: Some(1e-3),
        relative_objective_running_average: None,
        absolute_objective_running_average: None,
    }
}

fn topology() -> Topology {
    Topology::new(0.01, 1.0, 0.5)
}

/// Simulation stub that counts every call, so tests can assert that a
/// failed precondition never touched the simulation.
struct CountingSolver {
    calls: Rc<Cell<usize>>,
}

impl SolverInterface for CountingSolver {
    fn num_opt_dofs(&self) -> usize {
        self.calls.set(self.calls.get() + 1);
        4
    }
    fn initialize_topology(&mut self, _p: &[f64]) {
        self.calls.set(self.calls.get() + 1);
    }
    fn reference_volume(&mut self) -> f64 {
        self.calls.set(self.calls.get() + 1);
        4.0
    }
    fn volume(&mut self, p: &[f64], _dvdp: Option<&mut [f64]>) -> f64 {
        self.calls.set(self.calls.get() + 1);
        p.iter().sum()
    }
    fn evaluate(&mut self, _p: &[f64], dfdp: &mut [f64], _dgdp: Option<&mut [f64]>) -> Evaluated {
        self.calls.set(self.calls.get() + 1);
        dfdp.fill(-1.0);
        Evaluated { objective: 1.0, residual: 0.0 }
    }
}

/// Communicator standing in for a two-partition run.
struct TwoPartitionComm;

impl Communicator for TwoPartitionComm {
    fn sum_all(&self, local: f64) -> f64 {
        local
    }
    fn rank(&self) -> usize {
        0
    }
    fn num_procs(&self) -> usize {
        2
    }
}

// ─────────────────────────────────────────────────────────────
//  Factory validation
// ─────────────────────────────────────────────────────────────

/// An unknown package fails at construction, before any optimization
/// step could run.
#[test]
fn unknown_package_is_a_configuration_error() {
    let config = DriverConfig {
        package: "Unknown".into(),
        convergence: convergence_config(),
        oc: None,
        external: None,
    };
    let err = optimizer::create(&config, topology(), Box::new(SerialComm))
        .err()
        .expect("factory must reject an unknown package");
    let msg = err.to_string();
    assert!(msg.contains("Unknown"), "message should name the bad package: {msg}");
    assert!(msg.contains("OC") && msg.contains("NLopt"), "message should list the options: {msg}");
}

/// Selecting OC without its parameter block is fatal.
#[test]
fn missing_oc_block_is_a_configuration_error() {
    let config = DriverConfig {
        package: "OC".into(),
        convergence: convergence_config(),
        oc: None,
        external: None,
    };
    let err = optimizer::create(&config, topology(), Box::new(SerialComm))
        .err()
        .expect("factory must reject OC without its block");
    assert!(err.to_string().contains("oc"), "unexpected error: {err}");
}

/// The external backend rejects unknown method names at construction.
#[test]
fn unknown_method_is_a_configuration_error() {
    let config = DriverConfig {
        package: "NLopt".into(),
        convergence: convergence_config(),
        oc: None,
        external: Some(ExternalConfig {
            method: "SLSQP".into(),
            volume_fraction_constraint: 0.4,
            constraint_tolerance: 1e-4,
        }),
    };
    let err = optimizer::create(&config, topology(), Box::new(SerialComm))
        .err()
        .expect("factory must reject an unknown method");
    let msg = err.to_string();
    assert!(msg.contains("SLSQP") && msg.contains("MMA"), "unexpected error: {msg}");
}

/// The external backend is single-partition only; the precondition fires
/// in `initialize`, before the simulation is ever queried.
#[test]
fn external_backend_rejects_distributed_runs() {
    let config = DriverConfig {
        package: "NLopt".into(),
        convergence: convergence_config(),
        oc: None,
        external: Some(ExternalConfig {
            method: "MMA".into(),
            volume_fraction_constraint: 0.4,
            constraint_tolerance: 1e-4,
        }),
    };
    let mut opt =
        optimizer::create(&config, topology(), Box::new(TwoPartitionComm)).unwrap();

    let calls = Rc::new(Cell::new(0));
    opt.set_interface(Box::new(CountingSolver { calls: calls.clone() }));

    let err = opt.initialize().unwrap_err();
    assert!(err.to_string().contains("distributed"), "unexpected error: {err}");
    assert_eq!(calls.get(), 0, "the simulation must not have been touched");
}

// ─────────────────────────────────────────────────────────────
//  Serde schema
// ─────────────────────────────────────────────────────────────

/// Omitted optional fields come back as the documented defaults.
#[test]
fn config_defaults_apply_on_deserialization() {
    let json = r#"{
        "package": "OC",
        "convergence": { "maximum_iterations": 100 },
        "oc": {
            "move_limit": 0.2,
            "stabilization": 0.5,
            "volume": {
                "convergence_tolerance": 1e-5,
                "target_volume_fraction": 0.4,
                "max_iterations": 60
            }
        }
    }"#;
    let config: DriverConfig = serde_json::from_str(json).unwrap();

    assert_eq!(config.convergence.minimum_iterations, 0);
    assert_eq!(config.convergence.combo_type, ComboType::Or);

    let oc = config.oc.as_ref().expect("oc block present");
    assert_eq!(oc.volume.min_volume_fraction, 0.1);
    assert_eq!(oc.volume.max_volume_fraction, 1.0);
    assert!(oc.volume.use_newton_search);
    assert_eq!(oc.volume.acceptable_tolerance(), 1e-5);
    assert_eq!(oc.constraint_gradient, Default::default());

    // The assembled config drives the factory directly.
    let opt = optimizer::create(&config, topology(), Box::new(SerialComm));
    assert!(opt.is_ok());
}

/// Combo type accepts the lower-case spellings.
#[test]
fn combo_type_accepts_case_variants() {
    let json = r#"{
        "maximum_iterations": 10,
        "combo_type": "and"
    }"#;
    let config: ConvergenceConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.combo_type, ComboType::And);
}

/// A missing required parameter is a deserialization error, not a silent
/// default.
#[test]
fn missing_maximum_iterations_fails_to_parse() {
    let json = r#"{ "combo_type": "OR" }"#;
    let parsed: Result<ConvergenceConfig, _> = serde_json::from_str(json);
    assert!(parsed.is_err());
}

/// External-config defaults.
#[test]
fn external_config_default_tolerance() {
    let json = r#"{ "method": "CCSA", "volume_fraction_constraint": 0.3 }"#;
    let config: ExternalConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.constraint_tolerance, 1e-4);
}
