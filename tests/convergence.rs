//! Convergence-test semantics: iteration guards, combinator laws,
//! relative baselines, and running-average window saturation.

use topograd::convergence::{ConvergenceTest, Verdict};
use topograd::types::{ComboType, ConvergenceConfig};

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// Config with no criteria; individual tests switch thresholds on.
fn base_config(max_iterations: usize) -> ConvergenceConfig {
    ConvergenceConfig {
        minimum_iterations: 0,
        maximum_iterations: max_iterations,
        combo_type: ComboType::Or,
        relative_design_change: None,
        absolute_design_change: None,
        relative_objective_change: None,
        absolute_objective_change: None,
        relative_objective_running_average: None,
        absolute_objective_running_average: None,
    }
}

// ─────────────────────────────────────────────────────────────
//  Iteration guards
// ─────────────────────────────────────────────────────────────

/// Iteration 0 never converges, however small the deltas are.
#[test]
fn iteration_zero_never_converges() {
    let mut config = base_config(100);
    config.absolute_objective_change = Some(1e3);
    let mut checker = ConvergenceTest::new(&config);
    checker.init_norm(1.0, 1.0);

    assert_eq!(checker.is_converged(0.0, 0.0, 0, 0), Verdict::NotConverged);
    // The same deltas one iteration later pass.
    assert_eq!(checker.is_converged(0.0, 0.0, 1, 0), Verdict::CriteriaMet);
}

/// The iteration limit always converges, with the distinct verdict.
#[test]
fn iteration_limit_forces_convergence() {
    let mut config = base_config(5);
    config.absolute_objective_change = Some(1e-12);
    let mut checker = ConvergenceTest::new(&config);
    checker.init_norm(1.0, 1.0);

    for iter in 1..5 {
        assert_eq!(
            checker.is_converged(1.0, 1.0, iter, 0),
            Verdict::NotConverged,
            "iter {iter} should not converge",
        );
    }
    assert_eq!(checker.is_converged(1.0, 1.0, 5, 0), Verdict::IterationLimit);
    assert_eq!(checker.is_converged(1.0, 1.0, 17, 0), Verdict::IterationLimit);
}

/// Criteria that pass below the minimum iteration count are held back.
#[test]
fn minimum_iterations_defers_convergence() {
    let mut config = base_config(100);
    config.minimum_iterations = 5;
    config.absolute_objective_change = Some(1.0);
    let mut checker = ConvergenceTest::new(&config);
    checker.init_norm(1.0, 1.0);

    for iter in 1..5 {
        assert_eq!(checker.is_converged(0.1, 0.0, iter, 0), Verdict::NotConverged);
    }
    assert_eq!(checker.is_converged(0.1, 0.0, 5, 0), Verdict::CriteriaMet);
}

// ─────────────────────────────────────────────────────────────
//  Combinator laws
// ─────────────────────────────────────────────────────────────

/// AND: a single failing criterion vetoes convergence.
#[test]
fn and_requires_every_criterion() {
    let mut config = base_config(100);
    config.combo_type = ComboType::And;
    config.absolute_objective_change = Some(1.0); // passes below
    config.absolute_design_change = Some(1e-6); // fails below
    let mut checker = ConvergenceTest::new(&config);
    checker.init_norm(1.0, 1.0);

    assert_eq!(checker.is_converged(0.1, 0.5, 1, 0), Verdict::NotConverged);
    // Once the design delta also drops, both pass.
    assert_eq!(checker.is_converged(0.1, 1e-7, 2, 0), Verdict::CriteriaMet);
}

/// OR: one passing criterion suffices.
#[test]
fn or_accepts_any_criterion() {
    let mut config = base_config(100);
    config.combo_type = ComboType::Or;
    config.absolute_objective_change = Some(1.0);
    config.absolute_design_change = Some(1e-6);
    let mut checker = ConvergenceTest::new(&config);
    checker.init_norm(1.0, 1.0);

    assert_eq!(checker.is_converged(0.1, 0.5, 1, 0), Verdict::CriteriaMet);
}

// ─────────────────────────────────────────────────────────────
//  Relative baselines
// ─────────────────────────────────────────────────────────────

/// Relative criteria guard the divide: a zero baseline never passes.
#[test]
fn relative_criteria_reject_zero_baseline() {
    let mut config = base_config(100);
    config.relative_objective_change = Some(0.5);
    config.relative_design_change = Some(0.5);
    let mut checker = ConvergenceTest::new(&config);
    checker.init_norm(0.0, 0.0);

    for iter in 1..4 {
        assert_eq!(
            checker.is_converged(1e-9, 1e-9, iter, 0),
            Verdict::NotConverged,
            "zero baseline must never pass",
        );
    }
}

/// With a nonzero baseline the relative ratio decides.
#[test]
fn relative_criteria_use_seeded_baseline() {
    let mut config = base_config(100);
    config.relative_objective_change = Some(0.01);
    let mut checker = ConvergenceTest::new(&config);
    checker.init_norm(200.0, 1.0);

    // |df/f0| = 1.0/200 = 0.005 < 0.01
    assert_eq!(checker.is_converged(1.0, 0.0, 1, 0), Verdict::CriteriaMet);
    // |df/f0| = 5.0/200 = 0.025
    assert_eq!(checker.is_converged(5.0, 0.0, 2, 0), Verdict::NotConverged);
}

// ─────────────────────────────────────────────────────────────
//  Running averages
// ─────────────────────────────────────────────────────────────

/// The window holds the last 10 deltas: after a large transient, exactly
/// 10 constant small deltas are needed before the average settles on the
/// constant.
#[test]
fn running_average_saturates_after_window() {
    let mut config = base_config(1000);
    config.absolute_objective_running_average = Some(0.25);
    let mut checker = ConvergenceTest::new(&config);
    checker.init_norm(1.0, 1.0);

    let mut iter = 1;
    // Fill the window with a large transient.
    for _ in 0..10 {
        assert_eq!(checker.is_converged(1.0, 0.0, iter, 0), Verdict::NotConverged);
        iter += 1;
    }
    // Nine constant deltas still leave one transient sample in the window:
    // mean = (1.0 + 9*0.2) / 10 = 0.28.
    for k in 0..9 {
        assert_eq!(
            checker.is_converged(0.2, 0.0, iter, 0),
            Verdict::NotConverged,
            "window not yet saturated after {} constant deltas",
            k + 1,
        );
        iter += 1;
    }
    // The tenth evicts the last transient: mean = 0.2 < 0.25.
    assert_eq!(checker.is_converged(0.2, 0.0, iter, 0), Verdict::CriteriaMet);
}

/// The relative running average normalizes the window mean by the
/// objective baseline.
#[test]
fn relative_running_average_uses_baseline() {
    let mut config = base_config(1000);
    config.relative_objective_running_average = Some(0.15);
    let mut checker = ConvergenceTest::new(&config);
    checker.init_norm(2.0, 1.0);

    // mean = 0.2, mean/f0 = 0.1 < 0.15 from the first sample on.
    assert_eq!(checker.is_converged(0.2, 0.0, 1, 0), Verdict::CriteriaMet);

    // Zero baseline variant never passes.
    let mut config = base_config(1000);
    config.relative_objective_running_average = Some(0.15);
    let mut checker = ConvergenceTest::new(&config);
    checker.init_norm(0.0, 1.0);
    assert_eq!(checker.is_converged(0.0, 0.0, 1, 0), Verdict::NotConverged);
}
