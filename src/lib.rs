//! **topograd** — gradient-based, constrained topology-optimization driver.
//!
//! Given a simulation that evaluates an objective and a volume functional
//! (plus sensitivities) for a design-variable field, the driver updates
//! the field iteratively to minimize the objective subject to a volume
//! constraint:
//!
//! 1. **Types** (`types`): error surface, simulation / communicator
//!    seams, configuration schema.
//! 2. **Convergence** (`convergence`): composable stopping criteria with
//!    AND/OR combination and min/max iteration guards.
//! 3. **Contract** (`optimizer`): the polymorphic `initialize` /
//!    `optimize` surface, global norms, and the package factory.
//! 4. **OC backend** (`oc`): optimality-criteria update with a hybrid
//!    bisection/secant multiplier search enforcing the volume constraint
//!    every iteration.
//! 5. **External backend** (`external`): the same contract delegated to
//!    NLopt's MMA/CCSA algorithms.

pub mod types;
pub mod convergence;
pub mod optimizer;
pub mod oc;
pub mod external;
