//! Solver adapters: linear (KSP), preconditioner (PC), eigen (EPS) and
//! nonlinear (SNES).
//!
//! Every adapter follows the lifecycle in [`state`]. Solves are collective
//! and blocking; failures inside them are agreed across ranks and end in
//! the `diverged` or `failed` state instead of an error, so every rank
//! leaves the solve with the same outcome.

pub(crate) mod dense;
pub mod eps;
pub(crate) mod krylov;
pub mod ksp;
pub mod options;
pub mod pc;
pub mod snes;
pub mod state;

use crate::vector::{DistributedVector, from_distributed};

pub use eps::{EigenResult, EigenSolver};
pub use ksp::LinearSolver;
pub use options::{EpsOptions, KspOptions, OptionsDb, PcOptions, SnesOptions};
pub use pc::{Preconditioner, PreconditionerAction};
pub use snes::{JacobianAction, JacobianAssembler, JacobianSource, NonlinearSolver, ResidualAction};
pub use state::{FailureReason, SolverState, StopReason};

/// Progress callback, `(iteration, residual norm)`.
pub type Monitor = Box<dyn FnMut(usize, f64) + Send>;

/// Outcome of a linear, preconditioner or nonlinear solve.
#[derive(Clone, Debug)]
pub struct SolveResult {
    pub solution: DistributedVector,
    pub iterations: usize,
    pub residual_norm: f64,
    pub reason: StopReason,
}

impl SolveResult {
    /// True for partial results of a diverged solve.
    pub fn diverged(&self) -> bool {
        !self.reason.is_converged()
    }

    /// The solution as a local array. Ghost entries hold whatever the last
    /// halo update left; call `solution.ghost_update` first to refresh them.
    pub fn to_local(&self) -> Vec<f64> {
        from_distributed(&self.solution)
    }
}
