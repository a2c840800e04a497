//! Solver lifecycle shared by every adapter.
//!
//! ```text
//! unbound ──bind──▶ configured ──solve──▶ solving ──▶ converged | diverged | failed
//!    ▲                  ▲                                  │
//!    └──────────────────┴───────────────bind───────────────┘
//! ```
//!
//! `solving` only exists inside the blocking solve call. A finished solver
//! must be bound again before the next solve.

use std::fmt;

use crate::algs::communicator::CommId;
use crate::bridge_error::BridgeError;
use crate::matrix::OperatorId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SolverState {
    Unbound,
    Configured,
    Solving,
    Converged,
    Diverged,
    Failed,
}

impl SolverState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SolverState::Converged | SolverState::Diverged | SolverState::Failed
        )
    }
}

impl fmt::Display for SolverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SolverState::Unbound => "unbound",
            SolverState::Configured => "configured",
            SolverState::Solving => "solving",
            SolverState::Converged => "converged",
            SolverState::Diverged => "diverged",
            SolverState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why an iteration stopped (PETSc's `*ConvergedReason`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StopReason {
    /// Residual below `rtol` times the reference norm.
    ConvergedRtol,
    /// Residual below `atol`.
    ConvergedAtol,
    /// Fixed iteration count reached (`preonly`).
    ConvergedIts,
    /// Newton step below `stol` times the solution norm.
    ConvergedStepTol,
    /// Iteration cap reached.
    DivergedMaxIts,
    /// Residual grew beyond `divtol` times the reference norm.
    DivergedDtol,
    /// Krylov breakdown (indefinite operator or preconditioner).
    DivergedBreakdown,
    /// Line search could not decrease the residual.
    DivergedLineSearch,
    /// Inner linear solve did not converge.
    DivergedLinearSolve,
    /// Residual evaluation budget exhausted.
    DivergedFunctionCount,
    /// A residual norm became NaN or infinite.
    DivergedNanOrInf,
}

impl StopReason {
    pub fn is_converged(self) -> bool {
        matches!(
            self,
            StopReason::ConvergedRtol
                | StopReason::ConvergedAtol
                | StopReason::ConvergedIts
                | StopReason::ConvergedStepTol
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::ConvergedRtol => "CONVERGED_RTOL",
            StopReason::ConvergedAtol => "CONVERGED_ATOL",
            StopReason::ConvergedIts => "CONVERGED_ITS",
            StopReason::ConvergedStepTol => "CONVERGED_SNORM_RELATIVE",
            StopReason::DivergedMaxIts => "DIVERGED_ITS",
            StopReason::DivergedDtol => "DIVERGED_DTOL",
            StopReason::DivergedBreakdown => "DIVERGED_BREAKDOWN",
            StopReason::DivergedLineSearch => "DIVERGED_LINE_SEARCH",
            StopReason::DivergedLinearSolve => "DIVERGED_LINEAR_SOLVE",
            StopReason::DivergedFunctionCount => "DIVERGED_FUNCTION_COUNT",
            StopReason::DivergedNanOrInf => "DIVERGED_NANORINF",
        };
        f.write_str(s)
    }
}

/// Recorded cause of a `failed` solve.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FailureReason {
    pub operator: Option<OperatorId>,
    pub comm: CommId,
    pub iteration: usize,
    pub message: String,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Some(op) => write!(
                f,
                "{op} on {} at iteration {}: {}",
                self.comm, self.iteration, self.message
            ),
            None => write!(
                f,
                "{} at iteration {}: {}",
                self.comm, self.iteration, self.message
            ),
        }
    }
}

/// State bookkeeping embedded in each adapter.
#[derive(Clone, Debug)]
pub(crate) struct Lifecycle {
    solver: &'static str,
    state: SolverState,
    failure: Option<FailureReason>,
}

impl Lifecycle {
    pub fn new(solver: &'static str) -> Self {
        Self {
            solver,
            state: SolverState::Unbound,
            failure: None,
        }
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn bind(&mut self) {
        self.state = SolverState::Configured;
        self.failure = None;
    }

    /// `configured → solving`, or the error for every other state.
    pub fn begin(&mut self) -> Result<(), BridgeError> {
        match self.state {
            SolverState::Configured => {
                self.state = SolverState::Solving;
                Ok(())
            }
            SolverState::Unbound => Err(BridgeError::SolverNotConfigured {
                solver: self.solver,
            }),
            state => Err(BridgeError::StaleSolverState {
                solver: self.solver,
                state,
            }),
        }
    }

    /// Back to `configured` after a rejected call; the binding stays valid.
    pub fn abort(&mut self) {
        if self.state == SolverState::Solving {
            self.state = SolverState::Configured;
        }
    }

    /// Leave `solving` according to the stop reason.
    pub fn finish(&mut self, reason: StopReason) -> SolverState {
        self.state = if reason.is_converged() {
            SolverState::Converged
        } else {
            log::warn!("{} diverged: {reason}", self.solver);
            SolverState::Diverged
        };
        self.state
    }

    pub fn fail(&mut self, failure: FailureReason) -> SolverState {
        log::warn!("{} failed: {failure}", self.solver);
        self.failure = Some(failure);
        self.state = SolverState::Failed;
        self.state
    }

    /// A result exists in `converged` and `diverged` only.
    pub fn check_result(&self) -> Result<(), BridgeError> {
        match self.state {
            SolverState::Converged | SolverState::Diverged => Ok(()),
            state => Err(BridgeError::ResultUnavailable {
                solver: self.solver,
                state,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let mut lc = Lifecycle::new("KSP");
        assert!(matches!(lc.begin(), Err(BridgeError::SolverNotConfigured { .. })));
        assert!(matches!(
            lc.check_result(),
            Err(BridgeError::ResultUnavailable {
                state: SolverState::Unbound,
                ..
            })
        ));
        lc.bind();
        assert!(lc.check_result().is_err());
        lc.begin().unwrap();
        assert_eq!(lc.finish(StopReason::ConvergedRtol), SolverState::Converged);
        assert!(lc.check_result().is_ok());
        assert!(matches!(
            lc.begin(),
            Err(BridgeError::StaleSolverState {
                state: SolverState::Converged,
                ..
            })
        ));
        lc.bind();
        lc.begin().unwrap();
        assert_eq!(lc.finish(StopReason::DivergedMaxIts), SolverState::Diverged);
        assert!(lc.check_result().is_ok());
    }

    #[test]
    fn failure_has_no_result_but_a_reason() {
        let mut lc = Lifecycle::new("SNES");
        lc.bind();
        lc.begin().unwrap();
        lc.fail(FailureReason {
            operator: None,
            comm: CommId::SERIAL,
            iteration: 3,
            message: "residual callback failed".into(),
        });
        assert_eq!(lc.state(), SolverState::Failed);
        assert!(lc.check_result().is_err());
        assert_eq!(lc.failure().map(|f| f.iteration), Some(3));
        assert_eq!(SolverState::Failed.to_string(), "failed");
    }
}
