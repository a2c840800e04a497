//! Linear solver adapter.

use std::sync::Arc;

use crate::algs::communicator::Communicator;
use crate::bridge_error::BridgeError;
use crate::matrix::DistributedMatrix;
use crate::solver::krylov::{Krylov, Outcome, Progress, Settings};
use crate::solver::options::{KspOptions, PcType};
use crate::solver::pc::{PcKernel, PreconditionerAction};
use crate::solver::state::{FailureReason, Lifecycle, SolverState, StopReason};
use crate::solver::{Monitor, SolveResult};
use crate::vector::DistributedVector;

/// `A x = b` for a bound square operator.
///
/// ```text
/// let mut ksp = LinearSolver::new();
/// ksp.bind(&a, &KspOptions::from_db(&db, "")?)?;
/// if ksp.solve(&b, None, comm)? == SolverState::Converged {
///     let x = ksp.result()?.to_local();
/// }
/// ```
pub struct LinearSolver {
    lifecycle: Lifecycle,
    operator: Option<DistributedMatrix>,
    pc: Option<Arc<PcKernel>>,
    options: KspOptions,
    shell: Option<Arc<dyn PreconditionerAction>>,
    monitor: Option<Monitor>,
    result: Option<SolveResult>,
}

impl Default for LinearSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearSolver {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new("KSP"),
            operator: None,
            pc: None,
            options: KspOptions::default(),
            shell: None,
            monitor: None,
            result: None,
        }
    }

    /// Called with `(iteration, residual norm)` at every iteration.
    pub fn set_monitor<F>(&mut self, monitor: F)
    where
        F: FnMut(usize, f64) + Send + 'static,
    {
        self.monitor = Some(Box::new(monitor));
    }

    /// Action for `pc_type shell`; takes effect at the next `bind`.
    pub fn set_shell_preconditioner<A: PreconditionerAction + 'static>(&mut self, action: A) {
        self.shell = Some(Arc::new(action));
    }

    /// Local: attach a square operator and options and set the
    /// preconditioner up. Allowed from any state; drops any previous result.
    ///
    /// # Errors
    /// `InvalidOption` for rejected options or a preconditioner the operator
    /// cannot support, `IndexMapMismatch` for non-square layouts.
    pub fn bind(&mut self, op: &DistributedMatrix, options: &KspOptions) -> Result<(), BridgeError> {
        options.validate()?;
        let pc = PcKernel::setup(op, &options.pc, self.shell.as_ref())?;
        log::debug!(
            "KSP bound to {} ({}, pc {})",
            op.id(),
            options.ksp_type,
            pc.kind()
        );
        self.operator = Some(op.clone());
        self.pc = Some(Arc::new(pc));
        self.options = options.clone();
        self.result = None;
        self.lifecycle.bind();
        Ok(())
    }

    pub fn state(&self) -> SolverState {
        self.lifecycle.state()
    }

    pub fn options(&self) -> &KspOptions {
        &self.options
    }

    pub fn pc_type(&self) -> Option<PcType> {
        self.pc.as_ref().map(|k| k.kind())
    }

    pub fn operator(&self) -> Option<&DistributedMatrix> {
        self.operator.as_ref()
    }

    /// Collective: solve `A x = b`.
    ///
    /// `x0` is the initial guess when `ksp_initial_guess_nonzero` is set and
    /// ignored otherwise. Returns the terminal state; errors are reserved
    /// for misuse (wrong state, communicator or layout), detected before
    /// any communication and leaving the solver `configured`.
    pub fn solve<C: Communicator>(
        &mut self,
        b: &DistributedVector,
        x0: Option<&DistributedVector>,
        comm: &C,
    ) -> Result<SolverState, BridgeError> {
        self.lifecycle.begin()?;
        self.result = None;
        let (op, pc) = match self.prepare(b, x0, comm) {
            Ok(v) => v,
            Err(e) => {
                self.lifecycle.abort();
                return Err(e);
            }
        };
        let mut x = DistributedVector::zeros(op.col_map());
        if let Some(x0) = x0 {
            if self.options.initial_guess_nonzero {
                x.copy_from(x0)?;
            } else {
                log::debug!("KSP: initial guess ignored (ksp_initial_guess_nonzero is off)");
            }
        }
        let krylov = Krylov {
            op: &op,
            pc: &pc,
            comm,
            settings: Settings::from(&self.options),
        };
        let mut progress = Progress::new("KSP", self.monitor.as_mut());
        let run = run_linear(&krylov, b, &mut x, &mut progress);
        let iteration = progress.iteration;
        match run {
            Ok(out) => {
                log::info!(
                    "KSP {} on {}: {} after {} iterations, residual norm {:e}",
                    self.options.ksp_type,
                    op.id(),
                    out.reason,
                    out.iterations,
                    out.residual_norm
                );
                self.result = Some(SolveResult {
                    solution: x,
                    iterations: out.iterations,
                    residual_norm: out.residual_norm,
                    reason: out.reason,
                });
                Ok(self.lifecycle.finish(out.reason))
            }
            Err(e) => Ok(self.lifecycle.fail(FailureReason {
                operator: Some(op.id()),
                comm: comm.id(),
                iteration,
                message: e.to_string(),
            })),
        }
    }

    fn prepare<C: Communicator>(
        &self,
        b: &DistributedVector,
        x0: Option<&DistributedVector>,
        comm: &C,
    ) -> Result<(DistributedMatrix, Arc<PcKernel>), BridgeError> {
        let (Some(op), Some(pc)) = (self.operator.clone(), self.pc.clone()) else {
            return Err(BridgeError::SolverNotConfigured { solver: "KSP" });
        };
        op.row_map().ensure_comm(comm)?;
        b.map().ensure_comm(comm)?;
        op.row_map().ensure_same_layout(b.map(), "right-hand side")?;
        if let Some(x0) = x0 {
            x0.map().ensure_comm(comm)?;
            op.col_map().ensure_same_layout(x0.map(), "initial guess")?;
        }
        Ok((op, pc))
    }

    /// The solution of the last solve. In `diverged` the partial result is
    /// returned and flagged through [`SolveResult::diverged`].
    ///
    /// # Errors
    /// `ResultUnavailable` in `unbound`, `configured` and `failed`.
    pub fn result(&self) -> Result<&SolveResult, BridgeError> {
        self.lifecycle.check_result()?;
        self.result.as_ref().ok_or(BridgeError::ResultUnavailable {
            solver: "KSP",
            state: self.lifecycle.state(),
        })
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.lifecycle.failure()
    }
}

/// Collective: a zero right-hand side short-circuits to `x = 0`.
pub(crate) fn run_linear<C: Communicator>(
    krylov: &Krylov<'_, C>,
    b: &DistributedVector,
    x: &mut DistributedVector,
    progress: &mut Progress<'_>,
) -> Result<Outcome, BridgeError> {
    let bnorm = b.norm(krylov.comm)?;
    if bnorm == 0.0 {
        x.set(0.0);
        progress.report(0, 0.0);
        return Ok(Outcome {
            iterations: 0,
            residual_norm: 0.0,
            reason: StopReason::ConvergedAtol,
        });
    }
    krylov.solve(b, x, progress)
}
