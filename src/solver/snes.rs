//! Nonlinear solver adapter: Newton with line search (`newtonls`).
//!
//! The residual and Jacobian are user callbacks working on local arrays
//! (owned entries plus refreshed ghosts, local order). Each Newton step
//! solves `J dx = -F` with the inner KSP. The Jacobian comes from one of
//! three sources: assembled local triplets, a Jacobian action, or finite
//! differences of the residual (`-snes_mf`).

use std::sync::Arc;

use crate::algs::communicator::Communicator;
use crate::algs::exchange::agree;
use crate::bridge_error::BridgeError;
use crate::index::map::SharedIndexMap;
use crate::matrix::{
    AssemblyOptions, DistributedMatrix, OperatorAction, assemble_to_distributed, wrap_operator,
};
use crate::solver::krylov::Progress;
use crate::solver::ksp::LinearSolver;
use crate::solver::options::{LineSearchType, PcType, SnesOptions};
use crate::solver::state::{FailureReason, Lifecycle, SolverState, StopReason};
use crate::solver::{Monitor, SolveResult};
use crate::vector::{DistributedVector, from_distributed};

/// `F(x)`: local array in, owned residual segment out.
pub trait ResidualAction: Send + Sync {
    fn residual(&self, x: &[f64]) -> Result<Vec<f64>, BridgeError>;
}

impl<F> ResidualAction for F
where
    F: Fn(&[f64]) -> Vec<f64> + Send + Sync,
{
    fn residual(&self, x: &[f64]) -> Result<Vec<f64>, BridgeError> {
        Ok(self(x))
    }
}

/// `J(x)` as local `(row, col, value)` triplets.
pub trait JacobianAssembler: Send + Sync {
    fn assemble(&self, x: &[f64]) -> Result<Vec<(usize, usize, f64)>, BridgeError>;
}

impl<F> JacobianAssembler for F
where
    F: Fn(&[f64]) -> Vec<(usize, usize, f64)> + Send + Sync,
{
    fn assemble(&self, x: &[f64]) -> Result<Vec<(usize, usize, f64)>, BridgeError> {
        Ok(self(x))
    }
}

/// `J(x) dx`: local arrays in, owned segment out.
pub trait JacobianAction: Send + Sync {
    fn apply(&self, x: &[f64], dx: &[f64]) -> Result<Vec<f64>, BridgeError>;
}

impl<F> JacobianAction for F
where
    F: Fn(&[f64], &[f64]) -> Vec<f64> + Send + Sync,
{
    fn apply(&self, x: &[f64], dx: &[f64]) -> Result<Vec<f64>, BridgeError> {
        Ok(self(x, dx))
    }
}

#[derive(Clone)]
pub enum JacobianSource {
    Assembled(Arc<dyn JacobianAssembler>),
    Action(Arc<dyn JacobianAction>),
    FiniteDifference,
}

impl JacobianSource {
    pub fn assembled<A: JacobianAssembler + 'static>(assembler: A) -> Self {
        JacobianSource::Assembled(Arc::new(assembler))
    }

    pub fn action<A: JacobianAction + 'static>(action: A) -> Self {
        JacobianSource::Action(Arc::new(action))
    }

    pub fn is_matrix_free(&self) -> bool {
        !matches!(self, JacobianSource::Assembled(_))
    }

    fn name(&self) -> &'static str {
        match self {
            JacobianSource::Assembled(_) => "assembled",
            JacobianSource::Action(_) => "action",
            JacobianSource::FiniteDifference => "finite-difference",
        }
    }
}

impl std::fmt::Debug for JacobianSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Jacobian action frozen at the current Newton iterate.
struct Linearized {
    x: Vec<f64>,
    jac: Arc<dyn JacobianAction>,
}

impl OperatorAction for Linearized {
    fn apply(&self, dx: &[f64]) -> Result<Vec<f64>, BridgeError> {
        self.jac.apply(&self.x, dx)
    }
}

/// Forward difference `(F(x + h dx) - F(x)) / h`.
struct FdAction {
    x: Vec<f64>,
    f: Vec<f64>,
    h: f64,
    residual: Arc<dyn ResidualAction>,
}

impl OperatorAction for FdAction {
    fn apply(&self, dx: &[f64]) -> Result<Vec<f64>, BridgeError> {
        let shifted: Vec<f64> = self.x.iter().zip(dx).map(|(x, d)| x + self.h * d).collect();
        let fp = self.residual.residual(&shifted)?;
        if fp.len() != self.f.len() {
            return Err(BridgeError::size_mismatch(
                "residual output vs. owned width",
                self.f.len(),
                fp.len(),
            ));
        }
        Ok(fp
            .iter()
            .zip(&self.f)
            .map(|(a, b)| (a - b) / self.h)
            .collect())
    }
}

/// Nonlinear adapter (SNES).
pub struct NonlinearSolver {
    lifecycle: Lifecycle,
    map: Option<SharedIndexMap>,
    residual: Option<Arc<dyn ResidualAction>>,
    jacobian: JacobianSource,
    options: SnesOptions,
    monitor: Option<Monitor>,
    result: Option<SolveResult>,
    linear_iterations: usize,
}

impl Default for NonlinearSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NonlinearSolver {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new("SNES"),
            map: None,
            residual: None,
            jacobian: JacobianSource::FiniteDifference,
            options: SnesOptions::default(),
            monitor: None,
            result: None,
            linear_iterations: 0,
        }
    }

    /// Called with `(iteration, ‖F‖)` at every Newton iteration.
    pub fn set_monitor<F>(&mut self, monitor: F)
    where
        F: FnMut(usize, f64) + Send + 'static,
    {
        self.monitor = Some(Box::new(monitor));
    }

    /// Local: attach the residual and Jacobian callbacks on `map`. With
    /// `snes_mf` set the Jacobian source is replaced by finite differences.
    ///
    /// # Errors
    /// `InvalidOption` for rejected options, a `shell` inner preconditioner,
    /// or an entry-based preconditioner with a matrix-free Jacobian.
    pub fn bind<R: ResidualAction + 'static>(
        &mut self,
        map: &SharedIndexMap,
        residual: R,
        jacobian: JacobianSource,
        options: &SnesOptions,
    ) -> Result<(), BridgeError> {
        options.validate()?;
        let jacobian = if options.mf {
            JacobianSource::FiniteDifference
        } else {
            jacobian
        };
        match options.ksp.pc.pc_type {
            Some(PcType::Shell) => {
                return Err(BridgeError::InvalidOption {
                    key: "pc_type".into(),
                    reason: "the nonlinear solver takes no shell preconditioner".into(),
                });
            }
            Some(pc) if pc != PcType::None && jacobian.is_matrix_free() => {
                return Err(BridgeError::InvalidOption {
                    key: "pc_type".into(),
                    reason: format!("{pc} needs an assembled Jacobian; source is {}", jacobian.name()),
                });
            }
            _ => {}
        }
        log::debug!(
            "SNES bound ({}, line search {}, jacobian {})",
            options.snes_type,
            options.linesearch,
            jacobian.name()
        );
        self.map = Some(Arc::clone(map));
        self.residual = Some(Arc::new(residual));
        self.jacobian = jacobian;
        self.options = options.clone();
        self.result = None;
        self.linear_iterations = 0;
        self.lifecycle.bind();
        Ok(())
    }

    pub fn state(&self) -> SolverState {
        self.lifecycle.state()
    }

    pub fn options(&self) -> &SnesOptions {
        &self.options
    }

    /// Total inner Krylov iterations of the last solve.
    pub fn linear_iterations(&self) -> usize {
        self.linear_iterations
    }

    /// Collective: solve `F(x) = 0` from `x0` (zero when `None`).
    pub fn solve<C: Communicator>(
        &mut self,
        x0: Option<&DistributedVector>,
        comm: &C,
    ) -> Result<SolverState, BridgeError> {
        self.lifecycle.begin()?;
        self.result = None;
        let (Some(map), Some(residual)) = (self.map.clone(), self.residual.clone()) else {
            self.lifecycle.abort();
            return Err(BridgeError::SolverNotConfigured { solver: "SNES" });
        };
        let checked = map.ensure_comm(comm).and_then(|()| match x0 {
            Some(x0) => map.ensure_same_layout(x0.map(), "initial guess"),
            None => Ok(()),
        });
        if let Err(e) = checked {
            self.lifecycle.abort();
            return Err(e);
        }
        let mut x = DistributedVector::zeros(&map);
        if let Some(x0) = x0 {
            x.copy_from(x0)?;
        }
        let mut newton = Newton {
            map: &map,
            residual: &residual,
            jacobian: &self.jacobian,
            options: &self.options,
            comm,
            funcs: 0,
            linear_iterations: 0,
        };
        let mut progress = Progress::new("SNES", self.monitor.as_mut());
        let run = newton.run(&mut x, &mut progress);
        let iteration = progress.iteration;
        self.linear_iterations = newton.linear_iterations;
        match run {
            Ok((iterations, fnorm, reason)) => {
                log::info!(
                    "SNES: {reason} after {iterations} iterations ({} function evaluations, {} linear iterations), |F| {fnorm:e}",
                    newton.funcs,
                    newton.linear_iterations
                );
                self.result = Some(SolveResult {
                    solution: x,
                    iterations,
                    residual_norm: fnorm,
                    reason,
                });
                Ok(self.lifecycle.finish(reason))
            }
            Err(e) => Ok(self.lifecycle.fail(FailureReason {
                operator: None,
                comm: comm.id(),
                iteration,
                message: e.to_string(),
            })),
        }
    }

    /// # Errors
    /// `ResultUnavailable` in `unbound`, `configured` and `failed`.
    pub fn result(&self) -> Result<&SolveResult, BridgeError> {
        self.lifecycle.check_result()?;
        self.result.as_ref().ok_or(BridgeError::ResultUnavailable {
            solver: "SNES",
            state: self.lifecycle.state(),
        })
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.lifecycle.failure()
    }
}

enum Step {
    Accepted {
        f: DistributedVector,
        fnorm: f64,
        ynorm: f64,
    },
    Stopped(StopReason),
}

struct Newton<'a, C: Communicator> {
    map: &'a SharedIndexMap,
    residual: &'a Arc<dyn ResidualAction>,
    jacobian: &'a JacobianSource,
    options: &'a SnesOptions,
    comm: &'a C,
    funcs: usize,
    linear_iterations: usize,
}

fn callback_error(me: usize, what: &'static str) -> impl FnOnce(Vec<usize>) -> BridgeError {
    move |ranks| BridgeError::CallbackFailed(format!("[rank {me}] {what} failed on ranks {ranks:?}"))
}

impl<C: Communicator> Newton<'_, C> {
    /// Local array of `x` with refreshed ghosts.
    fn local(&self, x: &DistributedVector) -> Result<Vec<f64>, BridgeError> {
        let mut xg = x.clone();
        xg.ghost_update(self.comm)?;
        Ok(from_distributed(&xg))
    }

    fn eval(&mut self, x: &DistributedVector) -> Result<DistributedVector, BridgeError> {
        let local = self.local(x)?;
        let n = self.map.n_owned();
        let f = self.residual.residual(&local).and_then(|f| {
            if f.len() == n {
                Ok(f)
            } else {
                Err(BridgeError::size_mismatch("residual output vs. owned width", n, f.len()))
            }
        });
        let f = agree(self.comm, f, callback_error(self.comm.rank(), "residual"))?;
        self.funcs += 1;
        DistributedVector::from_owned(self.map, &f)
    }

    fn jacobian_at(&self, x: &DistributedVector, f: &DistributedVector) -> Result<DistributedMatrix, BridgeError> {
        let local = self.local(x)?;
        let map = self.map;
        match self.jacobian {
            JacobianSource::Assembled(assembler) => {
                let n = map.local_size();
                let triplets = assembler.assemble(&local).and_then(|t| {
                    match t.iter().find(|&&(r, c, _)| r >= n || c >= n) {
                        Some(&(r, c, _)) => Err(BridgeError::size_mismatch(
                            format!("jacobian triplet ({r}, {c}) vs. local map size"),
                            n,
                            r.max(c),
                        )),
                        None => Ok(t),
                    }
                });
                let triplets = agree(
                    self.comm,
                    triplets,
                    callback_error(self.comm.rank(), "jacobian assembly"),
                )?;
                assemble_to_distributed(&triplets, map, map, self.comm, &AssemblyOptions::default())
            }
            JacobianSource::Action(jac) => {
                let action = Linearized {
                    x: local,
                    jac: Arc::clone(jac),
                };
                agree(
                    self.comm,
                    wrap_operator(action, map, map),
                    callback_error(self.comm.rank(), "jacobian action"),
                )
            }
            JacobianSource::FiniteDifference => {
                let xnorm = x.norm(self.comm)?;
                let action = FdAction {
                    x: local,
                    f: f.owned().to_vec(),
                    h: f64::EPSILON.sqrt() * (1.0 + xnorm),
                    residual: Arc::clone(self.residual),
                };
                agree(
                    self.comm,
                    wrap_operator(action, map, map),
                    callback_error(self.comm.rank(), "finite-difference jacobian"),
                )
            }
        }
    }

    /// Inner solve of `J dx = -F`; `None` when it did not converge.
    fn direction(
        &mut self,
        jac: &DistributedMatrix,
        f: &DistributedVector,
    ) -> Result<Option<DistributedVector>, BridgeError> {
        let mut rhs = f.clone();
        rhs.scale(-1.0);
        let mut ksp = LinearSolver::new();
        ksp.bind(jac, &self.options.ksp)?;
        let state = ksp.solve(&rhs, None, self.comm)?;
        if state == SolverState::Failed {
            let message = ksp
                .failure_reason()
                .map_or_else(|| "linear solve failed".to_string(), |r| r.to_string());
            return Err(BridgeError::CallbackFailed(message));
        }
        let res = ksp.result()?;
        self.linear_iterations += res.iterations;
        if res.diverged() {
            log::warn!("SNES: linear solve stopped with {}", res.reason);
            return Ok(None);
        }
        Ok(Some(res.solution.clone()))
    }

    fn line_search(
        &mut self,
        x: &mut DistributedVector,
        dx: &DistributedVector,
        fnorm: f64,
    ) -> Result<Step, BridgeError> {
        const ALPHA: f64 = 1e-4;
        const MIN_LAMBDA: f64 = 1e-12;
        let dnorm = dx.norm(self.comm)?;
        let x_old = x.clone();
        if self.options.linesearch == LineSearchType::Basic {
            x.axpy(1.0, dx)?;
            let f = self.eval(x)?;
            let fnorm = f.norm(self.comm)?;
            return Ok(Step::Accepted {
                f,
                fnorm,
                ynorm: dnorm,
            });
        }
        let f0 = 0.5 * fnorm * fnorm;
        let slope = -fnorm * fnorm;
        let mut lambda = 1.0;
        loop {
            x.waxpby(1.0, &x_old, lambda, dx)?;
            let f = self.eval(x)?;
            let fnorm_new = f.norm(self.comm)?;
            let fnew = 0.5 * fnorm_new * fnorm_new;
            if fnew.is_finite() && fnew <= f0 + ALPHA * lambda * slope {
                return Ok(Step::Accepted {
                    f,
                    fnorm: fnorm_new,
                    ynorm: lambda * dnorm,
                });
            }
            if self.funcs >= self.options.max_funcs {
                return Ok(Step::Stopped(StopReason::DivergedFunctionCount));
            }
            let quadratic = -slope * lambda * lambda / (2.0 * (fnew - f0 - slope * lambda));
            lambda = if quadratic.is_finite() {
                quadratic.clamp(0.1 * lambda, 0.5 * lambda)
            } else {
                0.5 * lambda
            };
            log::trace!("SNES line search: |F| {fnorm_new:e}, backtracking to {lambda:e}");
            if lambda < MIN_LAMBDA {
                x.copy_from(&x_old)?;
                return Ok(Step::Stopped(StopReason::DivergedLineSearch));
            }
        }
    }

    /// Returns `(iterations, ‖F‖, reason)`; `x` holds the last iterate.
    fn run(
        &mut self,
        x: &mut DistributedVector,
        progress: &mut Progress<'_>,
    ) -> Result<(usize, f64, StopReason), BridgeError> {
        let o = self.options;
        let mut f = self.eval(x)?;
        let mut fnorm = f.norm(self.comm)?;
        let fnorm0 = fnorm;
        let mut it = 0;
        progress.report(it, fnorm);
        if !fnorm.is_finite() {
            return Ok((it, fnorm, StopReason::DivergedNanOrInf));
        }
        if fnorm < o.atol {
            return Ok((it, fnorm, StopReason::ConvergedAtol));
        }
        loop {
            let jac = self.jacobian_at(x, &f)?;
            let Some(dx) = self.direction(&jac, &f)? else {
                return Ok((it, fnorm, StopReason::DivergedLinearSolve));
            };
            let (f_new, fnorm_new, ynorm) = match self.line_search(x, &dx, fnorm)? {
                Step::Accepted { f, fnorm, ynorm } => (f, fnorm, ynorm),
                Step::Stopped(reason) => return Ok((it, fnorm, reason)),
            };
            it += 1;
            f = f_new;
            fnorm = fnorm_new;
            progress.report(it, fnorm);
            let xnorm = x.norm(self.comm)?;
            let stop = if !fnorm.is_finite() {
                Some(StopReason::DivergedNanOrInf)
            } else if fnorm < o.atol {
                Some(StopReason::ConvergedAtol)
            } else if fnorm <= o.rtol * fnorm0 {
                Some(StopReason::ConvergedRtol)
            } else if ynorm < o.stol * xnorm {
                Some(StopReason::ConvergedStepTol)
            } else if self.funcs >= o.max_funcs {
                Some(StopReason::DivergedFunctionCount)
            } else if it >= o.max_it {
                Some(StopReason::DivergedMaxIts)
            } else {
                None
            };
            if let Some(reason) = stop {
                return Ok((it, fnorm, reason));
            }
        }
    }
}
