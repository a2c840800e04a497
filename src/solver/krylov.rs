//! Krylov kernels shared by the linear solver and the inner solves of EPS
//! and SNES.
//!
//! All residual norms are unpreconditioned (`KSP_NORM_UNPRECONDITIONED`),
//! for CG too, so every method reports the true `‖b - A x‖`. Convergence
//! tests against the initial residual norm `r0`:
//! `‖r‖ ≤ max(rtol·r0, atol)` converges, `‖r‖ ≥ divtol·r0` diverges.
//! A NaN or infinite norm or inner product ends with `DIVERGED_NANORINF`.

use crate::algs::communicator::Communicator;
use crate::algs::exchange::agree;
use crate::bridge_error::BridgeError;
use crate::matrix::DistributedMatrix;
use crate::solver::Monitor;
use crate::solver::dense::{givens, solve_upper};
use crate::solver::options::{KspOptions, KspType};
use crate::solver::pc::PcKernel;
use crate::solver::state::StopReason;
use crate::vector::DistributedVector;

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Settings {
    pub ksp_type: KspType,
    pub rtol: f64,
    pub atol: f64,
    pub divtol: f64,
    pub max_it: usize,
    pub restart: usize,
    pub richardson_scale: f64,
}

impl From<&KspOptions> for Settings {
    fn from(o: &KspOptions) -> Self {
        Self {
            ksp_type: o.ksp_type,
            rtol: o.rtol,
            atol: o.atol,
            divtol: o.divtol,
            max_it: o.max_it,
            restart: o.gmres_restart,
            richardson_scale: o.richardson_scale,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Outcome {
    pub iterations: usize,
    pub residual_norm: f64,
    pub reason: StopReason,
}

/// Iteration counter plus the optional user monitor.
pub(crate) struct Progress<'m> {
    label: &'static str,
    pub iteration: usize,
    monitor: Option<&'m mut Monitor>,
}

impl<'m> Progress<'m> {
    pub fn new(label: &'static str, monitor: Option<&'m mut Monitor>) -> Self {
        Self {
            label,
            iteration: 0,
            monitor,
        }
    }

    pub fn report(&mut self, it: usize, rnorm: f64) {
        self.iteration = it;
        log::trace!("{} {it} residual norm {rnorm:e}", self.label);
        if let Some(m) = self.monitor.as_mut() {
            m(it, rnorm);
        }
    }
}

/// Collective: `y = A x`, failing on every rank if the action failed on any.
pub(crate) fn agreed_mult<C: Communicator>(
    op: &DistributedMatrix,
    x: &DistributedVector,
    y: &mut DistributedVector,
    comm: &C,
) -> Result<(), BridgeError> {
    let me = comm.rank();
    let id = op.id();
    agree(comm, op.mult(x, y, comm), |ranks| {
        BridgeError::CallbackFailed(format!("[rank {me}] {id} failed on ranks {ranks:?}"))
    })
}

/// One Krylov solve: operator, preconditioner, communicator.
pub(crate) struct Krylov<'a, C: Communicator> {
    pub op: &'a DistributedMatrix,
    pub pc: &'a PcKernel,
    pub comm: &'a C,
    pub settings: Settings,
}

impl<C: Communicator> Krylov<'_, C> {
    /// Work vector on the column map, so matrix-free actions accept it.
    pub fn work(&self) -> DistributedVector {
        DistributedVector::zeros(self.op.col_map())
    }

    fn mult(&self, x: &DistributedVector, y: &mut DistributedVector) -> Result<(), BridgeError> {
        agreed_mult(self.op, x, y, self.comm)
    }

    fn precondition(&self, r: &DistributedVector, z: &mut DistributedVector) -> Result<(), BridgeError> {
        if !matches!(self.pc, PcKernel::Shell(_)) {
            return self.pc.apply(r, z);
        }
        let me = self.comm.rank();
        agree(self.comm, self.pc.apply(r, z), |ranks| {
            BridgeError::CallbackFailed(format!(
                "[rank {me}] shell preconditioner failed on ranks {ranks:?}"
            ))
        })
    }

    /// `r = b - A x`.
    fn residual(
        &self,
        b: &DistributedVector,
        x: &DistributedVector,
        r: &mut DistributedVector,
    ) -> Result<(), BridgeError> {
        self.mult(x, r)?;
        r.aypx(-1.0, b)
    }

    fn test(&self, it: usize, rnorm: f64, rnorm0: f64) -> Option<StopReason> {
        let s = &self.settings;
        if !rnorm.is_finite() {
            return Some(StopReason::DivergedNanOrInf);
        }
        if rnorm <= (s.rtol * rnorm0).max(s.atol) {
            return Some(if rnorm < s.atol {
                StopReason::ConvergedAtol
            } else {
                StopReason::ConvergedRtol
            });
        }
        if it > 0 && rnorm >= s.divtol * rnorm0 {
            return Some(StopReason::DivergedDtol);
        }
        (it >= s.max_it).then_some(StopReason::DivergedMaxIts)
    }

    /// Collective: solve `A x = b` from the guess in `x`.
    pub fn solve(
        &self,
        b: &DistributedVector,
        x: &mut DistributedVector,
        progress: &mut Progress<'_>,
    ) -> Result<Outcome, BridgeError> {
        match self.settings.ksp_type {
            KspType::Cg => self.cg(b, x, progress),
            KspType::Gmres => self.gmres(b, x, progress),
            KspType::Richardson => self.richardson(b, x, progress),
            KspType::Preonly => self.preonly(b, x, progress),
        }
    }

    fn cg(
        &self,
        b: &DistributedVector,
        x: &mut DistributedVector,
        progress: &mut Progress<'_>,
    ) -> Result<Outcome, BridgeError> {
        let c = self.comm;
        let mut r = self.work();
        let mut z = self.work();
        let mut p = self.work();
        let mut q = self.work();
        self.residual(b, x, &mut r)?;
        let mut rnorm = r.norm(c)?;
        let rnorm0 = rnorm;
        let mut rz = 0.0;
        let mut it = 0;
        let done = |it, rnorm, reason| Outcome {
            iterations: it,
            residual_norm: rnorm,
            reason,
        };
        loop {
            progress.report(it, rnorm);
            if let Some(reason) = self.test(it, rnorm, rnorm0) {
                return Ok(done(it, rnorm, reason));
            }
            self.precondition(&r, &mut z)?;
            let rz_new = r.dot(&z, c)?;
            if !rz_new.is_finite() {
                return Ok(done(it, rnorm, StopReason::DivergedNanOrInf));
            }
            if rz_new <= 0.0 {
                log::warn!("cg: preconditioner is not positive definite (r.z = {rz_new:e})");
                return Ok(done(it, rnorm, StopReason::DivergedBreakdown));
            }
            if it == 0 {
                p.copy_from(&z)?;
            } else {
                p.aypx(rz_new / rz, &z)?;
            }
            rz = rz_new;
            self.mult(&p, &mut q)?;
            let pq = p.dot(&q, c)?;
            if !pq.is_finite() {
                return Ok(done(it, rnorm, StopReason::DivergedNanOrInf));
            }
            if pq <= 0.0 {
                log::warn!("cg: operator is not positive definite (p.Ap = {pq:e})");
                return Ok(done(it, rnorm, StopReason::DivergedBreakdown));
            }
            let alpha = rz / pq;
            x.axpy(alpha, &p)?;
            r.axpy(-alpha, &q)?;
            it += 1;
            rnorm = r.norm(c)?;
        }
    }

    /// Right-preconditioned GMRES(m) with modified Gram-Schmidt.
    fn gmres(
        &self,
        b: &DistributedVector,
        x: &mut DistributedVector,
        progress: &mut Progress<'_>,
    ) -> Result<Outcome, BridgeError> {
        let c = self.comm;
        let m = self.settings.restart;
        let mut r = self.work();
        let mut z = self.work();
        let mut w = self.work();
        self.residual(b, x, &mut r)?;
        let mut beta = r.norm(c)?;
        let rnorm0 = beta;
        let mut it = 0;
        progress.report(it, beta);
        if let Some(reason) = self.test(it, beta, rnorm0) {
            return Ok(Outcome {
                iterations: it,
                residual_norm: beta,
                reason,
            });
        }
        loop {
            let mut basis: Vec<DistributedVector> = Vec::with_capacity(m + 1);
            let mut v0 = r.clone();
            v0.scale(1.0 / beta);
            basis.push(v0);
            let mut h: Vec<Vec<f64>> = Vec::with_capacity(m);
            let mut rot: Vec<(f64, f64)> = Vec::with_capacity(m);
            let mut g = vec![0.0; m + 1];
            g[0] = beta;
            let mut rnorm = beta;
            let mut stop = None;
            while h.len() < m {
                let k = h.len();
                self.precondition(&basis[k], &mut z)?;
                self.mult(&z, &mut w)?;
                let mut col = vec![0.0; m + 1];
                for (i, v) in basis.iter().enumerate() {
                    let hik = w.dot(v, c)?;
                    w.axpy(-hik, v)?;
                    col[i] = hik;
                }
                let hnext = w.norm(c)?;
                col[k + 1] = hnext;
                for (i, &(cs, sn)) in rot.iter().enumerate() {
                    let (a, bb) = (col[i], col[i + 1]);
                    col[i] = cs * a + sn * bb;
                    col[i + 1] = -sn * a + cs * bb;
                }
                let (cs, sn) = givens(col[k], col[k + 1]);
                col[k] = cs * col[k] + sn * col[k + 1];
                col[k + 1] = 0.0;
                g[k + 1] = -sn * g[k];
                g[k] *= cs;
                rot.push((cs, sn));
                h.push(col);
                it += 1;
                rnorm = g[k + 1].abs();
                progress.report(it, rnorm);
                stop = self.test(it, rnorm, rnorm0);
                if stop.is_some() || hnext <= f64::EPSILON * beta {
                    break;
                }
                let mut next = w.clone();
                next.scale(1.0 / hnext);
                basis.push(next);
            }
            let y = solve_upper(&h, &g, h.len());
            let mut u = self.work();
            for (yi, v) in y.iter().zip(&basis) {
                u.axpy(*yi, v)?;
            }
            self.precondition(&u, &mut z)?;
            x.axpy(1.0, &z)?;
            if let Some(reason) = stop {
                return Ok(Outcome {
                    iterations: it,
                    residual_norm: rnorm,
                    reason,
                });
            }
            self.residual(b, x, &mut r)?;
            beta = r.norm(c)?;
            log::trace!("gmres restart at {it}: true residual norm {beta:e}");
            if let Some(reason) = self.test(it, beta, rnorm0) {
                return Ok(Outcome {
                    iterations: it,
                    residual_norm: beta,
                    reason,
                });
            }
        }
    }

    /// Damped preconditioned Richardson, `x ← x + s M⁻¹ (b - A x)`.
    fn richardson(
        &self,
        b: &DistributedVector,
        x: &mut DistributedVector,
        progress: &mut Progress<'_>,
    ) -> Result<Outcome, BridgeError> {
        let c = self.comm;
        let mut r = self.work();
        let mut z = self.work();
        self.residual(b, x, &mut r)?;
        let mut rnorm = r.norm(c)?;
        let rnorm0 = rnorm;
        let mut it = 0;
        loop {
            progress.report(it, rnorm);
            if let Some(reason) = self.test(it, rnorm, rnorm0) {
                return Ok(Outcome {
                    iterations: it,
                    residual_norm: rnorm,
                    reason,
                });
            }
            self.precondition(&r, &mut z)?;
            x.axpy(self.settings.richardson_scale, &z)?;
            it += 1;
            self.residual(b, x, &mut r)?;
            rnorm = r.norm(c)?;
        }
    }

    /// A single preconditioner application; the residual is reported for
    /// information only.
    fn preonly(
        &self,
        b: &DistributedVector,
        x: &mut DistributedVector,
        progress: &mut Progress<'_>,
    ) -> Result<Outcome, BridgeError> {
        let mut z = self.work();
        self.precondition(b, &mut z)?;
        x.copy_from(&z)?;
        let mut r = self.work();
        self.residual(b, x, &mut r)?;
        let rnorm = r.norm(self.comm)?;
        progress.report(1, rnorm);
        Ok(Outcome {
            iterations: 1,
            residual_norm: rnorm,
            reason: StopReason::ConvergedIts,
        })
    }
}
