//! Symmetric eigensolver adapter, `A x = λ B x` with `B` symmetric positive
//! definite (the identity when absent).
//!
//! Subspace iteration on the spectral transform
//!
//! - `shift`: `T = B⁻¹ (A - σ B)`, dominant `|λ - σ|`,
//! - `sinvert`: `T = (A - σ B)⁻¹ B`, `λ` closest to `σ`,
//!
//! with `B`-orthonormalization and Rayleigh-Ritz on the original pencil.
//! `power` is the same iteration with `ncv = nev`. A pair is converged when
//! `‖A x - λ B x‖ / |λ| < tol`.

use crate::algs::communicator::Communicator;
use crate::bridge_error::BridgeError;
use crate::index::map::SharedIndexMap;
use crate::matrix::DistributedMatrix;
use crate::solver::Monitor;
use crate::solver::dense::{Dense, symmetric_eigen};
use crate::solver::krylov::{Krylov, Progress, Settings, agreed_mult};
use crate::solver::ksp::run_linear;
use crate::solver::options::{EpsOptions, EpsType, PcType, StType, Which};
use crate::solver::pc::PcKernel;
use crate::solver::state::{FailureReason, Lifecycle, SolverState, StopReason};
use crate::vector::DistributedVector;

/// Computed eigenpairs, ordered by the requested part of the spectrum.
#[derive(Clone, Debug)]
pub struct EigenResult {
    pub eigenvalues: Vec<f64>,
    /// `B`-orthonormal eigenvectors on the column map.
    pub eigenvectors: Vec<DistributedVector>,
    /// Relative residual norms `‖A x - λ B x‖ / |λ|`.
    pub errors: Vec<f64>,
    /// Number of leading pairs that met the tolerance.
    pub converged: usize,
    pub iterations: usize,
    pub reason: StopReason,
}

impl EigenResult {
    pub fn diverged(&self) -> bool {
        !self.reason.is_converged()
    }
}

/// Eigen adapter (EPS).
pub struct EigenSolver {
    lifecycle: Lifecycle,
    a: Option<DistributedMatrix>,
    b: Option<DistributedMatrix>,
    options: EpsOptions,
    monitor: Option<Monitor>,
    result: Option<EigenResult>,
}

impl Default for EigenSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl EigenSolver {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new("EPS"),
            a: None,
            b: None,
            options: EpsOptions::default(),
            monitor: None,
            result: None,
        }
    }

    /// Called with `(iteration, error of the first unconverged pair)`.
    pub fn set_monitor<F>(&mut self, monitor: F)
    where
        F: FnMut(usize, f64) + Send + 'static,
    {
        self.monitor = Some(Box::new(monitor));
    }

    /// Local: attach `A` (and `B` for generalized problems) with options.
    ///
    /// # Errors
    /// `InvalidOption` for rejected options, `nev` beyond the problem size,
    /// `sinvert` with a matrix-free operand, or an inner preconditioner
    /// that needs entries of a matrix-free `B`. `IndexMapMismatch` when the
    /// operands do not share one square layout.
    pub fn bind(
        &mut self,
        a: &DistributedMatrix,
        b: Option<&DistributedMatrix>,
        options: &EpsOptions,
    ) -> Result<(), BridgeError> {
        options.validate()?;
        a.ensure_square()?;
        let n = a.row_map().global_size();
        if options.nev as u64 > n {
            return Err(BridgeError::InvalidOption {
                key: "eps_nev".into(),
                reason: format!("{} eigenpairs requested from a problem of size {n}", options.nev),
            });
        }
        if let Some(b) = b {
            b.ensure_square()?;
            b.row_map().ensure_same_layout(a.row_map(), "mass operator")?;
        }
        if options.st.ksp.pc.pc_type == Some(PcType::Shell) {
            return Err(BridgeError::InvalidOption {
                key: "st_pc_type".into(),
                reason: "the spectral transform takes no shell preconditioner".into(),
            });
        }
        match options.st.st_type {
            StType::Sinvert => {
                if let Some(m) = std::iter::once(a).chain(b).find(|m| m.is_matrix_free()) {
                    return Err(BridgeError::InvalidOption {
                        key: "st_type".into(),
                        reason: format!("sinvert needs assembled operators; {} is matrix-free", m.id()),
                    });
                }
            }
            StType::Shift => {
                if let Some(b) = b {
                    PcKernel::setup(b, &options.st.ksp.pc, None)?;
                }
            }
        }
        log::debug!(
            "EPS bound to {} ({}, {}, st {}, nev {})",
            a.id(),
            options.eps_type,
            options.which,
            options.st.st_type,
            options.nev
        );
        self.a = Some(a.clone());
        self.b = b.cloned();
        self.options = options.clone();
        self.result = None;
        self.lifecycle.bind();
        Ok(())
    }

    pub fn state(&self) -> SolverState {
        self.lifecycle.state()
    }

    pub fn options(&self) -> &EpsOptions {
        &self.options
    }

    /// Collective: compute the requested eigenpairs.
    pub fn solve<C: Communicator>(&mut self, comm: &C) -> Result<SolverState, BridgeError> {
        self.lifecycle.begin()?;
        self.result = None;
        let Some(a) = self.a.clone() else {
            self.lifecycle.abort();
            return Err(BridgeError::SolverNotConfigured { solver: "EPS" });
        };
        if let Err(e) = a.row_map().ensure_comm(comm) {
            self.lifecycle.abort();
            return Err(e);
        }
        let b = self.b.clone();
        let options = self.options.clone();
        let mut progress = Progress::new("EPS", self.monitor.as_mut());
        let run = Subspace::new(&a, b.as_ref(), &options, comm).and_then(|s| s.run(&mut progress));
        let iteration = progress.iteration;
        match run {
            Ok(res) => {
                log::info!(
                    "EPS on {}: {} with {}/{} pairs after {} iterations",
                    a.id(),
                    res.reason,
                    res.converged,
                    options.nev,
                    res.iterations
                );
                let reason = res.reason;
                self.result = Some(res);
                Ok(self.lifecycle.finish(reason))
            }
            Err(e) => Ok(self.lifecycle.fail(FailureReason {
                operator: Some(a.id()),
                comm: comm.id(),
                iteration,
                message: e.to_string(),
            })),
        }
    }

    /// # Errors
    /// `ResultUnavailable` in `unbound`, `configured` and `failed`.
    pub fn result(&self) -> Result<&EigenResult, BridgeError> {
        self.lifecycle.check_result()?;
        self.result.as_ref().ok_or(BridgeError::ResultUnavailable {
            solver: "EPS",
            state: self.lifecycle.state(),
        })
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.lifecycle.failure()
    }
}

/// Inner solve for the transform.
struct InnerSolve {
    op: DistributedMatrix,
    pc: PcKernel,
    settings: Settings,
}

struct Subspace<'a, C: Communicator> {
    a: &'a DistributedMatrix,
    b: Option<&'a DistributedMatrix>,
    options: &'a EpsOptions,
    comm: &'a C,
    sigma: f64,
    inner: Option<InnerSolve>,
    ncv: usize,
    max_it: usize,
}

/// Deterministic start vector entry for global index `g`, column `j`.
fn noise(g: u64, j: u64) -> f64 {
    let mut z = g.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ j.wrapping_add(1).wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64 - 0.5
}

impl<'a, C: Communicator> Subspace<'a, C> {
    fn new(
        a: &'a DistributedMatrix,
        b: Option<&'a DistributedMatrix>,
        options: &'a EpsOptions,
        comm: &'a C,
    ) -> Result<Self, BridgeError> {
        let n = a.row_map().global_size() as usize;
        let nev = options.nev;
        let ncv = match options.eps_type {
            EpsType::Power => nev,
            EpsType::Subspace => options.ncv.unwrap_or((2 * nev).max(nev + 15)),
        }
        .min(n)
        .max(nev);
        let max_it = options.max_it.unwrap_or(100.max(2 * n / ncv.max(1)));
        let sigma = options.st.shift.unwrap_or(match options.which {
            Which::TargetMagnitude => options.target,
            _ => 0.0,
        });
        let inner = match (options.st.st_type, b) {
            (StType::Sinvert, _) => {
                let op = a.shifted(sigma, b, comm)?;
                let pc = PcKernel::setup(&op, &options.st.ksp.pc, None)?;
                Some(InnerSolve {
                    op,
                    pc,
                    settings: Settings::from(&options.st.ksp),
                })
            }
            (StType::Shift, Some(b)) => Some(InnerSolve {
                op: b.clone(),
                pc: PcKernel::setup(b, &options.st.ksp.pc, None)?,
                settings: Settings::from(&options.st.ksp),
            }),
            (StType::Shift, None) => None,
        };
        log::debug!("EPS: ncv {ncv}, max_it {max_it}, sigma {sigma}");
        Ok(Self {
            a,
            b,
            options,
            comm,
            sigma,
            inner,
            ncv,
            max_it,
        })
    }

    fn map(&self) -> &SharedIndexMap {
        self.a.col_map()
    }

    fn work(&self) -> DistributedVector {
        DistributedVector::zeros(self.map())
    }

    fn start_vector(&self, j: u64) -> DistributedVector {
        let mut v = self.work();
        let start = self.map().owned_range().start;
        for (i, x) in v.owned_mut().iter_mut().enumerate() {
            *x = noise(start + i as u64, j);
        }
        v
    }

    fn apply_b(&self, x: &DistributedVector) -> Result<DistributedVector, BridgeError> {
        match self.b {
            Some(b) => {
                let mut y = self.work();
                agreed_mult(b, x, &mut y, self.comm)?;
                Ok(y)
            }
            None => Ok(x.clone()),
        }
    }

    /// `None` when the inner solve did not converge.
    fn inner_solve(&self, inner: &InnerSolve, rhs: &DistributedVector) -> Result<Option<DistributedVector>, BridgeError> {
        let krylov = Krylov {
            op: &inner.op,
            pc: &inner.pc,
            comm: self.comm,
            settings: inner.settings,
        };
        let mut x = krylov.work();
        let out = run_linear(&krylov, rhs, &mut x, &mut Progress::new("EPS/ST", None))?;
        if out.reason.is_converged() {
            Ok(Some(x))
        } else {
            log::warn!("EPS: inner solve stopped with {}", out.reason);
            Ok(None)
        }
    }

    /// `T y`, or `None` if an inner solve failed to converge.
    fn apply_transform(&self, y: &DistributedVector) -> Result<Option<DistributedVector>, BridgeError> {
        match (self.options.st.st_type, &self.inner) {
            (StType::Sinvert, Some(inner)) => {
                let rhs = self.apply_b(y)?;
                self.inner_solve(inner, &rhs)
            }
            (StType::Shift, Some(inner)) => {
                let mut w = self.work();
                agreed_mult(self.a, y, &mut w, self.comm)?;
                w.axpy(-self.sigma, &self.apply_b(y)?)?;
                self.inner_solve(inner, &w)
            }
            _ => {
                let mut w = self.work();
                agreed_mult(self.a, y, &mut w, self.comm)?;
                w.axpy(-self.sigma, y)?;
                Ok(Some(w))
            }
        }
    }

    /// In-place `B`-orthonormalization (two MGS passes); returns the `B`
    /// images. Collapsed directions are replaced by fresh start vectors.
    fn orthonormalize(
        &self,
        vs: &mut [DistributedVector],
        round: usize,
    ) -> Result<Vec<DistributedVector>, BridgeError> {
        const MAX_REFILLS: usize = 3;
        let mut bvs: Vec<DistributedVector> = Vec::with_capacity(vs.len());
        for j in 0..vs.len() {
            let mut refills = 0;
            loop {
                let before = vs[j].dot(&self.apply_b(&vs[j])?, self.comm)?.max(0.0).sqrt();
                for _ in 0..2 {
                    for (i, bv) in bvs.iter().enumerate() {
                        let coef = vs[j].dot(bv, self.comm)?;
                        let (head, tail) = vs.split_at_mut(j);
                        tail[0].axpy(-coef, &head[i])?;
                    }
                }
                let bv = self.apply_b(&vs[j])?;
                let nrm = vs[j].dot(&bv, self.comm)?;
                if nrm.is_finite() && nrm > 0.0 && nrm.sqrt() > 1e-10 * before {
                    let s = 1.0 / nrm.sqrt();
                    vs[j].scale(s);
                    let mut bv = bv;
                    bv.scale(s);
                    bvs.push(bv);
                    break;
                }
                if refills == MAX_REFILLS {
                    return Err(BridgeError::CallbackFailed(format!(
                        "EPS: basis vector {j} collapsed; is B positive definite?"
                    )));
                }
                refills += 1;
                vs[j] = self.start_vector((self.ncv * (round + refills) + j) as u64);
            }
        }
        Ok(bvs)
    }

    fn sort_key(&self, theta: f64) -> f64 {
        match self.options.which {
            Which::LargestMagnitude => -theta.abs(),
            Which::SmallestMagnitude => theta.abs(),
            Which::TargetMagnitude => (theta - self.options.target).abs(),
        }
    }

    fn combine(&self, vs: &[DistributedVector], q: &Dense, col: usize) -> Result<DistributedVector, BridgeError> {
        let mut out = self.work();
        for (i, v) in vs.iter().enumerate() {
            out.axpy(q.get(i, col), v)?;
        }
        Ok(out)
    }

    fn run(&self, progress: &mut Progress<'_>) -> Result<EigenResult, BridgeError> {
        let nev = self.options.nev;
        let ncv = self.ncv;
        let mut vs: Vec<DistributedVector> = (0..ncv as u64).map(|j| self.start_vector(j)).collect();
        let mut bvs = self.orthonormalize(&mut vs, 0)?;
        let mut it = 0;
        loop {
            // Rayleigh-Ritz on span(vs)
            let mut avs = Vec::with_capacity(ncv);
            for v in &vs {
                let mut av = self.work();
                agreed_mult(self.a, v, &mut av, self.comm)?;
                avs.push(av);
            }
            let mut h = Dense::zeros(ncv);
            for (j, av) in avs.iter().enumerate() {
                for (i, hij) in av.mdot(&vs, self.comm)?.into_iter().enumerate() {
                    h.set(i, j, hij);
                }
            }
            h.symmetrize();
            let (theta, q) = symmetric_eigen(&h);
            let mut order: Vec<usize> = (0..ncv).collect();
            order.sort_by(|&i, &j| self.sort_key(theta[i]).total_cmp(&self.sort_key(theta[j])));

            let mut ritz = Vec::with_capacity(ncv);
            let mut values = Vec::with_capacity(ncv);
            let mut errors = Vec::with_capacity(nev);
            for (k, &col) in order.iter().enumerate() {
                if k < nev {
                    let mut r = self.combine(&avs, &q, col)?;
                    r.axpy(-theta[col], &self.combine(&bvs, &q, col)?)?;
                    let rn = r.norm(self.comm)?;
                    let scale = if theta[col] != 0.0 { theta[col].abs() } else { 1.0 };
                    errors.push(rn / scale);
                }
                values.push(theta[col]);
                ritz.push(self.combine(&vs, &q, col)?);
            }
            let converged = errors
                .iter()
                .take_while(|e| **e < self.options.tol)
                .count();
            progress.report(it, errors.get(converged).copied().unwrap_or(0.0));

            let stop = if converged >= nev {
                Some(StopReason::ConvergedRtol)
            } else if errors.iter().any(|e| !e.is_finite()) {
                Some(StopReason::DivergedNanOrInf)
            } else if it >= self.max_it {
                Some(StopReason::DivergedMaxIts)
            } else {
                None
            };
            if let Some(reason) = stop {
                ritz.truncate(nev);
                values.truncate(nev);
                return Ok(EigenResult {
                    eigenvalues: values,
                    eigenvectors: ritz,
                    errors,
                    converged,
                    iterations: it,
                    reason,
                });
            }

            let mut next = Vec::with_capacity(ncv);
            for v in &ritz {
                match self.apply_transform(v)? {
                    Some(t) => next.push(t),
                    None => {
                        ritz.truncate(nev);
                        values.truncate(nev);
                        return Ok(EigenResult {
                            eigenvalues: values,
                            eigenvectors: ritz,
                            errors,
                            converged,
                            iterations: it,
                            reason: StopReason::DivergedLinearSolve,
                        });
                    }
                }
            }
            it += 1;
            vs = next;
            bvs = self.orthonormalize(&mut vs, it)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::index::partition::LocalPartition;
    use crate::index::translator::IndexTranslator;
    use crate::matrix::{AssemblyOptions, assemble_to_distributed};
    use crate::solver::options::{KspType, StOptions};
    use approx::assert_relative_eq;

    fn laplacian(n: usize) -> DistributedMatrix {
        let map = IndexTranslator::build(&LocalPartition::serial(n), &NoComm).unwrap();
        let mut t = Vec::new();
        for i in 0..n {
            t.push((i, i, 2.0));
            if i + 1 < n {
                t.push((i, i + 1, -1.0));
                t.push((i + 1, i, -1.0));
            }
        }
        assemble_to_distributed(&t, &map, &map, &NoComm, &AssemblyOptions::default()).unwrap()
    }

    fn exact(n: usize, k: usize) -> f64 {
        2.0 - 2.0 * (k as f64 * std::f64::consts::PI / (n + 1) as f64).cos()
    }

    #[test]
    fn largest_eigenvalues_of_laplacian() {
        let n = 30;
        let a = laplacian(n);
        let mut eps = EigenSolver::new();
        eps.bind(
            &a,
            None,
            &EpsOptions {
                nev: 2,
                ..EpsOptions::default()
            },
        )
        .unwrap();
        assert_eq!(eps.solve(&NoComm).unwrap(), SolverState::Converged);
        let res = eps.result().unwrap();
        assert_eq!(res.converged, 2);
        assert_relative_eq!(res.eigenvalues[0], exact(n, n), epsilon = 1e-7);
        assert_relative_eq!(res.eigenvalues[1], exact(n, n - 1), epsilon = 1e-7);
    }

    #[test]
    fn smallest_with_shift_and_invert() {
        let n = 30;
        let a = laplacian(n);
        let mut eps = EigenSolver::new();
        let options = EpsOptions {
            nev: 3,
            which: Which::SmallestMagnitude,
            st: StOptions {
                st_type: StType::Sinvert,
                ksp: crate::solver::options::KspOptions {
                    ksp_type: KspType::Cg,
                    rtol: 1e-12,
                    ..Default::default()
                },
                ..StOptions::default()
            },
            ..EpsOptions::default()
        };
        eps.bind(&a, None, &options).unwrap();
        assert_eq!(eps.solve(&NoComm).unwrap(), SolverState::Converged);
        let res = eps.result().unwrap();
        for k in 0..3 {
            assert_relative_eq!(res.eigenvalues[k], exact(n, k + 1), epsilon = 1e-8);
        }
    }

    #[test]
    fn generalized_problem_with_scaled_mass() {
        // A x = λ (2I) x has the eigenvalues of A halved
        let n = 12;
        let a = laplacian(n);
        let map = a.row_map().clone();
        let t: Vec<_> = (0..n).map(|i| (i, i, 2.0)).collect();
        let b = assemble_to_distributed(&t, &map, &map, &NoComm, &AssemblyOptions::default()).unwrap();
        let mut eps = EigenSolver::new();
        eps.bind(&a, Some(&b), &EpsOptions::default()).unwrap();
        assert_eq!(eps.solve(&NoComm).unwrap(), SolverState::Converged);
        assert_relative_eq!(eps.result().unwrap().eigenvalues[0], exact(n, n) / 2.0, epsilon = 1e-7);
    }

    #[test]
    fn sinvert_rejects_matrix_free() {
        let map = IndexTranslator::build(&LocalPartition::serial(3), &NoComm).unwrap();
        let a = crate::matrix::wrap_operator(|x: &[f64]| x.to_vec(), &map, &map).unwrap();
        let options = EpsOptions {
            which: Which::TargetMagnitude,
            st: StOptions {
                st_type: StType::Sinvert,
                ..StOptions::default()
            },
            ..EpsOptions::default()
        };
        assert!(matches!(
            EigenSolver::new().bind(&a, None, &options),
            Err(BridgeError::InvalidOption { .. })
        ));
    }
}
