//! Preconditioners.
//!
//! `jacobi`, `sor` and `ilu` work on the locally owned diagonal block of an
//! assembled operator (block Jacobi across ranks), so applying them never
//! communicates. `shell` runs a user [`PreconditionerAction`].

use std::sync::Arc;

use crate::algs::communicator::Communicator;
use crate::algs::exchange::agree;
use crate::bridge_error::BridgeError;
use crate::matrix::DistributedMatrix;
use crate::solver::SolveResult;
use crate::solver::options::{PcOptions, PcType};
use crate::solver::state::{FailureReason, Lifecycle, SolverState, StopReason};
use crate::vector::DistributedVector;

/// User preconditioner: maps the owned residual segment to the owned
/// segment of `M⁻¹ r`. Must be linear and deterministic.
pub trait PreconditionerAction: Send + Sync {
    fn apply(&self, r: &[f64]) -> Result<Vec<f64>, BridgeError>;
}

impl<F> PreconditionerAction for F
where
    F: Fn(&[f64]) -> Vec<f64> + Send + Sync,
{
    fn apply(&self, r: &[f64]) -> Result<Vec<f64>, BridgeError> {
        Ok(self(r))
    }
}

/// Diagonal block in local column numbering; every row stores its diagonal.
#[derive(Clone, Debug)]
pub(crate) struct LocalBlock {
    row_ptr: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f64>,
    diag: Vec<usize>,
}

impl LocalBlock {
    fn from_operator(op: &DistributedMatrix) -> Option<Self> {
        let csr = op.csr()?;
        let n = op.row_map().n_owned();
        let mut row_ptr = Vec::with_capacity(n + 1);
        let mut cols = Vec::new();
        let mut vals = Vec::new();
        let mut diag = Vec::with_capacity(n);
        row_ptr.push(0);
        for r in 0..n {
            let mut has_diag = false;
            for k in csr.row(r) {
                let c = csr.slots[k];
                if c >= n {
                    continue;
                }
                if c > r && !has_diag {
                    diag.push(cols.len());
                    cols.push(r);
                    vals.push(0.0);
                    has_diag = true;
                }
                if c == r {
                    diag.push(cols.len());
                    has_diag = true;
                }
                cols.push(c);
                vals.push(csr.vals[k]);
            }
            if !has_diag {
                diag.push(cols.len());
                cols.push(r);
                vals.push(0.0);
            }
            row_ptr.push(cols.len());
        }
        Some(Self {
            row_ptr,
            cols,
            vals,
            diag,
        })
    }

    fn n(&self) -> usize {
        self.diag.len()
    }

    fn row(&self, i: usize) -> std::ops::Range<usize> {
        self.row_ptr[i]..self.row_ptr[i + 1]
    }

    /// Replace zero diagonal entries by 1; returns how many were replaced.
    fn patch_zero_diagonal(&mut self) -> usize {
        let mut patched = 0;
        for &d in &self.diag {
            if self.vals[d] == 0.0 {
                self.vals[d] = 1.0;
                patched += 1;
            }
        }
        patched
    }

    /// In-place ILU(0): unit lower factor below the diagonal, upper factor
    /// on and above it. Zero pivots become 1.
    fn factor_ilu0(&mut self) -> usize {
        let n = self.n();
        let mut marker = vec![usize::MAX; n];
        let mut patched = 0;
        for i in 0..n {
            for k in self.row(i) {
                marker[self.cols[k]] = k;
            }
            for kk in self.row(i) {
                let k = self.cols[kk];
                if k >= i {
                    break;
                }
                let lik = self.vals[kk] / self.vals[self.diag[k]];
                self.vals[kk] = lik;
                for jj in self.diag[k] + 1..self.row_ptr[k + 1] {
                    let m = marker[self.cols[jj]];
                    if m != usize::MAX {
                        let ukj = self.vals[jj];
                        self.vals[m] -= lik * ukj;
                    }
                }
            }
            for k in self.row(i) {
                marker[self.cols[k]] = usize::MAX;
            }
            let d = self.diag[i];
            if self.vals[d] == 0.0 {
                self.vals[d] = 1.0;
                patched += 1;
            }
        }
        patched
    }

    fn ilu_solve(&self, r: &[f64], z: &mut [f64]) {
        let n = self.n();
        for i in 0..n {
            let mut s = r[i];
            for k in self.row_ptr[i]..self.diag[i] {
                s -= self.vals[k] * z[self.cols[k]];
            }
            z[i] = s;
        }
        for i in (0..n).rev() {
            let mut s = z[i];
            for k in self.diag[i] + 1..self.row_ptr[i + 1] {
                s -= self.vals[k] * z[self.cols[k]];
            }
            z[i] = s / self.vals[self.diag[i]];
        }
    }

    fn sor_relax(&self, i: usize, omega: f64, r: &[f64], z: &mut [f64]) {
        let mut s = r[i];
        for k in self.row(i) {
            let j = self.cols[k];
            if j != i {
                s -= self.vals[k] * z[j];
            }
        }
        z[i] = (1.0 - omega) * z[i] + omega * s / self.vals[self.diag[i]];
    }
}

/// Set-up preconditioner ready to apply.
#[derive(Clone)]
pub(crate) enum PcKernel {
    Identity,
    Jacobi(Vec<f64>),
    Sor {
        block: LocalBlock,
        omega: f64,
        its: usize,
    },
    Ilu(LocalBlock),
    Shell(Arc<dyn PreconditionerAction>),
}

impl std::fmt::Debug for PcKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind().as_str())
    }
}

/// `pc_type` in effect: the option if set, else `ilu` for assembled and
/// `none` for matrix-free operators.
pub(crate) fn resolve_pc_type(op: &DistributedMatrix, options: &PcOptions) -> PcType {
    options.pc_type.unwrap_or(if op.is_matrix_free() {
        PcType::None
    } else {
        PcType::Ilu
    })
}

impl PcKernel {
    /// Local: build the preconditioner for a square operator.
    ///
    /// # Errors
    /// `InvalidOption` for `jacobi`, `sor` or `ilu` on a matrix-free
    /// operator, or `shell` without an action.
    pub fn setup(
        op: &DistributedMatrix,
        options: &PcOptions,
        shell: Option<&Arc<dyn PreconditionerAction>>,
    ) -> Result<Self, BridgeError> {
        options.validate()?;
        op.ensure_square()?;
        let kind = resolve_pc_type(op, options);
        let needs_entries = || BridgeError::InvalidOption {
            key: "pc_type".into(),
            reason: format!("{kind} needs an assembled operator; {} is matrix-free", op.id()),
        };
        let kernel = match kind {
            PcType::None => PcKernel::Identity,
            PcType::Shell => {
                let action = shell.ok_or_else(|| BridgeError::InvalidOption {
                    key: "pc_type".into(),
                    reason: "shell preconditioner selected but no action was set".into(),
                })?;
                PcKernel::Shell(Arc::clone(action))
            }
            PcType::Jacobi => {
                if op.is_matrix_free() {
                    return Err(needs_entries());
                }
                let mut zeros = 0;
                let inv = op
                    .diagonal()?
                    .owned()
                    .iter()
                    .map(|&d| {
                        if d == 0.0 {
                            zeros += 1;
                            1.0
                        } else {
                            1.0 / d
                        }
                    })
                    .collect();
                if zeros > 0 {
                    log::warn!("{}: jacobi replaced {zeros} zero diagonal entries by 1", op.id());
                }
                PcKernel::Jacobi(inv)
            }
            PcType::Sor => {
                let mut block = LocalBlock::from_operator(op).ok_or_else(needs_entries)?;
                let zeros = block.patch_zero_diagonal();
                if zeros > 0 {
                    log::warn!("{}: sor replaced {zeros} zero diagonal entries by 1", op.id());
                }
                PcKernel::Sor {
                    block,
                    omega: options.sor_omega,
                    its: options.sor_its,
                }
            }
            PcType::Ilu => {
                let mut block = LocalBlock::from_operator(op).ok_or_else(needs_entries)?;
                let zeros = block.factor_ilu0();
                if zeros > 0 {
                    log::warn!("{}: ilu(0) replaced {zeros} zero pivots by 1", op.id());
                }
                PcKernel::Ilu(block)
            }
        };
        log::debug!("{}: preconditioner {kind} set up", op.id());
        Ok(kernel)
    }

    pub fn kind(&self) -> PcType {
        match self {
            PcKernel::Identity => PcType::None,
            PcKernel::Jacobi(_) => PcType::Jacobi,
            PcKernel::Sor { .. } => PcType::Sor,
            PcKernel::Ilu(_) => PcType::Ilu,
            PcKernel::Shell(_) => PcType::Shell,
        }
    }

    /// Local: `z = M⁻¹ r` on the owned segments.
    pub fn apply(&self, r: &DistributedVector, z: &mut DistributedVector) -> Result<(), BridgeError> {
        r.ensure_compatible(z)?;
        let (r, z) = (r.owned(), z.owned_mut());
        match self {
            PcKernel::Identity => z.copy_from_slice(r),
            PcKernel::Jacobi(inv) => {
                for ((z, r), d) in z.iter_mut().zip(r).zip(inv) {
                    *z = r * d;
                }
            }
            PcKernel::Sor { block, omega, its } => {
                z.fill(0.0);
                for _ in 0..*its {
                    for i in 0..block.n() {
                        block.sor_relax(i, *omega, r, z);
                    }
                    for i in (0..block.n()).rev() {
                        block.sor_relax(i, *omega, r, z);
                    }
                }
            }
            PcKernel::Ilu(block) => block.ilu_solve(r, z),
            PcKernel::Shell(action) => {
                let out = action.apply(r)?;
                if out.len() != z.len() {
                    return Err(BridgeError::size_mismatch(
                        "shell preconditioner output vs. owned width",
                        z.len(),
                        out.len(),
                    ));
                }
                z.copy_from_slice(&out);
            }
        }
        Ok(())
    }
}

/// Standalone preconditioner with the solver lifecycle; `apply` plays the
/// role of the solve.
pub struct Preconditioner {
    lifecycle: Lifecycle,
    operator: Option<DistributedMatrix>,
    kernel: Option<Arc<PcKernel>>,
    shell: Option<Arc<dyn PreconditionerAction>>,
    result: Option<SolveResult>,
}

impl Default for Preconditioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Preconditioner {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new("PC"),
            operator: None,
            kernel: None,
            shell: None,
            result: None,
        }
    }

    /// Install the action used by `pc_type shell`. Takes effect at the next
    /// `bind`.
    pub fn set_shell<A: PreconditionerAction + 'static>(&mut self, action: A) {
        self.shell = Some(Arc::new(action));
    }

    /// Local: attach an operator and set the preconditioner up.
    pub fn bind(&mut self, op: &DistributedMatrix, options: &PcOptions) -> Result<(), BridgeError> {
        let kernel = PcKernel::setup(op, options, self.shell.as_ref())?;
        self.operator = Some(op.clone());
        self.kernel = Some(Arc::new(kernel));
        self.result = None;
        self.lifecycle.bind();
        Ok(())
    }

    pub fn state(&self) -> SolverState {
        self.lifecycle.state()
    }

    pub fn pc_type(&self) -> Option<PcType> {
        self.kernel.as_ref().map(|k| k.kind())
    }

    /// Collective: apply the preconditioner once, `z = M⁻¹ r`.
    ///
    /// Returns the new state. A failing shell action on any rank moves every
    /// rank to `failed`.
    pub fn apply<C: Communicator>(
        &mut self,
        r: &DistributedVector,
        comm: &C,
    ) -> Result<SolverState, BridgeError> {
        self.lifecycle.begin()?;
        self.result = None;
        let (Some(op), Some(kernel)) = (self.operator.clone(), self.kernel.clone()) else {
            self.lifecycle.abort();
            return Err(BridgeError::SolverNotConfigured { solver: "PC" });
        };
        let checked = op
            .row_map()
            .ensure_comm(comm)
            .and_then(|()| op.row_map().ensure_same_layout(r.map(), "preconditioner input"));
        if let Err(e) = checked {
            self.lifecycle.abort();
            return Err(e);
        }
        let mut z = DistributedVector::zeros(op.col_map());
        let me = comm.rank();
        let applied = agree(comm, kernel.apply(r, &mut z), |ranks| {
            BridgeError::CallbackFailed(format!(
                "[rank {me}] preconditioner failed on ranks {ranks:?}"
            ))
        });
        match applied {
            Ok(()) => {
                self.result = Some(SolveResult {
                    solution: z,
                    iterations: 1,
                    residual_norm: 0.0,
                    reason: StopReason::ConvergedIts,
                });
                Ok(self.lifecycle.finish(StopReason::ConvergedIts))
            }
            Err(e) => Ok(self.lifecycle.fail(FailureReason {
                operator: Some(op.id()),
                comm: comm.id(),
                iteration: 0,
                message: e.to_string(),
            })),
        }
    }

    /// The last application; `residual_norm` is not computed and reads 0.
    pub fn result(&self) -> Result<&SolveResult, BridgeError> {
        self.lifecycle.check_result()?;
        self.result.as_ref().ok_or(BridgeError::ResultUnavailable {
            solver: "PC",
            state: self.lifecycle.state(),
        })
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.lifecycle.failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::index::partition::LocalPartition;
    use crate::index::translator::IndexTranslator;
    use crate::matrix::{AssemblyOptions, assemble_to_distributed, wrap_operator};
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

    fn apply_kind(a: &DistributedMatrix, kind: PcType, r: &[f64]) -> Vec<f64> {
        let k = PcKernel::setup(
            a,
            &PcOptions {
                pc_type: Some(kind),
                ..PcOptions::default()
            },
            None,
        )
        .unwrap();
        let r = DistributedVector::from_owned(a.row_map(), r).unwrap();
        let mut z = r.duplicate();
        k.apply(&r, &mut z).unwrap();
        z.owned().to_vec()
    }

    #[test]
    fn ilu0_of_tridiagonal_is_exact() {
        // tridiagonal matrices have no fill, so ILU(0) = LU
        let a = laplacian(4);
        let z = apply_kind(&a, PcType::Ilu, &[1.0, 0.0, 0.0, 1.0]);
        for v in z {
            assert_relative_eq!(v, 1.0, epsilon = 1e-14);
        }
    }

    #[test]
    fn jacobi_and_sor() {
        let a = laplacian(3);
        assert_eq!(apply_kind(&a, PcType::Jacobi, &[2.0, 4.0, 6.0]), vec![1.0, 2.0, 3.0]);
        // one symmetric Gauss-Seidel sweep, worked by hand
        let z = apply_kind(&a, PcType::Sor, &[1.0, 0.0, 0.0]);
        assert_eq!(z, vec![0.65625, 0.3125, 0.125]);
    }

    #[test]
    fn matrix_free_rejects_entry_based_pcs() {
        let map = IndexTranslator::build(&LocalPartition::serial(2), &NoComm).unwrap();
        let a = wrap_operator(|x: &[f64]| x.to_vec(), &map, &map).unwrap();
        let opts = PcOptions {
            pc_type: Some(PcType::Jacobi),
            ..PcOptions::default()
        };
        assert!(matches!(
            PcKernel::setup(&a, &opts, None),
            Err(BridgeError::InvalidOption { .. })
        ));
        assert_eq!(
            PcKernel::setup(&a, &PcOptions::default(), None).unwrap().kind(),
            PcType::None
        );
    }

    #[test]
    fn standalone_lifecycle() {
        let a = laplacian(2);
        let mut pc = Preconditioner::new();
        assert!(pc.result().is_err());
        pc.set_shell(|r: &[f64]| r.iter().map(|v| 10.0 * v).collect::<Vec<f64>>());
        pc.bind(
            &a,
            &PcOptions {
                pc_type: Some(PcType::Shell),
                ..PcOptions::default()
            },
        )
        .unwrap();
        let r = DistributedVector::from_owned(a.row_map(), &[1.0, 2.0]).unwrap();
        assert_eq!(pc.apply(&r, &NoComm).unwrap(), SolverState::Converged);
        assert_eq!(pc.result().unwrap().solution.owned(), &[10.0, 20.0]);
        assert!(matches!(
            pc.apply(&r, &NoComm),
            Err(BridgeError::StaleSolverState { .. })
        ));
    }
}
