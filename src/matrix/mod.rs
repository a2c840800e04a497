//! Matrix adapter: assembled triplets and operator actions ⇄ distributed
//! matrices.
//!
//! A [`DistributedMatrix`] owns the rows its row map assigns to this rank,
//! exactly. Assembled matrices store those rows in CSR form with global
//! column indices; columns owned elsewhere are fetched through a column
//! scatter plan built at assembly. Matrix-free matrices hold an
//! [`OperatorAction`] and are never materialized.

mod assembly;
mod shell;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::algs::communicator::{CommId, Communicator, tags};
use crate::bridge_error::BridgeError;
use crate::index::map::SharedIndexMap;
use crate::overlap::scatter::{InsertMode, ScatterPlan};
use crate::vector::{DistributedVector, from_distributed};

pub use assembly::{AssemblyOptions, assemble_to_distributed};
pub use shell::{OperatorAction, wrap_operator};

/// Identity of one matrix handle, reported in errors and failure reasons.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct OperatorId(u64);

static NEXT_OPERATOR_ID: AtomicU64 = AtomicU64::new(1);

impl OperatorId {
    fn fresh() -> Self {
        OperatorId(NEXT_OPERATOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Owned rows in CSR form.
#[derive(Clone, Debug)]
pub(crate) struct CsrRows {
    pub row_ptr: Vec<usize>,
    pub cols: Vec<u64>,
    /// Position of each column in `[owned x | fetched off-process x]`.
    pub slots: Vec<usize>,
    pub vals: Vec<f64>,
    /// Off-process columns, ascending; fetched in this order.
    pub off_cols: Vec<u64>,
    pub col_plan: ScatterPlan,
}

impl CsrRows {
    pub(crate) fn n_rows(&self) -> usize {
        self.row_ptr.len() - 1
    }

    pub(crate) fn row(&self, r: usize) -> std::ops::Range<usize> {
        self.row_ptr[r]..self.row_ptr[r + 1]
    }
}

#[derive(Clone)]
enum Storage {
    Assembled(Arc<CsrRows>),
    MatrixFree(Arc<dyn OperatorAction>),
}

/// Row-distributed operator.
#[derive(Clone)]
pub struct DistributedMatrix {
    id: OperatorId,
    row_map: SharedIndexMap,
    col_map: SharedIndexMap,
    block_size: usize,
    storage: Storage,
}

impl fmt::Debug for DistributedMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedMatrix")
            .field("id", &self.id)
            .field("rows", &self.row_map.n_owned())
            .field("global", &(self.row_map.global_size(), self.col_map.global_size()))
            .field("matrix_free", &self.is_matrix_free())
            .finish()
    }
}

impl DistributedMatrix {
    pub fn id(&self) -> OperatorId {
        self.id
    }

    pub fn row_map(&self) -> &SharedIndexMap {
        &self.row_map
    }

    pub fn col_map(&self) -> &SharedIndexMap {
        &self.col_map
    }

    pub fn comm_id(&self) -> CommId {
        self.row_map.comm_id()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_matrix_free(&self) -> bool {
        matches!(self.storage, Storage::MatrixFree(_))
    }

    /// Global dimensions `(rows, cols)`.
    pub fn global_shape(&self) -> (u64, u64) {
        (self.row_map.global_size(), self.col_map.global_size())
    }

    /// Local number of stored entries (0 for matrix-free handles).
    pub fn nnz(&self) -> usize {
        match &self.storage {
            Storage::Assembled(csr) => csr.vals.len(),
            Storage::MatrixFree(_) => 0,
        }
    }

    /// Columns and values of owned row `r` (offset in the ownership range).
    pub fn get_row(&self, r: usize) -> Option<(&[u64], &[f64])> {
        match &self.storage {
            Storage::Assembled(csr) if r < csr.n_rows() => {
                let span = csr.row(r);
                Some((&csr.cols[span.clone()], &csr.vals[span]))
            }
            _ => None,
        }
    }

    /// Stored entries as `(global row, global col, value)`, owned rows only.
    pub fn to_triplets(&self) -> Vec<(u64, u64, f64)> {
        let Storage::Assembled(csr) = &self.storage else {
            return Vec::new();
        };
        let start = self.row_map.owned_range().start;
        (0..csr.n_rows())
            .flat_map(|r| {
                csr.row(r)
                    .map(move |k| (start + r as u64, csr.cols[k], csr.vals[k]))
            })
            .collect()
    }

    pub(crate) fn csr(&self) -> Option<&CsrRows> {
        match &self.storage {
            Storage::Assembled(csr) => Some(csr),
            Storage::MatrixFree(_) => None,
        }
    }

    /// Local check: the rows and columns describe the same index space.
    pub fn ensure_square(&self) -> Result<(), BridgeError> {
        self.row_map.ensure_same_layout(&self.col_map, "square operator")
    }

    /// Local: the stored diagonal as a vector on the row map.
    ///
    /// # Errors
    /// `InvalidOption` for matrix-free handles, `IndexMapMismatch` for
    /// non-square layouts.
    pub fn diagonal(&self) -> Result<DistributedVector, BridgeError> {
        self.ensure_square()?;
        let csr = self.csr().ok_or_else(|| BridgeError::InvalidOption {
            key: "mat_type".into(),
            reason: format!("{} is matrix-free and stores no diagonal", self.id),
        })?;
        let start = self.row_map.owned_range().start;
        let mut d = DistributedVector::zeros(&self.row_map);
        for (r, slot) in d.owned_mut().iter_mut().enumerate() {
            let g = start + r as u64;
            *slot = csr
                .row(r)
                .find(|&k| csr.cols[k] == g)
                .map_or(0.0, |k| csr.vals[k]);
        }
        Ok(d)
    }

    /// Collective: `y = A x`.
    ///
    /// `x` must live on the column layout and `y` on the row layout. For
    /// matrix-free handles `x` must be built on the column map itself, and
    /// its ghosts are refreshed on a copy before the action runs.
    pub fn mult<C: Communicator>(
        &self,
        x: &DistributedVector,
        y: &mut DistributedVector,
        comm: &C,
    ) -> Result<(), BridgeError> {
        self.row_map.ensure_comm(comm)?;
        self.col_map.ensure_same_layout(x.map(), "operator input")?;
        self.row_map.ensure_same_layout(y.map(), "operator output")?;
        match &self.storage {
            Storage::Assembled(csr) => {
                let mut fetched = vec![0.0; csr.off_cols.len()];
                csr.col_plan.forward(
                    comm,
                    tags::MAT_SCATTER,
                    x.owned(),
                    &mut fetched,
                    InsertMode::Insert,
                )?;
                let xo = x.owned();
                let n_local_cols = xo.len();
                for (r, out) in y.owned_mut().iter_mut().enumerate() {
                    let mut acc = 0.0;
                    for k in csr.row(r) {
                        let s = csr.slots[k];
                        let xv = if s < n_local_cols {
                            xo[s]
                        } else {
                            fetched[s - n_local_cols]
                        };
                        acc += csr.vals[k] * xv;
                    }
                    *out = acc;
                }
                Ok(())
            }
            Storage::MatrixFree(action) => {
                if **x.map() != *self.col_map {
                    return Err(BridgeError::size_mismatch(
                        format!("{}: input vector is not on the column map", self.id),
                        self.col_map.local_size(),
                        x.map().local_size(),
                    ));
                }
                let mut xg = x.clone();
                xg.ghost_update(comm)?;
                let out = action.apply(&from_distributed(&xg))?;
                let owned = y.owned_mut();
                if out.len() != owned.len() {
                    return Err(BridgeError::size_mismatch(
                        format!("{}: operator action output vs. row ownership width", self.id),
                        owned.len(),
                        out.len(),
                    ));
                }
                owned.copy_from_slice(&out);
                Ok(())
            }
        }
    }
}
