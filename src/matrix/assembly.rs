//! Assembly of local triplets into row-owned CSR storage.
//!
//! Rows held as ghosts are stashed and shipped to their owner, which sums
//! them after its own contributions in source-rank order. Explicit zeros stay
//! in the pattern. Entries touching constrained rows or columns are dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::algs::communicator::{Communicator, tags};
use crate::algs::exchange::{agree, exchange_all};
use crate::algs::wire::WireEntry;
use crate::bridge_error::BridgeError;
use crate::index::map::{EntryKind, SharedIndexMap};
use crate::index::range::OwnershipRange;
use crate::matrix::{CsrRows, DistributedMatrix, OperatorId, Storage};
use crate::overlap::scatter::ScatterPlan;

/// Options for [`assemble_to_distributed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AssemblyOptions {
    /// Collectively reject matrices with an owned row without entries.
    pub validate_pattern: bool,
    /// Block size of the operator; must divide the owned row and column counts.
    pub block_size: usize,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            validate_pattern: false,
            block_size: 1,
        }
    }
}

/// Collective: assemble local `(row, col, value)` triplets, in local row-map
/// and column-map indices, into a distributed matrix.
///
/// # Errors
/// Local checks, before any communication: `CommunicatorMismatch`,
/// `IndexMapMismatch` for indices outside the maps or a block size that does
/// not divide the owned sizes. Collectively: `SingularPattern` on every rank
/// when `validate_pattern` is set and some rank owns an empty row.
pub fn assemble_to_distributed<C: Communicator>(
    triplets: &[(usize, usize, f64)],
    row_map: &SharedIndexMap,
    col_map: &SharedIndexMap,
    comm: &C,
    options: &AssemblyOptions,
) -> Result<DistributedMatrix, BridgeError> {
    row_map.ensure_comm(comm)?;
    col_map.ensure_comm(comm)?;
    check_block_size(options.block_size, row_map.n_owned(), "owned rows")?;
    check_block_size(options.block_size, col_map.n_owned(), "owned columns")?;

    let me = comm.rank();
    let rows = row_map.owned_range();
    let mut stash: Vec<Vec<WireEntry>> = vec![Vec::new(); comm.size()];
    let mut owned_rows: Vec<BTreeMap<u64, f64>> = vec![BTreeMap::new(); rows.width()];
    let mut dropped = 0usize;
    for &(r, c, v) in triplets {
        let (Some(rk), Some(_)) = (row_map.kind(r), col_map.kind(c)) else {
            return Err(BridgeError::size_mismatch(
                format!("triplet ({r}, {c}) vs. local map sizes"),
                row_map.local_size().min(col_map.local_size()),
                r.max(c),
            ));
        };
        let (Some(rg), Some(cg)) = (row_map.global(r), col_map.global(c)) else {
            dropped += 1;
            continue;
        };
        match rk {
            EntryKind::Owned => {
                *owned_rows[(rg - rows.start) as usize].entry(cg).or_insert(0.0) += v;
            }
            EntryKind::Ghost { owner } => stash[owner].push(WireEntry::new(rg, cg, v)),
            EntryKind::Constrained => dropped += 1,
        }
    }
    let stashed: usize = stash.iter().map(Vec::len).sum();
    let incoming = exchange_all(comm, tags::MAT_STASH, stash)?;
    let mut bad = None;
    for (src, entries) in incoming.iter().enumerate() {
        if src == me {
            continue;
        }
        for e in entries {
            match rows.local_offset(e.row()) {
                Some(off) => *owned_rows[off].entry(e.col()).or_insert(0.0) += e.val(),
                None => {
                    bad.get_or_insert(BridgeError::partition(
                        me,
                        format!("rank {src} stashed row {} outside owned rows {rows}", e.row()),
                    ));
                }
            }
        }
    }
    agree(comm, bad.map_or(Ok(()), Err), |ranks| {
        BridgeError::partition(me, format!("assembly stash rejected by ranks {ranks:?}"))
    })?;
    log::debug!(
        "[rank {me}] assembly: {} local triplets, {stashed} stashed, {dropped} constrained dropped",
        triplets.len()
    );

    let rows_vec: Vec<Vec<(u64, f64)>> = owned_rows
        .into_iter()
        .map(|row| row.into_iter().collect())
        .collect();
    let id = OperatorId::fresh();
    let csr = build_csr(rows_vec, col_map, comm)?;
    if options.validate_pattern {
        validate_pattern(&csr, id, rows, comm)?;
    }
    Ok(DistributedMatrix {
        id,
        row_map: Arc::clone(row_map),
        col_map: Arc::clone(col_map),
        block_size: options.block_size,
        storage: Storage::Assembled(Arc::new(csr)),
    })
}

fn check_block_size(bs: usize, n: usize, what: &str) -> Result<(), BridgeError> {
    if bs == 0 || n % bs != 0 {
        return Err(BridgeError::size_mismatch(
            format!("block size {bs} vs. {what}"),
            n - n % bs.max(1),
            n,
        ));
    }
    Ok(())
}

/// Collective: every rank learns the lowest empty owned row across ranks.
fn validate_pattern<C: Communicator>(
    csr: &CsrRows,
    id: OperatorId,
    rows: OwnershipRange,
    comm: &C,
) -> Result<(), BridgeError> {
    let first_empty = (0..csr.n_rows())
        .find(|&r| csr.row(r).is_empty())
        .map_or(u64::MAX, |r| rows.start + r as u64);
    let lowest = comm
        .allgather_u64(first_empty)?
        .into_iter()
        .min()
        .unwrap_or(u64::MAX);
    if lowest != u64::MAX {
        log::warn!("[rank {}] {id}: owned row {lowest} has no entries", comm.rank());
        return Err(BridgeError::SingularPattern {
            operator: id,
            global: lowest,
        });
    }
    Ok(())
}

/// Collective: CSR storage from sorted global rows, with the column scatter
/// plan for off-process columns.
pub(crate) fn build_csr<C: Communicator>(
    rows: Vec<Vec<(u64, f64)>>,
    col_map: &SharedIndexMap,
    comm: &C,
) -> Result<CsrRows, BridgeError> {
    let me = comm.rank();
    let cols_owned = col_map.owned_range();
    let layout = col_map.layout();

    let mut off_cols: Vec<u64> = rows
        .iter()
        .flatten()
        .map(|&(c, _)| c)
        .filter(|&c| !cols_owned.contains(c))
        .collect();
    off_cols.sort_unstable();
    off_cols.dedup();

    let mut requests: Vec<Vec<(u64, usize)>> = vec![Vec::new(); comm.size()];
    let mut local = Ok(());
    for (k, &c) in off_cols.iter().enumerate() {
        match layout.owner_of(c) {
            Some(owner) => requests[owner].push((c, k)),
            None => {
                local = Err(BridgeError::partition(
                    me,
                    format!("column {c} lies outside the global column space"),
                ));
                break;
            }
        }
    }
    agree(comm, local, |ranks| {
        BridgeError::partition(me, format!("column resolution failed on ranks {ranks:?}"))
    })?;
    let plan = ScatterPlan::from_requests(comm, tags::MAT_SCATTER_PLAN, cols_owned, &requests);
    let col_plan = agree(comm, plan, |ranks| {
        BridgeError::partition(me, format!("column scatter plan rejected by ranks {ranks:?}"))
    })?;

    let n_local_cols = cols_owned.width();
    let mut row_ptr = Vec::with_capacity(rows.len() + 1);
    row_ptr.push(0);
    let nnz = rows.iter().map(Vec::len).sum();
    let mut cols = Vec::with_capacity(nnz);
    let mut slots = Vec::with_capacity(nnz);
    let mut vals = Vec::with_capacity(nnz);
    for row in rows {
        for (c, v) in row {
            let slot = match cols_owned.local_offset(c) {
                Some(off) => off,
                None => n_local_cols + off_cols.binary_search(&c).unwrap_or_default(),
            };
            cols.push(c);
            slots.push(slot);
            vals.push(v);
        }
        row_ptr.push(cols.len());
    }
    log::debug!(
        "[rank {me}] csr: {} rows, {} entries, {} off-process columns",
        row_ptr.len() - 1,
        cols.len(),
        off_cols.len()
    );
    Ok(CsrRows {
        row_ptr,
        cols,
        slots,
        vals,
        off_cols,
        col_plan,
    })
}

impl DistributedMatrix {
    /// Collective: the identity on `map`.
    pub fn identity<C: Communicator>(map: &SharedIndexMap, comm: &C) -> Result<Self, BridgeError> {
        map.ensure_comm(comm)?;
        let start = map.owned_range().start;
        let rows = (0..map.n_owned())
            .map(|r| vec![(start + r as u64, 1.0)])
            .collect();
        let csr = build_csr(rows, map, comm)?;
        Ok(DistributedMatrix {
            id: OperatorId::fresh(),
            row_map: Arc::clone(map),
            col_map: Arc::clone(map),
            block_size: 1,
            storage: Storage::Assembled(Arc::new(csr)),
        })
    }

    /// Collective: `A - sigma * B`, with `B` the identity when `None`. The
    /// pattern is the union of both patterns; the diagonal is always present.
    ///
    /// # Errors
    /// `InvalidOption` when either operand is matrix-free; `IndexMapMismatch`
    /// or `CommunicatorMismatch` for incompatible layouts.
    pub fn shifted<C: Communicator>(
        &self,
        sigma: f64,
        b: Option<&DistributedMatrix>,
        comm: &C,
    ) -> Result<DistributedMatrix, BridgeError> {
        self.row_map.ensure_comm(comm)?;
        self.ensure_square()?;
        let not_assembled = |m: &DistributedMatrix| BridgeError::InvalidOption {
            key: "mat_type".into(),
            reason: format!("{} is matrix-free and cannot be shifted", m.id),
        };
        let a = self.csr().ok_or_else(|| not_assembled(self))?;
        let b_rows = match b {
            Some(b) => {
                b.row_map.ensure_same_layout(&self.row_map, "shift operand rows")?;
                b.col_map.ensure_same_layout(&self.col_map, "shift operand columns")?;
                Some(b.csr().ok_or_else(|| not_assembled(b))?)
            }
            None => None,
        };
        let start = self.row_map.owned_range().start;
        let mut rows = Vec::with_capacity(a.n_rows());
        for r in 0..a.n_rows() {
            let g = start + r as u64;
            let mut row: BTreeMap<u64, f64> = a.row(r).map(|k| (a.cols[k], a.vals[k])).collect();
            match b_rows {
                Some(bm) => {
                    for k in bm.row(r) {
                        *row.entry(bm.cols[k]).or_insert(0.0) -= sigma * bm.vals[k];
                    }
                    row.entry(g).or_insert(0.0);
                }
                None => *row.entry(g).or_insert(0.0) -= sigma,
            }
            rows.push(row.into_iter().collect());
        }
        let csr = build_csr(rows, &self.col_map, comm)?;
        Ok(DistributedMatrix {
            id: OperatorId::fresh(),
            row_map: Arc::clone(&self.row_map),
            col_map: Arc::clone(&self.col_map),
            block_size: self.block_size,
            storage: Storage::Assembled(Arc::new(csr)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, ThreadComm};
    use crate::index::partition::LocalPartition;
    use crate::index::translator::IndexTranslator;
    use crate::vector::DistributedVector;

    #[test]
    fn duplicates_sum_and_zeros_stay() {
        let map = IndexTranslator::build(&LocalPartition::serial(2), &NoComm).unwrap();
        let a = assemble_to_distributed(
            &[(0, 0, 1.0), (0, 0, 2.0), (0, 1, 0.0), (1, 1, 4.0)],
            &map,
            &map,
            &NoComm,
            &AssemblyOptions::default(),
        )
        .unwrap();
        assert_eq!(a.to_triplets(), vec![(0, 0, 3.0), (0, 1, 0.0), (1, 1, 4.0)]);
        assert_eq!(a.nnz(), 3);
    }

    #[test]
    fn empty_row_is_singular_on_every_rank() {
        let out = ThreadComm::run(2, |comm| {
            let p: LocalPartition = [(comm.rank() as u64, comm.rank())].into_iter().collect();
            let map = IndexTranslator::build(&p, &comm).unwrap();
            let trips = if comm.rank() == 0 { vec![(0, 0, 1.0)] } else { vec![] };
            let opts = AssemblyOptions {
                validate_pattern: true,
                ..Default::default()
            };
            assemble_to_distributed(&trips, &map, &map, &comm, &opts)
        });
        for r in out {
            assert!(matches!(r, Err(BridgeError::SingularPattern { global: 1, .. })));
        }
    }

    #[test]
    fn block_size_must_divide_owned_rows() {
        let map = IndexTranslator::build(&LocalPartition::serial(3), &NoComm).unwrap();
        let opts = AssemblyOptions {
            block_size: 2,
            ..Default::default()
        };
        assert!(matches!(
            assemble_to_distributed(&[], &map, &map, &NoComm, &opts),
            Err(BridgeError::IndexMapMismatch { .. })
        ));
    }

    #[test]
    fn constrained_rows_and_columns_are_dropped() {
        let p = LocalPartition::serial(3)
            .with_free_mask(&[true, false, true])
            .unwrap();
        let map = IndexTranslator::build(&p, &NoComm).unwrap();
        let a = assemble_to_distributed(
            &[(0, 0, 1.0), (0, 1, 5.0), (1, 1, 1.0), (2, 2, 2.0)],
            &map,
            &map,
            &NoComm,
            &AssemblyOptions::default(),
        )
        .unwrap();
        assert_eq!(a.to_triplets(), vec![(0, 0, 1.0), (1, 1, 2.0)]);
    }

    #[test]
    fn ghost_rows_are_summed_by_owner_and_columns_fetched() {
        // 1D chain 0-1-2-3, rank 0 owns 0,1 and ghosts 2; rank 1 owns 2,3 and ghosts 1
        let out = ThreadComm::run(2, |comm| {
            let p: LocalPartition = if comm.rank() == 0 {
                [(0, 0), (1, 0), (2, 1)].into_iter().collect()
            } else {
                [(2, 1), (3, 1), (1, 0)].into_iter().collect()
            };
            let map = IndexTranslator::build(&p, &comm).unwrap();
            // each rank adds half of the shared coupling on both sides
            let trips = if comm.rank() == 0 {
                vec![(0, 0, 1.0), (1, 1, 1.0), (1, 2, -0.5), (2, 1, -0.5)]
            } else {
                vec![(0, 0, 1.0), (1, 1, 1.0), (0, 2, -0.5), (2, 0, -0.5)]
            };
            let a = assemble_to_distributed(&trips, &map, &map, &comm, &AssemblyOptions::default())
                .unwrap();
            let x = DistributedVector::from_owned(&map, &[1.0, 2.0]).unwrap();
            let mut y = x.duplicate();
            a.mult(&x, &mut y, &comm).unwrap();
            (a.to_triplets(), y.owned().to_vec())
        });
        assert_eq!(out[0].0, vec![(0, 0, 1.0), (1, 1, 1.0), (1, 2, -1.0)]);
        assert_eq!(out[1].0, vec![(2, 1, -1.0), (2, 2, 1.0), (3, 3, 1.0)]);
        // x = [1, 2, 1, 2]
        assert_eq!(out[0].1, vec![1.0, 1.0]);
        assert_eq!(out[1].1, vec![-1.0, 2.0]);
    }

    #[test]
    fn shift_subtracts_on_the_diagonal() {
        let map = IndexTranslator::build(&LocalPartition::serial(2), &NoComm).unwrap();
        let a = assemble_to_distributed(
            &[(0, 1, 1.0), (1, 1, 3.0)],
            &map,
            &map,
            &NoComm,
            &AssemblyOptions::default(),
        )
        .unwrap();
        let s = a.shifted(2.0, None, &NoComm).unwrap();
        assert_eq!(s.to_triplets(), vec![(0, 0, -2.0), (0, 1, 1.0), (1, 1, 1.0)]);
        assert_ne!(s.id(), a.id());
    }
}
