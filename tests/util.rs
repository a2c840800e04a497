#![allow(dead_code)]
use ngs_petsc::algs::communicator::{Communicator, ThreadComm};
use ngs_petsc::index::{IndexTranslator, LocalPartition, SharedIndexMap};
use ngs_petsc::matrix::{AssemblyOptions, DistributedMatrix, assemble_to_distributed};

/// Run `f` on `size` in-process ranks; results in rank order.
pub fn run_ranks<R, F>(size: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(ThreadComm) -> R + Sync,
{
    ThreadComm::run(size, f)
}

/// A 1D chain of `n` dofs split into contiguous blocks, one per rank.
/// Every rank lists its owned keys first, then the neighbours of its block
/// as ghosts.
#[derive(Clone, Debug)]
pub struct Chain {
    pub n: usize,
    pub start: usize,
    pub end: usize,
    pub left: Option<usize>,
    pub right: Option<usize>,
    pub owners: Vec<usize>,
}

impl Chain {
    pub fn new(n: usize, rank: usize, size: usize) -> Self {
        let owners: Vec<usize> = (0..n).map(|k| (k * size / n).min(size - 1)).collect();
        let start = owners.iter().position(|&o| o == rank).unwrap_or(n);
        let end = owners.iter().rposition(|&o| o == rank).map_or(start, |p| p + 1);
        let left = (start > 0 && start < end).then(|| start - 1);
        let right = (end < n && start < end).then_some(end);
        Self {
            n,
            start,
            end,
            left,
            right,
            owners,
        }
    }

    pub fn n_owned(&self) -> usize {
        self.end - self.start
    }

    pub fn keys(&self) -> Vec<usize> {
        (self.start..self.end).chain(self.left).chain(self.right).collect()
    }

    pub fn partition(&self) -> LocalPartition {
        let mut p = LocalPartition::new();
        for k in self.keys() {
            p.push(k as u64, self.owners[k]);
        }
        p
    }

    /// Local index of global key `k`, if held.
    pub fn local(&self, k: usize) -> Option<usize> {
        self.keys().iter().position(|&x| x == k)
    }

    pub fn map<C: Communicator>(&self, comm: &C) -> SharedIndexMap {
        IndexTranslator::build(&self.partition(), comm).unwrap()
    }

    /// Row-wise `tridiag(-1, 2, -1)` for the owned rows, local indices.
    pub fn laplacian_rows(&self) -> Vec<(usize, usize, f64)> {
        let mut t = Vec::new();
        for k in self.start..self.end {
            let r = self.local(k).unwrap();
            t.push((r, r, 2.0));
            if k > 0 {
                t.push((r, self.local(k - 1).unwrap(), -1.0));
            }
            if k + 1 < self.n {
                t.push((r, self.local(k + 1).unwrap(), -1.0));
            }
        }
        t
    }

    /// Element-wise `tridiag(-1, 2, -1)`: element `(k, k+1)` is assembled by
    /// the owner of `k`, so rows of the right ghost arrive from the left
    /// neighbour.
    pub fn laplacian_elements(&self) -> Vec<(usize, usize, f64)> {
        let mut t = Vec::new();
        for k in self.start..self.end {
            if k + 1 == self.n {
                continue;
            }
            let (a, b) = (self.local(k).unwrap(), self.local(k + 1).unwrap());
            t.extend([(a, a, 1.0), (a, b, -1.0), (b, a, -1.0), (b, b, 1.0)]);
        }
        // boundary terms for a nonsingular operator
        if self.start == 0 && self.start < self.end {
            t.push((0, 0, 1.0));
        }
        if self.end == self.n && self.start < self.end {
            let r = self.local(self.n - 1).unwrap();
            t.push((r, r, 1.0));
        }
        t
    }

    pub fn laplacian<C: Communicator>(&self, comm: &C) -> (SharedIndexMap, DistributedMatrix) {
        let map = self.map(comm);
        let a = assemble_to_distributed(
            &self.laplacian_rows(),
            &map,
            &map,
            comm,
            &AssemblyOptions::default(),
        )
        .unwrap();
        (map, a)
    }

    /// Matrix-free `tridiag(-1, 2, -1)` on the local array.
    pub fn laplacian_action(&self) -> impl Fn(&[f64]) -> Vec<f64> + Send + Sync + 'static {
        let rows: Vec<(usize, Option<usize>, Option<usize>)> = (self.start..self.end)
            .map(|k| {
                (
                    self.local(k).unwrap(),
                    k.checked_sub(1).and_then(|l| self.local(l)),
                    self.local(k + 1),
                )
            })
            .collect();
        move |x: &[f64]| {
            rows.iter()
                .map(|&(i, l, r)| 2.0 * x[i] - l.map_or(0.0, |l| x[l]) - r.map_or(0.0, |r| x[r]))
                .collect()
        }
    }
}

pub fn assert_close(got: &[f64], want: &[f64], tol: f64) {
    assert_eq!(got.len(), want.len(), "length differs");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!((g - w).abs() <= tol, "entry {i}: got {g}, want {w} (tol {tol})");
    }
}
