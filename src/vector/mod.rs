//! Vector adapter: local coefficient arrays ⇄ distributed vectors.
//!
//! A [`DistributedVector`] owns a contiguous buffer laid out
//! `[owned..., ghosts...]` (see [`IndexMap`](crate::index::IndexMap) for
//! the order) and shares the map it was built from. Conversions are pure
//! copies. Ghost values change only when the caller asks for a halo
//! exchange ([`DistributedVector::ghost_update`]); no conversion
//! synchronizes implicitly.

use std::sync::Arc;

use crate::algs::communicator::{CommId, Communicator, tags};
use crate::bridge_error::BridgeError;
use crate::index::map::SharedIndexMap;
use crate::overlap::scatter::InsertMode;

#[derive(Clone, Debug)]
pub struct DistributedVector {
    map: SharedIndexMap,
    data: Vec<f64>,
}

/// Local: copy a local array (local enumeration order, ghosts included)
/// into a distributed vector. Constrained entries are skipped.
///
/// # Errors
/// `IndexMapMismatch` if `local.len()` differs from the map's local size.
pub fn to_distributed(local: &[f64], map: &SharedIndexMap) -> Result<DistributedVector, BridgeError> {
    if local.len() != map.local_size() {
        return Err(BridgeError::size_mismatch(
            "local array vs. index map",
            map.local_size(),
            local.len(),
        ));
    }
    let data = map.slot_locals().iter().map(|&l| local[l]).collect();
    Ok(DistributedVector {
        map: Arc::clone(map),
        data,
    })
}

/// Local: the vector in local enumeration order. Constrained entries are 0.
pub fn from_distributed(v: &DistributedVector) -> Vec<f64> {
    let mut out = vec![0.0; v.map.local_size()];
    v.scatter_local(&mut out);
    out
}

/// Local: like [`from_distributed`], but writes into `out` and leaves
/// constrained entries untouched (boundary values survive).
pub fn from_distributed_into(v: &DistributedVector, out: &mut [f64]) -> Result<(), BridgeError> {
    if out.len() != v.map.local_size() {
        return Err(BridgeError::size_mismatch(
            "local array vs. index map",
            v.map.local_size(),
            out.len(),
        ));
    }
    v.scatter_local(out);
    Ok(())
}

impl DistributedVector {
    /// A zero vector on `map`.
    pub fn zeros(map: &SharedIndexMap) -> Self {
        Self {
            map: Arc::clone(map),
            data: vec![0.0; map.buffer_len()],
        }
    }

    /// A vector from its owned segment; ghosts start at zero.
    pub fn from_owned(map: &SharedIndexMap, owned: &[f64]) -> Result<Self, BridgeError> {
        if owned.len() != map.n_owned() {
            return Err(BridgeError::size_mismatch(
                "owned segment vs. ownership range",
                map.n_owned(),
                owned.len(),
            ));
        }
        let mut v = Self::zeros(map);
        v.owned_mut().copy_from_slice(owned);
        Ok(v)
    }

    /// A zero vector with the same map.
    pub fn duplicate(&self) -> Self {
        Self::zeros(&self.map)
    }

    fn scatter_local(&self, out: &mut [f64]) {
        for (&l, &v) in self.map.slot_locals().iter().zip(&self.data) {
            out[l] = v;
        }
    }

    pub fn map(&self) -> &SharedIndexMap {
        &self.map
    }

    pub fn comm_id(&self) -> CommId {
        self.map.comm_id()
    }

    pub fn global_size(&self) -> u64 {
        self.map.global_size()
    }

    pub fn owned(&self) -> &[f64] {
        &self.data[..self.map.n_owned()]
    }

    pub fn owned_mut(&mut self) -> &mut [f64] {
        let n = self.map.n_owned();
        &mut self.data[..n]
    }

    pub fn ghosts(&self) -> &[f64] {
        &self.data[self.map.n_owned()..]
    }

    /// The whole `[owned | ghosts]` buffer.
    pub fn buffer(&self) -> &[f64] {
        &self.data
    }

    /// Set every ghost slot (e.g. to zero before accumulating into ghosts).
    pub fn set_ghosts(&mut self, value: f64) {
        let n = self.map.n_owned();
        self.data[n..].fill(value);
    }

    pub(crate) fn ghosts_mut(&mut self) -> &mut [f64] {
        let n = self.map.n_owned();
        &mut self.data[n..]
    }

    /// Collective over the halo neighbours: copy owner values into ghosts.
    pub fn ghost_update<C: Communicator>(&mut self, comm: &C) -> Result<(), BridgeError> {
        self.map.ensure_comm(comm)?;
        let n = self.map.n_owned();
        let (owned, ghosts) = self.data.split_at_mut(n);
        self.map
            .halo()
            .forward(comm, tags::HALO_FORWARD, owned, ghosts, InsertMode::Insert)
    }

    /// Collective over the halo neighbours: add ghost contributions into
    /// their owners. Ghost slots keep their values.
    pub fn ghost_accumulate<C: Communicator>(&mut self, comm: &C) -> Result<(), BridgeError> {
        self.map.ensure_comm(comm)?;
        let n = self.map.n_owned();
        let (owned, ghosts) = self.data.split_at_mut(n);
        self.map
            .halo()
            .reverse(comm, tags::HALO_REVERSE, owned, ghosts, InsertMode::Add)
    }

    /// Local check: both vectors share communicator and ownership ranges.
    pub fn ensure_compatible(&self, other: &DistributedVector) -> Result<(), BridgeError> {
        if Arc::ptr_eq(&self.map, &other.map) {
            return Ok(());
        }
        self.map.ensure_same_layout(&other.map, "vector operation")
    }

    /// Collective: global inner product of the owned segments.
    pub fn dot<C: Communicator>(&self, other: &DistributedVector, comm: &C) -> Result<f64, BridgeError> {
        self.map.ensure_comm(comm)?;
        self.ensure_compatible(other)?;
        let local: f64 = self
            .owned()
            .iter()
            .zip(other.owned())
            .map(|(a, b)| a * b)
            .sum();
        Ok(comm.allreduce_sum(&[local])?[0])
    }

    /// Collective: Euclidean norm.
    pub fn norm<C: Communicator>(&self, comm: &C) -> Result<f64, BridgeError> {
        Ok(self.dot(self, comm)?.sqrt())
    }

    /// Collective: several inner products with one reduction.
    pub fn mdot<C: Communicator>(
        &self,
        others: &[DistributedVector],
        comm: &C,
    ) -> Result<Vec<f64>, BridgeError> {
        self.map.ensure_comm(comm)?;
        let mut local = Vec::with_capacity(others.len());
        for o in others {
            self.ensure_compatible(o)?;
            local.push(
                self.owned()
                    .iter()
                    .zip(o.owned())
                    .map(|(a, b)| a * b)
                    .sum(),
            );
        }
        comm.allreduce_sum(&local)
    }

    /// `self += alpha * x` on the owned segment.
    pub fn axpy(&mut self, alpha: f64, x: &DistributedVector) -> Result<(), BridgeError> {
        self.ensure_compatible(x)?;
        for (y, x) in self.owned_mut().iter_mut().zip(x.owned()) {
            *y += alpha * x;
        }
        Ok(())
    }

    /// `self = x + beta * self` on the owned segment.
    pub fn aypx(&mut self, beta: f64, x: &DistributedVector) -> Result<(), BridgeError> {
        self.ensure_compatible(x)?;
        for (y, x) in self.owned_mut().iter_mut().zip(x.owned()) {
            *y = x + beta * *y;
        }
        Ok(())
    }

    /// `self = alpha * x + beta * y` on the owned segment.
    pub fn waxpby(
        &mut self,
        alpha: f64,
        x: &DistributedVector,
        beta: f64,
        y: &DistributedVector,
    ) -> Result<(), BridgeError> {
        self.ensure_compatible(x)?;
        self.ensure_compatible(y)?;
        let n = self.map.n_owned();
        for i in 0..n {
            self.data[i] = alpha * x.data[i] + beta * y.data[i];
        }
        Ok(())
    }

    pub fn scale(&mut self, alpha: f64) {
        for y in self.owned_mut() {
            *y *= alpha;
        }
    }

    pub fn set(&mut self, value: f64) {
        self.owned_mut().fill(value);
    }

    /// Copy the owned segment of `x`.
    pub fn copy_from(&mut self, x: &DistributedVector) -> Result<(), BridgeError> {
        self.ensure_compatible(x)?;
        let n = self.map.n_owned();
        self.data[..n].copy_from_slice(&x.data[..n]);
        Ok(())
    }
}
