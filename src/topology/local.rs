//! The discretization toolkit's rank-local view of a partitioned mesh.
//!
//! Points (cells, faces, edges, vertices) are enumerated locally. Each point
//! carries the toolkit-wide key shared by every rank holding a copy, the
//! owner rank, its cell type and its cone (the points one dimension down,
//! as local indices, in the toolkit's orientation order).

use std::collections::BTreeMap;

use crate::bridge_error::BridgeError;
use crate::index::partition::LocalPartition;
use crate::topology::cell_type::CellType;
use crate::topology::labels::LabelSet;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalTopology {
    keys: Vec<u64>,
    owners: Vec<usize>,
    cell_types: Vec<CellType>,
    cones: Vec<Vec<usize>>,
    labels: LabelSet,
    ghost_layers: usize,
}

impl LocalTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a point and return its local index. Cones may only refer to
    /// points added earlier.
    pub fn add_point(
        &mut self,
        key: u64,
        owner: usize,
        cell_type: CellType,
        cone: &[usize],
    ) -> Result<usize, BridgeError> {
        let p = self.keys.len();
        if let Some(&bad) = cone.iter().find(|&&c| c >= p) {
            return Err(BridgeError::UnsupportedTopology(format!(
                "cone of point {p} refers to point {bad}, which does not exist yet"
            )));
        }
        self.keys.push(key);
        self.owners.push(owner);
        self.cell_types.push(cell_type);
        self.cones.push(cone.to_vec());
        Ok(p)
    }

    /// Record how many ghost layers around the owned cells are already
    /// present in this enumeration.
    pub fn with_ghost_layers(mut self, layers: usize) -> Self {
        self.ghost_layers = layers;
        self
    }

    pub(crate) fn from_raw(
        keys: Vec<u64>,
        owners: Vec<usize>,
        cell_types: Vec<CellType>,
        cones: Vec<Vec<usize>>,
        labels: LabelSet,
        ghost_layers: usize,
    ) -> Self {
        Self {
            keys,
            owners,
            cell_types,
            cones,
            labels,
            ghost_layers,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key(&self, p: usize) -> u64 {
        self.keys[p]
    }

    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    pub fn owner(&self, p: usize) -> usize {
        self.owners[p]
    }

    pub fn cell_type(&self, p: usize) -> CellType {
        self.cell_types[p]
    }

    pub fn cone(&self, p: usize) -> &[usize] {
        &self.cones[p]
    }

    pub fn cones(&self) -> &[Vec<usize>] {
        &self.cones
    }

    pub fn cell_types(&self) -> &[CellType] {
        &self.cell_types
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn labels_mut(&mut self) -> &mut LabelSet {
        &mut self.labels
    }

    pub fn ghost_layers(&self) -> usize {
        self.ghost_layers
    }

    /// Number of points per topological dimension.
    pub fn entity_counts(&self) -> BTreeMap<u8, usize> {
        let mut counts = BTreeMap::new();
        for ct in &self.cell_types {
            *counts.entry(ct.dimension()).or_insert(0) += 1;
        }
        counts
    }

    /// Translator input for the point set: keys and owner hints in local order.
    pub fn partition(&self) -> LocalPartition {
        self.keys
            .iter()
            .copied()
            .zip(self.owners.iter().copied())
            .collect()
    }
}
