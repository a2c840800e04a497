//! Distributed mesh adapter.
//!
//! [`import_mesh`] turns the discretization toolkit's [`LocalTopology`] and
//! the point [`IndexMap`] built from it into a [`DistributedMesh`];
//! [`export_mesh`] turns it back. Local point order is kept as given, so a
//! round trip reproduces the topology exactly: same entity counts, same
//! cones, same labels.
//!
//! Ghost layers are grown collectively by vertex-star overlap (see
//! [`DistributedMesh::add_ghost_layer`]). Growing never changes the global
//! index of an existing point, it only appends ghost points.
//!
//! [`DistributedMesh::pull_back`] is the inverse distribution: data held in
//! algebra order (owned points, ascending global number) goes back to the
//! imported topology's local order, ghosts filled from their owners.

mod overlap;

use std::collections::BTreeSet;

use bytemuck::Pod;

use crate::algs::communicator::{CommId, Communicator, tags};
use crate::bridge_error::BridgeError;
use crate::index::map::{EntryKind, SharedIndexMap};
use crate::topology::cell_type::CellType;
use crate::topology::labels::LabelSet;
use crate::topology::local::LocalTopology;

/// Options for [`import_mesh`].
///
/// `purify_to_tets` and `quad` mirror the toolkit's mesh flags. The cell
/// transforms themselves run on the toolkit side before import; here a flag
/// set to `true` becomes a shape requirement on the imported cells. A flag
/// left as `None` was not given: import logs a warning and requires nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    /// Ghost layers the distributed mesh must carry around each rank's
    /// owned cells.
    pub ghost_layers: usize,
    /// Every 3D cell is a tetrahedron.
    pub purify_to_tets: Option<bool>,
    /// Every 2D cell is a quadrilateral and every 3D cell a hexahedron.
    /// Takes precedence over `purify_to_tets`.
    pub quad: Option<bool>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            ghost_layers: 1,
            purify_to_tets: None,
            quad: None,
        }
    }
}

impl ImportOptions {
    /// Shape required of cells of dimension `dim`, if any.
    fn required_shape(&self, dim: u8) -> Option<(CellType, &'static str)> {
        match (dim, self.quad, self.purify_to_tets) {
            (2, Some(true), _) => Some((CellType::Quadrilateral, "quad")),
            (3, Some(true), _) => Some((CellType::Hexahedron, "quad")),
            (3, _, Some(true)) => Some((CellType::Tetrahedron, "purify_to_tets")),
            _ => None,
        }
    }

    fn warn_missing_flags(&self, rank: usize) {
        if self.purify_to_tets.is_none() {
            log::warn!(
                "[rank {rank}] no purify_to_tets flag given, cells are not required to be tetrahedra"
            );
        }
        if self.quad.is_none() {
            log::warn!(
                "[rank {rank}] no quad flag given, cells are not required to be quadrilaterals"
            );
        }
    }
}

/// Partitioned mesh on the algebra side.
#[derive(Clone, Debug)]
pub struct DistributedMesh {
    map: SharedIndexMap,
    cell_types: Vec<CellType>,
    cones: Vec<Vec<usize>>,
    supports: Vec<Vec<usize>>,
    labels: LabelSet,
    ghost_layers: usize,
    input_points: usize,
}

/// Collective: import a rank-local topology.
///
/// `map` must be the point map of `topology` (one entry per point, same keys
/// and owners, no constrained points), typically
/// `IndexTranslator::build(&topology.partition(), comm)`. Missing ghost
/// layers are added collectively until the mesh carries
/// `options.ghost_layers`.
///
/// # Errors
/// `CommunicatorMismatch` and `IndexMapMismatch` when `map` does not belong
/// to `comm` or `topology`; `UnsupportedTopology` for cell shapes without an
/// algebra-side representation, for cones that do not point to lower
/// dimensions and for cells that break a `purify_to_tets` or `quad`
/// requirement. These checks are local and run before any communication.
pub fn import_mesh<C: Communicator>(
    topology: &LocalTopology,
    map: &SharedIndexMap,
    comm: &C,
    options: &ImportOptions,
) -> Result<DistributedMesh, BridgeError> {
    map.ensure_comm(comm)?;
    validate_against_map(topology, map)?;
    validate_shapes(topology, options)?;
    options.warn_missing_flags(comm.rank());

    let mut mesh = DistributedMesh::from_parts(
        SharedIndexMap::clone(map),
        topology.cell_types().to_vec(),
        topology.cones().to_vec(),
        topology.labels().clone(),
        topology.ghost_layers(),
        topology.len(),
    );

    // every rank must take the same number of growth steps
    let have = comm
        .allgather_u64(topology.ghost_layers() as u64)?
        .into_iter()
        .min()
        .unwrap_or(0) as usize;
    for _ in have..options.ghost_layers {
        mesh = mesh.add_ghost_layer(comm)?;
    }
    log::debug!(
        "[rank {}] imported mesh: {} points ({} owned), {} ghost layer(s)",
        comm.rank(),
        mesh.n_points(),
        mesh.map.n_owned(),
        mesh.ghost_layers
    );
    Ok(mesh)
}

/// Local: the rank-local topology of a distributed mesh.
///
/// Every point the handle holds is exported, including ghost points that
/// import or [`DistributedMesh::add_ghost_layer`] appended, and the result
/// records the handle's ghost-layer count. The first points are those of the
/// imported topology, unchanged and in their original order, so exporting a
/// mesh imported without growth reproduces its input exactly.
pub fn export_mesh(mesh: &DistributedMesh) -> LocalTopology {
    let map = &mesh.map;
    let n = mesh.n_points();
    LocalTopology::from_raw(
        (0..n).map(|p| map.key(p).unwrap_or_default()).collect(),
        (0..n).map(|p| map.owner(p).unwrap_or(map.rank())).collect(),
        mesh.cell_types.clone(),
        mesh.cones.clone(),
        mesh.labels.clone(),
        mesh.ghost_layers,
    )
}

fn validate_against_map(topology: &LocalTopology, map: &SharedIndexMap) -> Result<(), BridgeError> {
    if map.local_size() != topology.len() {
        return Err(BridgeError::size_mismatch(
            "mesh points vs. point map",
            topology.len(),
            map.local_size(),
        ));
    }
    for p in 0..topology.len() {
        if map.key(p) != Some(topology.key(p)) {
            return Err(BridgeError::size_mismatch(
                format!("key of mesh point {p}"),
                topology.key(p) as usize,
                map.key(p).unwrap_or_default() as usize,
            ));
        }
        match map.kind(p) {
            Some(EntryKind::Constrained) | None => {
                return Err(BridgeError::size_mismatch(
                    format!("mesh point {p} has no global number"),
                    1,
                    0,
                ));
            }
            _ => {}
        }
        if map.owner(p) != Some(topology.owner(p)) {
            return Err(BridgeError::size_mismatch(
                format!("owner of mesh point {p}"),
                topology.owner(p),
                map.owner(p).unwrap_or_default(),
            ));
        }
    }
    Ok(())
}

fn validate_shapes(topology: &LocalTopology, options: &ImportOptions) -> Result<(), BridgeError> {
    for p in 0..topology.len() {
        let ct = topology.cell_type(p).to_supported()?;
        if let Some((want, flag)) = options.required_shape(ct.dimension()) {
            if ct != want {
                return Err(BridgeError::UnsupportedTopology(format!(
                    "point {p} is a {ct:?} but {flag} requires {want:?} cells"
                )));
            }
        }
        for &c in topology.cone(p) {
            let sub = topology.cell_type(c);
            if sub.dimension() >= ct.dimension() {
                return Err(BridgeError::UnsupportedTopology(format!(
                    "point {p} ({ct:?}) has cone point {c} of dimension {}",
                    sub.dimension()
                )));
            }
        }
    }
    Ok(())
}

impl DistributedMesh {
    fn from_parts(
        map: SharedIndexMap,
        cell_types: Vec<CellType>,
        cones: Vec<Vec<usize>>,
        labels: LabelSet,
        ghost_layers: usize,
        input_points: usize,
    ) -> Self {
        let mut supports = vec![Vec::new(); cones.len()];
        for (p, cone) in cones.iter().enumerate() {
            for &c in cone {
                supports[c].push(p);
            }
        }
        Self {
            map,
            cell_types,
            cones,
            supports,
            labels,
            ghost_layers,
            input_points,
        }
    }

    /// Collective: a new mesh with one more ghost layer. Existing points keep
    /// their local index and global number.
    pub fn add_ghost_layer<C: Communicator>(&self, comm: &C) -> Result<DistributedMesh, BridgeError> {
        self.map.ensure_comm(comm)?;
        if comm.size() == 1 {
            let mut grown = self.clone();
            grown.ghost_layers += 1;
            return Ok(grown);
        }
        overlap::grow_one_layer(self, comm)
    }

    pub fn map(&self) -> &SharedIndexMap {
        &self.map
    }

    pub fn comm_id(&self) -> CommId {
        self.map.comm_id()
    }

    pub fn n_points(&self) -> usize {
        self.cell_types.len()
    }

    pub fn ghost_layers(&self) -> usize {
        self.ghost_layers
    }

    /// Points of the imported topology; they come first in local order.
    pub fn input_points(&self) -> usize {
        self.input_points
    }

    /// Collective over the halo neighbours: the inverse distribution.
    ///
    /// `owned` holds one record per owned point in algebra order (ascending
    /// global number, the owned segment of a point vector). The result has
    /// one record per point of the imported topology, in its local order;
    /// records of points owned elsewhere are fetched from their owners.
    ///
    /// # Errors
    /// `CommunicatorMismatch` for a foreign `comm`, `IndexMapMismatch` when
    /// `owned` is not as long as the owned point count.
    pub fn pull_back<T: Pod, C: Communicator>(
        &self,
        owned: &[T],
        comm: &C,
    ) -> Result<Vec<T>, BridgeError> {
        self.map.ensure_comm(comm)?;
        let n_owned = self.map.n_owned();
        if owned.len() != n_owned {
            return Err(BridgeError::size_mismatch(
                "pull-back records vs. owned mesh points",
                n_owned,
                owned.len(),
            ));
        }
        let mut ghosts = vec![T::zeroed(); self.map.n_ghost()];
        self.map
            .halo()
            .forward_records(comm, tags::MESH_PULL_BACK, owned, &mut ghosts)?;
        (0..self.input_points)
            .map(|p| match self.map.slot(p) {
                Some(s) if s < n_owned => Ok(owned[s]),
                Some(s) => Ok(ghosts[s - n_owned]),
                None => Err(BridgeError::size_mismatch(
                    format!("mesh point {p} has no buffer slot"),
                    1,
                    0,
                )),
            })
            .collect()
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn cell_type(&self, p: usize) -> CellType {
        self.cell_types[p]
    }

    /// Global point number of local point `p`.
    pub fn global(&self, p: usize) -> Option<u64> {
        self.map.global(p)
    }

    pub fn is_owned(&self, p: usize) -> bool {
        self.map.is_owned(p)
    }

    /// Largest topological dimension present on this rank.
    pub fn depth(&self) -> u8 {
        self.cell_types
            .iter()
            .map(|ct| ct.dimension())
            .max()
            .unwrap_or(0)
    }

    /// Local points of dimension `dim`, in local order.
    pub fn stratum(&self, dim: u8) -> Vec<usize> {
        (0..self.n_points())
            .filter(|&p| self.cell_types[p].dimension() == dim)
            .collect()
    }

    pub fn cone(&self, p: usize) -> &[usize] {
        &self.cones[p]
    }

    /// Cone of `p` in global point numbering.
    pub fn cone_global(&self, p: usize) -> Vec<u64> {
        self.cones[p]
            .iter()
            .filter_map(|&c| self.map.global(c))
            .collect()
    }

    pub fn support(&self, p: usize) -> &[usize] {
        &self.supports[p]
    }

    /// Transitive closure of `p` (p itself, then its cone, depth first),
    /// each point once.
    pub fn closure(&self, p: usize) -> Vec<usize> {
        self.transitive(p, &self.cones)
    }

    /// Transitive star of `p` (p itself, then its support, depth first).
    pub fn star(&self, p: usize) -> Vec<usize> {
        self.transitive(p, &self.supports)
    }

    fn transitive(&self, p: usize, arrows: &[Vec<usize>]) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let mut stack = vec![p];
        while let Some(q) = stack.pop() {
            if !seen.insert(q) {
                continue;
            }
            out.push(q);
            stack.extend(arrows[q].iter().rev().copied());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::index::translator::IndexTranslator;

    fn two_triangles() -> LocalTopology {
        // 0--1
        // | /|
        // 2--3
        let mut t = LocalTopology::new();
        let v: Vec<usize> = (0..4)
            .map(|k| t.add_point(k, 0, CellType::Vertex, &[]).unwrap())
            .collect();
        let edges = [(0, 1), (1, 2), (2, 0), (1, 3), (3, 2)];
        let e: Vec<usize> = edges
            .iter()
            .enumerate()
            .map(|(i, &(a, b))| {
                t.add_point(10 + i as u64, 0, CellType::Segment, &[v[a], v[b]])
                    .unwrap()
            })
            .collect();
        t.add_point(20, 0, CellType::Triangle, &[e[0], e[1], e[2]])
            .unwrap();
        t.add_point(21, 0, CellType::Triangle, &[e[3], e[4], e[1]])
            .unwrap();
        t.labels_mut().set_label(e[0], "Face Sets", 1);
        t
    }

    #[test]
    fn serial_round_trip_is_exact() {
        let topo = two_triangles();
        let map = IndexTranslator::build(&topo.partition(), &NoComm).unwrap();
        let no_growth = ImportOptions {
            ghost_layers: 0,
            ..ImportOptions::default()
        };
        let mesh = import_mesh(&topo, &map, &NoComm, &no_growth).unwrap();
        assert_eq!(export_mesh(&mesh), topo);
        assert_eq!(mesh.depth(), 2);
        assert_eq!(mesh.stratum(1).len(), 5);
    }

    #[test]
    fn serial_ghost_layer_adds_nothing() {
        let topo = two_triangles();
        let map = IndexTranslator::build(&topo.partition(), &NoComm).unwrap();
        let mesh = import_mesh(&topo, &map, &NoComm, &ImportOptions::default()).unwrap();
        assert_eq!(mesh.ghost_layers(), 1);
        assert_eq!(mesh.n_points(), topo.len());
        assert_eq!(export_mesh(&mesh).cones(), topo.cones());
    }

    #[test]
    fn queries_follow_cones_and_supports() {
        let topo = two_triangles();
        let map = IndexTranslator::build(&topo.partition(), &NoComm).unwrap();
        let mesh = import_mesh(&topo, &map, &NoComm, &ImportOptions::default()).unwrap();
        // shared edge 1--2 is local point 5
        assert_eq!(mesh.support(5), &[9, 10]);
        let closure = mesh.closure(9);
        assert_eq!(closure.len(), 7);
        assert_eq!(closure[0], 9);
        let star = mesh.star(1);
        assert!(star.contains(&9) && star.contains(&10));
        assert_eq!(mesh.cone_global(9), vec![4, 5, 6]);
    }

    #[test]
    fn polygons_are_rejected() {
        let mut topo = LocalTopology::new();
        let v: Vec<usize> = (0..5)
            .map(|k| topo.add_point(k, 0, CellType::Vertex, &[]).unwrap())
            .collect();
        topo.add_point(9, 0, CellType::Polygon(5), &v).unwrap();
        let map = IndexTranslator::build(&topo.partition(), &NoComm).unwrap();
        let err = import_mesh(&topo, &map, &NoComm, &ImportOptions::default()).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedTopology(_)));
    }

    #[test]
    fn cones_must_go_down_in_dimension() {
        let mut topo = LocalTopology::new();
        let a = topo.add_point(0, 0, CellType::Segment, &[]).unwrap();
        topo.add_point(1, 0, CellType::Segment, &[a]).unwrap();
        let map = IndexTranslator::build(&topo.partition(), &NoComm).unwrap();
        assert!(matches!(
            import_mesh(&topo, &map, &NoComm, &ImportOptions::default()),
            Err(BridgeError::UnsupportedTopology(_))
        ));
    }

    #[test]
    fn shape_flags_become_requirements() {
        let topo = two_triangles();
        let map = IndexTranslator::build(&topo.partition(), &NoComm).unwrap();
        let quad = ImportOptions {
            quad: Some(true),
            ..ImportOptions::default()
        };
        assert!(matches!(
            import_mesh(&topo, &map, &NoComm, &quad),
            Err(BridgeError::UnsupportedTopology(msg)) if msg.contains("quad")
        ));
        // no 3D cells, so the tetrahedra requirement holds trivially
        let tets = ImportOptions {
            purify_to_tets: Some(true),
            quad: Some(false),
            ..ImportOptions::default()
        };
        assert!(import_mesh(&topo, &map, &NoComm, &tets).is_ok());
        assert_eq!(tets.required_shape(3), Some((CellType::Tetrahedron, "purify_to_tets")));
        assert_eq!(quad.required_shape(3), Some((CellType::Hexahedron, "quad")));
        assert_eq!(ImportOptions::default().required_shape(2), None);
    }

    #[test]
    fn serial_pull_back_is_the_owned_order() {
        let topo = two_triangles();
        let map = IndexTranslator::build(&topo.partition(), &NoComm).unwrap();
        let mesh = import_mesh(&topo, &map, &NoComm, &ImportOptions::default()).unwrap();
        let owned: Vec<u64> = (0..mesh.n_points() as u64).map(|g| 100 + g).collect();
        let back = mesh.pull_back(&owned, &NoComm).unwrap();
        for (p, v) in back.iter().enumerate() {
            assert_eq!(*v, 100 + mesh.global(p).unwrap());
        }
        assert!(matches!(
            mesh.pull_back(&owned[..3], &NoComm),
            Err(BridgeError::IndexMapMismatch { expected: 11, found: 3, .. })
        ));
    }

    #[test]
    fn map_of_another_topology_is_rejected() {
        let topo = two_triangles();
        let map = IndexTranslator::build(&crate::index::LocalPartition::serial(3), &NoComm).unwrap();
        assert!(matches!(
            import_mesh(&topo, &map, &NoComm, &ImportOptions::default()),
            Err(BridgeError::IndexMapMismatch { .. })
        ));
    }
}
