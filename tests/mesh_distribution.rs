mod util;
use util::*;

use std::collections::{BTreeMap, BTreeSet};

use ngs_petsc::algs::communicator::Communicator;
use ngs_petsc::index::IndexTranslator;
use ngs_petsc::mesh::{ImportOptions, export_mesh, import_mesh};
use ngs_petsc::topology::{CellType, LocalTopology};

/// Five vertices (keys 0..5) and four segments (keys 100..104) on a line.
/// Rank 0 owns segments 100, 101 and vertices 0..=2; rank 1 owns the rest
/// and holds vertex 2 as a ghost.
fn line(rank: usize) -> LocalTopology {
    let mut t = LocalTopology::new();
    let (verts, cells): (Vec<u64>, Vec<u64>) = if rank == 0 {
        (vec![0, 1, 2], vec![100, 101])
    } else {
        (vec![2, 3, 4], vec![102, 103])
    };
    let v: Vec<usize> = verts
        .iter()
        .map(|&k| {
            let owner = if k <= 2 { 0 } else { 1 };
            t.add_point(k, owner, CellType::Vertex, &[]).unwrap()
        })
        .collect();
    for (i, &c) in cells.iter().enumerate() {
        let p = t
            .add_point(c, rank, CellType::Segment, &[v[i], v[i + 1]])
            .unwrap();
        if c == 100 || c == 103 {
            t.labels_mut().set_label(p, "boundary", c as i32);
        }
    }
    t
}

#[test]
fn round_trip_without_growth_on_two_ranks() {
    let out = run_ranks(2, |comm| {
        let topo = line(comm.rank());
        let map = IndexTranslator::build(&topo.partition(), &comm).unwrap();
        let no_growth = ImportOptions {
            ghost_layers: 0,
            ..ImportOptions::default()
        };
        let mesh = import_mesh(&topo, &map, &comm, &no_growth).unwrap();
        (topo, export_mesh(&mesh), mesh.map().global_size())
    });
    for (topo, back, n) in out {
        assert_eq!(back, topo);
        assert_eq!(n, 9);
    }
}

#[test]
fn ghost_layer_brings_neighbouring_cells() {
    let out = run_ranks(2, |comm| {
        let topo = line(comm.rank());
        let map = IndexTranslator::build(&topo.partition(), &comm).unwrap();
        let mesh = import_mesh(&topo, &map, &comm, &ImportOptions::default()).unwrap();
        let keys: BTreeSet<u64> = (0..mesh.n_points())
            .map(|p| export_mesh(&mesh).key(p))
            .collect();
        let cones: Vec<(u64, Vec<u64>)> = mesh
            .stratum(1)
            .into_iter()
            .map(|c| (mesh.global(c).unwrap(), mesh.cone_global(c)))
            .collect();
        // existing points keep their local index
        for p in 0..topo.len() {
            assert_eq!(export_mesh(&mesh).key(p), topo.key(p));
        }
        (mesh.ghost_layers(), mesh.n_points(), keys, cones)
    });

    assert_eq!(out[0].0, 1);
    assert_eq!(out[0].1, 7);
    assert_eq!(out[1].1, 7);
    assert_eq!(out[0].2, [0, 1, 2, 3, 100, 101, 102].into_iter().collect());
    assert_eq!(out[1].2, [1, 2, 3, 4, 101, 102, 103].into_iter().collect());

    // both ranks see the same global cone for the shared segments
    let on = |r: usize, g: u64| out[r].3.iter().find(|(c, _)| *c == g).map(|(_, v)| v.clone());
    for (g, _) in &out[0].3 {
        if let Some(theirs) = on(1, *g) {
            assert_eq!(on(0, *g), Some(theirs));
        }
    }
}

#[test]
fn labels_travel_with_ghost_cells() {
    let out = run_ranks(2, |comm| {
        let mut topo = line(comm.rank());
        if comm.rank() == 1 {
            // mark segment 102 (local point 3) as a refinement target
            topo.labels_mut().set_label(3, "refine", 1);
        }
        let map = IndexTranslator::build(&topo.partition(), &comm).unwrap();
        let mesh = import_mesh(&topo, &map, &comm, &ImportOptions::default()).unwrap();
        let back = export_mesh(&mesh);
        mesh.labels()
            .stratum_points("refine", 1)
            .into_iter()
            .map(|p| back.key(p))
            .collect::<Vec<_>>()
    });
    assert_eq!(out[0], vec![102]);
    assert_eq!(out[1], vec![102]);
}

#[test]
fn growth_is_idempotent_in_serial() {
    let comm = ngs_petsc::algs::NoComm;
    let mut t = LocalTopology::new();
    let a = t.add_point(0, 0, CellType::Vertex, &[]).unwrap();
    let b = t.add_point(1, 0, CellType::Vertex, &[]).unwrap();
    t.add_point(2, 0, CellType::Segment, &[a, b]).unwrap();
    let map = IndexTranslator::build(&t.partition(), &comm).unwrap();
    let three = ImportOptions {
        ghost_layers: 3,
        ..ImportOptions::default()
    };
    let mesh = import_mesh(&t, &map, &comm, &three).unwrap();
    assert_eq!(mesh.ghost_layers(), 3);
    assert_eq!(mesh.n_points(), 3);
    assert_eq!(comm.size(), 1);
}

fn owned_counts(t: &LocalTopology, rank: usize) -> BTreeMap<u8, usize> {
    let mut counts = BTreeMap::new();
    for p in (0..t.len()).filter(|&p| t.owner(p) == rank) {
        *counts.entry(t.cell_type(p).dimension()).or_insert(0) += 1;
    }
    counts
}

#[test]
fn default_import_round_trip_keeps_input_points_and_owned_counts() {
    let out = run_ranks(2, |comm| {
        let topo = line(comm.rank());
        let map = IndexTranslator::build(&topo.partition(), &comm).unwrap();
        let mesh = import_mesh(&topo, &map, &comm, &ImportOptions::default()).unwrap();
        (comm.rank(), topo, export_mesh(&mesh))
    });
    for (rank, topo, back) in out {
        // the ghost layer is part of the export
        assert_eq!(back.ghost_layers(), 1);
        assert_eq!(back.len(), 7);
        for p in 0..topo.len() {
            assert_eq!(back.key(p), topo.key(p));
            assert_eq!(back.owner(p), topo.owner(p));
            assert_eq!(back.cell_type(p), topo.cell_type(p));
            assert_eq!(back.cone(p), topo.cone(p));
            assert_eq!(back.labels().labels_of(p), topo.labels().labels_of(p));
        }
        assert_eq!(owned_counts(&back, rank), owned_counts(&topo, rank));
        assert!((topo.len()..back.len()).all(|p| back.owner(p) != rank));
        for p in 0..back.len() {
            for &c in back.cone(p) {
                assert!(c < back.len());
            }
        }
    }
}

#[test]
fn pull_back_returns_owner_records_in_input_order() {
    let out = run_ranks(2, |comm| {
        let topo = line(comm.rank());
        let map = IndexTranslator::build(&topo.partition(), &comm).unwrap();
        let mesh = import_mesh(&topo, &map, &comm, &ImportOptions::default()).unwrap();
        let start = mesh.map().owned_range().start;
        // per-point mark in algebra order: ten times the global number
        let owned: Vec<u64> = (0..mesh.map().n_owned() as u64)
            .map(|i| 10 * (start + i))
            .collect();
        let back = mesh.pull_back(&owned, &comm).unwrap();
        let expected: Vec<u64> = (0..topo.len())
            .map(|p| 10 * mesh.global(p).unwrap())
            .collect();
        (back, expected, topo.len(), mesh.input_points())
    });
    for (back, expected, n, input) in out {
        assert_eq!(back.len(), n);
        assert_eq!(input, n);
        assert_eq!(back, expected);
    }
}
