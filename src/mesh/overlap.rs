//! Ghost-layer growth by vertex-star overlap.
//!
//! One growth step gives every rank all cells (with their closure) that
//! touch a vertex it already holds:
//!
//! 1. holders register each ghost vertex with its owner;
//! 2. owners tell each holder who else holds the vertex;
//! 3. every rank ships, to every rank it shares vertices with, the owned
//!    cells in the star of the shared vertices plus their closure, labels
//!    included;
//! 4. receivers append the points they did not hold yet as ghosts, in
//!    ascending global order.
//!
//! Every cell touching a vertex is owned by some rank that holds the vertex,
//! so steps 1–3 reach all of them.

use std::collections::{BTreeMap, BTreeSet};

use crate::algs::communicator::{Communicator, tags};
use crate::algs::exchange::{agree, exchange_all};
use crate::algs::wire::{WireEntity, WireIndex, WireLabel, WirePair};
use crate::bridge_error::BridgeError;
use crate::mesh::DistributedMesh;
use crate::topology::cell_type::CellType;

struct Incoming {
    key: u64,
    owner: usize,
    cell_type: CellType,
    cone: Vec<u64>,
}

pub(super) fn grow_one_layer<C: Communicator>(
    mesh: &DistributedMesh,
    comm: &C,
) -> Result<DistributedMesh, BridgeError> {
    let me = comm.rank();
    let size = comm.size();
    let map = mesh.map();
    let base = tags::MESH_OVERLAP;

    // 1) register held ghost vertices with their owners
    let mut register: Vec<Vec<WireIndex>> = vec![Vec::new(); size];
    for v in mesh.stratum(0) {
        if let (Some(g), Some(owner)) = (map.global(v), map.owner(v)) {
            if owner != me {
                register[owner].push(WireIndex::of(g));
            }
        }
    }
    let registered = exchange_all(comm, base, register)?;
    let mut holders: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (src, list) in registered.iter().enumerate() {
        for w in list {
            holders.entry(w.get()).or_default().push(src);
        }
    }

    // 2) owners report the other holders of each vertex, themselves included
    let mut sharing_out: Vec<Vec<WirePair>> = vec![Vec::new(); size];
    for (&g, hs) in &holders {
        for &h in hs {
            for &other in hs.iter().chain(std::iter::once(&me)) {
                if other != h {
                    sharing_out[h].push(WirePair::new(g, other as u64));
                }
            }
        }
    }
    let sharing_in = exchange_all(comm, base.offset(2), sharing_out)?;

    let mut shared: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (&g, hs) in &holders {
        if let Some(v) = map.local(g) {
            for &h in hs {
                shared.entry(h).or_default().insert(v);
            }
        }
    }
    for pair in sharing_in.iter().flatten() {
        if let Some(v) = map.local(pair.a()) {
            shared.entry(pair.b() as usize).or_default().insert(v);
        }
    }

    // 3) ship owned cells of the shared stars with their closure
    let names = mesh.labels().names();
    let name_blob: Vec<u8> = names.join("\0").into_bytes();
    let mut headers: Vec<Vec<WireEntity>> = vec![Vec::new(); size];
    let mut cone_data: Vec<Vec<WireIndex>> = vec![Vec::new(); size];
    let mut label_data: Vec<Vec<WireLabel>> = vec![Vec::new(); size];
    let mut name_data: Vec<Vec<u8>> = vec![Vec::new(); size];
    for (&peer, verts) in &shared {
        let mut cells = BTreeSet::new();
        for &v in verts {
            cells.extend(
                mesh.star(v)
                    .into_iter()
                    .filter(|&c| mesh.support(c).is_empty() && map.is_owned(c)),
            );
        }
        let mut points: BTreeMap<u64, usize> = BTreeMap::new();
        for &c in &cells {
            for p in mesh.closure(c) {
                if let Some(g) = map.global(p) {
                    points.insert(g, p);
                }
            }
        }
        for (&g, &p) in &points {
            let cone = mesh.cone(p);
            headers[peer].push(WireEntity::new(
                g,
                map.key(p).unwrap_or_default(),
                map.owner(p).unwrap_or(me),
                mesh.cell_type(p).code(),
                cone.len(),
            ));
            cone_data[peer].extend(cone.iter().filter_map(|&c| map.global(c)).map(WireIndex::of));
            for (name, value) in mesh.labels().labels_of(p) {
                if let Ok(idx) = names.binary_search(&name) {
                    label_data[peer].push(WireLabel::new(g, idx as u32, value));
                }
            }
        }
        if !label_data[peer].is_empty() {
            name_data[peer] = name_blob.clone();
        }
    }
    let headers_in = exchange_all(comm, base.offset(4), headers)?;
    let cones_in = exchange_all(comm, base.offset(6), cone_data)?;
    let labels_in = exchange_all(comm, base.offset(8), label_data)?;
    let names_in = exchange_all(comm, base.offset(10), name_data)?;

    // 4) keep what is new here
    let decoded = decode(mesh, &headers_in, &cones_in, &labels_in, &names_in);
    let (incoming, new_labels) = agree(comm, decoded, |ranks| {
        BridgeError::partition(me, format!("ghost layer records rejected by ranks {ranks:?}"))
    })?;

    let ghosts: Vec<(u64, u64, usize)> = incoming
        .iter()
        .map(|(&g, inc)| (inc.key, g, inc.owner))
        .collect();
    let new_map = map.with_ghosts(&ghosts, comm)?;

    let mut cell_types = mesh.cell_types.clone();
    let mut cones = mesh.cones.clone();
    for (g, inc) in &incoming {
        let mut cone = Vec::with_capacity(inc.cone.len());
        for &c in &inc.cone {
            cone.push(new_map.local(c).ok_or_else(|| {
                BridgeError::UnsupportedTopology(format!(
                    "ghost point {g} arrived without cone point {c}"
                ))
            })?);
        }
        cell_types.push(inc.cell_type);
        cones.push(cone);
    }
    let mut labels = mesh.labels().clone();
    for (g, name, value) in new_labels {
        if let Some(p) = new_map.local(g) {
            labels.set_label(p, &name, value);
        }
    }
    log::debug!(
        "[rank {me}] ghost layer {}: {} new ghost points from {} neighbour(s)",
        mesh.ghost_layers + 1,
        incoming.len(),
        shared.len()
    );
    Ok(DistributedMesh::from_parts(
        new_map,
        cell_types,
        cones,
        labels,
        mesh.ghost_layers + 1,
        mesh.input_points,
    ))
}

type Decoded = (BTreeMap<u64, Incoming>, Vec<(u64, String, i32)>);

fn decode(
    mesh: &DistributedMesh,
    headers_in: &[Vec<WireEntity>],
    cones_in: &[Vec<WireIndex>],
    labels_in: &[Vec<WireLabel>],
    names_in: &[Vec<u8>],
) -> Result<Decoded, BridgeError> {
    let map = mesh.map();
    let mut incoming: BTreeMap<u64, Incoming> = BTreeMap::new();
    for (src, headers) in headers_in.iter().enumerate() {
        let cones = &cones_in[src];
        let mut off = 0usize;
        for h in headers {
            let len = h.cone_len();
            let cone = cones.get(off..off + len).ok_or(BridgeError::BufferSizeMismatch {
                neighbor: src,
                expected: off + len,
                got: cones.len(),
            })?;
            off += len;
            if map.local(h.global()).is_some() {
                continue;
            }
            let cell_type = CellType::from_code(h.cell_type()).ok_or_else(|| {
                BridgeError::UnsupportedTopology(format!(
                    "unknown cell type code {} from rank {src}",
                    h.cell_type()
                ))
            })?;
            incoming.entry(h.global()).or_insert_with(|| Incoming {
                key: h.key(),
                owner: h.owner(),
                cell_type,
                cone: cone.iter().map(WireIndex::get).collect(),
            });
        }
    }

    let mut new_labels = Vec::new();
    for (src, labels) in labels_in.iter().enumerate() {
        if labels.is_empty() {
            continue;
        }
        let names: Vec<String> = String::from_utf8_lossy(&names_in[src])
            .split('\0')
            .map(str::to_owned)
            .collect();
        for l in labels {
            if !incoming.contains_key(&l.global()) {
                continue;
            }
            let name = names.get(l.name()).ok_or(BridgeError::BufferSizeMismatch {
                neighbor: src,
                expected: l.name() + 1,
                got: names.len(),
            })?;
            new_labels.push((l.global(), name.clone(), l.value()));
        }
    }
    // several senders may ship the same label; keep one copy
    new_labels.sort();
    new_labels.dedup();
    Ok((incoming, new_labels))
}
