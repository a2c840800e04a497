//! Local-to-global index map of one distributed entity/dof set.
//!
//! An [`IndexMap`] is immutable once built and is shared read-only (`Arc`)
//! by every vector, matrix and mesh handle built against it. Any change of
//! the underlying enumeration produces a new map with a new
//! [`MapVersion`]; handles built on the old map keep the old one and refuse
//! to mix with the new.
//!
//! # Buffer order
//!
//! Distributed buffers store owned entries first (in local enumeration
//! order, which is also ascending global order) followed by ghost entries
//! (again in local order). Constrained entries have no buffer slot.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::algs::communicator::{CommId, Communicator, tags};
use crate::algs::exchange::agree;
use crate::bridge_error::BridgeError;
use crate::debug_invariants::DebugInvariants;
use crate::index::range::{OwnershipLayout, OwnershipRange};
use crate::overlap::scatter::ScatterPlan;

/// Identity of one immutable map instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapVersion(u64);

static NEXT_MAP_VERSION: AtomicU64 = AtomicU64::new(1);

impl MapVersion {
    fn fresh() -> Self {
        MapVersion(NEXT_MAP_VERSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MapVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map v{}", self.0)
    }
}

/// Role of one local entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
    /// Owned here; global index in this rank's ownership range.
    Owned,
    /// Copy of an entry owned by `owner`.
    Ghost { owner: usize },
    /// Excluded from the global numbering.
    Constrained,
}

/// Shared handle to an index map.
pub type SharedIndexMap = Arc<IndexMap>;

/// Local ⇄ global numbering for one rank.
#[derive(Debug)]
pub struct IndexMap {
    version: MapVersion,
    comm: CommId,
    rank: usize,
    layout: Arc<OwnershipLayout>,
    keys: Vec<u64>,
    kinds: Vec<EntryKind>,
    globals: Vec<Option<u64>>,
    /// local index → buffer slot
    slots: Vec<Option<usize>>,
    /// buffer slot → local index
    slot_locals: Vec<usize>,
    n_owned: usize,
    inverse: HashMap<u64, usize>,
    halo: ScatterPlan,
}

/// Raw parts assembled by the translator.
pub(crate) struct IndexMapParts {
    pub comm: CommId,
    pub rank: usize,
    pub layout: Arc<OwnershipLayout>,
    pub keys: Vec<u64>,
    pub kinds: Vec<EntryKind>,
    pub globals: Vec<Option<u64>>,
    pub halo: ScatterPlan,
}

impl IndexMap {
    pub(crate) fn from_parts(parts: IndexMapParts) -> Result<Self, BridgeError> {
        let IndexMapParts {
            comm,
            rank,
            layout,
            keys,
            kinds,
            globals,
            halo,
        } = parts;
        let n = kinds.len();
        let mut slots = vec![None; n];
        let mut slot_locals = Vec::with_capacity(n);
        for (i, k) in kinds.iter().enumerate() {
            if *k == EntryKind::Owned {
                slots[i] = Some(slot_locals.len());
                slot_locals.push(i);
            }
        }
        let n_owned = slot_locals.len();
        for (i, k) in kinds.iter().enumerate() {
            if matches!(k, EntryKind::Ghost { .. }) {
                slots[i] = Some(slot_locals.len());
                slot_locals.push(i);
            }
        }
        let mut inverse = HashMap::with_capacity(n);
        for (i, g) in globals.iter().enumerate() {
            if let Some(g) = g {
                if inverse.insert(*g, i).is_some() {
                    return Err(BridgeError::partition(
                        rank,
                        format!("global index {g} is held twice on this rank"),
                    ));
                }
            }
        }
        Self {
            version: MapVersion::fresh(),
            comm,
            rank,
            layout,
            keys,
            kinds,
            globals,
            slots,
            slot_locals,
            n_owned,
            inverse,
            halo,
        }
        .checked()
    }

    pub fn version(&self) -> MapVersion {
        self.version
    }

    pub fn comm_id(&self) -> CommId {
        self.comm
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn layout(&self) -> &Arc<OwnershipLayout> {
        &self.layout
    }

    /// This rank's ownership range.
    pub fn owned_range(&self) -> OwnershipRange {
        self.layout.range(self.rank)
    }

    /// Global size `N` of the index space.
    pub fn global_size(&self) -> u64 {
        self.layout.global_size()
    }

    /// Number of local entries (owned + ghost + constrained).
    pub fn local_size(&self) -> usize {
        self.kinds.len()
    }

    pub fn n_owned(&self) -> usize {
        self.n_owned
    }

    pub fn n_ghost(&self) -> usize {
        self.slot_locals.len() - self.n_owned
    }

    /// Length of a distributed buffer on this map: owned + ghosts.
    pub fn buffer_len(&self) -> usize {
        self.slot_locals.len()
    }

    pub fn key(&self, local: usize) -> Option<u64> {
        self.keys.get(local).copied()
    }

    pub fn kind(&self, local: usize) -> Option<EntryKind> {
        self.kinds.get(local).copied()
    }

    pub fn kinds(&self) -> &[EntryKind] {
        &self.kinds
    }

    /// Owning rank of a free local entry.
    pub fn owner(&self, local: usize) -> Option<usize> {
        match self.kinds.get(local)? {
            EntryKind::Owned => Some(self.rank),
            EntryKind::Ghost { owner } => Some(*owner),
            EntryKind::Constrained => None,
        }
    }

    pub fn is_owned(&self, local: usize) -> bool {
        self.kind(local) == Some(EntryKind::Owned)
    }

    /// Global index of a local entry; `None` for constrained entries.
    pub fn global(&self, local: usize) -> Option<u64> {
        self.globals.get(local).copied().flatten()
    }

    /// Local index of a global index held on this rank (owned or ghost).
    pub fn local(&self, global: u64) -> Option<usize> {
        self.inverse.get(&global).copied()
    }

    /// Buffer slot of a local entry.
    pub fn slot(&self, local: usize) -> Option<usize> {
        self.slots.get(local).copied().flatten()
    }

    /// Local index of every buffer slot, owned slots first.
    pub fn slot_locals(&self) -> &[usize] {
        &self.slot_locals
    }

    /// Global indices of the ghost slots, in slot order.
    pub fn ghost_globals(&self) -> impl Iterator<Item = u64> + '_ {
        self.slot_locals[self.n_owned..]
            .iter()
            .filter_map(|&l| self.globals[l])
    }

    /// Halo plan for ghost updates on this map.
    pub fn halo(&self) -> &ScatterPlan {
        &self.halo
    }

    /// Local check: `comm` is the communicator this map was built on.
    pub fn ensure_comm<C: Communicator>(&self, comm: &C) -> Result<(), BridgeError> {
        if comm.id() != self.comm {
            return Err(BridgeError::CommunicatorMismatch {
                expected: self.comm,
                found: comm.id(),
            });
        }
        Ok(())
    }

    /// Local check: two maps describe the same distributed index space
    /// (same communicator and identical ownership ranges).
    pub fn ensure_same_layout(&self, other: &IndexMap, what: &str) -> Result<(), BridgeError> {
        if self.comm != other.comm {
            return Err(BridgeError::CommunicatorMismatch {
                expected: self.comm,
                found: other.comm,
            });
        }
        if self.layout != other.layout {
            return Err(BridgeError::size_mismatch(
                format!("{what}: ownership layout"),
                self.global_size() as usize,
                other.global_size() as usize,
            ));
        }
        Ok(())
    }

    /// Collective: a new map with extra ghost entries appended after the
    /// existing local entries. Existing entries keep their local index,
    /// global index and role. Each new ghost is `(key, global, owner)`.
    pub fn with_ghosts<C: Communicator>(
        &self,
        new_ghosts: &[(u64, u64, usize)],
        comm: &C,
    ) -> Result<SharedIndexMap, BridgeError> {
        self.ensure_comm(comm)?;
        let mut keys = self.keys.clone();
        let mut kinds = self.kinds.clone();
        let mut globals = self.globals.clone();
        let mut local = Ok(());
        let mut fresh = std::collections::HashSet::with_capacity(new_ghosts.len());
        for &(key, global, owner) in new_ghosts {
            if self.inverse.contains_key(&global) || !fresh.insert(global) {
                local = Err(BridgeError::partition(
                    self.rank,
                    format!("appended ghost {global} is already held on this rank"),
                ));
                break;
            }
            if owner == self.rank || self.layout.owner_of(global) != Some(owner) {
                local = Err(BridgeError::partition(
                    self.rank,
                    format!("appended ghost {global} does not belong to rank {owner}"),
                ));
                break;
            }
            keys.push(key);
            kinds.push(EntryKind::Ghost { owner });
            globals.push(Some(global));
        }
        agree(comm, local, |ranks| {
            BridgeError::partition(self.rank, format!("ghost extension failed on ranks {ranks:?}"))
        })?;
        let halo = build_halo(comm, &self.layout, &kinds, &globals, self.n_owned)?;
        Ok(Arc::new(IndexMap::from_parts(IndexMapParts {
            comm: self.comm,
            rank: self.rank,
            layout: Arc::clone(&self.layout),
            keys,
            kinds,
            globals,
            halo,
        })?))
    }
}

impl PartialEq for IndexMap {
    /// Two maps are equal when they number the same entries identically;
    /// the version is an identity and is not compared.
    fn eq(&self, other: &Self) -> bool {
        self.comm == other.comm
            && self.rank == other.rank
            && self.layout == other.layout
            && self.keys == other.keys
            && self.kinds == other.kinds
            && self.globals == other.globals
    }
}

/// Collective: ghost holders ask owners for their ghosts' values.
pub(crate) fn build_halo<C: Communicator>(
    comm: &C,
    layout: &OwnershipLayout,
    kinds: &[EntryKind],
    globals: &[Option<u64>],
    n_owned: usize,
) -> Result<ScatterPlan, BridgeError> {
    let mut requests: Vec<Vec<(u64, usize)>> = vec![Vec::new(); comm.size()];
    let mut ghost_slot = 0usize;
    for (kind, global) in kinds.iter().zip(globals) {
        if let (EntryKind::Ghost { owner }, Some(g)) = (kind, global) {
            requests[*owner].push((*g, ghost_slot));
            ghost_slot += 1;
        }
    }
    for reqs in &mut requests {
        reqs.sort_unstable();
    }
    let owned = layout.range(comm.rank());
    debug_assert_eq!(owned.width(), n_owned);
    let plan = ScatterPlan::from_requests(comm, tags::HALO_PLAN, owned, &requests);
    let plan = agree(comm, plan, |ranks| {
        BridgeError::partition(comm.rank(), format!("halo plan rejected by ranks {ranks:?}"))
    })?;
    log::debug!(
        "[rank {}] halo plan: {} values out, {} in",
        comm.rank(),
        plan.send_len(),
        plan.recv_len()
    );
    Ok(plan)
}

impl DebugInvariants for IndexMap {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "IndexMap");
    }

    fn validate_invariants(&self) -> Result<(), BridgeError> {
        let rank = self.rank;
        let n = self.kinds.len();
        if self.keys.len() != n || self.globals.len() != n || self.slots.len() != n {
            return Err(BridgeError::partition(rank, "per-entry arrays differ in length"));
        }
        let owned = self.owned_range();
        if owned.width() != self.n_owned {
            return Err(BridgeError::size_mismatch(
                "owned entries vs. ownership range",
                owned.width(),
                self.n_owned,
            ));
        }
        let mut next_owned = owned.start;
        for (i, (kind, global)) in self.kinds.iter().zip(&self.globals).enumerate() {
            match (kind, global) {
                (EntryKind::Owned, Some(g)) => {
                    // owned block follows local order
                    if *g != next_owned {
                        return Err(BridgeError::partition(
                            rank,
                            format!("owned entry {i} has global {g}, expected {next_owned}"),
                        ));
                    }
                    next_owned += 1;
                }
                (EntryKind::Ghost { owner }, Some(g)) => {
                    if *owner == rank || self.layout.owner_of(*g) != Some(*owner) {
                        return Err(BridgeError::partition(
                            rank,
                            format!("ghost entry {i} (global {g}) is not owned by rank {owner}"),
                        ));
                    }
                }
                (EntryKind::Constrained, None) => {}
                _ => {
                    return Err(BridgeError::partition(
                        rank,
                        format!("entry {i} has an inconsistent role/global pair"),
                    ));
                }
            }
        }
        for (g, &l) in &self.inverse {
            if self.globals[l] != Some(*g) {
                return Err(BridgeError::partition(rank, "inverse map out of sync"));
            }
        }
        Ok(())
    }
}
