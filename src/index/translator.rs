//! Ownership/index translator: local enumerations → global numbering.
//!
//! [`IndexTranslator::build`] is collective. Owned entries are numbered by
//! rank (ascending) and then by local position, so the owned block keeps the
//! local enumeration order. Ghost entries are matched to their owner's copy
//! through a rendezvous directory: key `k` is managed by rank `k mod P`,
//! which sees every ownership claim and every ghost query for `k` and can
//! therefore detect conflicting claims and dangling references.
//!
//! Identical input always yields identical numbering.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::algs::communicator::{Communicator, tags};
use crate::algs::exchange::{agree, exchange_all};
use crate::algs::wire::{WireIndex, WirePair};
use crate::bridge_error::BridgeError;
use crate::index::map::{EntryKind, IndexMap, IndexMapParts, SharedIndexMap, build_halo};
use crate::index::partition::LocalPartition;
use crate::index::range::OwnershipLayout;

/// Reply sentinel for queries the directory could not resolve.
const UNRESOLVED: u64 = u64::MAX;

/// Builds [`IndexMap`]s from local partitions.
#[derive(Copy, Clone, Debug, Default)]
pub struct IndexTranslator;

impl IndexTranslator {
    /// Collective: number `partition` consistently across all ranks of `comm`.
    ///
    /// # Errors
    /// `InconsistentPartition` on every rank when any rank holds a malformed
    /// partition, when two ranks claim the same key, or when a ghost refers
    /// to a key that no rank owns (or that another rank than the named
    /// owner owns).
    pub fn build<C: Communicator>(
        partition: &LocalPartition,
        comm: &C,
    ) -> Result<SharedIndexMap, BridgeError> {
        let me = comm.rank();
        let size = comm.size();

        // 1) local validation, agreed so that nobody enters step 2 alone
        agree(comm, partition.validate_local(me, size), |ranks| {
            BridgeError::partition(me, format!("malformed local partition on ranks {ranks:?}"))
        })?;

        // 2) ownership layout
        let entries = partition.entries();
        let n_owned = entries.iter().filter(|e| e.free && e.owner == me).count();
        let layout = Arc::new(OwnershipLayout::gather(comm, n_owned)?);
        let start = layout.range(me).start;

        let mut kinds = Vec::with_capacity(entries.len());
        let mut globals = Vec::with_capacity(entries.len());
        let mut next = start;
        for e in entries {
            if !e.free {
                kinds.push(EntryKind::Constrained);
                globals.push(None);
            } else if e.owner == me {
                kinds.push(EntryKind::Owned);
                globals.push(Some(next));
                next += 1;
            } else {
                kinds.push(EntryKind::Ghost { owner: e.owner });
                globals.push(None);
            }
        }

        // 3) rendezvous directory
        let directory = |key: u64| (key % size as u64) as usize;
        let mut claims: Vec<Vec<WirePair>> = vec![Vec::new(); size];
        let mut queries: Vec<Vec<WirePair>> = vec![Vec::new(); size];
        let mut query_locals: Vec<Vec<usize>> = vec![Vec::new(); size];
        for (i, e) in entries.iter().enumerate() {
            if !e.free {
                continue;
            }
            let d = directory(e.key);
            match (kinds[i], globals[i]) {
                (EntryKind::Owned, Some(g)) => claims[d].push(WirePair::new(e.key, g)),
                (EntryKind::Ghost { owner }, _) => {
                    queries[d].push(WirePair::new(e.key, owner as u64));
                    query_locals[d].push(i);
                }
                _ => {}
            }
        }
        let claims_in = exchange_all(comm, tags::TRANSLATOR, claims)?;
        let queries_in = exchange_all(comm, tags::TRANSLATOR.offset(2), queries)?;

        let mut problem: Option<BridgeError> = None;
        let mut directory_map: BTreeMap<u64, (usize, u64)> = BTreeMap::new();
        for (src, list) in claims_in.iter().enumerate() {
            for c in list {
                if let Some(&(prev, prev_global)) = directory_map.get(&c.a()) {
                    problem.get_or_insert_with(|| {
                        BridgeError::partition(
                            me,
                            format!(
                                "key {} claimed by rank {prev} (global {prev_global}) and rank {src} (global {})",
                                c.a(),
                                c.b()
                            ),
                        )
                    });
                } else {
                    directory_map.insert(c.a(), (src, c.b()));
                }
            }
        }
        let replies: Vec<Vec<WireIndex>> = queries_in
            .iter()
            .enumerate()
            .map(|(src, list)| {
                list.iter()
                    .map(|q| match directory_map.get(&q.a()) {
                        Some(&(owner, g)) if owner as u64 == q.b() => WireIndex::of(g),
                        Some(&(owner, _)) => {
                            problem.get_or_insert_with(|| {
                                BridgeError::partition(
                                    me,
                                    format!(
                                        "rank {src} ghosts key {} as owned by rank {}, but rank {owner} owns it",
                                        q.a(),
                                        q.b()
                                    ),
                                )
                            });
                            WireIndex::of(UNRESOLVED)
                        }
                        None => {
                            problem.get_or_insert_with(|| {
                                BridgeError::partition(
                                    me,
                                    format!(
                                        "dangling reference: rank {src} ghosts key {} but no rank owns it",
                                        q.a()
                                    ),
                                )
                            });
                            WireIndex::of(UNRESOLVED)
                        }
                    })
                    .collect()
            })
            .collect();
        let replies_in = exchange_all(comm, tags::TRANSLATOR.offset(4), replies)?;

        for (d, list) in replies_in.iter().enumerate() {
            for (&local, reply) in query_locals[d].iter().zip(list) {
                let g = reply.get();
                if g == UNRESOLVED {
                    problem.get_or_insert_with(|| {
                        BridgeError::partition(
                            me,
                            format!(
                                "ghost entry {local} (key {}) could not be resolved",
                                entries[local].key
                            ),
                        )
                    });
                } else {
                    globals[local] = Some(g);
                }
            }
        }

        // 4) agreement
        let outcome = match problem {
            Some(err) => Err(err),
            None => Ok(()),
        };
        agree(comm, outcome, |ranks| {
            BridgeError::partition(me, format!("partition inconsistency reported by ranks {ranks:?}"))
        })?;

        // 5) halo plan
        let halo = build_halo(comm, &layout, &kinds, &globals, n_owned)?;
        log::debug!(
            "[rank {me}] index map: {} local, {n_owned} owned, global size {}",
            entries.len(),
            layout.global_size()
        );

        let map = IndexMap::from_parts(IndexMapParts {
            comm: comm.id(),
            rank: me,
            layout,
            keys: entries.iter().map(|e| e.key).collect(),
            kinds,
            globals,
            halo,
        })?;
        Ok(Arc::new(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, ThreadComm};

    #[test]
    fn serial_numbering_is_identity() {
        let map = IndexTranslator::build(&LocalPartition::serial(4), &NoComm).unwrap();
        assert_eq!(map.global_size(), 4);
        assert_eq!((0..4).map(|i| map.global(i)).collect::<Vec<_>>(), vec![
            Some(0),
            Some(1),
            Some(2),
            Some(3)
        ]);
        assert_eq!(map.n_ghost(), 0);
    }

    #[test]
    fn constrained_entries_get_no_global() {
        let p = LocalPartition::serial(3)
            .with_free_mask(&[true, false, true])
            .unwrap();
        let map = IndexTranslator::build(&p, &NoComm).unwrap();
        assert_eq!(map.global(1), None);
        assert_eq!(map.global(2), Some(1));
        assert_eq!(map.kind(1), Some(EntryKind::Constrained));
        assert_eq!(map.buffer_len(), 2);
    }

    #[test]
    fn ghosts_receive_owner_globals() {
        // keys 0..4 owned by rank 0 in reverse local order; rank 1 owns 10, 11
        // and ghosts keys 3 and 0.
        let maps = ThreadComm::run(2, |comm| {
            let p: LocalPartition = if comm.rank() == 0 {
                [(3, 0), (2, 0), (1, 0), (0, 0)].into_iter().collect()
            } else {
                [(10, 1), (3, 0), (11, 1), (0, 0)].into_iter().collect()
            };
            IndexTranslator::build(&p, &comm).unwrap()
        });
        assert_eq!(maps[0].global(0), Some(0)); // key 3
        assert_eq!(maps[0].global(3), Some(3)); // key 0
        assert_eq!(maps[1].global(0), Some(4));
        assert_eq!(maps[1].global(1), Some(0));
        assert_eq!(maps[1].global(2), Some(5));
        assert_eq!(maps[1].global(3), Some(3));
        assert_eq!(maps[1].kind(1), Some(EntryKind::Ghost { owner: 0 }));
        assert_eq!(maps[1].local(3), Some(3));
    }

    #[test]
    fn double_claim_fails_on_all_ranks() {
        let out = ThreadComm::run(2, |comm| {
            let p: LocalPartition = [(7, comm.rank())].into_iter().collect();
            IndexTranslator::build(&p, &comm)
        });
        for r in out {
            assert!(matches!(r, Err(BridgeError::InconsistentPartition { .. })));
        }
    }

    #[test]
    fn dangling_ghost_fails_on_all_ranks() {
        let out = ThreadComm::run(3, |comm| {
            let p: LocalPartition = match comm.rank() {
                0 => [(0, 0)].into_iter().collect(),
                1 => [(1, 1), (99, 0)].into_iter().collect(),
                _ => [(2, 2)].into_iter().collect(),
            };
            IndexTranslator::build(&p, &comm)
        });
        for r in out {
            assert!(matches!(r, Err(BridgeError::InconsistentPartition { .. })));
        }
    }

    #[test]
    fn wrong_owner_hint_is_inconsistent() {
        let out = ThreadComm::run(3, |comm| {
            let p: LocalPartition = match comm.rank() {
                0 => [(0, 0)].into_iter().collect(),
                1 => [(1, 1), (0, 2)].into_iter().collect(),
                _ => [(2, 2)].into_iter().collect(),
            };
            IndexTranslator::build(&p, &comm).is_err()
        });
        assert_eq!(out, vec![true, true, true]);
    }
}
