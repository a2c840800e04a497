mod util;
use util::*;

use std::collections::HashMap;

use ngs_petsc::algs::communicator::Communicator;
use ngs_petsc::index::{EntryKind, IndexTranslator, LocalPartition};
use proptest::prelude::*;

/// Owners per key plus, per key, a bit mask of the ranks holding a ghost copy.
fn layouts() -> impl Strategy<Value = (usize, Vec<(usize, u8)>)> {
    (1usize..=4).prop_flat_map(|size| {
        let entry = (0..size, any::<u8>());
        (Just(size), prop::collection::vec(entry, 0..40))
    })
}

fn partition_of(rank: usize, owners: &[(usize, u8)]) -> LocalPartition {
    let mut p = LocalPartition::new();
    // ghosts interleaved with owned keys, in reverse key order
    for (key, &(owner, ghosts)) in owners.iter().enumerate().rev() {
        if owner == rank || ghosts & (1 << rank) != 0 {
            p.push(key as u64, owner);
        }
    }
    p
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn ownership_tiles_and_ghosts_agree_with_owners((size, owners) in layouts()) {
        let maps = run_ranks(size, |comm| {
            let p = partition_of(comm.rank(), &owners);
            let map = IndexTranslator::build(&p, &comm).unwrap();
            (p, map)
        });

        // owned ranges are contiguous, rank ordered and cover [0, N)
        let mut next = 0;
        for (_, map) in &maps {
            let range = map.owned_range();
            prop_assert_eq!(range.start, next);
            prop_assert_eq!(map.global_size(), owners.len() as u64);
            next = range.end;
        }
        prop_assert_eq!(next, owners.len() as u64);

        let mut by_key = HashMap::new();
        for (p, map) in &maps {
            for (l, e) in p.entries().iter().enumerate() {
                if map.is_owned(l) {
                    let g = map.global(l).unwrap();
                    prop_assert!(map.owned_range().contains(g));
                    prop_assert!(by_key.insert(e.key, g).is_none(), "key {} owned twice", e.key);
                }
            }
        }
        for (p, map) in &maps {
            for (l, e) in p.entries().iter().enumerate() {
                if let Some(EntryKind::Ghost { owner }) = map.kind(l) {
                    prop_assert_eq!(owner, e.owner);
                    prop_assert_eq!(map.global(l), by_key.get(&e.key).copied());
                }
                prop_assert_eq!(map.local(map.global(l).unwrap()), Some(l));
            }
        }
    }
}

#[test]
fn empty_rank_owns_an_empty_range() {
    let maps = run_ranks(3, |comm| {
        let p = if comm.rank() == 1 {
            LocalPartition::new()
        } else {
            [(comm.rank() as u64, comm.rank())].into_iter().collect()
        };
        IndexTranslator::build(&p, &comm).unwrap()
    });
    assert_eq!(maps[1].n_owned(), 0);
    assert_eq!(maps[1].owned_range().start, 1);
    assert_eq!(maps[2].global(0), Some(1));
}
