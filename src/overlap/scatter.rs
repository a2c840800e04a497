//! Scatter plans: who sends which owned values to whom, and where received
//! ghost values land.
//!
//! A plan is built once, collectively, from the requesting side
//! ([`ScatterPlan::from_requests`]) and then replayed by every halo exchange.
//! Send offsets index the owner's *owned* segment; receive offsets index the
//! requester's *ghost* segment. Both sides list entries in ascending global
//! order, so no indices travel at exchange time.

use bytemuck::Pod;

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::exchange::{exchange_all, exchange_known};
use crate::algs::wire::{WireIndex, WireScalar};
use crate::bridge_error::BridgeError;
use crate::index::range::OwnershipRange;

/// How incoming values are merged into local storage
/// (`INSERT_VALUES` / `ADD_VALUES`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InsertMode {
    /// Incoming value overwrites the local one.
    Insert,
    /// Incoming value is added to the local one.
    Add,
}

impl InsertMode {
    #[inline]
    fn fuse(self, local: &mut f64, incoming: f64) {
        match self {
            InsertMode::Insert => *local = incoming,
            InsertMode::Add => *local += incoming,
        }
    }
}

/// Neighbour-wise send/receive offset lists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScatterPlan {
    sends: Vec<(usize, Vec<usize>)>,
    recvs: Vec<(usize, Vec<usize>)>,
}

impl ScatterPlan {
    /// The empty plan (serial runs, meshes without ghosts).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Collective: build a plan from the requesting side.
    ///
    /// `requests[r]` lists `(global, ghost_offset)` pairs this rank needs from
    /// rank `r`, sorted by global index. Owners validate that every requested
    /// global lies in their `owned` range.
    pub fn from_requests<C: Communicator>(
        comm: &C,
        tag: CommTag,
        owned: OwnershipRange,
        requests: &[Vec<(u64, usize)>],
    ) -> Result<Self, BridgeError> {
        let me = comm.rank();
        let outgoing: Vec<Vec<WireIndex>> = requests
            .iter()
            .map(|reqs| reqs.iter().map(|&(g, _)| WireIndex::of(g)).collect())
            .collect();
        let incoming = exchange_all(comm, tag, outgoing)?;

        let mut sends = Vec::new();
        let mut problem = None;
        for (peer, globals) in incoming.into_iter().enumerate() {
            if peer == me || globals.is_empty() {
                continue;
            }
            let mut offsets = Vec::with_capacity(globals.len());
            for g in globals.iter().map(WireIndex::get) {
                match owned.local_offset(g) {
                    Some(off) => offsets.push(off),
                    None => {
                        problem.get_or_insert(BridgeError::partition(
                            me,
                            format!("rank {peer} requested global {g} outside owned range {owned}"),
                        ));
                    }
                }
            }
            sends.push((peer, offsets));
        }
        if let Some(err) = problem {
            return Err(err);
        }

        let recvs = requests
            .iter()
            .enumerate()
            .filter(|(peer, reqs)| *peer != me && !reqs.is_empty())
            .map(|(peer, reqs)| (peer, reqs.iter().map(|&(_, off)| off).collect()))
            .collect();
        Ok(Self { sends, recvs })
    }

    /// Ranks we send owned values to.
    pub fn send_peers(&self) -> impl Iterator<Item = usize> + '_ {
        self.sends.iter().map(|(p, _)| *p)
    }

    /// Ranks we receive ghost values from.
    pub fn recv_peers(&self) -> impl Iterator<Item = usize> + '_ {
        self.recvs.iter().map(|(p, _)| *p)
    }

    /// Number of owned values shipped per exchange.
    pub fn send_len(&self) -> usize {
        self.sends.iter().map(|(_, o)| o.len()).sum()
    }

    /// Number of ghost values received per exchange.
    pub fn recv_len(&self) -> usize {
        self.recvs.iter().map(|(_, o)| o.len()).sum()
    }

    /// Collective over the plan's neighbours: owner → ghost.
    pub fn forward<C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
        owned: &[f64],
        ghosts: &mut [f64],
        mode: InsertMode,
    ) -> Result<(), BridgeError> {
        let sends: Vec<(usize, Vec<WireScalar>)> = self
            .sends
            .iter()
            .map(|(peer, offs)| (*peer, offs.iter().map(|&o| WireScalar::new(owned[o])).collect()))
            .collect();
        let recvs: Vec<(usize, usize)> = self.recvs.iter().map(|(p, o)| (*p, o.len())).collect();
        let got = exchange_known(comm, tag, &sends, &recvs)?;
        for ((_, offs), vals) in self.recvs.iter().zip(got) {
            for (&o, v) in offs.iter().zip(vals) {
                mode.fuse(&mut ghosts[o], v.get());
            }
        }
        Ok(())
    }

    /// Collective over the plan's neighbours: owner → ghost for plain
    /// records of any type (marks, flags, ids), always overwriting.
    pub fn forward_records<T: Pod, C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
        owned: &[T],
        ghosts: &mut [T],
    ) -> Result<(), BridgeError> {
        let sends: Vec<(usize, Vec<T>)> = self
            .sends
            .iter()
            .map(|(peer, offs)| (*peer, offs.iter().map(|&o| owned[o]).collect()))
            .collect();
        let recvs: Vec<(usize, usize)> = self.recvs.iter().map(|(p, o)| (*p, o.len())).collect();
        let got = exchange_known(comm, tag, &sends, &recvs)?;
        for ((_, offs), vals) in self.recvs.iter().zip(got) {
            for (&o, v) in offs.iter().zip(vals) {
                ghosts[o] = v;
            }
        }
        Ok(())
    }

    /// Collective over the plan's neighbours: ghost → owner.
    pub fn reverse<C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
        owned: &mut [f64],
        ghosts: &[f64],
        mode: InsertMode,
    ) -> Result<(), BridgeError> {
        let sends: Vec<(usize, Vec<WireScalar>)> = self
            .recvs
            .iter()
            .map(|(peer, offs)| (*peer, offs.iter().map(|&o| WireScalar::new(ghosts[o])).collect()))
            .collect();
        let recvs: Vec<(usize, usize)> = self.sends.iter().map(|(p, o)| (*p, o.len())).collect();
        let got = exchange_known(comm, tag, &sends, &recvs)?;
        for ((_, offs), vals) in self.sends.iter().zip(got) {
            for (&o, v) in offs.iter().zip(vals) {
                mode.fuse(&mut owned[o], v.get());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::ThreadComm;

    #[test]
    fn forward_then_reverse_add() {
        // rank 0 owns globals 0..2, rank 1 owns 2..4; each ghosts the
        // neighbour's first entry.
        let out = ThreadComm::run(2, |comm| {
            let me = comm.rank();
            let owned_range = OwnershipRange::new(2 * me as u64, 2 * me as u64 + 2);
            let mut requests = vec![Vec::new(), Vec::new()];
            requests[1 - me].push((2 * (1 - me) as u64, 0));
            let plan =
                ScatterPlan::from_requests(&comm, CommTag::new(0x20), owned_range, &requests)
                    .unwrap();
            let mut owned = vec![10.0 * me as f64 + 1.0, 10.0 * me as f64 + 2.0];
            let mut ghosts = vec![0.0];
            plan.forward(&comm, CommTag::new(0x22), &owned, &mut ghosts, InsertMode::Insert)
                .unwrap();
            let seen = ghosts[0];
            plan.reverse(&comm, CommTag::new(0x24), &mut owned, &ghosts, InsertMode::Add)
                .unwrap();
            (seen, owned)
        });
        assert_eq!(out[0].0, 11.0);
        assert_eq!(out[1].0, 1.0);
        assert_eq!(out[0].1, vec![2.0, 2.0]);
        assert_eq!(out[1].1, vec![22.0, 12.0]);
    }

    #[test]
    fn out_of_range_request_is_reported_by_owner() {
        let out = ThreadComm::run(2, |comm| {
            let me = comm.rank();
            let owned_range = OwnershipRange::new(me as u64, me as u64 + 1);
            let mut requests = vec![Vec::new(), Vec::new()];
            if me == 1 {
                requests[0].push((7, 0));
            }
            ScatterPlan::from_requests(&comm, CommTag::new(0x30), owned_range, &requests).is_err()
        });
        assert_eq!(out, vec![true, false]);
    }
}
