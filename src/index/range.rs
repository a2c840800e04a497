//! Ownership ranges: the contiguous block of global indices each rank owns.
//!
//! An [`OwnershipLayout`] is the rank-ordered list of ranges. By construction
//! (prefix sums of per-rank counts) the ranges partition `[0, N)` exactly:
//! no gaps, no overlap.

use std::fmt;

use crate::algs::communicator::Communicator;
use crate::bridge_error::BridgeError;
use crate::debug_invariants::DebugInvariants;

/// Half-open interval `[start, end)` of global indices.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct OwnershipRange {
    pub start: u64,
    pub end: u64,
}

impl OwnershipRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of owned indices.
    pub fn width(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn contains(&self, global: u64) -> bool {
        self.start <= global && global < self.end
    }

    /// Offset of `global` inside this range.
    pub fn local_offset(&self, global: u64) -> Option<usize> {
        self.contains(global).then(|| (global - self.start) as usize)
    }
}

impl fmt::Display for OwnershipRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Per-rank ownership ranges of one distributed index space.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OwnershipLayout {
    /// `offsets[r]..offsets[r + 1]` is rank `r`'s range; `offsets.len() == size + 1`.
    offsets: Vec<u64>,
}

impl OwnershipLayout {
    /// Build from the number of owned indices on each rank, in rank order.
    pub fn from_counts(counts: &[u64]) -> Self {
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        offsets.push(0);
        let mut acc = 0u64;
        for &c in counts {
            acc += c;
            offsets.push(acc);
        }
        let layout = Self { offsets };
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        layout.debug_assert_invariants();
        layout
    }

    /// Collective: gather each rank's owned count.
    pub fn gather<C: Communicator>(comm: &C, n_owned: usize) -> Result<Self, BridgeError> {
        let counts = comm.allgather_u64(n_owned as u64)?;
        log::debug!(
            "[rank {}] ownership layout counts: {:?}",
            comm.rank(),
            counts
        );
        Ok(Self::from_counts(&counts))
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Total number of global indices `N`.
    pub fn global_size(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Range owned by `rank`.
    pub fn range(&self, rank: usize) -> OwnershipRange {
        OwnershipRange::new(self.offsets[rank], self.offsets[rank + 1])
    }

    /// All ranges in rank order.
    pub fn ranges(&self) -> impl Iterator<Item = OwnershipRange> + '_ {
        self.offsets
            .windows(2)
            .map(|w| OwnershipRange::new(w[0], w[1]))
    }

    /// Rank owning `global`, found by binary search. Empty ranges never own.
    pub fn owner_of(&self, global: u64) -> Option<usize> {
        if global >= self.global_size() {
            return None;
        }
        // first offset strictly greater than `global`, minus one
        let idx = self.offsets.partition_point(|&o| o <= global);
        Some(idx - 1)
    }
}

impl DebugInvariants for OwnershipLayout {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "OwnershipLayout");
    }

    fn validate_invariants(&self) -> Result<(), BridgeError> {
        if self.offsets.first() != Some(&0) {
            return Err(BridgeError::partition(0, "layout does not start at 0"));
        }
        if let Some(r) = self.offsets.windows(2).position(|w| w[0] > w[1]) {
            return Err(BridgeError::partition(
                r,
                "ownership ranges are not monotone",
            ));
        }
        Ok(())
    }
}
