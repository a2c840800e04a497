//! Translator input: the discretization toolkit's local enumeration.
//!
//! Each local entry records the entity's toolkit-wide *key* (the number the
//! discretization toolkit already shares between processes for the same
//! vertex, face or dof), its owning rank, and whether it is free. Constrained
//! (non-free) entries stay in the local enumeration but receive no global
//! index.

use std::collections::HashSet;

use crate::bridge_error::BridgeError;

/// One local entity/dof as seen by the discretization toolkit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LocalEntry {
    pub key: u64,
    pub owner: usize,
    pub free: bool,
}

/// Ordered local enumeration of one rank.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LocalPartition {
    entries: Vec<LocalEntry>,
}

impl LocalPartition {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-rank enumeration with keys `0..n`, all owned by rank 0.
    pub fn serial(n: usize) -> Self {
        (0..n as u64).map(|k| (k, 0)).collect()
    }

    /// Build from parallel key/owner slices.
    pub fn from_owners(keys: &[u64], owners: &[usize]) -> Result<Self, BridgeError> {
        if keys.len() != owners.len() {
            return Err(BridgeError::size_mismatch(
                "partition owners",
                keys.len(),
                owners.len(),
            ));
        }
        Ok(keys.iter().copied().zip(owners.iter().copied()).collect())
    }

    /// Mark entries free/constrained from a free-dof mask.
    pub fn with_free_mask(mut self, free: &[bool]) -> Result<Self, BridgeError> {
        if free.len() != self.entries.len() {
            return Err(BridgeError::size_mismatch(
                "free-dof mask",
                self.entries.len(),
                free.len(),
            ));
        }
        for (e, &f) in self.entries.iter_mut().zip(free) {
            e.free = f;
        }
        Ok(self)
    }

    /// Append a free entry.
    pub fn push(&mut self, key: u64, owner: usize) {
        self.entries.push(LocalEntry {
            key,
            owner,
            free: true,
        });
    }

    /// Append a constrained entry.
    pub fn push_constrained(&mut self, key: u64, owner: usize) {
        self.entries.push(LocalEntry {
            key,
            owner,
            free: false,
        });
    }

    pub fn entries(&self) -> &[LocalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Local checks that need no communication: owners in range and no key
    /// listed twice on this rank.
    pub fn validate_local(&self, rank: usize, size: usize) -> Result<(), BridgeError> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for (i, e) in self.entries.iter().enumerate() {
            if e.owner >= size {
                return Err(BridgeError::partition(
                    rank,
                    format!(
                        "local entry {i} (key {}) names owner {} but the communicator has {size} ranks",
                        e.key, e.owner
                    ),
                ));
            }
            if !seen.insert(e.key) {
                return Err(BridgeError::partition(
                    rank,
                    format!("key {} appears twice in the local enumeration", e.key),
                ));
            }
        }
        Ok(())
    }
}

impl FromIterator<(u64, usize)> for LocalPartition {
    fn from_iter<I: IntoIterator<Item = (u64, usize)>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|(key, owner)| LocalEntry {
                key,
                owner,
                free: true,
            })
            .collect();
        Self { entries }
    }
}
