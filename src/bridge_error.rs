//! BridgeError: unified error type for ngs-petsc public APIs
//!
//! Every conversion and solver entry point returns `Result<_, BridgeError>`.
//! Variants carry enough context (rank, communicator, map version, operator
//! identity) to reproduce the failure.

use thiserror::Error;

use crate::algs::communicator::CommId;
use crate::matrix::OperatorId;
use crate::solver::state::SolverState;

/// Unified error type for ngs-petsc operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    /// Two ranks claim the same entity, a ghost references an entity nobody
    /// owns, or the local partition input is malformed.
    #[error("inconsistent partition (rank {rank}): {reason}")]
    InconsistentPartition { rank: usize, reason: String },
    /// Entity kind without a representation on the algebra side.
    #[error("unsupported topology: {0}")]
    UnsupportedTopology(String),
    /// Local sizes or layouts disagree with the index map in use.
    #[error("index map mismatch in {what}: expected {expected}, found {found}")]
    IndexMapMismatch {
        what: String,
        expected: usize,
        found: usize,
    },
    /// Pattern validation found an owned row without entries.
    #[error("singular pattern in operator {operator}: owned row {global} has no entries")]
    SingularPattern { operator: OperatorId, global: u64 },
    /// Solve requested on a finished solver without a fresh `bind`.
    #[error("stale solver state: {solver} is {state}; bind an operator before solving again")]
    StaleSolverState {
        solver: &'static str,
        state: SolverState,
    },
    /// Handles from different communicators were combined.
    #[error("communicator mismatch: handle lives on {expected}, call used {found}")]
    CommunicatorMismatch { expected: CommId, found: CommId },
    /// Solve requested before any `bind`.
    #[error("{solver} is not configured; bind an operator first")]
    SolverNotConfigured { solver: &'static str },
    /// `result()` called when no result exists.
    #[error("no result available: {solver} is {state}")]
    ResultUnavailable {
        solver: &'static str,
        state: SolverState,
    },
    /// Unknown or malformed solver option.
    #[error("invalid option `{key}`: {reason}")]
    InvalidOption { key: String, reason: String },
    /// A user callback rejected its input or broke its contract.
    #[error("callback failed: {0}")]
    CallbackFailed(String),
    /// Point-to-point communication failed.
    #[error("communication error with rank {neighbor}: {reason}")]
    CommError { neighbor: usize, reason: String },
    /// A received message had an unexpected size.
    #[error("buffer size mismatch from rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
}

impl BridgeError {
    pub(crate) fn size_mismatch(what: impl Into<String>, expected: usize, found: usize) -> Self {
        BridgeError::IndexMapMismatch {
            what: what.into(),
            expected,
            found,
        }
    }

    pub(crate) fn partition(rank: usize, reason: impl Into<String>) -> Self {
        BridgeError::InconsistentPartition {
            rank,
            reason: reason.into(),
        }
    }
}
