#![cfg_attr(docsrs, feature(doc_cfg))]
//! # ngs-petsc
//!
//! A bridge between a finite-element discretization toolkit and a
//! distributed sparse linear-algebra toolkit. It translates the
//! discretization's rank-local enumeration of degrees of freedom into
//! contiguous global numberings, converts meshes, vectors and matrices
//! between both sides, and drives Krylov, preconditioner, eigen and
//! nonlinear solvers on the converted data.
//!
//! ## Layers
//! - [`index`]: local partitions, ownership ranges and immutable
//!   local ⇄ global maps ([`index::IndexTranslator`]).
//! - [`mesh`]: rank-local topology ⇄ [`mesh::DistributedMesh`], with ghost
//!   layer growth.
//! - [`vector`] and [`matrix`]: distributed vectors and matrices, assembled
//!   from local triplets or wrapped around operator actions.
//! - [`solver`]: KSP, PC, EPS and SNES adapters configured from an
//!   [`solver::OptionsDb`].
//!
//! ## Communicators
//! Everything collective is generic over [`algs::Communicator`]. The serial
//! [`algs::NoComm`] and the in-process [`algs::ThreadComm`] are always
//! available; `MpiComm` comes with the `mpi-support` feature.
//!
//! ## Failure policy
//! Argument checks run locally before any communication. Failures that can
//! only be detected inside a collective are agreed across ranks, so every
//! rank returns the same error or ends a solve in the same state.

pub mod algs;
pub mod bridge_error;
pub mod debug_invariants;
pub mod index;
pub mod matrix;
pub mod mesh;
pub mod overlap;
pub mod solver;
pub mod topology;
pub mod vector;

pub use bridge_error::BridgeError;
pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, ThreadComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::bridge_error::BridgeError;
    pub use crate::index::{IndexTranslator, LocalPartition, SharedIndexMap};
    pub use crate::matrix::{
        AssemblyOptions, DistributedMatrix, OperatorAction, assemble_to_distributed,
        wrap_operator,
    };
    pub use crate::mesh::{DistributedMesh, ImportOptions, export_mesh, import_mesh};
    pub use crate::solver::{
        EigenSolver, EpsOptions, JacobianSource, KspOptions, LinearSolver, NonlinearSolver,
        OptionsDb, PcOptions, Preconditioner, SnesOptions, SolverState, StopReason,
    };
    pub use crate::topology::{CellType, LabelSet, LocalTopology};
    pub use crate::vector::{DistributedVector, from_distributed, to_distributed};
}
