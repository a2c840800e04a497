//! Discretization-side mesh topology: cell types, labels and the rank-local
//! point enumeration consumed by the mesh adapter.

pub mod cell_type;
pub mod labels;
pub mod local;

pub use cell_type::CellType;
pub use labels::LabelSet;
pub use local::LocalTopology;
