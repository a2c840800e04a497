//! Ownership/index translation: local enumerations, ownership ranges and
//! the immutable local ⇄ global maps every adapter consults.

pub mod map;
pub mod partition;
pub mod range;
pub mod translator;

pub use map::{EntryKind, IndexMap, MapVersion, SharedIndexMap};
pub use partition::{LocalEntry, LocalPartition};
pub use range::{OwnershipLayout, OwnershipRange};
pub use translator::IndexTranslator;
