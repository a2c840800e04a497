//! Overlap (ghost) communication: scatter plans and insert modes.

pub mod scatter;

pub use scatter::{InsertMode, ScatterPlan};
