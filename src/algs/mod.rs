//! Communication primitives shared by every adapter.

pub mod communicator;
pub mod exchange;
pub mod wire;

pub use communicator::{CommId, CommTag, Communicator, NoComm, ThreadComm};
pub use exchange::{agree, exchange_all, exchange_known};
