//! Invariant checking for the index and layout types.
//!
//! Checks run after construction in debug builds and whenever the
//! `check-invariants` feature is enabled; release builds skip them.

use crate::bridge_error::BridgeError;

/// Trait for validating data structure invariants.
pub trait DebugInvariants {
    /// Panic on a broken invariant when invariant checking is enabled.
    fn debug_assert_invariants(&self);
    /// Validate invariants and return the first error encountered.
    fn validate_invariants(&self) -> Result<(), BridgeError>;

    /// Validate when checking is enabled and hand the value back.
    fn checked(self) -> Result<Self, BridgeError>
    where
        Self: Sized,
    {
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        self.validate_invariants()?;
        Ok(self)
    }
}

/// Run a fallible check and panic on error when invariant checking is enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}
