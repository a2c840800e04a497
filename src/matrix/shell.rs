//! Matrix-free operators.

use std::sync::Arc;

use crate::bridge_error::BridgeError;
use crate::index::map::SharedIndexMap;
use crate::matrix::{DistributedMatrix, OperatorId, Storage};

/// Action of a linear operator on one rank.
///
/// `x` is the input in column-map local order, ghosts refreshed; the result
/// is the owned-row segment, in owned order. Implementations must be pure:
/// identical input gives bit-identical output.
pub trait OperatorAction: Send + Sync {
    fn apply(&self, x: &[f64]) -> Result<Vec<f64>, BridgeError>;
}

impl<F> OperatorAction for F
where
    F: Fn(&[f64]) -> Vec<f64> + Send + Sync,
{
    fn apply(&self, x: &[f64]) -> Result<Vec<f64>, BridgeError> {
        Ok(self(x))
    }
}

/// Deterministic probe input, a function of the global index only so that
/// ghost copies see their owner's value. Constrained entries get 0.
pub(crate) fn probe_input(map: &SharedIndexMap) -> Vec<f64> {
    const GOLDEN: f64 = 0.618_033_988_749_894_9;
    (0..map.local_size())
        .map(|l| {
            map.global(l)
                .map_or(0.0, |g| ((g as f64 + 1.0) * GOLDEN).fract() - 0.5)
        })
        .collect()
}

/// Local: wrap an operator action as a matrix-free handle.
///
/// The action is probed twice on the same pseudo-random input; both outputs
/// must be bit-identical and exactly as long as the row ownership width.
///
/// # Errors
/// `CommunicatorMismatch` if the maps live on different communicators,
/// `IndexMapMismatch` on an output of the wrong length, `CallbackFailed` if
/// the action fails or is not deterministic.
pub fn wrap_operator<A>(
    action: A,
    row_map: &SharedIndexMap,
    col_map: &SharedIndexMap,
) -> Result<DistributedMatrix, BridgeError>
where
    A: OperatorAction + 'static,
{
    if row_map.comm_id() != col_map.comm_id() {
        return Err(BridgeError::CommunicatorMismatch {
            expected: row_map.comm_id(),
            found: col_map.comm_id(),
        });
    }
    let id = OperatorId::fresh();
    let input = probe_input(col_map);
    let first = action.apply(&input)?;
    let second = action.apply(&input)?;
    for out in [&first, &second] {
        if out.len() != row_map.n_owned() {
            return Err(BridgeError::size_mismatch(
                format!("{id}: operator action output vs. row ownership width"),
                row_map.n_owned(),
                out.len(),
            ));
        }
    }
    if first
        .iter()
        .zip(&second)
        .any(|(a, b)| a.to_bits() != b.to_bits())
    {
        return Err(BridgeError::CallbackFailed(format!(
            "{id}: operator action is not deterministic"
        )));
    }
    log::debug!("wrapped {id} as a matrix-free operator ({} owned rows)", row_map.n_owned());
    Ok(DistributedMatrix {
        id,
        row_map: Arc::clone(row_map),
        col_map: Arc::clone(col_map),
        block_size: 1,
        storage: Storage::MatrixFree(Arc::new(action)),
    })
}
