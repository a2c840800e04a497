//! Sized record exchanges: counts first, then payloads.
//!
//! [`exchange_all`] is the personalized all-to-all used by the collective
//! build steps (translator, assembly stash, ghost-layer growth).
//! [`exchange_known`] is the neighbour-only variant used once both sides
//! already agree on message sizes (halo and column scatters).

use bytemuck::Pod;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, decode_vec};
use crate::bridge_error::BridgeError;

/// Collective: send `outgoing[r]` to every rank `r` and return what every
/// rank sent to us, indexed by source rank. `outgoing.len()` must equal the
/// communicator size. The self slot is moved locally.
pub fn exchange_all<T, C>(
    comm: &C,
    tag: CommTag,
    mut outgoing: Vec<Vec<T>>,
) -> Result<Vec<Vec<T>>, BridgeError>
where
    T: Pod,
    C: Communicator,
{
    let size = comm.size();
    let me = comm.rank();
    if outgoing.len() != size {
        return Err(BridgeError::size_mismatch(
            "exchange_all outgoing buckets",
            size,
            outgoing.len(),
        ));
    }
    let mut incoming: Vec<Vec<T>> = (0..size).map(|_| Vec::new()).collect();
    incoming[me] = std::mem::take(&mut outgoing[me]);
    if size == 1 {
        return Ok(incoming);
    }

    let size_tag = tag.as_u16();
    let data_tag = tag.offset(1).as_u16();

    // 1) sizes
    let counts: Vec<WireCount> = outgoing.iter().map(|v| WireCount::new(v.len())).collect();
    let mut pending = Vec::with_capacity(2 * size);
    for peer in (0..size).filter(|&p| p != me) {
        pending.push(comm.isend(
            peer,
            size_tag,
            cast_slice(std::slice::from_ref(&counts[peer])),
        ));
    }
    let recv_counts = match (0..size)
        .map(|peer| -> Result<usize, BridgeError> {
            if peer == me {
                return Ok(0);
            }
            let counts = recv_exact::<WireCount, C>(comm, peer, size_tag, 1)?;
            Ok(counts[0].get())
        })
        .collect::<Result<Vec<usize>, BridgeError>>()
    {
        Ok(counts) => counts,
        Err(err) => return settle(pending, Err(err)),
    };

    // 2) payloads
    for peer in (0..size).filter(|&p| p != me) {
        pending.push(comm.isend(peer, data_tag, cast_slice(&outgoing[peer])));
    }
    let received = (0..size).filter(|&p| p != me).try_for_each(|peer| -> Result<(), BridgeError> {
        incoming[peer] = recv_exact::<T, C>(comm, peer, data_tag, recv_counts[peer])?;
        Ok(())
    });
    settle(pending, received.map(|()| incoming))
}

/// Exchange with neighbours whose message sizes are already agreed on.
/// `sends` and `recvs` list `(peer, payload)` and `(peer, record count)`.
/// Collective over the ranks named on both sides.
pub fn exchange_known<T, C>(
    comm: &C,
    tag: CommTag,
    sends: &[(usize, Vec<T>)],
    recvs: &[(usize, usize)],
) -> Result<Vec<Vec<T>>, BridgeError>
where
    T: Pod,
    C: Communicator,
{
    let t = tag.as_u16();
    let pending: Vec<_> = sends
        .iter()
        .map(|(peer, payload)| comm.isend(*peer, t, cast_slice(payload)))
        .collect();
    let out = recvs
        .iter()
        .map(|&(peer, count)| recv_exact::<T, C>(comm, peer, t, count))
        .collect();
    settle(pending, out)
}

/// Complete every posted send before handing back `result`, error or not.
fn settle<H: Wait, R>(pending: Vec<H>, result: Result<R, BridgeError>) -> Result<R, BridgeError> {
    for send in pending {
        send.wait();
    }
    result
}

/// Collective: turn a per-rank outcome into a group outcome. If any rank
/// failed, every rank fails; ranks that succeeded locally return the error
/// built by `remote` from the list of failing ranks.
pub fn agree<T, C, F>(comm: &C, local: Result<T, BridgeError>, remote: F) -> Result<T, BridgeError>
where
    C: Communicator,
    F: FnOnce(Vec<usize>) -> BridgeError,
{
    let flags = comm.allgather_u64(u64::from(local.is_err()))?;
    let failing: Vec<usize> = flags
        .iter()
        .enumerate()
        .filter_map(|(r, &f)| (f != 0).then_some(r))
        .collect();
    match local {
        Ok(_) if !failing.is_empty() => Err(remote(failing)),
        other => other,
    }
}

fn recv_exact<T, C>(comm: &C, peer: usize, tag: u16, count: usize) -> Result<Vec<T>, BridgeError>
where
    T: Pod,
    C: Communicator,
{
    let expected = count * std::mem::size_of::<T>();
    let mut buf = vec![0u8; expected];
    let raw = comm
        .irecv(peer, tag, &mut buf)
        .wait()
        .ok_or_else(|| BridgeError::CommError {
            neighbor: peer,
            reason: "no payload received".into(),
        })?;
    if raw.len() != expected {
        return Err(BridgeError::BufferSizeMismatch {
            neighbor: peer,
            expected,
            got: raw.len(),
        });
    }
    Ok(decode_vec(&raw))
}
