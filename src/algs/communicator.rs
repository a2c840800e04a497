//! Thin façade over serial, intra-process (threads) or inter-process (MPI)
//! message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! Point-to-point handles are **waitable** but non-blocking; callers `.wait()`
//! before they trust that a buffer is ready. Messages between one pair of
//! ranks with one tag are delivered in FIFO order.
//!
//! # Collectives
//!
//! `barrier`, `allgather` and the `allreduce_*` helpers block until every rank
//! of the communicator has entered the same call. A rank that skips a
//! collective its peers entered deadlocks the whole group; this is a caller
//! obligation and is never detected here.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};

use bytes::Bytes;
use dashmap::DashMap;

use crate::bridge_error::BridgeError;

/// Identity of a communicator; handles built on one communicator refuse to
/// interact with handles from another.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct CommId(u64);

static NEXT_COMM_ID: AtomicU64 = AtomicU64::new(1);

impl CommId {
    /// The serial world shared by every [`NoComm`].
    pub const SERIAL: CommId = CommId(0);

    /// Allocate a process-unique id.
    pub fn fresh() -> Self {
        CommId(NEXT_COMM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comm#{}", self.0)
    }
}

/// Message tag; each communication phase uses its own tag so that phases
/// can never steal each other's messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        CommTag(tag)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// Derived tag `base + k`, used by phases that need several tags.
    pub const fn offset(self, k: u16) -> Self {
        CommTag(self.0.wrapping_add(k))
    }
}

/// Tags reserved by this crate, each the base of a family of `FAMILY_SPAN`
/// tags. Every tag stays at or below `MAX`, the smallest `MPI_TAG_UB` an MPI
/// implementation may report. User code that shares a communicator with the
/// adapters should stay below `0x1000`.
pub mod tags {
    use super::CommTag;
    pub const MAX: u16 = 0x7FFF;
    pub const FAMILY_SPAN: u16 = 0x100;
    pub const TRANSLATOR: CommTag = CommTag::new(0x1000);
    pub const HALO_PLAN: CommTag = CommTag::new(0x1100);
    pub const HALO_FORWARD: CommTag = CommTag::new(0x1200);
    pub const HALO_REVERSE: CommTag = CommTag::new(0x1300);
    pub const MAT_STASH: CommTag = CommTag::new(0x2000);
    pub const MAT_SCATTER_PLAN: CommTag = CommTag::new(0x2100);
    pub const MAT_SCATTER: CommTag = CommTag::new(0x2200);
    pub const MESH_OVERLAP: CommTag = CommTag::new(0x3000);
    pub const MESH_PULL_BACK: CommTag = CommTag::new(0x3100);
    pub const ALLGATHER: CommTag = CommTag::new(0x7F00);

    pub const RESERVED: [CommTag; 10] = [
        TRANSLATOR,
        HALO_PLAN,
        HALO_FORWARD,
        HALO_REVERSE,
        MAT_STASH,
        MAT_SCATTER_PLAN,
        MAT_SCATTER,
        MESH_OVERLAP,
        MESH_PULL_BACK,
        ALLGATHER,
    ];
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Non-blocking point-to-point interface plus the few collectives the
/// adapters need.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn id(&self) -> CommId;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Collective: block until every rank arrives.
    fn barrier(&self);

    /// True for the compile-time serial communicator.
    fn is_no_comm(&self) -> bool {
        false
    }

    /// Collective: gather `mine` from every rank into `out` (rank-major).
    /// All ranks must pass buffers of the same length; a peer whose block
    /// has another length fails with `BufferSizeMismatch`.
    fn allgather(&self, mine: &[u8], out: &mut [u8]) -> Result<(), BridgeError> {
        let n = mine.len();
        let rank = self.rank();
        let size = self.size();
        if out.len() != n * size {
            return Err(BridgeError::BufferSizeMismatch {
                neighbor: rank,
                expected: n * size,
                got: out.len(),
            });
        }
        let tag = tags::ALLGATHER.as_u16();
        let sends: Vec<_> = (0..size)
            .filter(|&peer| peer != rank)
            .map(|peer| self.isend(peer, tag, mine))
            .collect();
        out[rank * n..(rank + 1) * n].copy_from_slice(mine);
        let mut problem = None;
        for peer in (0..size).filter(|&peer| peer != rank) {
            let mut scratch = vec![0u8; n];
            let got = self.irecv(peer, tag, &mut scratch).wait().unwrap_or_default();
            if got.len() == n {
                out[peer * n..(peer + 1) * n].copy_from_slice(&got);
            } else {
                problem.get_or_insert(BridgeError::BufferSizeMismatch {
                    neighbor: peer,
                    expected: n,
                    got: got.len(),
                });
            }
        }
        for s in sends {
            s.wait();
        }
        problem.map_or(Ok(()), Err)
    }

    /// Collective: element-wise sum over ranks. Every rank adds the
    /// contributions in rank order, so all ranks observe bit-identical
    /// results.
    fn allreduce_sum(&self, local: &[f64]) -> Result<Vec<f64>, BridgeError> {
        let size = self.size();
        if size == 1 {
            return Ok(local.to_vec());
        }
        let mine: &[u8] = bytemuck::cast_slice(local);
        let mut gathered = vec![0u8; mine.len() * size];
        self.allgather(mine, &mut gathered)?;
        let mut out = vec![0.0f64; local.len()];
        for chunk in gathered.chunks_exact(mine.len().max(1)).take(size) {
            let vals: Vec<f64> = chunk
                .chunks_exact(8)
                .map(|b| f64::from_ne_bytes(b.try_into().unwrap_or([0; 8])))
                .collect();
            for (o, v) in out.iter_mut().zip(vals) {
                *o += v;
            }
        }
        Ok(out)
    }

    /// Collective: maximum over ranks.
    fn allreduce_max(&self, local: u64) -> Result<u64, BridgeError> {
        Ok(self.allgather_u64(local)?.into_iter().max().unwrap_or(local))
    }

    /// Collective: one `u64` from every rank, in rank order.
    fn allgather_u64(&self, local: u64) -> Result<Vec<u64>, BridgeError> {
        let size = self.size();
        if size == 1 {
            return Ok(vec![local]);
        }
        let mut gathered = vec![0u8; 8 * size];
        self.allgather(&local.to_le_bytes(), &mut gathered)?;
        Ok(gathered
            .chunks_exact(8)
            .map(|b| u64::from_le_bytes(b.try_into().unwrap_or([0; 8])))
            .collect())
    }
}

/// Compile-time no-op comm for pure serial runs.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn id(&self) -> CommId {
        CommId::SERIAL
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
    fn barrier(&self) {}
    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- ThreadComm: several ranks inside one process, one thread per rank ---
type Key = (usize, usize, u16); // (src, dst, tag)

struct Universe {
    id: CommId,
    size: usize,
    mailbox: DashMap<Key, VecDeque<Bytes>>,
    barrier: Barrier,
}

/// In-process communicator: `size` ranks sharing a mailbox.
///
/// Each rank must be driven by its own thread; a blocking receive spins
/// until the matching send is posted.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    universe: Arc<Universe>,
}

impl fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.universe.size)
            .field("id", &self.universe.id)
            .finish()
    }
}

impl ThreadComm {
    /// Create the `size` rank handles of a fresh communicator.
    pub fn universe(size: usize) -> Vec<ThreadComm> {
        let size = size.max(1);
        let universe = Arc::new(Universe {
            id: CommId::fresh(),
            size,
            mailbox: DashMap::new(),
            barrier: Barrier::new(size),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                universe: Arc::clone(&universe),
            })
            .collect()
    }

    /// Run `f` on `size` ranks, one scoped thread each, and return the
    /// per-rank results in rank order.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(ThreadComm) -> R + Sync,
    {
        let comms = ThreadComm::universe(size);
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    scope.spawn(move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

/// Receive handle of [`ThreadComm`].
pub struct LocalHandle {
    universe: Arc<Universe>,
    key: Key,
    len: usize,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        loop {
            let popped = self
                .universe
                .mailbox
                .get_mut(&self.key)
                .and_then(|mut queue| queue.pop_front());
            if let Some(bytes) = popped {
                let len = self.len.min(bytes.len());
                return Some(bytes[..len].to_vec());
            }
            std::thread::yield_now();
        }
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.universe.size
    }
    fn id(&self) -> CommId {
        self.universe.id
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, tag);
        self.universe
            .mailbox
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        LocalHandle {
            universe: Arc::clone(&self.universe),
            key: (peer, self.rank, tag),
            len: buf.len(),
        }
    }

    fn barrier(&self) {
        self.universe.barrier.wait();
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// MPI communicator wrapper. The caller keeps the `mpi::environment::Universe`
    /// alive for as long as any `MpiComm` exists.
    pub struct MpiComm {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
        id: CommId,
    }

    // Each rank drives its communicator from a single thread.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        /// Initialize MPI and wrap `MPI_COMM_WORLD`.
        pub fn init() -> Result<(mpi::environment::Universe, MpiComm), BridgeError> {
            let universe = mpi::initialize().ok_or_else(|| BridgeError::CommError {
                neighbor: 0,
                reason: "MPI was already initialized".into(),
            })?;
            let comm = MpiComm::new(universe.world());
            Ok((universe, comm))
        }

        /// Wrap an existing communicator (world or a sub-communicator).
        pub fn new(world: SimpleCommunicator) -> Self {
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                world,
                rank,
                size,
                id: CommId::fresh(),
            }
        }

        pub fn raw(&self) -> &SimpleCommunicator {
            &self.world
        }
    }

    pub struct MpiSendHandle {
        req: Request<'static, [u8], StaticScope>,
        ptr: *mut u8,
        len: usize,
    }

    pub struct MpiRecvHandle {
        req: Request<'static, [u8], StaticScope>,
        ptr: *mut u8,
        len: usize,
    }

    fn leak(len: usize, init: Option<&[u8]>) -> (&'static mut [u8], *mut u8) {
        let boxed = match init {
            Some(src) => src.to_vec().into_boxed_slice(),
            None => vec![0u8; len].into_boxed_slice(),
        };
        let slice: &'static mut [u8] = Box::leak(boxed);
        let ptr = slice.as_mut_ptr();
        (slice, ptr)
    }

    unsafe fn reclaim(ptr: *mut u8, len: usize) -> Vec<u8> {
        // SAFETY: `ptr`/`len` come from `leak` and the request has completed.
        unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)).into_vec() }
    }

    impl Wait for MpiSendHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            drop(unsafe { reclaim(self.ptr, self.len) });
            None
        }
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            Some(unsafe { reclaim(self.ptr, self.len) })
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }
        fn id(&self) -> CommId {
            self.id
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            debug_assert!(tag <= tags::MAX, "tag {tag:#x} above the portable MPI_TAG_UB");
            let len = buf.len();
            let (data, ptr) = leak(len, Some(buf));
            let data: &'static [u8] = data;
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, i32::from(tag));
            MpiSendHandle { req, ptr, len }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiRecvHandle {
            debug_assert!(tag <= tags::MAX, "tag {tag:#x} above the portable MPI_TAG_UB");
            let len = buf.len();
            let (data, ptr) = leak(len, None);
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, data, i32::from(tag));
            MpiRecvHandle { req, ptr, len }
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn allgather(&self, mine: &[u8], out: &mut [u8]) -> Result<(), BridgeError> {
            let expected = mine.len() * self.size;
            if out.len() != expected {
                return Err(BridgeError::BufferSizeMismatch {
                    neighbor: self.rank,
                    expected,
                    got: out.len(),
                });
            }
            self.world.all_gather_into(mine, out);
            Ok(())
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
