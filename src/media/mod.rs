//! Media abstraction (`spec.md` §4.1): the seam between the engine and a
//! connected ZNS device. Grounded on the reference stack's
//! `ZonedBlockDevice` / `BlockDeviceHandle` traits, adapted from their
//! callback-based dispatch to a pull-based completion model that suits
//! this crate's single-threaded cooperative context (`spec.md` §4.3,
//! §9 design note on "asynchronous callback with self-referential
//! UCmd").
//!
//! Submission returns a [`CompletionToken`]; the owning context's
//! [`Media::poke`] later yields a batch of [`Completion`]s the caller
//! matches back against its own in-flight command bookkeeping. No
//! callback pointer or raw buffer pointer crosses the trait boundary.
pub mod geometry;
pub mod null_zns;
pub mod uri;

pub use geometry::DeviceGeometry;
pub use null_zns::NullZns;
pub use uri::{Backend, DeviceUri};

use std::sync::Arc;

use crate::error::MediaError;

/// Device-reported zone state (`spec.md` §3 Zone).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    Empty,
    EOpen,
    IOpen,
    Closed,
    Full,
}

/// Zone flag set (`spec.md` §3 Zone; §9 design note on bit-packed
/// structs: explicit named accessors instead of a C-style bitfield).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ZoneFlags(u8);

impl ZoneFlags {
    pub const USED: Self = Self(1 << 0);
    pub const OPEN: Self = Self(1 << 1);
    pub const RSVD: Self = Self(1 << 2);
    pub const AVLB: Self = Self(1 << 3);
    pub const COLD: Self = Self(1 << 4);
    pub const META: Self = Self(1 << 5);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: Self) {
        self.0 &= !flag.0;
    }
}

impl std::ops::BitOr for ZoneFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A point-in-time snapshot of one zone, as returned by a device zone
/// report. Used to seed the zone metadata table (C4) at startup and to
/// answer `submit_zn(..., Report)` queries.
#[derive(Debug, Clone, Copy)]
pub struct ZoneSnapshot {
    pub index: u32,
    pub base: u64,
    pub capacity: u64,
    pub wp: u64,
    pub state: ZoneState,
    pub flags: ZoneFlags,
}

/// Media command opcode (`spec.md` §4.1 `submit_io`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MCmdOpcode {
    Read,
    Write,
    Append,
}

/// Zone management opcode (`spec.md` §4.1 `submit_zn`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZnOpcode {
    Open,
    Close,
    Finish,
    Reset,
    Report,
}

/// Target of a zone management command. `Reset` is the only opcode that
/// accepts `AllInNode` ("RESET may target a single zone or select-all",
/// `spec.md` §4.1).
#[derive(Debug, Clone)]
pub enum ZnTarget {
    Zone(u32),
    AllInNode(Vec<u32>),
}

#[derive(Debug, Clone)]
pub struct ZnRequest {
    pub opcode: ZnOpcode,
    pub target: ZnTarget,
}

/// Outcome of a zone management command. Only `Report` carries a
/// payload; it is "a newly-allocated descriptor vector owned by the
/// caller" per `spec.md` §4.1 — here that's just an owned `Vec`, so
/// there is nothing further to free.
#[derive(Debug, Clone)]
pub enum ZnOutcome {
    Done,
    Report(Vec<ZoneSnapshot>),
}

/// Source or sink for one media command's data. Writes share a slice of
/// the caller's original buffer via `Arc` rather than copying it per
/// mcmd; reads carry only a length, the device attaches the data to the
/// resulting [`Completion`].
#[derive(Debug, Clone)]
pub enum IoPayload {
    Write {
        data: Arc<[u8]>,
        offset: usize,
        len: usize,
    },
    Read {
        len: usize,
        /// A caller-supplied bounce buffer the backend fills in place of
        /// allocating its own, when present (`spec.md` §4.9: "per-mcmd
        /// DMA bounce buffers"; `crate::mempool::MemoryPool` is the
        /// allocator [`crate::read_engine::ReadEngine`] draws these
        /// from). `None` falls back to backend-allocated scratch space.
        target: Option<DmaBuf>,
    },
}

/// A single media command (`spec.md` §3 MCmd), minus the callback and
/// DMA pointer fields the reference struct carries — those are
/// replaced by the token/poke protocol described above.
#[derive(Debug, Clone)]
pub struct MCmdRequest {
    pub opcode: MCmdOpcode,
    pub addr: u64,
    pub nsec: u32,
    pub payload: IoPayload,
    pub seq_in_ucmd: u32,
    pub seq_zn: u32,
}

/// Opaque handle to an async context allocated by a [`Media`]
/// implementation (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncCtxId(pub u32);

/// Opaque handle a submitted command's eventual [`Completion`] arrives
/// tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionToken(pub u64);

/// Successful completion payload.
#[derive(Debug)]
pub struct CompletionOk {
    /// Device-returned physical address (append) or the submitted
    /// address (write/read), echoing `spec.md`'s "physical address
    /// into the UCmd's moffset" callback behavior.
    pub addr: u64,
    /// Present only for reads.
    pub data: Option<DmaBuf>,
}

/// One drained completion, as returned by [`Media::poke`].
#[derive(Debug)]
pub struct Completion {
    pub token: CompletionToken,
    pub result: Result<CompletionOk, MediaError>,
}

/// A DMA-aligned buffer. In this crate's only backend (an in-memory
/// simulated device) alignment is nominal; the type exists so engine
/// code never depends on `Vec<u8>` directly and a real-driver backend
/// could later swap in page-aligned allocation without changing call
/// sites.
#[derive(Debug, Clone)]
pub struct DmaBuf {
    data: Vec<u8>,
}

impl DmaBuf {
    pub fn zeroed(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The media abstraction (C1). One implementation, [`NullZns`], backs
/// every test in this crate; a real NVMe/io_uring backend is an
/// external collaborator (`spec.md` §1) and is not implemented here.
///
/// `submit_misc`'s `ASYNCH_INIT` / `TERM` / `POKE` / `OUTS` / `WAIT`
/// sub-opcodes (`spec.md` §4.1) are exposed as dedicated methods below
/// rather than a single opcode-dispatched entry point, in keeping with
/// `spec.md` §9's direction to replace raw opcode/function-pointer
/// dispatch with capability traits.
pub trait Media: Send + Sync {
    fn geometry(&self) -> DeviceGeometry;

    /// Full device zone report, consumed once at startup to build the
    /// zone metadata table (C4).
    fn zone_report(&self) -> Result<Vec<ZoneSnapshot>, MediaError>;

    fn init_context(&self, depth: usize) -> Result<AsyncCtxId, MediaError>;

    fn term_context(&self, ctx: AsyncCtxId) -> Result<(), MediaError>;

    /// Dispatch a READ, WRITE, or APPEND. Returns immediately with a
    /// token; the result arrives from a later [`Media::poke`] call.
    fn submit_io(
        &self,
        ctx: AsyncCtxId,
        req: MCmdRequest,
    ) -> Result<CompletionToken, MediaError>;

    /// Dispatch a zone management command. Implementations may
    /// complete this synchronously; `NullZns` does.
    fn submit_zn(&self, req: ZnRequest) -> Result<ZnOutcome, MediaError>;

    /// Drain up to `max` completions for `ctx`. Never blocks.
    fn poke(&self, ctx: AsyncCtxId, max: usize) -> Vec<Completion>;

    /// Number of commands submitted to `ctx` with no completion yet.
    fn outstanding(&self, ctx: AsyncCtxId) -> usize;

    fn dma_alloc(&self, size: u64) -> Result<DmaBuf, MediaError>;
}
