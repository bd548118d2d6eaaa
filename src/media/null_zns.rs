//! `NullZns`: an in-memory simulated ZNS device implementing [`Media`].
//!
//! A real NVMe/ZNS driver shim is an external collaborator (`spec.md`
//! §1, out of scope); this backend is what every test in the crate
//! runs against, the same role the reference stack's `nullblk`-backed
//! bdev plays in its own `tests/zns.rs`. Submission and data transfer
//! happen synchronously (there is no real device latency to hide);
//! only completion *delivery* is deferred to [`Media::poke`], which is
//! what makes the cooperative-completion contract observable in tests.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::MediaError;

use super::{
    AsyncCtxId, Completion, CompletionOk, CompletionToken, DeviceGeometry, DmaBuf, IoPayload,
    MCmdOpcode, MCmdRequest, Media, ZnOpcode, ZnOutcome, ZnRequest, ZnTarget, ZoneFlags,
    ZoneSnapshot, ZoneState,
};

struct ZoneCell {
    base: u64,
    capacity: u64,
    wp: AtomicU64,
    state: Mutex<ZoneState>,
    flags: Mutex<ZoneFlags>,
    data: Mutex<Vec<u8>>,
}

struct ContextState {
    queue: Mutex<VecDeque<Completion>>,
    outstanding: AtomicUsize,
}

/// Construction parameters, taken from the `null://` URI query string
/// (`spec.md` §4.1's URI grammar extended per `src/media/uri.rs`'s
/// doc comment).
#[derive(Debug, Clone, Copy)]
pub struct NullZnsParams {
    pub zone_count: u32,
    pub zone_sectors: u64,
    pub sector_bytes: u64,
    pub reserved_zones: u32,
}

impl Default for NullZnsParams {
    fn default() -> Self {
        Self {
            zone_count: 8,
            zone_sectors: 256,
            sector_bytes: 4096,
            reserved_zones: 2,
        }
    }
}

impl NullZnsParams {
    fn from_query(params: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let get_u32 = |key: &str, default: u32| {
            params
                .get(key)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(default)
        };
        let get_u64 = |key: &str, default: u64| {
            params
                .get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };
        Self {
            zone_count: get_u32("zones", defaults.zone_count),
            zone_sectors: get_u64("zone_sectors", defaults.zone_sectors),
            sector_bytes: get_u64("sector_bytes", defaults.sector_bytes),
            reserved_zones: get_u32("reserved", defaults.reserved_zones),
        }
    }
}

/// An in-memory simulated ZNS device.
pub struct NullZns {
    params: NullZnsParams,
    zones: Vec<ZoneCell>,
    contexts: Mutex<HashMap<u32, Arc<ContextState>>>,
    next_ctx_id: AtomicU32,
    next_token: AtomicU64,
}

impl NullZns {
    pub fn new(params: NullZnsParams) -> Self {
        let zone_bytes = (params.zone_sectors * params.sector_bytes) as usize;
        let zones = (0..params.zone_count)
            .map(|i| {
                let reserved = i < params.reserved_zones;
                let mut flags = ZoneFlags::empty();
                if reserved {
                    flags.insert(ZoneFlags::RSVD);
                } else {
                    flags.insert(ZoneFlags::AVLB);
                }
                ZoneCell {
                    base: i as u64 * params.zone_sectors,
                    capacity: params.zone_sectors,
                    wp: AtomicU64::new(i as u64 * params.zone_sectors),
                    state: Mutex::new(ZoneState::Empty),
                    flags: Mutex::new(flags),
                    data: Mutex::new(vec![0u8; zone_bytes]),
                }
            })
            .collect();
        Self {
            params,
            zones,
            contexts: Mutex::new(HashMap::new()),
            next_ctx_id: AtomicU32::new(1),
            next_token: AtomicU64::new(1),
        }
    }

    /// Construct from a `null://<name>?...` URI's parsed query params.
    pub fn from_uri_params(params: &HashMap<String, String>) -> Self {
        Self::new(NullZnsParams::from_query(params))
    }

    fn zone_index_for_addr(&self, addr: u64) -> Option<usize> {
        self.zones
            .iter()
            .position(|z| addr >= z.base && addr < z.base + z.capacity)
    }

    fn ctx_state(&self, ctx: AsyncCtxId) -> Result<Arc<ContextState>, MediaError> {
        self.contexts
            .lock()
            .get(&ctx.0)
            .cloned()
            .ok_or(MediaError::NotConnected)
    }

    fn do_io(&self, req: &MCmdRequest) -> Result<CompletionOk, MediaError> {
        let zone_ix = self.zone_index_for_addr(req.addr).ok_or_else(|| {
            MediaError::SubmitRejected {
                reason: format!("address {} is not within any zone", req.addr),
            }
        })?;
        let zone = &self.zones[zone_ix];

        match req.opcode {
            MCmdOpcode::Write | MCmdOpcode::Append => {
                let (data, offset, len) = match &req.payload {
                    IoPayload::Write { data, offset, len } => (data, *offset, *len),
                    IoPayload::Read { .. } => {
                        return Err(MediaError::SubmitRejected {
                            reason: "write/append requires a write payload".to_string(),
                        })
                    }
                };
                let addr = if req.opcode == MCmdOpcode::Append {
                    zone.wp.fetch_add(req.nsec as u64, Ordering::AcqRel)
                } else {
                    if req.addr < zone.wp.load(Ordering::Acquire) {
                        return Err(MediaError::SubmitRejected {
                            reason: "write address precedes the zone write pointer".to_string(),
                        });
                    }
                    zone.wp.store(req.addr + req.nsec as u64, Ordering::Release);
                    req.addr
                };
                let byte_off = ((addr - zone.base) * self.params.sector_bytes) as usize;
                let byte_len = (req.nsec as u64 * self.params.sector_bytes) as usize;
                let mut backing = zone.data.lock();
                if byte_off + byte_len > backing.len() {
                    return Err(MediaError::SubmitRejected {
                        reason: "write exceeds zone capacity".to_string(),
                    });
                }
                let src = &data[offset..offset + len.min(byte_len)];
                backing[byte_off..byte_off + src.len()].copy_from_slice(src);
                *zone.state.lock() = ZoneState::IOpen;
                Ok(CompletionOk { addr, data: None })
            }
            MCmdOpcode::Read => {
                let byte_off = ((req.addr - zone.base) * self.params.sector_bytes) as usize;
                let byte_len = (req.nsec as u64 * self.params.sector_bytes) as usize;
                let backing = zone.data.lock();
                if byte_off + byte_len > backing.len() {
                    return Err(MediaError::SubmitRejected {
                        reason: "read exceeds zone capacity".to_string(),
                    });
                }
                let target = match &req.payload {
                    IoPayload::Read { target, .. } => target.clone(),
                    IoPayload::Write { .. } => None,
                };
                // A pooled bounce buffer may be larger than this mcmd's
                // transfer size (it is sized to the minimum read unit);
                // only the leading `byte_len` bytes are meaningful.
                let mut out = match target {
                    Some(buf) if buf.len() >= byte_len => buf,
                    _ => DmaBuf::zeroed(byte_len),
                };
                out.as_mut_slice()[..byte_len]
                    .copy_from_slice(&backing[byte_off..byte_off + byte_len]);
                Ok(CompletionOk {
                    addr: req.addr,
                    data: Some(out),
                })
            }
        }
    }

    fn reset_zone(&self, ix: usize) -> Result<(), MediaError> {
        let zone = &self.zones[ix];
        zone.wp.store(zone.base, Ordering::Release);
        zone.data.lock().iter_mut().for_each(|b| *b = 0);
        *zone.state.lock() = ZoneState::Empty;
        let mut flags = zone.flags.lock();
        flags.remove(ZoneFlags::USED);
        flags.remove(ZoneFlags::OPEN);
        Ok(())
    }

    fn finish_zone(&self, ix: usize) -> Result<(), MediaError> {
        let zone = &self.zones[ix];
        zone.wp.store(zone.base + zone.capacity, Ordering::Release);
        *zone.state.lock() = ZoneState::Full;
        Ok(())
    }

    fn snapshot(&self, ix: usize) -> ZoneSnapshot {
        let zone = &self.zones[ix];
        ZoneSnapshot {
            index: ix as u32,
            base: zone.base,
            capacity: zone.capacity,
            wp: zone.wp.load(Ordering::Acquire),
            state: *zone.state.lock(),
            flags: *zone.flags.lock(),
        }
    }
}

impl Media for NullZns {
    fn geometry(&self) -> DeviceGeometry {
        DeviceGeometry {
            groups: 1,
            pus_per_group: 1,
            zones_per_pu: self.params.zone_count,
            sectors_per_zone: self.params.zone_sectors,
            bytes_per_sector: self.params.sector_bytes,
        }
    }

    fn zone_report(&self) -> Result<Vec<ZoneSnapshot>, MediaError> {
        Ok((0..self.zones.len()).map(|ix| self.snapshot(ix)).collect())
    }

    fn init_context(&self, _depth: usize) -> Result<AsyncCtxId, MediaError> {
        let id = self.next_ctx_id.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().insert(
            id,
            Arc::new(ContextState {
                queue: Mutex::new(VecDeque::new()),
                outstanding: AtomicUsize::new(0),
            }),
        );
        Ok(AsyncCtxId(id))
    }

    fn term_context(&self, ctx: AsyncCtxId) -> Result<(), MediaError> {
        self.contexts.lock().remove(&ctx.0);
        Ok(())
    }

    fn submit_io(
        &self,
        ctx: AsyncCtxId,
        req: MCmdRequest,
    ) -> Result<CompletionToken, MediaError> {
        let state = self.ctx_state(ctx)?;
        let token = CompletionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let result = self.do_io(&req);
        state.queue.lock().push_back(Completion { token, result });
        state.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(token)
    }

    fn submit_zn(&self, req: ZnRequest) -> Result<ZnOutcome, MediaError> {
        match req.opcode {
            ZnOpcode::Report => Ok(ZnOutcome::Report(self.zone_report()?)),
            ZnOpcode::Reset => {
                match &req.target {
                    ZnTarget::Zone(ix) => self.reset_zone(*ix as usize)?,
                    ZnTarget::AllInNode(ixs) => {
                        for ix in ixs {
                            self.reset_zone(*ix as usize)?;
                        }
                    }
                }
                Ok(ZnOutcome::Done)
            }
            ZnOpcode::Finish => {
                match &req.target {
                    ZnTarget::Zone(ix) => self.finish_zone(*ix as usize)?,
                    ZnTarget::AllInNode(ixs) => {
                        for ix in ixs {
                            self.finish_zone(*ix as usize)?;
                        }
                    }
                }
                Ok(ZnOutcome::Done)
            }
            ZnOpcode::Open => {
                if let ZnTarget::Zone(ix) = &req.target {
                    *self.zones[*ix as usize].state.lock() = ZoneState::EOpen;
                }
                Ok(ZnOutcome::Done)
            }
            ZnOpcode::Close => {
                if let ZnTarget::Zone(ix) = &req.target {
                    *self.zones[*ix as usize].state.lock() = ZoneState::Closed;
                }
                Ok(ZnOutcome::Done)
            }
        }
    }

    fn poke(&self, ctx: AsyncCtxId, max: usize) -> Vec<Completion> {
        let state = match self.ctx_state(ctx) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let mut queue = state.queue.lock();
        let n = max.min(queue.len());
        let drained: Vec<Completion> = queue.drain(..n).collect();
        state
            .outstanding
            .fetch_sub(drained.len(), Ordering::AcqRel);
        drained
    }

    fn outstanding(&self, ctx: AsyncCtxId) -> usize {
        self.ctx_state(ctx)
            .map(|s| s.outstanding.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn dma_alloc(&self, size: u64) -> Result<DmaBuf, MediaError> {
        Ok(DmaBuf::zeroed(size as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn device() -> NullZns {
        NullZns::new(NullZnsParams {
            zone_count: 4,
            zone_sectors: 64,
            sector_bytes: 512,
            reserved_zones: 0,
        })
    }

    #[test]
    fn write_then_read_round_trips() {
        let dev = device();
        let ctx = dev.init_context(16).unwrap();
        let payload: Vec<u8> = (0..512u32).map(|i| (i % 256) as u8).collect();
        let req = MCmdRequest {
            opcode: MCmdOpcode::Write,
            addr: 0,
            nsec: 1,
            payload: IoPayload::Write {
                data: StdArc::from(payload.clone().into_boxed_slice()),
                offset: 0,
                len: 512,
            },
            seq_in_ucmd: 0,
            seq_zn: 0,
        };
        dev.submit_io(ctx, req).unwrap();
        let completions = dev.poke(ctx, 8);
        assert_eq!(completions.len(), 1);
        assert!(completions[0].result.is_ok());

        let read_req = MCmdRequest {
            opcode: MCmdOpcode::Read,
            addr: 0,
            nsec: 1,
            payload: IoPayload::Read {
                len: 512,
                target: None,
            },
            seq_in_ucmd: 0,
            seq_zn: 0,
        };
        dev.submit_io(ctx, read_req).unwrap();
        let completions = dev.poke(ctx, 8);
        let ok = completions[0].result.as_ref().unwrap();
        assert_eq!(ok.data.as_ref().unwrap().as_slice(), payload.as_slice());
    }

    #[test]
    fn append_advances_write_pointer() {
        let dev = device();
        let ctx = dev.init_context(16).unwrap();
        let payload: Vec<u8> = vec![7u8; 512];
        for _ in 0..3 {
            let req = MCmdRequest {
                opcode: MCmdOpcode::Append,
                addr: 0,
                nsec: 1,
                payload: IoPayload::Write {
                    data: StdArc::from(payload.clone().into_boxed_slice()),
                    offset: 0,
                    len: 512,
                },
                seq_in_ucmd: 0,
                seq_zn: 0,
            };
            dev.submit_io(ctx, req).unwrap();
        }
        let completions = dev.poke(ctx, 8);
        let addrs: Vec<u64> = completions
            .iter()
            .map(|c| c.result.as_ref().unwrap().addr)
            .collect();
        assert_eq!(addrs, vec![0, 1, 2]);
    }

    #[test]
    fn reset_zone_rewinds_write_pointer() {
        let dev = device();
        dev.submit_zn(ZnRequest {
            opcode: ZnOpcode::Finish,
            target: ZnTarget::Zone(0),
        })
        .unwrap();
        let report = dev.zone_report().unwrap();
        assert_eq!(report[0].state, ZoneState::Full);
        assert_eq!(report[0].wp, report[0].base + report[0].capacity);

        dev.submit_zn(ZnRequest {
            opcode: ZnOpcode::Reset,
            target: ZnTarget::Zone(0),
        })
        .unwrap();
        let report = dev.zone_report().unwrap();
        assert_eq!(report[0].state, ZoneState::Empty);
        assert_eq!(report[0].wp, report[0].base);
    }

    #[test]
    fn reserved_zones_are_flagged() {
        let dev = NullZns::new(NullZnsParams {
            zone_count: 4,
            zone_sectors: 64,
            sector_bytes: 512,
            reserved_zones: 2,
        });
        let report = dev.zone_report().unwrap();
        assert!(report[0].flags.contains(ZoneFlags::RSVD));
        assert!(report[1].flags.contains(ZoneFlags::RSVD));
        assert!(!report[2].flags.contains(ZoneFlags::RSVD));
    }
}
