//! Read engine (C9, `spec.md` §4.9): a bounded pool of read resources,
//! each a dedicated [`AsyncContext`], acquired/released under a mutex
//! for the duration of one `read()` call. Unlike the write engine,
//! reads run synchronously on the caller's thread (`spec.md` §5: "each
//! read call runs on the caller thread after acquiring a read
//! resource").
//!
//! Grounded on the reference stack's `BlockDeviceHandle::readv_blocks`
//! striped-read shape, adapted to this crate's node/zone striping
//! instead of RAID-style block devices.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::async_ctx::AsyncContext;
use crate::constants::{DEFAULT_ZONE_COUNT_PER_NODE, MAX_CALLBACK_ERR_CNT};
use crate::error::{MediaError, ZtlError};
use crate::media::{Completion, DmaBuf, IoPayload, MCmdOpcode, MCmdRequest, Media};
use crate::mempool::MemoryPool;
use crate::provisioner::Provisioner;

const IDLE_SLEEP: Duration = Duration::from_micros(1);

/// One planned mcmd within a single `read()` call (`spec.md` §4.9
/// "Plan").
#[derive(Debug, Clone, Copy)]
struct ReadPlanItem {
    addr: u64,
    nsec: u32,
    buf_off: usize,
    misalign: usize,
    cpsize: usize,
}

/// Compute the per-mcmd read plan for `(node, offset, size)`
/// (`spec.md` §4.9 steps 1-3).
fn plan_read(zone_indices: &[u32], zone_base: impl Fn(u32) -> u64, offset: u64, size: u64, sector_bytes: u64, min_read_units: u32) -> Vec<ReadPlanItem> {
    let n = zone_indices.len() as u64;
    let misalign = offset % sector_bytes;
    let sec_count = (size + misalign).div_ceil(sector_bytes);
    let sec_start = offset / sector_bytes;

    let stripe_width = n * min_read_units as u64;
    let mut level = sec_start / stripe_width;
    let pos_in_stripe = sec_start % stripe_width;
    let mut zone_idx = pos_in_stripe / min_read_units as u64;
    let mut pos_in_run = pos_in_stripe % min_read_units as u64;

    let mut items = Vec::new();
    let mut remaining_sectors = sec_count;
    let mut remaining_bytes = size;
    let mut buf_off = 0usize;
    let mut first = true;

    while remaining_sectors > 0 {
        let avail_in_run = min_read_units as u64 - pos_in_run;
        let nsec = remaining_sectors.min(avail_in_run);
        let zone_sec_off = level * min_read_units as u64 + pos_in_run;
        let zone_index = zone_indices[zone_idx as usize];
        let this_misalign = if first { misalign as usize } else { 0 };
        let cpsize = ((nsec * sector_bytes) as usize - this_misalign).min(remaining_bytes as usize);

        items.push(ReadPlanItem {
            addr: zone_base(zone_index) + zone_sec_off,
            nsec: nsec as u32,
            buf_off,
            misalign: this_misalign,
            cpsize,
        });

        buf_off += cpsize;
        remaining_bytes -= cpsize as u64;
        remaining_sectors -= nsec;
        pos_in_run = 0;
        zone_idx = (zone_idx + 1) % n;
        if zone_idx == 0 {
            level += 1;
        }
        first = false;
    }
    items
}

struct ReadResource {
    ctx: AsyncContext,
}

/// Owns `read_resource_count` async contexts and hands them out to
/// callers one at a time, plus a shared pool of pre-allocated DMA
/// bounce buffers (C2, `spec.md` §4.2/§4.9: "per-mcmd DMA bounce
/// buffers sized to the media minimum read unit").
pub struct ReadEngine {
    media: Arc<dyn Media>,
    resources: Vec<ReadResource>,
    free: Mutex<VecDeque<usize>>,
    min_read_units: u32,
    sector_bytes: u64,
    retry_max: u32,
    bounce_pool: MemoryPool<DmaBuf>,
}

impl ReadEngine {
    pub fn new(
        media: Arc<dyn Media>,
        resource_count: usize,
        min_read_units: u32,
        retry_max: u32,
    ) -> Result<Self, ZtlError> {
        let sector_bytes = media.geometry().bytes_per_sector;
        let mut resources = Vec::with_capacity(resource_count);
        let mut free = VecDeque::with_capacity(resource_count);
        for i in 0..resource_count {
            let ctx = AsyncContext::new(Arc::clone(&media), 8)?;
            resources.push(ReadResource { ctx });
            free.push_back(i);
        }

        // Sized generously against the worst case of every resource
        // reading a full stripe round at once; `MemoryPool::get`
        // returning `None` on exhaustion just falls back to a
        // backend-allocated buffer for that one mcmd, so undersizing
        // this degrades gracefully rather than blocking a reader.
        let bounce_entry_bytes = (min_read_units as u64 * sector_bytes) as usize;
        let bounce_capacity = resource_count.max(1) * DEFAULT_ZONE_COUNT_PER_NODE as usize;
        let bounce_pool = MemoryPool::create("read-bounce", bounce_capacity, |_| {
            DmaBuf::zeroed(bounce_entry_bytes)
        })
        .map_err(ZtlError::from)?;

        Ok(Self {
            media,
            resources,
            free: Mutex::new(free),
            min_read_units,
            sector_bytes,
            retry_max,
            bounce_pool,
        })
    }

    fn acquire(&self) -> usize {
        loop {
            if let Some(idx) = self.free.lock().pop_front() {
                return idx;
            }
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    fn release(&self, idx: usize) {
        self.free.lock().push_back(idx);
    }

    /// Read `buf.len()` bytes starting at byte `offset` within
    /// `node_id`'s virtual address space (`spec.md` §4.9).
    pub fn read(
        &self,
        prov: &Provisioner,
        zone_base: impl Fn(u32) -> u64,
        node_id: u32,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), ZtlError> {
        let node = prov.node(node_id);
        let plan = plan_read(
            &node.zone_indices,
            zone_base,
            offset,
            buf.len() as u64,
            self.sector_bytes,
            self.min_read_units,
        );

        let idx = self.acquire();
        let result = self.execute(idx, &plan, buf);
        self.release(idx);
        result
    }

    fn execute(&self, idx: usize, plan: &[ReadPlanItem], buf: &mut [u8]) -> Result<(), ZtlError> {
        let ctx = &self.resources[idx].ctx;

        if plan.len() == 1 {
            let item = plan[0];
            let bytes = self.submit_one_retrying(ctx, item)?;
            buf[item.buf_off..item.buf_off + item.cpsize]
                .copy_from_slice(&bytes[item.misalign..item.misalign + item.cpsize]);
            return Ok(());
        }

        let mut tokens = Vec::with_capacity(plan.len());
        for item in plan {
            let req = MCmdRequest {
                opcode: MCmdOpcode::Read,
                addr: item.addr,
                nsec: item.nsec,
                payload: IoPayload::Read {
                    len: (item.nsec as u64 * self.sector_bytes) as usize,
                    target: self.bounce_pool.get(),
                },
                seq_in_ucmd: 0,
                seq_zn: 0,
            };
            let token = ctx
                .submit_io(req)
                .map_err(|e| ZtlError::IoError {
                    retries: 0,
                    reason: e.to_string(),
                })?;
            tokens.push(token);
        }

        let mut pending: std::collections::HashMap<u64, (usize, u32)> =
            tokens.iter().enumerate().map(|(i, t)| (t.0, (i, 0))).collect();
        let mut error: Option<ZtlError> = None;

        while !pending.is_empty() {
            let drained = ctx.poke_with(plan.len(), |c: Completion| {
                let Some((item_idx, retries)) = pending.remove(&c.token.0) else {
                    return;
                };
                match c.result {
                    Ok(ok) => {
                        let item = plan[item_idx];
                        if let Some(data) = ok.data {
                            let bytes = data.as_slice();
                            buf[item.buf_off..item.buf_off + item.cpsize]
                                .copy_from_slice(&bytes[item.misalign..item.misalign + item.cpsize]);
                            self.bounce_pool.put(data);
                        }
                    }
                    Err(e) if retries < MAX_CALLBACK_ERR_CNT => {
                        let item = plan[item_idx];
                        let req = MCmdRequest {
                            opcode: MCmdOpcode::Read,
                            addr: item.addr,
                            nsec: item.nsec,
                            payload: IoPayload::Read {
                                len: (item.nsec as u64 * self.sector_bytes) as usize,
                                target: self.bounce_pool.get(),
                            },
                            seq_in_ucmd: 0,
                            seq_zn: 0,
                        };
                        warn!("read mcmd retry {}/{}: {}", retries + 1, MAX_CALLBACK_ERR_CNT, e);
                        if let Ok(token) = ctx.submit_io(req) {
                            pending.insert(token.0, (item_idx, retries + 1));
                        }
                    }
                    Err(e) => {
                        error!("read mcmd abandoned after {} retries: {}", retries, e);
                        error.get_or_insert(ZtlError::IoError {
                            retries,
                            reason: e.to_string(),
                        });
                    }
                }
            });
            if drained == 0 {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        error.map_or(Ok(()), Err)
    }

    fn submit_one_retrying(&self, ctx: &AsyncContext, item: ReadPlanItem) -> Result<Vec<u8>, ZtlError> {
        let mut attempt = 0;
        loop {
            let req = MCmdRequest {
                opcode: MCmdOpcode::Read,
                addr: item.addr,
                nsec: item.nsec,
                payload: IoPayload::Read {
                    len: (item.nsec as u64 * self.sector_bytes) as usize,
                    target: self.bounce_pool.get(),
                },
                seq_in_ucmd: 0,
                seq_zn: 0,
            };
            let token = ctx.submit_io(req).map_err(|e: MediaError| ZtlError::IoError {
                retries: attempt,
                reason: e.to_string(),
            })?;
            let out: Mutex<Option<Result<Vec<u8>, MediaError>>> = Mutex::new(None);
            ctx.wait(
                1,
                |c| {
                    if c.token == token {
                        *out.lock() = Some(c.result.map(|ok| {
                            ok.data
                                .map(|d| {
                                    let bytes = d.as_slice().to_vec();
                                    self.bounce_pool.put(d);
                                    bytes
                                })
                                .unwrap_or_default()
                        }));
                    }
                },
                || out.lock().is_some(),
            );
            match out.into_inner().expect("wait() only returns once done() is true") {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < self.retry_max => {
                    attempt += 1;
                    warn!("read retry {}/{}: {}", attempt, self.retry_max, e);
                }
                Err(e) => {
                    return Err(ZtlError::IoError {
                        retries: attempt,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    pub fn media(&self) -> &Arc<dyn Media> {
        &self.media
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::null_zns::NullZnsParams;
    use crate::media::{IoPayload as Payload, MCmdOpcode as Op, NullZns, ZoneSnapshot};
    use crate::zmd::ZoneMetadata;

    fn harness() -> (Arc<dyn Media>, Arc<ZoneMetadata>, Provisioner) {
        let media: Arc<dyn Media> = Arc::new(NullZns::new(NullZnsParams {
            zone_count: 4,
            zone_sectors: 64,
            sector_bytes: 512,
            reserved_zones: 0,
        }));
        let report: Vec<ZoneSnapshot> = media.zone_report().unwrap();
        let zmd = Arc::new(ZoneMetadata::from_report(report));
        let prov = Provisioner::build(&zmd, 4, 8).unwrap();
        (media, zmd, prov)
    }

    fn seed_zone(media: &Arc<dyn Media>, zone_base: u64, pattern: u8) {
        let ctx = media.init_context(4).unwrap();
        let data = vec![pattern; 512];
        media
            .submit_io(
                ctx,
                MCmdRequest {
                    opcode: Op::Write,
                    addr: zone_base,
                    nsec: 1,
                    payload: Payload::Write {
                        data: Arc::from(data.into_boxed_slice()),
                        offset: 0,
                        len: 512,
                    },
                    seq_in_ucmd: 0,
                    seq_zn: 0,
                },
            )
            .unwrap();
        media.poke(ctx, 8);
        media.term_context(ctx).unwrap();
    }

    #[test]
    fn single_zone_read_round_trips() {
        let (media, zmd, prov) = harness();
        let node = prov.node(0);
        let first_zone_base = zmd.zone(node.zone_indices[0]).base;
        seed_zone(&media, first_zone_base, 0xAB);

        let engine = ReadEngine::new(Arc::clone(&media), 2, 8, 3).unwrap();
        let mut buf = vec![0u8; 512];
        engine
            .read(&prov, |zi| zmd.zone(zi).base, 0, 0, &mut buf)
            .unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn plan_splits_across_zones_on_stripe_boundary() {
        let items = plan_read(&[0, 1, 2, 3], |zi| zi as u64 * 64, 0, 8 * 4 * 512, 512, 8);
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].addr, 0);
        assert_eq!(items[1].addr, 64);
    }
}
