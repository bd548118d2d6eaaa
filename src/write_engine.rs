//! Write engine (C8, `spec.md` §4.8): one OS thread per level, each
//! owning its own [`AsyncContext`] and a FIFO of [`UCmd`]s. A UCmd is
//! split into fixed `min_write_units`-sector mcmds, striped round-robin
//! across the zones a single `Provisioner::reserve` call hands back,
//! with per-zone gating so writes to one zone never overtake each
//! other in submission order.
//!
//! Grounded on the reference stack's per-core reactor poll loop
//! (`core::reactor::Reactor::poll`, `usleep`-on-empty) for the worker
//! shape, and on `core::thread::spawn_unaffinitized` for plain
//! `std::thread::spawn` worker threads (this crate has no SPDK
//! core/reactor affinity model to hook into).
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::queue::SegQueue;

use crate::async_ctx::AsyncContext;
use crate::constants::{MAX_CALLBACK_ERR_CNT, MAX_MCMD, WRITE_POKE_BURST};
use crate::error::{ProvisionError, ZtlError};
use crate::media::{Completion, IoPayload, MCmdOpcode, MCmdRequest, Media};
use crate::provisioner::{ProvAddrEntry, Provisioner};
use crate::ucmd::{Piece, UCmd};
use crate::zmd::ZoneMetadata;

/// Suspension granularity for the per-zone gating busy-wait and the
/// worker's empty-queue poll (`spec.md` §5: "usleep(1)").
const IDLE_SLEEP: Duration = Duration::from_micros(1);

pub struct WriteEngine {
    queues: Vec<Arc<SegQueue<Arc<UCmd>>>>,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WriteEngine {
    pub fn spawn(
        media: Arc<dyn Media>,
        zmd: Arc<ZoneMetadata>,
        prov: Arc<Provisioner>,
        level_count: usize,
        min_write_units: u32,
        ctx_depth: usize,
    ) -> Result<Self, ZtlError> {
        let sector_bytes = media.geometry().bytes_per_sector;
        let running = Arc::new(AtomicBool::new(true));
        let mut queues = Vec::with_capacity(level_count);
        let mut handles = Vec::with_capacity(level_count);

        for level in 0..level_count {
            let queue = Arc::new(SegQueue::new());
            queues.push(Arc::clone(&queue));

            let media = Arc::clone(&media);
            let zmd = Arc::clone(&zmd);
            let prov = Arc::clone(&prov);
            let running = Arc::clone(&running);
            let ctx = AsyncContext::new(media, ctx_depth)?;

            let handle = std::thread::spawn(move || {
                level_worker(
                    ctx,
                    zmd,
                    prov,
                    queue,
                    running,
                    level as u32,
                    min_write_units,
                    sector_bytes,
                );
            });
            handles.push(handle);
        }

        Ok(Self {
            queues,
            running,
            handles,
        })
    }

    pub fn submit(&self, level: usize, ucmd: Arc<UCmd>) {
        self.queues[level].push(ucmd);
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WriteEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn level_worker(
    ctx: AsyncContext,
    zmd: Arc<ZoneMetadata>,
    prov: Arc<Provisioner>,
    queue: Arc<SegQueue<Arc<UCmd>>>,
    running: Arc<AtomicBool>,
    level: u32,
    min_write_units: u32,
    sector_bytes: u64,
) {
    let mut bound_node: Option<u32> = None;
    loop {
        match queue.pop() {
            Some(ucmd) => {
                if let Err(e) = process_ucmd(
                    &ctx,
                    &zmd,
                    &prov,
                    min_write_units,
                    sector_bytes,
                    level,
                    &mut bound_node,
                    &ucmd,
                ) {
                    ucmd.set_error(e);
                    ucmd.mark_one_done();
                }
            }
            None => {
                if !running.load(Ordering::Acquire) && ctx.outstanding() == 0 {
                    break;
                }
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }
}

/// One bookkeeping entry for an mcmd in flight, keyed by its
/// [`crate::media::CompletionToken`].
struct Inflight {
    entry_idx: usize,
    req: MCmdRequest,
    retries: u32,
}

fn process_ucmd(
    ctx: &AsyncContext,
    zmd: &ZoneMetadata,
    prov: &Provisioner,
    min_write_units: u32,
    sector_bytes: u64,
    level: u32,
    bound_node: &mut Option<u32>,
    ucmd: &Arc<UCmd>,
) -> Result<(), ZtlError> {
    let align = sector_bytes * min_write_units as u64;
    if ucmd.size % align != 0 {
        return Err(ProvisionError::Unaligned {
            size: ucmd.size,
            align,
        }
        .into());
    }
    let nsec = ucmd.size / sector_bytes;
    let ncmd_total = (nsec / min_write_units as u64) as u32;
    if ncmd_total as usize > MAX_MCMD {
        return Err(ProvisionError::TooManyPieces {
            count: ncmd_total as usize,
        }
        .into());
    }
    ucmd.set_target_count(ncmd_total);

    let data = ucmd
        .data
        .clone()
        .expect("write UCmds always carry their payload");

    let mut units_remaining = ncmd_total;
    let mut buf_cursor = 0usize;
    let mut pieces_emitted = 0u32;
    // mcmds actually submitted so far; every early-return below must
    // lower `target_count` to this before erroring out, since
    // `target_count` was optimistically set to the full `ncmd_total`
    // above and the caller's single unwinding `mark_one_done()` call
    // can only ever advance the completion counter by one more than
    // this (`spec.md` §9 Open Question 1).
    let mut mcmds_submitted = 0u32;

    while units_remaining > 0 {
        let node_id = match prov.get_node(*bound_node) {
            Ok(id) => id,
            Err(e) => {
                ucmd.set_target_count(mcmds_submitted);
                return Err(e.into());
            }
        };
        *bound_node = Some(node_id);
        let node = prov.node(node_id);

        pieces_emitted += 1;
        if pieces_emitted > 2 {
            ucmd.set_target_count(mcmds_submitted);
            return Err(ProvisionError::TooManyPieces {
                count: pieces_emitted as usize,
            }
            .into());
        }

        let node_left_units = node.left.load(Ordering::Acquire) as u32;
        let take = units_remaining.min(node_left_units);
        let piece_start = node.used.load(Ordering::Acquire) as u32;
        ucmd.push_piece(Piece {
            node_id,
            start: piece_start,
            num: take,
        });

        let entries = match prov.reserve(zmd, node_id, take, level) {
            Ok(entries) => entries,
            Err(e) => {
                ucmd.set_target_count(mcmds_submitted);
                return Err(e.into());
            }
        };
        submit_take(
            ctx,
            min_write_units,
            sector_bytes,
            ucmd,
            &data,
            &entries,
            &mut buf_cursor,
        );
        mcmds_submitted += take;
        node.advance_after_write(take as u64);
        units_remaining -= take;
    }
    Ok(())
}

/// Submit every mcmd for one node reservation round, gated per zone so
/// a zone never has two writes in flight at once, draining completions
/// until every mcmd in this round has resolved (`spec.md` §4.8 steps
/// 4-7).
fn submit_take(
    ctx: &AsyncContext,
    min_write_units: u32,
    sector_bytes: u64,
    ucmd: &Arc<UCmd>,
    data: &Arc<[u8]>,
    entries: &[ProvAddrEntry],
    buf_cursor: &mut usize,
) {
    let n = entries.len();
    let mut remaining: Vec<u32> = entries.iter().map(|e| e.units).collect();
    let mut used_units: Vec<u32> = vec![0; n];
    let minflight: Vec<AtomicBool> = (0..n).map(|_| AtomicBool::new(false)).collect();
    let mut pending: HashMap<u64, Inflight> = HashMap::new();
    let total_units: u32 = remaining.iter().sum();

    let mut cursor = 0usize;
    let mut submitted_since_poke = 0usize;
    let mut seq_in_ucmd = 0u32;

    for _ in 0..total_units {
        while remaining[cursor] == 0 {
            cursor = (cursor + 1) % n;
        }
        let i = cursor;
        cursor = (cursor + 1) % n;

        while minflight[i].load(Ordering::Acquire) {
            let drained = ctx.poke_with(WRITE_POKE_BURST, |c| {
                resolve_completion(c, &mut pending, &minflight, ucmd, ctx)
            });
            if drained == 0 {
                std::thread::sleep(IDLE_SLEEP);
            }
        }

        let addr = entries[i].addr + used_units[i] as u64 * min_write_units as u64;
        used_units[i] += 1;
        remaining[i] -= 1;

        let len = (min_write_units as u64 * sector_bytes) as usize;
        let offset = *buf_cursor;
        *buf_cursor += len;

        let req = MCmdRequest {
            opcode: MCmdOpcode::Write,
            addr,
            nsec: min_write_units,
            payload: IoPayload::Write {
                data: Arc::clone(data),
                offset,
                len,
            },
            seq_in_ucmd,
            seq_zn: i as u32,
        };
        seq_in_ucmd += 1;

        minflight[i].store(true, Ordering::Release);
        match ctx.submit_io(req.clone()) {
            Ok(token) => {
                pending.insert(
                    token.0,
                    Inflight {
                        entry_idx: i,
                        req,
                        retries: 0,
                    },
                );
            }
            Err(e) => {
                minflight[i].store(false, Ordering::Release);
                ucmd.set_error(ZtlError::IoError {
                    retries: 0,
                    reason: e.to_string(),
                });
                ucmd.mark_one_done();
            }
        }

        submitted_since_poke += 1;
        if submitted_since_poke >= WRITE_POKE_BURST {
            ctx.poke_with(WRITE_POKE_BURST, |c| {
                resolve_completion(c, &mut pending, &minflight, ucmd, ctx)
            });
            submitted_since_poke = 0;
        }
    }

    while !pending.is_empty() {
        let drained = ctx.poke_with(WRITE_POKE_BURST, |c| {
            resolve_completion(c, &mut pending, &minflight, ucmd, ctx)
        });
        if drained == 0 {
            std::thread::sleep(IDLE_SLEEP);
        }
    }
}

/// Resolve one drained completion: clear the zone's gate, and on
/// success or exhausted retries count it toward the UCmd's completion
/// target (`spec.md` §4.8 "write callback").
fn resolve_completion(
    c: Completion,
    pending: &mut HashMap<u64, Inflight>,
    minflight: &[AtomicBool],
    ucmd: &Arc<UCmd>,
    ctx: &AsyncContext,
) {
    let Some(inflight) = pending.remove(&c.token.0) else {
        return;
    };
    minflight[inflight.entry_idx].store(false, Ordering::Release);
    match c.result {
        Ok(_) => {
            ucmd.mark_one_done();
        }
        Err(e) if inflight.retries < MAX_CALLBACK_ERR_CNT => {
            warn!(
                "write mcmd retry {}/{} on zone sequence {}: {}",
                inflight.retries + 1,
                MAX_CALLBACK_ERR_CNT,
                inflight.entry_idx,
                e
            );
            let req = inflight.req.clone();
            if let Ok(token) = ctx.submit_io(req.clone()) {
                minflight[inflight.entry_idx].store(true, Ordering::Release);
                pending.insert(
                    token.0,
                    Inflight {
                        entry_idx: inflight.entry_idx,
                        req,
                        retries: inflight.retries + 1,
                    },
                );
            } else {
                ucmd.set_error(ZtlError::IoError {
                    retries: inflight.retries + 1,
                    reason: e.to_string(),
                });
                ucmd.mark_one_done();
            }
        }
        Err(e) => {
            error!(
                "write mcmd abandoned after {} retries: {}",
                inflight.retries, e
            );
            ucmd.set_error(ZtlError::IoError {
                retries: inflight.retries,
                reason: e.to_string(),
            });
            ucmd.mark_one_done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::null_zns::NullZnsParams;
    use crate::media::{NullZns, ZoneSnapshot};
    use std::time::Duration;

    fn harness() -> (Arc<dyn Media>, Arc<ZoneMetadata>, Arc<Provisioner>) {
        let media: Arc<dyn Media> = Arc::new(NullZns::new(NullZnsParams {
            zone_count: 4,
            zone_sectors: 64,
            sector_bytes: 512,
            reserved_zones: 0,
        }));
        let report: Vec<ZoneSnapshot> = media.zone_report().unwrap();
        let zmd = Arc::new(ZoneMetadata::from_report(report));
        let prov = Arc::new(Provisioner::build(&zmd, 4, 8).unwrap());
        (media, zmd, prov)
    }

    #[test]
    fn write_completes_and_reports_one_piece() {
        let (media, zmd, prov) = harness();
        let engine = WriteEngine::spawn(media, zmd, prov, 1, 8, 16).unwrap();

        let size = 8 * 512 * 2; // 2 write-units
        let data: Arc<[u8]> = Arc::from(vec![9u8; size as usize].into_boxed_slice());
        let ucmd = Arc::new(UCmd::new_write(data, size, 0));
        engine.submit(0, Arc::clone(&ucmd));

        let mut waited = 0;
        while !ucmd.is_completed() && waited < 200 {
            std::thread::sleep(Duration::from_millis(5));
            waited += 1;
        }
        assert!(ucmd.is_completed());
        assert!(ucmd.take_error().is_none());
        let pieces = ucmd.pieces();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].num, 2);
    }

    #[test]
    fn rejects_misaligned_size() {
        let (media, zmd, prov) = harness();
        let engine = WriteEngine::spawn(media, zmd, prov, 1, 8, 16).unwrap();
        let data: Arc<[u8]> = Arc::from(vec![1u8; 100].into_boxed_slice());
        let ucmd = Arc::new(UCmd::new_write(data, 100, 0));
        engine.submit(0, Arc::clone(&ucmd));

        let mut waited = 0;
        while !ucmd.is_completed() && waited < 200 {
            std::thread::sleep(Duration::from_millis(5));
            waited += 1;
        }
        assert!(ucmd.is_completed());
        assert!(ucmd.take_error().is_some());
    }
}
