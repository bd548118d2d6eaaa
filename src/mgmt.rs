//! Management worker (C7, `spec.md` §4.7): a single thread serializing
//! zone FINISH/RESET submissions so the device never sees concurrent
//! zone-management commands for the same node.
//!
//! The FIFO itself is grounded on the reference stack's
//! `work_queue::WorkQueue` (an unbounded `crossbeam::queue::SegQueue`
//! wrapper); the worker loop's idle-sleep-on-empty-poll shape follows
//! `core::reactor::Reactor`'s poll loop.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::queue::SegQueue;

use crate::constants::{MGMT_IDLE_SLEEP_MICROS, MGMT_MAX_RETRY};
use crate::media::{Media, ZnOpcode, ZnRequest, ZnTarget};
use crate::provisioner::Provisioner;
use crate::zmd::ZoneMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtOpcode {
    FinishZone,
    ResetZone,
}

#[derive(Debug, Clone, Copy)]
pub struct MgmtRequest {
    pub node_id: u32,
    pub opcode: MgmtOpcode,
}

struct MgmtQueue {
    incoming: SegQueue<MgmtRequest>,
    len: AtomicU64,
}

impl MgmtQueue {
    fn new() -> Self {
        Self {
            incoming: SegQueue::new(),
            len: AtomicU64::new(0),
        }
    }

    fn enqueue(&self, req: MgmtRequest) {
        trace!("management op enqueued for node {}", req.node_id);
        self.incoming.push(req);
        self.len.fetch_add(1, Ordering::AcqRel);
    }

    fn take(&self) -> Option<MgmtRequest> {
        let item = self.incoming.pop();
        if item.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }
}

/// Owns the FIFO and the worker thread. Dropping it requests a
/// cooperative stop and joins the thread, draining whatever is already
/// queued first.
pub struct ManagementWorker {
    queue: Arc<MgmtQueue>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ManagementWorker {
    pub fn spawn(media: Arc<dyn Media>, zmd: Arc<ZoneMetadata>, prov: Arc<Provisioner>) -> Self {
        let queue = Arc::new(MgmtQueue::new());
        let running = Arc::new(AtomicBool::new(true));

        let worker_queue = Arc::clone(&queue);
        let worker_running = Arc::clone(&running);
        let handle = std::thread::spawn(move || {
            run(media, zmd, prov, worker_queue, worker_running);
        });

        Self {
            queue,
            running,
            handle: Some(handle),
        }
    }

    pub fn enqueue(&self, req: MgmtRequest) {
        self.queue.enqueue(req);
    }

    pub fn pending(&self) -> u64 {
        self.queue.len()
    }
}

impl Drop for ManagementWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    media: Arc<dyn Media>,
    zmd: Arc<ZoneMetadata>,
    prov: Arc<Provisioner>,
    queue: Arc<MgmtQueue>,
    running: Arc<AtomicBool>,
) {
    loop {
        match queue.take() {
            Some(req) => process(&media, &zmd, &prov, req),
            None => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                std::thread::sleep(Duration::from_micros(MGMT_IDLE_SLEEP_MICROS));
            }
        }
    }
}

/// Issue FINISH/RESET for every zone in `req.node_id`'s node, serially,
/// retrying each zone up to `MGMT_MAX_RETRY` times. A zone that
/// exhausts its retries is counted against the node's error counter and
/// skipped; the node-level reset-to-free transition only happens once
/// every zone in the node has been issued (`spec.md` §4.7).
fn process(media: &Arc<dyn Media>, zmd: &Arc<ZoneMetadata>, prov: &Arc<Provisioner>, req: MgmtRequest) {
    let node = prov.node(req.node_id);
    let zn_opcode = match req.opcode {
        MgmtOpcode::FinishZone => ZnOpcode::Finish,
        MgmtOpcode::ResetZone => ZnOpcode::Reset,
    };
    let mut failed = false;

    for &zone_index in &node.zone_indices {
        let mut attempt = 0;
        loop {
            let outcome = media.submit_zn(ZnRequest {
                opcode: zn_opcode,
                target: ZnTarget::Zone(zone_index),
            });
            match outcome {
                Ok(_) => {
                    let zone = zmd.zone(zone_index);
                    match req.opcode {
                        MgmtOpcode::FinishZone => zone.mark_finished(),
                        MgmtOpcode::ResetZone => zone.mark_reset(),
                    }
                    break;
                }
                Err(e) => if attempt < MGMT_MAX_RETRY {
                    attempt += 1;
                    warn!(
                        "management op retry {}/{} on zone {}: {}",
                        attempt, MGMT_MAX_RETRY, zone_index, e
                    );
                } else {
                    node.error_count.fetch_add(1, Ordering::AcqRel);
                    error!(
                        "management op abandoned on zone {} after {} retries: {}",
                        zone_index, attempt, e
                    );
                    failed = true;
                    break;
                },
            }
        }
    }

    // Only a fully-reset node (every zone's wp back at zero) is safe to
    // reuse; handing one back with a stale wp reproduces the same
    // "addr < zone.wp" rejection the write path guards against
    // (`spec.md` §4.7: a node returns to the free list on successful
    // full-node reset).
    if req.opcode == MgmtOpcode::ResetZone && !failed {
        prov.return_to_free_list(req.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::null_zns::NullZnsParams;
    use crate::media::{NullZns, ZoneSnapshot, ZoneState};
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
    fn reset_zone_returns_node_to_free_list() {
        let (media, zmd, prov) = harness();
        let node_id = prov.get_node(None).unwrap();
        prov.reserve(&zmd, node_id, 32, 0).unwrap();
        prov.node(node_id).advance_after_write(32);

        let worker = ManagementWorker::spawn(media, Arc::clone(&zmd), Arc::clone(&prov));
        worker.enqueue(MgmtRequest {
            node_id,
            opcode: MgmtOpcode::ResetZone,
        });

        let mut waited = 0;
        while prov.free_count() == 0 && waited < 100 {
            std::thread::sleep(Duration::from_millis(5));
            waited += 1;
        }
        assert_eq!(prov.free_count(), 1);
        for &zi in &prov.node(node_id).zone_indices {
            assert_eq!(zmd.zone(zi).state(), ZoneState::Empty);
        }
    }
}
