//! End-to-end scenarios S1-S6 and the FS-metadata replay law
//! (`spec.md` §8), driven entirely through the public façade
//! ([`ztl::ZtlEngine`]) plus direct use of [`ztl::fsmeta::FsMetaLog`]
//! for the replay-across-restart scenario, which has no façade
//! equivalent.
//!
//! Scaled-down geometry: `spec.md` §8 quotes its scenarios against
//! `sector_bytes=4096, N=64, min_write_units=8`, i.e. a 2 MiB node.
//! These tests use `sector_bytes=512, N=4, min_write_units=8` (a
//! 16 KiB node) so the same behavior is exercised without allocating
//! megabytes of in-memory zone backing per test. Every assertion below
//! is scaled by the same factor the geometry is scaled by, so the
//! *shape* of each scenario (single-node write, full-node spill,
//! trim-to-reset, misaligned read) is preserved exactly.
//!
//! One deliberate deviation from the literal numbers in `spec.md` §8's
//! S1/S2 prose: those examples' `num` values are expressed in raw
//! sectors, while `spec.md` §3 and §6 define a mapping tuple's `num`
//! as "units of the media minimum write size" (and the reservation
//! algorithm in §4.5 operates in the same unit). This implementation
//! follows the formal §3/§6 definition throughout — the same
//! convention the unit tests in `src/write_engine.rs` and
//! `src/provisioner.rs` already assume — so the piece counts below are
//! expressed in write-units, not sectors. See `DESIGN.md`.
use std::time::Duration;

use ztl::provisioner::NodeStatus;
use ztl::{Config, ZtlEngine};

const SECTOR_BYTES: u64 = 512;
const MIN_WRITE_UNITS: u32 = 8;
const ZONES_PER_NODE: u32 = 4;
const WRITE_UNIT_BYTES: u64 = SECTOR_BYTES * MIN_WRITE_UNITS as u64;

fn harness(uri: &str) -> ZtlEngine {
    let config = Config {
        uri: uri.to_string(),
        zone_count_per_node: ZONES_PER_NODE,
        level_count: 2,
        min_write_units: MIN_WRITE_UNITS,
        min_read_units: MIN_WRITE_UNITS,
        node_mgmt_pool_size: 8,
        read_resource_count: 2,
        write_retry_max: 3,
        read_retry_max: 3,
        meta_write_retry_max: 3,
        compact_on_replay: true,
        log_filter: "error".to_string(),
    };
    ZtlEngine::init(config).unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

fn wait_until(mut pred: impl FnMut() -> bool, attempts: u32, step: Duration) -> bool {
    for _ in 0..attempts {
        if pred() {
            return true;
        }
        std::thread::sleep(step);
    }
    pred()
}

/// S1 — Aligned single-node write/read: write exactly one write-unit to
/// level 0, then read it back byte for byte.
#[test]
fn s1_aligned_single_node_write_read() {
    let engine = harness("null://s1?zones=10&zone_sectors=64&sector_bytes=512&reserved=2");
    let data = pattern(WRITE_UNIT_BYTES as usize);

    let pieces = engine.write(&data, 0).unwrap();
    assert_eq!(pieces.len(), 1);
    assert_eq!(pieces[0].node_id, 0);
    assert_eq!(pieces[0].start, 0);
    assert_eq!(pieces[0].num, 1);

    let mut out = vec![0u8; WRITE_UNIT_BYTES as usize];
    engine.read(pieces[0].node_id, 0, &mut out).unwrap();
    assert_eq!(out, data);
}

/// S2 — Cross-node striping: with a fresh node, a write sized to
/// exactly fill it produces one piece spanning the whole node and
/// transitions that node to `Full`.
#[test]
fn s2_fills_a_node_exactly() {
    let engine = harness("null://s2?zones=10&zone_sectors=64&sector_bytes=512&reserved=2");
    let node_capacity_units = ZONES_PER_NODE as u64 * (64 / MIN_WRITE_UNITS as u64); // 4 * 8 = 32
    let data = pattern((node_capacity_units * WRITE_UNIT_BYTES) as usize);

    let pieces = engine.write(&data, 0).unwrap();
    assert_eq!(pieces.len(), 1);
    assert_eq!(pieces[0], ztl::Piece {
        node_id: 0,
        start: 0,
        num: node_capacity_units as u32,
    });
    assert_eq!(engine.node_status(0), NodeStatus::Full);
}

/// S3 — Spill into a second node: continuing past a full node, the
/// next write lands entirely on the next free node starting at 0.
#[test]
fn s3_spills_into_second_node() {
    let engine = harness("null://s3?zones=10&zone_sectors=64&sector_bytes=512&reserved=2");
    let node_capacity_units = ZONES_PER_NODE as u64 * (64 / MIN_WRITE_UNITS as u64);
    let filler = pattern((node_capacity_units * WRITE_UNIT_BYTES) as usize);
    let first = engine.write(&filler, 0).unwrap();
    assert_eq!(engine.node_status(first[0].node_id), NodeStatus::Full);

    let spill = pattern(WRITE_UNIT_BYTES as usize);
    let pieces = engine.write(&spill, 0).unwrap();
    assert_eq!(pieces.len(), 1);
    assert_eq!(pieces[0].node_id, 1);
    assert_eq!(pieces[0].start, 0);
    assert_eq!(pieces[0].num, 1);
}

/// S4 — Read with misalignment: a read that starts mid-sector and ends
/// mid-sector returns exactly the requested byte range.
#[test]
fn s4_read_with_misalignment() {
    let engine = harness("null://s4?zones=10&zone_sectors=64&sector_bytes=512&reserved=2");
    let data = pattern(WRITE_UNIT_BYTES as usize);
    let pieces = engine.write(&data, 0).unwrap();

    let mut out = vec![0u8; 100];
    engine.read(pieces[0].node_id, 17, &mut out).unwrap();
    assert_eq!(out, data[17..117]);
}

/// S5 — Trim-then-reset: trimming a fully-written, `Full` node drives
/// its valid count to zero, the management worker resets it
/// asynchronously, and it returns to the free list for reuse.
#[test]
fn s5_trim_then_reset_recycles_the_node() {
    let engine = harness("null://s5?zones=10&zone_sectors=64&sector_bytes=512&reserved=2");
    let node_capacity_units = ZONES_PER_NODE as u64 * (64 / MIN_WRITE_UNITS as u64);
    let data = pattern((node_capacity_units * WRITE_UNIT_BYTES) as usize);
    let pieces = engine.write(&data, 0).unwrap();
    let piece = pieces[0];
    assert_eq!(engine.node_status(piece.node_id), NodeStatus::Full);

    engine.trim(piece).unwrap();

    let freed = wait_until(
        || engine.node_status(piece.node_id) == NodeStatus::Free,
        200,
        Duration::from_millis(5),
    );
    assert!(freed, "node was not reclaimed within the wait budget");

    // The freed node is immediately reusable: a write after reclamation
    // should be able to land back on it once every other free node (if
    // any) is exhausted. With only node 0/1 present and node 1 free
    // already (never written), the very next write may pick either;
    // what matters is the reclaimed node is eligible, i.e. back in the
    // free list rather than stuck as a used/full node forever.
    let small = pattern(WRITE_UNIT_BYTES as usize);
    let next = engine.write(&small, 0).unwrap();
    assert_ne!(engine.node_status(next[0].node_id), NodeStatus::Full);
}

/// S6 — FS-metadata replay across a restart: Base establishes two
/// files, an Update appends a piece to one of them, a Replace renames
/// the other, and a Delete removes the first; after replaying the log
/// against the same media, only the renamed file remains, carrying the
/// original (non-updated) piece list.
#[test]
fn s6_metadata_replay_across_restart() {
    use std::sync::Arc;
    use ztl::fsmeta::record::FileMeta;
    use ztl::fsmeta::FsMetaLog;
    use ztl::media::null_zns::{NullZns, NullZnsParams};
    use ztl::media::Media;
    use ztl::zmd::ZoneMetadata;
    use ztl::MappingTuple;

    let media: Arc<dyn Media> = Arc::new(NullZns::new(NullZnsParams {
        zone_count: 6,
        zone_sectors: 64,
        sector_bytes: 512,
        reserved_zones: 2,
    }));
    let zmd = ZoneMetadata::from_report(media.zone_report().unwrap());

    let pieces_a = vec![MappingTuple::pack(0, 0, 1)];
    let pieces_b = vec![MappingTuple::pack(1, 0, 2)];

    {
        let log = FsMetaLog::open(Arc::clone(&media), &zmd, 3, false).unwrap();
        log.record_base(
            &zmd,
            vec![
                (
                    "A".to_string(),
                    FileMeta {
                        level: 0,
                        file_size: 4096,
                        pieces: pieces_a.clone(),
                    },
                ),
                (
                    "B".to_string(),
                    FileMeta {
                        level: 1,
                        file_size: 8192,
                        pieces: pieces_b.clone(),
                    },
                ),
            ],
        )
        .unwrap();
        log.record_update(
            &zmd,
            "A".to_string(),
            FileMeta {
                level: 0,
                file_size: 8192,
                pieces: vec![MappingTuple::pack(0, 1, 1)],
            },
        )
        .unwrap();
        log.record_replace(&zmd, "B".to_string(), "C".to_string())
            .unwrap();
        log.record_delete(&zmd, "A".to_string()).unwrap();

        // Sanity check before "restart".
        let files = log.files();
        assert!(!files.contains_key("A"));
        assert_eq!(files.get("C").unwrap().pieces, pieces_b);
    }

    // "Restart": open a fresh log instance against the same media and
    // zone metadata and replay from scratch.
    let replayed = FsMetaLog::open(Arc::clone(&media), &zmd, 3, false).unwrap();
    let files = replayed.files();
    assert_eq!(files.len(), 1);
    assert!(!files.contains_key("A"));
    assert!(!files.contains_key("B"));
    let c = files.get("C").expect("C must survive the rename");
    assert_eq!(c.pieces, pieces_b);
}

/// Testable property 3 (`spec.md` §8): for a write of total size `S`
/// aligned to `sector_bytes * min_write_units`, the returned pieces'
/// units sum to exactly `S`.
#[test]
fn property_piece_units_sum_to_write_size() {
    let engine = harness("null://prop3?zones=10&zone_sectors=64&sector_bytes=512&reserved=2");
    let size = 5 * WRITE_UNIT_BYTES;
    let data = pattern(size as usize);
    let pieces = engine.write(&data, 0).unwrap();
    let total: u64 = pieces.iter().map(|p| p.num as u64 * WRITE_UNIT_BYTES).sum();
    assert_eq!(total, size);
}

/// Testable property 5 (`spec.md` §8): reading the concatenation of
/// every returned piece, in order, reproduces the original input.
#[test]
fn property_round_trip_across_multiple_pieces() {
    let engine = harness("null://prop5?zones=10&zone_sectors=64&sector_bytes=512&reserved=2");
    let node_capacity_units = ZONES_PER_NODE as u64 * (64 / MIN_WRITE_UNITS as u64);
    // One unit beyond a full node, forcing a 2-piece write.
    let size = (node_capacity_units + 1) * WRITE_UNIT_BYTES;
    let data = pattern(size as usize);

    let pieces = engine.write(&data, 0).unwrap();
    assert_eq!(pieces.len(), 2);

    let mut reconstructed = Vec::with_capacity(size as usize);
    for piece in &pieces {
        let mut buf = vec![0u8; piece.num as usize * WRITE_UNIT_BYTES as usize];
        engine
            .read(piece.node_id, piece.start as u64 * WRITE_UNIT_BYTES, &mut buf)
            .unwrap();
        reconstructed.extend_from_slice(&buf);
    }
    assert_eq!(reconstructed, data);
}
