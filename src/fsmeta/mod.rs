//! FS-metadata log (C6, `spec.md` §4.6): a small append-only record log
//! striped across the two reserved zones, used by the façade's
//! `read_metadata`/`write_file_metadata` calls and by engine startup to
//! recover the file-name -> mapping-tuple table after a restart.
//!
//! Grounded on the reference stack's `nexus_metadata.rs` persistence
//! style (bincode payload, crc32 checksum, a small fixed header) and on
//! the original `ztl-mpe.c`/`xztl-mp.c` superblock-per-zone design: each
//! reserved zone starts with a `{magic, sequence}` superblock, the
//! higher `sequence` zone is current, and a full zone triggers a switch
//! to the other one.
pub mod record;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::async_ctx::AsyncContext;
use crate::error::MetaError;
use crate::media::{IoPayload, MCmdOpcode, MCmdRequest, Media, ZnOpcode, ZnRequest, ZnTarget};
use crate::zmd::ZoneMetadata;
use record::{FileMeta, Record, RecordPayload, ZoneSuperblock};

const META_CTX_DEPTH: usize = 4;

struct LogState {
    /// Index into `zones`: which reserved zone is currently being
    /// appended to.
    active: usize,
    sequence: u64,
    /// Next free sector offset, relative to the active zone's base.
    write_sector: u64,
    files: HashMap<String, FileMeta>,
}

/// The FS-metadata log. One instance owns both reserved zones and an
/// [`AsyncContext`] used to drive synchronous read/write/append calls
/// against them (the log itself has no concurrency requirement beyond
/// what a single `parking_lot::Mutex` provides, per `spec.md` §4.6:
/// "single-writer log").
pub struct FsMetaLog {
    media: Arc<dyn Media>,
    ctx: AsyncContext,
    zones: [u32; 2],
    sector_bytes: u64,
    zone_capacity_sectors: u64,
    retry_max: u32,
    compact_on_replay: bool,
    state: Mutex<LogState>,
}

impl FsMetaLog {
    /// Open (or initialize) the log against the two reserved zones named
    /// in `zmd`, replaying whichever zone holds the newest valid
    /// superblock (`spec.md` §4.6 "replay picks the zone with the
    /// highest sequence number").
    pub fn open(
        media: Arc<dyn Media>,
        zmd: &ZoneMetadata,
        retry_max: u32,
        compact_on_replay: bool,
    ) -> Result<Self, MetaError> {
        let reserved = zmd.reserved_zone_indices();
        if reserved.len() != 2 {
            return Err(MetaError::NoValidSuperblock);
        }
        let zones = [reserved[0], reserved[1]];
        let geometry = media.geometry();
        let zone_capacity_sectors = zmd.zone(zones[0]).capacity;

        let ctx = AsyncContext::new(Arc::clone(&media), META_CTX_DEPTH)
            .map_err(|e| MetaError::ReadFailed {
                reason: format!("failed to open metadata async context: {e}"),
            })?;

        let log = Self {
            media,
            ctx,
            zones,
            sector_bytes: geometry.bytes_per_sector,
            zone_capacity_sectors,
            retry_max,
            compact_on_replay,
            state: Mutex::new(LogState {
                active: 0,
                sequence: 0,
                write_sector: 1,
                files: HashMap::new(),
            }),
        };
        log.recover(zmd)?;
        Ok(log)
    }

    fn zone_base(&self, zmd: &ZoneMetadata, slot: usize) -> u64 {
        zmd.zone(self.zones[slot]).base
    }

    fn sync_read(&self, addr: u64, nsec: u32) -> Result<Vec<u8>, MetaError> {
        let req = MCmdRequest {
            opcode: MCmdOpcode::Read,
            addr,
            nsec,
            payload: IoPayload::Read {
                len: (nsec as u64 * self.sector_bytes) as usize,
                target: None,
            },
            seq_in_ucmd: 0,
            seq_zn: 0,
        };
        let token = self
            .ctx
            .submit_io(req)
            .map_err(|e| MetaError::ReadFailed {
                reason: e.to_string(),
            })?;
        let out: Mutex<Option<Result<_, _>>> = Mutex::new(None);
        self.ctx.wait(
            1,
            |c| {
                if c.token == token {
                    *out.lock() = Some(c.result);
                }
            },
            || out.lock().is_some(),
        );
        match out.into_inner().expect("wait() only returns once done() is true") {
            Ok(ok) => Ok(ok.data.map(|d| d.into_vec()).unwrap_or_default()),
            Err(e) => Err(MetaError::ReadFailed {
                reason: e.to_string(),
            }),
        }
    }

    fn sync_write(&self, addr: u64, bytes: &[u8]) -> Result<(), MetaError> {
        let nsec = (bytes.len() as u64).div_ceil(self.sector_bytes) as u32;
        let req = MCmdRequest {
            opcode: MCmdOpcode::Write,
            addr,
            nsec,
            payload: IoPayload::Write {
                data: Arc::from(bytes.to_vec().into_boxed_slice()),
                offset: 0,
                len: bytes.len(),
            },
            seq_in_ucmd: 0,
            seq_zn: 0,
        };
        let token = self
            .ctx
            .submit_io(req)
            .map_err(|e| MetaError::WriteFailed {
                reason: e.to_string(),
            })?;
        let out: Mutex<Option<Result<_, _>>> = Mutex::new(None);
        self.ctx.wait(
            1,
            |c| {
                if c.token == token {
                    *out.lock() = Some(c.result);
                }
            },
            || out.lock().is_some(),
        );
        match out.into_inner().expect("wait() only returns once done() is true") {
            Ok(_) => Ok(()),
            Err(e) => Err(MetaError::WriteFailed {
                reason: e.to_string(),
            }),
        }
    }

    fn sync_write_retrying(&self, addr: u64, bytes: &[u8]) -> Result<(), MetaError> {
        let mut attempt = 0;
        loop {
            match self.sync_write(addr, bytes) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry_max => {
                    attempt += 1;
                    warn!("FS-metadata write retry {attempt}/{}: {e}", self.retry_max);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read both reserved zones' superblocks, pick the newer one as
    /// current, replay its records into `files`, and record the next
    /// free sector. If neither superblock is valid this is a fresh
    /// device: zone 0 becomes current with sequence 0.
    fn recover(&self, zmd: &ZoneMetadata) -> Result<(), MetaError> {
        let mut superblocks = [None, None];
        for slot in 0..2 {
            let base = self.zone_base(zmd, slot);
            if let Ok(bytes) = self.sync_read(base, 1) {
                superblocks[slot] = ZoneSuperblock::decode(&bytes);
            }
        }

        let active = match (superblocks[0], superblocks[1]) {
            (Some(a), Some(b)) => {
                if b.sequence > a.sequence {
                    1
                } else {
                    0
                }
            }
            (Some(_), None) => 0,
            (None, Some(_)) => 1,
            (None, None) => {
                let sb = ZoneSuperblock::new(0);
                let base = self.zone_base(zmd, 0);
                self.sync_write_retrying(base, &sb.encode(self.sector_bytes))?;
                0
            }
        };
        let sequence = superblocks[active].map(|sb| sb.sequence).unwrap_or(0);

        let (files, write_sector) = self.replay_zone(zmd, active)?;

        let mut state = self.state.lock();
        state.active = active;
        state.sequence = sequence;
        state.write_sector = write_sector;
        state.files = files;
        Ok(())
    }

    /// Sequentially decode every record in `zones[slot]`, folding each
    /// into a flat file table, stopping at the first tail marker or
    /// decode error (a torn write at the point of the last crash,
    /// `spec.md` §4.6 "the log replays newest-sequence-first and stops
    /// at the first corrupt or empty record").
    fn replay_zone(
        &self,
        zmd: &ZoneMetadata,
        slot: usize,
    ) -> Result<(HashMap<String, FileMeta>, u64), MetaError> {
        let base = self.zone_base(zmd, slot);
        let mut files = HashMap::new();
        let mut sector = 1u64;
        while sector < self.zone_capacity_sectors {
            let bytes = match self.sync_read(base + sector, 1) {
                Ok(b) => b,
                Err(_) => break,
            };
            let decoded = match Record::decode(&bytes) {
                Ok(Some((record, _))) => record,
                Ok(None) => break,
                Err(_) => break,
            };
            apply_record(&mut files, decoded.payload);
            sector += 1;
        }
        Ok((files, sector))
    }

    pub fn files(&self) -> HashMap<String, FileMeta> {
        self.state.lock().files.clone()
    }

    pub fn file(&self, name: &str) -> Option<FileMeta> {
        self.state.lock().files.get(name).cloned()
    }

    /// Append one record to the active zone. When the active zone has no
    /// room left, rotates to the other reserved zone and returns
    /// `WriteFull` without writing `payload` (`spec.md` §4.6: "returns
    /// `WriteFull` so the caller retries, typically by emitting a new
    /// Base snapshot"); the rotation itself has already happened by the
    /// time this returns, so a caller's retry lands in the fresh zone.
    fn append(&self, zmd: &ZoneMetadata, payload: RecordPayload) -> Result<(), MetaError> {
        let record = Record::new(payload.clone());
        let bytes = record.encode(self.sector_bytes)?;
        let nsec = bytes.len() as u64 / self.sector_bytes;

        let mut state = self.state.lock();
        if state.write_sector + nsec > self.zone_capacity_sectors {
            drop(state);
            self.switch_zone(zmd)?;
            return Err(MetaError::WriteFull);
        }
        let base = self.zone_base(zmd, state.active);
        let addr = base + state.write_sector;
        self.sync_write_retrying(addr, &bytes)?;
        apply_record(&mut state.files, payload);
        state.write_sector += nsec;
        Ok(())
    }

    /// Append, transparently retrying once through a `WriteFull` zone
    /// rotation. Every public `record_*` method goes through this rather
    /// than `append` directly, so a zone-full event costs the caller
    /// nothing beyond the one extra round trip the rotation itself takes.
    fn append_retrying(&self, zmd: &ZoneMetadata, payload: RecordPayload) -> Result<(), MetaError> {
        match self.append(zmd, payload.clone()) {
            Err(MetaError::WriteFull) => self.append(zmd, payload),
            other => other,
        }
    }

    /// Switch to the other reserved zone: reset it via a zone-management
    /// command (it may hold a stale write pointer from an earlier
    /// occupancy, `spec.md` §4.6 "resets the other zone"), bump the
    /// sequence, write a fresh superblock, and — when `compact_on_replay`
    /// is set — seed the new zone with a single Base record capturing
    /// the full current file table, so the old zone never needs
    /// replaying again (resolves Open Question 3, see `DESIGN.md`).
    fn switch_zone(&self, zmd: &ZoneMetadata) -> Result<(), MetaError> {
        let (next_slot, next_sequence, snapshot) = {
            let state = self.state.lock();
            (1 - state.active, state.sequence + 1, state.files.clone())
        };

        let next_zone_index = self.zones[next_slot];
        self.media
            .submit_zn(ZnRequest {
                opcode: ZnOpcode::Reset,
                target: ZnTarget::Zone(next_zone_index),
            })
            .map_err(|e| MetaError::WriteFailed {
                reason: format!("failed to reset zone {next_zone_index} before reuse: {e}"),
            })?;
        zmd.zone(next_zone_index).mark_reset();

        let base = self.zone_base(zmd, next_slot);
        let sb = ZoneSuperblock::new(next_sequence);
        self.sync_write_retrying(base, &sb.encode(self.sector_bytes))?;

        let mut state = self.state.lock();
        state.active = next_slot;
        state.sequence = next_sequence;
        state.write_sector = 1;
        drop(state);

        if self.compact_on_replay {
            self.append_retrying(
                zmd,
                RecordPayload::Base {
                    files: snapshot.into_iter().collect(),
                },
            )?;
        }
        Ok(())
    }

    pub fn record_base(
        &self,
        zmd: &ZoneMetadata,
        files: Vec<(String, FileMeta)>,
    ) -> Result<(), MetaError> {
        self.append_retrying(zmd, RecordPayload::Base { files })
    }

    pub fn record_update(
        &self,
        zmd: &ZoneMetadata,
        name: String,
        delta: FileMeta,
    ) -> Result<(), MetaError> {
        self.append_retrying(zmd, RecordPayload::Update { name, delta })
    }

    pub fn record_replace(
        &self,
        zmd: &ZoneMetadata,
        src_name: String,
        dst_name: String,
    ) -> Result<(), MetaError> {
        self.append_retrying(
            zmd,
            RecordPayload::Replace {
                src_name,
                dst_name,
            },
        )
    }

    pub fn record_delete(&self, zmd: &ZoneMetadata, name: String) -> Result<(), MetaError> {
        self.append_retrying(zmd, RecordPayload::Delete { name })
    }

    pub fn record_gc_change(
        &self,
        zmd: &ZoneMetadata,
        name: String,
        file: FileMeta,
    ) -> Result<(), MetaError> {
        self.append_retrying(zmd, RecordPayload::GcChange { name, file })
    }

    /// Raw passthrough read of the active reserved zone's address space,
    /// bypassing record framing entirely (`spec.md` §6
    /// `read_metadata(slba, buf, len)` — a caller-opaque metadata
    /// blob read, independent of the record log above it).
    pub fn read_raw(
        &self,
        zmd: &ZoneMetadata,
        slba: u64,
        nsec: u32,
    ) -> Result<Vec<u8>, MetaError> {
        let active = self.state.lock().active;
        let base = self.zone_base(zmd, active);
        self.sync_read(base + slba, nsec)
    }

    /// Raw passthrough write, the counterpart to [`Self::read_raw`]
    /// (`spec.md` §6 `write_file_metadata(buf, len)`).
    pub fn write_raw(&self, zmd: &ZoneMetadata, slba: u64, buf: &[u8]) -> Result<(), MetaError> {
        let active = self.state.lock().active;
        let base = self.zone_base(zmd, active);
        self.sync_write_retrying(base + slba, buf)
    }
}

fn apply_record(files: &mut HashMap<String, FileMeta>, payload: RecordPayload) {
    match payload {
        RecordPayload::Base { files: base } => {
            files.clear();
            files.extend(base);
        }
        RecordPayload::Update { name, delta } => {
            // An Update delta carries only the pieces appended since the
            // last flush (`spec.md` §4.6): fold it onto the existing
            // entry instead of overwriting the file's piece list.
            match files.get_mut(&name) {
                Some(existing) => {
                    existing.pieces.extend(delta.pieces);
                    existing.file_size = delta.file_size;
                    existing.level = delta.level;
                }
                None => {
                    files.insert(name, delta);
                }
            }
        }
        RecordPayload::Replace { src_name, dst_name } => {
            if let Some(meta) = files.remove(&src_name) {
                files.insert(dst_name, meta);
            }
        }
        RecordPayload::Delete { name } => {
            files.remove(&name);
        }
        RecordPayload::GcChange { name, file } => {
            files.insert(name, file);
        }
    }
}
