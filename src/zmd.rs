//! Zone metadata table (C4, `spec.md` §4.4): the in-memory mirror of
//! the device's zone report, built once at startup from
//! [`crate::media::Media::zone_report`]. Reserved zones stay in the
//! table (so `read_metadata`/`write_file_metadata` can still address
//! them) but are excluded from the provisioner's node pool.
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::media::{ZoneFlags, ZoneSnapshot, ZoneState};

/// One zone's live state. `wp` and `wp_inflight` are hot-path atomics
/// (`spec.md` §5: "updated with atomic CAS"); `state`/`flags` change
/// rarely (reset/finish, management worker) and sit behind a lock.
#[derive(Debug)]
pub struct ZoneEntry {
    pub index: u32,
    pub base: u64,
    pub capacity: u64,
    pub wp: AtomicU64,
    pub wp_inflight: AtomicU64,
    state: Mutex<ZoneState>,
    flags: Mutex<ZoneFlags>,
}

impl ZoneEntry {
    pub fn state(&self) -> ZoneState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ZoneState) {
        *self.state.lock() = state;
    }

    pub fn flags(&self) -> ZoneFlags {
        *self.flags.lock()
    }

    pub fn set_flags(&self, flags: ZoneFlags) {
        *self.flags.lock() = flags;
    }

    pub fn is_reserved(&self) -> bool {
        self.flags().contains(ZoneFlags::RSVD)
    }

    /// `base <= wp <= wp_inflight <= base + capacity` (`spec.md` §5,
    /// §8 property 1).
    pub fn invariant_holds(&self) -> bool {
        let wp = self.wp.load(Ordering::Acquire);
        let inflight = self.wp_inflight.load(Ordering::Acquire);
        self.base <= wp && wp <= inflight && inflight <= self.base + self.capacity
    }

    /// Reset this zone's in-memory mirror after a device-level reset:
    /// wp rewinds to base, no reservation in flight.
    pub fn mark_reset(&self) {
        self.wp.store(self.base, Ordering::Release);
        self.wp_inflight.store(self.base, Ordering::Release);
        self.set_state(ZoneState::Empty);
        let mut flags = self.flags.lock();
        flags.remove(ZoneFlags::USED);
        flags.remove(ZoneFlags::OPEN);
    }

    /// Mark this zone finished: wp advances to the zone's end.
    pub fn mark_finished(&self) {
        let end = self.base + self.capacity;
        self.wp.store(end, Ordering::Release);
        self.wp_inflight.store(end, Ordering::Release);
        self.set_state(ZoneState::Full);
    }
}

/// The full zone table, indexed by zone index.
pub struct ZoneMetadata {
    zones: Vec<ZoneEntry>,
}

impl ZoneMetadata {
    /// Build the table from a device zone report (`spec.md` §4.4:
    /// "copies per-zone records into an in-memory table ... Empty
    /// zones set wp to the zone base; non-empty zones inherit the
    /// device wp").
    pub fn from_report(report: Vec<ZoneSnapshot>) -> Self {
        let zones = report
            .into_iter()
            .map(|snap| {
                let wp = match snap.state {
                    ZoneState::Empty => snap.base,
                    _ => snap.wp,
                };
                ZoneEntry {
                    index: snap.index,
                    base: snap.base,
                    capacity: snap.capacity,
                    wp: AtomicU64::new(wp),
                    wp_inflight: AtomicU64::new(wp),
                    state: Mutex::new(snap.state),
                    flags: Mutex::new(snap.flags),
                }
            })
            .collect();
        Self { zones }
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn zone(&self, index: u32) -> &ZoneEntry {
        &self.zones[index as usize]
    }

    pub fn all(&self) -> &[ZoneEntry] {
        &self.zones
    }

    /// Indices of zones available to the provisioner, in device order,
    /// with reserved (metadata) zones excluded.
    pub fn data_zone_indices(&self) -> Vec<u32> {
        self.zones
            .iter()
            .filter(|z| !z.is_reserved())
            .map(|z| z.index)
            .collect()
    }

    /// Indices of the reserved metadata-log zones, in device order.
    pub fn reserved_zone_indices(&self) -> Vec<u32> {
        self.zones
            .iter()
            .filter(|z| z.is_reserved())
            .map(|z| z.index)
            .collect()
    }
}
