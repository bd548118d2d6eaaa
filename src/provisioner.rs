//! Node / zone provisioner (C5, `spec.md` §4.5). Builds the node table
//! at startup from the zone metadata table, hands the write engine its
//! per-level "current node", and implements the round-robin sector
//! reservation algorithm. Grounded on the original `ztl-pro-grp.c`'s
//! `ztl_pro_grp_node_init`/`ztl_pro_grp_get`/`ztl_pro_grp_get_node`,
//! translated from its `TAILQ`/spinlock free-and-used lists into
//! `VecDeque`s behind a `parking_lot::Mutex` per `spec.md` §9's design
//! note on pointer-heavy C structures.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::ProvisionError;
use crate::media::ZoneState;
use crate::zmd::ZoneMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Free,
    Used,
    Full,
}

/// A striping group of `zone_count_per_node` zones (`spec.md` §3
/// Node). `left`/`used`/`nr_valid` are counted in units of the media
/// minimum write size, matching the reference's
/// `optimal_write_sec_left`/`_used` and `nr_valid` fields.
pub struct Node {
    pub id: u32,
    pub zone_indices: Vec<u32>,
    status: Mutex<NodeStatus>,
    pub used: AtomicU64,
    pub left: AtomicU64,
    pub nr_valid: AtomicU64,
    pub level: AtomicI32,
    pub error_count: AtomicU64,
    zone_capacity_units: u64,
}

impl Node {
    pub fn status(&self) -> NodeStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: NodeStatus) {
        *self.status.lock() = status;
    }

    pub fn capacity_units(&self) -> u64 {
        self.zone_indices.len() as u64 * self.zone_capacity_units
    }

    /// FREE -> USED transition on first reservation (`spec.md` §3 Node
    /// lifecycle). A node only reaches this path via [`Provisioner::get_node`]
    /// popping it off the free list, so it is always coming from `Free`.
    fn mark_used(&self) {
        self.set_status(NodeStatus::Used);
    }

    /// Stamp this node's level on its first reservation
    /// (`spec.md` §4.5 "Level tagging").
    fn stamp_level(&self, level: u32) {
        let _ = self
            .level
            .compare_exchange(-1, level as i32, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Account for `units` write-units worth of a just-completed write
    /// (`spec.md` §4.8 step 7): advances `used`/`left`, adds to
    /// `nr_valid`, and transitions to `Full` once `left` reaches zero.
    pub fn advance_after_write(&self, units: u64) {
        self.used.fetch_add(units, Ordering::AcqRel);
        let left_before = self.left.fetch_sub(units, Ordering::AcqRel);
        self.nr_valid.fetch_add(units, Ordering::AcqRel);
        if left_before == units {
            self.set_status(NodeStatus::Full);
        }
    }

    /// Subtract `units` from `nr_valid` on a trim (`spec.md` §4.7
    /// invalidation policy). Returns `true` if the node is now fully
    /// invalidated *and* `Full`, meaning a `ResetZone` should be
    /// enqueued by the caller.
    pub fn invalidate(&self, units: u64) -> bool {
        let prev = self.nr_valid.fetch_sub(units, Ordering::AcqRel);
        let now_zero = prev == units;
        now_zero && self.status() == NodeStatus::Full
    }

    /// Return this node to a pristine `Free` state after a successful
    /// whole-node reset (`spec.md` §4.7).
    fn reset_to_free(&self) {
        self.used.store(0, Ordering::Release);
        self.left.store(self.capacity_units(), Ordering::Release);
        self.nr_valid.store(0, Ordering::Release);
        self.level.store(-1, Ordering::Release);
        self.set_status(NodeStatus::Free);
    }
}

/// One zone's share of a reservation (`spec.md` §4.5/§4.8): the start
/// sector address and how many write-units were assigned to it.
#[derive(Debug, Clone, Copy)]
pub struct ProvAddrEntry {
    pub zone_index: u32,
    pub addr: u64,
    pub units: u32,
}

pub struct Provisioner {
    nodes: Vec<Node>,
    free_list: Mutex<VecDeque<u32>>,
    used_list: Mutex<VecDeque<u32>>,
    zone_count_per_node: u32,
    min_write_units: u32,
}

impl Provisioner {
    /// Build the node table by scanning the zone metadata table's data
    /// zones sequentially and bucketing them into fixed-size nodes,
    /// dropping any trailing partial group (`spec.md` §4.5; mirrors
    /// `ztl_pro_grp_node_init`'s "remaining zones don't fill a node,
    /// stop" behavior).
    pub fn build(
        zmd: &ZoneMetadata,
        zone_count_per_node: u32,
        min_write_units: u32,
    ) -> Result<Self, ProvisionError> {
        let data_indices = zmd.data_zone_indices();
        let n = zone_count_per_node as usize;
        let mut nodes = Vec::new();
        let mut free_list = VecDeque::new();
        let mut used_list = VecDeque::new();

        for (node_id, chunk) in data_indices.chunks(n).enumerate() {
            if chunk.len() < n {
                break;
            }
            let zone_capacity_units = zmd.zone(chunk[0]).capacity / min_write_units as u64;
            let mut used_units = 0u64;
            let mut full_count = 0usize;
            for &zi in chunk {
                let zone = zmd.zone(zi);
                match zone.state() {
                    ZoneState::Full => {
                        full_count += 1;
                        used_units += zone_capacity_units;
                    }
                    ZoneState::Empty => {}
                    _ => {
                        let wp = zone.wp.load(Ordering::Acquire);
                        used_units += (wp - zone.base) / min_write_units as u64;
                    }
                }
            }
            let capacity_units = n as u64 * zone_capacity_units;
            let status = if full_count == n {
                NodeStatus::Full
            } else if used_units == 0 {
                NodeStatus::Free
            } else {
                NodeStatus::Used
            };
            let node_id = node_id as u32;
            let node = Node {
                id: node_id,
                zone_indices: chunk.to_vec(),
                status: Mutex::new(status),
                used: AtomicU64::new(used_units),
                left: AtomicU64::new(capacity_units - used_units),
                nr_valid: AtomicU64::new(used_units),
                level: AtomicI32::new(-1),
                error_count: AtomicU64::new(0),
                zone_capacity_units,
            };
            match status {
                NodeStatus::Free => free_list.push_back(node_id),
                _ => used_list.push_back(node_id),
            }
            nodes.push(node);
        }

        Ok(Self {
            nodes,
            free_list: Mutex::new(free_list),
            used_list: Mutex::new(used_list),
            zone_count_per_node,
            min_write_units,
        })
    }

    pub fn node(&self, id: u32) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Bind a node to a per-level queue: reuse the currently bound node
    /// if it still has room, otherwise pop the free list
    /// (`spec.md` §4.5 `get_node`).
    pub fn get_node(&self, bound: Option<u32>) -> Result<u32, ProvisionError> {
        if let Some(id) = bound {
            if self.node(id).left.load(Ordering::Acquire) > 0 {
                return Ok(id);
            }
        }
        let mut free_list = self.free_list.lock();
        let id = free_list.pop_front().ok_or(ProvisionError::NoSpace)?;
        self.node(id).mark_used();
        self.used_list.lock().push_back(id);
        Ok(id)
    }

    /// Distribute `take_units` write-units round-robin across a node's
    /// zones, starting at the zone implied by the node's current
    /// `used` offset (`spec.md` §4.5 `reserve`).
    pub fn reserve(
        &self,
        zmd: &ZoneMetadata,
        node_id: u32,
        take_units: u32,
        level: u32,
    ) -> Result<Vec<ProvAddrEntry>, ProvisionError> {
        let node = self.node(node_id);
        node.stamp_level(level);

        let n = self.zone_count_per_node;
        let full_rounds = take_units / n;
        let remainder = take_units % n;
        let start = (node.used.load(Ordering::Acquire) % n as u64) as u32;

        let mut entries = Vec::with_capacity(n as usize);
        let mut remaining = take_units;
        let mut i = 0u32;
        while remaining > 0 {
            let zn_i = (start + i) % n;
            let assigned = full_rounds + u32::from(i < remainder);
            if assigned == 0 {
                i += 1;
                continue;
            }
            let zone_index = node.zone_indices[zn_i as usize];
            let zone = zmd.zone(zone_index);
            let addr = zone
                .wp_inflight
                .fetch_add(assigned as u64 * self.min_write_units as u64, Ordering::AcqRel);
            entries.push(ProvAddrEntry {
                zone_index,
                addr,
                units: assigned,
            });
            remaining -= assigned;
            i += 1;
        }
        Ok(entries)
    }

    /// Return a fully-reset node to the free list (`spec.md` §4.7,
    /// consumed by the management worker after a successful whole-node
    /// `ResetZone`).
    pub fn return_to_free_list(&self, node_id: u32) {
        self.node(node_id).reset_to_free();
        self.used_list.lock().retain(|&id| id != node_id);
        self.free_list.lock().push_back(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ZoneFlags, ZoneSnapshot, ZoneState};

    fn fresh_zmd(zone_count: u32, zone_sectors: u64) -> ZoneMetadata {
        let report: Vec<ZoneSnapshot> = (0..zone_count)
            .map(|i| ZoneSnapshot {
                index: i,
                base: i as u64 * zone_sectors,
                capacity: zone_sectors,
                wp: i as u64 * zone_sectors,
                state: ZoneState::Empty,
                flags: ZoneFlags::empty(),
            })
            .collect();
        ZoneMetadata::from_report(report)
    }

    #[test]
    fn builds_one_node_from_n_zones() {
        let zmd = fresh_zmd(4, 64);
        let prov = Provisioner::build(&zmd, 4, 8).unwrap();
        assert_eq!(prov.node_count(), 1);
        assert_eq!(prov.node(0).status(), NodeStatus::Free);
        assert_eq!(prov.node(0).capacity_units(), 4 * 8);
    }

    #[test]
    fn drops_trailing_partial_group() {
        let zmd = fresh_zmd(6, 64);
        let prov = Provisioner::build(&zmd, 4, 8).unwrap();
        assert_eq!(prov.node_count(), 1);
    }

    #[test]
    fn reserve_distributes_round_robin() {
        let zmd = fresh_zmd(4, 64);
        let prov = Provisioner::build(&zmd, 4, 8).unwrap();
        let entries = prov.reserve(&zmd, 0, 10, 0).unwrap();
        // 10 units across 4 zones: full_rounds=2, remainder=2 -> [3,3,2,2]
        let units: Vec<u32> = entries.iter().map(|e| e.units).collect();
        assert_eq!(units, vec![3, 3, 2, 2]);
        assert_eq!(prov.node(0).level.load(Ordering::Acquire), 0);
    }

    #[test]
    fn get_node_fails_when_exhausted() {
        let zmd = fresh_zmd(4, 64);
        let prov = Provisioner::build(&zmd, 4, 8).unwrap();
        let id = prov.get_node(None).unwrap();
        assert_eq!(id, 0);
        assert!(matches!(
            prov.get_node(None),
            Err(ProvisionError::NoSpace)
        ));
    }

    #[test]
    fn advance_after_write_marks_full() {
        let zmd = fresh_zmd(4, 64);
        let prov = Provisioner::build(&zmd, 4, 8).unwrap();
        let node = prov.node(0);
        node.advance_after_write(32);
        assert_eq!(node.status(), NodeStatus::Full);
        assert_eq!(node.left.load(Ordering::Acquire), 0);
    }

    #[test]
    fn get_node_transitions_free_to_used() {
        let zmd = fresh_zmd(4, 64);
        let prov = Provisioner::build(&zmd, 4, 8).unwrap();
        assert_eq!(prov.node(0).status(), NodeStatus::Free);
        let id = prov.get_node(None).unwrap();
        assert_eq!(prov.node(id).status(), NodeStatus::Used);
    }
}
