//! Device geometry, as reported at `init()` time (`spec.md` §4.1).
use serde::{Deserialize, Serialize};

/// Static geometry of a connected ZNS device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceGeometry {
    pub groups: u32,
    pub pus_per_group: u32,
    pub zones_per_pu: u32,
    pub sectors_per_zone: u64,
    pub bytes_per_sector: u64,
}

impl DeviceGeometry {
    pub fn total_zones(&self) -> u64 {
        self.groups as u64 * self.pus_per_group as u64 * self.zones_per_pu as u64
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_zones() * self.sectors_per_zone
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_sectors() * self.bytes_per_sector
    }

    pub fn zone_bytes(&self) -> u64 {
        self.sectors_per_zone * self.bytes_per_sector
    }
}
