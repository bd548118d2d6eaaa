//! Compile-time-ish constants and defaults, mirroring `spec.md` §6
//! "Environment / configuration".

/// Default number of zones grouped into one striping node.
pub const DEFAULT_ZONE_COUNT_PER_NODE: u32 = 64;

/// Default number of LSM-style write levels (and per-level queues/workers).
pub const DEFAULT_LEVEL_COUNT: usize = 5;

/// Default minimum write granularity, in sectors.
pub const DEFAULT_MIN_WRITE_UNITS: u32 = 8;

/// Default minimum read granularity, in sectors.
pub const DEFAULT_MIN_READ_UNITS: u32 = 8;

/// Default size of the management worker's pending-op pool.
pub const DEFAULT_NODE_MGMT_POOL_SIZE: usize = 64;

/// Per-zone FINISH/RESET retry ceiling for the management worker.
pub const MGMT_MAX_RETRY: u32 = 3;

/// Sleep between empty polls of the management worker's FIFO.
pub const MGMT_IDLE_SLEEP_MICROS: u64 = 200;

/// Default number of concurrent read resources.
pub const DEFAULT_READ_RESOURCE_COUNT: usize = 16;

/// Default per-mcmd submission/callback retry ceiling.
pub const DEFAULT_WRITE_RETRY_MAX: u32 = 3;

/// Default read retry ceiling for EINVAL-class errors.
pub const DEFAULT_READ_RETRY_MAX: u32 = 3;

/// Default FS-metadata write retry ceiling.
pub const DEFAULT_META_WRITE_RETRY_MAX: u32 = 3;

/// Maximum number of media commands a single user command may be split into.
pub const MAX_MCMD: usize = 4096;

/// Maximum callback-level retries before an mcmd's error is surfaced.
pub const MAX_CALLBACK_ERR_CNT: u32 = 3;

/// Number of reserved zones dedicated to the FS-metadata log.
pub const FS_METADATA_ZONE_COUNT: usize = 2;

/// Magic byte identifying a valid FS-metadata zone superblock.
pub const FS_METADATA_SUPERBLOCK_MAGIC: u8 = 0x3D;

/// Maximum length (bytes) of a name field in an FS-metadata record
/// (matches `char name[128]` in `spec.md` §6).
pub const FS_METADATA_NAME_LEN: usize = 128;

/// Sector size used throughout the reference scenarios in `spec.md` §8.
pub const DEFAULT_SECTOR_BYTES: u64 = 4096;

/// Burst size after which the write engine pokes its async context to
/// drain completions (`spec.md` §4.8 step 6).
pub const WRITE_POKE_BURST: usize = 8;
