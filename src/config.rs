//! Engine configuration: every knob enumerated in `spec.md` §6
//! "Environment / configuration", constructible from the CLI (`clap`),
//! from a YAML file (`serde_yaml`), or programmatically (tests).
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::constants::*;

/// Configuration for a [`crate::ZtlEngine`] instance.
///
/// Mirrors the style of the reference stack's `MayastorCliArgs`: a flat,
/// `clap::Parser`-derived struct with `serde` support so the same values
/// can come from argv, a config file, or be built directly in tests.
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[clap(name = "ztl", about = "Zone Translation Layer engine configuration")]
pub struct Config {
    /// Device URI (see `spec.md` §6 grammar).
    #[clap(long, default_value = "null://ztl0")]
    pub uri: String,

    /// Number of zones grouped into one striping node.
    #[clap(long, default_value_t = DEFAULT_ZONE_COUNT_PER_NODE)]
    pub zone_count_per_node: u32,

    /// Number of LSM-style write levels.
    #[clap(long, default_value_t = DEFAULT_LEVEL_COUNT)]
    pub level_count: usize,

    /// Minimum write granularity, in sectors.
    #[clap(long, default_value_t = DEFAULT_MIN_WRITE_UNITS)]
    pub min_write_units: u32,

    /// Minimum read granularity, in sectors.
    #[clap(long, default_value_t = DEFAULT_MIN_READ_UNITS)]
    pub min_read_units: u32,

    /// Size of the management worker's pending-op pool.
    #[clap(long, default_value_t = DEFAULT_NODE_MGMT_POOL_SIZE)]
    pub node_mgmt_pool_size: usize,

    /// Number of concurrent read resources.
    #[clap(long, default_value_t = DEFAULT_READ_RESOURCE_COUNT)]
    pub read_resource_count: usize,

    /// Per-mcmd write submission/callback retry ceiling.
    #[clap(long, default_value_t = DEFAULT_WRITE_RETRY_MAX)]
    pub write_retry_max: u32,

    /// Read retry ceiling for EINVAL-class errors.
    #[clap(long, default_value_t = DEFAULT_READ_RETRY_MAX)]
    pub read_retry_max: u32,

    /// FS-metadata log write retry ceiling.
    #[clap(long, default_value_t = DEFAULT_META_WRITE_RETRY_MAX)]
    pub meta_write_retry_max: u32,

    /// Emit a Base snapshot immediately after replay completes, to
    /// compact a long log tail (resolves Open Question 3, see
    /// `DESIGN.md`).
    #[clap(long, default_value_t = true)]
    pub compact_on_replay: bool,

    /// Log filter string, passed to `tracing_subscriber::EnvFilter`.
    #[clap(long, default_value = "info")]
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uri: "null://ztl0".to_string(),
            zone_count_per_node: DEFAULT_ZONE_COUNT_PER_NODE,
            level_count: DEFAULT_LEVEL_COUNT,
            min_write_units: DEFAULT_MIN_WRITE_UNITS,
            min_read_units: DEFAULT_MIN_READ_UNITS,
            node_mgmt_pool_size: DEFAULT_NODE_MGMT_POOL_SIZE,
            read_resource_count: DEFAULT_READ_RESOURCE_COUNT,
            write_retry_max: DEFAULT_WRITE_RETRY_MAX,
            read_retry_max: DEFAULT_READ_RETRY_MAX,
            meta_write_retry_max: DEFAULT_META_WRITE_RETRY_MAX,
            compact_on_replay: true,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults for
    /// any field the file omits is not supported by serde_yaml directly;
    /// callers needing partial overrides should load into a `Config`
    /// produced by [`Config::default`] and mutate fields explicitly.
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
