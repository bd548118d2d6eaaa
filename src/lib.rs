//!
//! ztl: a user-space Zone Translation Layer over Zoned Namespace (ZNS)
//! SSDs. Bridges a caller's object/block-style append-and-read interface
//! onto raw write-append-per-zone media, striping writes across nodes of
//! zones and handing back physical mapping tuples the caller persists.
#[macro_use]
extern crate tracing;
extern crate snafu;

pub mod async_ctx;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod fsmeta;
pub mod logger;
pub mod media;
pub mod mempool;
pub mod mgmt;
pub mod provisioner;
pub mod read_engine;
pub mod ucmd;
pub mod write_engine;
pub mod zmd;

pub use config::Config;
pub use engine::ZtlEngine;
pub use error::ZtlError;
pub use ucmd::{MappingTuple, Piece};
