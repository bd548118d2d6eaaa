//! Logging setup. Initializes a `tracing_subscriber` format layer driven
//! by an `EnvFilter`, the same pairing the reference stack uses (minus
//! the SPDK log-bridging `logger.rs` performs there, which has no
//! analogue in this crate).
use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the global `tracing` subscriber from the given filter
/// string (e.g. `"info"`, `"ztl=debug"`). Safe to call more than once;
/// only the first call takes effect.
pub fn init(filter: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_new(filter)
            .unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .try_init()
            .ok();
    });
}
