//! Error taxonomy for the zone translation layer. One `snafu`-derived
//! enum per component (`spec.md` §7), composing into a single
//! [`ZtlError`] at the façade boundary.
use snafu::Snafu;

/// Errors raised while parsing a device URI or otherwise misconfiguring
/// the engine at `init()` time.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ConfigError {
    #[snafu(display("failed to parse device URI '{}': {}", uri, reason))]
    UriParse { uri: String, reason: String },
    #[snafu(display("unsupported async backend '{}'", backend))]
    UnsupportedBackend { backend: String },
    #[snafu(display("device geometry out of supported bounds: {}", reason))]
    BadGeometry { reason: String },
    #[snafu(display("invalid configuration: {}", reason))]
    Invalid { reason: String },
}

/// Errors raised by the media abstraction (C1).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum MediaError {
    #[snafu(display("invalid media opcode"))]
    InvalidOpcode,
    #[snafu(display("media submit rejected: {}", reason))]
    SubmitRejected { reason: String },
    #[snafu(display("media completion error: {}", reason))]
    CompletionFailed { reason: String },
    #[snafu(display("DMA allocation of {} bytes failed", size))]
    DmaAlloc { size: u64 },
    #[snafu(display("device is not connected"))]
    NotConnected,
}

/// Errors raised by the node/zone provisioner (C5).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ProvisionError {
    #[snafu(display("no free node available"))]
    NoSpace,
    #[snafu(display("piece count {} exceeds the per-ucmd limit of 2", count))]
    TooManyPieces { count: usize },
    #[snafu(display("buffer size {} is not aligned to {} bytes", size, align))]
    Unaligned { size: u64, align: u64 },
    #[snafu(display("node {} index out of range", id))]
    BadNode { id: u32 },
}

/// Errors raised by the FS-metadata log (C6).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum MetaError {
    #[snafu(display("FS-metadata log read failed: {}", reason))]
    ReadFailed { reason: String },
    #[snafu(display("FS-metadata log write failed: {}", reason))]
    WriteFailed { reason: String },
    #[snafu(display("current FS-metadata zone is full"))]
    WriteFull,
    #[snafu(display("corrupt FS-metadata record: {}", reason))]
    Corrupt { reason: String },
    #[snafu(display("no valid FS-metadata superblock found"))]
    NoValidSuperblock,
}

/// Errors raised by the memory pool (C2) and other resource allocation
/// paths (thread spawn, DMA allocation outside the media layer).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ResourceError {
    #[snafu(display("type/thread index {} exceeds the compile-time limit {}", index, limit))]
    OutOfBounds { index: usize, limit: usize },
    #[snafu(display("invalid memory pool entry count: {}", reason))]
    Invalid { reason: String },
    #[snafu(display("failed to spawn worker thread: {}", reason))]
    ThreadSpawn { reason: String },
}

/// Top-level façade error (C10), composing the component errors above.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ZtlError {
    #[snafu(display("configuration error: {}", source))]
    Configuration { source: ConfigError },
    #[snafu(display("media error: {}", source))]
    Media { source: MediaError },
    #[snafu(display("provisioning error: {}", source))]
    Provisioning { source: ProvisionError },
    #[snafu(display("metadata error: {}", source))]
    Metadata { source: MetaError },
    #[snafu(display("I/O failed after {} retries: {}", retries, reason))]
    IoError { retries: u32, reason: String },
    #[snafu(display("resource error: {}", source))]
    Resource { source: ResourceError },
}

impl From<ConfigError> for ZtlError {
    fn from(source: ConfigError) -> Self {
        Self::Configuration { source }
    }
}

impl From<MediaError> for ZtlError {
    fn from(source: MediaError) -> Self {
        Self::Media { source }
    }
}

impl From<ProvisionError> for ZtlError {
    fn from(source: ProvisionError) -> Self {
        Self::Provisioning { source }
    }
}

impl From<MetaError> for ZtlError {
    fn from(source: MetaError) -> Self {
        Self::Metadata { source }
    }
}

impl From<ResourceError> for ZtlError {
    fn from(source: ResourceError) -> Self {
        Self::Resource { source }
    }
}

/// Renders the full `source()` chain of an error into one string, for
/// logging at the point an error is finally surfaced to a caller.
pub trait VerboseError {
    fn verbose(&self) -> String;
}

impl<T> VerboseError for T
where
    T: std::error::Error,
{
    fn verbose(&self) -> String {
        let mut msg = format!("{self}");
        let mut opt_source = std::error::Error::source(self);
        while let Some(source) = opt_source {
            msg = format!("{msg}: {source}");
            opt_source = source.source();
        }
        msg
    }
}
