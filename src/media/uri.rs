//! Device URI parsing (`spec.md` §6):
//!
//! ```text
//! uri      := block-uri | pci-uri | null-uri
//! block-uri:= "/dev/" name ("?be=" backend)?
//! pci-uri  := "pci:" bdf "?nsid=" u32
//! backend  := "thrpool" | "libaio" | "io_uring" | "io_uring_cmd"
//! null-uri := "null:" "//" name ("?" query)?
//! ```
//!
//! `null-uri` is a crate-local test/development extension selecting the
//! in-process simulated ZNS device ([`crate::media::null_zns::NullZns`]);
//! it is not part of the production grammar but is accepted wherever a
//! real NVMe/io_uring driver shim would otherwise be required.
use std::collections::HashMap;

use crate::error::ConfigError;

/// Asynchronous submission backend selected via `?be=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    ThreadPool,
    Libaio,
    IoUring,
    IoUringCmd,
}

impl Backend {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "thrpool" => Ok(Self::ThreadPool),
            "libaio" => Ok(Self::Libaio),
            "io_uring" => Ok(Self::IoUring),
            "io_uring_cmd" => Ok(Self::IoUringCmd),
            other => Err(ConfigError::UnsupportedBackend {
                backend: other.to_string(),
            }),
        }
    }
}

/// A parsed device URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceUri {
    /// `"<block-path>"` with an optional `?be=<backend>`.
    Block { path: String, backend: Backend },
    /// `"pci:<bbdf>?nsid=<n>"`.
    Pci { bbdf: String, nsid: u32 },
    /// `"null://<name>?..."`, the in-process simulated device.
    Null {
        name: String,
        params: HashMap<String, String>,
    },
}

fn parse_query(q: &str) -> HashMap<String, String> {
    q.split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|kv| {
            let mut it = kv.splitn(2, '=');
            let k = it.next()?.to_string();
            let v = it.next().unwrap_or("").to_string();
            Some((k, v))
        })
        .collect()
}

impl DeviceUri {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        if let Some(rest) = uri.strip_prefix("pci:") {
            let (bbdf, query) = match rest.split_once('?') {
                Some((a, b)) => (a, b),
                None => {
                    return Err(ConfigError::UriParse {
                        uri: uri.to_string(),
                        reason: "pci URI is missing ?nsid=".to_string(),
                    })
                }
            };
            let params = parse_query(query);
            let nsid = params
                .get("nsid")
                .ok_or_else(|| ConfigError::UriParse {
                    uri: uri.to_string(),
                    reason: "missing nsid parameter".to_string(),
                })?
                .parse::<u32>()
                .map_err(|e| ConfigError::UriParse {
                    uri: uri.to_string(),
                    reason: format!("invalid nsid: {e}"),
                })?;
            if bbdf.is_empty() {
                return Err(ConfigError::UriParse {
                    uri: uri.to_string(),
                    reason: "empty bdf".to_string(),
                });
            }
            return Ok(Self::Pci {
                bbdf: bbdf.to_string(),
                nsid,
            });
        }

        if let Some(rest) = uri.strip_prefix("null://") {
            let (name, query) = match rest.split_once('?') {
                Some((a, b)) => (a, b),
                None => (rest, ""),
            };
            if name.is_empty() {
                return Err(ConfigError::UriParse {
                    uri: uri.to_string(),
                    reason: "empty null device name".to_string(),
                });
            }
            return Ok(Self::Null {
                name: name.to_string(),
                params: parse_query(query),
            });
        }

        // block-uri: a path, optionally followed by "?be=<backend>".
        let (path, query) = match uri.split_once('?') {
            Some((a, b)) => (a, b),
            None => (uri, ""),
        };
        if path.is_empty() {
            return Err(ConfigError::UriParse {
                uri: uri.to_string(),
                reason: "empty path".to_string(),
            });
        }
        let params = parse_query(query);
        let backend = match params.get("be") {
            Some(b) => Backend::parse(b)?,
            None => Backend::ThreadPool,
        };
        Ok(Self::Block {
            path: path.to_string(),
            backend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_block_uri_with_default_backend() {
        let uri = DeviceUri::parse("/dev/nvme0n1").unwrap();
        assert_eq!(
            uri,
            DeviceUri::Block {
                path: "/dev/nvme0n1".to_string(),
                backend: Backend::ThreadPool,
            }
        );
    }

    #[test]
    fn parses_block_uri_with_backend() {
        let uri = DeviceUri::parse("/dev/nvme0n1?be=io_uring").unwrap();
        assert_eq!(
            uri,
            DeviceUri::Block {
                path: "/dev/nvme0n1".to_string(),
                backend: Backend::IoUring,
            }
        );
    }

    #[test]
    fn parses_pci_uri() {
        let uri = DeviceUri::parse("pci:0000:00:04.0?nsid=1").unwrap();
        assert_eq!(
            uri,
            DeviceUri::Pci {
                bbdf: "0000:00:04.0".to_string(),
                nsid: 1,
            }
        );
    }

    #[test]
    fn rejects_unsupported_backend() {
        let err = DeviceUri::parse("/dev/nvme0n1?be=bogus").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedBackend { .. }));
    }

    #[test]
    fn rejects_pci_uri_without_nsid() {
        assert!(DeviceUri::parse("pci:0000:00:04.0").is_err());
    }

    #[test]
    fn parses_null_uri() {
        let uri = DeviceUri::parse("null://ztl0?zones=256").unwrap();
        match uri {
            DeviceUri::Null { name, params } => {
                assert_eq!(name, "ztl0");
                assert_eq!(params.get("zones").unwrap(), "256");
            }
            _ => panic!("expected Null variant"),
        }
    }
}
