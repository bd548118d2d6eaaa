//! FS-metadata record and superblock encoding (`spec.md` §4.6, §6).
//! Grounded on the reference stack's `nexus_metadata.rs`: a checksummed
//! payload behind a small fixed header. The superblock is framed with
//! `bincode` (its layout isn't wire-specified beyond `{magic,
//! sequence}`); record payloads are hand-encoded to the exact
//! `{level, file_size, piece_count, name[128]}` file-record shape
//! `spec.md` §4.6/§6 specifies, including the fixed `char[128]`/`u8
//! name[128]` name fields, rather than going through `bincode`'s
//! length-prefixed `String` encoding.
use crc::crc32;
use serde::{Deserialize, Serialize};

use crate::constants::{FS_METADATA_NAME_LEN, FS_METADATA_SUPERBLOCK_MAGIC};
use crate::error::{MetaError, ResourceError};
use crate::ucmd::MappingTuple;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordTag {
    Base = 0,
    Update = 1,
    Replace = 2,
    Delete = 3,
    GcChange = 4,
}

impl RecordTag {
    fn from_u8(v: u8) -> Result<Self, MetaError> {
        match v {
            0 => Ok(Self::Base),
            1 => Ok(Self::Update),
            2 => Ok(Self::Replace),
            3 => Ok(Self::Delete),
            4 => Ok(Self::GcChange),
            other => Err(MetaError::Corrupt {
                reason: format!("unknown record tag {other}"),
            }),
        }
    }
}

/// A file's level tag, size, and piece list (`spec.md` §4.6 FileMeta).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub level: i8,
    pub file_size: u64,
    pub pieces: Vec<MappingTuple>,
}

/// Write `name` into a fixed `FS_METADATA_NAME_LEN`-byte, NUL-padded
/// field (`spec.md` §4.6/§6 `char[128]`/`u8 name[128]`).
fn write_fixed_name(out: &mut Vec<u8>, name: &str) -> Result<(), MetaError> {
    let bytes = name.as_bytes();
    if bytes.len() >= FS_METADATA_NAME_LEN {
        let source = ResourceError::OutOfBounds {
            index: bytes.len(),
            limit: FS_METADATA_NAME_LEN,
        };
        return Err(MetaError::WriteFailed {
            reason: format!("file name too long for on-disk record: {source}"),
        });
    }
    let start = out.len();
    out.resize(start + FS_METADATA_NAME_LEN, 0);
    out[start..start + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Read a fixed `FS_METADATA_NAME_LEN`-byte name field, trimming NUL
/// padding.
fn read_fixed_name(buf: &[u8]) -> Result<String, MetaError> {
    if buf.len() < FS_METADATA_NAME_LEN {
        return Err(MetaError::Corrupt {
            reason: "truncated name field".to_string(),
        });
    }
    let raw = &buf[..FS_METADATA_NAME_LEN];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end])
        .map(str::to_string)
        .map_err(|e| MetaError::Corrupt {
            reason: format!("name field is not valid utf8: {e}"),
        })
}

/// Write one `{level, file_size, piece_count, name[128]}` file record
/// followed by its `piece_count` mapping tuples (`spec.md` §4.6).
fn write_file_record(out: &mut Vec<u8>, name: &str, meta: &FileMeta) -> Result<(), MetaError> {
    out.push(meta.level as u8);
    out.extend_from_slice(&meta.file_size.to_le_bytes());
    out.extend_from_slice(&(meta.pieces.len() as i32).to_le_bytes());
    write_fixed_name(out, name)?;
    for piece in &meta.pieces {
        out.extend_from_slice(&piece.0.to_le_bytes());
    }
    Ok(())
}

const FILE_RECORD_HEADER_LEN: usize = 1 + 8 + 4 + FS_METADATA_NAME_LEN;

/// Read one file record written by [`write_file_record`]. Returns the
/// name, the decoded `FileMeta`, and the number of bytes consumed.
fn read_file_record(buf: &[u8]) -> Result<(String, FileMeta, usize), MetaError> {
    if buf.len() < FILE_RECORD_HEADER_LEN {
        return Err(MetaError::Corrupt {
            reason: "truncated file record header".to_string(),
        });
    }
    let level = buf[0] as i8;
    let file_size = u64::from_le_bytes(buf[1..9].try_into().unwrap());
    let piece_count = i32::from_le_bytes(buf[9..13].try_into().unwrap());
    if piece_count < 0 {
        return Err(MetaError::Corrupt {
            reason: format!("negative piece count {piece_count}"),
        });
    }
    let name = read_fixed_name(&buf[13..FILE_RECORD_HEADER_LEN])?;

    let mut offset = FILE_RECORD_HEADER_LEN;
    let mut pieces = Vec::with_capacity(piece_count as usize);
    for _ in 0..piece_count {
        if buf.len() < offset + 8 {
            return Err(MetaError::Corrupt {
                reason: "truncated mapping tuple list".to_string(),
            });
        }
        pieces.push(MappingTuple(u64::from_le_bytes(
            buf[offset..offset + 8].try_into().unwrap(),
        )));
        offset += 8;
    }
    Ok((
        name,
        FileMeta {
            level,
            file_size,
            pieces,
        },
        offset,
    ))
}

#[derive(Debug, Clone)]
pub enum RecordPayload {
    Base {
        files: Vec<(String, FileMeta)>,
    },
    Update {
        name: String,
        delta: FileMeta,
    },
    Replace {
        src_name: String,
        dst_name: String,
    },
    Delete {
        name: String,
    },
    GcChange {
        name: String,
        file: FileMeta,
    },
}

impl RecordPayload {
    fn tag(&self) -> RecordTag {
        match self {
            Self::Base { .. } => RecordTag::Base,
            Self::Update { .. } => RecordTag::Update,
            Self::Replace { .. } => RecordTag::Replace,
            Self::Delete { .. } => RecordTag::Delete,
            Self::GcChange { .. } => RecordTag::GcChange,
        }
    }
}

/// `{ crc32, data_length, tag }` plus the encoded payload, padded to a
/// whole number of sectors (`spec.md` §3 FS-metadata record).
pub struct Record {
    pub payload: RecordPayload,
}

impl Record {
    pub fn new(payload: RecordPayload) -> Self {
        Self { payload }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, MetaError> {
        let mut out = Vec::new();
        match &self.payload {
            RecordPayload::Base { files } => {
                out.extend_from_slice(&(files.len() as u32).to_le_bytes());
                for (name, meta) in files {
                    write_file_record(&mut out, name, meta)?;
                }
            }
            RecordPayload::Update { name, delta } => {
                write_file_record(&mut out, name, delta)?;
            }
            RecordPayload::Replace { src_name, dst_name } => {
                write_fixed_name(&mut out, src_name)?;
                write_fixed_name(&mut out, dst_name)?;
            }
            RecordPayload::Delete { name } => {
                write_fixed_name(&mut out, name)?;
            }
            RecordPayload::GcChange { name, file } => {
                write_file_record(&mut out, name, file)?;
            }
        }
        Ok(out)
    }

    fn decode_payload(tag: RecordTag, buf: &[u8]) -> Result<RecordPayload, MetaError> {
        match tag {
            RecordTag::Base => {
                if buf.len() < 4 {
                    return Err(MetaError::Corrupt {
                        reason: "truncated Base file count".to_string(),
                    });
                }
                let file_count = u32::from_le_bytes(buf[0..4].try_into().unwrap());
                let mut offset = 4;
                let mut files = Vec::with_capacity(file_count as usize);
                for _ in 0..file_count {
                    let (name, meta, consumed) = read_file_record(&buf[offset..])?;
                    files.push((name, meta));
                    offset += consumed;
                }
                Ok(RecordPayload::Base { files })
            }
            RecordTag::Update => {
                let (name, delta, _) = read_file_record(buf)?;
                Ok(RecordPayload::Update { name, delta })
            }
            RecordTag::Replace => {
                if buf.len() < 2 * FS_METADATA_NAME_LEN {
                    return Err(MetaError::Corrupt {
                        reason: "truncated Replace record".to_string(),
                    });
                }
                let src_name = read_fixed_name(&buf[..FS_METADATA_NAME_LEN])?;
                let dst_name = read_fixed_name(&buf[FS_METADATA_NAME_LEN..2 * FS_METADATA_NAME_LEN])?;
                Ok(RecordPayload::Replace { src_name, dst_name })
            }
            RecordTag::Delete => {
                let name = read_fixed_name(buf)?;
                Ok(RecordPayload::Delete { name })
            }
            RecordTag::GcChange => {
                let (name, file, _) = read_file_record(buf)?;
                Ok(RecordPayload::GcChange { name, file })
            }
        }
    }

    /// Encode the record, padded with zeros to the next multiple of
    /// `sector_bytes`.
    pub fn encode(&self, sector_bytes: u64) -> Result<Vec<u8>, MetaError> {
        let payload_bytes = self.encode_payload()?;
        let crc = crc32::checksum_ieee(&payload_bytes);
        let tag = self.payload.tag() as u8;

        let mut out = Vec::with_capacity(payload_bytes.len() + 16);
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(payload_bytes.len() as u32).to_le_bytes());
        out.push(tag);
        out.extend_from_slice(&payload_bytes);

        let sector_bytes = sector_bytes as usize;
        let padded_len = out.len().div_ceil(sector_bytes) * sector_bytes;
        out.resize(padded_len, 0);
        Ok(out)
    }

    /// Decode one record starting at the front of `buf`. Returns the
    /// decoded record and the number of header+payload bytes consumed
    /// (before sector padding is accounted for by the caller), or
    /// `None` if `data_length == 0` — the log tail marker
    /// (`spec.md` §4.6).
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, MetaError> {
        if buf.len() < 9 {
            return Err(MetaError::Corrupt {
                reason: "buffer shorter than a record header".to_string(),
            });
        }
        let crc = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let data_length = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if data_length == 0 {
            return Ok(None);
        }
        let tag = RecordTag::from_u8(buf[8])?;
        let payload_start = 9;
        let payload_end = payload_start + data_length as usize;
        if buf.len() < payload_end {
            return Err(MetaError::Corrupt {
                reason: "truncated record payload".to_string(),
            });
        }
        let payload_bytes = &buf[payload_start..payload_end];
        let actual_crc = crc32::checksum_ieee(payload_bytes);
        if actual_crc != crc {
            return Err(MetaError::Corrupt {
                reason: "record payload checksum mismatch".to_string(),
            });
        }
        let payload = Self::decode_payload(tag, payload_bytes)?;
        Ok(Some((Self { payload }, payload_end)))
    }
}

/// `{ magic, sequence }` at LBA 0 of each reserved zone (`spec.md` §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ZoneSuperblock {
    pub magic: u8,
    pub sequence: u64,
}

impl ZoneSuperblock {
    pub const MAGIC: u8 = FS_METADATA_SUPERBLOCK_MAGIC;

    pub fn new(sequence: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            sequence,
        }
    }

    pub fn encode(&self, sector_bytes: u64) -> Vec<u8> {
        let mut out = bincode::serialize(self).expect("superblock serialization is infallible");
        out.resize(sector_bytes as usize, 0);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let sb: Self = bincode::deserialize(buf).ok()?;
        if sb.magic != Self::MAGIC {
            return None;
        }
        Some(sb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let payload = RecordPayload::Base {
            files: vec![(
                "a".to_string(),
                FileMeta {
                    level: 0,
                    file_size: 4096,
                    pieces: vec![MappingTuple::pack(0, 0, 8)],
                },
            )],
        };
        let record = Record::new(payload);
        let bytes = record.encode(512).unwrap();
        assert_eq!(bytes.len() % 512, 0);
        let (decoded, _) = Record::decode(&bytes).unwrap().unwrap();
        match decoded.payload {
            RecordPayload::Base { files } => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].0, "a");
            }
            _ => panic!("wrong tag"),
        }
    }

    #[test]
    fn zero_data_length_is_tail_marker() {
        let buf = vec![0u8; 512];
        assert!(Record::decode(&buf).unwrap().is_none());
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let payload = RecordPayload::Delete {
            name: "x".to_string(),
        };
        let record = Record::new(payload);
        let mut bytes = record.encode(512).unwrap();
        bytes[0] ^= 0xFF;
        assert!(Record::decode(&bytes).is_err());
    }

    #[test]
    fn superblock_round_trips() {
        let sb = ZoneSuperblock::new(7);
        let bytes = sb.encode(512);
        let decoded = ZoneSuperblock::decode(&bytes).unwrap();
        assert_eq!(decoded.sequence, 7);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let buf = vec![0u8; 512];
        assert!(ZoneSuperblock::decode(&buf).is_none());
    }

    #[test]
    fn name_longer_than_field_is_rejected() {
        let payload = RecordPayload::Delete {
            name: "x".repeat(FS_METADATA_NAME_LEN),
        };
        let record = Record::new(payload);
        assert!(matches!(
            record.encode(512),
            Err(MetaError::WriteFailed { .. })
        ));
    }

    #[test]
    fn name_is_nul_trimmed_on_decode() {
        let payload = RecordPayload::Delete {
            name: "short".to_string(),
        };
        let record = Record::new(payload);
        let bytes = record.encode(512).unwrap();
        let (decoded, _) = Record::decode(&bytes).unwrap().unwrap();
        match decoded.payload {
            RecordPayload::Delete { name } => assert_eq!(name, "short"),
            _ => panic!("wrong tag"),
        }
    }
}
