//! The on-disk snapshot loader: a read-only parser for the leader's snapshot file format.
//! This server never writes one of these — only `--dir`/`--dbfilename` startup loading is
//! implemented.

use std::collections::HashMap;
use std::path::Path;

use crate::{log_debug, log_warn};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a valid snapshot file: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, SnapshotError>;

const MAGIC: &[u8] = b"REDIS";

const OP_AUX: u8 = 0xFA;
const OP_SELECTDB: u8 = 0xFE;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_EOF: u8 = 0xFF;

const VALUE_TYPE_STRING: u8 = 0x00;

/// String entries recovered from the file, keyed by the stored key. The millisecond value is
/// the entry's absolute Unix-epoch expiry time if an expiry opcode preceded it.
pub struct Loaded {
    pub entries: HashMap<Vec<u8>, (Vec<u8>, Option<u64>)>,
}

pub fn load_file(path: &Path) -> Result<Loaded> {
    let bytes = std::fs::read(path)?;
    parse(&bytes)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| SnapshotError::Invalid("unexpected end of file".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(SnapshotError::Invalid("unexpected end of file".to_string()));
        }
        let out = self.bytes[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

enum LengthOrInt {
    Len(usize),
    Int(i64),
}

/// Decode a length-prefixed header: the top two bits of the first byte select 6-bit,
/// 14-bit, 32-bit, or special-integer encoding.
fn read_length(cur: &mut Cursor) -> Result<LengthOrInt> {
    let first = cur.read_u8()?;
    match first >> 6 {
        0b00 => Ok(LengthOrInt::Len((first & 0x3F) as usize)),
        0b01 => {
            let second = cur.read_u8()?;
            Ok(LengthOrInt::Len((((first & 0x3F) as usize) << 8) | second as usize))
        }
        0b10 => {
            let bytes = cur.read_vec(4)?;
            let len = u32::from_be_bytes(bytes.try_into().unwrap());
            Ok(LengthOrInt::Len(len as usize))
        }
        0b11 => {
            let value = match first & 0x3F {
                0 => cur.read_u8()? as i8 as i64,
                1 => i16::from_le_bytes(cur.read_vec(2)?.try_into().unwrap()) as i64,
                2 => i32::from_le_bytes(cur.read_vec(4)?.try_into().unwrap()) as i64,
                other => {
                    return Err(SnapshotError::Invalid(format!(
                        "unsupported special-integer width selector {}",
                        other
                    )))
                }
            };
            Ok(LengthOrInt::Int(value))
        }
        _ => unreachable!("two bits can only take four values"),
    }
}

fn read_string(cur: &mut Cursor) -> Result<Vec<u8>> {
    match read_length(cur)? {
        LengthOrInt::Len(len) => cur.read_vec(len),
        LengthOrInt::Int(value) => Ok(value.to_string().into_bytes()),
    }
}

fn parse(bytes: &[u8]) -> Result<Loaded> {
    let mut cur = Cursor::new(bytes);
    let magic = cur.read_vec(5)?;
    if magic != MAGIC {
        return Err(SnapshotError::Invalid("missing REDIS magic header".to_string()));
    }
    let _version = cur.read_vec(4)?;

    let mut entries = HashMap::new();
    let mut pending_expiry_ms: Option<u64> = None;

    while cur.remaining() > 0 {
        let opcode = cur.read_u8()?;
        match opcode {
            OP_EOF => {
                if let Ok(checksum) = cur.read_vec(8) {
                    if checksum.iter().all(|&b| b == 0) {
                        log_debug!("snapshot checksum disabled (all-zero trailer)");
                    } else {
                        log_debug!("snapshot checksum present, not verified");
                    }
                }
                break;
            }
            OP_SELECTDB => {
                read_length(&mut cur)?;
            }
            OP_RESIZEDB => {
                read_length(&mut cur)?;
                read_length(&mut cur)?;
            }
            OP_AUX => {
                read_string(&mut cur)?;
                read_string(&mut cur)?;
            }
            OP_EXPIRETIME_MS => {
                let bytes = cur.read_vec(8)?;
                pending_expiry_ms = Some(u64::from_le_bytes(bytes.try_into().unwrap()));
                let value_type = cur.read_u8()?;
                if value_type != VALUE_TYPE_STRING {
                    log_warn!(
                        "snapshot entry has unsupported value type {:#04x}, stopping load",
                        value_type
                    );
                    break;
                }
                let key = read_string(&mut cur)?;
                let value = read_string(&mut cur)?;
                entries.insert(key, (value, pending_expiry_ms.take()));
            }
            value_type => {
                if value_type != VALUE_TYPE_STRING {
                    log_warn!(
                        "snapshot entry has unsupported value type {:#04x}, stopping load",
                        value_type
                    );
                    break;
                }
                let key = read_string(&mut cur)?;
                let value = read_string(&mut cur)?;
                entries.insert(key, (value, pending_expiry_ms.take()));
            }
        }
    }

    Ok(Loaded { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_header() -> Vec<u8> {
        let mut v = b"REDIS".to_vec();
        v.extend_from_slice(b"0011");
        v
    }

    #[test]
    fn rejects_missing_magic() {
        assert!(parse(b"NOTREDIS").is_err());
    }

    #[test]
    fn loads_plain_string_entry() {
        let mut bytes = empty_header();
        bytes.push(0x00); // value type: string
        bytes.push(3); // 6-bit length
        bytes.extend_from_slice(b"foo");
        bytes.push(3);
        bytes.extend_from_slice(b"bar");
        bytes.push(OP_EOF);
        bytes.extend_from_slice(&[0u8; 8]);

        let loaded = parse(&bytes).unwrap();
        assert_eq!(loaded.entries.get(b"foo".as_slice()), Some(&(b"bar".to_vec(), None)));
    }

    #[test]
    fn loads_entry_with_expiry() {
        let mut bytes = empty_header();
        bytes.push(OP_EXPIRETIME_MS);
        bytes.extend_from_slice(&1_700_000_000_000u64.to_le_bytes());
        bytes.push(0x00);
        bytes.push(3);
        bytes.extend_from_slice(b"foo");
        bytes.push(3);
        bytes.extend_from_slice(b"bar");
        bytes.push(OP_EOF);
        bytes.extend_from_slice(&[0u8; 8]);

        let loaded = parse(&bytes).unwrap();
        assert_eq!(
            loaded.entries.get(b"foo".as_slice()),
            Some(&(b"bar".to_vec(), Some(1_700_000_000_000)))
        );
    }

    #[test]
    fn unsupported_value_type_stops_load_but_keeps_prior_keys() {
        let mut bytes = empty_header();
        bytes.push(0x00);
        bytes.push(3);
        bytes.extend_from_slice(b"foo");
        bytes.push(3);
        bytes.extend_from_slice(b"bar");
        bytes.push(0x02); // unsupported (e.g. list) value type
        bytes.push(3);
        bytes.extend_from_slice(b"baz");

        let loaded = parse(&bytes).unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert!(loaded.entries.contains_key(b"foo".as_slice()));
    }
}
