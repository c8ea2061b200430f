pub mod builder;
pub mod reader;

use crate::error::{Result, SiltError};
use crate::memtable::Entry;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// "SSTL", trailing magic of every table file.
pub const SSTABLE_MAGIC: u32 = 0x5353_544C;
pub const FORMAT_VERSION: u16 = 2;
/// The file always ends in `[footer_size:u32][magic:u32]`.
pub const TAIL_LEN: usize = 8;

pub fn sstable_file_name(file_number: u64) -> String {
    format!("sstable-{file_number:05}.sst")
}

/// Metadata produced by the builder and carried in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SsTableMeta {
    pub file_number: u64,
    pub file_path: PathBuf,
    pub entry_count: u64,
    pub first_key: String,
    pub last_key: String,
    pub file_size: u64,
    pub created_at: u64,
    pub data_offset: u64,
    pub index_offset: u64,
    pub filter_offset: Option<u64>,
}

/// Data entry: `[key_len:u16][key][value_len:u32][value][timestamp:u64][tombstone:u8]`.
pub fn encode_entry(buf: &mut BytesMut, key: &[u8], entry: &Entry) {
    buf.put_u16(key.len() as u16);
    buf.put_slice(key);
    buf.put_u32(entry.value.len() as u32);
    buf.put_slice(&entry.value);
    buf.put_u64(entry.timestamp_ms);
    buf.put_u8(entry.tombstone as u8);
}

pub fn encoded_entry_len(key: &[u8], entry: &Entry) -> usize {
    2 + key.len() + 4 + entry.value.len() + 8 + 1
}

/// Decodes one entry from the front of `data`, returning it with the number
/// of bytes consumed.
pub fn decode_entry(data: &[u8]) -> Result<((Bytes, Entry), usize)> {
    let mut cursor = data;
    if cursor.remaining() < 2 {
        return Err(truncated("entry key length"));
    }
    let key_len = cursor.get_u16() as usize;
    if cursor.remaining() < key_len + 4 {
        return Err(truncated("entry key"));
    }
    let key = Bytes::copy_from_slice(&cursor[..key_len]);
    cursor.advance(key_len);
    let value_len = cursor.get_u32() as usize;
    if cursor.remaining() < value_len + 9 {
        return Err(truncated("entry value"));
    }
    let value = Bytes::copy_from_slice(&cursor[..value_len]);
    cursor.advance(value_len);
    let timestamp_ms = cursor.get_u64();
    let tombstone = match cursor.get_u8() {
        0 => false,
        1 => true,
        other => {
            return Err(SiltError::Corruption(format!(
                "invalid tombstone marker {other}"
            )))
        }
    };
    let consumed = 2 + key_len + 4 + value_len + 8 + 1;
    Ok((
        (
            key,
            Entry {
                value,
                timestamp_ms,
                tombstone,
            },
        ),
        consumed,
    ))
}

/// Index entry: `[key_len:u16][key][data_offset:u64]`.
pub fn encode_index_entry(buf: &mut BytesMut, key: &[u8], data_offset: u64) {
    buf.put_u16(key.len() as u16);
    buf.put_slice(key);
    buf.put_u64(data_offset);
}

pub fn decode_index_entry(data: &[u8]) -> Result<((Bytes, u64), usize)> {
    let mut cursor = data;
    if cursor.remaining() < 2 {
        return Err(truncated("index entry key length"));
    }
    let key_len = cursor.get_u16() as usize;
    if cursor.remaining() < key_len + 8 {
        return Err(truncated("index entry"));
    }
    let key = Bytes::copy_from_slice(&cursor[..key_len]);
    cursor.advance(key_len);
    let data_offset = cursor.get_u64();
    Ok(((key, data_offset), 2 + key_len + 8))
}

/// Fixed trailer of the file. The last 8 bytes are always
/// `[footer_size:u32][magic:u32]` so a reader can locate the footer from
/// the tail; `filter_offset` exists only from version 2, where 0 encodes
/// "no filter section".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub file_number: u32,
    pub entry_count: u32,
    pub data_offset: u64,
    pub index_offset: u64,
    pub filter_offset: u64,
    pub first_key: Bytes,
    pub last_key: Bytes,
    pub created_at: u64,
    pub version: u16,
}

impl Footer {
    /// Encodes the footer including the trailing `[footer_size][magic]`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.file_number);
        buf.put_u32(self.entry_count);
        buf.put_u64(self.data_offset);
        buf.put_u64(self.index_offset);
        if self.version >= 2 {
            buf.put_u64(self.filter_offset);
        }
        buf.put_u16(self.first_key.len() as u16);
        buf.put_slice(&self.first_key);
        buf.put_u16(self.last_key.len() as u16);
        buf.put_slice(&self.last_key);
        buf.put_u64(self.created_at);
        buf.put_u16(self.version);

        let footer_size = buf.len() as u32;
        buf.put_u32(footer_size);
        buf.put_u32(SSTABLE_MAGIC);
        buf.freeze()
    }

    /// Parses the trailing 8 bytes, verifying the magic. Returns the size of
    /// the footer body that precedes them.
    pub fn read_tail(tail: &[u8]) -> Result<u32> {
        if tail.len() < TAIL_LEN {
            return Err(truncated("footer tail"));
        }
        let mut cursor = &tail[tail.len() - TAIL_LEN..];
        let footer_size = cursor.get_u32();
        let magic = cursor.get_u32();
        if magic != SSTABLE_MAGIC {
            return Err(SiltError::Corruption(format!(
                "bad sstable magic: expected {SSTABLE_MAGIC:#010x}, got {magic:#010x}"
            )));
        }
        Ok(footer_size)
    }

    /// Decodes the footer body (everything before the trailing 8 bytes).
    /// The version field sits at the end, so the layout of the leading
    /// fields is fixed across versions and the filter offset is gated after
    /// the fact.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 2 {
            return Err(truncated("footer body"));
        }
        let version = (&body[body.len() - 2..]).get_u16();
        if version == 0 || version > FORMAT_VERSION {
            return Err(SiltError::Corruption(format!(
                "unsupported sstable version {version}"
            )));
        }

        let mut cursor = body;
        if cursor.remaining() < 24 {
            return Err(truncated("footer fixed fields"));
        }
        let file_number = cursor.get_u32();
        let entry_count = cursor.get_u32();
        let data_offset = cursor.get_u64();
        let index_offset = cursor.get_u64();
        let filter_offset = if version >= 2 {
            if cursor.remaining() < 8 {
                return Err(truncated("footer filter offset"));
            }
            cursor.get_u64()
        } else {
            0
        };

        if cursor.remaining() < 2 {
            return Err(truncated("footer first key"));
        }
        let first_key_len = cursor.get_u16() as usize;
        if cursor.remaining() < first_key_len + 2 {
            return Err(truncated("footer first key"));
        }
        let first_key = Bytes::copy_from_slice(&cursor[..first_key_len]);
        cursor.advance(first_key_len);
        let last_key_len = cursor.get_u16() as usize;
        if cursor.remaining() < last_key_len + 10 {
            return Err(truncated("footer last key"));
        }
        let last_key = Bytes::copy_from_slice(&cursor[..last_key_len]);
        cursor.advance(last_key_len);
        let created_at = cursor.get_u64();

        Ok(Self {
            file_number,
            entry_count,
            data_offset,
            index_offset,
            filter_offset,
            first_key,
            last_key,
            created_at,
            version,
        })
    }
}

fn truncated(what: &str) -> SiltError {
    SiltError::Corruption(format!("sstable truncated while reading {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let mut buf = BytesMut::new();
        let entry = Entry::put(Bytes::from("value"), 42);
        encode_entry(&mut buf, b"key", &entry);
        assert_eq!(buf.len(), encoded_entry_len(b"key", &entry));

        let ((key, decoded), consumed) = decode_entry(&buf).unwrap();
        assert_eq!(key, Bytes::from("key"));
        assert_eq!(decoded, entry);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn tombstone_entry_roundtrip() {
        let mut buf = BytesMut::new();
        encode_entry(&mut buf, b"gone", &Entry::tombstone(7));
        let ((key, decoded), _) = decode_entry(&buf).unwrap();
        assert_eq!(key, Bytes::from("gone"));
        assert!(decoded.tombstone);
        assert!(decoded.value.is_empty());
    }

    #[test]
    fn entry_rejects_truncation() {
        let mut buf = BytesMut::new();
        encode_entry(&mut buf, b"key", &Entry::put(Bytes::from("value"), 42));
        for cut in [1, 5, buf.len() - 1] {
            assert!(decode_entry(&buf[..cut]).is_err());
        }
    }

    #[test]
    fn index_entry_roundtrip() {
        let mut buf = BytesMut::new();
        encode_index_entry(&mut buf, b"pivot", 4096);
        let ((key, offset), consumed) = decode_index_entry(&buf).unwrap();
        assert_eq!(key, Bytes::from("pivot"));
        assert_eq!(offset, 4096);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn footer_roundtrip() {
        let footer = Footer {
            file_number: 3,
            entry_count: 120,
            data_offset: 0,
            index_offset: 9000,
            filter_offset: 9500,
            first_key: Bytes::from("aardvark"),
            last_key: Bytes::from("zebra"),
            created_at: 1_700_000_000_000,
            version: FORMAT_VERSION,
        };
        let encoded = footer.encode();

        let footer_size = Footer::read_tail(&encoded).unwrap() as usize;
        assert_eq!(footer_size, encoded.len() - TAIL_LEN);
        let decoded = Footer::decode(&encoded[..footer_size]).unwrap();
        assert_eq!(decoded, footer);
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let footer = Footer {
            file_number: 1,
            entry_count: 1,
            data_offset: 0,
            index_offset: 10,
            filter_offset: 0,
            first_key: Bytes::from("a"),
            last_key: Bytes::from("a"),
            created_at: 0,
            version: FORMAT_VERSION,
        };
        let mut encoded = footer.encode().to_vec();
        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;
        assert!(Footer::read_tail(&encoded).is_err());
    }
}
