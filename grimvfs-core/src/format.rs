//! Fixed on-disk structures of the container format.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! +------------------+
//! | FileHeader (56B) |  magic, version, mode, algo ids, region offsets, CRC
//! +------------------+
//! | IndexHeader (24B)|  entry count, checksum size, table lengths
//! | string tables    |  dir / name / ext rows (may be hook ciphertext)
//! | entry table      |  fixed records sorted by path_hash
//! +------------------+
//! | DataHeader (16B) |  Archive only
//! | packed payloads  |
//! +------------------+
//! ```

use crate::codec::{crc32, ByteReader, ByteWriter};
use crate::error::{Error, Result};

pub const DEFAULT_MAGIC: [u8; 4] = *b"GRIM";
pub const FORMAT_VERSION: u16 = 1;

pub const FILE_HEADER_LEN: usize = 56;
pub const INDEX_HEADER_LEN: usize = 24;
pub const DATA_HEADER_LEN: usize = 16;
/// Entry record size before the trailing checksum bytes.
pub const ENTRY_BASE_LEN: usize = 48;

/// CRC coverage: everything before the checksum field.
const HEADER_CRC_RANGE: usize = 48;

/// Container flavour recorded in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Manifest,
    Archive,
}

impl Mode {
    pub fn as_u8(self) -> u8 {
        match self {
            Mode::Manifest => 0,
            Mode::Archive => 1,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Mode::Manifest),
            1 => Ok(Mode::Archive),
            other => Err(Error::HeaderCorrupt(format!("unknown mode byte {other:#04x}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub mode: Mode,
    pub index_crypto_id: u16,
    pub checksum_algo_id: u16,
    pub path_hash_algo_id: u16,
    pub index_offset: u64,
    pub index_length: u64,
    pub data_offset: u64,
    pub data_length: u64,
}

impl FileHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(FILE_HEADER_LEN);
        w.put_bytes(&self.magic);
        w.put_u16(self.version);
        w.put_u8(self.mode.as_u8());
        w.put_u8(0);
        w.put_u16(self.index_crypto_id);
        w.put_u16(self.checksum_algo_id);
        w.put_u16(self.path_hash_algo_id);
        w.put_u16(0);
        w.put_u64(self.index_offset);
        w.put_u64(self.index_length);
        w.put_u64(self.data_offset);
        w.put_u64(self.data_length);
        let mut buf = w.into_vec();
        debug_assert_eq!(buf.len(), HEADER_CRC_RANGE);
        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf
    }

    /// Decode and validate a file header against the expected magic.
    pub fn decode(buf: &[u8], expected_magic: [u8; 4]) -> Result<Self> {
        if buf.len() < FILE_HEADER_LEN {
            return Err(Error::HeaderCorrupt(format!(
                "file too short for header: {} bytes",
                buf.len()
            )));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[..4]);
        if magic != expected_magic {
            return Err(Error::BadMagic { expected: expected_magic, found: magic });
        }

        let stored_crc = u32::from_le_bytes([buf[48], buf[49], buf[50], buf[51]]);
        let actual_crc = crc32(&buf[..HEADER_CRC_RANGE]);
        if stored_crc != actual_crc {
            return Err(Error::HeaderCorrupt(format!(
                "header CRC mismatch: stored {stored_crc:#010x}, computed {actual_crc:#010x}"
            )));
        }

        let mut r = ByteReader::new(&buf[4..HEADER_CRC_RANGE]);
        let version = r.get_u16()?;
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let mode = Mode::from_u8(r.get_u8()?)?;
        let _reserved = r.get_u8()?;
        let index_crypto_id = r.get_u16()?;
        let checksum_algo_id = r.get_u16()?;
        let path_hash_algo_id = r.get_u16()?;
        let _reserved2 = r.get_u16()?;
        let index_offset = r.get_u64()?;
        let index_length = r.get_u64()?;
        let data_offset = r.get_u64()?;
        let data_length = r.get_u64()?;

        Ok(Self {
            magic,
            version,
            mode,
            index_crypto_id,
            checksum_algo_id,
            path_hash_algo_id,
            index_offset,
            index_length,
            data_offset,
            data_length,
        })
    }
}

#[derive(Debug, Clone)]
pub struct IndexHeader {
    pub entry_count: u32,
    pub checksum_size: u16,
    pub dir_table_len: u32,
    pub name_table_len: u32,
    pub ext_table_len: u32,
    pub entry_record_size: u16,
}

impl IndexHeader {
    pub fn encode(&self, w: &mut ByteWriter) {
        w.put_u32(self.entry_count);
        w.put_u16(self.checksum_size);
        w.put_u32(self.dir_table_len);
        w.put_u32(self.name_table_len);
        w.put_u32(self.ext_table_len);
        w.put_u16(self.entry_record_size);
        w.put_u32(0);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let entry_count = r.get_u32()?;
        let checksum_size = r.get_u16()?;
        let dir_table_len = r.get_u32()?;
        let name_table_len = r.get_u32()?;
        let ext_table_len = r.get_u32()?;
        let entry_record_size = r.get_u16()?;
        let _reserved = r.get_u32()?;

        let expected = (ENTRY_BASE_LEN + checksum_size as usize) as u16;
        if entry_record_size != expected {
            return Err(Error::Invalid(format!(
                "entry record size {entry_record_size} does not match checksum size {checksum_size}"
            )));
        }
        Ok(Self {
            entry_count,
            checksum_size,
            dir_table_len,
            name_table_len,
            ext_table_len,
            entry_record_size,
        })
    }
}

/// Archive data region header; payloads follow immediately.
#[derive(Debug, Clone)]
pub struct DataHeader {
    pub total_raw: u64,
    pub total_packed: u64,
}

impl DataHeader {
    pub fn encode(&self, w: &mut ByteWriter) {
        w.put_u64(self.total_raw);
        w.put_u64(self.total_packed);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self { total_raw: r.get_u64()?, total_packed: r.get_u64()? })
    }
}

/// One file record in the entry table.
///
/// `data_offset` is relative to the first payload byte of the data region;
/// Manifest records keep it at 0 together with `algo_id`, and carry
/// `packed_size == raw_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub path_hash: u64,
    pub dir_id: u32,
    pub name_id: u32,
    pub ext_id: u32,
    pub raw_size: u64,
    pub packed_size: u64,
    pub data_offset: u64,
    pub algo_id: u16,
    pub flags: u16,
    pub checksum: Vec<u8>,
}

impl EntryRecord {
    pub fn record_size(checksum_size: u16) -> usize {
        ENTRY_BASE_LEN + checksum_size as usize
    }

    pub fn encode(&self, w: &mut ByteWriter, checksum_size: u16) {
        w.put_u64(self.path_hash);
        w.put_u32(self.dir_id);
        w.put_u32(self.name_id);
        w.put_u32(self.ext_id);
        w.put_u64(self.raw_size);
        w.put_u64(self.packed_size);
        w.put_u64(self.data_offset);
        w.put_u16(self.algo_id);
        w.put_u16(self.flags);
        // Zero-pad short checksums to the fixed field width.
        let n = checksum_size as usize;
        if self.checksum.len() >= n {
            w.put_bytes(&self.checksum[..n]);
        } else {
            w.put_bytes(&self.checksum);
            w.put_bytes(&vec![0u8; n - self.checksum.len()]);
        }
    }

    pub fn decode(r: &mut ByteReader<'_>, checksum_size: u16) -> Result<Self> {
        Ok(Self {
            path_hash: r.get_u64()?,
            dir_id: r.get_u32()?,
            name_id: r.get_u32()?,
            ext_id: r.get_u32()?,
            raw_size: r.get_u64()?,
            packed_size: r.get_u64()?,
            data_offset: r.get_u64()?,
            algo_id: r.get_u16()?,
            flags: r.get_u16()?,
            checksum: r.take(checksum_size as usize)?.to_vec(),
        })
    }
}

/// Reject magics that are not exactly four ASCII bytes.
pub fn validate_magic(magic: &[u8]) -> Result<[u8; 4]> {
    if magic.len() != 4 || !magic.iter().all(|b| b.is_ascii() && !b.is_ascii_control()) {
        return Err(Error::Invalid(format!("magic must be 4 printable ASCII bytes, got {magic:?}")));
    }
    let mut out = [0u8; 4];
    out.copy_from_slice(magic);
    Ok(out)
}
