//! Builtin payload compression hooks: zlib and zstd.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::hooks::CompressionHook;

pub const COMPRESSION_STORED: u16 = 0;
pub const COMPRESSION_ZLIB: u16 = 1;
pub const COMPRESSION_ZSTD: u16 = 2;

pub struct ZlibCompression {
    level: u32,
}

impl ZlibCompression {
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }
}

impl Default for ZlibCompression {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl CompressionHook for ZlibCompression {
    fn algo_id(&self) -> u16 {
        COMPRESSION_ZLIB
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        enc.write_all(data)?;
        Ok(enc.finish()?)
    }

    fn decompress(&self, data: &[u8], raw_size: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(raw_size as usize);
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| Error::DecompressError(format!("zlib: {e}")))?;
        check_raw_size(out, raw_size)
    }
}

pub struct ZstdCompression {
    level: i32,
}

impl ZstdCompression {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompression {
    fn default() -> Self {
        Self { level: 0 }
    }
}

impl CompressionHook for ZstdCompression {
    fn algo_id(&self) -> u16 {
        COMPRESSION_ZSTD
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(zstd::stream::encode_all(data, self.level)?)
    }

    fn decompress(&self, data: &[u8], raw_size: u64) -> Result<Vec<u8>> {
        let out = zstd::stream::decode_all(data)
            .map_err(|e| Error::DecompressError(format!("zstd: {e}")))?;
        check_raw_size(out, raw_size)
    }
}

/// Decompressed output must match the recorded raw size exactly.
fn check_raw_size(out: Vec<u8>, raw_size: u64) -> Result<Vec<u8>> {
    if out.len() as u64 != raw_size {
        return Err(Error::DecompressError(format!(
            "expected {raw_size} bytes after decompression, got {}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_roundtrip_and_size_check() {
        let hook = ZlibCompression::default();
        let raw = b"the same phrase over and over, the same phrase over and over".repeat(32);
        let packed = hook.compress(&raw).unwrap();
        assert!(packed.len() < raw.len());
        assert_eq!(hook.decompress(&packed, raw.len() as u64).unwrap(), raw);
        // Wrong declared size must fail rather than return short data.
        assert!(hook.decompress(&packed, raw.len() as u64 + 1).is_err());
    }

    #[test]
    fn zstd_roundtrip() {
        let hook = ZstdCompression::default();
        let raw = vec![0u8; 64 * 1024];
        let packed = hook.compress(&raw).unwrap();
        assert!(packed.len() < raw.len());
        assert_eq!(hook.decompress(&packed, raw.len() as u64).unwrap(), raw);
    }
}
