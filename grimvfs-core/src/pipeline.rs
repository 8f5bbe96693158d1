//! Per-entry transform pipeline.
//!
//! Write path: checksum the raw bytes, then optionally compress. The
//! checksum is always taken over the uncompressed data, which lets a reader
//! verify integrity without decompressing.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hooks::{ChecksumHook, HookRegistry};

/// Output of the write-side pipeline for one entry.
pub struct PackedBlob {
    pub raw_size: u64,
    pub packed: Vec<u8>,
    pub algo_id: u16,
    pub checksum: Vec<u8>,
}

/// Run checksum and optional compression over one entry's raw bytes.
pub fn pack_blob(
    raw: Vec<u8>,
    algo_id: u16,
    registry: &HookRegistry,
    checksum_hook: Option<&Arc<dyn ChecksumHook>>,
) -> Result<PackedBlob> {
    let raw_size = raw.len() as u64;
    let checksum = match checksum_hook {
        Some(hook) => hook.compute(&raw),
        None => Vec::new(),
    };
    let packed = if algo_id != 0 {
        registry.compression(algo_id)?.compress(&raw)?
    } else {
        raw
    };
    Ok(PackedBlob { raw_size, packed, algo_id, checksum })
}

/// Inverse of [`pack_blob`]: decompress a stored payload back to raw bytes.
pub fn unpack_blob(
    packed: &[u8],
    raw_size: u64,
    algo_id: u16,
    registry: &HookRegistry,
) -> Result<Vec<u8>> {
    if algo_id == 0 {
        if packed.len() as u64 != raw_size {
            return Err(Error::Invalid(format!(
                "stored entry is {} bytes but records a raw size of {raw_size}",
                packed.len()
            )));
        }
        return Ok(packed.to_vec());
    }
    registry.compression(algo_id)?.decompress(packed, raw_size)
}

/// Compare raw bytes against a stored checksum.
pub fn verify_blob(
    raw: &[u8],
    expected: &[u8],
    hook: &Arc<dyn ChecksumHook>,
    path: &str,
) -> Result<()> {
    let actual = hook.compute(raw);
    if actual != expected {
        return Err(Error::ChecksumMismatch {
            path: path.to_string(),
            expected: hex(expected),
            actual: hex(&actual),
        });
    }
    Ok(())
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
