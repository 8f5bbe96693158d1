//! Builtin checksum hooks.
//!
//! Id assignments follow the global algorithm table: 1 = CRC32, 2 = MD5,
//! 3 = SHA-1, 4 = SHA-256, 6 = BLAKE3 (5 and 7..=9 belong to algorithms
//! only the external providers compute).

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::hooks::ChecksumHook;

pub const CHECKSUM_NONE: u16 = 0;
pub const CHECKSUM_CRC32: u16 = 1;
pub const CHECKSUM_MD5: u16 = 2;
pub const CHECKSUM_SHA1: u16 = 3;
pub const CHECKSUM_SHA256: u16 = 4;
pub const CHECKSUM_BLAKE3: u16 = 6;

pub struct Crc32Checksum;

impl ChecksumHook for Crc32Checksum {
    fn algo_id(&self) -> u16 {
        CHECKSUM_CRC32
    }

    fn output_size(&self) -> u16 {
        4
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        crate::codec::crc32(data).to_le_bytes().to_vec()
    }
}

pub struct Md5Checksum;

impl ChecksumHook for Md5Checksum {
    fn algo_id(&self) -> u16 {
        CHECKSUM_MD5
    }

    fn output_size(&self) -> u16 {
        16
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        Md5::digest(data).to_vec()
    }
}

pub struct Sha1Checksum;

impl ChecksumHook for Sha1Checksum {
    fn algo_id(&self) -> u16 {
        CHECKSUM_SHA1
    }

    fn output_size(&self) -> u16 {
        20
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        Sha1::digest(data).to_vec()
    }
}

pub struct Sha256Checksum;

impl ChecksumHook for Sha256Checksum {
    fn algo_id(&self) -> u16 {
        CHECKSUM_SHA256
    }

    fn output_size(&self) -> u16 {
        32
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }
}

pub struct Blake3Checksum;

impl ChecksumHook for Blake3Checksum {
    fn algo_id(&self) -> u16 {
        CHECKSUM_BLAKE3
    }

    fn output_size(&self) -> u16 {
        32
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        blake3::hash(data).as_bytes().to_vec()
    }
}

/// Look up `(algo_id, output_size)` for a builtin algorithm name.
pub fn builtin_by_name(name: &str) -> Option<(u16, u16)> {
    match name.to_ascii_lowercase().as_str() {
        "none" => Some((CHECKSUM_NONE, 0)),
        "crc32" => Some((CHECKSUM_CRC32, 4)),
        "md5" => Some((CHECKSUM_MD5, 16)),
        "sha1" => Some((CHECKSUM_SHA1, 20)),
        "sha256" => Some((CHECKSUM_SHA256, 32)),
        "blake3" => Some((CHECKSUM_BLAKE3, 32)),
        _ => None,
    }
}
