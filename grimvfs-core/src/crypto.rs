//! Builtin index string-table transforms.
//!
//! None of these are real encryption. XOR keeps casual eyes off the path
//! dictionary, the zlib variant shrinks it, and the combined hook does both.
//! Anything stronger belongs in a caller-supplied [`IndexCryptoHook`].

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::hooks::IndexCryptoHook;

pub const CRYPTO_NONE: u16 = 0;
pub const CRYPTO_XOR: u16 = 1;
pub const CRYPTO_ZLIB: u16 = 2;
pub const CRYPTO_ZLIB_XOR: u16 = 3;

const DEFAULT_KEY: &[u8] = b"GrimoireVFS";

/// Keyed XOR obfuscation; encrypt and decrypt are the same operation.
pub struct XorObfuscate {
    key: Vec<u8>,
}

impl XorObfuscate {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        Self { key: if key.is_empty() { DEFAULT_KEY.to_vec() } else { key } }
    }

    fn xor(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ self.key[i % self.key.len()])
            .collect()
    }
}

impl Default for XorObfuscate {
    fn default() -> Self {
        Self::new(DEFAULT_KEY)
    }
}

impl IndexCryptoHook for XorObfuscate {
    fn crypto_id(&self) -> u16 {
        CRYPTO_XOR
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.xor(data))
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.xor(data))
    }
}

/// zlib over the string tables; a compressor in crypto clothing.
pub struct ZlibPack {
    level: u32,
}

impl ZlibPack {
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }
}

impl Default for ZlibPack {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl IndexCryptoHook for ZlibPack {
    fn crypto_id(&self) -> u16 {
        CRYPTO_ZLIB
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        enc.write_all(data)?;
        Ok(enc.finish()?)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| Error::IndexDecryptError(format!("zlib: {e}")))?;
        Ok(out)
    }
}

/// Compress first, then XOR the compressed bytes.
pub struct ZlibXor {
    zlib: ZlibPack,
    xor: XorObfuscate,
}

impl ZlibXor {
    pub fn new(key: impl Into<Vec<u8>>, level: u32) -> Self {
        Self { zlib: ZlibPack::new(level), xor: XorObfuscate::new(key) }
    }
}

impl Default for ZlibXor {
    fn default() -> Self {
        Self { zlib: ZlibPack::default(), xor: XorObfuscate::default() }
    }
}

impl IndexCryptoHook for ZlibXor {
    fn crypto_id(&self) -> u16 {
        CRYPTO_ZLIB_XOR
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.xor.xor(&self.zlib.encrypt(data)?))
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.zlib.decrypt(&self.xor.xor(data))
    }
}
