//! Capability hooks and the id registry.
//!
//! Algorithms are never hard-wired into the engine: checksums, compression
//! and index crypto are all supplied as trait objects and selected by the
//! ids recorded in the container.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Content checksum algorithm. Checksums are always computed over the
/// uncompressed bytes.
pub trait ChecksumHook: Send + Sync {
    /// Stable algorithm id; 0 is reserved for "none".
    fn algo_id(&self) -> u16;
    /// Fixed digest size in bytes.
    fn output_size(&self) -> u16;
    fn compute(&self, data: &[u8]) -> Vec<u8>;

    /// Checksum a file from disk. Implementations with an incremental
    /// digest state can override this to stream instead of slurping.
    fn compute_file(&self, path: &Path) -> Result<Vec<u8>> {
        let mut file = File::open(path)
            .map_err(|e| Error::LocalIo { path: path.to_path_buf(), source: e })?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| Error::LocalIo { path: path.to_path_buf(), source: e })?;
        Ok(self.compute(&buf))
    }

    fn verify(&self, data: &[u8], expected: &[u8]) -> bool {
        self.compute(data) == expected
    }
}

/// Payload compression algorithm; id 0 is reserved for "stored".
pub trait CompressionHook: Send + Sync {
    fn algo_id(&self) -> u16;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    /// Must produce exactly `raw_size` bytes or fail.
    fn decompress(&self, data: &[u8], raw_size: u64) -> Result<Vec<u8>>;
}

/// Whole-blob transform applied to the index string tables.
///
/// `decrypt(encrypt(x)) == x` is required; the ciphertext length is free to
/// differ from the plaintext length.
pub trait IndexCryptoHook: Send + Sync {
    /// Non-zero id recorded in the file header while active.
    fn crypto_id(&self) -> u16;
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Path hash function plus the id under which it is recorded.
///
/// The function must be pure and deterministic across processes; both sides
/// of a container exchange have to agree on it.
#[derive(Clone)]
pub struct PathHasher {
    id: u16,
    func: Arc<dyn Fn(&str) -> u64 + Send + Sync>,
}

impl PathHasher {
    pub fn new(id: u16, func: impl Fn(&str) -> u64 + Send + Sync + 'static) -> Self {
        Self { id, func: Arc::new(func) }
    }

    /// xxHash64 (seed 0) over the canonical UTF-8 path, recorded as id 0.
    pub fn default_xxh64() -> Self {
        Self::new(0, |path| xxhash_rust::xxh64::xxh64(path.as_bytes(), 0))
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn hash(&self, canonical_path: &str) -> u64 {
        (self.func)(canonical_path)
    }
}

impl Default for PathHasher {
    fn default() -> Self {
        Self::default_xxh64()
    }
}

impl std::fmt::Debug for PathHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathHasher").field("id", &self.id).finish()
    }
}

/// Hook lookup tables keyed by algorithm id.
///
/// Registration rejects id collisions; lookups of unregistered ids fail at
/// the call site with [`Error::UnknownAlgoId`].
#[derive(Default, Clone)]
pub struct HookRegistry {
    checksums: BTreeMap<u16, Arc<dyn ChecksumHook>>,
    compressors: BTreeMap<u16, Arc<dyn CompressionHook>>,
    cryptos: BTreeMap<u16, Arc<dyn IndexCryptoHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_checksum(&mut self, hook: Arc<dyn ChecksumHook>) -> Result<()> {
        let id = hook.algo_id();
        if id == 0 {
            return Err(Error::Invalid("checksum id 0 is reserved for none".into()));
        }
        if self.checksums.insert(id, hook).is_some() {
            return Err(Error::Invalid(format!("duplicate checksum algorithm id {id}")));
        }
        Ok(())
    }

    pub fn register_compression(&mut self, hook: Arc<dyn CompressionHook>) -> Result<()> {
        let id = hook.algo_id();
        if id == 0 {
            return Err(Error::Invalid("compression id 0 is reserved for stored".into()));
        }
        if self.compressors.insert(id, hook).is_some() {
            return Err(Error::Invalid(format!("duplicate compression algorithm id {id}")));
        }
        Ok(())
    }

    pub fn register_index_crypto(&mut self, hook: Arc<dyn IndexCryptoHook>) -> Result<()> {
        let id = hook.crypto_id();
        if id == 0 {
            return Err(Error::Invalid("index crypto id 0 is reserved for none".into()));
        }
        if self.cryptos.insert(id, hook).is_some() {
            return Err(Error::Invalid(format!("duplicate index crypto id {id}")));
        }
        Ok(())
    }

    pub fn checksum(&self, algo_id: u16) -> Result<&Arc<dyn ChecksumHook>> {
        self.checksums
            .get(&algo_id)
            .ok_or(Error::UnknownAlgoId { kind: "checksum", algo_id })
    }

    pub fn compression(&self, algo_id: u16) -> Result<&Arc<dyn CompressionHook>> {
        self.compressors
            .get(&algo_id)
            .ok_or(Error::UnknownAlgoId { kind: "compression", algo_id })
    }

    pub fn index_crypto(&self, crypto_id: u16) -> Result<&Arc<dyn IndexCryptoHook>> {
        self.cryptos
            .get(&crypto_id)
            .ok_or(Error::UnknownAlgoId { kind: "index crypto", algo_id: crypto_id })
    }

    pub fn has_index_crypto(&self, crypto_id: u16) -> bool {
        self.cryptos.contains_key(&crypto_id)
    }

    /// Registry preloaded with every builtin hook.
    pub fn builtin() -> Self {
        use crate::checksum::{Blake3Checksum, Crc32Checksum, Md5Checksum, Sha1Checksum, Sha256Checksum};
        use crate::compress::{ZlibCompression, ZstdCompression};
        use crate::crypto::{XorObfuscate, ZlibPack, ZlibXor};

        let mut reg = Self::new();
        // Ids are unique by construction, so these cannot fail.
        let _ = reg.register_checksum(Arc::new(Crc32Checksum));
        let _ = reg.register_checksum(Arc::new(Md5Checksum));
        let _ = reg.register_checksum(Arc::new(Sha1Checksum));
        let _ = reg.register_checksum(Arc::new(Sha256Checksum));
        let _ = reg.register_checksum(Arc::new(Blake3Checksum));
        let _ = reg.register_compression(Arc::new(ZlibCompression::default()));
        let _ = reg.register_compression(Arc::new(ZstdCompression::default()));
        let _ = reg.register_index_crypto(Arc::new(XorObfuscate::default()));
        let _ = reg.register_index_crypto(Arc::new(ZlibPack::default()));
        let _ = reg.register_index_crypto(Arc::new(ZlibXor::default()));
        reg
    }
}
