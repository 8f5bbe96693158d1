//! Container writer: staging plus the two-pass build.
//!
//! Entries are staged entirely in memory; nothing touches the output path
//! until `build()`, which computes the full layout first and then writes the
//! file in one sweep. A failed build removes the partial output before
//! returning the error.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::batch::{
    estimate_total_bytes, scan_dir, BatchResult, CancelToken, ErrorPolicy, FileItem,
    ProgressInfo, ProgressTracker, ScanOptions,
};
use crate::codec::ByteWriter;
use crate::error::{Error, Result};
use crate::external::BatchDigestProvider;
use crate::format::{
    validate_magic, DataHeader, EntryRecord, FileHeader, IndexHeader, Mode, DATA_HEADER_LEN,
    DEFAULT_MAGIC, FILE_HEADER_LEN, FORMAT_VERSION, INDEX_HEADER_LEN,
};
use crate::hooks::{ChecksumHook, HookRegistry, IndexCryptoHook, PathHasher};
use crate::paths::{canonicalize, split, PathInterner};
use crate::pipeline::pack_blob;

/// Writer configuration.
#[derive(Clone)]
pub struct WriterOptions {
    pub magic: [u8; 4],
    pub mode: Mode,
    pub registry: HookRegistry,
    /// Active checksum algorithm, 0 for none. Must be registered.
    pub checksum_algo: u16,
    /// Active index crypto, 0 for none. Must be registered.
    pub index_crypto: u16,
    pub path_hasher: PathHasher,
    pub case_insensitive: bool,
}

impl WriterOptions {
    pub fn manifest() -> Self {
        Self::with_mode(Mode::Manifest)
    }

    pub fn archive() -> Self {
        Self::with_mode(Mode::Archive)
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            magic: DEFAULT_MAGIC,
            mode,
            registry: HookRegistry::builtin(),
            checksum_algo: 0,
            index_crypto: 0,
            path_hasher: PathHasher::default(),
            case_insensitive: false,
        }
    }
}

struct StagedEntry {
    path_hash: u64,
    canonical: String,
    dir_id: u32,
    name_id: u32,
    ext_id: u32,
    raw_size: u64,
    packed_size: u64,
    algo_id: u16,
    checksum: Vec<u8>,
    /// Index into the blob list, `usize::MAX` for metadata-only entries.
    blob: usize,
}

/// Builds Manifest and Archive containers.
pub struct ContainerWriter {
    output: PathBuf,
    opts: WriterOptions,
    checksum_hook: Option<Arc<dyn ChecksumHook>>,
    crypto_hook: Option<Arc<dyn IndexCryptoHook>>,
    checksum_size: u16,
    interner: PathInterner,
    entries: Vec<StagedEntry>,
    blobs: Vec<Vec<u8>>,
    by_hash: HashMap<u64, Vec<usize>>,
}

impl ContainerWriter {
    /// Create a writer. Fails when the configured checksum or crypto ids
    /// have no registered hook, or when the magic is malformed.
    pub fn new(output: impl Into<PathBuf>, opts: WriterOptions) -> Result<Self> {
        validate_magic(&opts.magic)?;
        let checksum_hook = if opts.checksum_algo != 0 {
            Some(Arc::clone(opts.registry.checksum(opts.checksum_algo)?))
        } else {
            None
        };
        let crypto_hook = if opts.index_crypto != 0 {
            Some(Arc::clone(opts.registry.index_crypto(opts.index_crypto)?))
        } else {
            None
        };
        let checksum_size = checksum_hook.as_ref().map(|h| h.output_size()).unwrap_or(0);
        Ok(Self {
            output: output.into(),
            opts,
            checksum_hook,
            crypto_hook,
            checksum_size,
            interner: PathInterner::new(),
            entries: Vec::new(),
            blobs: Vec::new(),
            by_hash: HashMap::new(),
        })
    }

    pub fn mode(&self) -> Mode {
        self.opts.mode
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn canonical(&self, vfs_path: &str) -> String {
        canonicalize(vfs_path, self.opts.case_insensitive)
    }

    /// Duplicate-path guard. Hash collisions between different paths are
    /// legal; re-adding the same canonical path is not.
    fn check_duplicate(&self, hash: u64, canonical: &str) -> Result<()> {
        if let Some(existing) = self.by_hash.get(&hash) {
            for &idx in existing {
                if self.entries[idx].canonical == canonical {
                    return Err(Error::DuplicatePath(canonical.to_string()));
                }
            }
        }
        Ok(())
    }

    fn push_entry(
        &mut self,
        canonical: String,
        raw_size: u64,
        packed_size: u64,
        algo_id: u16,
        checksum: Vec<u8>,
        blob: usize,
    ) {
        let hash = self.opts.path_hasher.hash(&canonical);
        let (dir, name, ext) = split(&canonical);
        let (dir_id, name_id, ext_id) = self.interner.intern(dir, name, ext);
        let idx = self.entries.len();
        self.entries.push(StagedEntry {
            path_hash: hash,
            canonical,
            dir_id,
            name_id,
            ext_id,
            raw_size,
            packed_size,
            algo_id,
            checksum,
            blob,
        });
        self.by_hash.entry(hash).or_default().push(idx);
    }

    /// Stage one local file under `vfs_path`.
    ///
    /// In Archive mode `algo_id` selects a registered compression hook
    /// (0 = stored); Manifest mode requires 0.
    pub fn add_file(&mut self, local: &Path, vfs_path: &str, algo_id: u16) -> Result<()> {
        if self.opts.mode == Mode::Manifest && algo_id != 0 {
            return Err(Error::Invalid(
                "compression applies to Archive containers only".into(),
            ));
        }
        if algo_id != 0 {
            // Resolve up front so a bad id fails before any I/O.
            self.opts.registry.compression(algo_id)?;
        }
        let canonical = self.canonical(vfs_path);
        let hash = self.opts.path_hasher.hash(&canonical);
        self.check_duplicate(hash, &canonical)?;

        let raw = fs::read(local)
            .map_err(|e| Error::LocalIo { path: local.to_path_buf(), source: e })?;

        match self.opts.mode {
            Mode::Manifest => {
                let raw_size = raw.len() as u64;
                let checksum = match &self.checksum_hook {
                    Some(h) => h.compute(&raw),
                    None => Vec::new(),
                };
                self.push_entry(canonical, raw_size, raw_size, 0, checksum, usize::MAX);
            }
            Mode::Archive => {
                let blob = pack_blob(
                    raw,
                    algo_id,
                    &self.opts.registry,
                    self.checksum_hook.as_ref(),
                )?;
                let blob_idx = self.blobs.len();
                let (raw_size, packed_size) = (blob.raw_size, blob.packed.len() as u64);
                self.blobs.push(blob.packed);
                self.push_entry(canonical, raw_size, packed_size, blob.algo_id, blob.checksum, blob_idx);
            }
        }
        Ok(())
    }

    /// Stage a file whose checksum was computed elsewhere. Manifest entries
    /// skip reading the file body entirely.
    fn add_file_precomputed(
        &mut self,
        local: &Path,
        vfs_path: &str,
        algo_id: u16,
        checksum: Vec<u8>,
    ) -> Result<()> {
        if checksum.len() != self.checksum_size as usize {
            return Err(Error::Invalid(format!(
                "precomputed checksum is {} bytes, the active algorithm produces {}",
                checksum.len(),
                self.checksum_size
            )));
        }
        let canonical = self.canonical(vfs_path);
        let hash = self.opts.path_hasher.hash(&canonical);
        self.check_duplicate(hash, &canonical)?;

        match self.opts.mode {
            Mode::Manifest => {
                let meta = fs::metadata(local)
                    .map_err(|e| Error::LocalIo { path: local.to_path_buf(), source: e })?;
                let raw_size = meta.len();
                self.push_entry(canonical, raw_size, raw_size, 0, checksum, usize::MAX);
            }
            Mode::Archive => {
                let raw = fs::read(local)
                    .map_err(|e| Error::LocalIo { path: local.to_path_buf(), source: e })?;
                let raw_size = raw.len() as u64;
                let packed = if algo_id != 0 {
                    self.opts.registry.compression(algo_id)?.compress(&raw)?
                } else {
                    raw
                };
                let blob_idx = self.blobs.len();
                let packed_size = packed.len() as u64;
                self.blobs.push(packed);
                self.push_entry(canonical, raw_size, packed_size, algo_id, checksum, blob_idx);
            }
        }
        Ok(())
    }

    /// Stage a metadata-only entry. Used by the archive-to-manifest
    /// converter, where sizes and checksums are already known.
    pub(crate) fn stage_metadata(
        &mut self,
        vfs_path: &str,
        raw_size: u64,
        checksum: Vec<u8>,
    ) -> Result<()> {
        debug_assert_eq!(self.opts.mode, Mode::Manifest);
        let canonical = self.canonical(vfs_path);
        let hash = self.opts.path_hasher.hash(&canonical);
        self.check_duplicate(hash, &canonical)?;
        self.push_entry(canonical, raw_size, raw_size, 0, checksum, usize::MAX);
        Ok(())
    }

    /// Recursively stage a directory under `mount_point`.
    pub fn add_dir(&mut self, local_dir: &Path, mount_point: &str, algo_id: u16) -> Result<usize> {
        let opts = ScanOptions {
            mount_point: mount_point.to_string(),
            algo_id,
            ..ScanOptions::default()
        };
        let items = scan_dir(local_dir, &opts)?;
        let count = items.len();
        for item in items {
            self.add_file(&item.local_path, &item.vfs_path, item.algo_id)?;
        }
        Ok(count)
    }

    /// Stage many files under an error policy with optional progress and
    /// cancellation.
    pub fn add_files_batch(
        &mut self,
        items: Vec<FileItem>,
        on_error: ErrorPolicy,
        progress: Option<&mut dyn FnMut(&ProgressInfo)>,
        cancel: Option<&CancelToken>,
    ) -> Result<BatchResult> {
        let total_bytes = estimate_total_bytes(&items);
        let mut tracker = ProgressTracker::new(items.len() as u64, total_bytes, progress);
        let mut result = BatchResult::default();

        for item in items {
            if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                result.aborted = true;
                break;
            }
            let size = fs::metadata(&item.local_path).map(|m| m.len()).unwrap_or(0);
            match self.add_file(&item.local_path, &item.vfs_path, item.algo_id) {
                Ok(()) => {
                    result.success_count += 1;
                    result.total_bytes += size;
                    tracker.update(&item.vfs_path, size);
                }
                Err(e) => match on_error {
                    ErrorPolicy::Raise => return Err(e),
                    ErrorPolicy::Skip => {
                        result.record_failure(item.vfs_path.clone(), e);
                        tracker.update(&item.vfs_path, 0);
                    }
                    ErrorPolicy::Abort => {
                        result.record_failure(item.vfs_path.clone(), e);
                        result.aborted = true;
                        break;
                    }
                },
            }
        }
        result.elapsed_time = tracker.finish();
        Ok(result)
    }

    /// Scan a directory and stage everything it contains.
    pub fn add_dir_batch(
        &mut self,
        local_dir: &Path,
        scan: &ScanOptions,
        on_error: ErrorPolicy,
        progress: Option<&mut dyn FnMut(&ProgressInfo)>,
        cancel: Option<&CancelToken>,
    ) -> Result<BatchResult> {
        let items = scan_dir(local_dir, scan)?;
        self.add_files_batch(items, on_error, progress, cancel)
    }

    /// Like [`add_dir_batch`], but checksums come from an external batch
    /// digest provider. Falls back to the per-file hook when the provider is
    /// unavailable or misses a file.
    ///
    /// The provider must compute the writer's active checksum algorithm.
    pub fn add_dir_batch_with_provider(
        &mut self,
        local_dir: &Path,
        scan: &ScanOptions,
        provider: &dyn BatchDigestProvider,
        on_error: ErrorPolicy,
        mut progress: Option<&mut dyn FnMut(&ProgressInfo)>,
        cancel: Option<&CancelToken>,
    ) -> Result<BatchResult> {
        if provider.algo_id() != self.opts.checksum_algo {
            return Err(Error::Invalid(format!(
                "provider computes algorithm {} but the writer is configured for {}",
                provider.algo_id(),
                self.opts.checksum_algo
            )));
        }
        if !provider.available() {
            warn!(provider = provider.name(), "digest provider unavailable, using per-file hashing");
            return self.add_files_batch(scan_dir(local_dir, scan)?, on_error, progress.take(), cancel);
        }

        let items = scan_dir(local_dir, scan)?;
        let paths: Vec<PathBuf> = items.iter().map(|i| i.local_path.clone()).collect();
        let digests = match provider.digest_files(&paths) {
            Ok(d) => d,
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "batch digest failed, using per-file hashing");
                return self.add_files_batch(items, on_error, progress.take(), cancel);
            }
        };
        debug!(provider = provider.name(), digests = digests.len(), files = items.len(), "provider digests collected");

        let total_bytes = estimate_total_bytes(&items);
        let mut tracker = ProgressTracker::new(items.len() as u64, total_bytes, progress.take());
        let mut result = BatchResult::default();

        for item in items {
            if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                result.aborted = true;
                break;
            }
            let size = fs::metadata(&item.local_path).map(|m| m.len()).unwrap_or(0);
            let outcome = match digests.get(&item.local_path) {
                Some(digest) => self.add_file_precomputed(
                    &item.local_path,
                    &item.vfs_path,
                    item.algo_id,
                    digest.clone(),
                ),
                None => self.add_file(&item.local_path, &item.vfs_path, item.algo_id),
            };
            match outcome {
                Ok(()) => {
                    result.success_count += 1;
                    result.total_bytes += size;
                    tracker.update(&item.vfs_path, size);
                }
                Err(e) => match on_error {
                    ErrorPolicy::Raise => return Err(e),
                    ErrorPolicy::Skip => {
                        result.record_failure(item.vfs_path.clone(), e);
                        tracker.update(&item.vfs_path, 0);
                    }
                    ErrorPolicy::Abort => {
                        result.record_failure(item.vfs_path.clone(), e);
                        result.aborted = true;
                        break;
                    }
                },
            }
        }
        result.elapsed_time = tracker.finish();
        Ok(result)
    }

    /// Finalise the container. Consumes the writer; on error the partial
    /// output file is removed.
    pub fn build(mut self) -> Result<()> {
        debug!(
            output = %self.output.display(),
            mode = ?self.opts.mode,
            entries = self.entries.len(),
            "building container"
        );
        // Stable sort keeps insertion order for equal hashes.
        self.entries.sort_by_key(|e| e.path_hash);

        let result = self.write_out();
        if result.is_err() {
            let _ = fs::remove_file(&self.output);
        }
        result
    }

    fn write_out(&mut self) -> Result<()> {
        let (string_blob, table_lens) = self.interner.encode()?;
        let string_blob = match &self.crypto_hook {
            Some(hook) => hook.encrypt(&string_blob)?,
            None => string_blob,
        };

        let record_size = EntryRecord::record_size(self.checksum_size);
        let index_length =
            (INDEX_HEADER_LEN + string_blob.len() + self.entries.len() * record_size) as u64;

        let total_raw: u64 = self.entries.iter().map(|e| e.raw_size).sum();
        let total_packed: u64 = self.entries.iter().map(|e| e.packed_size).sum();

        let (data_offset, data_length) = match self.opts.mode {
            Mode::Manifest => (0u64, 0u64),
            Mode::Archive => (
                FILE_HEADER_LEN as u64 + index_length,
                DATA_HEADER_LEN as u64 + total_packed,
            ),
        };

        // Payloads land in sorted-entry order; assign offsets relative to
        // the first payload byte.
        let mut cursor = 0u64;
        let mut data_offsets = Vec::with_capacity(self.entries.len());
        for e in &self.entries {
            if self.opts.mode == Mode::Archive {
                data_offsets.push(cursor);
                cursor += e.packed_size;
            } else {
                data_offsets.push(0);
            }
        }

        let header = FileHeader {
            magic: self.opts.magic,
            version: FORMAT_VERSION,
            mode: self.opts.mode,
            index_crypto_id: self.opts.index_crypto,
            checksum_algo_id: self.opts.checksum_algo,
            path_hash_algo_id: self.opts.path_hasher.id(),
            index_offset: FILE_HEADER_LEN as u64,
            index_length,
            data_offset,
            data_length,
        };

        let mut index = ByteWriter::with_capacity(index_length as usize);
        IndexHeader {
            entry_count: self.entries.len() as u32,
            checksum_size: self.checksum_size,
            dir_table_len: table_lens[0],
            name_table_len: table_lens[1],
            ext_table_len: table_lens[2],
            entry_record_size: record_size as u16,
        }
        .encode(&mut index);
        index.put_bytes(&string_blob);
        for (e, &off) in self.entries.iter().zip(&data_offsets) {
            EntryRecord {
                path_hash: e.path_hash,
                dir_id: e.dir_id,
                name_id: e.name_id,
                ext_id: e.ext_id,
                raw_size: e.raw_size,
                packed_size: e.packed_size,
                data_offset: off,
                algo_id: e.algo_id,
                flags: 0,
                checksum: e.checksum.clone(),
            }
            .encode(&mut index, self.checksum_size);
        }

        let file = File::create(&self.output)?;
        let mut out = BufWriter::new(file);
        out.write_all(&header.encode())?;
        out.write_all(index.as_slice())?;

        if self.opts.mode == Mode::Archive {
            let mut dh = ByteWriter::with_capacity(DATA_HEADER_LEN);
            DataHeader { total_raw, total_packed }.encode(&mut dh);
            out.write_all(dh.as_slice())?;
            for e in &self.entries {
                out.write_all(&self.blobs[e.blob])?;
            }
        }

        out.flush()?;
        // Durable once build() returns Ok.
        out.into_inner().map_err(|e| Error::Io(e.into_error()))?.sync_all()?;
        Ok(())
    }
}
