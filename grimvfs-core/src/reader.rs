//! Container reader: open, decode the index, random-access reads, verify
//! and extract.
//!
//! The index is always held in memory. Payload bytes come from a memory
//! map by default, or positional reads behind a mutex when mapping is
//! disabled or fails. Once open, a reader is safe to share across threads.

use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::batch::{BatchResult, CancelToken, ErrorPolicy, ProgressInfo, ProgressTracker};
use crate::codec::ByteReader;
use crate::error::{Error, Result};
use crate::format::{
    DataHeader, EntryRecord, FileHeader, IndexHeader, Mode, DATA_HEADER_LEN, DEFAULT_MAGIC,
    FILE_HEADER_LEN, INDEX_HEADER_LEN,
};
use crate::hooks::{ChecksumHook, HookRegistry, PathHasher};
use crate::paths::{canonicalize, extract_dest, PathTables};
use crate::pipeline::{hex, unpack_blob, verify_blob};

/// Reader configuration.
#[derive(Clone)]
pub struct ReaderOptions {
    pub magic: [u8; 4],
    pub registry: HookRegistry,
    pub path_hasher: PathHasher,
    pub case_insensitive: bool,
    pub use_mmap: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            magic: DEFAULT_MAGIC,
            registry: HookRegistry::builtin(),
            path_hasher: PathHasher::default(),
            case_insensitive: false,
            use_mmap: true,
        }
    }
}

/// Caller-owned copy of one entry's metadata.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub vfs_path: String,
    pub path_hash: u64,
    pub raw_size: u64,
    pub packed_size: u64,
    pub algo_id: u16,
    pub checksum: Vec<u8>,
}

/// Outcome of a parallel manifest tree verification.
#[derive(Debug, Default)]
pub struct TreeVerifyReport {
    pub checked: u64,
    pub matched: u64,
    pub mismatched: Vec<String>,
    pub missing: Vec<String>,
}

enum Backing {
    Mapped(Mmap),
    Seekable(Mutex<File>),
}

impl Backing {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self {
            Backing::Mapped(map) => {
                let start = offset as usize;
                let end = start
                    .checked_add(len)
                    .filter(|&e| e <= map.len())
                    .ok_or_else(|| {
                        Error::Invalid(format!(
                            "read of {len} bytes at {offset} runs past the file end"
                        ))
                    })?;
                Ok(map[start..end].to_vec())
            }
            Backing::Seekable(file) => {
                let mut guard = file.lock().map_err(|_| {
                    Error::Invalid("reader file mutex poisoned".into())
                })?;
                guard.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; len];
                guard.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

/// Random-access view over a built container.
pub struct ContainerReader {
    opts: ReaderOptions,
    header: FileHeader,
    index: IndexHeader,
    entries: Vec<EntryRecord>,
    tables: Option<PathTables>,
    checksum_hook: Option<Arc<dyn ChecksumHook>>,
    backing: Backing,
}

impl ContainerReader {
    /// Open a Manifest container.
    pub fn open_manifest(path: &Path, opts: ReaderOptions) -> Result<Self> {
        Self::open(path, Mode::Manifest, opts)
    }

    /// Open an Archive container.
    pub fn open_archive(path: &Path, opts: ReaderOptions) -> Result<Self> {
        Self::open(path, Mode::Archive, opts)
    }

    fn open(path: &Path, expected_mode: Mode, opts: ReaderOptions) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut header_buf = vec![0u8; FILE_HEADER_LEN];
        file.read_exact(&mut header_buf).map_err(|e| {
            Error::HeaderCorrupt(format!("short read on file header: {e}"))
        })?;
        let header = FileHeader::decode(&header_buf, opts.magic)?;
        if header.mode != expected_mode {
            return Err(Error::ModeMismatch { expected: expected_mode, found: header.mode });
        }

        // The index region always lives in memory.
        file.seek(SeekFrom::Start(header.index_offset))?;
        let mut index_buf = vec![0u8; header.index_length as usize];
        file.read_exact(&mut index_buf)
            .map_err(|e| Error::Invalid(format!("short read on index region: {e}")))?;

        let mut r = ByteReader::new(&index_buf);
        let index = IndexHeader::decode(&mut r)?;

        let record_size = index.entry_record_size as usize;
        let entry_table_len = index.entry_count as usize * record_size;
        let blob_len = (header.index_length as usize)
            .checked_sub(INDEX_HEADER_LEN + entry_table_len)
            .ok_or_else(|| {
                Error::Invalid("index region too small for its entry table".into())
            })?;
        let string_blob = r.take(blob_len)?;

        let mut entries = Vec::with_capacity(index.entry_count as usize);
        for _ in 0..index.entry_count {
            entries.push(EntryRecord::decode(&mut r, index.checksum_size)?);
        }
        if !entries.windows(2).all(|w| w[0].path_hash <= w[1].path_hash) {
            return Err(Error::Invalid("entry table is not sorted by path hash".into()));
        }

        let tables = Self::decode_tables(&header, &index, string_blob, &opts)?;

        let checksum_hook = if header.checksum_algo_id != 0 {
            match opts.registry.checksum(header.checksum_algo_id) {
                Ok(hook) => Some(Arc::clone(hook)),
                Err(_) => {
                    warn!(algo_id = header.checksum_algo_id, "no checksum hook registered, verification disabled");
                    None
                }
            }
        } else {
            None
        };

        let backing = if opts.use_mmap {
            // Fall back to plain reads if the platform refuses the mapping.
            match unsafe { Mmap::map(&file) } {
                Ok(map) => Backing::Mapped(map),
                Err(e) => {
                    warn!(error = %e, "memory map failed, falling back to seek reads");
                    Backing::Seekable(Mutex::new(file))
                }
            }
        } else {
            Backing::Seekable(Mutex::new(file))
        };

        let reader = Self { opts, header, index, entries, tables, checksum_hook, backing };
        reader.validate_regions()?;
        debug!(
            mode = ?reader.header.mode,
            entries = reader.entries.len(),
            decrypted = reader.is_decrypted(),
            "container opened"
        );
        Ok(reader)
    }

    fn decode_tables(
        header: &FileHeader,
        index: &IndexHeader,
        string_blob: &[u8],
        opts: &ReaderOptions,
    ) -> Result<Option<PathTables>> {
        let lens = [index.dir_table_len, index.name_table_len, index.ext_table_len];
        if header.index_crypto_id == 0 {
            return Ok(Some(PathTables::decode(string_blob, lens)?));
        }
        if !opts.registry.has_index_crypto(header.index_crypto_id) {
            // Hash lookups still work; anything needing path strings fails.
            return Ok(None);
        }
        let hook = opts.registry.index_crypto(header.index_crypto_id)?;
        let plain = hook
            .decrypt(string_blob)
            .map_err(|e| Error::IndexDecryptError(e.to_string()))?;
        // A wrong key usually decrypts without error and garbles the tables.
        PathTables::decode(&plain, lens)
            .map(Some)
            .map_err(|e| Error::IndexDecryptError(e.to_string()))
    }

    /// Structural checks over the decoded index.
    fn validate_regions(&self) -> Result<()> {
        match self.header.mode {
            Mode::Manifest => {
                for e in &self.entries {
                    if e.packed_size != e.raw_size || e.data_offset != 0 || e.algo_id != 0 {
                        return Err(Error::Invalid(
                            "manifest entry carries archive payload fields".into(),
                        ));
                    }
                }
            }
            Mode::Archive => {
                let payload_len = self
                    .header
                    .data_length
                    .checked_sub(DATA_HEADER_LEN as u64)
                    .ok_or_else(|| Error::Invalid("data region shorter than its header".into()))?;
                let mut prev_end = 0u64;
                for e in &self.entries {
                    let end = e
                        .data_offset
                        .checked_add(e.packed_size)
                        .filter(|&end| end <= payload_len)
                        .ok_or_else(|| {
                            Error::Invalid(format!(
                                "entry payload range {}..+{} exceeds the data region",
                                e.data_offset, e.packed_size
                            ))
                        })?;
                    if e.data_offset < prev_end {
                        return Err(Error::Invalid("entry payload ranges overlap".into()));
                    }
                    prev_end = end;
                }
            }
        }
        Ok(())
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn mode(&self) -> Mode {
        self.header.mode
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn checksum_size(&self) -> u16 {
        self.index.checksum_size
    }

    /// False when the index is encrypted and no matching hook was supplied.
    pub fn is_decrypted(&self) -> bool {
        self.tables.is_some()
    }

    fn canonical(&self, vfs_path: &str) -> String {
        canonicalize(vfs_path, self.opts.case_insensitive)
    }

    fn entry_path(&self, e: &EntryRecord) -> Result<String> {
        let tables = self.tables.as_ref().ok_or(Error::IndexNotDecrypted)?;
        tables.path(e.dir_id, e.name_id, e.ext_id)
    }

    /// All entries sharing one path hash, as a slice of the sorted table.
    fn hash_range(&self, hash: u64) -> &[EntryRecord] {
        let start = self.entries.partition_point(|e| e.path_hash < hash);
        let end = self.entries.partition_point(|e| e.path_hash <= hash);
        &self.entries[start..end]
    }

    /// Binary-search lookup with collision disambiguation.
    fn lookup(&self, canonical: &str) -> Result<&EntryRecord> {
        let hash = self.opts.path_hasher.hash(canonical);
        let candidates = self.hash_range(hash);
        match (candidates.len(), &self.tables) {
            (0, _) => Err(Error::NotFound(canonical.to_string())),
            (1, None) => Ok(&candidates[0]),
            (_, None) => Err(Error::IndexNotDecrypted),
            (_, Some(_)) => {
                for e in candidates {
                    if self.entry_path(e)? == canonical {
                        return Ok(e);
                    }
                }
                Err(Error::NotFound(canonical.to_string()))
            }
        }
    }

    pub fn exists(&self, vfs_path: &str) -> bool {
        self.lookup(&self.canonical(vfs_path)).is_ok()
    }

    /// Entry metadata for one path.
    pub fn get_entry(&self, vfs_path: &str) -> Result<EntryInfo> {
        let canonical = self.canonical(vfs_path);
        let e = self.lookup(&canonical)?;
        Ok(EntryInfo {
            vfs_path: canonical,
            path_hash: e.path_hash,
            raw_size: e.raw_size,
            packed_size: e.packed_size,
            algo_id: e.algo_id,
            checksum: e.checksum.clone(),
        })
    }

    fn read_entry(&self, e: &EntryRecord, path_label: &str, verify: bool) -> Result<Vec<u8>> {
        if self.header.mode != Mode::Archive {
            return Err(Error::Invalid("manifest containers carry no payloads".into()));
        }
        let abs = self.header.data_offset + DATA_HEADER_LEN as u64 + e.data_offset;
        let packed = self.backing.read_at(abs, e.packed_size as usize)?;
        let raw = unpack_blob(&packed, e.raw_size, e.algo_id, &self.opts.registry)?;
        if verify {
            match &self.checksum_hook {
                Some(hook) => verify_blob(&raw, &e.checksum, hook, path_label)?,
                None if self.header.checksum_algo_id != 0 => {
                    return Err(Error::UnknownAlgoId {
                        kind: "checksum",
                        algo_id: self.header.checksum_algo_id,
                    });
                }
                None => {}
            }
        }
        Ok(raw)
    }

    /// Read one payload, verifying when a checksum hook is present.
    pub fn read(&self, vfs_path: &str) -> Result<Vec<u8>> {
        self.read_with(vfs_path, self.checksum_hook.is_some())
    }

    /// Read one payload with explicit verification control.
    pub fn read_with(&self, vfs_path: &str, verify: bool) -> Result<Vec<u8>> {
        let canonical = self.canonical(vfs_path);
        let e = self.lookup(&canonical)?;
        self.read_entry(e, &canonical, verify)
    }

    /// Read a payload by its path hash. Works on encrypted indexes; fails
    /// on ambiguous collisions.
    pub fn read_by_hash(&self, path_hash: u64, verify: bool) -> Result<Vec<u8>> {
        let candidates = self.hash_range(path_hash);
        match candidates.len() {
            0 => Err(Error::NotFound(format!("hash {path_hash:#018x}"))),
            1 => self.read_entry(&candidates[0], &format!("hash {path_hash:#018x}"), verify),
            _ => Err(Error::Invalid(format!(
                "path hash {path_hash:#018x} is ambiguous ({} entries)",
                candidates.len()
            ))),
        }
    }

    /// Sized in-memory reader over the decompressed payload.
    pub fn open_file(&self, vfs_path: &str) -> Result<Cursor<Vec<u8>>> {
        Ok(Cursor::new(self.read(vfs_path)?))
    }

    /// Every vfs path, in entry-table order. Needs a decrypted index.
    pub fn list_all(&self) -> Result<Vec<String>> {
        self.entries.iter().map(|e| self.entry_path(e)).collect()
    }

    /// Every path hash, in entry-table order. Never needs decryption.
    pub fn list_hashes(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.path_hash).collect()
    }

    /// Compare a local file against a manifest entry.
    ///
    /// Missing vfs path is an error; a missing or unreadable local file is
    /// reported as [`Error::LocalIo`]. Without a checksum hook only sizes
    /// are compared.
    pub fn verify_file(&self, vfs_path: &str, local: &Path) -> Result<bool> {
        let canonical = self.canonical(vfs_path);
        let e = self.lookup(&canonical)?;
        let data = fs::read(local)
            .map_err(|err| Error::LocalIo { path: local.to_path_buf(), source: err })?;
        if data.len() as u64 != e.raw_size {
            return Ok(false);
        }
        match &self.checksum_hook {
            Some(hook) if !e.checksum.is_empty() => Ok(hook.verify(&data, &e.checksum)),
            _ => Ok(true),
        }
    }

    /// Verify a whole local tree against a manifest, in parallel.
    ///
    /// Each entry's vfs path is resolved beneath `root`.
    pub fn verify_tree(&self, root: &Path) -> Result<TreeVerifyReport> {
        enum Outcome {
            Ok,
            Mismatch(String),
            Missing(String),
        }

        let paths = self.list_all()?;
        let outcomes: Vec<Outcome> = paths
            .par_iter()
            .map(|vfs| {
                let local = root.join(vfs.trim_start_matches('/'));
                match self.verify_file(vfs, &local) {
                    Ok(true) => Outcome::Ok,
                    Ok(false) => Outcome::Mismatch(vfs.clone()),
                    Err(_) => Outcome::Missing(vfs.clone()),
                }
            })
            .collect();

        let mut report = TreeVerifyReport { checked: paths.len() as u64, ..Default::default() };
        for o in outcomes {
            match o {
                Outcome::Ok => report.matched += 1,
                Outcome::Mismatch(p) => report.mismatched.push(p),
                Outcome::Missing(p) => report.missing.push(p),
            }
        }
        Ok(report)
    }

    /// Unpack every entry into `output_dir`, recreating the vfs directory
    /// structure. Entries are processed in path-hash order.
    pub fn extract_all(
        &self,
        output_dir: &Path,
        verify: bool,
        on_error: ErrorPolicy,
        progress: Option<&mut dyn FnMut(&ProgressInfo)>,
        cancel: Option<&CancelToken>,
    ) -> Result<BatchResult> {
        if self.header.mode != Mode::Archive {
            return Err(Error::Invalid("extract applies to Archive containers only".into()));
        }
        if self.tables.is_none() {
            return Err(Error::IndexNotDecrypted);
        }

        let total_bytes: u64 = self.entries.iter().map(|e| e.raw_size).sum();
        let mut tracker =
            ProgressTracker::new(self.entries.len() as u64, total_bytes, progress);
        let mut result = BatchResult::default();

        for e in &self.entries {
            if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                result.aborted = true;
                break;
            }
            let vfs = self.entry_path(e)?;
            let outcome = (|| -> Result<u64> {
                let dest = extract_dest(output_dir, &vfs)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|err| Error::LocalIo {
                        path: parent.to_path_buf(),
                        source: err,
                    })?;
                }
                let raw = self.read_entry(e, &vfs, verify)?;
                let len = raw.len() as u64;
                fs::write(&dest, raw)
                    .map_err(|err| Error::LocalIo { path: dest.clone(), source: err })?;
                Ok(len)
            })();
            match outcome {
                Ok(len) => {
                    result.success_count += 1;
                    result.total_bytes += len;
                    tracker.update(&vfs, len);
                }
                Err(err) => match on_error {
                    ErrorPolicy::Raise => return Err(err),
                    ErrorPolicy::Skip => {
                        result.record_failure(vfs.clone(), err);
                        tracker.update(&vfs, 0);
                    }
                    ErrorPolicy::Abort => {
                        result.record_failure(vfs, err);
                        result.aborted = true;
                        break;
                    }
                },
            }
        }
        result.elapsed_time = tracker.finish();
        Ok(result)
    }

    /// Entry metadata for every path, for listing and conversion.
    pub fn all_entries(&self) -> Result<Vec<EntryInfo>> {
        self.entries
            .iter()
            .map(|e| {
                Ok(EntryInfo {
                    vfs_path: self.entry_path(e)?,
                    path_hash: e.path_hash,
                    raw_size: e.raw_size,
                    packed_size: e.packed_size,
                    algo_id: e.algo_id,
                    checksum: e.checksum.clone(),
                })
            })
            .collect()
    }

    /// Hex rendering of a stored checksum, for display layers.
    pub fn checksum_hex(info: &EntryInfo) -> String {
        hex(&info.checksum)
    }

    /// Validate the archive data header against the file header totals.
    pub fn data_header(&self) -> Result<DataHeader> {
        if self.header.mode != Mode::Archive {
            return Err(Error::Invalid("manifest containers have no data region".into()));
        }
        let buf = self.backing.read_at(self.header.data_offset, DATA_HEADER_LEN)?;
        let mut r = ByteReader::new(&buf);
        let dh = DataHeader::decode(&mut r)?;
        if DATA_HEADER_LEN as u64 + dh.total_packed != self.header.data_length {
            return Err(Error::Invalid(
                "data header totals disagree with the file header".into(),
            ));
        }
        Ok(dh)
    }
}
