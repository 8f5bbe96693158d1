//! Batch driver support: progress reporting, error policies, directory
//! scanning and cooperative cancellation.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{Error, ErrorKind, Result};
use crate::paths::canonicalize;

/// What to do when a single file fails inside a batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Propagate the first failure immediately.
    #[default]
    Raise,
    /// Record the failure and keep going.
    Skip,
    /// Record the failure, stop the batch and return partial results.
    Abort,
}

/// One file queued for staging.
#[derive(Debug, Clone)]
pub struct FileItem {
    pub local_path: PathBuf,
    pub vfs_path: String,
    /// Compression algorithm for Archive staging; ignored by Manifest.
    pub algo_id: u16,
}

/// Snapshot handed to progress callbacks.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// 1-based index of the file just processed.
    pub current: u64,
    pub total: u64,
    /// Completion in `0.0..=1.0`.
    pub progress: f64,
    pub current_file: String,
    pub bytes_done: u64,
    /// Throughput in bytes/sec over a short moving window.
    pub rate: f64,
    /// Estimated seconds remaining, infinite while the rate is zero.
    pub eta: f64,
}

pub type ProgressCallback<'a> = dyn FnMut(&ProgressInfo) + 'a;

/// A single failed file inside a [`BatchResult`].
#[derive(Debug)]
pub struct FailedFile {
    pub path: String,
    pub error: Error,
}

impl FailedFile {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Outcome of a batch operation.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub success_count: u64,
    pub failed_count: u64,
    pub failed_files: Vec<FailedFile>,
    pub total_bytes: u64,
    pub elapsed_time: f64,
    /// Set when the batch stopped early (abort policy or cancellation).
    pub aborted: bool,
}

impl BatchResult {
    pub fn total_attempted(&self) -> u64 {
        self.success_count + self.failed_count
    }

    pub(crate) fn record_failure(&mut self, path: String, error: Error) {
        self.failed_count += 1;
        self.failed_files.push(FailedFile { path, error });
    }
}

/// Cooperative cancellation flag checked at file boundaries.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Minimum milliseconds between callback invocations.
const EMIT_INTERVAL_MS: u128 = 100;
/// Emit at least every this many files even when the interval has not passed.
const EMIT_EVERY_FILES: u64 = 100;
/// Moving-window span for the rate estimate.
const RATE_WINDOW_SECS: f64 = 3.0;

/// Coalesces progress updates and computes rate and ETA.
pub struct ProgressTracker<'a> {
    total_files: u64,
    total_bytes: u64,
    current: u64,
    bytes_done: u64,
    started: Instant,
    last_emit: Option<Instant>,
    last_emit_current: u64,
    window: VecDeque<(Instant, u64)>,
    callback: Option<&'a mut ProgressCallback<'a>>,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(
        total_files: u64,
        total_bytes: u64,
        callback: Option<&'a mut ProgressCallback<'a>>,
    ) -> Self {
        Self {
            total_files,
            total_bytes,
            current: 0,
            bytes_done: 0,
            started: Instant::now(),
            last_emit: None,
            last_emit_current: 0,
            window: VecDeque::new(),
            callback,
        }
    }

    /// Record one processed file and maybe emit a coalesced update.
    pub fn update(&mut self, file: &str, bytes: u64) {
        self.current += 1;
        self.bytes_done += bytes;
        let now = Instant::now();
        self.window.push_back((now, self.bytes_done));
        while let Some(&(t, _)) = self.window.front() {
            if now.duration_since(t).as_secs_f64() > RATE_WINDOW_SECS && self.window.len() > 1 {
                self.window.pop_front();
            } else {
                break;
            }
        }

        let due_time = self
            .last_emit
            .map(|t| now.duration_since(t).as_millis() >= EMIT_INTERVAL_MS)
            .unwrap_or(true);
        let due_count = self.current - self.last_emit_current >= EMIT_EVERY_FILES;
        let is_last = self.current == self.total_files;
        if due_time || due_count || is_last {
            self.emit(file, now);
        }
    }

    fn emit(&mut self, file: &str, now: Instant) {
        let rate = match (self.window.front(), self.window.back()) {
            (Some(&(t0, b0)), Some(&(t1, b1))) if t1 > t0 => {
                (b1 - b0) as f64 / t1.duration_since(t0).as_secs_f64()
            }
            _ => 0.0,
        };
        let remaining = self.total_bytes.saturating_sub(self.bytes_done);
        let eta = if rate > 0.0 { remaining as f64 / rate } else { f64::INFINITY };
        let info = ProgressInfo {
            current: self.current,
            total: self.total_files,
            progress: if self.total_files == 0 {
                0.0
            } else {
                self.current as f64 / self.total_files as f64
            },
            current_file: file.to_string(),
            bytes_done: self.bytes_done,
            rate,
            eta,
        };
        if let Some(cb) = self.callback.as_mut() {
            cb(&info);
        }
        self.last_emit = Some(now);
        self.last_emit_current = self.current;
    }

    pub fn finish(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Scan parameters for [`scan_dir`].
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub mount_point: String,
    /// Shell-style globs matched against paths relative to the walk root.
    pub exclude: Vec<String>,
    /// Relax glob matching for case-insensitive filesystems.
    pub case_insensitive_globs: bool,
    /// Compression id applied to every scanned file (Archive only).
    pub algo_id: u16,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            mount_point: "/".to_string(),
            exclude: Vec::new(),
            case_insensitive_globs: false,
            algo_id: 0,
        }
    }
}

fn build_exclude_set(patterns: &[String], case_insensitive: bool) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = GlobBuilder::new(pat)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| Error::Invalid(format!("bad exclude pattern {pat:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Invalid(format!("exclude set: {e}")))
}

/// Walk `local_dir` and produce the staging items for a batch add.
///
/// Entries come back in sorted walk order so repeated scans of an unchanged
/// tree are deterministic.
pub fn scan_dir(local_dir: &Path, opts: &ScanOptions) -> Result<Vec<FileItem>> {
    if !local_dir.is_dir() {
        return Err(Error::LocalIo {
            path: local_dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        });
    }
    let exclude = build_exclude_set(&opts.exclude, opts.case_insensitive_globs)?;
    let mount = canonicalize(&opts.mount_point, false);

    let mut items = Vec::new();
    for entry in WalkDir::new(local_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| local_dir.to_path_buf());
            Error::LocalIo { path, source: e.into() }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = pathdiff::diff_paths(entry.path(), local_dir)
            .unwrap_or_else(|| entry.path().to_path_buf());
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if !exclude.is_empty() && exclude.is_match(&rel_str) {
            continue;
        }
        let vfs_path = if mount == "/" {
            format!("/{rel_str}")
        } else {
            format!("{mount}/{rel_str}")
        };
        items.push(FileItem {
            local_path: entry.path().to_path_buf(),
            vfs_path,
            algo_id: opts.algo_id,
        });
    }
    Ok(items)
}

/// Sum of on-disk sizes, used to seed progress totals. Unreadable files
/// count as zero here and fail later during staging.
pub fn estimate_total_bytes(items: &[FileItem]) -> u64 {
    items
        .iter()
        .filter_map(|i| std::fs::metadata(&i.local_path).ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_emits_final_event() {
        let mut events: Vec<(u64, f64)> = Vec::new();
        {
            let mut cb = |info: &ProgressInfo| events.push((info.current, info.progress));
            let mut tracker = ProgressTracker::new(3, 300, Some(&mut cb));
            tracker.update("/a", 100);
            tracker.update("/b", 100);
            tracker.update("/c", 100);
        }
        let last = events.last().unwrap();
        assert_eq!(last.0, 3);
        assert!((last.1 - 1.0).abs() < f64::EPSILON);
        // current values never decrease
        assert!(events.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn cancel_token_flips_once() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        let t2 = t.clone();
        t2.cancel();
        assert!(t.is_cancelled());
    }
}
