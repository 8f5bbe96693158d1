//! Cross-mode conversion: rebuild a Manifest from an Archive.
//!
//! Payloads are discarded and compression ids zeroed; paths, raw sizes and
//! checksums carry over unchanged. The reverse direction cannot exist
//! because a Manifest stores no payload bytes.

use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::format::Mode;
use crate::reader::{ContainerReader, ReaderOptions};
use crate::writer::{ContainerWriter, WriterOptions};

/// Build a Manifest container covering the same entries as an Archive.
///
/// The archive's magic, checksum algorithm, index crypto and path hash
/// settings are carried over, so `opts.registry` must hold the same hooks
/// that built the archive. Entries are staged in the archive's entry order,
/// which keeps repeated conversions byte-identical.
pub fn manifest_from_archive(
    archive_path: &Path,
    manifest_path: &Path,
    opts: ReaderOptions,
) -> Result<()> {
    let reader = ContainerReader::open_archive(archive_path, opts.clone())?;
    let header = reader.header();

    let writer_opts = WriterOptions {
        magic: header.magic,
        mode: Mode::Manifest,
        registry: opts.registry,
        checksum_algo: header.checksum_algo_id,
        index_crypto: header.index_crypto_id,
        path_hasher: opts.path_hasher,
        case_insensitive: opts.case_insensitive,
    };
    let mut writer = ContainerWriter::new(manifest_path, writer_opts)?;

    let entries = reader.all_entries()?;
    debug!(entries = entries.len(), "converting archive to manifest");
    for e in &entries {
        writer.stage_metadata(&e.vfs_path, e.raw_size, e.checksum.clone())?;
    }
    writer.build()
}
