use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::Path;

use grimvfs_core::checksum::{Sha256Checksum, CHECKSUM_SHA256};
use grimvfs_core::codec::{crc32, ByteReader};
use grimvfs_core::compress::COMPRESSION_ZLIB;
use grimvfs_core::format::{
    EntryRecord, FileHeader, IndexHeader, Mode, DATA_HEADER_LEN, DEFAULT_MAGIC, FILE_HEADER_LEN,
    INDEX_HEADER_LEN,
};
use grimvfs_core::hooks::ChecksumHook;
use grimvfs_core::{ContainerReader, ContainerWriter, Error, ReaderOptions, WriterOptions};

fn build_archive(dir: &Path, out: &Path, files: &[(&str, Vec<u8>, u16)]) {
    let opts = WriterOptions { checksum_algo: CHECKSUM_SHA256, ..WriterOptions::archive() };
    let mut w = ContainerWriter::new(out, opts).unwrap();
    for (i, (vfs, data, algo)) in files.iter().enumerate() {
        let local = dir.join(format!("src{i}.bin"));
        std::fs::write(&local, data).unwrap();
        w.add_file(&local, vfs, *algo).unwrap();
    }
    w.build().unwrap();
}

/// Decode the raw entry table straight off the file bytes.
fn parse_entries(raw: &[u8]) -> (FileHeader, IndexHeader, Vec<EntryRecord>) {
    let header = FileHeader::decode(raw, DEFAULT_MAGIC).unwrap();
    let index_buf =
        &raw[header.index_offset as usize..(header.index_offset + header.index_length) as usize];
    let mut r = ByteReader::new(index_buf);
    let index = IndexHeader::decode(&mut r).unwrap();
    let entry_table_len = index.entry_count as usize * index.entry_record_size as usize;
    let blob_len = index_buf.len() - INDEX_HEADER_LEN - entry_table_len;
    r.take(blob_len).unwrap();
    let mut entries = Vec::new();
    for _ in 0..index.entry_count {
        entries.push(EntryRecord::decode(&mut r, index.checksum_size).unwrap());
    }
    (header, index, entries)
}

#[test]
fn entries_sorted_and_payload_ranges_disjoint() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("a.grim");
    let mut rng = StdRng::seed_from_u64(11);
    let files: Vec<(String, Vec<u8>, u16)> = (0..32)
        .map(|i| {
            let len = rng.gen_range(1..4096);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let algo = if i % 2 == 0 { COMPRESSION_ZLIB } else { 0 };
            (format!("/assets/file_{i:02}.dat"), data, algo)
        })
        .collect();
    let file_refs: Vec<(&str, Vec<u8>, u16)> =
        files.iter().map(|(p, d, a)| (p.as_str(), d.clone(), *a)).collect();
    build_archive(td.path(), &out, &file_refs);

    let raw = std::fs::read(&out).unwrap();
    let (header, index, entries) = parse_entries(&raw);

    assert_eq!(header.mode, Mode::Archive);
    assert_eq!(index.entry_count, 32);
    assert_eq!(index.checksum_size, 32);

    // Sorted ascending by path hash.
    assert!(entries.windows(2).all(|w| w[0].path_hash <= w[1].path_hash));

    // Payload ranges are disjoint, in order, and inside the data region.
    let payload_len = header.data_length - DATA_HEADER_LEN as u64;
    let mut cursor = 0u64;
    for e in &entries {
        assert_eq!(e.data_offset, cursor, "payloads are laid out back to back");
        cursor += e.packed_size;
    }
    assert_eq!(cursor, payload_len);
}

#[test]
fn checksums_cover_raw_bytes_even_when_compressed() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("c.grim");
    let data = b"compressible compressible compressible".repeat(64);
    build_archive(td.path(), &out, &[("/doc.txt", data.clone(), COMPRESSION_ZLIB)]);

    let r = ContainerReader::open_archive(&out, ReaderOptions::default()).unwrap();
    let e = r.get_entry("/doc.txt").unwrap();
    assert!(e.packed_size < e.raw_size);
    assert_eq!(e.checksum, Sha256Checksum.compute(&data));
}

#[test]
fn manifest_entries_have_no_payload_fields() {
    let td = tempfile::tempdir().unwrap();
    let local = td.path().join("x.bin");
    std::fs::write(&local, b"manifest me").unwrap();
    let out = td.path().join("m.grim");
    let opts = WriterOptions { checksum_algo: CHECKSUM_SHA256, ..WriterOptions::manifest() };
    let mut w = ContainerWriter::new(&out, opts).unwrap();
    w.add_file(&local, "/x.bin", 0).unwrap();
    w.build().unwrap();

    let raw = std::fs::read(&out).unwrap();
    let (header, _, entries) = parse_entries(&raw);
    assert_eq!(header.mode, Mode::Manifest);
    assert_eq!(header.data_offset, 0);
    assert_eq!(header.data_length, 0);
    assert_eq!(raw.len() as u64, FILE_HEADER_LEN as u64 + header.index_length);
    for e in &entries {
        assert_eq!(e.packed_size, e.raw_size);
        assert_eq!(e.data_offset, 0);
        assert_eq!(e.algo_id, 0);
    }
}

#[test]
fn corrupted_payload_fails_checksum() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("d.grim");
    let data = b"some payload that will get one byte flipped".to_vec();
    // Stored, not compressed, so the tampered read still decodes.
    build_archive(td.path(), &out, &[("/victim.bin", data.clone(), 0)]);

    // Flip the last payload byte.
    let mut raw = std::fs::read(&out).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0xFF;
    std::fs::write(&out, &raw).unwrap();

    let r = ContainerReader::open_archive(&out, ReaderOptions::default()).unwrap();
    assert!(matches!(
        r.read_with("/victim.bin", true),
        Err(Error::ChecksumMismatch { .. })
    ));
    // Unverified reads return whatever is on disk.
    let tampered = r.read_with("/victim.bin", false).unwrap();
    assert_ne!(tampered, data);
    assert_eq!(tampered.len(), data.len());
}

#[test]
fn structural_failures_on_open() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("s.grim");
    build_archive(td.path(), &out, &[("/a.bin", vec![1, 2, 3], 0)]);
    let good = std::fs::read(&out).unwrap();

    // Bad magic.
    let mut bad = good.clone();
    bad[0] = b'X';
    std::fs::write(&out, &bad).unwrap();
    assert!(matches!(
        ContainerReader::open_archive(&out, ReaderOptions::default()),
        Err(Error::BadMagic { .. })
    ));

    // Corrupt header byte breaks the CRC.
    let mut bad = good.clone();
    bad[20] ^= 0xFF;
    std::fs::write(&out, &bad).unwrap();
    assert!(matches!(
        ContainerReader::open_archive(&out, ReaderOptions::default()),
        Err(Error::HeaderCorrupt(_))
    ));

    // Future version with a recomputed, valid CRC.
    let mut bad = good.clone();
    bad[4] = 99;
    bad[5] = 0;
    let crc = crc32(&bad[..48]).to_le_bytes();
    bad[48..52].copy_from_slice(&crc);
    std::fs::write(&out, &bad).unwrap();
    assert!(matches!(
        ContainerReader::open_archive(&out, ReaderOptions::default()),
        Err(Error::UnsupportedVersion(99))
    ));

    // Cross-mode open.
    std::fs::write(&out, &good).unwrap();
    assert!(matches!(
        ContainerReader::open_manifest(&out, ReaderOptions::default()),
        Err(Error::ModeMismatch { .. })
    ));
}

#[test]
fn custom_magic_is_enforced() {
    let td = tempfile::tempdir().unwrap();
    let local = td.path().join("a.txt");
    std::fs::write(&local, b"branded").unwrap();
    let out = td.path().join("branded.grim");

    let opts = WriterOptions { magic: *b"WAD5", ..WriterOptions::manifest() };
    let mut w = ContainerWriter::new(&out, opts).unwrap();
    w.add_file(&local, "/a.txt", 0).unwrap();
    w.build().unwrap();

    // Default magic readers refuse the file.
    assert!(matches!(
        ContainerReader::open_manifest(&out, ReaderOptions::default()),
        Err(Error::BadMagic { .. })
    ));
    let ropts = ReaderOptions { magic: *b"WAD5", ..ReaderOptions::default() };
    assert!(ContainerReader::open_manifest(&out, ropts).is_ok());
}

#[test]
fn failed_build_removes_partial_output() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("never.grim");

    struct FailingCrypto;
    impl grimvfs_core::IndexCryptoHook for FailingCrypto {
        fn crypto_id(&self) -> u16 {
            9
        }
        fn encrypt(&self, _data: &[u8]) -> grimvfs_core::Result<Vec<u8>> {
            Err(Error::Invalid("deliberate encrypt failure".into()))
        }
        fn decrypt(&self, data: &[u8]) -> grimvfs_core::Result<Vec<u8>> {
            Ok(data.to_vec())
        }
    }

    let mut registry = grimvfs_core::HookRegistry::builtin();
    registry.register_index_crypto(std::sync::Arc::new(FailingCrypto)).unwrap();
    let opts = WriterOptions { registry, index_crypto: 9, ..WriterOptions::manifest() };

    let local = td.path().join("f.txt");
    std::fs::write(&local, b"data").unwrap();
    let mut w = ContainerWriter::new(&out, opts).unwrap();
    w.add_file(&local, "/f.txt", 0).unwrap();
    assert!(w.build().is_err());
    assert!(!out.exists(), "partial output must be deleted");
}
