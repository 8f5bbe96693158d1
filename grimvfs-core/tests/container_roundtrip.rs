use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::Path;

use grimvfs_core::batch::{ErrorPolicy, ProgressInfo};
use grimvfs_core::checksum::{CHECKSUM_MD5, CHECKSUM_SHA256};
use grimvfs_core::compress::COMPRESSION_ZLIB;
use grimvfs_core::{ContainerReader, ContainerWriter, ReaderOptions, WriterOptions};

fn write_file(path: &Path, data: &[u8]) {
    std::fs::write(path, data).unwrap();
}

/// A payload that is large but well compressible: a random 4 KiB block
/// repeated out to 1 MiB.
fn compressible_mib(seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let block: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
    block.repeat(256)
}

#[test]
fn manifest_verifies_local_files() {
    let td = tempfile::tempdir().unwrap();
    let a = td.path().join("a.txt");
    let b = td.path().join("b.txt");
    write_file(&a, b"hello");
    write_file(&b, b"world");

    let out = td.path().join("files.grim");
    let opts = WriterOptions { checksum_algo: CHECKSUM_MD5, ..WriterOptions::manifest() };
    let mut w = ContainerWriter::new(&out, opts).unwrap();
    w.add_file(&a, "/a.txt", 0).unwrap();
    w.add_file(&b, "/b.txt", 0).unwrap();
    w.build().unwrap();

    let r = ContainerReader::open_manifest(&out, ReaderOptions::default()).unwrap();
    assert_eq!(r.entry_count(), 2);
    assert!(r.exists("/a.txt"));
    assert!(!r.exists("/missing.txt"));
    assert!(r.verify_file("/a.txt", &a).unwrap());
    assert!(r.verify_file("/b.txt", &b).unwrap());

    // Same length, different content: checksum must catch it.
    write_file(&a, b"Hello");
    assert!(!r.verify_file("/a.txt", &a).unwrap());
}

#[test]
fn archive_roundtrip_with_compression() {
    let td = tempfile::tempdir().unwrap();
    let big = td.path().join("big.bin");
    let payload = compressible_mib(7);
    write_file(&big, &payload);

    let out = td.path().join("data.grim");
    let opts = WriterOptions { checksum_algo: CHECKSUM_SHA256, ..WriterOptions::archive() };
    let mut w = ContainerWriter::new(&out, opts).unwrap();
    w.add_file(&big, "/big.bin", COMPRESSION_ZLIB).unwrap();
    w.build().unwrap();

    let r = ContainerReader::open_archive(&out, ReaderOptions::default()).unwrap();
    let entry = r.get_entry("/big.bin").unwrap();
    assert_eq!(entry.raw_size, payload.len() as u64);
    assert!(entry.packed_size < entry.raw_size);
    assert_eq!(entry.algo_id, COMPRESSION_ZLIB);

    // Verification is on by default because a checksum hook is present.
    assert_eq!(r.read("/big.bin").unwrap(), payload);
    assert_eq!(r.read_with("/big.bin", true).unwrap(), payload);

    // The sized in-memory reader sees the decompressed bytes.
    let cursor = r.open_file("/big.bin").unwrap();
    assert_eq!(cursor.get_ref().len(), payload.len());
}

#[test]
fn archive_roundtrip_without_mmap() {
    let td = tempfile::tempdir().unwrap();
    let f = td.path().join("f.bin");
    write_file(&f, b"positional reads work too");

    let out = td.path().join("data.grim");
    let opts = WriterOptions { checksum_algo: CHECKSUM_SHA256, ..WriterOptions::archive() };
    let mut w = ContainerWriter::new(&out, opts).unwrap();
    w.add_file(&f, "/f.bin", 0).unwrap();
    w.build().unwrap();

    let ropts = ReaderOptions { use_mmap: false, ..ReaderOptions::default() };
    let r = ContainerReader::open_archive(&out, ropts).unwrap();
    assert_eq!(r.read("/f.bin").unwrap(), b"positional reads work too");
}

#[test]
fn builds_are_deterministic() {
    let td = tempfile::tempdir().unwrap();
    let data = td.path().join("data");
    std::fs::create_dir(&data).unwrap();
    write_file(&data.join("one.bin"), &compressible_mib(1)[..32 * 1024]);
    write_file(&data.join("two.bin"), &compressible_mib(2)[..48 * 1024]);
    std::fs::create_dir(data.join("sub")).unwrap();
    write_file(&data.join("sub/three.txt"), b"tres");

    let out1 = td.path().join("one.grim");
    let out2 = td.path().join("two.grim");
    for out in [&out1, &out2] {
        let opts = WriterOptions { checksum_algo: CHECKSUM_SHA256, ..WriterOptions::archive() };
        let mut w = ContainerWriter::new(out, opts).unwrap();
        w.add_dir(&data, "/", COMPRESSION_ZLIB).unwrap();
        w.build().unwrap();
    }
    assert_eq!(std::fs::read(&out1).unwrap(), std::fs::read(&out2).unwrap());
}

#[test]
fn extract_all_restores_tree_and_reports_progress() {
    let td = tempfile::tempdir().unwrap();
    let data = td.path().join("data");
    std::fs::create_dir_all(data.join("nested/deep")).unwrap();
    write_file(&data.join("root.txt"), b"root file");
    write_file(&data.join("nested/a.bin"), &compressible_mib(3)[..8192]);
    write_file(&data.join("nested/deep/b.bin"), &compressible_mib(4)[..4096]);

    let out = td.path().join("tree.grim");
    let opts = WriterOptions { checksum_algo: CHECKSUM_SHA256, ..WriterOptions::archive() };
    let mut w = ContainerWriter::new(&out, opts).unwrap();
    w.add_dir(&data, "/", COMPRESSION_ZLIB).unwrap();
    w.build().unwrap();

    let r = ContainerReader::open_archive(&out, ReaderOptions::default()).unwrap();
    let dest = td.path().join("restored");
    let mut events: Vec<ProgressInfo> = Vec::new();
    let mut cb = |info: &ProgressInfo| events.push(info.clone());
    let result = r
        .extract_all(&dest, true, ErrorPolicy::Raise, Some(&mut cb), None)
        .unwrap();

    assert_eq!(result.success_count, 3);
    assert_eq!(result.failed_count, 0);
    assert!(!result.aborted);

    for rel in ["root.txt", "nested/a.bin", "nested/deep/b.bin"] {
        assert_eq!(
            std::fs::read(data.join(rel)).unwrap(),
            std::fs::read(dest.join(rel)).unwrap(),
            "mismatch for {rel}"
        );
    }

    // Emitted progress is strictly increasing and finishes at 1.0.
    assert!(!events.is_empty());
    assert!(events.windows(2).all(|w| w[0].current < w[1].current));
    let last = events.last().unwrap();
    assert_eq!(last.current, last.total);
    assert!((last.progress - 1.0).abs() < f64::EPSILON);
}

#[test]
fn duplicate_and_missing_paths_are_rejected() {
    let td = tempfile::tempdir().unwrap();
    let a = td.path().join("a.txt");
    write_file(&a, b"x");

    let out = td.path().join("m.grim");
    let mut w = ContainerWriter::new(&out, WriterOptions::manifest()).unwrap();
    w.add_file(&a, "/a.txt", 0).unwrap();

    let dup = w.add_file(&a, "a.txt", 0); // same canonical path
    assert!(matches!(dup, Err(grimvfs_core::Error::DuplicatePath(_))));

    let missing = w.add_file(&td.path().join("nope.txt"), "/nope.txt", 0);
    assert!(matches!(missing, Err(grimvfs_core::Error::LocalIo { .. })));
}

#[test]
fn not_found_and_entry_metadata() {
    let td = tempfile::tempdir().unwrap();
    let a = td.path().join("a.txt");
    write_file(&a, b"hello");

    let out = td.path().join("m.grim");
    let opts = WriterOptions { checksum_algo: CHECKSUM_MD5, ..WriterOptions::manifest() };
    let mut w = ContainerWriter::new(&out, opts).unwrap();
    w.add_file(&a, "/a.txt", 0).unwrap();
    w.build().unwrap();

    let r = ContainerReader::open_manifest(&out, ReaderOptions::default()).unwrap();
    assert!(matches!(
        r.get_entry("/other.txt"),
        Err(grimvfs_core::Error::NotFound(_))
    ));
    let e = r.get_entry("a.txt").unwrap(); // canonicalised to /a.txt
    assert_eq!(e.vfs_path, "/a.txt");
    assert_eq!(e.raw_size, 5);
    assert_eq!(e.checksum.len(), 16);
}
