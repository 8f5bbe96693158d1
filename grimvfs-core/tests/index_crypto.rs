use std::path::Path;
use std::sync::Arc;

use grimvfs_core::checksum::{Crc32Checksum, Md5Checksum, Sha1Checksum, Sha256Checksum, CHECKSUM_SHA256};
use grimvfs_core::compress::{ZlibCompression, ZstdCompression};
use grimvfs_core::crypto::{XorObfuscate, CRYPTO_XOR};
use grimvfs_core::{
    ContainerReader, ContainerWriter, Error, HookRegistry, ReaderOptions, WriterOptions,
};

const KEY: &[u8] = b"under-the-floorboards";

fn keyed_registry(with_crypto: bool) -> HookRegistry {
    let mut reg = HookRegistry::new();
    reg.register_checksum(Arc::new(Crc32Checksum)).unwrap();
    reg.register_checksum(Arc::new(Md5Checksum)).unwrap();
    reg.register_checksum(Arc::new(Sha1Checksum)).unwrap();
    reg.register_checksum(Arc::new(Sha256Checksum)).unwrap();
    reg.register_compression(Arc::new(ZlibCompression::default())).unwrap();
    reg.register_compression(Arc::new(ZstdCompression::default())).unwrap();
    if with_crypto {
        reg.register_index_crypto(Arc::new(XorObfuscate::new(KEY.to_vec()))).unwrap();
    }
    reg
}

fn build_encrypted(dir: &Path) -> std::path::PathBuf {
    let out = dir.join("secret.grim");
    let opts = WriterOptions {
        registry: keyed_registry(true),
        checksum_algo: CHECKSUM_SHA256,
        index_crypto: CRYPTO_XOR,
        ..WriterOptions::archive()
    };
    let mut w = ContainerWriter::new(&out, opts).unwrap();
    for (name, body) in [("alpha", "first entry"), ("beta", "second entry"), ("gamma", "third entry")]
    {
        let local = dir.join(format!("{name}.txt"));
        std::fs::write(&local, body).unwrap();
        w.add_file(&local, &format!("/docs/{name}.txt"), 0).unwrap();
    }
    w.build().unwrap();
    out
}

#[test]
fn encrypted_index_allows_hash_access_only() {
    let td = tempfile::tempdir().unwrap();
    let out = build_encrypted(td.path());

    // No crypto hook supplied: paths are sealed, hashes are not.
    let blind_opts = ReaderOptions { registry: keyed_registry(false), ..ReaderOptions::default() };
    let blind = ContainerReader::open_archive(&out, blind_opts).unwrap();
    assert!(!blind.is_decrypted());
    assert!(matches!(blind.list_all(), Err(Error::IndexNotDecrypted)));
    assert_eq!(blind.list_hashes().len(), 3);

    // A caller who knows the path can still read the payload.
    assert_eq!(blind.read("/docs/beta.txt").unwrap(), b"second entry");
    // So can one who only knows the hash.
    for hash in blind.list_hashes() {
        assert!(!blind.read_by_hash(hash, true).unwrap().is_empty());
    }
    // Extraction needs reconstructed paths, which need decryption.
    assert!(matches!(
        blind.extract_all(&td.path().join("x"), true, Default::default(), None, None),
        Err(Error::IndexNotDecrypted)
    ));

    // With the hook everything is available.
    let open_opts = ReaderOptions { registry: keyed_registry(true), ..ReaderOptions::default() };
    let sighted = ContainerReader::open_archive(&out, open_opts).unwrap();
    assert!(sighted.is_decrypted());
    let mut paths = sighted.list_all().unwrap();
    paths.sort();
    assert_eq!(paths, vec!["/docs/alpha.txt", "/docs/beta.txt", "/docs/gamma.txt"]);
    assert_eq!(sighted.read("/docs/alpha.txt").unwrap(), b"first entry");
}

#[test]
fn wrong_key_fails_decryption_on_open() {
    let td = tempfile::tempdir().unwrap();
    let out = build_encrypted(td.path());

    let mut wrong = keyed_registry(false);
    wrong
        .register_index_crypto(Arc::new(XorObfuscate::new(b"not-the-key".to_vec())))
        .unwrap();
    let opts = ReaderOptions { registry: wrong, ..ReaderOptions::default() };
    assert!(matches!(
        ContainerReader::open_archive(&out, opts),
        Err(Error::IndexDecryptError(_))
    ));
}

#[test]
fn crypto_hooks_roundtrip_identity() {
    use grimvfs_core::crypto::{ZlibPack, ZlibXor};
    use grimvfs_core::IndexCryptoHook;

    let hooks: Vec<Box<dyn IndexCryptoHook>> = vec![
        Box::new(XorObfuscate::new(KEY.to_vec())),
        Box::new(ZlibPack::default()),
        Box::new(ZlibXor::default()),
    ];
    let plain: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    for hook in hooks {
        assert_eq!(hook.decrypt(&hook.encrypt(&plain).unwrap()).unwrap(), plain);
    }
}

#[test]
fn zlib_index_crypto_shrinks_and_roundtrips_in_container() {
    use grimvfs_core::crypto::CRYPTO_ZLIB;

    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("packed-index.grim");
    let opts = WriterOptions {
        checksum_algo: CHECKSUM_SHA256,
        index_crypto: CRYPTO_ZLIB,
        ..WriterOptions::manifest()
    };
    let mut w = ContainerWriter::new(&out, opts).unwrap();
    // Lots of shared directory prefixes, so the tables compress well.
    for i in 0..40 {
        let local = td.path().join(format!("f{i}.txt"));
        std::fs::write(&local, format!("content {i}")).unwrap();
        w.add_file(&local, &format!("/very/long/shared/prefix/dir/file_{i:03}.txt"), 0).unwrap();
    }
    w.build().unwrap();

    let r = ContainerReader::open_manifest(&out, ReaderOptions::default()).unwrap();
    assert!(r.is_decrypted());
    assert_eq!(r.list_all().unwrap().len(), 40);
}
