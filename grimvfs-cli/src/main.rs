use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use grimvfs_core::batch::{ErrorPolicy, ProgressInfo, ScanOptions};
use grimvfs_core::checksum::builtin_by_name;
use grimvfs_core::compress::{COMPRESSION_STORED, COMPRESSION_ZLIB, COMPRESSION_ZSTD};
use grimvfs_core::convert::manifest_from_archive;
use grimvfs_core::crypto::{XorObfuscate, CRYPTO_XOR};
use grimvfs_core::format::{validate_magic, Mode};
use grimvfs_core::{ContainerReader, ContainerWriter, HookRegistry, ReaderOptions, WriterOptions};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CompressAlgo {
    None,
    Zlib,
    Zstd,
}

impl CompressAlgo {
    fn id(self) -> u16 {
        match self {
            CompressAlgo::None => COMPRESSION_STORED,
            CompressAlgo::Zlib => COMPRESSION_ZLIB,
            CompressAlgo::Zstd => COMPRESSION_ZSTD,
        }
    }
}

#[derive(Parser)]
#[command(name = "grimvfs", version, about = "GrimoireVFS container tool")]
struct Cli {
    /// Verbose logging (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Build a manifest container from a directory
    Manifest {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, default_value = "md5")]
        checksum: String,
        #[arg(long, default_value = "/")]
        mount: String,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long)]
        xor_key: Option<String>,
        #[arg(long, default_value = "GRIM")]
        magic: String,
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
    /// Build an archive container from a directory
    Pack {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = CompressAlgo::Zstd)]
        compress: CompressAlgo,
        #[arg(long, default_value = "sha256")]
        checksum: String,
        #[arg(long, default_value = "/")]
        mount: String,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long)]
        xor_key: Option<String>,
        #[arg(long, default_value = "GRIM")]
        magic: String,
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
    /// Extract an archive into a directory
    Extract {
        archive: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = false)]
        no_verify: bool,
        #[arg(long)]
        xor_key: Option<String>,
        #[arg(long, default_value = "GRIM")]
        magic: String,
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
    /// Verify a local tree against a manifest
    Verify {
        manifest: PathBuf,
        root: PathBuf,
        #[arg(long)]
        xor_key: Option<String>,
        #[arg(long, default_value = "GRIM")]
        magic: String,
    },
    /// List paths stored in a container
    List {
        file: PathBuf,
        #[arg(long)]
        xor_key: Option<String>,
        #[arg(long, default_value = "GRIM")]
        magic: String,
        /// Print path hashes instead of paths
        #[arg(long, default_value_t = false)]
        hashes: bool,
    },
    /// Show container header information
    Info {
        file: PathBuf,
        #[arg(long, default_value = "GRIM")]
        magic: String,
    },
    /// Dump container metadata as JSON
    ToJson {
        file: PathBuf,
        output: PathBuf,
        #[arg(long)]
        xor_key: Option<String>,
        #[arg(long, default_value = "GRIM")]
        magic: String,
    },
    /// Rebuild a manifest from an archive (metadata only)
    Convert {
        archive: PathBuf,
        output: PathBuf,
        #[arg(long)]
        xor_key: Option<String>,
        #[arg(long, default_value = "GRIM")]
        magic: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.cmd {
        Cmd::Manifest { input, output, checksum, mount, exclude, xor_key, magic, progress } => {
            build(Mode::Manifest, &input, &output, &checksum, CompressAlgo::None, &mount, exclude, xor_key, &magic, progress)
        }
        Cmd::Pack { input, output, compress, checksum, mount, exclude, xor_key, magic, progress } => {
            build(Mode::Archive, &input, &output, &checksum, compress, &mount, exclude, xor_key, &magic, progress)
        }
        Cmd::Extract { archive, output, no_verify, xor_key, magic, progress } => {
            extract(&archive, &output, !no_verify, xor_key, &magic, progress)
        }
        Cmd::Verify { manifest, root, xor_key, magic } => verify(&manifest, &root, xor_key, &magic),
        Cmd::List { file, xor_key, magic, hashes } => list(&file, xor_key, &magic, hashes),
        Cmd::Info { file, magic } => info(&file, &magic),
        Cmd::ToJson { file, output, xor_key, magic } => to_json(&file, &output, xor_key, &magic),
        Cmd::Convert { archive, output, xor_key, magic } => convert(&archive, &output, xor_key, &magic),
    }
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_magic(s: &str) -> Result<[u8; 4]> {
    validate_magic(s.as_bytes()).map_err(|e| anyhow!("{e}"))
}

/// Builtin checksum and compression hooks. The XOR index hook is only
/// registered when the user supplies a key: an absent hook leaves a sealed
/// container readable by hash, a wrong-keyed one fails the open outright.
fn registry_with_key(xor_key: Option<String>) -> Result<HookRegistry> {
    use grimvfs_core::checksum::{
        Blake3Checksum, Crc32Checksum, Md5Checksum, Sha1Checksum, Sha256Checksum,
    };
    use grimvfs_core::compress::{ZlibCompression, ZstdCompression};
    use grimvfs_core::crypto::ZlibPack;

    let mut registry = HookRegistry::new();
    registry.register_checksum(Arc::new(Crc32Checksum)).map_err(|e| anyhow!("{e}"))?;
    registry.register_checksum(Arc::new(Md5Checksum)).map_err(|e| anyhow!("{e}"))?;
    registry.register_checksum(Arc::new(Sha1Checksum)).map_err(|e| anyhow!("{e}"))?;
    registry.register_checksum(Arc::new(Sha256Checksum)).map_err(|e| anyhow!("{e}"))?;
    registry.register_checksum(Arc::new(Blake3Checksum)).map_err(|e| anyhow!("{e}"))?;
    registry
        .register_compression(Arc::new(ZlibCompression::default()))
        .map_err(|e| anyhow!("{e}"))?;
    registry
        .register_compression(Arc::new(ZstdCompression::default()))
        .map_err(|e| anyhow!("{e}"))?;
    // Keyless, so always safe to have on hand.
    registry.register_index_crypto(Arc::new(ZlibPack::default())).map_err(|e| anyhow!("{e}"))?;
    if let Some(key) = xor_key {
        registry
            .register_index_crypto(Arc::new(XorObfuscate::new(key.into_bytes())))
            .map_err(|e| anyhow!("{e}"))?;
    }
    Ok(registry)
}

fn progress_printer(enabled: bool) -> Option<Box<dyn FnMut(&ProgressInfo)>> {
    if !enabled {
        return None;
    }
    Some(Box::new(|info: &ProgressInfo| {
        eprintln!(
            "[{:>3}%] {}/{} {} ({:.1} MiB/s)",
            (info.progress * 100.0) as u32,
            info.current,
            info.total,
            info.current_file,
            info.rate / (1024.0 * 1024.0)
        );
    }))
}

#[allow(clippy::too_many_arguments)]
fn build(
    mode: Mode,
    input: &Path,
    output: &Path,
    checksum: &str,
    compress: CompressAlgo,
    mount: &str,
    exclude: Vec<String>,
    xor_key: Option<String>,
    magic: &str,
    progress: bool,
) -> Result<()> {
    let (checksum_algo, _) =
        builtin_by_name(checksum).ok_or_else(|| anyhow!("unknown checksum algorithm {checksum:?}"))?;
    let index_crypto = if xor_key.is_some() { CRYPTO_XOR } else { 0 };
    let base = match mode {
        Mode::Manifest => WriterOptions::manifest(),
        Mode::Archive => WriterOptions::archive(),
    };
    let opts = WriterOptions {
        magic: parse_magic(magic)?,
        registry: registry_with_key(xor_key)?,
        checksum_algo,
        index_crypto,
        ..base
    };
    let mut writer = ContainerWriter::new(output, opts).context("create writer")?;

    let scan = ScanOptions {
        mount_point: mount.to_string(),
        exclude,
        algo_id: if mode == Mode::Archive { compress.id() } else { 0 },
        ..ScanOptions::default()
    };
    let mut printer = progress_printer(progress);
    let progress_ref: Option<&mut dyn FnMut(&ProgressInfo)> = match printer.as_mut() {
        Some(b) => Some(b.as_mut()),
        None => None,
    };
    let result = writer
        .add_dir_batch(input, &scan, ErrorPolicy::Raise, progress_ref, None)
        .context("stage directory")?;
    let count = result.success_count;
    writer.build().context("build container")?;
    println!("{} entries -> {}", count, output.display());
    Ok(())
}

fn reader_options(xor_key: Option<String>, magic: &str) -> Result<ReaderOptions> {
    Ok(ReaderOptions {
        magic: parse_magic(magic)?,
        registry: registry_with_key(xor_key)?,
        ..ReaderOptions::default()
    })
}

fn extract(
    archive: &Path,
    output: &Path,
    verify: bool,
    xor_key: Option<String>,
    magic: &str,
    progress: bool,
) -> Result<()> {
    let reader = ContainerReader::open_archive(archive, reader_options(xor_key, magic)?)
        .context("open archive")?;
    let mut printer = progress_printer(progress);
    let progress_ref: Option<&mut dyn FnMut(&ProgressInfo)> = match printer.as_mut() {
        Some(b) => Some(b.as_mut()),
        None => None,
    };
    let result = reader
        .extract_all(output, verify, ErrorPolicy::Skip, progress_ref, None)
        .context("extract")?;
    if result.aborted {
        return Err(grimvfs_core::Error::BatchAborted.into());
    }
    println!(
        "extracted {} files ({} bytes), {} failed",
        result.success_count, result.total_bytes, result.failed_count
    );
    for f in &result.failed_files {
        eprintln!("  FAILED {} ({:?})", f.path, f.kind());
    }
    if result.failed_count > 0 {
        bail!("{} files failed to extract", result.failed_count);
    }
    Ok(())
}

fn verify(manifest: &Path, root: &Path, xor_key: Option<String>, magic: &str) -> Result<()> {
    let reader = ContainerReader::open_manifest(manifest, reader_options(xor_key, magic)?)
        .context("open manifest")?;
    let report = reader.verify_tree(root).context("verify tree")?;
    println!(
        "checked {}: {} OK, {} mismatched, {} missing",
        report.checked,
        report.matched,
        report.mismatched.len(),
        report.missing.len()
    );
    for p in &report.mismatched {
        eprintln!("  MISMATCH {p}");
    }
    for p in &report.missing {
        eprintln!("  MISSING {p}");
    }
    if report.mismatched.is_empty() && report.missing.is_empty() {
        println!("OK");
        Ok(())
    } else {
        bail!("verification failed")
    }
}

fn open_any(file: &Path, opts: ReaderOptions) -> Result<ContainerReader> {
    match ContainerReader::open_manifest(file, opts.clone()) {
        Ok(r) => Ok(r),
        Err(grimvfs_core::Error::ModeMismatch { .. }) => {
            ContainerReader::open_archive(file, opts).map_err(Into::into)
        }
        Err(e) => Err(e.into()),
    }
}

fn list(file: &Path, xor_key: Option<String>, magic: &str, hashes: bool) -> Result<()> {
    let reader = open_any(file, reader_options(xor_key, magic)?)?;
    if hashes {
        for h in reader.list_hashes() {
            println!("{h:#018x}");
        }
    } else {
        for path in reader.list_all().context("list paths")? {
            println!("{path}");
        }
    }
    Ok(())
}

fn info(file: &Path, magic: &str) -> Result<()> {
    let reader = open_any(file, reader_options(None, magic)?)?;
    let h = reader.header();
    println!("mode:            {:?}", h.mode);
    println!("version:         {}", h.version);
    println!("entries:         {}", reader.entry_count());
    println!("checksum algo:   {}", h.checksum_algo_id);
    println!("index crypto:    {}", h.index_crypto_id);
    println!("path hash algo:  {}", h.path_hash_algo_id);
    println!("index length:    {}", h.index_length);
    println!("data length:     {}", h.data_length);
    println!("index decrypted: {}", reader.is_decrypted());
    Ok(())
}

fn to_json(file: &Path, output: &Path, xor_key: Option<String>, magic: &str) -> Result<()> {
    let reader = open_any(file, reader_options(xor_key, magic)?)?;
    let h = reader.header();
    let entries: Vec<serde_json::Value> = reader
        .all_entries()
        .context("read entries")?
        .iter()
        .map(|e| {
            serde_json::json!({
                "path": e.vfs_path,
                "raw_size": e.raw_size,
                "packed_size": e.packed_size,
                "algo_id": e.algo_id,
                "checksum": ContainerReader::checksum_hex(e),
            })
        })
        .collect();
    let doc = serde_json::json!({
        "magic": String::from_utf8_lossy(&h.magic),
        "version": h.version,
        "mode": format!("{:?}", h.mode),
        "checksum_algo": h.checksum_algo_id,
        "index_crypto": h.index_crypto_id,
        "entry_count": entries.len(),
        "entries": entries,
    });
    std::fs::write(output, serde_json::to_string_pretty(&doc)?)
        .with_context(|| format!("write {}", output.display()))?;
    println!("wrote {}", output.display());
    Ok(())
}

fn convert(archive: &Path, output: &Path, xor_key: Option<String>, magic: &str) -> Result<()> {
    manifest_from_archive(archive, output, reader_options(xor_key, magic)?)
        .context("convert archive")?;
    println!("wrote {}", output.display());
    Ok(())
}
