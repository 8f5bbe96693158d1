//! External batch digest providers.
//!
//! Large manifests are dominated by checksum time. `fhash` and `rclone`
//! both hash whole file sets in one process spawn, far faster than per-file
//! hashing from here. Providers are optional: callers probe
//! [`BatchDigestProvider::available`] and fall back to the in-process
//! checksum hook when the tool is missing, and any file a provider fails to
//! digest simply drops out of the result map so the caller hashes it
//! per-file.
//!
//! The two tools speak different protocols. fhash takes its work list from
//! a file (`fhash -a <algo> -m -j -f <list>`) and emits JSON Lines, one
//! object per file with the digest stored under the algorithm name; rclone
//! is batched per directory (`rclone hashsum <algo> <dir> --max-depth 1`)
//! and prints `<hex>  <name>` lines relative to that directory.

use std::collections::HashMap;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Computes checksums for many files in one external invocation.
pub trait BatchDigestProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Algorithm id recorded in containers built from this provider.
    fn algo_id(&self) -> u16;
    /// Digest size in bytes.
    fn output_size(&self) -> u16;
    fn available(&self) -> bool;
    fn digest_files(&self, paths: &[PathBuf]) -> Result<HashMap<PathBuf, Vec<u8>>>;
}

/// `(algo_id, digest bytes)` for the algorithm names the providers accept.
///
/// This is the one global id table: names the builtin hooks also implement
/// share their ids, and the provider-only algorithms continue the same
/// sequence.
pub fn provider_algorithm(name: &str) -> Option<(u16, u16)> {
    match name.to_ascii_lowercase().as_str() {
        "crc32" => Some((1, 4)),
        "md5" => Some((2, 16)),
        "sha1" => Some((3, 20)),
        "sha256" => Some((4, 32)),
        "sha512" => Some((5, 64)),
        "blake3" => Some((6, 32)),
        "xxh3" => Some((7, 8)),
        "xxh128" => Some((8, 16)),
        "quickxor" => Some((9, 20)),
        _ => None,
    }
}

/// quickxor digests travel base64-encoded in fhash output; everything else
/// is hex.
fn fhash_uses_base64(algorithm: &str) -> bool {
    algorithm == "quickxor"
}

/// Locate an executable: explicit path first, then the tool's environment
/// variable, then a `PATH` scan.
fn find_tool(name: &str, env_var: &str, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        if p.is_file() {
            return Some(p.to_path_buf());
        }
    }
    if let Ok(p) = env::var(env_var) {
        let p = PathBuf::from(p);
        if p.is_file() {
            return Some(p);
        }
    }
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

fn tool_responds(tool: &Path, version_arg: &str) -> bool {
    Command::new(tool)
        .arg(version_arg)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Invalid(format!("provider output is not hex: {s:?}")));
    }
    Ok((0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap_or(0))
        .collect())
}

fn decode_digest(s: &str, base64_encoded: bool) -> Result<Vec<u8>> {
    if base64_encoded {
        STANDARD
            .decode(s)
            .map_err(|e| Error::Invalid(format!("provider output is not base64: {e}")))
    } else {
        decode_hex(s)
    }
}

/// Parse fhash JSON Lines output.
///
/// One object per file, digest under the algorithm name; objects carrying
/// an `error` key, unparseable lines and wrong-width digests are skipped so
/// those files fall back to per-file hashing.
fn parse_fhash_jsonl(
    stdout: &str,
    algorithm: &str,
    digest_size: u16,
) -> HashMap<PathBuf, Vec<u8>> {
    let base64_encoded = fhash_uses_base64(algorithm);
    let mut out = HashMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("error").is_some() {
            continue;
        }
        let Some(path) = value.get("path").and_then(Value::as_str) else {
            continue;
        };
        let Some(hash) = value.get(algorithm).and_then(Value::as_str) else {
            continue;
        };
        let Ok(digest) = decode_digest(hash, base64_encoded) else {
            continue;
        };
        if digest.len() != digest_size as usize {
            continue;
        }
        out.insert(PathBuf::from(path), digest);
    }
    out
}

/// Parse `rclone hashsum` output: `<hex>  <name>` per line, names relative
/// to the hashed directory. Malformed lines are skipped.
fn parse_rclone_lines(stdout: &str, digest_size: u16) -> HashMap<String, Vec<u8>> {
    let mut out = HashMap::new();
    for line in stdout.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let Some((hex, name)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let Ok(digest) = decode_hex(hex.trim()) else {
            continue;
        };
        if digest.len() != digest_size as usize {
            continue;
        }
        out.insert(name.trim_start().to_string(), digest);
    }
    out
}

/// Driver for the `fhash` tool.
pub struct FhashProvider {
    algorithm: String,
    algo_id: u16,
    digest_size: u16,
    tool: Option<PathBuf>,
}

impl FhashProvider {
    pub fn new(algorithm: &str, explicit_path: Option<&Path>) -> Result<Self> {
        let (algo_id, digest_size) = provider_algorithm(algorithm)
            .ok_or_else(|| Error::Invalid(format!("fhash does not support {algorithm:?}")))?;
        let tool = find_tool("fhash", "GRIMVFS_FHASH", explicit_path);
        Ok(Self { algorithm: algorithm.to_ascii_lowercase(), algo_id, digest_size, tool })
    }
}

impl BatchDigestProvider for FhashProvider {
    fn name(&self) -> &str {
        "fhash"
    }

    fn algo_id(&self) -> u16 {
        self.algo_id
    }

    fn output_size(&self) -> u16 {
        self.digest_size
    }

    fn available(&self) -> bool {
        self.tool.as_deref().map(|t| tool_responds(t, "-v")).unwrap_or(false)
    }

    fn digest_files(&self, paths: &[PathBuf]) -> Result<HashMap<PathBuf, Vec<u8>>> {
        let tool = self
            .tool
            .as_ref()
            .ok_or_else(|| Error::Invalid("fhash executable not found".into()))?;
        if paths.is_empty() {
            return Ok(HashMap::new());
        }

        // fhash reads its batch work list from a file, one path per line.
        let mut list = tempfile::NamedTempFile::new()?;
        for p in paths {
            writeln!(list, "{}", p.display())?;
        }
        list.flush()?;

        debug!(files = paths.len(), algo = %self.algorithm, "running fhash batch");
        let output = Command::new(tool)
            .arg("-a")
            .arg(&self.algorithm)
            .arg("-m")
            .arg("-j")
            .arg("-f")
            .arg(list.path())
            .output()?;
        if !output.status.success() {
            return Err(Error::Invalid(format!(
                "fhash exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_fhash_jsonl(
            &String::from_utf8_lossy(&output.stdout),
            &self.algorithm,
            self.digest_size,
        ))
    }
}

/// Driver for `rclone hashsum`.
pub struct RcloneProvider {
    algorithm: String,
    algo_id: u16,
    digest_size: u16,
    tool: Option<PathBuf>,
}

impl RcloneProvider {
    pub fn new(algorithm: &str, explicit_path: Option<&Path>) -> Result<Self> {
        let (algo_id, digest_size) = provider_algorithm(algorithm)
            .ok_or_else(|| Error::Invalid(format!("rclone does not support {algorithm:?}")))?;
        let tool = find_tool("rclone", "GRIMVFS_RCLONE", explicit_path);
        Ok(Self { algorithm: algorithm.to_ascii_lowercase(), algo_id, digest_size, tool })
    }

    /// Single-file fallback: `rclone hashsum <algo> <file>`.
    fn digest_one(&self, tool: &Path, path: &Path) -> Result<Vec<u8>> {
        let output = Command::new(tool)
            .arg("hashsum")
            .arg(&self.algorithm)
            .arg(path)
            .output()?;
        if !output.status.success() {
            return Err(Error::Invalid(format!("rclone exited with {}", output.status)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout
            .split_whitespace()
            .next()
            .ok_or_else(|| Error::Invalid(format!("rclone produced no output for {path:?}")))?;
        let digest = decode_hex(first)?;
        if digest.len() != self.digest_size as usize {
            return Err(Error::Invalid(format!(
                "rclone digest is {} bytes, expected {}",
                digest.len(),
                self.digest_size
            )));
        }
        Ok(digest)
    }
}

impl BatchDigestProvider for RcloneProvider {
    fn name(&self) -> &str {
        "rclone"
    }

    fn algo_id(&self) -> u16 {
        self.algo_id
    }

    fn output_size(&self) -> u16 {
        self.digest_size
    }

    fn available(&self) -> bool {
        self.tool.as_deref().map(|t| tool_responds(t, "version")).unwrap_or(false)
    }

    fn digest_files(&self, paths: &[PathBuf]) -> Result<HashMap<PathBuf, Vec<u8>>> {
        let tool = self
            .tool
            .as_ref()
            .ok_or_else(|| Error::Invalid("rclone executable not found".into()))?;

        // rclone hashes whole directories, so batch per parent dir and pick
        // the requested names out of each listing.
        let mut by_dir: HashMap<PathBuf, Vec<&PathBuf>> = HashMap::new();
        for p in paths {
            let dir = p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
            by_dir.entry(dir.to_path_buf()).or_default().push(p);
        }

        let mut out = HashMap::new();
        for (dir, group) in &by_dir {
            debug!(dir = %dir.display(), files = group.len(), algo = %self.algorithm, "running rclone hashsum batch");
            let listing = Command::new(tool)
                .arg("hashsum")
                .arg(&self.algorithm)
                .arg(dir)
                .arg("--max-depth")
                .arg("1")
                .output()?;
            let names = if listing.status.success() {
                parse_rclone_lines(&String::from_utf8_lossy(&listing.stdout), self.digest_size)
            } else {
                HashMap::new()
            };
            for p in group {
                let digest = p
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| names.get(n).cloned());
                match digest {
                    Some(d) => {
                        out.insert((*p).clone(), d);
                    }
                    // Names the directory listing missed get one direct try;
                    // files that still fail stay absent from the map.
                    None => {
                        if let Ok(d) = self.digest_one(tool, p) {
                            out.insert((*p).clone(), d);
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}
