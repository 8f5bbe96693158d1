use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::format::Mode;

/// Errors surfaced by container operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("corrupt file header: {0}")]
    HeaderCorrupt(String),

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("mode mismatch: file is {found:?}, reader expects {expected:?}")]
    ModeMismatch { expected: Mode, found: Mode },

    #[error("index decryption failed: {0}")]
    IndexDecryptError(String),

    #[error("index is encrypted and no matching crypto hook was supplied")]
    IndexNotDecrypted,

    #[error("unknown {kind} algorithm id {algo_id}")]
    UnknownAlgoId { kind: &'static str, algo_id: u16 },

    #[error("duplicate vfs path: {0}")]
    DuplicatePath(String),

    #[error("path not found: {0}")]
    NotFound(String),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("decompression failed: {0}")]
    DecompressError(String),

    #[error("local file error for {path:?}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("batch aborted after partial completion")]
    BatchAborted,

    #[error("invalid container data: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Fieldless classification of [`Error`], used in batch failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadMagic,
    HeaderCorrupt,
    UnsupportedVersion,
    ModeMismatch,
    IndexDecryptError,
    IndexNotDecrypted,
    UnknownAlgoId,
    DuplicatePath,
    NotFound,
    ChecksumMismatch,
    DecompressError,
    LocalIo,
    BatchAborted,
    Invalid,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadMagic { .. } => ErrorKind::BadMagic,
            Error::HeaderCorrupt(_) => ErrorKind::HeaderCorrupt,
            Error::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            Error::ModeMismatch { .. } => ErrorKind::ModeMismatch,
            Error::IndexDecryptError(_) => ErrorKind::IndexDecryptError,
            Error::IndexNotDecrypted => ErrorKind::IndexNotDecrypted,
            Error::UnknownAlgoId { .. } => ErrorKind::UnknownAlgoId,
            Error::DuplicatePath(_) => ErrorKind::DuplicatePath,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Error::DecompressError(_) => ErrorKind::DecompressError,
            Error::LocalIo { .. } => ErrorKind::LocalIo,
            Error::BatchAborted => ErrorKind::BatchAborted,
            Error::Invalid(_) => ErrorKind::Invalid,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
