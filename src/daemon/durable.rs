//! Store errors and the atomic file writes every store shares.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::core::{CoreError, Sha512Digest};
use crate::error::{Effect, Transience};

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum StoreError {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("unknown reference `{reference}`")]
    UnknownReference { reference: String },
    #[error("corrupt formula {id}: {reason}")]
    CorruptFormula { id: String, reason: String },
    #[error("corrupt record at {}: {reason}", path.display())]
    CorruptRecord { path: PathBuf, reason: String },
    #[error("integrity failure: expected sha512 {expected}, found {actual}")]
    IntegrityFailure {
        expected: Sha512Digest,
        actual: Sha512Digest,
    },
    #[error("blob {digest} cannot be decoded as {format}: {reason}")]
    Decode {
        digest: Sha512Digest,
        format: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Io { .. } => "io",
            StoreError::UnknownReference { .. } => "unknown_reference",
            StoreError::CorruptFormula { .. } | StoreError::CorruptRecord { .. } => {
                "corrupt_formula"
            }
            StoreError::IntegrityFailure { .. } => "integrity_failure",
            StoreError::Decode { .. } => "decode_failed",
            StoreError::Core(e) => e.code(),
        }
    }

    /// Storage failures are reported, never retried.
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Io { .. } => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            StoreError::Io { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))
}

fn stage_temp(path: &Path, data: &[u8]) -> Result<tempfile::NamedTempFile, StoreError> {
    let dir = path.parent().ok_or_else(|| {
        StoreError::io(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "path missing parent directory"),
        )
    })?;
    ensure_dir(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    temp.write_all(data)
        .and_then(|()| temp.as_file().sync_data())
        .map_err(|e| StoreError::io(temp.path().to_path_buf(), e))?;
    Ok(temp)
}

/// Write `data` to `path` unless something is already there. Returns whether
/// this call wrote the file.
pub(crate) fn write_once(path: &Path, data: &[u8]) -> Result<bool, StoreError> {
    if path.exists() {
        return Ok(false);
    }
    let temp = stage_temp(path, data)?;
    match temp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(StoreError::io(path, err.error)),
    }
}

/// Replace `path` with `data` via temp-then-rename.
pub(crate) fn write_replace(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let temp = stage_temp(path, data)?;
    temp.persist(path)
        .map_err(|err| StoreError::io(path, err.error))?;
    Ok(())
}

/// `Ok(None)` when the file does not exist.
pub(crate) fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}
