//! Content-addressed blob storage.
//!
//! Blobs stream into `store-sha512/<uuid>` while being hashed, and become
//! visible only when renamed to `store-sha512/<sha512>`.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::core::{ContentHasher, Sha512Digest};
use crate::paths::DaemonPaths;

use super::durable::{StoreError, ensure_dir};

const CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ContentStore {
    dir: PathBuf,
}

/// Bytes written to a temp file and hashed, not yet published.
/// Dropping without [`ContentStore::commit`] removes the temp file.
#[derive(Debug)]
pub struct StagedBlob {
    temp: PathBuf,
    digest: Sha512Digest,
    len: u64,
    committed: bool,
}

impl StagedBlob {
    pub fn digest(&self) -> Sha512Digest {
        self.digest
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp);
        }
    }
}

/// A blob being written piece by piece. Dropping it before
/// [`BlobWriter::finish`] removes the temp file.
pub struct BlobWriter {
    file: File,
    hasher: ContentHasher,
    staged: StagedBlob,
}

impl BlobWriter {
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.hasher.update(bytes);
        self.file
            .write_all(bytes)
            .map_err(|e| StoreError::io(&self.staged.temp, e))
    }

    /// Bytes appended so far.
    pub fn len(&self) -> u64 {
        self.hasher.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(self) -> Result<StagedBlob, StoreError> {
        let BlobWriter {
            file,
            hasher,
            mut staged,
        } = self;
        file.sync_data()
            .map_err(|e| StoreError::io(&staged.temp, e))?;
        staged.len = hasher.len();
        staged.digest = hasher.finalize();
        Ok(staged)
    }
}

impl ContentStore {
    pub fn new(paths: &DaemonPaths) -> Self {
        Self {
            dir: paths.content_dir(),
        }
    }

    pub fn path_of(&self, digest: &Sha512Digest) -> PathBuf {
        self.dir.join(digest.to_hex())
    }

    /// A fresh temp file that hashes what is appended to it.
    pub fn writer(&self) -> Result<BlobWriter, StoreError> {
        ensure_dir(&self.dir)?;
        let temp = self.dir.join(uuid::Uuid::new_v4().to_string());
        let file = File::create(&temp).map_err(|e| StoreError::io(&temp, e))?;
        Ok(BlobWriter {
            file,
            hasher: ContentHasher::new(),
            staged: StagedBlob {
                temp,
                digest: ContentHasher::new().finalize(),
                len: 0,
                committed: false,
            },
        })
    }

    /// Drain `reader` into a fresh temp file, hashing as it goes.
    pub fn stage(&self, mut reader: impl Read) -> Result<StagedBlob, StoreError> {
        let mut writer = self.writer()?;
        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StoreError::io(&writer.staged.temp, e)),
            };
            writer.append(&buf[..n])?;
        }
        writer.finish()
    }

    /// Publish a staged blob under its digest. Identical content already in
    /// place is simply replaced by the same bytes.
    pub fn commit(&self, mut staged: StagedBlob) -> Result<Sha512Digest, StoreError> {
        let target = self.path_of(&staged.digest);
        fs::rename(&staged.temp, &target).map_err(|e| StoreError::io(&target, e))?;
        staged.committed = true;
        tracing::debug!(sha512 = %staged.digest, bytes = staged.len, "blob committed");
        Ok(staged.digest)
    }

    pub fn open(&self, digest: &Sha512Digest) -> Result<File, StoreError> {
        let path = self.path_of(digest);
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::UnknownReference {
                reference: format!("sha512:{digest}"),
            },
            _ => StoreError::io(&path, e),
        })
    }

    /// Rehash the committed file; a mismatch is an integrity failure.
    pub fn verify(&self, digest: &Sha512Digest) -> Result<(), StoreError> {
        let path = self.path_of(digest);
        let mut reader = BufReader::new(self.open(digest)?);
        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = reader.read(&mut buf).map_err(|e| StoreError::io(&path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        check(digest, hasher.finalize())
    }

    pub fn read_all(&self, digest: &Sha512Digest) -> Result<Vec<u8>, StoreError> {
        let path = self.path_of(digest);
        let mut bytes = Vec::new();
        self.open(digest)?
            .read_to_end(&mut bytes)
            .map_err(|e| StoreError::io(&path, e))?;
        check(digest, crate::core::sha512_bytes(&bytes))?;
        Ok(bytes)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn check(expected: &Sha512Digest, actual: Sha512Digest) -> Result<(), StoreError> {
    if *expected == actual {
        Ok(())
    } else {
        Err(StoreError::IntegrityFailure {
            expected: *expected,
            actual,
        })
    }
}

/// Handle on a committed blob.
#[derive(Clone, Debug)]
pub struct ReadableBlob {
    digest: Sha512Digest,
    store: ContentStore,
}

impl ReadableBlob {
    pub fn new(digest: Sha512Digest, store: ContentStore) -> Self {
        Self { digest, store }
    }

    pub fn sha512(&self) -> Sha512Digest {
        self.digest
    }

    /// Lazy reader; the digest is checked when the stream reaches its end.
    pub fn stream(&self) -> Result<BlobStream, StoreError> {
        Ok(BlobStream {
            inner: BufReader::new(self.store.open(&self.digest)?),
            hasher: Some(ContentHasher::new()),
            expected: self.digest,
        })
    }

    pub fn bytes(&self) -> Result<Vec<u8>, StoreError> {
        self.store.read_all(&self.digest)
    }

    pub fn text(&self) -> Result<String, StoreError> {
        String::from_utf8(self.bytes()?).map_err(|e| StoreError::Decode {
            digest: self.digest,
            format: "utf-8",
            reason: e.to_string(),
        })
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_slice(&self.bytes()?).map_err(|e| StoreError::Decode {
            digest: self.digest,
            format: "json",
            reason: e.to_string(),
        })
    }
}

pub struct BlobStream {
    inner: BufReader<File>,
    hasher: Option<ContentHasher>,
    expected: Sha512Digest,
}

impl Read for BlobStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Some(hasher) = self.hasher.as_mut() {
                hasher.update(&buf[..n]);
            }
            return Ok(n);
        }
        if let Some(hasher) = self.hasher.take() {
            let actual = hasher.finalize();
            if actual != self.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    StoreError::IntegrityFailure {
                        expected: self.expected,
                        actual,
                    },
                ));
            }
        }
        Ok(0)
    }
}
