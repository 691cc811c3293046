//! SHA-512 content digests.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha512};

use super::error::{CoreError, InvalidId};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha512Digest([u8; 64]);

impl Sha512Digest {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| -> CoreError {
            InvalidId::Digest {
                raw: raw.to_string(),
                reason: reason.to_string(),
            }
            .into()
        };
        if raw.len() != 128 {
            return Err(invalid("expected 128 hex characters"));
        }
        if raw.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(invalid("must be lowercase hex"));
        }
        let mut out = [0u8; 64];
        hex::decode_to_slice(raw, &mut out).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Sha512Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha512({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Sha512Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for Sha512Digest {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<Sha512Digest> for String {
    fn from(digest: Sha512Digest) -> Self {
        digest.to_hex()
    }
}

/// Incremental hasher fed chunk by chunk while a blob streams to disk.
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha512,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> Sha512Digest {
        let out = self.inner.finalize();
        let mut buf = [0u8; 64];
        buf.copy_from_slice(&out);
        Sha512Digest(buf)
    }
}

pub fn sha512_bytes(data: &[u8]) -> Sha512Digest {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}
