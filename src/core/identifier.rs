//! Identity atoms
//!
//! NodeId: owning daemon instance
//! FormulaNumber: per-node formula address (random or content hash)
//! FormulaId: `<number>:<node>`

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::digest::Sha512Digest;
use super::error::{CoreError, InvalidId};

/// Hex characters in a node id or formula number (512 bits).
pub const ID_HEX_LEN: usize = 128;

fn check_hex512(raw: &str) -> Result<(), String> {
    if raw.len() != ID_HEX_LEN {
        return Err(format!("expected {ID_HEX_LEN} hex characters, got {}", raw.len()));
    }
    if !raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err("must be lowercase hex".into());
    }
    Ok(())
}

fn random_hex512() -> String {
    let mut bytes = [0u8; ID_HEX_LEN / 2];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Identifier of a daemon instance.
///
/// Ordering is byte-wise over the lowercase hex text, which is what the
/// crossed-hellos tie-break compares.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        check_hex512(raw).map_err(|reason| InvalidId::Node {
            raw: raw.to_string(),
            reason,
        })?;
        Ok(Self(raw.to_string()))
    }

    pub fn generate() -> Self {
        Self(random_hex512())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Per-node formula address.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FormulaNumber(String);

impl FormulaNumber {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        check_hex512(raw).map_err(|reason| InvalidId::Number {
            raw: raw.to_string(),
            reason,
        })?;
        Ok(Self(raw.to_string()))
    }

    /// Fresh random number for a newly formulated value.
    pub fn generate() -> Self {
        Self(random_hex512())
    }

    /// Content-addressed number: the digest itself.
    pub fn from_digest(digest: &Sha512Digest) -> Self {
        Self(digest.to_hex())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    /// Two-character shard prefix and the remainder, for on-disk layout.
    pub fn split_shard(&self) -> (&str, &str) {
        self.0.split_at(2)
    }
}

impl fmt::Debug for FormulaNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FormulaNumber({}..)", &self.0[..8])
    }
}

impl fmt::Display for FormulaNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FormulaNumber {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<FormulaNumber> for String {
    fn from(number: FormulaNumber) -> Self {
        number.0
    }
}

/// Globally meaningful formula address, serialized as `<number>:<node>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FormulaId {
    number: FormulaNumber,
    node: NodeId,
}

impl FormulaId {
    pub fn new(number: FormulaNumber, node: NodeId) -> Self {
        Self { number, node }
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let Some((number, node)) = raw.split_once(':') else {
            return Err(InvalidId::Formula {
                raw: raw.to_string(),
                reason: "expected `<number>:<node>`".into(),
            }
            .into());
        };
        let wrap = |err: CoreError| -> CoreError {
            InvalidId::Formula {
                raw: raw.to_string(),
                reason: err.to_string(),
            }
            .into()
        };
        Ok(Self {
            number: FormulaNumber::parse(number).map_err(wrap)?,
            node: NodeId::parse(node).map_err(wrap)?,
        })
    }

    pub fn number(&self) -> &FormulaNumber {
        &self.number
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn is_local_to(&self, node: &NodeId) -> bool {
        &self.node == node
    }
}

impl fmt::Debug for FormulaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FormulaId({}..:{}..)",
            &self.number.as_str()[..8],
            self.node.short()
        )
    }
}

impl fmt::Display for FormulaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.number, self.node)
    }
}

impl FromStr for FormulaId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FormulaId {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<FormulaId> for String {
    fn from(id: FormulaId) -> Self {
        id.to_string()
    }
}
