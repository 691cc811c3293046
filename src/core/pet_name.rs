//! Pet names: per-agent local aliases for formula identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{CoreError, InvalidName};

/// Local alias matching `^[a-z][a-z0-9]*$`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PetName(String);

impl PetName {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        if is_valid_pet_name(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(InvalidName {
                raw: raw.to_string(),
            }
            .into())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn is_valid_pet_name(raw: &str) -> bool {
    let mut bytes = raw.bytes();
    match bytes.next() {
        Some(b'a'..=b'z') => bytes.all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9')),
        _ => false,
    }
}

impl fmt::Debug for PetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PetName({:?})", self.0)
    }
}

impl fmt::Display for PetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PetName {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<PetName> for String {
    fn from(name: PetName) -> Self {
        name.0
    }
}

/// Names every agent resolves without a pet-store record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialName {
    /// The agent itself.
    SelfAgent,
    /// The agent's main worker.
    Main,
    /// A fresh worker (only meaningful where a worker is requested).
    New,
}

impl SpecialName {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SELF" => Some(SpecialName::SelfAgent),
            "MAIN" => Some(SpecialName::Main),
            "NEW" => Some(SpecialName::New),
            _ => None,
        }
    }
}
