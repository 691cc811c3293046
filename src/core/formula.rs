//! Formulas: durable, write-once recipes for constructing capabilities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::digest::Sha512Digest;
use super::error::{CoreError, UnknownFormulaType};
use super::identifier::{FormulaId, NodeId};

/// Closed set of formula kinds. Serialized in kebab-case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormulaType {
    Eval,
    Worker,
    ReadableBlob,
    PetStore,
    Host,
    Guest,
    Bundle,
    Peer,
    Remote,
}

impl FormulaType {
    pub const ALL: [FormulaType; 9] = [
        FormulaType::Eval,
        FormulaType::Worker,
        FormulaType::ReadableBlob,
        FormulaType::PetStore,
        FormulaType::Host,
        FormulaType::Guest,
        FormulaType::Bundle,
        FormulaType::Peer,
        FormulaType::Remote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FormulaType::Eval => "eval",
            FormulaType::Worker => "worker",
            FormulaType::ReadableBlob => "readable-blob",
            FormulaType::PetStore => "pet-store",
            FormulaType::Host => "host",
            FormulaType::Guest => "guest",
            FormulaType::Bundle => "bundle",
            FormulaType::Peer => "peer",
            FormulaType::Remote => "remote",
        }
    }
}

impl fmt::Display for FormulaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormulaType {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        FormulaType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == raw)
            .ok_or_else(|| {
                UnknownFormulaType {
                    raw: raw.to_string(),
                }
                .into()
            })
    }
}

/// How to build a value. Unknown `type` tags fail deserialization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Formula {
    Eval {
        worker: FormulaId,
        source: String,
        names: Vec<String>,
        values: Vec<FormulaId>,
    },
    Worker,
    ReadableBlob {
        content: Sha512Digest,
    },
    PetStore,
    Host {
        pet_store: FormulaId,
        worker: FormulaId,
    },
    Guest {
        host: FormulaId,
        pet_store: FormulaId,
    },
    Bundle {
        worker: FormulaId,
        bundle: FormulaId,
        powers: FormulaId,
    },
    Peer {
        node: NodeId,
        addresses: Vec<String>,
    },
    Remote {
        peer: FormulaId,
        id: FormulaId,
    },
}

impl Formula {
    pub fn formula_type(&self) -> FormulaType {
        match self {
            Formula::Eval { .. } => FormulaType::Eval,
            Formula::Worker => FormulaType::Worker,
            Formula::ReadableBlob { .. } => FormulaType::ReadableBlob,
            Formula::PetStore => FormulaType::PetStore,
            Formula::Host { .. } => FormulaType::Host,
            Formula::Guest { .. } => FormulaType::Guest,
            Formula::Bundle { .. } => FormulaType::Bundle,
            Formula::Peer { .. } => FormulaType::Peer,
            Formula::Remote { .. } => FormulaType::Remote,
        }
    }

    /// Formula ids this formula refers to, in construction order.
    pub fn dependencies(&self) -> Vec<&FormulaId> {
        match self {
            Formula::Eval { worker, values, .. } => {
                std::iter::once(worker).chain(values.iter()).collect()
            }
            Formula::Host { pet_store, worker } => vec![pet_store, worker],
            Formula::Guest { host, pet_store } => vec![host, pet_store],
            Formula::Bundle {
                worker,
                bundle,
                powers,
            } => vec![worker, bundle, powers],
            Formula::Remote { peer, .. } => vec![peer],
            Formula::Worker
            | Formula::ReadableBlob { .. }
            | Formula::PetStore
            | Formula::Peer { .. } => Vec::new(),
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FormulaNumber, sha512_bytes};

    fn id() -> FormulaId {
        FormulaId::new(FormulaNumber::generate(), NodeId::generate())
    }

    #[test]
    fn tags_are_kebab_case() {
        let formula = Formula::ReadableBlob {
            content: sha512_bytes(b"abc"),
        };
        let json: serde_json::Value = serde_json::to_value(&formula).unwrap();
        assert_eq!(json["type"], "readable-blob");
        assert_eq!(serde_json::to_value(Formula::PetStore).unwrap()["type"], "pet-store");
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = Formula::from_json_bytes(br#"{"type":"lookup","name":"x"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn eval_parses_back() {
        let formula = Formula::Eval {
            worker: id(),
            source: "a".into(),
            names: vec!["a".into()],
            values: vec![id()],
        };
        let bytes = formula.to_json_bytes().unwrap();
        assert_eq!(Formula::from_json_bytes(&bytes).unwrap(), formula);
        assert_eq!(formula.dependencies().len(), 2);
    }

    #[test]
    fn formula_type_from_str() {
        assert_eq!("remote".parse::<FormulaType>().unwrap(), FormulaType::Remote);
        let err = "lookup".parse::<FormulaType>().unwrap_err();
        assert_eq!(err.code(), "corrupt_formula");
    }
}
