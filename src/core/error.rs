//! Core errors (identifier parsing, pet-name and locator validation).
//!
//! These are pure input failures: they never carry I/O state and are always
//! raised before anything is written.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// Invalid identifier or digest text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("node id `{raw}` is invalid: {reason}")]
    Node { raw: String, reason: String },
    #[error("formula number `{raw}` is invalid: {reason}")]
    Number { raw: String, reason: String },
    #[error("formula id `{raw}` is invalid: {reason}")]
    Formula { raw: String, reason: String },
    #[error("sha512 digest `{raw}` is invalid: {reason}")]
    Digest { raw: String, reason: String },
}

/// Pet name that fails `^[a-z][a-z0-9]*$`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid pet name `{raw}`")]
pub struct InvalidName {
    pub raw: String,
}

/// Locator string that does not parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid locator `{raw}`: {reason}")]
pub struct InvalidLocator {
    pub raw: String,
    pub reason: String,
}

/// Unrecognized formula `type` tag.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unrecognized formula type `{raw}`")]
pub struct UnknownFormulaType {
    pub raw: String,
}

/// Canonical error enum for the core layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    InvalidName(#[from] InvalidName),
    #[error(transparent)]
    InvalidLocator(#[from] InvalidLocator),
    #[error(transparent)]
    UnknownFormulaType(#[from] UnknownFormulaType),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidId(_) => "invalid_id",
            CoreError::InvalidName(_) => "invalid_name",
            CoreError::InvalidLocator(_) => "invalid_locator",
            CoreError::UnknownFormulaType(_) => "corrupt_formula",
        }
    }

    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
