#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
pub mod paths;
pub mod telemetry;
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;
pub mod worker;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    Formula, FormulaId, FormulaNumber, FormulaType, Locator, NodeId, PetName, Sha512Digest,
    format_locator, parse_locator,
};
