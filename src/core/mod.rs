//! Core domain types for the daemon
//!
//! Module hierarchy follows type dependency order:
//! - error: validation errors raised before any I/O
//! - digest: SHA-512 content digests
//! - identifier: NodeId, FormulaNumber, FormulaId
//! - pet_name: PetName, SpecialName
//! - formula: Formula, FormulaType
//! - locator: `endo://` locators

pub mod digest;
pub mod error;
pub mod formula;
pub mod identifier;
pub mod locator;
pub mod pet_name;

pub use digest::{ContentHasher, Sha512Digest, sha512_bytes};
pub use error::{CoreError, InvalidId, InvalidLocator, InvalidName, UnknownFormulaType};
pub use formula::{Formula, FormulaType};
pub use identifier::{FormulaId, FormulaNumber, ID_HEX_LEN, NodeId};
pub use locator::{LOCATOR_SCHEME, Locator, format_locator, parse_locator};
pub use pet_name::{PetName, SpecialName, is_valid_pet_name};
