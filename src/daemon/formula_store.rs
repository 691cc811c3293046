//! Durable formula records, one JSON file per formula number.

use std::path::PathBuf;

use crate::core::{Formula, FormulaId, FormulaNumber};
use crate::paths::DaemonPaths;

use super::durable::{StoreError, read_optional, write_once};

#[derive(Clone, Debug)]
pub struct FormulaStore {
    paths: DaemonPaths,
}

impl FormulaStore {
    pub fn new(paths: DaemonPaths) -> Self {
        Self { paths }
    }

    pub fn path_of(&self, number: &FormulaNumber) -> PathBuf {
        self.paths.formula_path(number)
    }

    /// Persist `formula` under `number`. Formulas are write-once: an existing
    /// record is left untouched.
    pub fn write(&self, number: &FormulaNumber, formula: &Formula) -> Result<(), StoreError> {
        let path = self.path_of(number);
        let body = formula
            .to_json_bytes()
            .map_err(|e| StoreError::CorruptFormula {
                id: number.to_string(),
                reason: format!("cannot encode: {e}"),
            })?;
        if write_once(&path, &body)? {
            tracing::debug!(
                formula = %number,
                formula_type = %formula.formula_type(),
                "formula persisted"
            );
        }
        Ok(())
    }

    pub fn read(&self, id: &FormulaId) -> Result<Formula, StoreError> {
        let path = self.path_of(id.number());
        let bytes = read_optional(&path)?.ok_or_else(|| StoreError::UnknownReference {
            reference: id.to_string(),
        })?;
        Formula::from_json_bytes(&bytes).map_err(|e| StoreError::CorruptFormula {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn contains(&self, number: &FormulaNumber) -> bool {
        self.path_of(number).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use crate::core::NodeId;

    fn store() -> (tempfile::TempDir, FormulaStore, NodeId) {
        let dir = tempfile::tempdir().unwrap();
        let store = FormulaStore::new(DaemonPaths::rooted(dir.path()));
        (dir, store, NodeId::generate())
    }

    #[test]
    fn write_then_read() {
        let (_dir, store, node) = store();
        let number = FormulaNumber::generate();
        store.write(&number, &Formula::Worker).unwrap();
        let id = FormulaId::new(number, node);
        assert_eq!(store.read(&id).unwrap(), Formula::Worker);
    }

    #[test]
    fn missing_formula_is_unknown_reference() {
        let (_dir, store, node) = store();
        let id = FormulaId::new(FormulaNumber::generate(), node);
        assert_eq!(store.read(&id).unwrap_err().code(), "unknown_reference");
    }

    #[test]
    fn unknown_type_is_corrupt() {
        let (_dir, store, node) = store();
        let number = FormulaNumber::generate();
        let path = store.path_of(&number);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, br#"{"type":"lookup"}"#).unwrap();
        let err = store.read(&FormulaId::new(number, node)).unwrap_err();
        assert_eq!(err.code(), "corrupt_formula");
    }

    #[test]
    fn records_are_write_once() {
        let (_dir, store, node) = store();
        let number = FormulaNumber::generate();
        store.write(&number, &Formula::Worker).unwrap();
        store.write(&number, &Formula::PetStore).unwrap();
        let id = FormulaId::new(number, node);
        assert_eq!(store.read(&id).unwrap(), Formula::Worker);
    }
}
