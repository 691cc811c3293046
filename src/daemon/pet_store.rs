//! Per-agent pet-name index: `pet-store/<store number>/<name>.json`.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::{FormulaId, FormulaNumber, FormulaType, PetName, is_valid_pet_name};
use crate::paths::DaemonPaths;

use super::durable::{StoreError, ensure_dir, read_optional, write_replace};
use super::sync::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PetRecordKind {
    ReadableSha512,
    WorkerUuid,
    ValueUuid,
}

impl PetRecordKind {
    pub fn for_type(formula_type: FormulaType) -> Self {
        match formula_type {
            FormulaType::ReadableBlob => PetRecordKind::ReadableSha512,
            FormulaType::Worker => PetRecordKind::WorkerUuid,
            _ => PetRecordKind::ValueUuid,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PetRecord {
    #[serde(rename = "type")]
    pub kind: PetRecordKind,
    pub id: FormulaId,
}

#[derive(Debug)]
pub struct PetStore {
    number: FormulaNumber,
    dir: PathBuf,
    // Serializes read-modify-write sequences (rename).
    write_lock: Mutex<()>,
}

impl PetStore {
    pub fn open(paths: &DaemonPaths, number: FormulaNumber) -> Result<Self, StoreError> {
        let dir = paths.pet_store_dir(&number);
        ensure_dir(&dir)?;
        Ok(Self {
            number,
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn number(&self) -> &FormulaNumber {
        &self.number
    }

    fn record_path(&self, name: &PetName) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn lookup(&self, name: &PetName) -> Result<Option<PetRecord>, StoreError> {
        let path = self.record_path(name);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::CorruptRecord {
                path,
                reason: e.to_string(),
            })
    }

    pub fn identify(&self, name: &PetName) -> Result<Option<FormulaId>, StoreError> {
        Ok(self.lookup(name)?.map(|record| record.id))
    }

    pub fn has(&self, name: &PetName) -> bool {
        self.record_path(name).exists()
    }

    /// Point `name` at `id`, replacing any previous target.
    pub fn write(
        &self,
        name: &PetName,
        id: &FormulaId,
        formula_type: FormulaType,
    ) -> Result<(), StoreError> {
        let _guard = lock(&self.write_lock);
        self.write_unlocked(name, id, formula_type)
    }

    fn write_unlocked(
        &self,
        name: &PetName,
        id: &FormulaId,
        formula_type: FormulaType,
    ) -> Result<(), StoreError> {
        let record = PetRecord {
            kind: PetRecordKind::for_type(formula_type),
            id: id.clone(),
        };
        let path = self.record_path(name);
        let body = serde_json::to_vec(&record).map_err(|e| StoreError::CorruptRecord {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_replace(&path, &body)?;
        tracing::debug!(pet_store = %self.number, name = %name, formula = %id, "pet name written");
        Ok(())
    }

    /// Names in lexical order.
    pub fn list(&self) -> Result<Vec<PetName>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let file_name = entry.file_name();
            let Some(stem) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
            else {
                continue;
            };
            if is_valid_pet_name(stem) {
                names.push(PetName::parse(stem)?);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn remove(&self, name: &PetName) -> Result<(), StoreError> {
        let _guard = lock(&self.write_lock);
        let path = self.record_path(name);
        fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::UnknownReference {
                reference: name.to_string(),
            },
            _ => StoreError::io(&path, e),
        })
    }

    /// Move `from` to `to`, overwriting `to`.
    pub fn rename(&self, from: &PetName, to: &PetName) -> Result<(), StoreError> {
        if from == to {
            return Ok(());
        }
        let _guard = lock(&self.write_lock);
        let from_path = self.record_path(from);
        if !from_path.exists() {
            return Err(StoreError::UnknownReference {
                reference: from.to_string(),
            });
        }
        let to_path = self.record_path(to);
        fs::rename(&from_path, &to_path).map_err(|e| StoreError::io(&to_path, e))
    }
}
