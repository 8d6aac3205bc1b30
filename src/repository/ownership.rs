use std::{
    collections::BTreeSet,
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerFile {
    #[serde(default)]
    owned_exam_ids: BTreeSet<String>,
}

/// Ids of the exams this station created. Only these can be driven from
/// here; every other ongoing exam is a read-only mirror.
pub struct OwnershipLedger {
    path: Option<PathBuf>,
    owned: RwLock<BTreeSet<String>>,
}

impl OwnershipLedger {
    /// Load the ledger at `path`, starting empty if the file does not exist.
    pub fn open(path: PathBuf) -> Result<Self> {
        let owned = match fs::read_to_string(&path) {
            Ok(contents) => {
                serde_json::from_str::<LedgerFile>(&contents)
                    .with_context(|| format!("failed to parse ownership ledger {}", path.display()))?
                    .owned_exam_ids
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read ownership ledger {}", path.display()))
            }
        };

        Ok(Self {
            path: Some(path),
            owned: RwLock::new(owned),
        })
    }

    /// Ledger that forgets everything when the process exits.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            owned: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn owns(&self, exam_id: &str) -> bool {
        self.read().contains(exam_id)
    }

    pub fn claim(&self, exam_id: &str) -> Result<()> {
        let mut owned = self.write();
        if owned.insert(exam_id.to_string()) {
            self.persist(&owned)?;
        }
        Ok(())
    }

    pub fn release(&self, exam_id: &str) -> Result<()> {
        let mut owned = self.write();
        if owned.remove(exam_id) {
            self.persist(&owned)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeSet<String>> {
        match self.owned.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeSet<String>> {
        match self.owned.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, owned: &BTreeSet<String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = LedgerFile {
            owned_exam_ids: owned.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        fs::write(path, json)
            .with_context(|| format!("failed to write ownership ledger {}", path.display()))
    }
}
