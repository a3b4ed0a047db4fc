use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{EtxError, Result};
use crate::etx::Redo;
use super::RedoStore;

/// Volatile redo store
#[derive(Default)]
pub struct MemoryRedoStore {
    records: Mutex<BTreeMap<i64, Redo>>,
}

impl MemoryRedoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<i64, Redo>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RedoStore for MemoryRedoStore {
    fn all(&self) -> Result<Vec<Redo>> {
        Ok(self.records().values().cloned().collect())
    }

    fn delete_id(&self, id: i64) -> Result<()> {
        self.records().remove(&id);
        Ok(())
    }

    fn for_manager(&self, manager: &str, before: i64) -> Result<Vec<Redo>> {
        Ok(self
            .records()
            .values()
            .filter(|r| r.manager == manager && r.tx < before)
            .cloned()
            .collect())
    }

    fn get_if(&self, id: i64) -> Result<Option<Redo>> {
        Ok(self.records().get(&id).cloned())
    }

    fn insert(&self, redo: &Redo) -> Result<()> {
        let mut records = self.records();
        if records.contains_key(&redo.id) {
            return Err(EtxError::duplicate_record(redo.id));
        }
        records.insert(redo.id, redo.clone());
        Ok(())
    }

    fn update(&self, redo: &Redo) -> Result<()> {
        match self.records().get_mut(&redo.id) {
            Some(existing) => {
                *existing = redo.clone();
                Ok(())
            }
            None => Err(EtxError::missing_record(redo.id)),
        }
    }
}
