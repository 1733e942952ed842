use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{CoordinationRecord, MetadataStore};
use crate::catalog::{CatalogEntry, CatalogQuery, Schema};
use crate::core::{AgentDecision, TaskId};
use crate::healing::{ErrorId, Resolution};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    decisions: Vec<AgentDecision>,
    coordination: Vec<CoordinationRecord>,
    catalog: BTreeMap<String, CatalogEntry>,
    schemas: BTreeMap<String, Vec<Schema>>,
    resolutions: Vec<Resolution>,
    attempts: HashMap<ErrorId, u32>,
}

/// In-process store. Nothing survives the process.
///
/// `fail_next_writes` injects `PersistenceFailure`s, which is how callers'
/// durability-before-visibility handling gets exercised.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing_writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write calls fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::PersistenceFailure("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<MutexGuard<'_, Inner>> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::PersistenceFailure("injected write failure".into()));
        }
        self.lock()
    }
}

impl MetadataStore for MemoryStore {
    fn save_agent_decision(&self, decision: &AgentDecision) -> Result<()> {
        self.write()?.decisions.push(decision.clone());
        Ok(())
    }

    fn decisions_for_task(&self, task_id: &TaskId) -> Result<Vec<AgentDecision>> {
        Ok(self
            .lock()?
            .decisions
            .iter()
            .filter(|d| &d.task_id == task_id)
            .cloned()
            .collect())
    }

    fn append_coordination_log(&self, record: &CoordinationRecord) -> Result<()> {
        self.write()?.coordination.push(record.clone());
        Ok(())
    }

    fn coordination_log(&self) -> Result<Vec<CoordinationRecord>> {
        Ok(self.lock()?.coordination.clone())
    }

    fn save_catalog_entry(&self, entry: &CatalogEntry) -> Result<()> {
        self.write()?
            .catalog
            .insert(entry.source_id.clone(), entry.clone());
        Ok(())
    }

    fn query_catalog(&self, query: &CatalogQuery) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .lock()?
            .catalog
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect())
    }

    fn save_schema_version(&self, schema: &Schema) -> Result<()> {
        let mut inner = self.write()?;
        let history = inner.schemas.entry(schema.source_id.clone()).or_default();
        history.retain(|s| s.version != schema.version);
        history.push(schema.clone());
        history.sort_by_key(|s| s.version);
        Ok(())
    }

    fn get_schema_history(&self, source_id: &str) -> Result<Vec<Schema>> {
        Ok(self
            .lock()?
            .schemas
            .get(source_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_resolution(&self, resolution: &Resolution) -> Result<()> {
        self.write()?.resolutions.push(resolution.clone());
        Ok(())
    }

    fn load_resolutions(&self) -> Result<Vec<Resolution>> {
        Ok(self.lock()?.resolutions.clone())
    }

    fn save_attempts(&self, error_id: &ErrorId, attempts: u32) -> Result<()> {
        self.write()?.attempts.insert(*error_id, attempts);
        Ok(())
    }

    fn load_attempts(&self, error_id: &ErrorId) -> Result<Option<u32>> {
        Ok(self.lock()?.attempts.get(error_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Field;

    #[test]
    fn test_injected_failures_then_recovery() {
        let store = MemoryStore::new();
        let id = ErrorId::new();
        store.fail_next_writes(2);

        assert!(matches!(
            store.save_attempts(&id, 1),
            Err(Error::PersistenceFailure(_))
        ));
        assert!(store.save_attempts(&id, 1).is_err());
        store.save_attempts(&id, 1).unwrap();
        assert_eq!(store.load_attempts(&id).unwrap(), Some(1));
    }

    #[test]
    fn test_schema_history_sorted_and_deduplicated() {
        let store = MemoryStore::new();
        let v2 = Schema::new("pg-users", 2, vec![Field::new("id", "bigint", false)]);
        let v1 = Schema::new("pg-users", 1, vec![Field::new("id", "integer", false)]);
        store.save_schema_version(&v2).unwrap();
        store.save_schema_version(&v1).unwrap();
        store.save_schema_version(&v2).unwrap();

        let versions: Vec<u32> = store
            .get_schema_history("pg-users")
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
        assert!(store.get_schema_history("unknown").unwrap().is_empty());
    }

    #[test]
    fn test_catalog_upsert() {
        let store = MemoryStore::new();
        let schema = Schema::new("pg-users", 1, vec![]);
        store
            .save_catalog_entry(&CatalogEntry::new("users", schema.clone()))
            .unwrap();
        store
            .save_catalog_entry(&CatalogEntry::new("users renamed", schema))
            .unwrap();

        let all = store.query_catalog(&CatalogQuery::default()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "users renamed");
    }
}
