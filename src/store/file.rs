//! Directory-backed store.
//!
//! Append-only records (decisions, coordination log, resolutions) are JSON
//! lines. Keyed state (catalog, schema history, attempt counters) is a JSON
//! snapshot rewritten through a temp file and rename.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{CoordinationRecord, MetadataStore};
use crate::catalog::{CatalogEntry, CatalogQuery, Schema};
use crate::core::{AgentDecision, TaskId};
use crate::healing::{ErrorId, Resolution};
use crate::{Error, Result};

const DECISIONS: &str = "decisions.jsonl";
const COORDINATION: &str = "coordination.jsonl";
const RESOLUTIONS: &str = "resolutions.jsonl";
const CATALOG: &str = "catalog.json";
const SCHEMAS: &str = "schemas.json";
const ATTEMPTS: &str = "attempts.json";

fn persistence(context: &str, e: impl std::fmt::Display) -> Error {
    Error::PersistenceFailure(format!("{context}: {e}"))
}

pub struct JsonFileStore {
    dir: PathBuf,
    // Serialises writers; files are only touched with this held.
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn open(dir: &Path) -> Result<Self> {
        debug!(dir = %dir.display(), "JsonFileStore::open");
        fs::create_dir_all(dir).map_err(|e| persistence("create store dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| Error::PersistenceFailure("file store lock poisoned".into()))
    }

    fn append<T: Serialize>(&self, file: &str, record: &T) -> Result<()> {
        let _guard = self.guard()?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .map_err(|e| persistence(file, e))?;
        f.write_all(line.as_bytes()).map_err(|e| persistence(file, e))?;
        f.sync_data().map_err(|e| persistence(file, e))
    }

    fn read_lines<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let _guard = self.guard()?;
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let f = fs::File::open(&path).map_err(|e| persistence(file, e))?;
        let mut records = Vec::new();
        for line in BufReader::new(f).lines() {
            let line = line.map_err(|e| persistence(file, e))?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn read_snapshot<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(T::default());
        }
        let contents = fs::read_to_string(&path).map_err(|e| persistence(file, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_snapshot<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.dir.join(file);
        let temp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(value)?;
        fs::write(&temp_path, contents).map_err(|e| persistence(file, e))?;
        fs::rename(&temp_path, &path).map_err(|e| persistence(file, e))
    }

    /// Read-modify-write a snapshot under the writer lock.
    fn update_snapshot<T, F>(&self, file: &str, f: F) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let _guard = self.guard()?;
        let mut value: T = self.read_snapshot(file)?;
        f(&mut value);
        self.write_snapshot(file, &value)
    }

    fn snapshot<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T> {
        let _guard = self.guard()?;
        self.read_snapshot(file)
    }
}

impl MetadataStore for JsonFileStore {
    fn save_agent_decision(&self, decision: &AgentDecision) -> Result<()> {
        self.append(DECISIONS, decision)
    }

    fn decisions_for_task(&self, task_id: &TaskId) -> Result<Vec<AgentDecision>> {
        let all: Vec<AgentDecision> = self.read_lines(DECISIONS)?;
        Ok(all.into_iter().filter(|d| &d.task_id == task_id).collect())
    }

    fn append_coordination_log(&self, record: &CoordinationRecord) -> Result<()> {
        self.append(COORDINATION, record)
    }

    fn coordination_log(&self) -> Result<Vec<CoordinationRecord>> {
        self.read_lines(COORDINATION)
    }

    fn save_catalog_entry(&self, entry: &CatalogEntry) -> Result<()> {
        self.update_snapshot(CATALOG, |catalog: &mut BTreeMap<String, CatalogEntry>| {
            catalog.insert(entry.source_id.clone(), entry.clone());
        })
    }

    fn query_catalog(&self, query: &CatalogQuery) -> Result<Vec<CatalogEntry>> {
        let catalog: BTreeMap<String, CatalogEntry> = self.snapshot(CATALOG)?;
        Ok(catalog.into_values().filter(|e| query.matches(e)).collect())
    }

    fn save_schema_version(&self, schema: &Schema) -> Result<()> {
        self.update_snapshot(SCHEMAS, |schemas: &mut BTreeMap<String, Vec<Schema>>| {
            let history = schemas.entry(schema.source_id.clone()).or_default();
            history.retain(|s| s.version != schema.version);
            history.push(schema.clone());
            history.sort_by_key(|s| s.version);
        })
    }

    fn get_schema_history(&self, source_id: &str) -> Result<Vec<Schema>> {
        let mut schemas: BTreeMap<String, Vec<Schema>> = self.snapshot(SCHEMAS)?;
        Ok(schemas.remove(source_id).unwrap_or_default())
    }

    fn save_resolution(&self, resolution: &Resolution) -> Result<()> {
        self.append(RESOLUTIONS, resolution)
    }

    fn load_resolutions(&self) -> Result<Vec<Resolution>> {
        self.read_lines(RESOLUTIONS)
    }

    fn save_attempts(&self, error_id: &ErrorId, attempts: u32) -> Result<()> {
        self.update_snapshot(ATTEMPTS, |map: &mut HashMap<String, u32>| {
            map.insert(error_id.to_string(), attempts);
        })
    }

    fn load_attempts(&self, error_id: &ErrorId) -> Result<Option<u32>> {
        let map: HashMap<String, u32> = self.snapshot(ATTEMPTS)?;
        Ok(map.get(&error_id.to_string()).copied())
    }
}
