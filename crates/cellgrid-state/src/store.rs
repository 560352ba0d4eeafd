//! StateStore — redb-backed persistence for CellGrid.
//!
//! Lifecycle operations live next to their records (`lrps`, `tasks`,
//! `cells`); this module owns the database handle, the event channel and
//! the read/write helpers they share.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use cellgrid_core::StoreConfig;

use crate::crash_policy::CrashPolicy;
use crate::error::{StateError, StateResult};
use crate::events::StoreEvent;
use crate::tables::*;
use crate::types::Versioned;

pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const EVENT_CAPACITY: usize = 1024;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
    pub(crate) events: broadcast::Sender<StoreEvent>,
    pub(crate) crash_policy: CrashPolicy,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Open the store described by the `[store]` config section.
    pub fn from_config(config: &StoreConfig) -> StateResult<Self> {
        match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
                }
                Self::open(path)
            }
            None => Self::open_in_memory(),
        }
    }

    fn with_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
            crash_policy: CrashPolicy::default(),
        }
    }

    pub fn with_crash_policy(mut self, policy: CrashPolicy) -> Self {
        self.crash_policy = policy;
        self
    }

    pub fn crash_policy(&self) -> &CrashPolicy {
        &self.crash_policy
    }

    /// Subscribe to committed changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, events: impl IntoIterator<Item = StoreEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DESIRED_LRPS).map_err(map_err!(Table))?;
        txn.open_table(ACTUAL_LRPS).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(CELLS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Shared helpers ─────────────────────────────────────────────

    pub(crate) fn read_one<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        get_json(&table, key)
    }

    /// All records in a table, optionally restricted to a key prefix.
    pub(crate) fn read_all<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        prefix: Option<&str>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        scan_json(&table, prefix)
    }

    /// Read-modify-write of one record inside a single write transaction.
    ///
    /// `f` returns `Ok(false)` when the record is already in the requested
    /// state; nothing is written then. Returns the record as stored and
    /// whether it changed.
    pub(crate) fn mutate<T, F>(&self, table: JsonTable, key: &str, f: F) -> StateResult<(T, bool)>
    where
        T: Serialize + DeserializeOwned + Versioned,
        F: FnOnce(&mut T) -> StateResult<bool>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let mut record: T =
                get_json(&table, key)?.ok_or_else(|| StateError::NotFound(key.to_string()))?;
            let changed = f(&mut record)?;
            if changed {
                put_versioned(&mut table, key, &mut record)?;
            }
            (record, changed)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }
}

pub(crate) fn get_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let record = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

pub(crate) fn scan_json<T, R>(table: &R, prefix: Option<&str>) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if prefix.is_some_and(|p| !key.value().starts_with(p)) {
            continue;
        }
        let record = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(record);
    }
    Ok(results)
}

/// Write a record with its modification index bumped.
pub(crate) fn put_versioned<T>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    record: &mut T,
) -> StateResult<()>
where
    T: Serialize + Versioned,
{
    record.set_modification_index(record.modification_index() + 1);
    let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
    table
        .insert(key, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

pub(crate) fn remove_key(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
) -> StateResult<bool> {
    Ok(table.remove(key).map_err(map_err!(Write))?.is_some())
}
