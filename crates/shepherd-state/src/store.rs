//! StateStore: redb-backed state persistence for Shepherd.
//!
//! Holds the instance registry (per-pool instances with load scores) and
//! the application directory. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, error, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        txn.open_table(QUARANTINE).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Register an instance, or update its score if already registered.
    pub fn put_instance(&self, pool: &str, address: &str, score: u64) -> StateResult<()> {
        let key = instance_key(pool, address);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let existing = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let registered_at = match existing {
                Some(bytes) => {
                    let prev: ServiceInstance =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    prev.registered_at
                }
                None => epoch_secs(),
            };
            let instance = ServiceInstance {
                pool: pool.to_string(),
                address: address.to_string(),
                score,
                registered_at,
            };
            let value = serde_json::to_vec(&instance).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, score, "instance stored");
        Ok(())
    }

    /// Get a single instance.
    pub fn get_instance(&self, pool: &str, address: &str) -> StateResult<Option<ServiceInstance>> {
        let key = instance_key(pool, address);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let instance: ServiceInstance =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    /// List all instances of a pool in key order.
    pub fn list_instances(&self, pool: &str) -> StateResult<Vec<ServiceInstance>> {
        let prefix = format!("{pool}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let instance: ServiceInstance =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(instance);
            }
        }
        Ok(results)
    }

    /// Up to `n` instances of a pool ascending by score.
    ///
    /// Reads a single transaction so scores form one consistent snapshot.
    /// The sort is stable: equal scores keep key order.
    pub fn least_loaded(&self, pool: &str, n: usize) -> StateResult<Vec<ServiceInstance>> {
        let mut instances = self.list_instances(pool)?;
        instances.sort_by_key(|i| i.score);
        instances.truncate(n);
        Ok(instances)
    }

    /// Remove an instance. Returns true if it existed.
    pub fn remove_instance(&self, pool: &str, address: &str) -> StateResult<bool> {
        let key = instance_key(pool, address);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "instance removed");
        Ok(existed)
    }

    // ── Applications ───────────────────────────────────────────────

    /// Insert or update an application record. Invalid records are rejected.
    pub fn put_application(&self, record: &ApplicationRecord) -> StateResult<()> {
        record.validate()?;
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        self.put_raw_application(&key, &value)?;
        debug!(%key, host = %record.host, "application stored");
        Ok(())
    }

    /// Write an application payload without validation.
    ///
    /// Exists so tests can seed records written by older producers.
    pub fn put_raw_application(&self, key: &str, value: &[u8]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an application by owner and name.
    pub fn get_application(&self, owner: &str, name: &str) -> StateResult<Option<ApplicationRecord>> {
        let key = application_key(owner, name);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ApplicationRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// All valid applications recorded against `host`.
    ///
    /// Payloads that are not JSON, or whose `host` matches but that fail
    /// typed decoding or validation, are moved to the quarantine table and
    /// left out of the result.
    pub fn applications_on_host(&self, host: &str) -> StateResult<Vec<ApplicationRecord>> {
        let mut matches = Vec::new();
        let mut malformed: Vec<(String, Vec<u8>)> = Vec::new();
        {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let raw: serde_json::Value = match serde_json::from_slice(value.value()) {
                    Ok(raw) => raw,
                    Err(_) => {
                        malformed.push((key.value().to_string(), value.value().to_vec()));
                        continue;
                    }
                };
                if raw.get("host").and_then(|h| h.as_str()) != Some(host) {
                    continue;
                }
                let decoded = serde_json::from_value::<ApplicationRecord>(raw)
                    .map_err(map_err!(Deserialize))
                    .and_then(|record| record.validate().map(|()| record));
                match decoded {
                    Ok(record) => matches.push(record),
                    Err(e) => {
                        warn!(key = %key.value(), error = %e, "malformed application record");
                        malformed.push((key.value().to_string(), value.value().to_vec()));
                    }
                }
            }
        }

        if !malformed.is_empty() {
            if let Err(e) = self.quarantine(&malformed) {
                error!(error = %e, count = malformed.len(), "failed to quarantine application records");
            }
        }

        Ok(matches)
    }

    /// Move raw application payloads into the quarantine table.
    ///
    /// Each key is re-read inside the write transaction and only moved when
    /// it still holds the bytes seen by the lookup.
    fn quarantine(&self, entries: &[(String, Vec<u8>)]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut apps = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            let mut quarantine = txn.open_table(QUARANTINE).map_err(map_err!(Table))?;
            for (key, value) in entries {
                let current = apps
                    .get(key.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| guard.value().to_vec());
                if current.as_deref() != Some(value.as_slice()) {
                    debug!(%key, "application record changed since lookup; not quarantined");
                    continue;
                }
                quarantine
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                apps.remove(key.as_str()).map_err(map_err!(Write))?;
                warn!(%key, "application record quarantined");
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Keys of quarantined application payloads.
    pub fn list_quarantined(&self) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(QUARANTINE).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    /// Point an application at a new host in one write transaction.
    pub fn set_application_host(&self, owner: &str, name: &str, host: &str) -> StateResult<()> {
        let key = application_key(owner, name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            let current = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(key.clone()))?;
            let mut record: ApplicationRecord =
                serde_json::from_slice(&current).map_err(map_err!(Deserialize))?;
            record.host = host.to_string();
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, %host, "application host updated");
        Ok(())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
