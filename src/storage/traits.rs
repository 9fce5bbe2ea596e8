use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{DatabaseError, Error, Result};
use crate::storage::predicate::{Predicate, SortKey};

/// One stored row: an entity kind, a primary key and a JSON object of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: String,
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            fields,
        }
    }

    /// Build a record from any model that serializes to a JSON object.
    pub fn from_entity<E: Serialize>(kind: impl Into<String>, id: impl Into<String>, entity: &E) -> Result<Self> {
        match serde_json::to_value(entity)? {
            Value::Object(fields) => Ok(Self::new(kind, id, fields)),
            other => Err(Error::Serialization(format!(
                "expected an object for a record, got {}",
                other
            ))),
        }
    }

    pub fn decode<E: DeserializeOwned>(&self) -> Result<E> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Queryable local persistence consumed by the local services and by
/// store-backed collections.
///
/// Calls are synchronous; async callers move them onto a blocking thread.
pub trait RecordStore: Send + Sync {
    /// All records of `kind` matching `predicate`, ordered by `sort`.
    fn query(&self, kind: &str, predicate: &Predicate, sort: &[SortKey]) -> Result<Vec<Record>>;

    fn count(&self, kind: &str, predicate: &Predicate) -> Result<usize> {
        Ok(self.query(kind, predicate, &[])?.len())
    }

    fn get(&self, kind: &str, id: &str) -> Result<Option<Record>> {
        Ok(self
            .query(kind, &Predicate::True, &[])?
            .into_iter()
            .find(|r| r.id == id))
    }

    /// Insert or replace records, keyed by `(kind, id)`.
    fn write(&self, records: Vec<Record>) -> Result<()>;

    /// Remove a record. Fails with `EntryNotFound` if it does not exist.
    fn delete(&self, record: &Record) -> Result<()>;
}

/// Memory-only record store for tests and development.
///
/// Can be persisted to and restored from a JSON snapshot file.
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Record>>>,
    queries: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Record>) -> Self {
        let store = Self::new();
        store.insert_all(records);
        store
    }

    /// Number of `query` calls served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn records_count(&self) -> usize {
        self.tables.read().values().map(BTreeMap::len).sum()
    }

    pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let records: Vec<Record> = serde_json::from_str(&content)?;
        debug!("Loaded {} records from {}", records.len(), path.as_ref().display());
        Ok(Self::with_records(records))
    }

    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let records: Vec<Record> = self
            .tables
            .read()
            .values()
            .flat_map(|table| table.values().cloned())
            .collect();
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&records)?)?;
        debug!("Saved {} records to {}", records.len(), path.as_ref().display());
        Ok(())
    }

    fn insert_all(&self, records: Vec<Record>) {
        let mut tables = self.tables.write();
        for record in records {
            tables
                .entry(record.kind.clone())
                .or_default()
                .insert(record.id.clone(), record);
        }
    }
}

impl RecordStore for MemoryRecordStore {
    fn query(&self, kind: &str, predicate: &Predicate, sort: &[SortKey]) -> Result<Vec<Record>> {
        self.queries.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.read();
        let mut records: Vec<Record> = tables
            .get(kind)
            .map(|table| {
                table
                    .values()
                    .filter(|r| predicate.evaluate(&r.fields))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(tables);

        if !sort.is_empty() {
            records.sort_by(|a, b| SortKey::compare(sort, &a.fields, &b.fields));
        }
        Ok(records)
    }

    fn count(&self, kind: &str, predicate: &Predicate) -> Result<usize> {
        let tables = self.tables.read();
        Ok(tables
            .get(kind)
            .map(|table| table.values().filter(|r| predicate.evaluate(&r.fields)).count())
            .unwrap_or(0))
    }

    fn get(&self, kind: &str, id: &str) -> Result<Option<Record>> {
        Ok(self.tables.read().get(kind).and_then(|t| t.get(id)).cloned())
    }

    fn write(&self, records: Vec<Record>) -> Result<()> {
        self.insert_all(records);
        Ok(())
    }

    fn delete(&self, record: &Record) -> Result<()> {
        let mut tables = self.tables.write();
        tables
            .get_mut(&record.kind)
            .and_then(|table| table.remove(&record.id))
            .map(|_| ())
            .ok_or(Error::Database(DatabaseError::EntryNotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, title: &str, read: bool) -> Record {
        let fields = json!({ "title": title, "read": read });
        Record::new("article", id, fields.as_object().cloned().unwrap())
    }

    #[test]
    fn test_memory_store_basic_operations() {
        let store = MemoryRecordStore::new();
        store
            .write(vec![record("1", "b", false), record("2", "a", true)])
            .unwrap();

        assert_eq!(store.records_count(), 2);
        assert_eq!(store.count("article", &Predicate::True).unwrap(), 2);
        assert_eq!(store.count("feed", &Predicate::True).unwrap(), 0);

        let unread = store
            .query("article", &Predicate::eq("read", false), &[])
            .unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, "1");
    }

    #[test]
    fn test_memory_store_sorting() {
        let store = MemoryRecordStore::with_records(vec![record("1", "b", false), record("2", "a", true)]);

        let sorted = store
            .query("article", &Predicate::True, &[SortKey::ascending("title")])
            .unwrap();
        let ids: Vec<_> = sorted.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[test]
    fn test_memory_store_upsert_and_delete() {
        let store = MemoryRecordStore::new();
        store.write(vec![record("1", "old", false)]).unwrap();
        store.write(vec![record("1", "new", false)]).unwrap();

        let stored = store.get("article", "1").unwrap().unwrap();
        assert_eq!(stored.field("title"), Some(&json!("new")));

        store.delete(&stored).unwrap();
        assert_eq!(store.records_count(), 0);
        assert_eq!(
            store.delete(&stored),
            Err(Error::Database(DatabaseError::EntryNotFound))
        );
    }

    #[test]
    fn test_record_entity_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Entity {
            name: String,
            count: u32,
        }

        let entity = Entity { name: "x".to_string(), count: 3 };
        let record = Record::from_entity("entity", "e1", &entity).unwrap();
        assert_eq!(record.decode::<Entity>().unwrap(), entity);

        assert!(Record::from_entity("entity", "e2", &5).is_err());
    }

    #[test]
    fn test_snapshot_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store = MemoryRecordStore::with_records(vec![record("1", "a", false)]);
        store.save_snapshot(&path).unwrap();

        let restored = MemoryRecordStore::load_snapshot(&path).unwrap();
        assert_eq!(restored.get("article", "1").unwrap(), Some(record("1", "a", false)));
    }
}
