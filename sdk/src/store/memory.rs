use {
    super::{migration, MigrationReport, RecordId, RecordKind, SecureKeyStore, StorageRecord, StoreError, CURRENT_SCHEMA},
    std::{
        collections::BTreeMap,
        sync::{Mutex, MutexGuard, PoisonError},
    },
};

struct MemoryState {
    schema: u16,
    records: BTreeMap<RecordId, StorageRecord>,
}

/// Volatile [`SecureKeyStore`] for tests and server contexts where the
/// process itself is the trust boundary.
pub struct MemoryKeyStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::with_schema(CURRENT_SCHEMA)
    }
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store pinned at an explicit schema. Mostly useful to stage
    /// legacy data before a migration.
    pub fn with_schema(schema: u16) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                schema,
                records: BTreeMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_schema(state: &MemoryState, record: &StorageRecord) -> Result<(), StoreError> {
    if record.schema_version != state.schema {
        return Err(StoreError::MixedSchema {
            store: state.schema,
            record: record.schema_version,
        });
    }
    Ok(())
}

impl SecureKeyStore for MemoryKeyStore {
    fn put(&self, id: &RecordId, record: StorageRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        check_schema(&state, &record)?;
        state.records.insert(id.clone(), record);
        Ok(())
    }

    fn get(&self, id: &RecordId) -> Result<StorageRecord, StoreError> {
        self.lock()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
        self.lock().records.remove(id);
        Ok(())
    }

    fn take(&self, id: &RecordId) -> Result<StorageRecord, StoreError> {
        self.lock()
            .records
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn put_if_absent(&self, id: &RecordId, record: StorageRecord) -> Result<bool, StoreError> {
        let mut state = self.lock();
        check_schema(&state, &record)?;
        if state.records.contains_key(id) {
            return Ok(false);
        }
        state.records.insert(id.clone(), record);
        Ok(true)
    }

    fn list(&self, kind: RecordKind) -> Result<Vec<RecordId>, StoreError> {
        Ok(self
            .lock()
            .records
            .keys()
            .filter(|id| id.kind == kind)
            .cloned()
            .collect())
    }

    fn schema_version(&self) -> Result<u16, StoreError> {
        Ok(self.lock().schema)
    }

    fn migrate(&self, from: u16, to: u16) -> Result<MigrationReport, StoreError> {
        let mut state = self.lock();
        if state.schema == to {
            return Ok(MigrationReport::unchanged(to, state.records.len()));
        }
        if state.schema != from {
            return Err(StoreError::Migration(format!(
                "store is at schema v{}, not v{from}",
                state.schema
            )));
        }

        let snapshot = state
            .records
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        // Nothing below this line runs unless every record upgraded.
        let upgraded = migration::upgrade(from, to, snapshot)?;

        let report = MigrationReport {
            from,
            to,
            records_before: state.records.len(),
            records_after: upgraded.len(),
        };
        state.records = upgraded.into_iter().collect();
        state.schema = to;
        Ok(report)
    }
}
