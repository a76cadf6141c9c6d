//! Device-scoped secure key storage.
//!
//! [`SecureKeyStore`] is the single seam between the protocol engine and
//! whatever durable, at-rest-encrypted storage a platform offers. Every
//! mutable piece of cryptographic state goes through it, and it is the only
//! state shared between sessions, groups and pre-key bookkeeping.
//!
//! Two operations are atomic with respect to every other call on the same
//! store and are what the engine builds its race-freedom on:
//!
//! * [`SecureKeyStore::take`] is a compare-and-delete used to consume
//!   one-time pre-keys exactly once.
//! * [`SecureKeyStore::put_if_absent`] is used to claim a one-time pre-key
//!   for a published bundle.

mod gate;
pub mod legacy;
mod memory;
mod migration;
mod record;

#[cfg(feature = "file_store")]
mod file;

#[cfg(feature = "file_store")]
pub use file::{Aes256GcmAlgo, FileKeyStore};
pub use {
    gate::{AlwaysUnlocked, GatedKeyStore, UnlockGate},
    memory::MemoryKeyStore,
    record::{RecordId, RecordKind, StorageRecord, CURRENT_SCHEMA, KNOWN_SCHEMAS, LEGACY_SCHEMA_V1},
};
use {crate::secret_core::error::SecretStoreError, std::sync::Arc, thiserror::Error};

/// Errors surfaced by [`SecureKeyStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(RecordId),
    #[error("unsupported storage schema version {0}")]
    UnsupportedVersion(u16),
    #[error("store holds schema v{found}, migrate to v{current} before use", current = CURRENT_SCHEMA)]
    MigrationRequired { found: u16 },
    #[error("record schema v{record} does not match store schema v{store}")]
    MixedSchema { store: u16, record: u16 },
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("unlock gate denied access to {0}")]
    Unauthorized(RecordId),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Secret(#[from] SecretStoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a successful [`SecureKeyStore::migrate`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u16,
    pub to: u16,
    pub records_before: usize,
    pub records_after: usize,
}

impl MigrationReport {
    /// The store was already at `version`; nothing was rewritten.
    pub fn unchanged(version: u16, records: usize) -> Self {
        Self {
            from: version,
            to: version,
            records_before: records,
            records_after: records,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// Durable, device-scoped, at-rest-encrypted record storage.
///
/// Implementations must make every method atomic with respect to the others
/// and must never expose a partially migrated store.
pub trait SecureKeyStore: Send + Sync {
    /// Insert or overwrite a record. Records whose schema differs from the
    /// store schema are rejected with [`StoreError::MixedSchema`].
    fn put(&self, id: &RecordId, record: StorageRecord) -> Result<(), StoreError>;

    /// Fetch a record or fail with [`StoreError::NotFound`].
    fn get(&self, id: &RecordId) -> Result<StorageRecord, StoreError>;

    /// Remove a record. Removing an absent record is not an error.
    fn delete(&self, id: &RecordId) -> Result<(), StoreError>;

    /// Atomically fetch and remove a record. A second `take` of the same id
    /// fails with [`StoreError::NotFound`].
    fn take(&self, id: &RecordId) -> Result<StorageRecord, StoreError>;

    /// Insert only when no record exists under `id`. Returns whether the
    /// record was written.
    fn put_if_absent(&self, id: &RecordId, record: StorageRecord) -> Result<bool, StoreError>;

    /// All record ids of the given kind, in ascending order.
    fn list(&self, kind: RecordKind) -> Result<Vec<RecordId>, StoreError>;

    /// Schema version every record in the store is written with.
    fn schema_version(&self) -> Result<u16, StoreError>;

    /// Rewrite every record from schema `from` to schema `to`.
    ///
    /// Idempotent: a store already at `to` is left untouched. Either all
    /// records are rewritten or the store is left entirely at `from`; a
    /// failure surfaces [`StoreError::Migration`].
    fn migrate(&self, from: u16, to: u16) -> Result<MigrationReport, StoreError>;

    /// Fails with [`StoreError::MigrationRequired`] unless the store is at
    /// [`CURRENT_SCHEMA`].
    fn require_current_schema(&self) -> Result<(), StoreError> {
        match self.schema_version()? {
            CURRENT_SCHEMA => Ok(()),
            found if KNOWN_SCHEMAS.contains(&found) => Err(StoreError::MigrationRequired { found }),
            found => Err(StoreError::UnsupportedVersion(found)),
        }
    }
}

impl<S: SecureKeyStore + ?Sized> SecureKeyStore for Arc<S> {
    fn put(&self, id: &RecordId, record: StorageRecord) -> Result<(), StoreError> {
        (**self).put(id, record)
    }

    fn get(&self, id: &RecordId) -> Result<StorageRecord, StoreError> {
        (**self).get(id)
    }

    fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
        (**self).delete(id)
    }

    fn take(&self, id: &RecordId) -> Result<StorageRecord, StoreError> {
        (**self).take(id)
    }

    fn put_if_absent(&self, id: &RecordId, record: StorageRecord) -> Result<bool, StoreError> {
        (**self).put_if_absent(id, record)
    }

    fn list(&self, kind: RecordKind) -> Result<Vec<RecordId>, StoreError> {
        (**self).list(kind)
    }

    fn schema_version(&self) -> Result<u16, StoreError> {
        (**self).schema_version()
    }

    fn migrate(&self, from: u16, to: u16) -> Result<MigrationReport, StoreError> {
        (**self).migrate(from, to)
    }
}

/// Fetch a record, mapping [`StoreError::NotFound`] to `None`.
pub fn get_optional<S: SecureKeyStore + ?Sized>(
    store: &S,
    id: &RecordId,
) -> Result<Option<StorageRecord>, StoreError> {
    match store.get(id) {
        Ok(record) => Ok(Some(record)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Delete every record of `kind`. Returns how many were removed.
pub fn delete_all<S: SecureKeyStore + ?Sized>(
    store: &S,
    kind: RecordKind,
) -> Result<usize, StoreError> {
    let ids = store.list(kind)?;
    for id in &ids {
        store.delete(id)?;
    }
    Ok(ids.len())
}
