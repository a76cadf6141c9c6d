use {
    super::{MigrationReport, RecordId, RecordKind, SecureKeyStore, StorageRecord, StoreError},
    log::warn,
};

/// Yes/no capability checked before touching long-term identity material.
///
/// On a phone this is a biometric or device-credential prompt; servers and
/// tests satisfy it with [`AlwaysUnlocked`].
pub trait UnlockGate: Send + Sync {
    fn try_unlock(&self) -> bool;
}

/// Gate that never prompts.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysUnlocked;

impl UnlockGate for AlwaysUnlocked {
    fn try_unlock(&self) -> bool {
        true
    }
}

impl<F> UnlockGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn try_unlock(&self) -> bool {
        self()
    }
}

/// Store decorator enforcing an [`UnlockGate`] on identity records.
///
/// Every other record kind passes straight through, so ratcheting a session
/// never prompts the user.
pub struct GatedKeyStore<S, G> {
    inner: S,
    gate: G,
}

impl<S: SecureKeyStore, G: UnlockGate> GatedKeyStore<S, G> {
    pub fn new(inner: S, gate: G) -> Self {
        Self { inner, gate }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self, id: &RecordId) -> Result<(), StoreError> {
        if id.kind.requires_unlock() && !self.gate.try_unlock() {
            warn!("[store] unlock gate denied access to {id}");
            return Err(StoreError::Unauthorized(id.clone()));
        }
        Ok(())
    }
}

impl<S: SecureKeyStore, G: UnlockGate> SecureKeyStore for GatedKeyStore<S, G> {
    fn put(&self, id: &RecordId, record: StorageRecord) -> Result<(), StoreError> {
        self.check(id)?;
        self.inner.put(id, record)
    }

    fn get(&self, id: &RecordId) -> Result<StorageRecord, StoreError> {
        self.check(id)?;
        self.inner.get(id)
    }

    fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
        self.check(id)?;
        self.inner.delete(id)
    }

    fn take(&self, id: &RecordId) -> Result<StorageRecord, StoreError> {
        self.check(id)?;
        self.inner.take(id)
    }

    fn put_if_absent(&self, id: &RecordId, record: StorageRecord) -> Result<bool, StoreError> {
        self.check(id)?;
        self.inner.put_if_absent(id, record)
    }

    fn list(&self, kind: RecordKind) -> Result<Vec<RecordId>, StoreError> {
        self.inner.list(kind)
    }

    fn schema_version(&self) -> Result<u16, StoreError> {
        self.inner.schema_version()
    }

    fn migrate(&self, from: u16, to: u16) -> Result<MigrationReport, StoreError> {
        // Migration rewrites the identity record, so it needs the same unlock.
        for id in self.inner.list(RecordKind::Identity)? {
            self.check(&id)?;
        }
        self.inner.migrate(from, to)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::store::{MemoryKeyStore, CURRENT_SCHEMA},
        assert_matches::assert_matches,
        std::sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    fn secret() -> StorageRecord {
        StorageRecord::with_schema(CURRENT_SCHEMA, RecordKind::Identity, vec![7; 32])
    }

    #[test]
    fn denied_gate_blocks_identity_records() {
        let store = GatedKeyStore::new(MemoryKeyStore::new(), || false);
        assert_matches!(
            store.put(&RecordId::identity(), secret()),
            Err(StoreError::Unauthorized(_))
        );
        assert_matches!(
            store.get(&RecordId::identity()),
            Err(StoreError::Unauthorized(_))
        );
    }

    #[test]
    fn other_records_skip_the_gate() {
        let prompts = AtomicUsize::new(0);
        let store = GatedKeyStore::new(MemoryKeyStore::new(), || {
            prompts.fetch_add(1, Ordering::SeqCst);
            false
        });
        let id = RecordId::one_time_pre_key(1);
        let record = StorageRecord::with_schema(CURRENT_SCHEMA, RecordKind::OneTimePreKey, vec![1]);
        store.put(&id, record).unwrap();
        assert!(store.get(&id).is_ok());
        assert_eq!(prompts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn gate_is_consulted_on_every_access() {
        let open = AtomicBool::new(true);
        let store = GatedKeyStore::new(MemoryKeyStore::new(), || open.load(Ordering::SeqCst));
        store.put(&RecordId::identity(), secret()).unwrap();

        open.store(false, Ordering::SeqCst);
        assert_matches!(
            store.get(&RecordId::identity()),
            Err(StoreError::Unauthorized(_))
        );

        open.store(true, Ordering::SeqCst);
        assert!(store.get(&RecordId::identity()).is_ok());
    }
}
