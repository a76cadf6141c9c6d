//! Single-file, AES-256-GCM sealed key store.
//!
//! The whole store lives in one file that is rewritten through a temporary
//! file and an atomic rename on every mutation, so a crash or an I/O error
//! leaves either the old or the new file and never a mix.
//!
//! ```text
//! magic "HRTHKS" | container u8 | schema u16 | count u32 |
//!   count * ( kind u8 | name len u16 | name | sealed len u32 | sealed )
//! ```
//!
//! `sealed` is `nonce || AES-256-GCM(name len u16 | name | record bytes)`.
//! Binding the record name inside the ciphertext stops an attacker with
//! write access from swapping two sealed blobs between ids.

use {
    super::{migration, MigrationReport, RecordId, RecordKind, SecureKeyStore, StorageRecord, StoreError, CURRENT_SCHEMA},
    crate::{
        secret_core::{
            error::SecretStoreError,
            traits::{KeyProvider, KeyedEncryptionAlgo},
        },
        wire::{put_var_bytes, Reader, Truncated},
    },
    aes_gcm::{
        aead::{Aead, KeyInit},
        Aes256Gcm,
        Key,
        Nonce,
    },
    log::debug,
    std::{
        collections::BTreeMap,
        fs,
        io::Write,
        marker::PhantomData,
        path::{Path, PathBuf},
        sync::{Mutex, MutexGuard, PoisonError},
    },
    tempfile::NamedTempFile,
    zeroize::Zeroizing,
};

const MAGIC: &[u8; 6] = b"HRTHKS";
const CONTAINER_VERSION: u8 = 1;
const KEY_LEN: usize = 32;

/// AES-256-GCM with a 96-bit random nonce per seal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aes256GcmAlgo;

impl KeyedEncryptionAlgo for Aes256GcmAlgo {
    type Key = Zeroizing<[u8; KEY_LEN]>;

    const NONCE_LEN: usize = 12;

    fn encrypt_with_key(
        key: &Self::Key,
        nonce: &[u8],
        pt: &[u8],
    ) -> Result<Vec<u8>, SecretStoreError> {
        if nonce.len() != Self::NONCE_LEN {
            return Err(SecretStoreError::Crypto("invalid nonce length".into()));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&**key));
        cipher
            .encrypt(Nonce::from_slice(nonce), pt)
            .map_err(|e| SecretStoreError::Crypto(format!("aes-gcm: {e}").into()))
    }

    fn decrypt_with_key(
        key: &Self::Key,
        nonce: &[u8],
        ct: &[u8],
    ) -> Result<Vec<u8>, SecretStoreError> {
        if nonce.len() != Self::NONCE_LEN {
            return Err(SecretStoreError::Crypto("invalid nonce length".into()));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&**key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|e| SecretStoreError::Crypto(format!("aes-gcm: {e}").into()))
    }
}

#[derive(Clone)]
struct FileState {
    schema: u16,
    sealed: BTreeMap<RecordId, Vec<u8>>,
}

/// [`SecureKeyStore`] persisted to a single sealed file.
pub struct FileKeyStore<A, K>
where
    A: KeyedEncryptionAlgo,
    K: KeyProvider<Key = A::Key>,
{
    path: PathBuf,
    provider: K,
    state: Mutex<FileState>,
    _algo: PhantomData<A>,
}

impl<A, K> FileKeyStore<A, K>
where
    A: KeyedEncryptionAlgo,
    K: KeyProvider<Key = A::Key>,
{
    /// Open the store at `path`, or start an empty current-schema store if
    /// the file does not exist yet. Nothing is decrypted until first use.
    pub fn open(path: impl Into<PathBuf>, provider: K) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => parse_file(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileState {
                schema: CURRENT_SCHEMA,
                sealed: BTreeMap::new(),
            },
            Err(e) => return Err(e.into()),
        };
        debug!(
            "[store] opened {} (schema v{}, {} records)",
            path.display(),
            state.schema,
            state.sealed.len()
        );
        Ok(Self {
            path,
            provider,
            state: Mutex::new(state),
            _algo: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seal(&self, key: &A::Key, id: &RecordId, record: &StorageRecord) -> Result<Vec<u8>, StoreError> {
        let mut plain = Zeroizing::new(Vec::new());
        plain.extend_from_slice(&(id.name.len() as u16).to_be_bytes());
        plain.extend_from_slice(id.name.as_bytes());
        plain.extend_from_slice(&record.to_bytes());
        Ok(A::seal(key, &plain)?)
    }

    fn unseal(&self, key: &A::Key, id: &RecordId, sealed: &[u8], schema: u16) -> Result<StorageRecord, StoreError> {
        let plain = Zeroizing::new(A::open(key, sealed)?);
        let mut reader = Reader::new(&plain);
        let name_len = reader.u16().map_err(corrupt)? as usize;
        let name = reader.bytes(name_len).map_err(corrupt)?;
        if name != id.name.as_bytes() {
            return Err(StoreError::Corrupt(format!("sealed blob under {id} names another record")));
        }
        let record = StorageRecord::from_bytes(reader.bytes(reader.remaining()).map_err(corrupt)?)?;
        if record.kind != id.kind {
            return Err(StoreError::Corrupt(format!("{id} holds a {} record", record.kind)));
        }
        if record.schema_version != schema {
            return Err(StoreError::MixedSchema {
                store: schema,
                record: record.schema_version,
            });
        }
        Ok(record)
    }

    /// Write `next` to disk and only then make it the live state.
    fn commit(&self, state: &mut FileState, next: FileState) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&render_file(&next))?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        *state = next;
        Ok(())
    }
}

fn corrupt(_: Truncated) -> StoreError {
    StoreError::Corrupt("truncated sealed record".into())
}

fn render_file(state: &FileState) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(CONTAINER_VERSION);
    out.extend_from_slice(&state.schema.to_be_bytes());
    out.extend_from_slice(&(state.sealed.len() as u32).to_be_bytes());
    for (id, sealed) in &state.sealed {
        out.push(id.kind.tag());
        out.extend_from_slice(&(id.name.len() as u16).to_be_bytes());
        out.extend_from_slice(id.name.as_bytes());
        put_var_bytes(&mut out, sealed);
    }
    out
}

fn parse_file(bytes: &[u8]) -> Result<FileState, StoreError> {
    let truncated = |_| StoreError::Corrupt("store file truncated".into());
    let mut reader = Reader::new(bytes);
    if &reader.array::<6>().map_err(truncated)? != MAGIC {
        return Err(StoreError::Corrupt("not a hearth key store".into()));
    }
    let container = reader.u8().map_err(truncated)?;
    if container != CONTAINER_VERSION {
        return Err(StoreError::UnsupportedVersion(container as u16));
    }
    let schema = reader.u16().map_err(truncated)?;
    if !super::KNOWN_SCHEMAS.contains(&schema) {
        return Err(StoreError::UnsupportedVersion(schema));
    }
    let count = reader.u32().map_err(truncated)?;
    let mut sealed = BTreeMap::new();
    for _ in 0..count {
        let tag = reader.u8().map_err(truncated)?;
        let kind = RecordKind::from_tag(tag)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown record kind {tag}")))?;
        let name_len = reader.u16().map_err(truncated)? as usize;
        let name = std::str::from_utf8(reader.bytes(name_len).map_err(truncated)?)
            .map_err(|_| StoreError::Corrupt("record name is not utf-8".into()))?;
        let blob = reader.var_bytes().map_err(truncated)?;
        sealed.insert(RecordId::new(kind, name), blob.to_vec());
    }
    if reader.remaining() != 0 {
        return Err(StoreError::Corrupt("trailing bytes after last record".into()));
    }
    Ok(FileState { schema, sealed })
}

impl<A, K> SecureKeyStore for FileKeyStore<A, K>
where
    A: KeyedEncryptionAlgo,
    K: KeyProvider<Key = A::Key>,
{
    fn put(&self, id: &RecordId, record: StorageRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        if record.schema_version != state.schema {
            return Err(StoreError::MixedSchema {
                store: state.schema,
                record: record.schema_version,
            });
        }
        let key = self.provider.key()?;
        let blob = self.seal(&key, id, &record)?;
        let mut next = state.clone();
        next.sealed.insert(id.clone(), blob);
        self.commit(&mut state, next)
    }

    fn get(&self, id: &RecordId) -> Result<StorageRecord, StoreError> {
        let state = self.lock();
        let blob = state
            .sealed
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let key = self.provider.key()?;
        self.unseal(&key, id, blob, state.schema)
    }

    fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
        let mut state = self.lock();
        if !state.sealed.contains_key(id) {
            return Ok(());
        }
        let mut next = state.clone();
        next.sealed.remove(id);
        self.commit(&mut state, next)
    }

    fn take(&self, id: &RecordId) -> Result<StorageRecord, StoreError> {
        let mut state = self.lock();
        let blob = state
            .sealed
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let key = self.provider.key()?;
        let record = self.unseal(&key, id, blob, state.schema)?;
        let mut next = state.clone();
        next.sealed.remove(id);
        self.commit(&mut state, next)?;
        Ok(record)
    }

    fn put_if_absent(&self, id: &RecordId, record: StorageRecord) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.sealed.contains_key(id) {
            return Ok(false);
        }
        if record.schema_version != state.schema {
            return Err(StoreError::MixedSchema {
                store: state.schema,
                record: record.schema_version,
            });
        }
        let key = self.provider.key()?;
        let blob = self.seal(&key, id, &record)?;
        let mut next = state.clone();
        next.sealed.insert(id.clone(), blob);
        self.commit(&mut state, next)?;
        Ok(true)
    }

    fn list(&self, kind: RecordKind) -> Result<Vec<RecordId>, StoreError> {
        Ok(self
            .lock()
            .sealed
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
            return Ok(MigrationReport::unchanged(to, state.sealed.len()));
        }
        if state.schema != from {
            return Err(StoreError::Migration(format!(
                "store is at schema v{}, not v{from}",
                state.schema
            )));
        }

        let key = self.provider.key()?;
        let mut snapshot = Vec::with_capacity(state.sealed.len());
        for (id, blob) in &state.sealed {
            let record = self
                .unseal(&key, id, blob, from)
                .map_err(|e| StoreError::Migration(format!("{id}: {e}")))?;
            snapshot.push((id.clone(), record));
        }
        let upgraded = migration::upgrade(from, to, snapshot)?;

        let mut next = FileState {
            schema: to,
            sealed: BTreeMap::new(),
        };
        for (id, record) in &upgraded {
            next.sealed.insert(id.clone(), self.seal(&key, id, record)?);
        }
        let report = MigrationReport {
            from,
            to,
            records_before: state.sealed.len(),
            records_after: next.sealed.len(),
        };
        self.commit(&mut state, next)?;
        Ok(report)
    }
}
