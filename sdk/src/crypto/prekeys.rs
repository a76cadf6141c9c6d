//! Signed and one-time pre-key lifecycle.
//!
//! Signed pre-keys rotate: the newest is *current* and goes into bundles,
//! older ones are *superseded* and keep answering handshakes until their
//! grace window runs out. One-time pre-keys are single use; they are claimed
//! for a bundle with [`SecureKeyStore::put_if_absent`] and consumed with
//! [`SecureKeyStore::take`], so no two handshakes ever share one.

use {
    super::{
        identity::IdentityKeyManager,
        secret_bytes::{generate_static_secret, SecretBytes},
        x3dh::{encode_pk, KeyBundle},
    },
    crate::{
        config::EngineConfig,
        error::CryptoError,
        store::{get_optional, RecordId, RecordKind, SecureKeyStore, StorageRecord},
    },
    chrono::{DateTime, Utc},
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    serde_big_array::BigArray,
    std::sync::{Arc, Mutex, PoisonError},
    x25519_dalek::{PublicKey, StaticSecret},
};

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct SignedPreKeyRecord {
    pub(crate) id: u32,
    pub(crate) secret: SecretBytes,
    #[serde(with = "BigArray")]
    pub(crate) signature: [u8; 64],
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) superseded_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct OneTimePreKeyRecord {
    pub(crate) id: u32,
    pub(crate) secret: SecretBytes,
    pub(crate) created_at: DateTime<Utc>,
}

/// Marker for a handshake already answered.
#[derive(Serialize, Deserialize)]
struct AcceptedBaseKeyRecord {
    accepted_at: DateTime<Utc>,
}

/// Marker claiming a one-time pre-key for a published bundle.
#[derive(Serialize, Deserialize)]
struct AllocationRecord {
    allocated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct PreKeyCounters {
    pub(crate) next_signed_id: u32,
    pub(crate) next_one_time_id: u32,
    pub(crate) current_signed_id: Option<u32>,
}

impl Default for PreKeyCounters {
    fn default() -> Self {
        Self {
            next_signed_id: 1,
            next_one_time_id: 1,
            current_signed_id: None,
        }
    }
}

/// Public view of a signed pre-key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedPreKeyInfo {
    pub id: u32,
    pub public: PublicKey,
    pub created_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

impl From<&SignedPreKeyRecord> for SignedPreKeyInfo {
    fn from(r: &SignedPreKeyRecord) -> Self {
        Self {
            id: r.id,
            public: PublicKey::from(&r.secret.to_static_secret()),
            created_at: r.created_at,
            superseded_at: r.superseded_at,
        }
    }
}

pub struct PreKeyManager<S> {
    store: Arc<S>,
    identity: Arc<IdentityKeyManager<S>>,
    config: EngineConfig,
    // Serializes read-modify-write of the counters record.
    counters: Mutex<()>,
}

impl<S: SecureKeyStore> PreKeyManager<S> {
    pub fn new(store: Arc<S>, identity: Arc<IdentityKeyManager<S>>, config: EngineConfig) -> Self {
        Self {
            store,
            identity,
            config,
            counters: Mutex::new(()),
        }
    }

    fn load_counters(&self) -> Result<PreKeyCounters, CryptoError> {
        match get_optional(&*self.store, &RecordId::pre_key_counters())? {
            Some(record) => Ok(record.decode(RecordKind::PreKeyCounters)?),
            None => Ok(PreKeyCounters::default()),
        }
    }

    fn save_counters(&self, counters: &PreKeyCounters) -> Result<(), CryptoError> {
        self.store.put(
            &RecordId::pre_key_counters(),
            StorageRecord::encode(RecordKind::PreKeyCounters, counters)?,
        )?;
        Ok(())
    }

    fn load_signed(&self, id: u32) -> Result<SignedPreKeyRecord, CryptoError> {
        Ok(self
            .store
            .get(&RecordId::signed_pre_key(id))?
            .decode(RecordKind::SignedPreKey)?)
    }

    /// Create and sign a new signed pre-key, superseding the current one at
    /// `now`. Returns the new key id.
    pub fn generate_signed_pre_key(&self, now: DateTime<Utc>) -> Result<u32, CryptoError> {
        self.store.require_current_schema()?;
        let identity = self.identity.identity_key()?;
        let _guard = self.counters.lock().unwrap_or_else(PoisonError::into_inner);

        let mut counters = self.load_counters()?;
        let id = counters.next_signed_id;
        counters.next_signed_id = id
            .checked_add(1)
            .ok_or_else(|| CryptoError::InvalidState("signed pre-key ids exhausted".into()))?;

        let secret = generate_static_secret()?;
        let record = SignedPreKeyRecord {
            id,
            signature: identity.sign(&encode_pk(&PublicKey::from(&secret))),
            secret: SecretBytes::from(&secret),
            created_at: now,
            superseded_at: None,
        };
        self.store.put(
            &RecordId::signed_pre_key(id),
            StorageRecord::encode(RecordKind::SignedPreKey, &record)?,
        )?;

        if let Some(prev_id) = counters.current_signed_id {
            match self.load_signed(prev_id) {
                Ok(mut prev) => {
                    prev.superseded_at = Some(now);
                    self.store.put(
                        &RecordId::signed_pre_key(prev_id),
                        StorageRecord::encode(RecordKind::SignedPreKey, &prev)?,
                    )?;
                }
                Err(CryptoError::KeyNotFound(_)) => {
                    warn!("Current signed pre-key {prev_id} was missing during rotation");
                }
                Err(e) => return Err(e),
            }
        }
        counters.current_signed_id = Some(id);
        self.save_counters(&counters)?;

        info!("Generated signed pre-key {id}");
        Ok(id)
    }

    /// Delete superseded signed pre-keys whose grace window has elapsed.
    /// The current key is never purged. Returns the purged ids.
    pub fn purge_expired_signed_pre_keys(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<u32>, CryptoError> {
        let grace = self.config.signed_pre_key_grace();
        let current = self.load_counters()?.current_signed_id;
        let mut purged = Vec::new();

        for record in self.signed_records()? {
            if Some(record.id) == current {
                continue;
            }
            let Some(superseded_at) = record.superseded_at else {
                continue;
            };
            let expires = superseded_at.checked_add_signed(grace).unwrap_or(DateTime::<Utc>::MAX_UTC);
            if expires <= now {
                self.store.delete(&RecordId::signed_pre_key(record.id))?;
                self.forget_accepted_base_keys(record.id)?;
                purged.push(record.id);
            }
        }

        if !purged.is_empty() {
            info!("Purged expired signed pre-keys {purged:?}");
        }
        Ok(purged)
    }

    /// Whether a handshake with `base_key` against `signed_pre_key_id` was
    /// already accepted.
    pub fn is_base_key_accepted(
        &self,
        signed_pre_key_id: u32,
        base_key: &PublicKey,
    ) -> Result<bool, CryptoError> {
        let id = RecordId::accepted_base_key(signed_pre_key_id, base_key.as_bytes());
        Ok(get_optional(&*self.store, &id)?.is_some())
    }

    /// Remember an accepted handshake until its signed pre-key is purged.
    /// Returns `false` when the base key was already recorded.
    pub fn record_accepted_base_key(
        &self,
        signed_pre_key_id: u32,
        base_key: &PublicKey,
        now: DateTime<Utc>,
    ) -> Result<bool, CryptoError> {
        let marker = StorageRecord::encode(
            RecordKind::AcceptedBaseKey,
            &AcceptedBaseKeyRecord { accepted_at: now },
        )?;
        let id = RecordId::accepted_base_key(signed_pre_key_id, base_key.as_bytes());
        Ok(self.store.put_if_absent(&id, marker)?)
    }

    fn forget_accepted_base_keys(&self, signed_pre_key_id: u32) -> Result<(), CryptoError> {
        let prefix = format!("{signed_pre_key_id}/");
        for id in self.store.list(RecordKind::AcceptedBaseKey)? {
            if id.name.starts_with(&prefix) {
                self.store.delete(&id)?;
            }
        }
        Ok(())
    }

    fn signed_records(&self) -> Result<Vec<SignedPreKeyRecord>, CryptoError> {
        let mut records: Vec<SignedPreKeyRecord> = Vec::new();
        for id in self.store.list(RecordKind::SignedPreKey)? {
            records.push(self.store.get(&id)?.decode(RecordKind::SignedPreKey)?);
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Every stored signed pre-key, oldest first.
    pub fn signed_pre_keys(&self) -> Result<Vec<SignedPreKeyInfo>, CryptoError> {
        Ok(self.signed_records()?.iter().map(SignedPreKeyInfo::from).collect())
    }

    pub fn current_signed_pre_key(&self) -> Result<SignedPreKeyInfo, CryptoError> {
        let id = self
            .load_counters()?
            .current_signed_id
            .ok_or_else(|| CryptoError::KeyNotFound("no current signed pre-key".into()))?;
        Ok(SignedPreKeyInfo::from(&self.load_signed(id)?))
    }

    /// Secret of a current or superseded signed pre-key.
    pub fn signed_pre_key_secret(&self, id: u32) -> Result<StaticSecret, CryptoError> {
        Ok(self.load_signed(id)?.secret.to_static_secret())
    }

    /// Create `n` one-time pre-keys with fresh ids.
    pub fn generate_one_time_pre_keys(&self, n: u32) -> Result<Vec<u32>, CryptoError> {
        self.store.require_current_schema()?;
        let _guard = self.counters.lock().unwrap_or_else(PoisonError::into_inner);

        let mut counters = self.load_counters()?;
        let first = counters.next_one_time_id;
        counters.next_one_time_id = first
            .checked_add(n)
            .ok_or_else(|| CryptoError::InvalidState("one-time pre-key ids exhausted".into()))?;
        // Reserve the ids before writing keys so a crash never reuses one.
        self.save_counters(&counters)?;

        let now = Utc::now();
        let mut ids = Vec::with_capacity(n as usize);
        for id in first..first + n {
            let secret = generate_static_secret()?;
            let record = OneTimePreKeyRecord {
                id,
                secret: SecretBytes::from(&secret),
                created_at: now,
            };
            self.store.put(
                &RecordId::one_time_pre_key(id),
                StorageRecord::encode(RecordKind::OneTimePreKey, &record)?,
            )?;
            ids.push(id);
        }

        info!("Generated {n} one-time pre-keys");
        Ok(ids)
    }

    /// Atomically remove a one-time pre-key and return its secret. A second
    /// call for the same id fails with [`CryptoError::KeyNotFound`].
    pub fn consume_one_time_pre_key(&self, id: u32) -> Result<StaticSecret, CryptoError> {
        let record: OneTimePreKeyRecord = self
            .store
            .take(&RecordId::one_time_pre_key(id))?
            .decode(RecordKind::OneTimePreKey)?;
        self.store.delete(&RecordId::pre_key_allocation(id))?;
        debug!("Consumed one-time pre-key {id}");
        Ok(record.secret.to_static_secret())
    }

    /// Secret of a one-time pre-key without consuming it.
    pub fn one_time_pre_key_secret(&self, id: u32) -> Result<StaticSecret, CryptoError> {
        let record: OneTimePreKeyRecord = self
            .store
            .get(&RecordId::one_time_pre_key(id))?
            .decode(RecordKind::OneTimePreKey)?;
        Ok(record.secret.to_static_secret())
    }

    fn one_time_ids(&self) -> Result<Vec<u32>, CryptoError> {
        let mut ids: Vec<u32> = self
            .store
            .list(RecordKind::OneTimePreKey)?
            .iter()
            .filter_map(RecordId::numeric_name)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Stored one-time pre-keys, allocated or not.
    pub fn one_time_pre_key_count(&self) -> Result<usize, CryptoError> {
        Ok(self.store.list(RecordKind::OneTimePreKey)?.len())
    }

    /// One-time pre-keys not yet handed out in a bundle.
    pub fn unallocated_one_time_pre_key_count(&self) -> Result<usize, CryptoError> {
        let mut count = 0;
        for id in self.one_time_ids()? {
            if get_optional(&*self.store, &RecordId::pre_key_allocation(id))?.is_none() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn claim(&self, id: u32) -> Result<bool, CryptoError> {
        let marker = StorageRecord::encode(
            RecordKind::PreKeyAllocation,
            &AllocationRecord {
                allocated_at: Utc::now(),
            },
        )?;
        Ok(self
            .store
            .put_if_absent(&RecordId::pre_key_allocation(id), marker)?)
    }

    /// Delete every one-time pre-key that was never handed out. Keys already
    /// in a published bundle stay so in-flight handshakes still complete.
    pub fn discard_unallocated_one_time_pre_keys(&self) -> Result<usize, CryptoError> {
        let mut discarded = 0;
        for id in self.one_time_ids()? {
            // Claiming first keeps a concurrent bundle builder off this key.
            if self.claim(id)? {
                self.store.delete(&RecordId::one_time_pre_key(id))?;
                self.store.delete(&RecordId::pre_key_allocation(id))?;
                discarded += 1;
            }
        }
        warn!("Discarded {discarded} unallocated one-time pre-keys");
        Ok(discarded)
    }

    /// Public bundle for the key directory. Claims one unallocated one-time
    /// pre-key, if any is left.
    pub fn current_bundle(&self) -> Result<KeyBundle, CryptoError> {
        self.store.require_current_schema()?;
        let identity = self.identity.public_identity()?;
        let counters = self.load_counters()?;
        let spk_id = counters
            .current_signed_id
            .ok_or_else(|| CryptoError::KeyNotFound("no current signed pre-key".into()))?;
        let spk = self.load_signed(spk_id)?;

        let mut otpk = None;
        for id in self.one_time_ids()? {
            if !self.claim(id)? {
                continue;
            }
            match get_optional(&*self.store, &RecordId::one_time_pre_key(id))? {
                Some(record) => {
                    let record: OneTimePreKeyRecord = record.decode(RecordKind::OneTimePreKey)?;
                    otpk = Some((id, PublicKey::from(&record.secret.to_static_secret())));
                    break;
                }
                // Consumed between list and claim.
                None => self.store.delete(&RecordId::pre_key_allocation(id))?,
            }
        }
        if otpk.is_none() {
            warn!("One-time pre-key pool is empty, publishing bundle without one");
        }

        Ok(KeyBundle::from_parts(
            identity,
            spk_id,
            PublicKey::from(&spk.secret.to_static_secret()),
            spk.signature,
            otpk,
        ))
    }
}
