//! Long-term device identity.
//!
//! The identity secret is written to the store exactly once and lives behind
//! the unlock gate. A separate, ungated public record lets callers show the
//! identity and compute safety numbers without unlocking.

use {
    super::{
        safety_number::SafetyNumber,
        secret_bytes::{generate_static_secret, SecretBytes},
        session::SessionAddress,
        x3dh::IdentityKey,
    },
    crate::{
        error::CryptoError,
        store::{get_optional, delete_all, RecordId, RecordKind, SecureKeyStore, StorageRecord},
    },
    chrono::{DateTime, Utc},
    log::{info, warn},
    serde::{Deserialize, Serialize},
    std::sync::{Arc, PoisonError, RwLock},
    subtle::ConstantTimeEq,
    x25519_dalek::PublicKey,
};

/// Secret half of the identity, gated.
#[derive(Serialize, Deserialize)]
pub(crate) struct IdentityRecord {
    pub(crate) secret: SecretBytes,
    pub(crate) created_at: DateTime<Utc>,
}

/// Public half of the identity, readable without unlocking.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct IdentityPublicRecord {
    pub(crate) public: [u8; 32],
    pub(crate) created_at: DateTime<Utc>,
}

/// Last identity key seen for a remote device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteIdentityRecord {
    pub public: [u8; 32],
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Explicit confirmation for [`IdentityKeyManager::reset_identity`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountReset {
    /// Destroy the identity together with every session, pre-key, sender key
    /// and trusted remote identity.
    DestroyAllSessions,
}

/// Result of recording a remote identity key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityUpdate {
    New,
    Unchanged,
    /// The peer presented a different key than before. Their safety number
    /// changed.
    Changed,
}

pub struct IdentityKeyManager<S> {
    store: Arc<S>,
    public: RwLock<Option<PublicKey>>,
}

impl<S: SecureKeyStore> IdentityKeyManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            public: RwLock::new(None),
        }
    }

    /// Create the device identity. Fails with [`CryptoError::IdentityExists`]
    /// when one is already stored.
    pub fn generate_identity(&self) -> Result<PublicKey, CryptoError> {
        self.store.require_current_schema()?;
        let secret = generate_static_secret()?;
        let public = PublicKey::from(&secret);
        let now = Utc::now();

        let record = IdentityRecord {
            secret: SecretBytes::from(&secret),
            created_at: now,
        };
        let written = self.store.put_if_absent(
            &RecordId::identity(),
            StorageRecord::encode(RecordKind::Identity, &record)?,
        )?;
        if !written {
            return Err(CryptoError::IdentityExists);
        }
        self.store.put(
            &RecordId::identity_public(),
            StorageRecord::encode(
                RecordKind::IdentityPublic,
                &IdentityPublicRecord {
                    public: public.to_bytes(),
                    created_at: now,
                },
            )?,
        )?;

        *self.public.write().unwrap_or_else(PoisonError::into_inner) = Some(public);
        info!("Generated device identity {}", hex::encode(public.as_bytes()));
        Ok(public)
    }

    pub fn has_identity(&self) -> Result<bool, CryptoError> {
        Ok(get_optional(&*self.store, &RecordId::identity_public())?.is_some())
    }

    /// Public identity key. Does not touch the gated secret.
    pub fn public_identity(&self) -> Result<PublicKey, CryptoError> {
        if let Some(pk) = *self.public.read().unwrap_or_else(PoisonError::into_inner) {
            return Ok(pk);
        }
        let record: IdentityPublicRecord = self
            .store
            .get(&RecordId::identity_public())?
            .decode(RecordKind::IdentityPublic)?;
        let pk = PublicKey::from(record.public);
        *self.public.write().unwrap_or_else(PoisonError::into_inner) = Some(pk);
        Ok(pk)
    }

    /// When the identity was generated.
    pub fn created_at(&self) -> Result<DateTime<Utc>, CryptoError> {
        let record: IdentityPublicRecord = self
            .store
            .get(&RecordId::identity_public())?
            .decode(RecordKind::IdentityPublic)?;
        Ok(record.created_at)
    }

    /// Full identity key pair. Goes through the unlock gate.
    pub fn identity_key(&self) -> Result<IdentityKey, CryptoError> {
        let record: IdentityRecord = self
            .store
            .get(&RecordId::identity())?
            .decode(RecordKind::Identity)?;
        Ok(IdentityKey::from_secret(record.secret.to_static_secret()))
    }

    /// Symmetric 60 digit fingerprint of two identity keys.
    pub fn compute_safety_number(own: &PublicKey, peer: &PublicKey) -> SafetyNumber {
        SafetyNumber::compute(own, peer)
    }

    /// Safety number between this device and `peer`.
    pub fn safety_number_with(&self, peer: &PublicKey) -> Result<SafetyNumber, CryptoError> {
        Ok(SafetyNumber::compute(&self.public_identity()?, peer))
    }

    /// Wipe every piece of key material and start over with a new identity.
    pub fn reset_identity(&self, confirm: AccountReset) -> Result<PublicKey, CryptoError> {
        let AccountReset::DestroyAllSessions = confirm;
        self.store.require_current_schema()?;

        // Identity first so a gate denial leaves everything else intact.
        self.store.delete(&RecordId::identity())?;
        let mut removed = 1;
        for kind in RecordKind::ALL
            .into_iter()
            .filter(|k| *k != RecordKind::Identity)
        {
            removed += delete_all(&*self.store, kind)?;
        }
        *self.public.write().unwrap_or_else(PoisonError::into_inner) = None;
        warn!("Identity reset, {removed} records destroyed");

        self.generate_identity()
    }

    /// Record the identity key presented by `address`.
    pub fn save_remote_identity(
        &self,
        address: &SessionAddress,
        identity: &PublicKey,
    ) -> Result<IdentityUpdate, CryptoError> {
        let id = remote_identity_id(address);
        let now = Utc::now();
        let existing = match get_optional(&*self.store, &id)? {
            Some(record) => Some(record.decode::<RemoteIdentityRecord>(RecordKind::RemoteIdentity)?),
            None => None,
        };

        let (update, record) = match existing {
            Some(prev) if bool::from(prev.public.ct_eq(identity.as_bytes())) => {
                return Ok(IdentityUpdate::Unchanged);
            }
            Some(prev) => {
                warn!("Identity key of {address} changed");
                (
                    IdentityUpdate::Changed,
                    RemoteIdentityRecord {
                        public: identity.to_bytes(),
                        first_seen: prev.first_seen,
                        updated_at: now,
                    },
                )
            }
            None => (
                IdentityUpdate::New,
                RemoteIdentityRecord {
                    public: identity.to_bytes(),
                    first_seen: now,
                    updated_at: now,
                },
            ),
        };
        self.store.put(
            &id,
            StorageRecord::encode(RecordKind::RemoteIdentity, &record)?,
        )?;
        Ok(update)
    }

    pub fn remote_identity(
        &self,
        address: &SessionAddress,
    ) -> Result<Option<PublicKey>, CryptoError> {
        match get_optional(&*self.store, &remote_identity_id(address))? {
            Some(record) => {
                let record: RemoteIdentityRecord = record.decode(RecordKind::RemoteIdentity)?;
                Ok(Some(PublicKey::from(record.public)))
            }
            None => Ok(None),
        }
    }

    /// Every remote device whose identity we have recorded.
    pub fn known_peers(&self) -> Result<Vec<SessionAddress>, CryptoError> {
        Ok(self
            .store
            .list(RecordKind::RemoteIdentity)?
            .iter()
            .filter_map(|id| id.name.parse().ok())
            .collect())
    }
}

fn remote_identity_id(address: &SessionAddress) -> RecordId {
    RecordId::new(RecordKind::RemoteIdentity, address.to_string())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::store::{GatedKeyStore, MemoryKeyStore},
        assert_matches::assert_matches,
        std::sync::atomic::{AtomicBool, Ordering},
    };

    fn manager() -> IdentityKeyManager<MemoryKeyStore> {
        IdentityKeyManager::new(Arc::new(MemoryKeyStore::new()))
    }

    #[test]
    fn identity_is_written_once() {
        let ids = manager();
        let pk = ids.generate_identity().unwrap();
        assert_eq!(ids.public_identity().unwrap(), pk);
        assert_matches!(ids.generate_identity(), Err(CryptoError::IdentityExists));
        assert_eq!(ids.identity_key().unwrap().dh_public, pk);
    }

    #[test]
    fn public_identity_survives_a_fresh_manager() {
        let store = Arc::new(MemoryKeyStore::new());
        let pk = IdentityKeyManager::new(store.clone()).generate_identity().unwrap();
        assert_eq!(IdentityKeyManager::new(store).public_identity().unwrap(), pk);
    }

    #[test]
    fn missing_identity_is_key_not_found() {
        assert_matches!(manager().public_identity(), Err(CryptoError::KeyNotFound(_)));
    }

    #[test]
    fn reset_replaces_identity_and_wipes_state() {
        let ids = manager();
        let old = ids.generate_identity().unwrap();
        let peer = SessionAddress::new("bob", 1);
        ids.save_remote_identity(&peer, &old).unwrap();

        let new = ids.reset_identity(AccountReset::DestroyAllSessions).unwrap();
        assert_ne!(old, new);
        assert_eq!(ids.public_identity().unwrap(), new);
        assert_eq!(ids.remote_identity(&peer).unwrap(), None);
    }

    #[test]
    fn remote_identity_changes_are_reported() {
        let ids = manager();
        let peer = SessionAddress::new("carol", 2);
        let k1 = PublicKey::from([9u8; 32]);
        let k2 = PublicKey::from([10u8; 32]);

        assert_eq!(ids.save_remote_identity(&peer, &k1).unwrap(), IdentityUpdate::New);
        assert_eq!(ids.save_remote_identity(&peer, &k1).unwrap(), IdentityUpdate::Unchanged);
        assert_eq!(ids.save_remote_identity(&peer, &k2).unwrap(), IdentityUpdate::Changed);
        assert_eq!(ids.remote_identity(&peer).unwrap(), Some(k2));
        assert_eq!(ids.known_peers().unwrap(), vec![peer]);
    }

    #[test]
    fn locked_gate_denies_secret_but_not_public() {
        let unlocked = Arc::new(AtomicBool::new(true));
        let flag = unlocked.clone();
        let store = GatedKeyStore::new(MemoryKeyStore::new(), move || flag.load(Ordering::SeqCst));
        let ids = IdentityKeyManager::new(Arc::new(store));
        let pk = ids.generate_identity().unwrap();

        unlocked.store(false, Ordering::SeqCst);
        assert_matches!(ids.identity_key().map(|_| ()), Err(CryptoError::UnauthorizedAccess(_)));
        assert_eq!(IdentityKeyManager::new(ids.store.clone()).public_identity().unwrap(), pk);
    }

    #[test]
    fn safety_number_is_symmetric() {
        let a = manager();
        let b = manager();
        let pa = a.generate_identity().unwrap();
        let pb = b.generate_identity().unwrap();
        assert_eq!(a.safety_number_with(&pb).unwrap(), b.safety_number_with(&pa).unwrap());
    }
}
