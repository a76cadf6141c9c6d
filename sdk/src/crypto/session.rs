//! # Pairwise sessions: X3DH + Double Ratchet
//!
//! [`SessionStore`] owns every pairwise session of a device, one per remote
//! [`SessionAddress`]. Each call loads the session record, advances the
//! ratchet and writes the record back before returning, so the store always
//! holds the latest state. Calls for the same address are serialized; calls
//! for different addresses run in parallel.
//!
//! ```text
//!  (no record) ──create_session_as_initiator──► Pending ──first decrypt──► Established
//!  (no record) ──create_session_as_responder─────────────────────────────► Established
//!                         any state ──terminate / terminate_all──► Terminated
//! ```
//!
//! While a session is `Pending`, every outgoing message is wrapped in a
//! pre-key message so the responder can complete X3DH from whichever message
//! arrives first.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use chrono::Utc;
//! use hearth_sdk::{
//!     config::EngineConfig,
//!     crypto::{identity::IdentityKeyManager, prekeys::PreKeyManager, session::{SessionAddress, SessionStore}},
//!     store::MemoryKeyStore,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = |store: Arc<MemoryKeyStore>| {
//!     let ids = Arc::new(IdentityKeyManager::new(store.clone()));
//!     let pre = Arc::new(PreKeyManager::new(store.clone(), ids.clone(), EngineConfig::default()));
//!     (ids.clone(), pre.clone(), SessionStore::new(store, ids, pre, &EngineConfig::default()))
//! };
//! let (a_ids, _, alice) = device(Arc::new(MemoryKeyStore::new()));
//! let (b_ids, b_pre, bob) = device(Arc::new(MemoryKeyStore::new()));
//! a_ids.generate_identity()?;
//! b_ids.generate_identity()?;
//! b_pre.generate_signed_pre_key(Utc::now())?;
//!
//! let bob_addr = SessionAddress::new("bob", 1);
//! let alice_addr = SessionAddress::new("alice", 1);
//! alice.create_session_as_initiator(&bob_addr, &b_pre.current_bundle()?)?;
//!
//! let wire = alice.encrypt(&bob_addr, b"hi bob")?;
//! assert_eq!(bob.decrypt(&alice_addr, &wire)?, b"hi bob");
//! # Ok(()) }
//! ```

use {
    super::{
        double_ratchet::{RatchetLimits, RatchetState},
        envelope::{PreKeyEnvelope, WireMessage},
        identity::{IdentityKeyManager, IdentityUpdate},
        prekeys::PreKeyManager,
        x3dh::{initiator_agree, responder_agree, HandshakeHeader, KeyBundle},
    },
    crate::{
        config::EngineConfig,
        error::CryptoError,
        store::{get_optional, RecordId, RecordKind, SecureKeyStore, StorageRecord},
    },
    chrono::{DateTime, Utc},
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{
        collections::HashMap,
        fmt,
        str::FromStr,
        sync::{Arc, Mutex, PoisonError},
    },
    subtle::ConstantTimeEq,
    x25519_dalek::PublicKey,
};

/// Remote device a session talks to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionAddress {
    pub user_id: String,
    pub device_id: u32,
}

impl SessionAddress {
    pub fn new(user_id: impl Into<String>, device_id: u32) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
        }
    }
}

/// `user_id.device_id`
impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}

impl FromStr for SessionAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, device) = s
            .rsplit_once('.')
            .ok_or_else(|| format!("expected <user>.<device>, got '{s}'"))?;
        if user.is_empty() {
            return Err(format!("empty user id in '{s}'"));
        }
        let device_id = device
            .parse()
            .map_err(|_| format!("invalid device id in '{s}'"))?;
        Ok(Self::new(user, device_id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session record exists.
    Uninitialized,
    /// Initiated, no reply received yet.
    Pending,
    Established,
    /// Needs a new handshake before it can be used again.
    Terminated,
}

/// X3DH parameters repeated in every message of a pending session.
#[derive(Clone, Serialize, Deserialize)]
struct PendingPreKey {
    base_key: [u8; 32],
    signed_pre_key_id: u32,
    one_time_pre_key_id: Option<u32>,
}

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    state: SessionState,
    local_identity: [u8; 32],
    remote_identity: [u8; 32],
    ratchet: RatchetState,
    pending_pre_key: Option<PendingPreKey>,
    accepted_base_key: Option<[u8; 32]>,
    created_at: DateTime<Utc>,
}

impl SessionRecord {
    /// `min(IK_A, IK_B) || max(IK_A, IK_B)`, identical for both peers.
    fn associated_data(&self) -> Vec<u8> {
        let (first, second) = if self.local_identity < self.remote_identity {
            (&self.local_identity, &self.remote_identity)
        } else {
            (&self.remote_identity, &self.local_identity)
        };
        let mut ad = Vec::with_capacity(64);
        ad.extend_from_slice(first);
        ad.extend_from_slice(second);
        ad
    }
}

/// Summary of a stored session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub address: SessionAddress,
    pub state: SessionState,
    pub remote_identity: PublicKey,
    pub created_at: DateTime<Utc>,
}

pub struct SessionStore<S> {
    store: Arc<S>,
    identity: Arc<IdentityKeyManager<S>>,
    prekeys: Arc<PreKeyManager<S>>,
    limits: RatchetLimits,
    locks: Mutex<HashMap<SessionAddress, Arc<Mutex<()>>>>,
}

fn session_id(address: &SessionAddress) -> RecordId {
    RecordId::new(RecordKind::Session, address.to_string())
}

impl<S: SecureKeyStore> SessionStore<S> {
    pub fn new(
        store: Arc<S>,
        identity: Arc<IdentityKeyManager<S>>,
        prekeys: Arc<PreKeyManager<S>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            identity,
            prekeys,
            limits: RatchetLimits::from(config),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, address: &SessionAddress) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address.clone())
            .or_default()
            .clone()
    }

    fn load(&self, address: &SessionAddress) -> Result<Option<SessionRecord>, CryptoError> {
        match get_optional(&*self.store, &session_id(address))? {
            Some(record) => Ok(Some(record.decode(RecordKind::Session)?)),
            None => Ok(None),
        }
    }

    fn load_required(&self, address: &SessionAddress) -> Result<SessionRecord, CryptoError> {
        self.load(address)?
            .ok_or_else(|| CryptoError::KeyNotFound(format!("no session with {address}")))
    }

    fn save(&self, address: &SessionAddress, record: &SessionRecord) -> Result<(), CryptoError> {
        self.store.put(
            &session_id(address),
            StorageRecord::encode(RecordKind::Session, record)?,
        )?;
        Ok(())
    }

    // === Session establishment ===

    /// Run X3DH against `bundle` and store a `Pending` session for
    /// `address`, replacing any previous one.
    ///
    /// Returns how the bundle's identity key compares to the one previously
    /// recorded for this address.
    pub fn create_session_as_initiator(
        &self,
        address: &SessionAddress,
        bundle: &KeyBundle,
    ) -> Result<IdentityUpdate, CryptoError> {
        self.store.require_current_schema()?;
        let lock = self.lock_for(address);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let identity = self.identity.identity_key()?;
        let (header, sk) = initiator_agree(&identity, bundle)?;
        let ratchet = RatchetState::init_initiator(&sk, bundle.spk_pub, self.limits)?;

        let update = self
            .identity
            .save_remote_identity(address, &bundle.identity_pk)?;
        let record = SessionRecord {
            state: SessionState::Pending,
            local_identity: identity.dh_public.to_bytes(),
            remote_identity: bundle.identity_pk.to_bytes(),
            ratchet,
            pending_pre_key: Some(PendingPreKey {
                base_key: header.base_key.to_bytes(),
                signed_pre_key_id: header.spk_id,
                one_time_pre_key_id: header.otpk_id,
            }),
            accepted_base_key: None,
            created_at: Utc::now(),
        };
        self.save(address, &record)?;

        info!("Initiated session with {address}");
        Ok(update)
    }

    /// Accept a pre-key message from `address`: complete X3DH with the
    /// referenced pre-keys, consume the one-time pre-key and decrypt the
    /// embedded message. The new session is `Established`.
    ///
    /// A retransmission carrying the base key of the live session is
    /// decrypted through that session instead. Any other base key that was
    /// accepted before is refused with [`CryptoError::DuplicateMessage`],
    /// even after the session was replaced or terminated.
    pub fn create_session_as_responder(
        &self,
        address: &SessionAddress,
        message: &PreKeyEnvelope,
    ) -> Result<(Vec<u8>, IdentityUpdate), CryptoError> {
        self.store.require_current_schema()?;
        let lock = self.lock_for(address);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(mut existing) = self.load(address)? {
            let same_handshake = existing.state != SessionState::Terminated
                && existing
                    .accepted_base_key
                    .is_some_and(|k| bool::from(k.ct_eq(message.base_key.as_bytes())));
            if same_handshake {
                debug!("Pre-key message from {address} matches the existing session");
                let ad = existing.associated_data();
                let plaintext = existing.ratchet.decrypt(&message.message, &ad)?;
                self.save(address, &existing)?;
                return Ok((plaintext, IdentityUpdate::Unchanged));
            }
        }

        let duplicate = || CryptoError::DuplicateMessage {
            counter: message.message.counter,
        };
        if self
            .prekeys
            .is_base_key_accepted(message.signed_pre_key_id, &message.base_key)?
        {
            warn!("Replayed pre-key message from {address}");
            return Err(duplicate());
        }

        let header = HandshakeHeader {
            identity: message.identity_key,
            base_key: message.base_key,
            spk_id: message.signed_pre_key_id,
            otpk_id: message.one_time_pre_key_id,
        };
        let spk = self.prekeys.signed_pre_key_secret(header.spk_id)?;
        let otpk = match header.otpk_id {
            Some(id) => Some(self.prekeys.one_time_pre_key_secret(id)?),
            None => None,
        };

        let identity = self.identity.identity_key()?;
        let sk = responder_agree(&identity, &spk, otpk.as_ref(), &header)?;
        let mut record = SessionRecord {
            state: SessionState::Established,
            local_identity: identity.dh_public.to_bytes(),
            remote_identity: header.identity.to_bytes(),
            ratchet: RatchetState::init_responder(&sk, spk, self.limits),
            pending_pre_key: None,
            accepted_base_key: Some(header.base_key.to_bytes()),
            created_at: Utc::now(),
        };
        let ad = record.associated_data();
        let plaintext = record.ratchet.decrypt(&message.message, &ad)?;

        // Only an authenticated handshake may burn the one-time pre-key.
        if !self
            .prekeys
            .record_accepted_base_key(header.spk_id, &header.base_key, Utc::now())?
        {
            return Err(duplicate());
        }
        if let Some(id) = header.otpk_id {
            self.prekeys.consume_one_time_pre_key(id)?;
        }
        let update = self.identity.save_remote_identity(address, &header.identity)?;
        self.save(address, &record)?;

        info!("Accepted session from {address}");
        Ok((plaintext, update))
    }

    // === Messaging ===

    /// Encrypt `plaintext` for `address` and return the encoded wire message.
    pub fn encrypt(&self, address: &SessionAddress, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.store.require_current_schema()?;
        let lock = self.lock_for(address);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut record = self.load_required(address)?;
        if record.state == SessionState::Terminated {
            return Err(CryptoError::SessionTerminated(address.to_string()));
        }
        let ad = record.associated_data();
        let envelope = record.ratchet.encrypt(plaintext, &ad)?;

        let wire = match &record.pending_pre_key {
            Some(pending) => WireMessage::PreKey(PreKeyEnvelope {
                identity_key: PublicKey::from(record.local_identity),
                base_key: PublicKey::from(pending.base_key),
                signed_pre_key_id: pending.signed_pre_key_id,
                one_time_pre_key_id: pending.one_time_pre_key_id,
                message: envelope,
            }),
            None => WireMessage::Ratchet(envelope),
        };
        self.save(address, &record)?;
        Ok(wire.encode())
    }

    /// Decrypt a wire message from `address`. Pre-key messages establish (or
    /// reuse) a responder session.
    pub fn decrypt(&self, address: &SessionAddress, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let envelope = match WireMessage::decode(bytes)? {
            WireMessage::PreKey(msg) => {
                return self
                    .create_session_as_responder(address, &msg)
                    .map(|(plaintext, _)| plaintext);
            }
            WireMessage::Ratchet(envelope) => envelope,
            other => {
                return Err(CryptoError::Malformed(format!(
                    "message type {:#04x} is not a pairwise message",
                    other.type_tag()
                )))
            }
        };

        self.store.require_current_schema()?;
        let lock = self.lock_for(address);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut record = self.load_required(address)?;
        if record.state == SessionState::Terminated {
            return Err(CryptoError::SessionTerminated(address.to_string()));
        }
        let ad = record.associated_data();
        let plaintext = match record.ratchet.decrypt(&envelope, &ad) {
            Ok(pt) => pt,
            Err(e) => {
                warn!("Rejected message from {address}: {e}");
                return Err(e.into());
            }
        };
        if record.state == SessionState::Pending {
            record.state = SessionState::Established;
            record.pending_pre_key = None;
            debug!("Session with {address} established");
        }
        self.save(address, &record)?;
        Ok(plaintext)
    }

    // === Lifecycle ===

    pub fn session_state(&self, address: &SessionAddress) -> Result<SessionState, CryptoError> {
        Ok(self
            .load(address)?
            .map_or(SessionState::Uninitialized, |r| r.state))
    }

    pub fn session_info(&self, address: &SessionAddress) -> Result<Option<SessionInfo>, CryptoError> {
        Ok(self.load(address)?.map(|r| SessionInfo {
            address: address.clone(),
            state: r.state,
            remote_identity: PublicKey::from(r.remote_identity),
            created_at: r.created_at,
        }))
    }

    /// Every address with a stored session.
    pub fn sessions(&self) -> Result<Vec<SessionAddress>, CryptoError> {
        Ok(self
            .store
            .list(RecordKind::Session)?
            .iter()
            .filter_map(|id| id.name.parse().ok())
            .collect())
    }

    /// Require a new handshake before `address` can be used again.
    pub fn terminate(&self, address: &SessionAddress) -> Result<(), CryptoError> {
        let lock = self.lock_for(address);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut record = self.load_required(address)?;
        if record.state != SessionState::Terminated {
            record.state = SessionState::Terminated;
            record.pending_pre_key = None;
            self.save(address, &record)?;
            info!("Terminated session with {address}");
        }
        Ok(())
    }

    /// Terminate every live session. Returns the addresses that were
    /// affected.
    pub fn terminate_all(&self) -> Result<Vec<SessionAddress>, CryptoError> {
        let mut affected = Vec::new();
        for address in self.sessions()? {
            let lock = self.lock_for(&address);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            let Some(mut record) = self.load(&address)? else {
                continue;
            };
            if record.state == SessionState::Terminated {
                continue;
            }
            record.state = SessionState::Terminated;
            record.pending_pre_key = None;
            self.save(&address, &record)?;
            affected.push(address);
        }
        warn!("Terminated {} sessions", affected.len());
        Ok(affected)
    }

    pub fn delete_session(&self, address: &SessionAddress) -> Result<(), CryptoError> {
        let lock = self.lock_for(address);
        let deleted = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.store.delete(&session_id(address))
        };

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Held only by the map and this call, so nobody is waiting on it.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(address);
        }
        deleted?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{crypto::envelope::RatchetEnvelope, store::MemoryKeyStore},
        assert_matches::assert_matches,
    };

    struct Device {
        ids: Arc<IdentityKeyManager<MemoryKeyStore>>,
        pre: Arc<PreKeyManager<MemoryKeyStore>>,
        sessions: SessionStore<MemoryKeyStore>,
    }

    fn device() -> Device {
        let store = Arc::new(MemoryKeyStore::new());
        let config = EngineConfig::default();
        let ids = Arc::new(IdentityKeyManager::new(store.clone()));
        ids.generate_identity().unwrap();
        let pre = Arc::new(PreKeyManager::new(store.clone(), ids.clone(), config.clone()));
        pre.generate_signed_pre_key(Utc::now()).unwrap();
        pre.generate_one_time_pre_keys(5).unwrap();
        let sessions = SessionStore::new(store, ids.clone(), pre.clone(), &config);
        Device { ids, pre, sessions }
    }

    fn addrs() -> (SessionAddress, SessionAddress) {
        (SessionAddress::new("alice", 1), SessionAddress::new("bob", 1))
    }

    #[test]
    fn address_display_and_parse() {
        let addr = SessionAddress::new("grand.ma", 3);
        assert_eq!(addr.to_string(), "grand.ma.3");
        assert_eq!("grand.ma.3".parse::<SessionAddress>().unwrap(), addr);
        assert!("nodevice".parse::<SessionAddress>().is_err());
        assert!(".4".parse::<SessionAddress>().is_err());
    }

    #[test]
    fn pending_until_first_reply() {
        let (alice, bob) = (device(), device());
        let (a_addr, b_addr) = addrs();

        assert_eq!(alice.sessions.session_state(&b_addr).unwrap(), SessionState::Uninitialized);
        let update = alice
            .sessions
            .create_session_as_initiator(&b_addr, &bob.pre.current_bundle().unwrap())
            .unwrap();
        assert_eq!(update, IdentityUpdate::New);
        assert_eq!(alice.sessions.session_state(&b_addr).unwrap(), SessionState::Pending);

        let m1 = alice.sessions.encrypt(&b_addr, b"one").unwrap();
        let m2 = alice.sessions.encrypt(&b_addr, b"two").unwrap();
        assert_matches!(WireMessage::decode(&m2).unwrap(), WireMessage::PreKey(_));

        assert_eq!(bob.sessions.decrypt(&a_addr, &m1).unwrap(), b"one");
        assert_eq!(bob.sessions.session_state(&a_addr).unwrap(), SessionState::Established);
        // Second pre-key message reuses the session.
        assert_eq!(bob.sessions.decrypt(&a_addr, &m2).unwrap(), b"two");

        let reply = bob.sessions.encrypt(&a_addr, b"three").unwrap();
        assert_matches!(WireMessage::decode(&reply).unwrap(), WireMessage::Ratchet(_));
        assert_eq!(alice.sessions.decrypt(&b_addr, &reply).unwrap(), b"three");
        assert_eq!(alice.sessions.session_state(&b_addr).unwrap(), SessionState::Established);

        let m4 = alice.sessions.encrypt(&b_addr, b"four").unwrap();
        assert_matches!(WireMessage::decode(&m4).unwrap(), WireMessage::Ratchet(_));
        assert_eq!(bob.sessions.decrypt(&a_addr, &m4).unwrap(), b"four");
    }

    #[test]
    fn one_time_pre_key_is_consumed() {
        let (alice, bob) = (device(), device());
        let (a_addr, b_addr) = addrs();
        let bundle = bob.pre.current_bundle().unwrap();
        let otpk = bundle.otpk_id.unwrap();

        alice.sessions.create_session_as_initiator(&b_addr, &bundle).unwrap();
        let m = alice.sessions.encrypt(&b_addr, b"hi").unwrap();
        bob.sessions.decrypt(&a_addr, &m).unwrap();
        assert_matches!(
            bob.pre.one_time_pre_key_secret(otpk).map(|_| ()),
            Err(CryptoError::KeyNotFound(_))
        );
    }

    #[test]
    fn forged_pre_key_message_keeps_one_time_key() {
        let (alice, bob) = (device(), device());
        let (a_addr, b_addr) = addrs();
        let bundle = bob.pre.current_bundle().unwrap();
        let otpk = bundle.otpk_id.unwrap();

        alice.sessions.create_session_as_initiator(&b_addr, &bundle).unwrap();
        let m = alice.sessions.encrypt(&b_addr, b"hi").unwrap();
        let WireMessage::PreKey(mut msg) = WireMessage::decode(&m).unwrap() else {
            panic!("expected a pre-key message");
        };
        msg.message.ciphertext[0] ^= 1;

        assert_matches!(
            bob.sessions.create_session_as_responder(&a_addr, &msg),
            Err(CryptoError::DecryptionFailed)
        );
        assert!(bob.pre.one_time_pre_key_secret(otpk).is_ok());
        assert_eq!(bob.sessions.session_state(&a_addr).unwrap(), SessionState::Uninitialized);
    }

    #[test]
    fn terminated_session_refuses_traffic() {
        let (alice, bob) = (device(), device());
        let (_, b_addr) = addrs();
        alice
            .sessions
            .create_session_as_initiator(&b_addr, &bob.pre.current_bundle().unwrap())
            .unwrap();

        alice.sessions.terminate(&b_addr).unwrap();
        assert_matches!(
            alice.sessions.encrypt(&b_addr, b"x"),
            Err(CryptoError::SessionTerminated(_))
        );
        assert!(alice.sessions.terminate_all().unwrap().is_empty());
    }

    #[test]
    fn terminate_all_reports_live_sessions() {
        let alice = device();
        let (bob, carol) = (device(), device());
        let b_addr = SessionAddress::new("bob", 1);
        let c_addr = SessionAddress::new("carol", 7);
        alice
            .sessions
            .create_session_as_initiator(&b_addr, &bob.pre.current_bundle().unwrap())
            .unwrap();
        alice
            .sessions
            .create_session_as_initiator(&c_addr, &carol.pre.current_bundle().unwrap())
            .unwrap();

        let mut affected = alice.sessions.terminate_all().unwrap();
        affected.sort();
        assert_eq!(affected, vec![b_addr.clone(), c_addr]);
        assert_eq!(alice.sessions.session_state(&b_addr).unwrap(), SessionState::Terminated);
    }

    #[test]
    fn missing_session_is_key_not_found() {
        let alice = device();
        let (_, b_addr) = addrs();
        assert_matches!(alice.sessions.encrypt(&b_addr, b"x"), Err(CryptoError::KeyNotFound(_)));

        let stray = RatchetEnvelope {
            ratchet_key: PublicKey::from([3u8; 32]),
            counter: 0,
            previous_chain_length: 0,
            ciphertext: vec![],
            tag: [0; 16],
        };
        assert_matches!(
            alice.sessions.decrypt(&b_addr, &stray.encode()),
            Err(CryptoError::KeyNotFound(_))
        );
    }

    #[test]
    fn session_survives_a_new_session_store() {
        let (alice, bob) = (device(), device());
        let (a_addr, b_addr) = addrs();
        alice
            .sessions
            .create_session_as_initiator(&b_addr, &bob.pre.current_bundle().unwrap())
            .unwrap();
        let m = alice.sessions.encrypt(&b_addr, b"persisted").unwrap();

        let reopened = SessionStore::new(
            bob.sessions.store.clone(),
            bob.ids.clone(),
            bob.pre.clone(),
            &EngineConfig::default(),
        );
        assert_eq!(reopened.decrypt(&a_addr, &m).unwrap(), b"persisted");
        let info = reopened.session_info(&a_addr).unwrap().unwrap();
        assert_eq!(info.remote_identity, alice.ids.public_identity().unwrap());
    }

    #[test]
    fn delete_session_drops_its_lock() {
        let (alice, bob) = (device(), device());
        let (_, b_addr) = addrs();
        alice
            .sessions
            .create_session_as_initiator(&b_addr, &bob.pre.current_bundle().unwrap())
            .unwrap();
        assert!(alice.sessions.locks.lock().unwrap().contains_key(&b_addr));

        alice.sessions.delete_session(&b_addr).unwrap();
        assert!(alice.sessions.locks.lock().unwrap().is_empty());
        assert_eq!(alice.sessions.session_state(&b_addr).unwrap(), SessionState::Uninitialized);
    }

    #[test]
    fn purged_signed_pre_key_rejects_handshake() {
        let (alice, bob) = (device(), device());
        let (a_addr, b_addr) = addrs();
        let bundle = bob.pre.current_bundle().unwrap();
        alice.sessions.create_session_as_initiator(&b_addr, &bundle).unwrap();
        let m = alice.sessions.encrypt(&b_addr, b"late").unwrap();

        let t0 = Utc::now();
        bob.pre.generate_signed_pre_key(t0).unwrap();
        bob.pre
            .purge_expired_signed_pre_keys(t0 + chrono::TimeDelta::days(3))
            .unwrap();
        assert_matches!(bob.sessions.decrypt(&a_addr, &m), Err(CryptoError::KeyNotFound(_)));
    }
}
