//! Group messaging with sender keys.
//!
//! Every member device owns one sender key per group: a symmetric chain plus
//! an XEdDSA signing key. The chain and the signing public key travel to the
//! other members once, inside a [`SenderKeyDistributionMessage`] sent over
//! each pairwise session. After that a group message is encrypted once and
//! fanned out as the same ciphertext to everybody.
//!
//! # Security Properties
//!
//! - Forward secrecy within a chain: chain keys only move forward and are
//!   overwritten after each step.
//! - Sender authentication: every message is signed by the sender's signing
//!   key; members cannot forge messages for each other.
//! - Membership changes re-key the whole group through
//!   [`GroupCipher::on_membership_changed`].

use {
    super::{
        envelope::{SenderKeyDistributionMessage, SenderKeyMessage},
        message_keys,
        secret_bytes::{generate_static_secret, SecretBytes},
        session::SessionAddress,
        x3dh::verify_signature,
    },
    crate::{
        config::EngineConfig,
        error::CryptoError,
        store::{get_optional, RecordId, RecordKind, SecureKeyStore, StorageRecord},
    },
    chrono::{DateTime, Utc},
    hmac::{Hmac, Mac},
    log::{debug, info, warn},
    rand::rngs::OsRng,
    rand_core::RngCore,
    serde::{Deserialize, Serialize},
    sha2::Sha256,
    std::{
        collections::HashMap,
        sync::{Arc, Mutex, PoisonError},
    },
    x25519_dalek::PublicKey,
    xeddsa::{xed25519::PrivateKey as XEdPrivate, Sign},
    zeroize::{Zeroize, Zeroizing},
};

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// Sender name of this device's own keys.
const LOCAL_SENDER: &str = "local";

#[derive(Clone, Serialize, Deserialize)]
struct SenderKeyRecord {
    key_id: u32,
    chain_key: SecretBytes,
    /// Next iteration to send, or the next one expected.
    iteration: u32,
    signing_public: [u8; 32],
    /// Present only for this device's own sender keys.
    signing_secret: Option<SecretBytes>,
    /// Message keys of iterations that have not arrived yet, oldest first.
    skipped: Vec<(u32, SecretBytes)>,
    created_at: DateTime<Utc>,
}

impl SenderKeyRecord {
    fn derive(ck: &[u8; 32], label: &[u8]) -> Result<[u8; 32], CryptoError> {
        let mut mac = HmacSha256::new_from_slice(ck)
            .map_err(|_| CryptoError::InvalidState("sender chain key rejected".into()))?;
        mac.update(label);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }

    /// Message key of the current iteration; moves the chain one step.
    fn advance(&mut self) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let next = self
            .iteration
            .checked_add(1)
            .ok_or_else(|| CryptoError::InvalidState("sender key iteration overflow".into()))?;
        let mk = Zeroizing::new(Self::derive(&self.chain_key.0, MESSAGE_LABEL)?);
        let mut ck = Self::derive(&self.chain_key.0, CHAIN_LABEL)?;
        self.chain_key.0.zeroize();
        self.chain_key = SecretBytes(ck);
        ck.zeroize();
        self.iteration = next;
        Ok(mk)
    }

    /// Message key for `target`, caching the keys of skipped iterations.
    fn advance_to(
        &mut self,
        target: u32,
        limits: &GroupLimits,
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        if target < self.iteration {
            let pos = self
                .skipped
                .iter()
                .position(|(i, _)| *i == target)
                .ok_or(CryptoError::DuplicateMessage { counter: target })?;
            let (_, mk) = self.skipped.remove(pos);
            return Ok(Zeroizing::new(mk.0));
        }

        let requested = target - self.iteration;
        if requested > limits.max_skip {
            return Err(CryptoError::MaxSkippedMessagesExceeded {
                requested,
                limit: limits.max_skip,
            });
        }
        while self.iteration < target {
            let at = self.iteration;
            let mk = self.advance()?;
            self.skipped.push((at, SecretBytes(*mk)));
            if self.skipped.len() > limits.max_skipped_keys {
                self.skipped.remove(0);
            }
        }
        self.advance()
    }
}

#[derive(Clone, Copy, Debug)]
struct GroupLimits {
    max_skip: u32,
    max_skipped_keys: usize,
}

/// `<len>:<group>/<sender>`, unambiguous for any group id.
fn record_name(group_id: &str, sender: &str) -> String {
    format!("{}{sender}", group_prefix(group_id))
}

fn group_prefix(group_id: &str) -> String {
    format!("{}:{group_id}/", group_id.len())
}

type LockKey = (String, String);

pub struct GroupCipher<S> {
    store: Arc<S>,
    limits: GroupLimits,
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl<S: SecureKeyStore> GroupCipher<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        Self {
            store,
            limits: GroupLimits {
                max_skip: config.max_skip,
                max_skipped_keys: config.max_skipped_keys,
            },
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, group_id: &str, sender: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((group_id.to_owned(), sender.to_owned()))
            .or_default()
            .clone()
    }

    fn record_id(group_id: &str, sender: &str) -> RecordId {
        RecordId::new(RecordKind::SenderKey, record_name(group_id, sender))
    }

    fn load(&self, group_id: &str, sender: &str) -> Result<Option<SenderKeyRecord>, CryptoError> {
        match get_optional(&*self.store, &Self::record_id(group_id, sender))? {
            Some(record) => Ok(Some(record.decode(RecordKind::SenderKey)?)),
            None => Ok(None),
        }
    }

    fn save(&self, group_id: &str, sender: &str, record: &SenderKeyRecord) -> Result<(), CryptoError> {
        self.store.put(
            &Self::record_id(group_id, sender),
            StorageRecord::encode(RecordKind::SenderKey, record)?,
        )?;
        Ok(())
    }

    fn distribution(group_id: &str, record: &SenderKeyRecord) -> Result<SenderKeyDistributionMessage, CryptoError> {
        let secret = record
            .signing_secret
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidState("not a local sender key".into()))?;
        let mut msg = SenderKeyDistributionMessage {
            group_id: group_id.to_owned(),
            key_id: record.key_id,
            iteration: record.iteration,
            chain_key: Zeroizing::new(record.chain_key.0),
            signing_key: PublicKey::from(record.signing_public),
            signature: [0u8; 64],
        };
        msg.signature = XEdPrivate::from(&secret.to_static_secret()).sign(&msg.signed_bytes(), OsRng);
        Ok(msg)
    }

    /// Create a fresh local sender key for `group_id`, replacing any previous
    /// one, and return the distribution message for the other members.
    pub fn create_sender_key(&self, group_id: &str) -> Result<SenderKeyDistributionMessage, CryptoError> {
        self.store.require_current_schema()?;
        if group_id.is_empty() || group_id.len() > usize::from(u16::MAX) {
            return Err(CryptoError::InvalidState(format!(
                "group id must be 1 to {} bytes",
                u16::MAX
            )));
        }
        let lock = self.lock_for(group_id, LOCAL_SENDER);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = self.load(group_id, LOCAL_SENDER)?.map(|r| r.key_id);
        let key_id = loop {
            let mut raw = [0u8; 4];
            OsRng.try_fill_bytes(&mut raw)?;
            let id = u32::from_be_bytes(raw);
            if Some(id) != previous {
                break id;
            }
        };
        let signing = generate_static_secret()?;
        let record = SenderKeyRecord {
            key_id,
            chain_key: SecretBytes::generate()?,
            iteration: 0,
            signing_public: PublicKey::from(&signing).to_bytes(),
            signing_secret: Some(SecretBytes::from(&signing)),
            skipped: Vec::new(),
            created_at: Utc::now(),
        };
        self.save(group_id, LOCAL_SENDER, &record)?;

        info!("Created sender key {key_id} for group {group_id}");
        Self::distribution(group_id, &record)
    }

    /// Distribution message for the current local sender key, e.g. for a
    /// member whose pairwise session was re-established.
    pub fn current_distribution_message(
        &self,
        group_id: &str,
    ) -> Result<SenderKeyDistributionMessage, CryptoError> {
        let record = self
            .load(group_id, LOCAL_SENDER)?
            .ok_or_else(|| CryptoError::KeyNotFound(format!("no sender key for group {group_id}")))?;
        Self::distribution(group_id, &record)
    }

    /// Encrypt `plaintext` for every member of `group_id` that holds our
    /// sender key.
    pub fn encrypt_group_message(&self, group_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.store.require_current_schema()?;
        let lock = self.lock_for(group_id, LOCAL_SENDER);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut record = self
            .load(group_id, LOCAL_SENDER)?
            .ok_or_else(|| CryptoError::KeyNotFound(format!("no sender key for group {group_id}")))?;
        let signing = record
            .signing_secret
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidState("local sender key has no signing key".into()))?
            .to_static_secret();

        let iteration = record.iteration;
        let mk = record.advance()?;
        let (ciphertext, tag) = message_keys::seal(
            &mk,
            &group_ad(group_id, record.key_id, iteration),
            plaintext,
        )?;
        let mut msg = SenderKeyMessage {
            key_id: record.key_id,
            iteration,
            ciphertext,
            tag,
            signature: [0u8; 64],
        };
        msg.signature = XEdPrivate::from(&signing).sign(&msg.signed_bytes(), OsRng);

        self.save(group_id, LOCAL_SENDER, &record)?;
        Ok(msg.encode())
    }

    /// Install the sender key `sender` distributed for a group.
    ///
    /// Returns `false` when the key id is already installed; an existing
    /// chain is never rewound.
    pub fn process_distribution_message(
        &self,
        sender: &SessionAddress,
        msg: &SenderKeyDistributionMessage,
    ) -> Result<bool, CryptoError> {
        self.store.require_current_schema()?;
        if !verify_signature(&msg.signing_key, &msg.signed_bytes(), &msg.signature) {
            warn!("Rejected sender key distribution from {sender}: bad signature");
            return Err(CryptoError::DecryptionFailed);
        }
        let sender_name = sender.to_string();
        let lock = self.lock_for(&msg.group_id, &sender_name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = self.load(&msg.group_id, &sender_name)? {
            if existing.key_id == msg.key_id {
                debug!("Sender key {} of {sender} already installed", msg.key_id);
                return Ok(false);
            }
        }
        let record = SenderKeyRecord {
            key_id: msg.key_id,
            chain_key: SecretBytes(*msg.chain_key),
            iteration: msg.iteration,
            signing_public: msg.signing_key.to_bytes(),
            signing_secret: None,
            skipped: Vec::new(),
            created_at: Utc::now(),
        };
        self.save(&msg.group_id, &sender_name, &record)?;

        info!("Installed sender key {} of {sender} for group {}", msg.key_id, msg.group_id);
        Ok(true)
    }

    /// Verify and decrypt a group message from `sender`.
    pub fn decrypt_group_message(
        &self,
        group_id: &str,
        sender: &SessionAddress,
        bytes: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.store.require_current_schema()?;
        let msg = SenderKeyMessage::decode(bytes)?;
        let sender_name = sender.to_string();
        let lock = self.lock_for(group_id, &sender_name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut record = self.load(group_id, &sender_name)?.ok_or_else(|| {
            CryptoError::KeyNotFound(format!("no sender key of {sender} for group {group_id}"))
        })?;
        if record.key_id != msg.key_id {
            return Err(CryptoError::KeyNotFound(format!(
                "sender key {} of {sender} for group {group_id}",
                msg.key_id
            )));
        }
        let signer = PublicKey::from(record.signing_public);
        if !verify_signature(&signer, &msg.signed_bytes(), &msg.signature) {
            warn!("Rejected group message from {sender}: bad signature");
            return Err(CryptoError::DecryptionFailed);
        }

        let mk = match record.advance_to(msg.iteration, &self.limits) {
            Ok(mk) => mk,
            Err(e @ CryptoError::DuplicateMessage { .. }) => {
                warn!("Replayed group message from {sender} (iteration {})", msg.iteration);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let plaintext = message_keys::open(
            &mk,
            &group_ad(group_id, msg.key_id, msg.iteration),
            &msg.ciphertext,
            &msg.tag,
        )?;
        self.save(group_id, &sender_name, &record)?;
        Ok(plaintext)
    }

    pub fn has_sender_key(&self, group_id: &str, sender: &SessionAddress) -> Result<bool, CryptoError> {
        Ok(self.load(group_id, &sender.to_string())?.is_some())
    }

    /// Full re-key: forget every sender key held for `group_id` and create a
    /// new local one. The returned distribution message must be sent to the
    /// remaining members only.
    pub fn on_membership_changed(
        &self,
        group_id: &str,
    ) -> Result<SenderKeyDistributionMessage, CryptoError> {
        let prefix = group_prefix(group_id);
        let mut removed = 0;
        for id in self.store.list(RecordKind::SenderKey)? {
            if id.name.starts_with(&prefix) {
                self.store.delete(&id)?;
                removed += 1;
            }
        }
        // Idle locks of the dropped chains go with them.
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(group, _), lock| group != group_id || Arc::strong_count(lock) > 1);
        info!("Group {group_id} membership changed, dropped {removed} sender keys");
        self.create_sender_key(group_id)
    }
}

/// Group id bound into every message's associated data.
fn group_ad(group_id: &str, key_id: u32, iteration: u32) -> Vec<u8> {
    let mut ad = SenderKeyMessage::header_bytes(key_id, iteration);
    ad.extend_from_slice(group_id.as_bytes());
    ad
}

#[cfg(test)]
mod tests {
    use {super::*, crate::store::MemoryKeyStore, assert_matches::assert_matches};

    const GROUP: &str = "family";

    fn cipher() -> GroupCipher<MemoryKeyStore> {
        GroupCipher::new(Arc::new(MemoryKeyStore::new()), &EngineConfig::default())
    }

    fn alice() -> SessionAddress {
        SessionAddress::new("alice", 1)
    }

    fn pair() -> (GroupCipher<MemoryKeyStore>, GroupCipher<MemoryKeyStore>) {
        let (a, b) = (cipher(), cipher());
        let dist = a.create_sender_key(GROUP).unwrap();
        assert!(b.process_distribution_message(&alice(), &dist).unwrap());
        (a, b)
    }

    #[test]
    fn distribution_then_messages() {
        let (a, b) = pair();
        for i in 0..3 {
            let text = format!("hello {i}");
            let ct = a.encrypt_group_message(GROUP, text.as_bytes()).unwrap();
            assert_eq!(b.decrypt_group_message(GROUP, &alice(), &ct).unwrap(), text.as_bytes());
        }
    }

    #[test]
    fn out_of_order_and_replay() {
        let (a, b) = pair();
        let cts: Vec<_> = (0..4)
            .map(|i| a.encrypt_group_message(GROUP, &[i]).unwrap())
            .collect();

        assert_eq!(b.decrypt_group_message(GROUP, &alice(), &cts[3]).unwrap(), vec![3]);
        assert_eq!(b.decrypt_group_message(GROUP, &alice(), &cts[1]).unwrap(), vec![1]);
        assert_matches!(
            b.decrypt_group_message(GROUP, &alice(), &cts[1]),
            Err(CryptoError::DuplicateMessage { counter: 1 })
        );
        assert_matches!(
            b.decrypt_group_message(GROUP, &alice(), &cts[3]),
            Err(CryptoError::DuplicateMessage { counter: 3 })
        );
        assert_eq!(b.decrypt_group_message(GROUP, &alice(), &cts[0]).unwrap(), vec![0]);
    }

    #[test]
    fn skip_beyond_limit_fails() {
        let a = cipher();
        let b = GroupCipher::new(
            Arc::new(MemoryKeyStore::new()),
            &EngineConfig {
                max_skip: 2,
                ..Default::default()
            },
        );
        b.process_distribution_message(&alice(), &a.create_sender_key(GROUP).unwrap())
            .unwrap();
        let cts: Vec<_> = (0..4)
            .map(|i| a.encrypt_group_message(GROUP, &[i]).unwrap())
            .collect();
        assert_matches!(
            b.decrypt_group_message(GROUP, &alice(), &cts[3]),
            Err(CryptoError::MaxSkippedMessagesExceeded { requested: 3, limit: 2 })
        );
        assert!(b.decrypt_group_message(GROUP, &alice(), &cts[2]).is_ok());
    }

    #[test]
    fn membership_change_drops_idle_locks() {
        let (_, b) = pair();
        let bob = SessionAddress::new("bob", 1);
        b.create_sender_key(GROUP).unwrap();
        b.create_sender_key("book-club").unwrap();
        b.process_distribution_message(&bob, &cipher().create_sender_key(GROUP).unwrap())
            .unwrap();
        assert_eq!(b.locks.lock().unwrap().len(), 4);

        b.on_membership_changed(GROUP).unwrap();
        let mut held: Vec<_> = b.locks.lock().unwrap().keys().cloned().collect();
        held.sort();
        assert_eq!(
            held,
            vec![
                ("book-club".to_owned(), LOCAL_SENDER.to_owned()),
                (GROUP.to_owned(), LOCAL_SENDER.to_owned()),
            ]
        );
    }

    #[test]
    fn forged_signature_is_rejected_without_advancing() {
        let (a, b) = pair();
        let ct = a.encrypt_group_message(GROUP, b"real").unwrap();
        let mut forged = SenderKeyMessage::decode(&ct).unwrap();
        forged.signature[0] ^= 1;

        assert_matches!(
            b.decrypt_group_message(GROUP, &alice(), &forged.encode()),
            Err(CryptoError::DecryptionFailed)
        );
        assert_eq!(b.decrypt_group_message(GROUP, &alice(), &ct).unwrap(), b"real");
    }

    #[test]
    fn other_member_cannot_impersonate_sender() {
        let (a, b) = pair();
        // Mallory is a member and knows the chain, not Alice's signing key.
        let mallory = cipher();
        let dist = a.current_distribution_message(GROUP).unwrap();
        mallory.create_sender_key(GROUP).unwrap();
        let mut record = mallory.load(GROUP, LOCAL_SENDER).unwrap().unwrap();
        record.key_id = dist.key_id;
        record.chain_key = SecretBytes(*dist.chain_key);
        record.iteration = dist.iteration;
        mallory.save(GROUP, LOCAL_SENDER, &record).unwrap();

        let ct = mallory.encrypt_group_message(GROUP, b"forged").unwrap();
        assert_matches!(
            b.decrypt_group_message(GROUP, &alice(), &ct),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn bad_distribution_signature_is_rejected() {
        let a = cipher();
        let b = cipher();
        let mut dist = a.create_sender_key(GROUP).unwrap();
        dist.iteration += 1;
        assert_matches!(
            b.process_distribution_message(&alice(), &dist),
            Err(CryptoError::DecryptionFailed)
        );
        assert!(!b.has_sender_key(GROUP, &alice()).unwrap());
    }

    #[test]
    fn repeated_distribution_does_not_rewind() {
        let (a, b) = pair();
        let dist = a.current_distribution_message(GROUP).unwrap();
        let ct = a.encrypt_group_message(GROUP, b"m0").unwrap();
        b.decrypt_group_message(GROUP, &alice(), &ct).unwrap();

        assert!(!b.process_distribution_message(&alice(), &dist).unwrap());
        assert_matches!(
            b.decrypt_group_message(GROUP, &alice(), &ct),
            Err(CryptoError::DuplicateMessage { .. })
        );
    }

    #[test]
    fn rekey_invalidates_old_key() {
        let (a, b) = pair();
        let old = a.current_distribution_message(GROUP).unwrap();
        let new = a.on_membership_changed(GROUP).unwrap();
        assert_ne!(old.key_id, new.key_id);
        assert_ne!(new.signing_key, old.signing_key);

        let ct = a.encrypt_group_message(GROUP, b"after").unwrap();
        assert_matches!(
            b.decrypt_group_message(GROUP, &alice(), &ct),
            Err(CryptoError::KeyNotFound(_))
        );
        b.process_distribution_message(&alice(), &new).unwrap();
        assert_eq!(b.decrypt_group_message(GROUP, &alice(), &ct).unwrap(), b"after");
    }

    #[test]
    fn membership_change_drops_received_keys_of_that_group_only() {
        let (a, b) = pair();
        let other = a.create_sender_key("other").unwrap();
        b.process_distribution_message(&alice(), &other).unwrap();

        b.on_membership_changed(GROUP).unwrap();
        assert!(!b.has_sender_key(GROUP, &alice()).unwrap());
        assert!(b.has_sender_key("other", &alice()).unwrap());
    }

    #[test]
    fn stored_signer_matches_distribution() {
        let (a, b) = pair();
        let dist = a.current_distribution_message(GROUP).unwrap();
        let record = b.load(GROUP, &alice().to_string()).unwrap().unwrap();
        assert_eq!(record.signing_public, dist.signing_key.to_bytes());
        assert!(record.signing_secret.is_none());
    }
}
