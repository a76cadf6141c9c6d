//! Double Ratchet
//!
//! This module follows the Signal Double Ratchet specification
//! <https://signal.org/docs/specifications/doubleratchet/> with one
//! difference in scheduling: the sending half of a DH ratchet step is
//! performed lazily, on the first [`encrypt`](RatchetState::encrypt) after a
//! new peer ratchet key was seen, rather than eagerly on receipt. The wire
//! behaviour is identical; a device that only receives never spends entropy.
//!
//! Message keys are consumed exactly once. Keys for messages that have not
//! arrived yet are kept in a bounded LRU cache keyed by `(ratchet key,
//! counter)`; the oldest are evicted first.
//!
//! Every [`decrypt`](RatchetState::decrypt) runs on a copy of the state which
//! replaces the original only after the message authenticated, so a forged or
//! corrupted message never moves the ratchet.
//!
//! # Example
//!
//! ```rust
//! use hearth_sdk::crypto::double_ratchet::{RatchetLimits, RatchetState};
//! use rand::rngs::OsRng;
//! use x25519_dalek::{PublicKey, StaticSecret};
//!
//! // Shared secret from X3DH, and the responder's signed pre-key.
//! let sk = [7u8; 32];
//! let spk = StaticSecret::random_from_rng(OsRng);
//! let spk_pub = PublicKey::from(&spk);
//!
//! let mut alice = RatchetState::init_initiator(&sk, spk_pub, RatchetLimits::default()).unwrap();
//! let mut bob = RatchetState::init_responder(&sk, spk, RatchetLimits::default());
//!
//! let env = alice.encrypt(b"hello bob", b"ad").unwrap();
//! assert_eq!(bob.decrypt(&env, b"ad").unwrap(), b"hello bob");
//!
//! let reply = bob.encrypt(b"hi alice", b"ad").unwrap();
//! assert_eq!(alice.decrypt(&reply, b"ad").unwrap(), b"hi alice");
//! ```

use {
    super::{
        envelope::RatchetEnvelope,
        message_keys::{self, MessageKeyError},
        secret_bytes::{generate_static_secret, SecretBytes},
        x3dh::validate_pk,
    },
    crate::config::EngineConfig,
    hkdf::Hkdf,
    hmac::{Hmac, Mac},
    log::debug,
    lru::LruCache,
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    sha2::Sha256,
    std::{collections::VecDeque, num::NonZeroUsize},
    subtle::ConstantTimeEq,
    thiserror::Error,
    x25519_dalek::{PublicKey, StaticSecret},
    zeroize::Zeroize,
};

/// Peer ratchet keys remembered after they were replaced, so that late
/// replays on a finished chain are reported as duplicates.
const MAX_RETIRED_PEER_KEYS: usize = 16;

const ROOT_INFO: &[u8] = b"Hearth_Ratchet_Root";

// === Type aliases ===

/// HKDF‑SHA‑256 as per RFC 5869.
type HkdfSha256 = Hkdf<Sha256>;
/// HMAC‑SHA‑256 wrapper from universal‑hash.
type HmacSha256 = Hmac<Sha256>;

type SkippedKey = ([u8; 32], u32);

// === Error types ===

/// Possible failures returned by [`RatchetState`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RatchetError {
    /// The message key for this counter was already used.
    #[error("duplicate message (counter {counter})")]
    Duplicate { counter: u32 },
    /// Safety valve: the message would make us derive too many keys.
    #[error("{requested} skipped messages exceed the limit of {limit}")]
    MaxSkipExceeded { requested: u32, limit: u32 },
    /// Authentication failed; the state is unchanged.
    #[error("decryption failed")]
    DecryptionFailed,
    /// Public‑key rejected (identity / small‑order curve point).
    #[error("invalid public key")]
    InvalidPublicKey,
    /// Responder tried to send before receiving anything.
    #[error("missing sending chain")]
    MissingSendingChain,
    #[error("key derivation failed")]
    Kdf,
    /// A chain reached `u32::MAX` messages.
    #[error("message counter overflow")]
    CounterOverflow,
    #[error("entropy source failure: {0}")]
    Entropy(String),
}

impl From<MessageKeyError> for RatchetError {
    fn from(e: MessageKeyError) -> Self {
        match e {
            MessageKeyError::Kdf => RatchetError::Kdf,
            MessageKeyError::Aead => RatchetError::DecryptionFailed,
        }
    }
}

impl From<rand_core::Error> for RatchetError {
    fn from(e: rand_core::Error) -> Self {
        RatchetError::Entropy(e.to_string())
    }
}

/// Bounds on skipped message keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetLimits {
    /// Most keys a single incoming message may make us skip in one chain.
    pub max_skip: u32,
    /// Capacity of the skipped key cache.
    pub max_skipped_keys: NonZeroUsize,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for RatchetLimits {
    fn from(conf: &EngineConfig) -> Self {
        Self {
            max_skip: conf.max_skip,
            max_skipped_keys: NonZeroUsize::new(conf.max_skipped_keys).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

// === Ratchet state ===

#[derive(Clone)]
pub struct RatchetState {
    /// Own ratchet private key
    dhs: StaticSecret,
    /// Own ratchet public key
    dhs_pub: PublicKey,
    /// Remote ratchet public key
    dhr: Option<PublicKey>,
    /// Root key
    rk: [u8; 32],
    /// Chain key for sending
    cks: Option<[u8; 32]>,
    /// Chain key for receiving
    ckr: Option<[u8; 32]>,
    /// Number of messages sent in current sending chain
    ns: u32,
    /// Number of messages received in current receiving chain
    nr: u32,
    /// Length of previous sending chain
    pn: u32,
    /// A new peer ratchet key arrived since our last send.
    needs_send_ratchet: bool,
    retired_peer_keys: VecDeque<[u8; 32]>,
    mkskipped: LruCache<SkippedKey, [u8; 32]>,
    limits: RatchetLimits,
}

// Scrub everything on drop.
impl Drop for RatchetState {
    fn drop(&mut self) {
        // StaticSecret zeroizes itself; PublicKey is public data.
        self.rk.zeroize();
        if let Some(ref mut k) = self.cks {
            k.zeroize();
        }
        if let Some(ref mut k) = self.ckr {
            k.zeroize();
        }
        for (_, mk) in self.mkskipped.iter_mut() {
            mk.zeroize();
        }
        self.mkskipped.clear();
    }
}

impl RatchetState {
    // === Key derivation functions (KDFs) ===

    /// Root‑key KDF: HKDF with the root key as salt, yielding `(rk', ck)`.
    fn kdf_rk(rk: &[u8; 32], dh_out: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), RatchetError> {
        let hk = HkdfSha256::new(Some(rk), dh_out);
        let mut okm = [0u8; 64];
        hk.expand(ROOT_INFO, &mut okm).map_err(|_| RatchetError::Kdf)?;
        let mut new_rk = [0u8; 32];
        new_rk.copy_from_slice(&okm[..32]);
        let mut ck = [0u8; 32];
        ck.copy_from_slice(&okm[32..]);
        okm.zeroize();
        Ok((new_rk, ck))
    }

    /// Chain‑key KDF using single‑byte labels `0x01` / `0x02`.
    /// Takes the current chain key and returns the new chain key and message key.
    fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), RatchetError> {
        let mut mac1 = <HmacSha256 as Mac>::new_from_slice(ck).map_err(|_| RatchetError::Kdf)?;
        mac1.update(&[0x01]);
        let mut new_ck = [0u8; 32];
        new_ck.copy_from_slice(&mac1.finalize().into_bytes());

        let mut mac2 = <HmacSha256 as Mac>::new_from_slice(ck).map_err(|_| RatchetError::Kdf)?;
        mac2.update(&[0x02]);
        let mut mk = [0u8; 32];
        mk.copy_from_slice(&mac2.finalize().into_bytes());
        Ok((new_ck, mk))
    }

    fn dh(sk: &StaticSecret, pk: &PublicKey) -> [u8; 32] {
        sk.diffie_hellman(pk).to_bytes()
    }

    fn empty(dhs: StaticSecret, rk: &[u8; 32], limits: RatchetLimits) -> Self {
        let dhs_pub = PublicKey::from(&dhs);
        Self {
            dhs,
            dhs_pub,
            dhr: None,
            rk: *rk,
            cks: None,
            ckr: None,
            ns: 0,
            nr: 0,
            pn: 0,
            needs_send_ratchet: false,
            retired_peer_keys: VecDeque::new(),
            mkskipped: LruCache::new(limits.max_skipped_keys),
            limits,
        }
    }

    // === Constructors ===

    /// Initiator side: `sk` is the X3DH secret, `remote` the responder's
    /// signed pre-key, which doubles as its first ratchet key.
    pub fn init_initiator(
        sk: &[u8; 32],
        remote: PublicKey,
        limits: RatchetLimits,
    ) -> Result<Self, RatchetError> {
        validate_pk(&remote).map_err(|_| RatchetError::InvalidPublicKey)?;
        let mut state = Self::empty(generate_static_secret()?, sk, limits);
        let dh_out = Self::dh(&state.dhs, &remote);
        let (rk, cks) = Self::kdf_rk(sk, &dh_out)?;
        state.rk = rk;
        state.cks = Some(cks);
        state.dhr = Some(remote);
        Ok(state)
    }

    /// Responder side: the signed pre-key pair is the first ratchet key.
    pub fn init_responder(sk: &[u8; 32], spk: StaticSecret, limits: RatchetLimits) -> Self {
        Self::empty(spk, sk, limits)
    }

    // === Accessors ===

    pub fn sending_ratchet_key(&self) -> PublicKey {
        self.dhs_pub
    }

    pub fn skipped_key_count(&self) -> usize {
        self.mkskipped.len()
    }

    /// Whether a sending chain exists or will be created on the next send.
    pub fn can_send(&self) -> bool {
        self.cks.is_some() || self.needs_send_ratchet
    }

    // === Public API – send / receive ===

    /// Encrypt `plaintext` into the next envelope of the sending chain.
    ///
    /// `ad` is prepended to the envelope header to form the AEAD associated
    /// data.
    pub fn encrypt(&mut self, plaintext: &[u8], ad: &[u8]) -> Result<RatchetEnvelope, RatchetError> {
        if self.needs_send_ratchet {
            self.send_ratchet()?;
        }
        let cks = self.cks.ok_or(RatchetError::MissingSendingChain)?;
        let next_ns = self.ns.checked_add(1).ok_or(RatchetError::CounterOverflow)?;
        let (new_cks, mut mk) = Self::kdf_ck(&cks)?;

        let header = RatchetEnvelope::header_bytes(&self.dhs_pub, self.ns, self.pn);
        let sealed = message_keys::seal(&mk, &full_ad(ad, &header), plaintext);
        mk.zeroize();
        let (ciphertext, tag) = sealed?;

        let envelope = RatchetEnvelope {
            ratchet_key: self.dhs_pub,
            counter: self.ns,
            previous_chain_length: self.pn,
            ciphertext,
            tag,
        };
        self.cks = Some(new_cks);
        self.ns = next_ns;
        Ok(envelope)
    }

    /// Decrypt an incoming envelope. Handles skipped‑message lookup and DH
    /// ratchet advancement. On any error the state is left untouched.
    pub fn decrypt(&mut self, envelope: &RatchetEnvelope, ad: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let mut work = self.clone();
        let plaintext = work.decrypt_in_place(envelope, ad)?;
        *self = work;
        Ok(plaintext)
    }

    fn decrypt_in_place(
        &mut self,
        envelope: &RatchetEnvelope,
        ad: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let full_ad = full_ad(ad, &envelope.header());
        let key = (envelope.ratchet_key.to_bytes(), envelope.counter);

        // Try for skipped message keys
        if let Some(mut mk) = self.mkskipped.pop(&key) {
            let opened = message_keys::open(&mk, &full_ad, &envelope.ciphertext, &envelope.tag);
            mk.zeroize();
            return Ok(opened?);
        }

        let on_current_chain = self
            .dhr
            .is_some_and(|dhr| bool::from(dhr.as_bytes().ct_eq(envelope.ratchet_key.as_bytes())));

        if on_current_chain {
            if envelope.counter < self.nr {
                return Err(RatchetError::Duplicate {
                    counter: envelope.counter,
                });
            }
        } else if self
            .retired_peer_keys
            .iter()
            .any(|k| bool::from(k.ct_eq(envelope.ratchet_key.as_bytes())))
        {
            return Err(RatchetError::Duplicate {
                counter: envelope.counter,
            });
        } else {
            self.skip_message_keys(envelope.previous_chain_length)?;
            self.receive_ratchet(envelope.ratchet_key)?;
        }

        self.skip_message_keys(envelope.counter)?;
        let ckr = self.ckr.ok_or(RatchetError::DecryptionFailed)?;
        let (new_ckr, mut mk) = Self::kdf_ck(&ckr)?;
        self.ckr = Some(new_ckr);
        self.nr = self.nr.checked_add(1).ok_or(RatchetError::CounterOverflow)?;

        let opened = message_keys::open(&mk, &full_ad, &envelope.ciphertext, &envelope.tag);
        mk.zeroize();
        Ok(opened?)
    }

    // === Internal helpers (skipped messages, DH‑ratchet) ===

    /// Derive and cache message keys of the receiving chain up to `until`.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), RatchetError> {
        let (Some(mut ck_r), Some(dhr)) = (self.ckr, self.dhr) else {
            return Ok(());
        };
        if until <= self.nr {
            return Ok(());
        }
        let requested = until - self.nr;
        if requested > self.limits.max_skip {
            return Err(RatchetError::MaxSkipExceeded {
                requested,
                limit: self.limits.max_skip,
            });
        }
        while self.nr < until {
            let (new_ck, mk) = Self::kdf_ck(&ck_r)?;
            ck_r = new_ck;
            // Oldest keys fall out once the cache is full.
            if let Some((_, mut evicted)) = self.mkskipped.push((dhr.to_bytes(), self.nr), mk) {
                evicted.zeroize();
            }
            self.nr += 1;
        }
        self.ckr = Some(ck_r);
        debug!("[ratchet] cached {requested} skipped message keys");
        Ok(())
    }

    /// Receiving half of a DH ratchet step.
    fn receive_ratchet(&mut self, remote: PublicKey) -> Result<(), RatchetError> {
        validate_pk(&remote).map_err(|_| RatchetError::InvalidPublicKey)?;
        if let Some(old) = self.dhr.replace(remote) {
            self.retired_peer_keys.push_back(old.to_bytes());
            if self.retired_peer_keys.len() > MAX_RETIRED_PEER_KEYS {
                self.retired_peer_keys.pop_front();
            }
        }
        let dh_out = Self::dh(&self.dhs, &remote);
        let (rk, ckr) = Self::kdf_rk(&self.rk, &dh_out)?;
        self.rk = rk;
        self.ckr = Some(ckr);
        self.nr = 0;
        self.needs_send_ratchet = true;
        debug!("[ratchet] receiving chain advanced");
        Ok(())
    }

    /// Sending half of a DH ratchet step.
    fn send_ratchet(&mut self) -> Result<(), RatchetError> {
        let remote = self.dhr.ok_or(RatchetError::MissingSendingChain)?;
        self.dhs = generate_static_secret()?;
        self.dhs_pub = PublicKey::from(&self.dhs);
        self.pn = self.ns;
        self.ns = 0;

        let dh_out = Self::dh(&self.dhs, &remote);
        let (rk, cks) = Self::kdf_rk(&self.rk, &dh_out)?;
        self.rk = rk;
        self.cks = Some(cks);
        self.needs_send_ratchet = false;
        debug!("[ratchet] sending chain advanced");
        Ok(())
    }
}

fn full_ad(ad: &[u8], header: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ad.len() + header.len());
    out.extend_from_slice(ad);
    out.extend_from_slice(header);
    out
}

// === Serde ===

/// Stable persisted form of [`RatchetState`].
#[derive(Serialize, Deserialize)]
struct RatchetSnapshot {
    dhs: SecretBytes,
    dhr: Option<[u8; 32]>,
    rk: SecretBytes,
    cks: Option<SecretBytes>,
    ckr: Option<SecretBytes>,
    ns: u32,
    nr: u32,
    pn: u32,
    needs_send_ratchet: bool,
    retired_peer_keys: Vec<[u8; 32]>,
    /// Oldest first.
    skipped: Vec<([u8; 32], u32, SecretBytes)>,
    limits: RatchetLimits,
}

impl Serialize for RatchetState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        RatchetSnapshot {
            dhs: SecretBytes::from(&self.dhs),
            dhr: self.dhr.map(|pk| pk.to_bytes()),
            rk: SecretBytes(self.rk),
            cks: self.cks.map(SecretBytes),
            ckr: self.ckr.map(SecretBytes),
            ns: self.ns,
            nr: self.nr,
            pn: self.pn,
            needs_send_ratchet: self.needs_send_ratchet,
            retired_peer_keys: self.retired_peer_keys.iter().copied().collect(),
            skipped: self
                .mkskipped
                .iter()
                .rev()
                .map(|((pk, n), mk)| (*pk, *n, SecretBytes(*mk)))
                .collect(),
            limits: self.limits,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RatchetState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let snap = RatchetSnapshot::deserialize(deserializer)?;
        let mut state = Self::empty(snap.dhs.to_static_secret(), &snap.rk.0, snap.limits);
        state.dhr = snap.dhr.map(PublicKey::from);
        state.cks = snap.cks.as_ref().map(|k| k.0);
        state.ckr = snap.ckr.as_ref().map(|k| k.0);
        state.ns = snap.ns;
        state.nr = snap.nr;
        state.pn = snap.pn;
        state.needs_send_ratchet = snap.needs_send_ratchet;
        state.retired_peer_keys = snap.retired_peer_keys.into_iter().collect();
        for (pk, n, mk) in &snap.skipped {
            state.mkskipped.push((*pk, *n), mk.0);
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches, rand::rngs::OsRng};

    const AD: &[u8] = b"associated data";

    fn limits(max_skip: u32, max_skipped_keys: usize) -> RatchetLimits {
        RatchetLimits {
            max_skip,
            max_skipped_keys: NonZeroUsize::new(max_skipped_keys).unwrap(),
        }
    }

    // Helper function to setup Sender and Receiver
    fn setup_ratchet_pair_with(limits: RatchetLimits) -> (RatchetState, RatchetState) {
        let sk = [9u8; 32];
        let spk = StaticSecret::random_from_rng(OsRng);
        let sender = RatchetState::init_initiator(&sk, PublicKey::from(&spk), limits).unwrap();
        let receiver = RatchetState::init_responder(&sk, spk, limits);
        (sender, receiver)
    }

    fn setup_ratchet_pair() -> (RatchetState, RatchetState) {
        setup_ratchet_pair_with(RatchetLimits::default())
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (mut sender, mut receiver) = setup_ratchet_pair();
        let env = sender.encrypt(b"hello, world", AD).unwrap();
        assert_eq!(receiver.decrypt(&env, AD).unwrap(), b"hello, world");
    }

    #[test]
    fn test_responder_cannot_send_first() {
        let (_, mut receiver) = setup_ratchet_pair();
        assert_matches!(
            receiver.encrypt(b"too early", AD),
            Err(RatchetError::MissingSendingChain)
        );
    }

    #[test]
    fn test_bidirectional_conversation() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        for round in 0..4 {
            let a = format!("alice {round}").into_bytes();
            let env = alice.encrypt(&a, AD).unwrap();
            assert_eq!(bob.decrypt(&env, AD).unwrap(), a);

            let b = format!("bob {round}").into_bytes();
            let env = bob.encrypt(&b, AD).unwrap();
            assert_eq!(alice.decrypt(&env, AD).unwrap(), b);
        }
    }

    #[test]
    fn test_dh_ratchet_step() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        let first_key = alice.sending_ratchet_key();
        let env = alice.encrypt(b"1", AD).unwrap();
        bob.decrypt(&env, AD).unwrap();
        let rk_before = bob.rk;

        let reply = bob.encrypt(b"2", AD).unwrap();
        assert_ne!(bob.rk, rk_before);
        alice.decrypt(&reply, AD).unwrap();

        let env = alice.encrypt(b"3", AD).unwrap();
        assert_ne!(env.ratchet_key, first_key);
        assert_eq!(env.previous_chain_length, 1);
        assert_eq!(bob.decrypt(&env, AD).unwrap(), b"3");
    }

    #[test]
    fn test_replay_is_duplicate() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        let env = alice.encrypt(b"once", AD).unwrap();
        bob.decrypt(&env, AD).unwrap();
        assert_matches!(
            bob.decrypt(&env, AD),
            Err(RatchetError::Duplicate { counter: 0 })
        );
    }

    #[test]
    fn test_replay_from_retired_chain_is_duplicate() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        let old = alice.encrypt(b"old chain", AD).unwrap();
        bob.decrypt(&old, AD).unwrap();
        let reply = bob.encrypt(b"r", AD).unwrap();
        alice.decrypt(&reply, AD).unwrap();
        let new = alice.encrypt(b"new chain", AD).unwrap();
        bob.decrypt(&new, AD).unwrap();

        assert_matches!(bob.decrypt(&old, AD), Err(RatchetError::Duplicate { .. }));
    }

    #[test]
    fn test_out_of_order_messages() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        let envs: Vec<_> = (0..5)
            .map(|i| alice.encrypt(format!("m{i}").as_bytes(), AD).unwrap())
            .collect();

        for i in [4, 0, 3, 1, 2] {
            assert_eq!(bob.decrypt(&envs[i], AD).unwrap(), format!("m{i}").into_bytes());
        }
        assert_eq!(bob.skipped_key_count(), 0);
        for env in &envs {
            assert_matches!(bob.decrypt(env, AD), Err(RatchetError::Duplicate { .. }));
        }
    }

    #[test]
    fn test_out_of_order_across_ratchet_steps() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        let first = alice.encrypt(b"a0", AD).unwrap();
        let late = alice.encrypt(b"a1", AD).unwrap();
        bob.decrypt(&first, AD).unwrap();

        let reply = bob.encrypt(b"b0", AD).unwrap();
        alice.decrypt(&reply, AD).unwrap();
        let next = alice.encrypt(b"a2", AD).unwrap();

        // The new chain arrives first; the late message comes from the cache.
        assert_eq!(bob.decrypt(&next, AD).unwrap(), b"a2");
        assert_eq!(bob.skipped_key_count(), 1);
        assert_eq!(bob.decrypt(&late, AD).unwrap(), b"a1");
    }

    #[test]
    fn test_max_skip_limit() {
        let (mut alice, mut bob) = setup_ratchet_pair_with(limits(3, 10));
        let envs: Vec<_> = (0..5).map(|_| alice.encrypt(b"x", AD).unwrap()).collect();

        assert_matches!(
            bob.decrypt(&envs[4], AD),
            Err(RatchetError::MaxSkipExceeded { requested: 4, limit: 3 })
        );
        // Within the window still works.
        assert_eq!(bob.decrypt(&envs[3], AD).unwrap(), b"x");
    }

    #[test]
    fn test_skipped_cache_evicts_oldest() {
        let (mut alice, mut bob) = setup_ratchet_pair_with(limits(10, 2));
        let envs: Vec<_> = (0..4).map(|_| alice.encrypt(b"x", AD).unwrap()).collect();

        bob.decrypt(&envs[3], AD).unwrap();
        assert_eq!(bob.skipped_key_count(), 2);
        // Key 0 was evicted, 1 and 2 are still cached.
        assert_matches!(bob.decrypt(&envs[0], AD), Err(RatchetError::Duplicate { .. }));
        assert!(bob.decrypt(&envs[1], AD).is_ok());
        assert!(bob.decrypt(&envs[2], AD).is_ok());
    }

    #[test]
    fn test_corrupted_payload_leaves_state_untouched() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        let env = alice.encrypt(b"payload", AD).unwrap();
        let mut bad = env.clone();
        bad.ciphertext[0] ^= 0xff;

        assert_matches!(bob.decrypt(&bad, AD), Err(RatchetError::DecryptionFailed));
        assert_eq!(bob.nr, 0);
        assert!(bob.dhr.is_none());
        assert_eq!(bob.decrypt(&env, AD).unwrap(), b"payload");
    }

    #[test]
    fn test_corrupted_cached_message_keeps_key() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        let first = alice.encrypt(b"first", AD).unwrap();
        let second = alice.encrypt(b"second", AD).unwrap();
        bob.decrypt(&second, AD).unwrap();

        let mut bad = first.clone();
        bad.tag[0] ^= 1;
        assert_matches!(bob.decrypt(&bad, AD), Err(RatchetError::DecryptionFailed));
        assert_eq!(bob.decrypt(&first, AD).unwrap(), b"first");
    }

    #[test]
    fn test_incorrect_associated_data() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        let env = alice.encrypt(b"m", AD).unwrap();
        assert_matches!(bob.decrypt(&env, b"other"), Err(RatchetError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_header_fails() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        let mut env = alice.encrypt(b"m", AD).unwrap();
        env.previous_chain_length = 1;
        assert_matches!(bob.decrypt(&env, AD), Err(RatchetError::DecryptionFailed));
    }

    #[test]
    fn test_empty_and_large_messages() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        let env = alice.encrypt(b"", AD).unwrap();
        assert_eq!(bob.decrypt(&env, AD).unwrap(), b"");
        let large = vec![0x42u8; 64 * 1024];
        let env = alice.encrypt(&large, AD).unwrap();
        assert_eq!(bob.decrypt(&env, AD).unwrap(), large);
    }

    #[test]
    fn test_state_survives_serialization() {
        let (mut alice, mut bob) = setup_ratchet_pair();
        let skipped = alice.encrypt(b"late", AD).unwrap();
        let env = alice.encrypt(b"now", AD).unwrap();
        bob.decrypt(&env, AD).unwrap();

        let bytes = bincode::serialize(&bob).unwrap();
        let mut restored: RatchetState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.skipped_key_count(), 1);
        assert_eq!(restored.decrypt(&skipped, AD).unwrap(), b"late");

        let reply = restored.encrypt(b"reply", AD).unwrap();
        assert_eq!(alice.decrypt(&reply, AD).unwrap(), b"reply");
    }
}
