//! Key rotation policy.
//!
//! [`KeyRotationScheduler`] owns no timer; the host calls
//! [`run_periodic`](KeyRotationScheduler::run_periodic) whenever convenient
//! (app start, background fetch, a cron tick) and
//! [`next_rotation_due`](KeyRotationScheduler::next_rotation_due) tells it
//! when the next call will have something to do. Time is always passed in so
//! that policy decisions are reproducible.

use {
    super::{
        identity::{AccountReset, IdentityKeyManager},
        prekeys::PreKeyManager,
        session::{SessionAddress, SessionStore},
    },
    crate::{config::EngineConfig, error::CryptoError, store::SecureKeyStore},
    chrono::{DateTime, Utc},
    log::{info, warn},
    std::sync::Arc,
    x25519_dalek::PublicKey,
};

/// Something the scheduler changed. Hosts publish new bundles on
/// `SignedPreKeyRotated` / `OneTimePreKeysReplenished` and notify peers on
/// `SafetyNumberChanged`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RotationEvent {
    SignedPreKeyRotated { id: u32 },
    SignedPreKeysPurged { ids: Vec<u32> },
    OneTimePreKeysReplenished { count: u32 },
    SessionsInvalidated { count: usize },
    /// Emitted on every compromise. `new_identity` is set when the identity
    /// itself was replaced.
    SafetyNumberChanged {
        affected: Vec<SessionAddress>,
        new_identity: Option<PublicKey>,
    },
}

/// What the host knows about a suspected compromise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompromiseSignal {
    /// The identity secret itself may have leaked.
    pub reset_identity: bool,
}

pub struct KeyRotationScheduler<S> {
    identity: Arc<IdentityKeyManager<S>>,
    prekeys: Arc<PreKeyManager<S>>,
    sessions: Arc<SessionStore<S>>,
    config: EngineConfig,
}

impl<S: SecureKeyStore> KeyRotationScheduler<S> {
    pub fn new(
        identity: Arc<IdentityKeyManager<S>>,
        prekeys: Arc<PreKeyManager<S>>,
        sessions: Arc<SessionStore<S>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            identity,
            prekeys,
            sessions,
            config,
        }
    }

    fn current_signed_created_at(&self) -> Result<Option<DateTime<Utc>>, CryptoError> {
        match self.prekeys.current_signed_pre_key() {
            Ok(info) => Ok(Some(info.created_at)),
            Err(CryptoError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn replenish(&self, events: &mut Vec<RotationEvent>) -> Result<(), CryptoError> {
        let have = self.prekeys.unallocated_one_time_pre_key_count()?;
        let target = self.config.one_time_pre_key_target as usize;
        if have < target {
            // `target` came from a u32, so the difference fits.
            let count = (target - have) as u32;
            self.prekeys.generate_one_time_pre_keys(count)?;
            events.push(RotationEvent::OneTimePreKeysReplenished { count });
        }
        Ok(())
    }

    /// Routine maintenance: rotate the signed pre-key when it is older than
    /// the rotation interval (or missing), purge superseded keys whose grace
    /// window elapsed and top up the one-time pre-key pool.
    pub fn run_periodic(&self, now: DateTime<Utc>) -> Result<Vec<RotationEvent>, CryptoError> {
        let mut events = Vec::new();

        let due = match self.current_signed_created_at()? {
            Some(created_at) => now.signed_duration_since(created_at) >= self.config.signed_pre_key_rotation(),
            None => true,
        };
        if due {
            let id = self.prekeys.generate_signed_pre_key(now)?;
            events.push(RotationEvent::SignedPreKeyRotated { id });
        }

        let purged = self.prekeys.purge_expired_signed_pre_keys(now)?;
        if !purged.is_empty() {
            events.push(RotationEvent::SignedPreKeysPurged { ids: purged });
        }

        self.replenish(&mut events)?;
        Ok(events)
    }

    /// Emergency rotation after a suspected key compromise.
    ///
    /// Rotates the signed pre-key, replaces unpublished one-time pre-keys and
    /// terminates every session so that peers must re-handshake. Superseded
    /// signed pre-keys keep their grace window. With `reset_identity` the
    /// identity and all key material are destroyed first, superseded signed
    /// pre-keys included, so handshakes still in flight fail.
    pub fn handle_compromise(
        &self,
        now: DateTime<Utc>,
        signal: CompromiseSignal,
    ) -> Result<Vec<RotationEvent>, CryptoError> {
        warn!("Handling key compromise (identity reset: {})", signal.reset_identity);
        let mut events = Vec::new();

        let affected = self.sessions.terminate_all()?;
        events.push(RotationEvent::SessionsInvalidated {
            count: affected.len(),
        });

        let new_identity = if signal.reset_identity {
            Some(self.identity.reset_identity(AccountReset::DestroyAllSessions)?)
        } else {
            self.prekeys.discard_unallocated_one_time_pre_keys()?;
            None
        };

        let id = self.prekeys.generate_signed_pre_key(now)?;
        events.push(RotationEvent::SignedPreKeyRotated { id });
        self.replenish(&mut events)?;

        events.push(RotationEvent::SafetyNumberChanged {
            affected,
            new_identity,
        });
        info!("Compromise handling finished with {} events", events.len());
        Ok(events)
    }

    /// Earliest time [`run_periodic`](Self::run_periodic) has work to do:
    /// the signed pre-key reaching the rotation age, or a superseded key
    /// leaving its grace window. `None` when no signed pre-key exists yet,
    /// meaning rotation is due now.
    pub fn next_rotation_due(&self) -> Result<Option<DateTime<Utc>>, CryptoError> {
        let Some(created_at) = self.current_signed_created_at()? else {
            return Ok(None);
        };
        let mut due = created_at
            .checked_add_signed(self.config.signed_pre_key_rotation())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let grace = self.config.signed_pre_key_grace();
        for key in self.prekeys.signed_pre_keys()? {
            if let Some(superseded_at) = key.superseded_at {
                let expires = superseded_at
                    .checked_add_signed(grace)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                due = due.min(expires);
            }
        }
        Ok(Some(due))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{crypto::session::SessionState, store::MemoryKeyStore},
        assert_matches::assert_matches,
        chrono::TimeDelta,
    };

    struct Device {
        ids: Arc<IdentityKeyManager<MemoryKeyStore>>,
        pre: Arc<PreKeyManager<MemoryKeyStore>>,
        sessions: Arc<SessionStore<MemoryKeyStore>>,
        scheduler: KeyRotationScheduler<MemoryKeyStore>,
    }

    fn device(target: u32) -> Device {
        let store = Arc::new(MemoryKeyStore::new());
        let config = EngineConfig {
            one_time_pre_key_target: target,
            ..Default::default()
        };
        let ids = Arc::new(IdentityKeyManager::new(store.clone()));
        ids.generate_identity().unwrap();
        let pre = Arc::new(PreKeyManager::new(store.clone(), ids.clone(), config.clone()));
        let sessions = Arc::new(SessionStore::new(store, ids.clone(), pre.clone(), &config));
        let scheduler = KeyRotationScheduler::new(ids.clone(), pre.clone(), sessions.clone(), config);
        Device {
            ids,
            pre,
            sessions,
            scheduler,
        }
    }

    #[test]
    fn first_run_bootstraps_everything() {
        let d = device(10);
        assert_eq!(d.scheduler.next_rotation_due().unwrap(), None);

        let now = Utc::now();
        let events = d.scheduler.run_periodic(now).unwrap();
        assert_matches!(events[0], RotationEvent::SignedPreKeyRotated { .. });
        assert_eq!(events[1], RotationEvent::OneTimePreKeysReplenished { count: 10 });
        assert_eq!(
            d.scheduler.next_rotation_due().unwrap(),
            Some(now + TimeDelta::days(7))
        );

        // Nothing to do until then.
        assert!(d.scheduler.run_periodic(now + TimeDelta::days(1)).unwrap().is_empty());
    }

    #[test]
    fn rotation_then_purge_after_grace() {
        let d = device(0);
        let t0 = Utc::now();
        d.scheduler.run_periodic(t0).unwrap();
        let first = d.pre.current_signed_pre_key().unwrap().id;

        let t1 = t0 + TimeDelta::days(7);
        let events = d.scheduler.run_periodic(t1).unwrap();
        assert_matches!(events.as_slice(), [RotationEvent::SignedPreKeyRotated { .. }]);
        assert!(d.pre.signed_pre_key_secret(first).is_ok());
        assert_eq!(
            d.scheduler.next_rotation_due().unwrap(),
            Some(t1 + TimeDelta::hours(48))
        );

        let events = d.scheduler.run_periodic(t1 + TimeDelta::hours(48)).unwrap();
        assert_eq!(events, vec![RotationEvent::SignedPreKeysPurged { ids: vec![first] }]);
    }

    #[test]
    fn replenish_counts_only_unallocated_keys() {
        let d = device(3);
        let now = Utc::now();
        d.scheduler.run_periodic(now).unwrap();
        d.pre.current_bundle().unwrap();

        let events = d.scheduler.run_periodic(now).unwrap();
        assert_eq!(events, vec![RotationEvent::OneTimePreKeysReplenished { count: 1 }]);
        assert_eq!(d.pre.one_time_pre_key_count().unwrap(), 4);
    }

    #[test]
    fn compromise_without_identity_reset() {
        let alice = device(2);
        let bob = device(2);
        let now = Utc::now();
        alice.scheduler.run_periodic(now).unwrap();
        bob.scheduler.run_periodic(now).unwrap();
        let bob_addr = SessionAddress::new("bob", 1);
        alice
            .sessions
            .create_session_as_initiator(&bob_addr, &bob.pre.current_bundle().unwrap())
            .unwrap();
        let old_spk = alice.pre.current_signed_pre_key().unwrap().id;
        let identity = alice.ids.public_identity().unwrap();

        let events = alice
            .scheduler
            .handle_compromise(now, CompromiseSignal::default())
            .unwrap();
        assert_eq!(events[0], RotationEvent::SessionsInvalidated { count: 1 });
        assert_matches!(events[1], RotationEvent::SignedPreKeyRotated { id } if id != old_spk);
        assert_eq!(events[2], RotationEvent::OneTimePreKeysReplenished { count: 2 });
        assert_eq!(
            events[3],
            RotationEvent::SafetyNumberChanged {
                affected: vec![bob_addr.clone()],
                new_identity: None
            }
        );
        assert_eq!(alice.sessions.session_state(&bob_addr).unwrap(), SessionState::Terminated);
        assert_eq!(alice.ids.public_identity().unwrap(), identity);
        // Grace window still applies to the superseded key.
        assert!(alice.pre.signed_pre_key_secret(old_spk).is_ok());
    }

    #[test]
    fn compromise_with_identity_reset() {
        let d = device(1);
        let now = Utc::now();
        d.scheduler.run_periodic(now).unwrap();
        let old = d.ids.public_identity().unwrap();
        d.pre.generate_signed_pre_key(now).unwrap();
        assert_eq!(d.pre.signed_pre_keys().unwrap().len(), 2);

        let events = d
            .scheduler
            .handle_compromise(now, CompromiseSignal { reset_identity: true })
            .unwrap();
        let Some(RotationEvent::SafetyNumberChanged { new_identity: Some(new), .. }) = events.last() else {
            panic!("expected a safety number change, got {events:?}");
        };
        assert_ne!(*new, old);
        assert_eq!(d.ids.public_identity().unwrap(), *new);
        assert!(d.pre.current_bundle().unwrap().verify().is_ok());
        // No grace window survives an identity reset.
        let remaining = d.pre.signed_pre_keys().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].superseded_at, None);
    }
}
