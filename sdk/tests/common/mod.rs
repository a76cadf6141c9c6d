//! A device wired up the way a host app would.

#![allow(dead_code)]

use {
    chrono::Utc,
    hearth_sdk::{
        config::EngineConfig,
        crypto::{
            identity::IdentityKeyManager,
            prekeys::PreKeyManager,
            rotation::KeyRotationScheduler,
            sender_keys::GroupCipher,
            session::{SessionAddress, SessionStore},
            x3dh::KeyBundle,
        },
        store::{MemoryKeyStore, SecureKeyStore},
    },
    std::sync::Arc,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Device<S = MemoryKeyStore> {
    pub address: SessionAddress,
    pub store: Arc<S>,
    pub identity: Arc<IdentityKeyManager<S>>,
    pub prekeys: Arc<PreKeyManager<S>>,
    pub sessions: Arc<SessionStore<S>>,
    pub groups: GroupCipher<S>,
    pub scheduler: KeyRotationScheduler<S>,
}

impl Device {
    pub fn new(user: &str) -> Self {
        Self::with_store(user, Arc::new(MemoryKeyStore::new()), EngineConfig::default())
    }
}

impl<S: SecureKeyStore> Device<S> {
    /// Wire the managers over `store` without generating anything.
    pub fn wire(user: &str, store: Arc<S>, config: EngineConfig) -> Self {
        let identity = Arc::new(IdentityKeyManager::new(store.clone()));
        let prekeys = Arc::new(PreKeyManager::new(store.clone(), identity.clone(), config.clone()));
        let sessions = Arc::new(SessionStore::new(store.clone(), identity.clone(), prekeys.clone(), &config));
        let groups = GroupCipher::new(store.clone(), &config);
        let scheduler = KeyRotationScheduler::new(identity.clone(), prekeys.clone(), sessions.clone(), config);
        Self {
            address: SessionAddress::new(user, 1),
            store,
            identity,
            prekeys,
            sessions,
            groups,
            scheduler,
        }
    }

    /// Wire the managers and bootstrap an identity plus pre-keys.
    pub fn with_store(user: &str, store: Arc<S>, config: EngineConfig) -> Self {
        let device = Self::wire(user, store, config);
        device.identity.generate_identity().unwrap();
        device.scheduler.run_periodic(Utc::now()).unwrap();
        device
    }

    pub fn bundle(&self) -> KeyBundle {
        self.prekeys.current_bundle().unwrap()
    }

    /// Full handshake: `self` initiates and `peer` answers once, so both
    /// sides end up `Established`.
    pub fn connect<T: SecureKeyStore>(&self, peer: &Device<T>) {
        self.sessions
            .create_session_as_initiator(&peer.address, &peer.bundle())
            .unwrap();
        let hello = self.sessions.encrypt(&peer.address, b"hello").unwrap();
        assert_eq!(peer.sessions.decrypt(&self.address, &hello).unwrap(), b"hello");
        let ack = peer.sessions.encrypt(&self.address, b"ack").unwrap();
        assert_eq!(self.sessions.decrypt(&peer.address, &ack).unwrap(), b"ack");
    }
}
