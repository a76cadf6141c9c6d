//! Opens the configured key store and wires the engine managers over it.

use {
    crate::{prelude::*, utils::secrets::master_key_provider::MasterKeyProvider},
    hearth_sdk::{
        crypto::{
            identity::IdentityKeyManager,
            prekeys::PreKeyManager,
            rotation::KeyRotationScheduler,
            session::{SessionAddress, SessionStore},
        },
        store::{Aes256GcmAlgo, FileKeyStore},
    },
    std::sync::Arc,
};

pub(crate) type CliStore = FileKeyStore<Aes256GcmAlgo, MasterKeyProvider>;

pub(crate) struct Engine {
    pub(crate) address: SessionAddress,
    pub(crate) store: Arc<CliStore>,
    pub(crate) identity: Arc<IdentityKeyManager<CliStore>>,
    pub(crate) prekeys: Arc<PreKeyManager<CliStore>>,
    pub(crate) sessions: Arc<SessionStore<CliStore>>,
    pub(crate) scheduler: KeyRotationScheduler<CliStore>,
}

impl Engine {
    /// Open the store at `conf.store.path` with the master key provider.
    pub(crate) fn open(conf: &CliConf) -> AnyResult<Self, HearthCliError> {
        let store = Arc::new(
            CliStore::open(&conf.store.path, MasterKeyProvider).map_err(HearthCliError::Store)?,
        );
        let identity = Arc::new(IdentityKeyManager::new(store.clone()));
        let prekeys = Arc::new(PreKeyManager::new(
            store.clone(),
            identity.clone(),
            conf.engine.clone(),
        ));
        let sessions = Arc::new(SessionStore::new(
            store.clone(),
            identity.clone(),
            prekeys.clone(),
            &conf.engine,
        ));
        let scheduler = KeyRotationScheduler::new(
            identity.clone(),
            prekeys.clone(),
            sessions.clone(),
            conf.engine.clone(),
        );

        Ok(Self {
            address: SessionAddress::new(conf.device.user_id.clone(), conf.device.device_id),
            store,
            identity,
            prekeys,
            sessions,
            scheduler,
        })
    }
}
