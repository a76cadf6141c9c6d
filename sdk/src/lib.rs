//! This library contains the Hearth end-to-end encryption core that is shared
//! between the mobile apps, the desktop client and the `hearth` CLI.

/// Engine tunables (skip limits, rotation cadence, pre-key targets). Always
/// available so that hosts can parse configuration without the engine.
pub mod config;

/// Key provider and symmetric encryption traits used by encrypted stores.
#[cfg(feature = "secret_core")]
pub mod secret_core {
    pub mod error;
    pub mod traits;
}

/// The protocol engine: X3DH, double ratchet, sender keys, pre-key
/// management, rotation policy and the wire codec.
#[cfg(feature = "crypto")]
pub mod crypto {
    pub mod double_ratchet;
    pub mod envelope;
    pub mod identity;
    pub mod message_keys;
    pub mod prekeys;
    pub mod rotation;
    pub mod safety_number;
    pub mod secret_bytes;
    pub mod sender_keys;
    pub mod session;
    pub mod x3dh;
}

/// Error taxonomy returned by every engine operation.
#[cfg(feature = "crypto")]
pub mod error;

/// Versioned, typed key storage with schema migrations.
#[cfg(feature = "crypto")]
pub mod store;

#[cfg(feature = "crypto")]
pub(crate) mod wire;
