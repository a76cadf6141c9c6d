//! Crate-level error taxonomy.
//!
//! Module errors ([`X3dhError`], [`RatchetError`], [`CodecError`],
//! [`StoreError`]) fold into [`CryptoError`], which is what every engine
//! operation returns.

use {
    crate::{
        crypto::{
            double_ratchet::RatchetError,
            envelope::CodecError,
            message_keys::MessageKeyError,
            x3dh::X3dhError,
        },
        store::StoreError,
    },
    thiserror::Error,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("duplicate message (counter {counter})")]
    DuplicateMessage { counter: u32 },
    #[error("{requested} skipped messages exceed the limit of {limit}")]
    MaxSkippedMessagesExceeded { requested: u32, limit: u32 },
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("migration: {0}")]
    Migration(String),
    #[error("unauthorized access to {0}")]
    UnauthorizedAccess(String),
    #[error("handshake failed: {0}")]
    Handshake(#[from] X3dhError),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("storage: {0}")]
    Storage(StoreError),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("session with {0} was terminated, a new handshake is required")]
    SessionTerminated(String),
    #[error("an identity already exists on this device")]
    IdentityExists,
    #[error("entropy source failure: {0}")]
    Entropy(String),
}

impl From<StoreError> for CryptoError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::KeyNotFound(id.to_string()),
            StoreError::UnsupportedVersion(v) => Self::UnsupportedVersion(v),
            e @ (StoreError::MigrationRequired { .. }
            | StoreError::MixedSchema { .. }
            | StoreError::Migration(_)) => Self::Migration(e.to_string()),
            StoreError::Unauthorized(id) => Self::UnauthorizedAccess(id.to_string()),
            other => Self::Storage(other),
        }
    }
}

impl From<RatchetError> for CryptoError {
    fn from(e: RatchetError) -> Self {
        match e {
            RatchetError::Duplicate { counter } => Self::DuplicateMessage { counter },
            RatchetError::MaxSkipExceeded { requested, limit } => {
                Self::MaxSkippedMessagesExceeded { requested, limit }
            }
            RatchetError::DecryptionFailed => Self::DecryptionFailed,
            RatchetError::Entropy(e) => Self::Entropy(e),
            other => Self::InvalidState(other.to_string()),
        }
    }
}

impl From<CodecError> for CryptoError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::UnsupportedVersion(v) => Self::UnsupportedVersion(u16::from(v)),
            other => Self::Malformed(other.to_string()),
        }
    }
}

impl From<MessageKeyError> for CryptoError {
    fn from(_: MessageKeyError) -> Self {
        Self::DecryptionFailed
    }
}

impl From<rand_core::Error> for CryptoError {
    fn from(e: rand_core::Error) -> Self {
        Self::Entropy(e.to_string())
    }
}
