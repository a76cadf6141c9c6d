use thiserror::Error;

/// Failures raised while sealing or opening records with a [`KeyProvider`]
/// backed encryption scheme.
///
/// [`KeyProvider`]: super::traits::KeyProvider
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SecretStoreError {
    #[error("serialization codec error: {0}")]
    Codec(String),
    #[error("cryptography failure: {0}")]
    Crypto(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("provider failure: {0}")]
    Provider(String),
    #[error("sealed blob is shorter than its nonce ({0} bytes)")]
    Truncated(usize),
}
