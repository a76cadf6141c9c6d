use {
    super::error::SecretStoreError,
    rand::{rngs::OsRng, RngCore},
    serde::{de::DeserializeOwned, Serialize},
    zeroize::Zeroizing,
};

/// Helper to fill random bytes.
#[inline]
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

// Key material

/// A source of key material for at-rest encryption.
///
/// Platform keystores (OS key-ring, secure enclave, HSM) implement this and
/// hand the unwrapped key to the store for the duration of one operation.
pub trait KeyProvider: Send + Sync + 'static {
    type Key: Send + Sync + 'static;
    fn key(&self) -> Result<Self::Key, SecretStoreError>;
}

/// Provider for a 256-bit key that is already held in memory.
#[derive(Clone)]
pub struct StaticKeyProvider(Zeroizing<[u8; 32]>);

impl StaticKeyProvider {
    pub fn new(key: [u8; 32]) -> Self {
        Self(Zeroizing::new(key))
    }

    /// Fresh random key, handy for ephemeral stores.
    pub fn random() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        random_bytes(&mut *key);
        Self(key)
    }
}

impl KeyProvider for StaticKeyProvider {
    type Key = Zeroizing<[u8; 32]>;

    fn key(&self) -> Result<Self::Key, SecretStoreError> {
        Ok(self.0.clone())
    }
}

// Codec
pub trait PlaintextCodec: Default + Send + Sync + 'static {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SecretStoreError>;
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SecretStoreError>;
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BincodeCodec;
impl PlaintextCodec for BincodeCodec {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SecretStoreError> {
        bincode::serialize(value).map_err(|e| SecretStoreError::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SecretStoreError> {
        bincode::deserialize(bytes).map_err(|e| SecretStoreError::Codec(e.to_string()))
    }
}

// Keyed Encryption schema
pub trait KeyedEncryptionAlgo: Default + Send + Sync + 'static {
    type Key: Send + Sync + 'static;
    const NONCE_LEN: usize;
    // Key, nonce, plaintext -> ciphertext
    fn encrypt_with_key(
        key: &Self::Key,
        nonce: &[u8],
        pt: &[u8],
    ) -> Result<Vec<u8>, SecretStoreError>;

    // Key, nonce, ciphertext -> plaintext
    fn decrypt_with_key(
        key: &Self::Key,
        nonce: &[u8],
        ct: &[u8],
    ) -> Result<Vec<u8>, SecretStoreError>;

    /// Seal `pt` under a fresh random nonce and return `nonce || ct`.
    fn seal(key: &Self::Key, pt: &[u8]) -> Result<Vec<u8>, SecretStoreError> {
        let mut nonce = vec![0u8; Self::NONCE_LEN];
        random_bytes(&mut nonce);
        let ct = Self::encrypt_with_key(key, &nonce, pt)?;
        let mut out = Vec::with_capacity(nonce.len() + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Inverse of [`KeyedEncryptionAlgo::seal`].
    fn open(key: &Self::Key, sealed: &[u8]) -> Result<Vec<u8>, SecretStoreError> {
        if sealed.len() < Self::NONCE_LEN {
            return Err(SecretStoreError::Truncated(sealed.len()));
        }
        let (nonce, ct) = sealed.split_at(Self::NONCE_LEN);
        Self::decrypt_with_key(key, nonce, ct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echo "cipher" so the seal/open framing can be checked in isolation.
    #[derive(Default)]
    struct Echo;

    impl KeyedEncryptionAlgo for Echo {
        type Key = ();
        const NONCE_LEN: usize = 4;

        fn encrypt_with_key(_: &(), _: &[u8], pt: &[u8]) -> Result<Vec<u8>, SecretStoreError> {
            Ok(pt.to_vec())
        }

        fn decrypt_with_key(_: &(), _: &[u8], ct: &[u8]) -> Result<Vec<u8>, SecretStoreError> {
            Ok(ct.to_vec())
        }
    }

    #[test]
    fn seal_prefixes_nonce() {
        let sealed = Echo::seal(&(), b"abc").unwrap();
        assert_eq!(sealed.len(), 4 + 3);
        assert_eq!(&sealed[4..], b"abc");
        assert_eq!(Echo::open(&(), &sealed).unwrap(), b"abc");
    }

    #[test]
    fn open_rejects_short_blob() {
        assert!(matches!(
            Echo::open(&(), &[1, 2]),
            Err(SecretStoreError::Truncated(2))
        ));
    }

    #[test]
    fn static_provider_returns_same_key() {
        let provider = StaticKeyProvider::random();
        assert_eq!(*provider.key().unwrap(), *provider.key().unwrap());
    }
}
