use {
    rand_core::{OsRng, RngCore},
    serde::{Deserialize, Serialize},
    x25519_dalek::StaticSecret,
    zeroize::{Zeroize, ZeroizeOnDrop},
};

/// A helper struct to serialize and zeroize a 32-byte secret scalar.
/// Use it to serialize StaticSecret and symmetric chain keys.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(#[serde(with = "serde_bytes")] pub [u8; 32]);

impl SecretBytes {
    /// 32 bytes from the OS entropy source.
    pub fn generate() -> Result<Self, rand_core::Error> {
        let mut out = Self([0u8; 32]);
        OsRng.try_fill_bytes(&mut out.0)?;
        Ok(out)
    }

    pub fn to_static_secret(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }
}

impl From<&StaticSecret> for SecretBytes {
    fn from(sk: &StaticSecret) -> Self {
        Self(sk.to_bytes())
    }
}
impl From<SecretBytes> for StaticSecret {
    fn from(raw: SecretBytes) -> Self {
        StaticSecret::from(raw.0)
    }
}

/// Fresh X25519 secret. Unlike `StaticSecret::random_from_rng` this surfaces
/// an entropy failure instead of panicking.
pub fn generate_static_secret() -> Result<StaticSecret, rand_core::Error> {
    Ok(SecretBytes::generate()?.to_static_secret())
}
