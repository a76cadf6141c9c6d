//! Safety numbers: a 60 digit fingerprint of two identity keys that both
//! parties can compare out of band.
//!
//! Each identity key is hashed on its own into 30 digits; the two halves are
//! concatenated in lexicographic order so the result does not depend on who
//! computes it.

use {
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha512},
    std::fmt,
    subtle::ConstantTimeEq,
    x25519_dalek::PublicKey,
};

const FINGERPRINT_VERSION: u16 = 0;
const ITERATIONS: usize = 5200;
const CHUNKS: usize = 6;
const CHUNK_LEN: usize = 5;

/// Number of decimal digits in a safety number.
pub const SAFETY_NUMBER_DIGITS: usize = 60;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyNumber(String);

impl SafetyNumber {
    /// Derive the safety number for a pair of identity keys. Swapping the
    /// arguments yields the same value.
    pub fn compute(own: &PublicKey, peer: &PublicKey) -> Self {
        let mut halves = [half(own.as_bytes()), half(peer.as_bytes())];
        halves.sort();
        Self(halves.concat())
    }

    /// The bare 60 digits.
    pub fn digits(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison, e.g. against digits scanned from a QR code.
    pub fn matches(&self, other: &str) -> bool {
        self.0.len() == other.len() && self.0.as_bytes().ct_eq(other.as_bytes()).into()
    }
}

/// Twelve groups of five digits separated by spaces.
impl fmt::Display for SafetyNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.0.as_bytes().chunks(CHUNK_LEN).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            // Only ASCII digits are ever stored.
            f.write_str(std::str::from_utf8(group).map_err(|_| fmt::Error)?)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SafetyNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SafetyNumber({self})")
    }
}

fn half(key: &[u8; 32]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(FINGERPRINT_VERSION.to_be_bytes());
    hasher.update(key);
    // The key doubles as the stable identifier.
    hasher.update(key);
    let mut hash = hasher.finalize();

    for _ in 0..ITERATIONS {
        let mut hasher = Sha512::new();
        hasher.update(hash);
        hasher.update(key);
        hash = hasher.finalize();
    }

    let mut out = String::with_capacity(SAFETY_NUMBER_DIGITS / 2);
    for chunk in hash[..CHUNKS * CHUNK_LEN].chunks(CHUNK_LEN) {
        let value = chunk.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        out.push_str(&format!("{:05}", value % 100_000));
    }
    out
}
