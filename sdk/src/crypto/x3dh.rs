#![forbid(unsafe_code)]
//! # X3DH: Extended Triple Diffie‑Hellman key agreement
//!
//! X3DH lets an initiator derive a shared secret with a responder that is
//! offline, using the responder's published [`KeyBundle`]. The secret seeds
//! the root key of the double ratchet; no payload is encrypted here.
//!
//! ## High‑level flow
//!
//! ```text
//! Initiator                                 Responder (may be offline)
//! ───────────────────────────────────────────────────────────
//! IdentityKey                          IdentityKey + signed pre-key
//!                                     │
//!                                     ├─► publish KeyBundle ──┐
//! ┌─(1) fetch bundle ◄────────────────┘                       │
//! │                                                      (directory)
//! │  (2) initiator_agree()                                    │
//! ├─► HandshakeHeader (inside the first pre-key message) ─────┤
//!                                     └─► (3) responder_agree() ═╝
//! ```
//!
//! After step (3) both sides hold the same 32‑byte [`SharedSecret`].
//!
//! ## Example
//!
//! ```
//! use hearth_sdk::crypto::x3dh::{initiator_agree, responder_agree, IdentityKey, KeyBundle};
//! use x25519_dalek::StaticSecret;
//! use rand::rngs::OsRng;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let alice = IdentityKey::generate()?;
//! let bob = IdentityKey::generate()?;
//!
//! let spk = StaticSecret::random_from_rng(OsRng);
//! let bundle = KeyBundle::new(&bob, 1, &spk, None);
//!
//! let (header, alice_sk) = initiator_agree(&alice, &bundle)?;
//! let bob_sk = responder_agree(&bob, &spk, None, &header)?;
//!
//! assert_eq!(&*alice_sk, &*bob_sk);
//! # Ok(()) }
//! ```

use subtle::ConstantTimeEq; // Constant‑time comparison
use {
    super::secret_bytes::{generate_static_secret, SecretBytes},
    hkdf::Hkdf,
    rand::rngs::OsRng,
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    sha2::Sha256,
    thiserror::Error,
    x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret},
    xeddsa::{
        xed25519::{PrivateKey as XEdPrivate, PublicKey as XEdPublic},
        Sign,
        Verify,
    },
    zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing},
};

/// Curve identifier for `Encode(PK)` (see section 2.5 of the X3DH paper).
const CURVE_ID_X25519: u8 = 0x05;
/// String fed into HKDF's `info` field.
const HKDF_INFO: &[u8] = b"Hearth_X3DH_v1";

/// Shared secret produced by X3DH.
///
/// The `Zeroizing` wrapper guarantees that the 32‑byte buffer is wiped from
/// memory when dropped, preventing accidental key leakage.
pub type SharedSecret = Zeroizing<[u8; 32]>;

// === Error handling ===

/// Enumeration of all errors that may arise when running X3DH.
#[derive(Debug, Error)]
pub enum X3dhError {
    /// Signature verification of the signed pre‑key (SPK) failed.
    #[error("signature verification failed")]
    SigVerifyFailed,
    /// The handshake references an OTPK whose secret was not supplied.
    #[error("OTPK secret missing - refuse to process one-time pre-key message")]
    MissingOneTimeSecret,
    /// An OTPK secret was supplied for a handshake that did not use one.
    #[error("unexpected one-time pre-key secret")]
    UnexpectedOneTimeSecret,
    /// Identity X25519 and XEdDSA public keys are not the Edwards–Montgomery map of each other.
    #[error("identity DH and Ed keys do not match")]
    IdentityKeyMismatch,
    /// A peer key is the all-zero point.
    #[error("invalid public key")]
    InvalidPublicKey,
    /// Internal HKDF error (should be unreachable under sane parameters).
    #[error("HKDF output length is wrong")]
    HkdfInvalidLength,
    /// The OS entropy source failed while generating the ephemeral key.
    #[error("entropy source failure: {0}")]
    Entropy(#[from] rand_core::Error),
}

impl From<hkdf::InvalidLength> for X3dhError {
    fn from(_: hkdf::InvalidLength) -> Self {
        Self::HkdfInvalidLength
    }
}

// === Helper utilities ===

/// Extension trait for XEdPublic
trait XEdPublicExt {
    /// Return the public key as a `[u8; 32]` reference.
    fn as_bytes(&self) -> &[u8; 32];
    /// Create a new public key from raw bytes.
    fn from_bytes(bytes: [u8; 32]) -> Self;
}

impl XEdPublicExt for XEdPublic {
    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn from_bytes(bytes: [u8; 32]) -> Self {
        XEdPublic(bytes)
    }
}

/// Encode a Curve25519 public key as `curve_id || u_coordinate` (33 bytes).
#[inline]
pub fn encode_pk(pk: &X25519PublicKey) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = CURVE_ID_X25519;
    out[1..].copy_from_slice(pk.as_bytes());
    out
}

/// Reject the all-zero point.
#[inline]
pub(crate) fn validate_pk(pk: &X25519PublicKey) -> Result<(), X3dhError> {
    if pk.as_bytes().ct_eq(&[0u8; 32]).unwrap_u8() == 1 {
        return Err(X3dhError::InvalidPublicKey);
    }
    Ok(())
}

/// HKDF wrapper (SHA‑256) with a 32×`0xff` domain separator.
fn kdf(dhs: &[&[u8]], info: &[u8]) -> Result<SharedSecret, X3dhError> {
    let mut ikm = Vec::with_capacity(32 + 32 * dhs.len());
    // Domain separator – mitigates cross‑protocol attacks.
    ikm.extend([0xffu8; 32]);
    for dh in dhs {
        ikm.extend_from_slice(dh);
    }
    let salt = [0u8; 32];
    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut *okm)?;
    ikm.zeroize();
    Ok(okm)
}

// === Long‑term identity keys ===

/// Combined Diffie‑Hellman and XEdDSA identity key pair.
///
/// A single 32‑byte secret scalar serves double purpose – it is interpreted in
/// Montgomery form for X25519 and in Edwards form for XEdDSA.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct IdentityKey {
    /// 32‑byte X25519 secret.
    secret: StaticSecret,
    /// Corresponding Montgomery public key.
    #[zeroize(skip)]
    pub dh_public: X25519PublicKey,
    /// Edwards private key for signatures.
    signing: XEdPrivate,
    /// Edwards public key for verification.
    #[zeroize(skip)]
    pub verify: XEdPublic,
}

impl IdentityKey {
    /// Generate a fresh identity key pair from the OS entropy source.
    pub fn generate() -> Result<Self, rand_core::Error> {
        Ok(Self::from_secret(generate_static_secret()?))
    }

    /// Get a reference to the secret key
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Create an identity key from an existing secret
    pub fn from_secret(secret: StaticSecret) -> Self {
        let dh_public = X25519PublicKey::from(&secret);
        let signing = XEdPrivate::from(&secret);
        let verify = XEdPublic::from(&dh_public);
        Self {
            secret,
            dh_public,
            signing,
            verify,
        }
    }

    /// XEdDSA signature over `msg`.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.signing.sign(msg, OsRng)
    }
}

/// Verify an XEdDSA signature made by the holder of the X25519 key `signer`.
pub fn verify_signature(signer: &X25519PublicKey, msg: &[u8], sig: &[u8; 64]) -> bool {
    XEdPublic::from(signer).verify(msg, sig).is_ok()
}

// Custom Serde for IdentityKey

impl Serialize for IdentityKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        SecretBytes::from(&self.secret).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for IdentityKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secret_bytes = SecretBytes::deserialize(deserializer)?;
        let secret: StaticSecret = secret_bytes.into();
        Ok(IdentityKey::from_secret(secret))
    }
}

// === Published key material ===

/// Public bundle a device publishes through the key directory.
///
/// The bundle contains:
/// * the *Signed Pre‑Key* (SPK) plus its identifier and XEdDSA signature,
/// * the long‑term *Identity Key* in both DH and Edwards form,
/// * **optionally** one *One‑Time Pre‑Key* (OTPK).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyBundle {
    /// Identifier of the signed pre‑key.
    pub spk_id: u32,
    /// SPK public key.
    #[serde(with = "x25519_serde")]
    pub spk_pub: X25519PublicKey,
    /// XEdDSA signature over `Encode(spk_pub)`.
    #[serde(with = "serde_big_array::BigArray")]
    pub spk_sig: [u8; 64],
    /// Raw bytes of `Ed25519(IK)`, used to check the SPK signature.
    pub identity_verify_bytes: [u8; 32],
    /// DH form of the identity key.
    #[serde(with = "x25519_serde")]
    pub identity_pk: X25519PublicKey,
    /// Identifier of the accompanying OTPK (if any).
    pub otpk_id: Option<u32>,
    /// OTPK public key.
    #[serde(with = "option_x25519_serde")]
    pub otpk_pub: Option<X25519PublicKey>,
}

impl KeyBundle {
    /// Assemble a bundle, signing the SPK with `identity`.
    pub fn new(
        identity: &IdentityKey,
        spk_id: u32,
        spk_secret: &StaticSecret,
        otpk: Option<(u32, X25519PublicKey)>,
    ) -> Self {
        let spk_pub = X25519PublicKey::from(spk_secret);
        Self::from_parts(
            identity.dh_public,
            spk_id,
            spk_pub,
            identity.sign(&encode_pk(&spk_pub)),
            otpk,
        )
    }

    /// Assemble a bundle from already signed parts.
    pub fn from_parts(
        identity_pk: X25519PublicKey,
        spk_id: u32,
        spk_pub: X25519PublicKey,
        spk_sig: [u8; 64],
        otpk: Option<(u32, X25519PublicKey)>,
    ) -> Self {
        Self {
            spk_id,
            spk_pub,
            spk_sig,
            identity_verify_bytes: *XEdPublic::from(&identity_pk).as_bytes(),
            identity_pk,
            otpk_id: otpk.map(|(id, _)| id),
            otpk_pub: otpk.map(|(_, pk)| pk),
        }
    }

    /// Verify `spk_sig` and the Montgomery⇄Edwards mapping for the identity.
    pub fn verify(&self) -> Result<(), X3dhError> {
        let identity_verify = XEdPublic::from_bytes(self.identity_verify_bytes);
        let expected_verify = XEdPublic::from(&self.identity_pk);
        if identity_verify
            .as_bytes()
            .ct_eq(expected_verify.as_bytes())
            .unwrap_u8()
            == 0
        {
            return Err(X3dhError::IdentityKeyMismatch);
        }
        identity_verify
            .verify(&encode_pk(&self.spk_pub), &self.spk_sig)
            .map_err(|_| X3dhError::SigVerifyFailed)
    }
}

// === Serde helpers ===

/// Serde (de)serialization for `x25519_dalek::PublicKey`.
///
/// Serializes as a raw 32‑byte string.
pub mod x25519_serde {
    use {
        super::X25519PublicKey,
        serde::{
            de::{Error, Visitor},
            Deserializer,
            Serializer,
        },
        std::fmt,
    };

    pub fn serialize<S>(key: &X25519PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(key.as_bytes())
    }

    struct PublicKeyVisitor;

    impl<'de> Visitor<'de> for PublicKeyVisitor {
        type Value = X25519PublicKey;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a 32‑byte X25519 public key")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: Error,
        {
            let bytes: [u8; 32] = v
                .try_into()
                .map_err(|_| E::custom(format!("expected 32 bytes, got {}", v.len())))?;
            Ok(X25519PublicKey::from(bytes))
        }

        // Human readable formats (JSON) hand byte strings over as sequences.
        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::SeqAccess<'de>,
        {
            let mut bytes = [0u8; 32];
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(i, &self))?;
            }
            if seq.next_element::<u8>()?.is_some() {
                return Err(A::Error::custom("expected exactly 32 bytes"));
            }
            Ok(X25519PublicKey::from(bytes))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<X25519PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(PublicKeyVisitor)
    }
}

/// Serde (de)serialization for `Option<x25519_dalek::PublicKey>`.
pub mod option_x25519_serde {
    use {
        serde::{Deserialize, Deserializer, Serialize, Serializer},
        x25519_dalek::PublicKey as X25519PublicKey,
    };

    pub fn serialize<S>(maybe: &Option<X25519PublicKey>, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        maybe.as_ref().map(|pk| pk.as_bytes()).serialize(ser)
    }

    pub fn deserialize<'de, D>(de: D) -> Result<Option<X25519PublicKey>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let maybe_bytes: Option<[u8; 32]> = Option::deserialize(de)?;
        Ok(maybe_bytes.map(X25519PublicKey::from))
    }
}

// === Handshake ===

/// X3DH parameters the initiator sends alongside its first ratchet message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeHeader {
    /// Initiator identity key (DH form).
    pub identity: X25519PublicKey,
    /// Initiator ephemeral ("base") key.
    pub base_key: X25519PublicKey,
    /// Referenced SPK identifier.
    pub spk_id: u32,
    /// Referenced OTPK identifier (if any).
    pub otpk_id: Option<u32>,
}

/// Initiator side: verify `bundle`, derive the shared secret and build the
/// header the responder needs to mirror the computation.
///
/// # Errors
/// * [`X3dhError::SigVerifyFailed`] – SPK signature invalid.
/// * [`X3dhError::IdentityKeyMismatch`] – `Ed(IK_B)` ≠ map(`IK_B`).
/// * [`X3dhError::Entropy`] – the ephemeral key could not be generated.
pub fn initiator_agree(
    initiator: &IdentityKey,
    bundle: &KeyBundle,
) -> Result<(HandshakeHeader, SharedSecret), X3dhError> {
    // 1. Verify SPK signature and identity binding
    bundle.verify()?;
    validate_pk(&bundle.spk_pub)?;
    validate_pk(&bundle.identity_pk)?;

    // 2. Ephemeral key pair
    let ek_secret = generate_static_secret()?;
    let ek_pub = X25519PublicKey::from(&ek_secret);

    // 3. DH computations
    let mut dh1 = initiator.secret.diffie_hellman(&bundle.spk_pub).to_bytes();
    let mut dh2 = ek_secret.diffie_hellman(&bundle.identity_pk).to_bytes();
    let mut dh3 = ek_secret.diffie_hellman(&bundle.spk_pub).to_bytes();
    let mut dh4_opt = bundle
        .otpk_pub
        .as_ref()
        .map(|otpk| ek_secret.diffie_hellman(otpk).to_bytes());

    let mut dh_slices: Vec<&[u8]> = vec![dh1.as_slice(), dh2.as_slice(), dh3.as_slice()];
    if let Some(ref d4) = dh4_opt {
        dh_slices.push(d4.as_slice());
    }
    let sk = kdf(&dh_slices, HKDF_INFO)?;

    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();
    if let Some(ref mut d4) = dh4_opt {
        d4.zeroize();
    }

    let header = HandshakeHeader {
        identity: initiator.dh_public,
        base_key: ek_pub,
        spk_id: bundle.spk_id,
        otpk_id: bundle.otpk_id,
    };
    Ok((header, sk))
}

/// Responder side: mirror [`initiator_agree`] with local pre-key secrets.
///
/// The caller looks up `spk_secret` by `header.spk_id` and consumes the OTPK
/// referenced by `header.otpk_id`.
pub fn responder_agree(
    responder: &IdentityKey,
    spk_secret: &StaticSecret,
    otpk_secret: Option<&StaticSecret>,
    header: &HandshakeHeader,
) -> Result<SharedSecret, X3dhError> {
    match (header.otpk_id, otpk_secret) {
        (Some(_), None) => return Err(X3dhError::MissingOneTimeSecret),
        (None, Some(_)) => return Err(X3dhError::UnexpectedOneTimeSecret),
        _ => {}
    }
    validate_pk(&header.identity)?;
    validate_pk(&header.base_key)?;

    let mut dh1 = spk_secret.diffie_hellman(&header.identity).to_bytes();
    let mut dh2 = responder.secret.diffie_hellman(&header.base_key).to_bytes();
    let mut dh3 = spk_secret.diffie_hellman(&header.base_key).to_bytes();
    let mut dh4_opt = otpk_secret.map(|sk| sk.diffie_hellman(&header.base_key).to_bytes());

    let mut dh_slices: Vec<&[u8]> = vec![dh1.as_slice(), dh2.as_slice(), dh3.as_slice()];
    if let Some(ref d4) = dh4_opt {
        dh_slices.push(d4.as_slice());
    }
    let sk = kdf(&dh_slices, HKDF_INFO)?;

    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();
    if let Some(ref mut d4) = dh4_opt {
        d4.zeroize();
    }

    Ok(sk)
}
