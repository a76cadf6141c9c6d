//! Per-message AEAD shared by pairwise sessions and sender-key groups.
//!
//! A 32-byte message key is expanded with HKDF-SHA256 into a ChaCha20-Poly1305
//! key and nonce. Every message key is used for exactly one message, so the
//! derived nonce never repeats under the same key.

use {
    chacha20poly1305::{
        aead::{AeadInPlace, KeyInit},
        ChaCha20Poly1305,
        Key,
        Nonce,
        Tag,
    },
    hkdf::Hkdf,
    sha2::Sha256,
    thiserror::Error,
    zeroize::Zeroizing,
};

pub const TAG_LEN: usize = 16;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const INFO: &[u8] = b"Hearth_MessageKeys";

pub type MessageKey = Zeroizing<[u8; 32]>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageKeyError {
    #[error("message key expansion failed")]
    Kdf,
    #[error("authentication failed")]
    Aead,
}

fn expand(mk: &[u8; 32]) -> Result<(Zeroizing<[u8; KEY_LEN]>, [u8; NONCE_LEN]), MessageKeyError> {
    let hk = Hkdf::<Sha256>::new(None, mk);
    let mut okm = Zeroizing::new([0u8; KEY_LEN + NONCE_LEN]);
    hk.expand(INFO, &mut *okm).map_err(|_| MessageKeyError::Kdf)?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&okm[..KEY_LEN]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&okm[KEY_LEN..]);
    Ok((key, nonce))
}

/// Encrypt `plaintext`, returning the ciphertext and the detached tag.
pub fn seal(
    mk: &[u8; 32],
    ad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN]), MessageKeyError> {
    let (key, nonce) = expand(mk)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&*key));
    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), ad, &mut buf)
        .map_err(|_| MessageKeyError::Aead)?;

    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(tag.as_slice());
    Ok((buf, out))
}

/// Decrypt and authenticate. Any mismatch in key, `ad`, ciphertext or tag
/// yields [`MessageKeyError::Aead`].
pub fn open(
    mk: &[u8; 32],
    ad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>, MessageKeyError> {
    let (key, nonce) = expand(mk)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&*key));
    let mut buf = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            ad,
            &mut buf,
            Tag::from_slice(tag),
        )
        .map_err(|_| MessageKeyError::Aead)?;
    Ok(buf)
}
