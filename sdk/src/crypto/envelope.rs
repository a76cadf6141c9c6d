//! Wire envelopes.
//!
//! Every message starts with a version byte and a type tag; all integers are
//! big-endian.
//!
//! ```text
//! 0x01 ratchet envelope      ratchet_key[32] counter:u32 prev_chain_len:u32
//!                            ct_len:u32 ct tag[16]
//! 0x02 pre-key message       identity[32] base_key[32] spk_id:u32
//!                            otpk_flag:u8 otpk_id:u32 inner_len:u32 inner
//! 0x03 sender-key dist.      group_len:u16 group key_id:u32 iteration:u32
//!                            chain_key[32] signing_key[32] signature[64]
//! 0x04 sender-key message    key_id:u32 iteration:u32 ct_len:u32 ct tag[16]
//!                            signature[64]
//! ```
//!
//! The inner envelope of a pre-key message is a complete ratchet envelope,
//! version and tag included. Decoding is strict: truncated input, trailing
//! bytes and out-of-range flags are all rejected.

use {
    super::message_keys::TAG_LEN,
    crate::wire::{put_var_bytes, Reader, Truncated},
    thiserror::Error,
    x25519_dalek::PublicKey,
    zeroize::Zeroizing,
};

pub const WIRE_VERSION: u8 = 0x01;

const TAG_RATCHET: u8 = 0x01;
const TAG_PRE_KEY: u8 = 0x02;
const TAG_DISTRIBUTION: u8 = 0x03;
const TAG_SENDER_KEY: u8 = 0x04;

pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported wire version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("message truncated")]
    Truncated,
    #[error("trailing bytes after message")]
    TrailingBytes,
    #[error("invalid flag value {0:#04x}")]
    InvalidFlag(u8),
    #[error("group id is not valid UTF-8")]
    InvalidGroupId,
    #[error("expected message type {expected:#04x}, found {found:#04x}")]
    UnexpectedType { expected: u8, found: u8 },
}

impl From<Truncated> for CodecError {
    fn from(_: Truncated) -> Self {
        CodecError::Truncated
    }
}

/// One double-ratchet message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetEnvelope {
    pub ratchet_key: PublicKey,
    pub counter: u32,
    pub previous_chain_length: u32,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl RatchetEnvelope {
    /// Authenticated header: everything up to the ciphertext length.
    pub fn header_bytes(ratchet_key: &PublicKey, counter: u32, previous_chain_length: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 32 + 8);
        out.push(WIRE_VERSION);
        out.push(TAG_RATCHET);
        out.extend_from_slice(ratchet_key.as_bytes());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&previous_chain_length.to_be_bytes());
        out
    }

    pub fn header(&self) -> Vec<u8> {
        Self::header_bytes(&self.ratchet_key, self.counter, self.previous_chain_length)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.header();
        put_var_bytes(&mut out, &self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    fn read_body(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            ratchet_key: PublicKey::from(r.array::<32>()?),
            counter: r.u32()?,
            previous_chain_length: r.u32()?,
            ciphertext: r.var_bytes()?.to_vec(),
            tag: r.array()?,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        match WireMessage::decode(bytes)? {
            WireMessage::Ratchet(env) => Ok(env),
            other => Err(CodecError::UnexpectedType {
                expected: TAG_RATCHET,
                found: other.type_tag(),
            }),
        }
    }
}

/// First message(s) of a session, carrying the X3DH parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeyEnvelope {
    pub identity_key: PublicKey,
    pub base_key: PublicKey,
    pub signed_pre_key_id: u32,
    pub one_time_pre_key_id: Option<u32>,
    pub message: RatchetEnvelope,
}

impl PreKeyEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![WIRE_VERSION, TAG_PRE_KEY];
        out.extend_from_slice(self.identity_key.as_bytes());
        out.extend_from_slice(self.base_key.as_bytes());
        out.extend_from_slice(&self.signed_pre_key_id.to_be_bytes());
        match self.one_time_pre_key_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_be_bytes());
            }
            None => {
                out.push(0);
                out.extend_from_slice(&0u32.to_be_bytes());
            }
        }
        put_var_bytes(&mut out, &self.message.encode());
        out
    }

    fn read_body(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let identity_key = PublicKey::from(r.array::<32>()?);
        let base_key = PublicKey::from(r.array::<32>()?);
        let signed_pre_key_id = r.u32()?;
        let flag = r.u8()?;
        let id = r.u32()?;
        let one_time_pre_key_id = match (flag, id) {
            (1, id) => Some(id),
            (0, 0) => None,
            (flag, _) => return Err(CodecError::InvalidFlag(flag)),
        };
        let message = RatchetEnvelope::decode(r.var_bytes()?)?;
        Ok(Self {
            identity_key,
            base_key,
            signed_pre_key_id,
            one_time_pre_key_id,
            message,
        })
    }
}

/// Hands a group sender key to one member over the pairwise channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderKeyDistributionMessage {
    pub group_id: String,
    pub key_id: u32,
    pub iteration: u32,
    pub chain_key: Zeroizing<[u8; 32]>,
    pub signing_key: PublicKey,
    pub signature: [u8; SIGNATURE_LEN],
}

impl SenderKeyDistributionMessage {
    /// Bytes covered by `signature`.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let group = self.group_id.as_bytes();
        let mut out = Vec::with_capacity(2 + 2 + group.len() + 8 + 64);
        out.push(WIRE_VERSION);
        out.push(TAG_DISTRIBUTION);
        // Group ids longer than u16::MAX are rejected when the key is created.
        out.extend_from_slice(&(group.len() as u16).to_be_bytes());
        out.extend_from_slice(group);
        out.extend_from_slice(&self.key_id.to_be_bytes());
        out.extend_from_slice(&self.iteration.to_be_bytes());
        out.extend_from_slice(&*self.chain_key);
        out.extend_from_slice(self.signing_key.as_bytes());
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.signed_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    fn read_body(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = r.u16()? as usize;
        let group_id = std::str::from_utf8(r.bytes(len)?)
            .map_err(|_| CodecError::InvalidGroupId)?
            .to_owned();
        Ok(Self {
            group_id,
            key_id: r.u32()?,
            iteration: r.u32()?,
            chain_key: Zeroizing::new(r.array()?),
            signing_key: PublicKey::from(r.array::<32>()?),
            signature: r.array()?,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        match WireMessage::decode(bytes)? {
            WireMessage::SenderKeyDistribution(msg) => Ok(msg),
            other => Err(CodecError::UnexpectedType {
                expected: TAG_DISTRIBUTION,
                found: other.type_tag(),
            }),
        }
    }
}

/// One group message, signed by the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderKeyMessage {
    pub key_id: u32,
    pub iteration: u32,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

impl SenderKeyMessage {
    /// Version, tag, key id and iteration. Used as AEAD associated data.
    pub fn header_bytes(key_id: u32, iteration: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        out.push(WIRE_VERSION);
        out.push(TAG_SENDER_KEY);
        out.extend_from_slice(&key_id.to_be_bytes());
        out.extend_from_slice(&iteration.to_be_bytes());
        out
    }

    /// Bytes covered by `signature`.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Self::header_bytes(self.key_id, self.iteration);
        put_var_bytes(&mut out, &self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.signed_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    fn read_body(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            key_id: r.u32()?,
            iteration: r.u32()?,
            ciphertext: r.var_bytes()?.to_vec(),
            tag: r.array()?,
            signature: r.array()?,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        match WireMessage::decode(bytes)? {
            WireMessage::SenderKey(msg) => Ok(msg),
            other => Err(CodecError::UnexpectedType {
                expected: TAG_SENDER_KEY,
                found: other.type_tag(),
            }),
        }
    }
}

/// Any message the engine puts on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    Ratchet(RatchetEnvelope),
    PreKey(PreKeyEnvelope),
    SenderKeyDistribution(SenderKeyDistributionMessage),
    SenderKey(SenderKeyMessage),
}

impl WireMessage {
    pub fn type_tag(&self) -> u8 {
        match self {
            WireMessage::Ratchet(_) => TAG_RATCHET,
            WireMessage::PreKey(_) => TAG_PRE_KEY,
            WireMessage::SenderKeyDistribution(_) => TAG_DISTRIBUTION,
            WireMessage::SenderKey(_) => TAG_SENDER_KEY,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            WireMessage::Ratchet(m) => m.encode(),
            WireMessage::PreKey(m) => m.encode(),
            WireMessage::SenderKeyDistribution(m) => m.encode(),
            WireMessage::SenderKey(m) => m.encode(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != WIRE_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let msg = match r.u8()? {
            TAG_RATCHET => WireMessage::Ratchet(RatchetEnvelope::read_body(&mut r)?),
            TAG_PRE_KEY => WireMessage::PreKey(PreKeyEnvelope::read_body(&mut r)?),
            TAG_DISTRIBUTION => {
                WireMessage::SenderKeyDistribution(SenderKeyDistributionMessage::read_body(&mut r)?)
            }
            TAG_SENDER_KEY => WireMessage::SenderKey(SenderKeyMessage::read_body(&mut r)?),
            other => return Err(CodecError::UnknownType(other)),
        };
        if r.remaining() != 0 {
            return Err(CodecError::TrailingBytes);
        }
        Ok(msg)
    }
}
