//! Versioned storage records.
//!
//! Every piece of persisted key material travels through a [`StorageRecord`]
//! whose byte layout is fixed and independent of the in-memory structs:
//!
//! ```text
//! +----------------+-------------+------------------+-----------------+
//! | schema u16 BE  | kind u8     | payload len u32  | payload         |
//! +----------------+-------------+------------------+-----------------+
//! ```
//!
//! The payload is the bincode encoding of the record struct for that schema
//! version. Readers accept every schema tag ever shipped ([`KNOWN_SCHEMAS`])
//! but typed decoding only happens for [`CURRENT_SCHEMA`]; older records must
//! go through [`migrate`](super::SecureKeyStore::migrate) first.

use {
    super::StoreError,
    crate::secret_core::traits::{BincodeCodec, PlaintextCodec},
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::fmt,
    zeroize::{Zeroize, ZeroizeOnDrop},
};

/// Schema written by this version of the crate.
pub const CURRENT_SCHEMA: u16 = 2;
/// First schema ever shipped: key material only, no public-identity split.
pub const LEGACY_SCHEMA_V1: u16 = 1;
/// Every schema tag a reader must understand.
pub const KNOWN_SCHEMAS: [u16; 2] = [LEGACY_SCHEMA_V1, CURRENT_SCHEMA];

const HEADER_LEN: usize = 2 + 1 + 4;

/// What a record holds. The discriminant is part of the on-disk format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    Identity = 1,
    IdentityPublic = 2,
    SignedPreKey = 3,
    OneTimePreKey = 4,
    PreKeyAllocation = 5,
    PreKeyCounters = 6,
    Session = 7,
    SenderKey = 8,
    RemoteIdentity = 9,
    AcceptedBaseKey = 10,
}

impl RecordKind {
    pub const ALL: [RecordKind; 10] = [
        RecordKind::Identity,
        RecordKind::IdentityPublic,
        RecordKind::SignedPreKey,
        RecordKind::OneTimePreKey,
        RecordKind::PreKeyAllocation,
        RecordKind::PreKeyCounters,
        RecordKind::Session,
        RecordKind::SenderKey,
        RecordKind::RemoteIdentity,
        RecordKind::AcceptedBaseKey,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Identity => "identity",
            RecordKind::IdentityPublic => "identity-public",
            RecordKind::SignedPreKey => "signed-prekey",
            RecordKind::OneTimePreKey => "one-time-prekey",
            RecordKind::PreKeyAllocation => "prekey-allocation",
            RecordKind::PreKeyCounters => "prekey-counters",
            RecordKind::Session => "session",
            RecordKind::SenderKey => "sender-key",
            RecordKind::RemoteIdentity => "remote-identity",
            RecordKind::AcceptedBaseKey => "accepted-base-key",
        }
    }

    /// Long-term identity secrets sit behind the unlock gate.
    pub fn requires_unlock(self) -> bool {
        matches!(self, RecordKind::Identity)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a record inside a device-scoped store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub kind: RecordKind,
    pub name: String,
}

impl RecordId {
    pub fn new(kind: RecordKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn identity() -> Self {
        Self::new(RecordKind::Identity, "local")
    }

    pub fn identity_public() -> Self {
        Self::new(RecordKind::IdentityPublic, "local")
    }

    pub fn pre_key_counters() -> Self {
        Self::new(RecordKind::PreKeyCounters, "local")
    }

    pub fn signed_pre_key(id: u32) -> Self {
        Self::new(RecordKind::SignedPreKey, id.to_string())
    }

    pub fn one_time_pre_key(id: u32) -> Self {
        Self::new(RecordKind::OneTimePreKey, id.to_string())
    }

    pub fn pre_key_allocation(id: u32) -> Self {
        Self::new(RecordKind::PreKeyAllocation, id.to_string())
    }

    /// Marker for an X3DH base key already answered with `signed_pre_key_id`.
    /// Lives as long as that signed pre-key.
    pub fn accepted_base_key(signed_pre_key_id: u32, base_key: &[u8; 32]) -> Self {
        Self::new(
            RecordKind::AcceptedBaseKey,
            format!("{signed_pre_key_id}/{}", hex::encode(base_key)),
        )
    }

    /// Numeric suffix for id-keyed kinds (pre-keys and allocations).
    pub fn numeric_name(&self) -> Option<u32> {
        self.name.parse().ok()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Schema-tagged, serialized key material.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct StorageRecord {
    #[zeroize(skip)]
    pub schema_version: u16,
    #[zeroize(skip)]
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

impl fmt::Debug for StorageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRecord")
            .field("schema_version", &self.schema_version)
            .field("kind", &self.kind)
            .field("payload", &format_args!("<{} bytes>", self.payload.len()))
            .finish()
    }
}

impl StorageRecord {
    /// Record at an explicit schema version. Used by migrations and tests
    /// that need to lay down legacy data.
    pub fn with_schema(schema_version: u16, kind: RecordKind, payload: Vec<u8>) -> Self {
        Self {
            schema_version,
            kind,
            payload,
        }
    }

    /// Serialize `value` as a current-schema record.
    pub fn encode<T: Serialize>(kind: RecordKind, value: &T) -> Result<Self, StoreError> {
        Ok(Self::with_schema(
            CURRENT_SCHEMA,
            kind,
            BincodeCodec::encode(value)?,
        ))
    }

    /// Decode the payload as a current-schema `T`.
    ///
    /// Records from an older schema are refused with
    /// [`StoreError::MigrationRequired`] so that callers never operate on
    /// mixed-schema data.
    pub fn decode<T: DeserializeOwned>(&self, expected: RecordKind) -> Result<T, StoreError> {
        if self.kind != expected {
            return Err(StoreError::Corrupt(format!(
                "expected a {expected} record, found {}",
                self.kind
            )));
        }
        if self.schema_version != CURRENT_SCHEMA {
            if KNOWN_SCHEMAS.contains(&self.schema_version) {
                return Err(StoreError::MigrationRequired {
                    found: self.schema_version,
                });
            }
            return Err(StoreError::UnsupportedVersion(self.schema_version));
        }
        Ok(BincodeCodec::decode(&self.payload)?)
    }

    /// Bit-exact encoding, see the module docs.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.schema_version.to_be_bytes());
        out.push(self.kind.tag());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse the bit-exact encoding. Unknown schema tags fail closed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < HEADER_LEN {
            return Err(StoreError::Corrupt("record header truncated".into()));
        }
        let schema_version = u16::from_be_bytes([bytes[0], bytes[1]]);
        if !KNOWN_SCHEMAS.contains(&schema_version) {
            return Err(StoreError::UnsupportedVersion(schema_version));
        }
        let kind = RecordKind::from_tag(bytes[2])
            .ok_or_else(|| StoreError::Corrupt(format!("unknown record kind {}", bytes[2])))?;
        let len = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != len {
            return Err(StoreError::Corrupt(format!(
                "record payload is {} bytes, header says {len}",
                payload.len()
            )));
        }
        Ok(Self::with_schema(schema_version, kind, payload.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn layout_is_bit_exact() {
        let record = StorageRecord::with_schema(2, RecordKind::Session, vec![0xaa, 0xbb]);
        assert_eq!(
            record.to_bytes(),
            vec![0x00, 0x02, 0x07, 0x00, 0x00, 0x00, 0x02, 0xaa, 0xbb]
        );
        assert_eq!(StorageRecord::from_bytes(&record.to_bytes()).unwrap(), record);
    }

    #[test]
    fn legacy_tag_parses_but_does_not_decode() {
        let v1 = StorageRecord::with_schema(LEGACY_SCHEMA_V1, RecordKind::OneTimePreKey, vec![]);
        let parsed = StorageRecord::from_bytes(&v1.to_bytes()).unwrap();
        assert_eq!(parsed.schema_version, 1);
        assert_matches!(
            parsed.decode::<u32>(RecordKind::OneTimePreKey),
            Err(StoreError::MigrationRequired { found: 1 })
        );
    }

    #[test]
    fn unknown_schema_fails_closed() {
        let mut bytes = StorageRecord::with_schema(2, RecordKind::Identity, vec![1]).to_bytes();
        bytes[1] = 9;
        assert_matches!(
            StorageRecord::from_bytes(&bytes),
            Err(StoreError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn length_mismatch_is_corrupt() {
        let mut bytes = StorageRecord::with_schema(2, RecordKind::Identity, vec![1, 2]).to_bytes();
        bytes.pop();
        assert_matches!(StorageRecord::from_bytes(&bytes), Err(StoreError::Corrupt(_)));
    }

    #[test]
    fn decode_checks_kind() {
        let record = StorageRecord::encode(RecordKind::Session, &7u32).unwrap();
        assert_eq!(record.decode::<u32>(RecordKind::Session).unwrap(), 7);
        assert_matches!(
            record.decode::<u32>(RecordKind::SenderKey),
            Err(StoreError::Corrupt(_))
        );
    }

    #[test]
    fn record_ids_render_as_paths() {
        assert_eq!(RecordId::one_time_pre_key(42).to_string(), "one-time-prekey/42");
        assert_eq!(RecordId::one_time_pre_key(42).numeric_name(), Some(42));
        assert_eq!(RecordId::identity().to_string(), "identity/local");
    }
}
