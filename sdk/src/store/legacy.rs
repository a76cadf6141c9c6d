//! Payload layouts of schema v1.
//!
//! Schema v1 only persisted raw key material. It kept no public-identity
//! record, signed pre-keys carried a unix timestamp and no supersession
//! marker, and there were no sessions or sender keys. These shapes are kept
//! so that every v1 store ever written can still be upgraded.

use {
    super::{RecordKind, StorageRecord, StoreError, LEGACY_SCHEMA_V1},
    crate::{
        crypto::secret_bytes::SecretBytes,
        secret_core::traits::{BincodeCodec, PlaintextCodec},
    },
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    serde_big_array::BigArray,
};

#[derive(Serialize, Deserialize)]
pub struct IdentityV1 {
    pub secret: SecretBytes,
}

#[derive(Serialize, Deserialize)]
pub struct SignedPreKeyV1 {
    pub id: u32,
    pub secret: SecretBytes,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
    pub created_at_unix: i64,
}

#[derive(Serialize, Deserialize)]
pub struct OneTimePreKeyV1 {
    pub id: u32,
    pub secret: SecretBytes,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PreKeyCountersV1 {
    pub next_signed_id: u32,
    pub next_one_time_id: u32,
}

/// Wrap a v1 payload in a v1-tagged record.
pub fn encode_v1<T: Serialize>(kind: RecordKind, value: &T) -> Result<StorageRecord, StoreError> {
    Ok(StorageRecord::with_schema(
        LEGACY_SCHEMA_V1,
        kind,
        BincodeCodec::encode(value)?,
    ))
}

pub(super) fn decode_v1<T: DeserializeOwned>(record: &StorageRecord) -> Result<T, StoreError> {
    if record.schema_version != LEGACY_SCHEMA_V1 {
        return Err(StoreError::MixedSchema {
            store: LEGACY_SCHEMA_V1,
            record: record.schema_version,
        });
    }
    Ok(BincodeCodec::decode(&record.payload)?)
}
