//! Schema upgrades.
//!
//! [`upgrade`] is pure: it turns a snapshot of every record into the
//! upgraded snapshot or fails without side effects. Store backends commit
//! the result in a single atomic step.

use {
    super::{
        legacy::{decode_v1, IdentityV1, OneTimePreKeyV1, PreKeyCountersV1, SignedPreKeyV1},
        RecordId,
        RecordKind,
        StorageRecord,
        StoreError,
    },
    crate::crypto::{
        identity::{IdentityPublicRecord, IdentityRecord},
        prekeys::{OneTimePreKeyRecord, PreKeyCounters, SignedPreKeyRecord},
    },
    chrono::{DateTime, TimeZone, Utc},
    log::info,
    x25519_dalek::{PublicKey, StaticSecret},
};

type Snapshot = Vec<(RecordId, StorageRecord)>;

pub(super) fn upgrade(from: u16, to: u16, records: Snapshot) -> Result<Snapshot, StoreError> {
    if from > to {
        return Err(StoreError::Migration(format!(
            "downgrade from v{from} to v{to} is not supported"
        )));
    }
    if let Some((id, record)) = records.iter().find(|(_, r)| r.schema_version != from) {
        return Err(StoreError::Migration(format!(
            "{id} is at schema v{}, store claims v{from}",
            record.schema_version
        )));
    }

    let mut records = records;
    let mut version = from;
    while version < to {
        records = match version {
            1 => v1_to_v2(records, Utc::now())?,
            v => {
                return Err(StoreError::Migration(format!(
                    "no migration path from schema v{v}"
                )))
            }
        };
        version += 1;
        info!("[store] upgraded {} records to schema v{version}", records.len());
    }
    Ok(records)
}

fn at(id: &RecordId, e: StoreError) -> StoreError {
    match e {
        StoreError::Migration(msg) => StoreError::Migration(msg),
        other => StoreError::Migration(format!("{id}: {other}")),
    }
}

fn v1_to_v2(records: Snapshot, now: DateTime<Utc>) -> Result<Snapshot, StoreError> {
    // v1 had no notion of a current signed pre-key; the newest one wins and
    // the others enter their grace window from the moment of migration.
    let current_spk = records
        .iter()
        .filter(|(id, _)| id.kind == RecordKind::SignedPreKey)
        .filter_map(|(id, _)| id.numeric_name())
        .max();

    let mut out = Vec::with_capacity(records.len() + 1);
    for (id, record) in records {
        if id.kind != record.kind {
            return Err(StoreError::Migration(format!(
                "{id} holds a {} payload",
                record.kind
            )));
        }
        match record.kind {
            RecordKind::Identity => {
                let v1: IdentityV1 = decode_v1(&record).map_err(|e| at(&id, e))?;
                let public = PublicKey::from(&StaticSecret::from(v1.secret.0)).to_bytes();
                let public_record = IdentityPublicRecord {
                    public,
                    created_at: now,
                };
                let secret_record = IdentityRecord {
                    secret: v1.secret,
                    created_at: now,
                };
                out.push((
                    RecordId::identity_public(),
                    StorageRecord::encode(RecordKind::IdentityPublic, &public_record)
                        .map_err(|e| at(&id, e))?,
                ));
                out.push((
                    id.clone(),
                    StorageRecord::encode(RecordKind::Identity, &secret_record)
                        .map_err(|e| at(&id, e))?,
                ));
            }
            RecordKind::SignedPreKey => {
                let v1: SignedPreKeyV1 = decode_v1(&record).map_err(|e| at(&id, e))?;
                let created_at = Utc
                    .timestamp_opt(v1.created_at_unix, 0)
                    .single()
                    .ok_or_else(|| {
                        StoreError::Migration(format!(
                            "{id}: invalid timestamp {}",
                            v1.created_at_unix
                        ))
                    })?;
                let superseded_at = (Some(v1.id) != current_spk).then_some(now);
                let v2 = SignedPreKeyRecord {
                    id: v1.id,
                    secret: v1.secret,
                    signature: v1.signature,
                    created_at,
                    superseded_at,
                };
                out.push((
                    id.clone(),
                    StorageRecord::encode(RecordKind::SignedPreKey, &v2).map_err(|e| at(&id, e))?,
                ));
            }
            RecordKind::OneTimePreKey => {
                let v1: OneTimePreKeyV1 = decode_v1(&record).map_err(|e| at(&id, e))?;
                let v2 = OneTimePreKeyRecord {
                    id: v1.id,
                    secret: v1.secret,
                    created_at: now,
                };
                out.push((
                    id.clone(),
                    StorageRecord::encode(RecordKind::OneTimePreKey, &v2)
                        .map_err(|e| at(&id, e))?,
                ));
            }
            RecordKind::PreKeyCounters => {
                let v1: PreKeyCountersV1 = decode_v1(&record).map_err(|e| at(&id, e))?;
                let v2 = PreKeyCounters {
                    next_signed_id: v1.next_signed_id,
                    next_one_time_id: v1.next_one_time_id,
                    current_signed_id: current_spk,
                };
                out.push((
                    id.clone(),
                    StorageRecord::encode(RecordKind::PreKeyCounters, &v2)
                        .map_err(|e| at(&id, e))?,
                ));
            }
            other => {
                return Err(StoreError::Migration(format!(
                    "{id}: {other} records did not exist in schema v1"
                )))
            }
        }
    }
    Ok(out)
}
