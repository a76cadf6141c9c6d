use crate::{command_title, display::json_output, engine::Engine, item, prelude::*};

/// Print the pre-key inventory.
pub(crate) fn prekeys_status(conf: &CliConf) -> AnyResult<(), HearthCliError> {
    command_title!("Pre-key status");

    let engine = Engine::open(conf)?;
    let signed = engine.prekeys.signed_pre_keys().map_err(HearthCliError::Crypto)?;
    let current = signed.iter().find(|k| k.superseded_at.is_none()).map(|k| k.id);
    let total = engine
        .prekeys
        .one_time_pre_key_count()
        .map_err(HearthCliError::Crypto)?;
    let unallocated = engine
        .prekeys
        .unallocated_one_time_pre_key_count()
        .map_err(HearthCliError::Crypto)?;
    let due = engine
        .scheduler
        .next_rotation_due()
        .map_err(HearthCliError::Crypto)?;

    for key in &signed {
        match key.superseded_at {
            Some(at) => item!(
                "Signed pre-key {} created {} superseded {}",
                key.id,
                key.created_at.to_rfc3339(),
                at.to_rfc3339().truecolor(100, 100, 100)
            ),
            None => item!(
                "Signed pre-key {} created {} {}",
                key.id,
                key.created_at.to_rfc3339(),
                "(current)".green()
            ),
        }
    }
    item!(
        "One-time pre-keys: {total} stored, {unallocated} not yet published (target {})",
        conf.engine.one_time_pre_key_target
    );
    match due {
        Some(due) => item!("Next rotation due {}", due.to_rfc3339()),
        None => item!("{}", "Rotation due now".yellow()),
    }

    json_output(&serde_json::json!({
        "current_signed_pre_key": current,
        "signed_pre_keys": signed.iter().map(|k| serde_json::json!({
            "id": k.id,
            "public": hex::encode(k.public.as_bytes()),
            "created_at": k.created_at.to_rfc3339(),
            "superseded_at": k.superseded_at.map(|at| at.to_rfc3339()),
        })).collect::<Vec<_>>(),
        "one_time_pre_keys": total,
        "unallocated_one_time_pre_keys": unallocated,
        "next_rotation_due": due.map(|d| d.to_rfc3339()),
    }))?;

    Ok(())
}
