use {
    crate::{command_title, display::json_output, engine::Engine, item, prelude::*},
    hearth_sdk::store::{RecordKind, SecureKeyStore, CURRENT_SCHEMA},
};

/// Print where the store lives and what it holds. Record payloads are never
/// decrypted here.
pub(crate) fn store_status(conf: &CliConf) -> AnyResult<(), HearthCliError> {
    command_title!("Key store status");

    let engine = Engine::open(conf)?;
    let schema = engine.store.schema_version().map_err(HearthCliError::Store)?;

    item!("Path: {}", engine.store.path().display().to_string().truecolor(100, 100, 100));
    if schema == CURRENT_SCHEMA {
        item!("Schema: v{schema}");
    } else {
        item!(
            "Schema: v{schema} {}",
            format!("(run `hearth store migrate` to upgrade to v{CURRENT_SCHEMA})").yellow()
        );
    }

    let mut counts = serde_json::Map::new();
    for kind in RecordKind::ALL {
        let count = engine.store.list(kind).map_err(HearthCliError::Store)?.len();
        if count > 0 {
            item!("{kind}: {count}");
        }
        counts.insert(kind.to_string(), count.into());
    }

    json_output(&serde_json::json!({
        "path": engine.store.path(),
        "schema": schema,
        "current_schema": CURRENT_SCHEMA,
        "records": counts,
    }))?;

    Ok(())
}
