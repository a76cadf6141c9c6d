use {
    crate::{command_title, display::json_output, engine::Engine, loading, notify_success, prelude::*},
    hearth_sdk::store::{SecureKeyStore, CURRENT_SCHEMA},
};

/// Upgrade the store in place.
pub(crate) fn store_migrate(conf: &CliConf) -> AnyResult<(), HearthCliError> {
    command_title!("Migrating key store to schema v{CURRENT_SCHEMA}");

    let engine = Engine::open(conf)?;
    let from = engine.store.schema_version().map_err(HearthCliError::Store)?;

    let migrate_handle = loading!("Rewriting records...");
    let report = match engine.store.migrate(from, CURRENT_SCHEMA) {
        Ok(report) => report,
        Err(e) => {
            migrate_handle.error();
            return Err(HearthCliError::Store(e));
        }
    };
    migrate_handle.success();

    if report.is_noop() {
        notify_success!("Store is already at schema v{CURRENT_SCHEMA}");
    } else {
        notify_success!(
            "Upgraded v{} to v{}: {} records before, {} after",
            report.from,
            report.to,
            report.records_before,
            report.records_after
        );
    }

    json_output(&serde_json::json!({
        "from": report.from,
        "to": report.to,
        "records_before": report.records_before,
        "records_after": report.records_after,
    }))?;

    Ok(())
}
