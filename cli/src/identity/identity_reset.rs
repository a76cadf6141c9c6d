use {
    crate::{
        command_title,
        confirm,
        display::json_output,
        engine::Engine,
        item,
        loading,
        notify_success,
        prelude::*,
        prekeys::describe_event,
    },
    chrono::Utc,
    hearth_sdk::crypto::identity::AccountReset,
};

/// Replace the identity key and every piece of key material derived from
/// it, then bootstrap fresh pre-keys.
pub(crate) fn identity_reset(conf: &CliConf) -> AnyResult<(), HearthCliError> {
    command_title!("Resetting the identity key");

    confirm!("All sessions, pre-keys and group keys will be destroyed and every peer will see a new safety number. Continue?");

    let engine = Engine::open(conf)?;

    let reset_handle = loading!("Replacing identity key...");
    let public = match engine.identity.reset_identity(AccountReset::DestroyAllSessions) {
        Ok(public) => public,
        Err(e) => {
            reset_handle.error();
            return Err(HearthCliError::Crypto(e));
        }
    };
    reset_handle.success();

    let prekeys_handle = loading!("Generating pre-keys...");
    let events = match engine.scheduler.run_periodic(Utc::now()) {
        Ok(events) => events,
        Err(e) => {
            prekeys_handle.error();
            return Err(HearthCliError::Crypto(e));
        }
    };
    prekeys_handle.success();

    for event in &events {
        item!("{}", describe_event(event));
    }
    notify_success!("New identity key {}", hex::encode(public.as_bytes()).truecolor(100, 100, 100));

    json_output(&serde_json::json!({
        "identity": hex::encode(public.as_bytes()),
        "events": events.iter().map(describe_event).collect::<Vec<_>>(),
    }))?;

    Ok(())
}
