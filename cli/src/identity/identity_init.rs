use {
    crate::{
        command_title,
        display::json_output,
        engine::Engine,
        item,
        loading,
        notify_success,
        prelude::*,
        prekeys::describe_event,
    },
    chrono::Utc,
};

/// Generate the device identity and publishable pre-keys.
pub(crate) fn identity_init(conf: &CliConf) -> AnyResult<(), HearthCliError> {
    command_title!("Generating identity for device {}.{}", conf.device.user_id, conf.device.device_id);

    let engine = Engine::open(conf)?;

    let identity_handle = loading!("Generating identity key...");
    let public = match engine.identity.generate_identity() {
        Ok(public) => public,
        Err(e) => {
            identity_handle.error();
            return Err(HearthCliError::Crypto(e));
        }
    };
    identity_handle.success();

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
    notify_success!("Identity key {}", hex::encode(public.as_bytes()).truecolor(100, 100, 100));

    json_output(&serde_json::json!({
        "identity": hex::encode(public.as_bytes()),
        "events": events.iter().map(describe_event).collect::<Vec<_>>(),
    }))?;

    Ok(())
}
