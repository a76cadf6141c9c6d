use {
    super::describe_event,
    crate::{command_title, confirm, display::json_output, engine::Engine, item, loading, notify_success, prelude::*},
    chrono::Utc,
    hearth_sdk::crypto::rotation::CompromiseSignal,
};

/// Scheduled or emergency key rotation.
pub(crate) fn prekeys_rotate(
    conf: &CliConf,
    compromised: bool,
    reset_identity: bool,
) -> AnyResult<(), HearthCliError> {
    if compromised {
        command_title!("Emergency key rotation");
        confirm!("Every session will be terminated and peers must re-handshake. Continue?");
    } else {
        command_title!("Scheduled key rotation");
    }

    let engine = Engine::open(conf)?;

    let rotate_handle = loading!("Rotating keys...");
    let result = if compromised {
        engine
            .scheduler
            .handle_compromise(Utc::now(), CompromiseSignal { reset_identity })
    } else {
        engine.scheduler.run_periodic(Utc::now())
    };
    let events = match result {
        Ok(events) => events,
        Err(e) => {
            rotate_handle.error();
            return Err(HearthCliError::Crypto(e));
        }
    };
    rotate_handle.success();

    if events.is_empty() {
        notify_success!("Nothing to rotate");
    }
    for event in &events {
        item!("{}", describe_event(event));
    }

    json_output(&events.iter().map(describe_event).collect::<Vec<_>>())?;

    Ok(())
}
