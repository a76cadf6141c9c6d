use crate::{command_title, engine::Engine, item, notify_success, prelude::*};

/// Print a bundle for the directory server. The bundle is always JSON so it
/// can be piped straight into an upload.
pub(crate) fn prekeys_bundle(conf: &CliConf) -> AnyResult<(), HearthCliError> {
    command_title!("Pre-key bundle");

    let engine = Engine::open(conf)?;
    let bundle = engine.prekeys.current_bundle().map_err(HearthCliError::Crypto)?;

    match bundle.otpk_id {
        Some(id) => item!("Claimed one-time pre-key {id}"),
        None => item!(
            "{}",
            "No unpublished one-time pre-keys left, run `hearth prekeys rotate`".yellow()
        ),
    }
    notify_success!("Bundle for signed pre-key {}", bundle.spk_id);

    let json = serde_json::to_string_pretty(&bundle).map_err(|e| HearthCliError::Any(e.into()))?;
    println!("{json}");

    Ok(())
}
