use crate::{command_title, display::json_output, engine::Engine, item, prelude::*};

/// Print the device identity, known peers and live sessions.
pub(crate) fn identity_show(conf: &CliConf) -> AnyResult<(), HearthCliError> {
    command_title!("Identity of device {}", format!("{}.{}", conf.device.user_id, conf.device.device_id));

    let engine = Engine::open(conf)?;

    let public = engine.identity.public_identity().map_err(HearthCliError::Crypto)?;
    let created_at = engine.identity.created_at().map_err(HearthCliError::Crypto)?;
    let peers = engine.identity.known_peers().map_err(HearthCliError::Crypto)?;
    let sessions = engine.sessions.sessions().map_err(HearthCliError::Crypto)?;

    item!("Address: {}", engine.address.to_string().truecolor(100, 100, 100));
    item!("Identity key: {}", hex::encode(public.as_bytes()).truecolor(100, 100, 100));
    item!("Created at: {}", created_at.to_rfc3339().truecolor(100, 100, 100));
    item!("Known peers: {}", peers.len());

    let mut session_rows = Vec::with_capacity(sessions.len());
    for address in &sessions {
        let Some(info) = engine.sessions.session_info(address).map_err(HearthCliError::Crypto)? else {
            continue;
        };
        item!(
            "Session with {}: {:?}",
            info.address.to_string().bold(),
            info.state
        );
        session_rows.push(serde_json::json!({
            "address": info.address.to_string(),
            "state": format!("{:?}", info.state),
            "remote_identity": hex::encode(info.remote_identity.as_bytes()),
            "created_at": info.created_at.to_rfc3339(),
        }));
    }

    json_output(&serde_json::json!({
        "address": engine.address.to_string(),
        "identity": hex::encode(public.as_bytes()),
        "created_at": created_at.to_rfc3339(),
        "known_peers": peers.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "sessions": session_rows,
    }))?;

    Ok(())
}
