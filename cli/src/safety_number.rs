use {
    crate::{command_title, display::json_output, engine::Engine, item, notify_success, prelude::*},
    hearth_sdk::crypto::session::SessionAddress,
    x25519_dalek::PublicKey,
};

/// Whose identity key to compare against.
#[derive(Args, Clone, Debug)]
#[group(required = true, multiple = false)]
pub(crate) struct PeerArgs {
    /// Hex encoded identity key of the peer.
    #[arg(long = "key", value_name = "HEX")]
    key: Option<String>,
    /// Peer device whose identity key is already recorded, as
    /// `<user>.<device>`.
    #[arg(long = "address", value_name = "USER.DEVICE")]
    address: Option<SessionAddress>,
}

/// Show the safety number shared with a peer and optionally compare it with
/// the digits the peer reads out.
pub(crate) async fn safety_number(
    peer: PeerArgs,
    compare: Option<String>,
    conf_path: PathBuf,
) -> AnyResult<(), HearthCliError> {
    let conf = CliConf::load_from_path(&conf_path)
        .await
        .map_err(HearthCliError::Any)?;

    command_title!("Safety number");

    let engine = Engine::open(&conf)?;
    let peer_key = match (peer.key, peer.address) {
        (Some(hex), _) => parse_identity_key(&hex)?,
        (None, Some(address)) => engine
            .identity
            .remote_identity(&address)
            .map_err(HearthCliError::Crypto)?
            .ok_or_else(|| HearthCliError::Any(anyhow!("no identity key recorded for {address}")))?,
        (None, None) => return Err(HearthCliError::Any(anyhow!("either --key or --address is required"))),
    };

    let number = engine
        .identity
        .safety_number_with(&peer_key)
        .map_err(HearthCliError::Crypto)?;
    item!("{}", number.to_string().bold());

    let matches = compare.map(|digits| {
        let digits: String = digits.chars().filter(|c| !c.is_whitespace()).collect();
        number.matches(&digits)
    });

    json_output(&serde_json::json!({
        "safety_number": number.digits(),
        "matches": matches,
    }))?;

    match matches {
        Some(true) => {
            notify_success!("Safety numbers match");
            Ok(())
        }
        Some(false) => Err(HearthCliError::Any(anyhow!(
            "Safety numbers differ, the conversation may be intercepted"
        ))),
        None => Ok(()),
    }
}

fn parse_identity_key(hex_key: &str) -> AnyResult<PublicKey, HearthCliError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| HearthCliError::Any(e.into()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| HearthCliError::Any(anyhow!("identity key must be 32 bytes")))?;

    Ok(PublicKey::from(bytes))
}
