use {
    crate::prelude::*,
    hearth_sdk::crypto::rotation::RotationEvent,
};

mod prekeys_bundle;
mod prekeys_rotate;
mod prekeys_status;

use {prekeys_bundle::prekeys_bundle, prekeys_rotate::prekeys_rotate, prekeys_status::prekeys_status};

#[derive(Subcommand, Clone, Debug)]
pub(crate) enum PreKeysCommand {
    #[command(about = "Show signed and one-time pre-key state and the next rotation time.")]
    Status,
    #[command(about = "Run scheduled rotation, or emergency rotation after a suspected compromise.")]
    Rotate {
        /// Treat the device keys as compromised: rotate immediately and
        /// terminate every session.
        #[arg(long)]
        compromised: bool,
        /// With --compromised, also replace the identity key.
        #[arg(long, requires = "compromised")]
        reset_identity: bool,
    },
    #[command(about = "Print a pre-key bundle to publish. Claims one one-time pre-key.")]
    Bundle,
}

/// Handle the provided pre-keys command.
pub(crate) async fn handle(cmd: PreKeysCommand, conf_path: PathBuf) -> AnyResult<(), HearthCliError> {
    let conf = CliConf::load_from_path(&conf_path)
        .await
        .map_err(HearthCliError::Any)?;

    match cmd {
        PreKeysCommand::Status => prekeys_status(&conf),
        PreKeysCommand::Rotate {
            compromised,
            reset_identity,
        } => prekeys_rotate(&conf, compromised, reset_identity),
        PreKeysCommand::Bundle => prekeys_bundle(&conf),
    }
}

/// One line summary of a rotation event.
pub(crate) fn describe_event(event: &RotationEvent) -> String {
    match event {
        RotationEvent::SignedPreKeyRotated { id } => format!("Signed pre-key {id} is now current"),
        RotationEvent::SignedPreKeysPurged { ids } => {
            let ids = ids.iter().map(ToString::to_string).collect::<Vec<_>>();
            format!("Purged expired signed pre-keys {}", ids.join(", "))
        }
        RotationEvent::OneTimePreKeysReplenished { count } => {
            format!("Generated {count} one-time pre-keys")
        }
        RotationEvent::SessionsInvalidated { count } => format!("Terminated {count} sessions"),
        RotationEvent::SafetyNumberChanged {
            affected,
            new_identity,
        } => {
            let peers = affected.iter().map(ToString::to_string).collect::<Vec<_>>();
            match new_identity {
                Some(pk) => format!(
                    "Identity replaced with {}, notify: {}",
                    hex::encode(pk.as_bytes()),
                    peers.join(", ")
                ),
                None => format!("Peers to notify: {}", peers.join(", ")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, hearth_sdk::crypto::session::SessionAddress, rstest::rstest};

    #[rstest]
    #[case(RotationEvent::SignedPreKeyRotated { id: 4 }, "Signed pre-key 4 is now current")]
    #[case(RotationEvent::SignedPreKeysPurged { ids: vec![1, 2] }, "Purged expired signed pre-keys 1, 2")]
    #[case(RotationEvent::OneTimePreKeysReplenished { count: 7 }, "Generated 7 one-time pre-keys")]
    #[case(
        RotationEvent::SafetyNumberChanged {
            affected: vec![SessionAddress::new("bob", 1), SessionAddress::new("carol", 2)],
            new_identity: None,
        },
        "Peers to notify: bob.1, carol.2"
    )]
    fn events_are_described(#[case] event: RotationEvent, #[case] expected: &str) {
        assert_eq!(describe_event(&event), expected);
    }
}
