use crate::prelude::*;

mod identity_init;
mod identity_reset;
mod identity_show;

use {identity_init::identity_init, identity_reset::identity_reset, identity_show::identity_show};

#[derive(Subcommand, Clone, Debug)]
pub(crate) enum IdentityCommand {
    #[command(about = "Generate this device's identity key and bootstrap its pre-keys.")]
    Init,
    #[command(about = "Show this device's identity key and what it knows about peers.")]
    Show,
    #[command(
        about = "Replace the identity key. WARNING: This destroys all sessions, pre-keys and group keys!"
    )]
    Reset,
}

/// Handle the provided identity command.
pub(crate) async fn handle(cmd: IdentityCommand, conf_path: PathBuf) -> AnyResult<(), HearthCliError> {
    let conf = CliConf::load_from_path(&conf_path)
        .await
        .map_err(HearthCliError::Any)?;

    match cmd {
        IdentityCommand::Init => identity_init(&conf),
        IdentityCommand::Show => identity_show(&conf),
        IdentityCommand::Reset => identity_reset(&conf),
    }
}
