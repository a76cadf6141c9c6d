use crate::prelude::*;

mod store_migrate;
mod store_status;

use {store_migrate::store_migrate, store_status::store_status};

#[derive(Subcommand, Clone, Debug)]
pub(crate) enum StoreCommand {
    #[command(about = "Show the key store location, schema version and record counts.")]
    Status,
    #[command(about = "Upgrade the key store to the current schema. All records or none are rewritten.")]
    Migrate,
}

/// Handle the provided store command.
pub(crate) async fn handle(cmd: StoreCommand, conf_path: PathBuf) -> AnyResult<(), HearthCliError> {
    let conf = CliConf::load_from_path(&conf_path)
        .await
        .map_err(HearthCliError::Any)?;

    match cmd {
        StoreCommand::Status => store_status(&conf),
        StoreCommand::Migrate => store_migrate(&conf),
    }
}
