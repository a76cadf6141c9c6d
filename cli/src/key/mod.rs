use crate::prelude::*;

mod key_init;
mod key_set_passphrase;
mod key_status;

use {key_init::key_init, key_set_passphrase::key_set_passphrase, key_status::key_status};

#[derive(Subcommand, Clone, Debug)]
pub(crate) enum KeyCommand {
    #[command(
        about = "Generate and store a random 32-byte master key in the OS key-ring. WARNING: An existing key store becomes unreadable and is moved aside!"
    )]
    Init {
        /// Overwrite an existing key.
        #[arg(long)]
        force: bool,
    },
    #[command(about = "Prompt for a pass-phrase and store it securely in the key-ring.")]
    SetPassphrase {
        /// Read the pass-phrase from STDIN instead of an interactive prompt.
        /// Useful for automation scripts.
        #[arg(long)]
        stdin: bool,
        /// Overwrite an existing key.
        #[arg(long)]
        force: bool,
    },
    #[command(about = "Show where the master key is loaded from.")]
    Status,
}

/// Handle the provided key command.
pub(crate) async fn handle(cmd: KeyCommand, conf_path: PathBuf) -> AnyResult<(), HearthCliError> {
    match cmd {
        KeyCommand::Init { force } => key_init(force, conf_path).await,
        KeyCommand::SetPassphrase { stdin, force } => key_set_passphrase(stdin, force, conf_path).await,
        KeyCommand::Status => key_status(),
    }
}

/// Move an existing store file aside because the new master key cannot
/// open it. Returns the backup path.
pub(crate) async fn retire_store_file(conf_path: &Path) -> AnyResult<Option<PathBuf>, HearthCliError> {
    let conf = CliConf::load_from_path(conf_path)
        .await
        .map_err(HearthCliError::Any)?;
    let path = conf.store.path;
    if !tokio::fs::try_exists(&path).await.map_err(HearthCliError::Io)? {
        return Ok(None);
    }

    let mut backup = path.clone().into_os_string();
    backup.push(format!(".{}.bak", chrono::Utc::now().format("%Y%m%d%H%M%S")));
    let backup = PathBuf::from(backup);
    tokio::fs::rename(&path, &backup)
        .await
        .map_err(HearthCliError::Io)?;
    log::warn!("Moved unreadable key store to {}", backup.display());

    Ok(Some(backup))
}
