use {
    crate::{display::*, prelude::*},
    hearth_sdk::{error::CryptoError, store::StoreError},
    thiserror::Error,
};

/// Custom error definitions for the Hearth CLI. Takes care of displaying
/// a pretty summary in the console.
#[derive(Debug, Error)]
pub(crate) enum HearthCliError {
    #[error("{error}{separator}\n{0}", error = "Syntax Error".red().bold(), separator = separator())]
    SyntaxError(clap::error::Error),
    #[error("{error}{separator}\n{0}", error = "IO Error".red().bold(), separator = separator())]
    Io(std::io::Error),
    #[error("{error}{separator}\n{0}", error = "Key Store Error".red().bold(), separator = separator())]
    Store(StoreError),
    #[error("{error}{separator}\n{0}", error = "Crypto Error".red().bold(), separator = separator())]
    Crypto(CryptoError),
    #[error("{error}{separator}\n{0}", error = "Error".red().bold(), separator = separator())]
    Any(anyhow::Error),
}
