mod display;
mod engine;
mod error;
mod identity;
mod key;
mod prekeys;
mod prelude;
mod safety_number;
mod store;
mod utils;

use crate::prelude::*;

#[derive(Parser)]
#[command(version, about = "Hearth CLI")]
struct Cli {
    /// Print a single JSON document instead of human readable output.
    #[arg(long, global = true)]
    json: bool,
    /// Hidden argument used for testing to set the path of the configuration
    /// file.
    #[arg(
        long = "conf-path",
        global = true,
        hide = true,
        default_value = CLI_CONF_PATH,
        value_parser = ValueParser::from(expand_tilde)
    )]
    conf_path: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(subcommand, about = "Manage the master key protecting the key store")]
    Key(key::KeyCommand),
    #[command(subcommand, about = "Manage this device's identity key")]
    Identity(identity::IdentityCommand),
    #[command(subcommand, about = "Manage signed and one-time pre-keys")]
    Prekeys(prekeys::PreKeysCommand),
    #[command(about = "Compute the safety number shared with a peer")]
    SafetyNumber {
        #[command(flatten)]
        peer: safety_number::PeerArgs,
        /// Digits read out by the peer. Spaces are ignored.
        #[arg(long, value_name = "DIGITS")]
        compare: Option<String>,
    },
    #[command(subcommand, about = "Inspect and migrate the key store")]
    Store(store::StoreCommand),
}

#[tokio::main]
async fn main() {
    env_logger::init();

    // Customize parsing error handling.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // These 2 are "not real errors" that are used to stop the execution
            // to display the CLI help or version.
            match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    println!("{}", e);

                    std::process::exit(0);
                }
                _ => (),
            }

            eprintln!(
                "{ballot} {error}",
                ballot = "✘".red().bold(),
                error = HearthCliError::SyntaxError(e)
            );

            std::process::exit(1);
        }
    };

    JSON_MODE.store(cli.json, Ordering::Relaxed);

    // Send each sub-command to the respective handler.
    let conf_path = cli.conf_path;
    let result = match cli.command {
        Command::Key(cmd) => key::handle(cmd, conf_path).await,
        Command::Identity(cmd) => identity::handle(cmd, conf_path).await,
        Command::Prekeys(cmd) => prekeys::handle(cmd, conf_path).await,
        Command::SafetyNumber { peer, compare } => {
            safety_number::safety_number(peer, compare, conf_path).await
        }
        Command::Store(cmd) => store::handle(cmd, conf_path).await,
    };

    // Handle any errors that occurred during command execution.
    if let Err(e) = result {
        eprintln!("{ballot} {e}", ballot = "✘".red().bold());

        std::process::exit(1);
    }
}
