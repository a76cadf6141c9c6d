use {
    super::retire_store_file,
    crate::{
        command_title,
        item,
        loading,
        notify_success,
        prelude::*,
        utils::secrets::master_key::{keyring_has_key, MasterKeyError, PASSPHRASE_USER, SERVICE, USER},
    },
    keyring::Entry,
    zeroize::Zeroizing,
};

/// Prompt for a pass-phrase and store it securely in the key-ring.
pub(crate) async fn key_set_passphrase(
    stdin: bool,
    force: bool,
    conf_path: PathBuf,
) -> AnyResult<(), HearthCliError> {
    command_title!("Setting passphrase in the OS key-ring");

    let check_handle = loading!("Checking for existing keys...");

    // Abort if a raw master-key or a pass-phrase entry already exists (unless --force).
    let exists = match keyring_has_key() {
        Ok(exists) => exists,
        Err(e) => {
            check_handle.error();
            return Err(HearthCliError::Any(e.into()));
        }
    };
    if exists && !force {
        check_handle.error();
        return Err(HearthCliError::Any(MasterKeyError::KeyAlreadyExists.into()));
    }

    check_handle.success();

    let input_handle = loading!("Reading passphrase...");

    let pass = if stdin {
        use std::io::{self, Read};
        let mut buf = Zeroizing::new(String::new());
        match io::stdin().read_to_string(&mut buf) {
            Ok(_) => Zeroizing::new(buf.trim_end_matches('\n').to_owned()),
            Err(e) => {
                input_handle.error();
                return Err(HearthCliError::Io(e));
            }
        }
    } else {
        match rpassword::prompt_password("Enter new pass-phrase: ") {
            Ok(pass) => Zeroizing::new(pass),
            Err(e) => {
                input_handle.error();
                return Err(HearthCliError::Io(e));
            }
        }
    };

    if pass.trim().is_empty() {
        input_handle.error();
        return Err(HearthCliError::Any(anyhow!("pass-phrase cannot be empty")));
    }

    input_handle.success();

    if let Some(backup) = retire_store_file(&conf_path).await? {
        item!("Previous key store moved to {}", backup.display().to_string().truecolor(100, 100, 100));
    }

    let store_handle = loading!("Storing passphrase in key-ring...");

    match Entry::new(SERVICE, PASSPHRASE_USER)
        .map_err(|e| HearthCliError::Any(e.into()))?
        .set_password(&pass)
    {
        Ok(()) => {
            store_handle.success();
            // Remove any stale raw master-key so that key-status prefers the pass-phrase.
            let _ = Entry::new(SERVICE, USER).and_then(|e| e.delete_credential());
            notify_success!("pass-phrase stored in the OS key-ring");
            Ok(())
        }
        Err(e) => {
            store_handle.error();
            Err(HearthCliError::Any(e.into()))
        }
    }
}
