use {
    super::retire_store_file,
    crate::{
        command_title,
        item,
        loading,
        notify_success,
        prelude::*,
        utils::secrets::master_key::{keyring_has_key, MasterKeyError, KEY_LEN, PASSPHRASE_USER, SERVICE, USER},
    },
    keyring::Entry,
    rand::{rngs::OsRng, RngCore},
    zeroize::Zeroizing,
};

/// Generate and store a new 32-byte key in the OS key-ring.
/// Important: A key store sealed with the previous key is moved aside.
pub(crate) async fn key_init(force: bool, conf_path: PathBuf) -> AnyResult<(), HearthCliError> {
    command_title!("Generating and storing a new 32-byte master key");

    // 1. Abort if any persistent key already exists (unless --force)
    let check_handle = loading!("Checking for existing keys...");

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

    // 2. The old store cannot be opened with the new key.
    let retire_handle = loading!("Moving the existing key store aside...");
    let backup = match retire_store_file(&conf_path).await {
        Ok(backup) => backup,
        Err(e) => {
            retire_handle.error();
            return Err(e);
        }
    };
    retire_handle.success();
    if let Some(backup) = backup {
        item!("Previous key store moved to {}", backup.display().to_string().truecolor(100, 100, 100));
    }

    // 3. Generate and store a new 32-byte key
    let generate_handle = loading!("Generating and storing master key...");

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut *key);

    match Entry::new(SERVICE, USER)
        .map_err(|e| HearthCliError::Any(e.into()))?
        .set_password(&hex::encode(*key))
    {
        Ok(()) => {
            generate_handle.success();
            // Remove any stale pass-phrase entry so that key-status reports the new raw key.
            let _ = Entry::new(SERVICE, PASSPHRASE_USER).and_then(|e| e.delete_credential());
            notify_success!("32-byte master key saved to the OS key-ring");
            Ok(())
        }
        Err(e) => {
            generate_handle.error();
            Err(HearthCliError::Any(e.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        keyring::{mock, set_default_credential_builder},
        tempfile::TempDir,
    };

    #[tokio::test]
    #[serial_test::serial(master_key_env)]
    async fn init_moves_old_store_aside() {
        set_default_credential_builder(mock::default_credential_builder());
        let _ = Entry::new(SERVICE, USER).and_then(|e| e.delete_credential());
        let _ = Entry::new(SERVICE, PASSPHRASE_USER).and_then(|e| e.delete_credential());

        let tmp = TempDir::new().unwrap();
        let conf_path = tmp.path().join("conf.toml");
        let store_path = tmp.path().join("keys.bin");
        let mut conf = CliConf::default();
        conf.store.path = store_path.clone();
        conf.save_to_path(&conf_path).await.unwrap();
        tokio::fs::write(&store_path, b"sealed with the old key").await.unwrap();

        key_init(false, conf_path.clone()).await.unwrap();
        assert!(!store_path.exists());
        let backups = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .count();
        assert_eq!(backups, 1);

        // Nothing left to move on a forced re-init.
        key_init(true, conf_path).await.unwrap();
        assert!(!store_path.exists());

        let _ = Entry::new(SERVICE, USER).and_then(|e| e.delete_credential());
    }
}
