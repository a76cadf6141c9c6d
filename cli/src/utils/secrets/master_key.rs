//! Master key for the on-disk key store.
//!
//! The key is resolved in this order:
//!
//! 1. `HEARTH_STORE_PASSPHRASE` environment variable, stretched with Argon2id.
//! 2. A pass-phrase saved in the OS key-ring by `hearth key set-passphrase`.
//! 3. A raw 256-bit key saved in the OS key-ring by `hearth key init`.
//!
//! When none exists a random key is generated and saved to the key-ring.

use {
    argon2::{Algorithm, Argon2, Params, Version},
    directories::ProjectDirs,
    keyring::Entry,
    log::warn,
    rand::{rngs::OsRng, RngCore},
    std::{env, fs, io, path::PathBuf},
    thiserror::Error,
    zeroize::Zeroizing,
};

// === constants ===

/// Service / user names for the OS key-ring.
pub const SERVICE: &str = "hearth-cli-store";
pub const USER: &str = "master-key";
pub const PASSPHRASE_USER: &str = "passphrase";

/// Environment variable holding a pass-phrase. Takes precedence over the
/// key-ring.
pub const PASSPHRASE_ENV: &str = "HEARTH_STORE_PASSPHRASE";

/// 256-bit master-key length.
pub const KEY_LEN: usize = 32;
/// 128-bit salt for Argon2id passphrase derivation.
pub const SALT_LEN: usize = 16;

/// Argon2id default parameters (64 MiB, 4 passes, single thread).
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_ITERATIONS: u32 = 4;

// === error type ===

#[derive(Debug, Error)]
pub enum MasterKeyError {
    #[error("key-ring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unable to locate a per-user configuration directory")]
    ProjectDirNotFound,
    #[error("argon2 failure: {0}")]
    Argon2(String),
    #[error("a master key or pass-phrase already exists, pass --force to replace it")]
    KeyAlreadyExists,
}

/// Where the master key currently comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySource {
    Env,
    KeyringPassphrase,
    KeyringRawKey,
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Env => write!(f, "{PASSPHRASE_ENV} environment variable"),
            KeySource::KeyringPassphrase => write!(f, "key-ring pass-phrase"),
            KeySource::KeyringRawKey => write!(f, "key-ring raw key"),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Inspect the key sources without creating anything.
pub fn key_source() -> Result<KeySource, MasterKeyError> {
    if env::var(PASSPHRASE_ENV).is_ok() {
        return Ok(KeySource::Env);
    }
    if Entry::new(SERVICE, PASSPHRASE_USER)?.get_password().is_ok() {
        return Ok(KeySource::KeyringPassphrase);
    }
    if Entry::new(SERVICE, USER)?.get_password().is_ok() {
        return Ok(KeySource::KeyringRawKey);
    }
    Ok(KeySource::None)
}

/// Whether a persistent key or pass-phrase is saved in the key-ring.
pub fn keyring_has_key() -> Result<bool, MasterKeyError> {
    Ok(Entry::new(SERVICE, USER)?.get_password().is_ok()
        || Entry::new(SERVICE, PASSPHRASE_USER)?.get_password().is_ok())
}

/// Obtain the process-wide master key.
pub fn get_master_key() -> Result<Zeroizing<[u8; KEY_LEN]>, MasterKeyError> {
    // Pass-phrase keys are always re-derived, never cached in the key-ring.
    if let Ok(passphrase) = env::var(PASSPHRASE_ENV) {
        return derive_from_passphrase(&passphrase);
    }

    match Entry::new(SERVICE, PASSPHRASE_USER) {
        Ok(entry) => {
            if let Ok(passphrase) = entry.get_password() {
                return derive_from_passphrase(&passphrase);
            }
        }
        Err(e) => warn!("Keyring not available: {e}"),
    }

    match Entry::new(SERVICE, USER) {
        Ok(entry) => {
            if let Ok(stored_hex) = entry.get_password() {
                let bytes = Zeroizing::new(hex::decode(&stored_hex)?);
                if let Ok(key) = <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
                    return Ok(Zeroizing::new(key));
                }
                // Invalid key in keyring, delete it
                warn!("Discarding malformed master key from the key-ring");
                let _ = entry.delete_credential();
            }
        }
        Err(e) => warn!("Keyring not available: {e}"),
    }

    // Generate new random key
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut *key);

    // Try to save to keyring, but don't fail if it doesn't work
    match Entry::new(SERVICE, USER) {
        Ok(entry) => {
            if let Err(e) = entry.set_password(&hex::encode(*key)) {
                warn!("Failed to save key to keyring: {e}");
            }
        }
        Err(e) => warn!("Keyring not available: {e}"),
    }
    Ok(key)
}

fn derive_from_passphrase(passphrase: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, MasterKeyError> {
    let (_, salt) = get_or_create_salt()?;

    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, 1, Some(KEY_LEN))
        .map_err(|e| MasterKeyError::Argon2(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &salt, &mut *key)
        .map_err(|e| MasterKeyError::Argon2(e.to_string()))?;
    Ok(key)
}

/// Locate `$XDG_CONFIG_HOME/hearth-cli/salt.bin` or platform-specific config dir,
/// creating both the directory and the salt (with 0600 perms) on first run.
fn get_or_create_salt() -> Result<(PathBuf, [u8; SALT_LEN]), MasterKeyError> {
    let config_dir = if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("hearth-cli")
    } else {
        ProjectDirs::from("family", "hearth", "hearth-cli")
            .ok_or(MasterKeyError::ProjectDirNotFound)?
            .config_dir()
            .to_path_buf()
    };

    let salt_path = config_dir.join("salt.bin");

    if salt_path.exists() {
        let bytes = fs::read(&salt_path)?;
        if let Ok(salt) = <[u8; SALT_LEN]>::try_from(bytes.as_slice()) {
            return Ok((salt_path, salt));
        }
        warn!("Invalid salt file at {}, recreating", salt_path.display());
        let _ = fs::remove_file(&salt_path);
    }

    // First run: create parent dir + fresh salt.
    fs::create_dir_all(&config_dir)?;
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    write_salt_securely(&salt_path, &salt)?;
    Ok((salt_path, salt))
}

/// Write salt to path with owner-only (0o600) permissions.
fn write_salt_securely(path: &PathBuf, salt: &[u8; SALT_LEN]) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::{fs::OpenOptions, io::Write, os::unix::fs::OpenOptionsExt};
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?
            .write_all(salt)?;
    }
    #[cfg(not(unix))]
    {
        fs::write(path, salt)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        keyring::{mock, set_default_credential_builder},
        std::{env, fs},
        tempfile::TempDir,
    };

    /// Run `f` with an isolated XDG dir, a mock key-ring and no pass-phrase
    /// in the environment.
    fn with_env<F: FnOnce(&PathBuf) -> R, R>(f: F) -> R {
        set_default_credential_builder(mock::default_credential_builder());
        let _ = Entry::new(SERVICE, USER).and_then(|e| e.delete_credential());
        let _ = Entry::new(SERVICE, PASSPHRASE_USER).and_then(|e| e.delete_credential());

        let tmp = TempDir::new().unwrap();
        let xdg_path = tmp.path().join("xdg_config");
        let original_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", &xdg_path);
        env::remove_var(PASSPHRASE_ENV);

        let result = f(&xdg_path);

        match original_xdg {
            Some(old) => env::set_var("XDG_CONFIG_HOME", old),
            None => env::remove_var("XDG_CONFIG_HOME"),
        }
        env::remove_var(PASSPHRASE_ENV);
        result
    }

    #[test]
    #[serial_test::serial(master_key_env)]
    fn passphrase_key_is_stable_and_salt_persists() {
        with_env(|xdg_path| {
            env::set_var(PASSPHRASE_ENV, "correct horse battery staple");

            let k1 = get_master_key().expect("first derivation");
            let k2 = get_master_key().expect("second derivation");
            assert_eq!(&*k1, &*k2, "key must be deterministic");
            assert_eq!(key_source().unwrap(), KeySource::Env);

            let salt_path = xdg_path.join("hearth-cli").join("salt.bin");
            assert_eq!(fs::read(&salt_path).unwrap().len(), SALT_LEN);

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = fs::metadata(&salt_path).unwrap().permissions().mode() & 0o777;
                assert_eq!(mode, 0o600, "salt file not private");
            }
        });
    }

    #[test]
    #[serial_test::serial(master_key_env)]
    fn different_passphrases_produce_different_keys() {
        with_env(|_| {
            env::set_var(PASSPHRASE_ENV, "alpha");
            let k1 = get_master_key().unwrap();

            env::set_var(PASSPHRASE_ENV, "bravo");
            let k2 = get_master_key().unwrap();

            assert_ne!(&*k1, &*k2, "distinct passphrases must yield distinct keys");
        });
    }

    #[test]
    #[serial_test::serial(master_key_env)]
    fn random_key_is_persisted_in_keyring() {
        with_env(|_| {
            assert_eq!(key_source().unwrap(), KeySource::None);
            let first = get_master_key().expect("random key generated");
            if key_source().unwrap() == KeySource::KeyringRawKey {
                assert_eq!(&*first, &*get_master_key().unwrap());
            }
        });
    }
}
