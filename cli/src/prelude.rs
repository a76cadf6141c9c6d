pub(crate) use {
    crate::{display::JSON_MODE, error::HearthCliError},
    anyhow::{anyhow, Result as AnyResult},
    clap::{builder::ValueParser, Args, Parser, Subcommand},
    colored::Colorize,
    hearth_sdk::config::EngineConfig,
    serde::{Deserialize, Serialize},
    std::{
        path::{Path, PathBuf},
        sync::atomic::Ordering,
    },
};

// Where to find config file.
pub(crate) const CLI_CONF_PATH: &str = "~/.hearth/conf.toml";

/// Struct holding the config structure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CliConf {
    #[serde(default)]
    pub(crate) store: StoreConf,
    #[serde(default)]
    pub(crate) device: DeviceConf,
    #[serde(default)]
    pub(crate) engine: EngineConfig,
}

impl CliConf {
    /// Load the config, falling back to defaults when the file is missing.
    pub(crate) async fn load_from_path(path: &Path) -> AnyResult<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::default());
        }
        let conf = tokio::fs::read_to_string(path).await?;
        let conf: Self = toml::from_str(&conf)?;
        conf.engine.validate().map_err(|e| anyhow!("invalid [engine] section: {e}"))?;

        Ok(conf)
    }

    pub(crate) async fn save_to_path(&self, path: &Path) -> AnyResult<()> {
        let parent_folder = path
            .parent()
            .ok_or_else(|| anyhow!("{} has no parent folder", path.display()))?;
        let conf = toml::to_string_pretty(&self)?;

        tokio::fs::create_dir_all(parent_folder).await?;
        tokio::fs::write(path, conf).await?;

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoreConf {
    #[serde(default = "default_store_path")]
    pub(crate) path: PathBuf,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Address under which this device is known to its peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DeviceConf {
    pub(crate) user_id: String,
    pub(crate) device_id: u32,
}

impl Default for DeviceConf {
    fn default() -> Self {
        Self {
            user_id: "me".to_string(),
            device_id: 1,
        }
    }
}

// == Used by clap ==

/// Expands `~/` to the user's home directory in path arguments.
pub(crate) fn expand_tilde(path: &str) -> AnyResult<PathBuf> {
    if let Some(path) = path.strip_prefix("~/") {
        match home::home_dir() {
            Some(home) => return Ok(home.join(path)),
            None => return Err(anyhow!("Could not find home directory")),
        }
    }

    Ok(path.into())
}

// == Used by serde ==

fn default_store_path() -> PathBuf {
    home::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hearth/keys.bin")
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::TempDir};

    #[tokio::test]
    async fn missing_conf_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let conf = CliConf::load_from_path(&dir.path().join("conf.toml")).await.unwrap();
        assert_eq!(conf, CliConf::default());
    }

    #[tokio::test]
    async fn partial_engine_section_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/conf.toml");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(
            &path,
            "[device]\nuser_id = \"ana\"\ndevice_id = 3\n\n[engine]\nmax_skip = 50\n",
        )
        .await
        .unwrap();

        let conf = CliConf::load_from_path(&path).await.unwrap();
        assert_eq!(conf.device.user_id, "ana");
        assert_eq!(conf.engine.max_skip, 50);
        assert_eq!(conf.engine.one_time_pre_key_target, EngineConfig::default().one_time_pre_key_target);

        conf.save_to_path(&path).await.unwrap();
        assert_eq!(CliConf::load_from_path(&path).await.unwrap(), conf);
    }

    #[tokio::test]
    async fn invalid_engine_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf.toml");
        tokio::fs::write(&path, "[engine]\nmax_skipped_keys = 0\n").await.unwrap();
        assert!(CliConf::load_from_path(&path).await.is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        let expanded = expand_tilde("~/x/conf.toml").unwrap();
        assert!(expanded.ends_with("x/conf.toml"));
        assert_eq!(expand_tilde("/abs").unwrap(), PathBuf::from("/abs"));
    }
}
