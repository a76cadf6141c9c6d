//! Tunables for the protocol engine.
//!
//! Every field has a default, so a partial `[engine]` table in a TOML file
//! deserializes into a complete [`EngineConfig`].

use {
    chrono::TimeDelta,
    serde::{Deserialize, Serialize},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Most message keys a single incoming message may make us skip.
    pub max_skip: u32,
    /// Capacity of each skipped message key cache. Oldest entries are
    /// evicted first.
    pub max_skipped_keys: usize,
    /// Age after which the signed pre-key is replaced.
    pub signed_pre_key_rotation_secs: i64,
    /// How long a superseded signed pre-key still accepts handshakes.
    pub signed_pre_key_grace_secs: i64,
    /// Pool size the scheduler replenishes one-time pre-keys to.
    pub one_time_pre_key_target: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_skipped_keys: 2000,
            signed_pre_key_rotation_secs: 7 * 24 * 60 * 60,
            signed_pre_key_grace_secs: 48 * 60 * 60,
            one_time_pre_key_target: 100,
        }
    }
}

impl EngineConfig {
    pub fn signed_pre_key_rotation(&self) -> TimeDelta {
        TimeDelta::try_seconds(self.signed_pre_key_rotation_secs).unwrap_or(TimeDelta::MAX)
    }

    pub fn signed_pre_key_grace(&self) -> TimeDelta {
        TimeDelta::try_seconds(self.signed_pre_key_grace_secs).unwrap_or(TimeDelta::MAX)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_skip == 0 {
            return Err("max_skip must be at least 1".into());
        }
        if self.max_skipped_keys == 0 {
            return Err("max_skipped_keys must be at least 1".into());
        }
        if self.signed_pre_key_rotation_secs <= 0 {
            return Err("signed_pre_key_rotation_secs must be positive".into());
        }
        if self.signed_pre_key_grace_secs < 0 {
            return Err("signed_pre_key_grace_secs must not be negative".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let conf: EngineConfig = toml::from_str("max_skip = 50").unwrap();
        assert_eq!(conf.max_skip, 50);
        assert_eq!(conf.one_time_pre_key_target, 100);
        assert_eq!(conf.signed_pre_key_grace(), TimeDelta::hours(48));
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn zero_skip_is_invalid() {
        let conf = EngineConfig {
            max_skip: 0,
            ..Default::default()
        };
        assert!(conf.validate().is_err());
    }

    #[test]
    fn rotation_defaults_to_a_week() {
        assert_eq!(
            EngineConfig::default().signed_pre_key_rotation(),
            TimeDelta::days(7)
        );
    }
}
