#![deny(clippy::unwrap_used)]

use std::{path::Path, time::Duration};

use anyhow::Result;
use serde::Deserialize;

// Values come from `ccx.toml` with defaults filled in.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fallback: bool,
    pub use_local: bool,
    pub verify_output: bool,
    pub hermetic: bool,
    pub hermetic_fallback: bool,
    // Earliest state, by name, from which a running local process preempts
    // the remote path. Stored as a string so config parsing doesn't need to
    // depend on the TaskState enum for a simple string compare.
    pub local_run_preference: String,
    pub dont_kill_subprocess: bool,
    #[serde(with = "duration_secs")]
    pub new_file_threshold: Duration,
    pub store_local_run_output: bool,
    pub max_subprocs_pending: usize,
    // 0-100, probability percent that a given task attempts remote.
    pub ramp_up: u8,
    pub max_exec_retry: u32,
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fallback: true,
            use_local: true,
            verify_output: false,
            hermetic: false,
            hermetic_fallback: true,
            local_run_preference: "CALL_EXEC".to_string(),
            dont_kill_subprocess: false,
            new_file_threshold: Duration::from_secs(60 * 60),
            store_local_run_output: true,
            max_subprocs_pending: 4,
            ramp_up: 100,
            max_exec_retry: 4,
            connection_timeout: Duration::from_secs(900),
        }
    }
}

impl EngineConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        log::info!("Loaded config from {}: {:#?}", path.display(), config);
        Ok(config)
    }

    pub fn roll_ramp_up(&self) -> bool {
        if self.ramp_up >= 100 {
            return true;
        }
        if self.ramp_up == 0 {
            return false;
        }
        rand::Rng::gen_range(&mut rand::thread_rng(), 0..100) < self.ramp_up
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = EngineConfig::default();
        assert!(config.fallback);
        assert!(config.use_local);
        assert!(!config.verify_output);
        assert_eq!(config.max_exec_retry, 4);
        assert_eq!(config.connection_timeout, Duration::from_secs(900));
    }

    #[test]
    fn ramp_up_zero_never_attempts_remote() {
        let mut config = EngineConfig::default();
        config.ramp_up = 0;
        for _ in 0..50 {
            assert!(!config.roll_ramp_up());
        }
    }

    #[test]
    fn ramp_up_hundred_always_attempts_remote() {
        let mut config = EngineConfig::default();
        config.ramp_up = 100;
        for _ in 0..50 {
            assert!(config.roll_ramp_up());
        }
    }

    #[tokio::test]
    async fn load_falls_back_to_defaults_when_file_is_missing() {
        let config = EngineConfig::load(Path::new("/nonexistent/ccx.toml"))
            .await
            .expect("defaults on missing file");
        assert_eq!(config.ramp_up, EngineConfig::default().ramp_up);
    }

    #[tokio::test]
    async fn load_parses_toml_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ccx.toml");
        tokio::fs::write(
            &path,
            r#"
            fallback = false
            use_local = true
            verify_output = true
            hermetic = false
            hermetic_fallback = true
            local_run_preference = "FILE_REQ"
            dont_kill_subprocess = false
            new_file_threshold = 120
            store_local_run_output = true
            max_subprocs_pending = 8
            ramp_up = 50
            max_exec_retry = 4
            connection_timeout = 900
            "#,
        )
        .await
        .expect("write config");
        let config = EngineConfig::load(&path).await.expect("load config");
        assert!(!config.fallback);
        assert!(config.verify_output);
        assert_eq!(config.ramp_up, 50);
        assert_eq!(config.new_file_threshold, Duration::from_secs(120));
    }
}
