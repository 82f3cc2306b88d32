use std::time::Duration;

use bundlenudge_core::DEFAULT_FAILURE_THRESHOLD;
use bundlenudge_platform::NudgePaths;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NudgeSettings {
    #[serde(default)]
    pub manifest_url: Option<String>,

    #[serde(default = "default_app_version")]
    pub app_version: String,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,

    #[serde(default = "default_true")]
    pub auto_activate: bool,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,

    #[serde(default = "default_max_blocked_ids")]
    pub max_blocked_ids: usize,
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_http_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_retry_delays() -> Vec<u64> {
    vec![0, 2, 5]
}

fn default_true() -> bool {
    true
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_max_blocked_ids() -> usize {
    16
}

impl Default for NudgeSettings {
    fn default() -> Self {
        Self {
            manifest_url: None,
            app_version: default_app_version(),
            failure_threshold: default_failure_threshold(),
            http_timeout_secs: default_http_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            retry_delays_secs: default_retry_delays(),
            auto_activate: true,
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
            max_blocked_ids: default_max_blocked_ids(),
        }
    }
}

impl NudgeSettings {
    /// Settings from `paths`, or defaults when the file is missing or
    /// malformed.
    #[must_use]
    pub fn load(paths: &NudgePaths) -> Self {
        let settings_path = paths.settings_file();
        match std::fs::read_to_string(&settings_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!("Ignoring malformed settings file: {error}");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bundlenudge_platform::NudgePaths;
    use serde_json::json;

    use super::NudgeSettings;

    #[test]
    fn defaults_match_expected_values() {
        let settings = NudgeSettings::default();

        assert!(settings.manifest_url.is_none());
        assert_eq!(settings.failure_threshold, 2);
        assert_eq!(settings.http_timeout_secs, 30);
        assert_eq!(settings.connect_timeout_secs, 10);
        assert_eq!(settings.retry_delays_secs, vec![0, 2, 5]);
        assert!(settings.auto_activate);
        assert!(!settings.debug_logging);
        assert_eq!(settings.max_log_size_bytes, 5 * 1024 * 1024);
        assert_eq!(settings.max_blocked_ids, 16);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let settings: NudgeSettings = serde_json::from_value(json!({
            "manifest_url": "https://updates.example/manifest.json",
            "failure_threshold": 4
        }))
        .expect("settings JSON should deserialize");

        assert_eq!(
            settings.manifest_url.as_deref(),
            Some("https://updates.example/manifest.json")
        );
        assert_eq!(settings.failure_threshold, 4);
        assert_eq!(settings.http_timeout_secs, 30);
    }

    #[test]
    fn load_reads_host_provided_file() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = NudgePaths::under(temp.path());
        std::fs::create_dir_all(&paths.config_dir).expect("config dir should be created");
        std::fs::write(
            paths.settings_file(),
            r#"{"manifest_url":"https://updates.example/manifest.json","app_version":"3.2.1"}"#,
        )
        .expect("file should be written");

        let settings = NudgeSettings::load(&paths);

        assert_eq!(settings.app_version, "3.2.1");
        assert_eq!(
            settings.manifest_url.as_deref(),
            Some("https://updates.example/manifest.json")
        );
        assert_eq!(settings.failure_threshold, 2);
    }

    #[test]
    fn load_falls_back_to_defaults_for_malformed_file() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = NudgePaths::under(temp.path());
        std::fs::create_dir_all(&paths.config_dir).expect("config dir should be created");
        std::fs::write(paths.settings_file(), "{not-json").expect("file should be written");

        assert_eq!(NudgeSettings::load(&paths), NudgeSettings::default());
    }
}
