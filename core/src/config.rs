use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::retention::RetentionWindow;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub page_size: usize,
    pub max_capture_size: usize,
    pub compress_threshold: usize,
    pub preview_length: usize,
    pub ignore_apps: Vec<String>,
    pub skip_transient: bool,
    pub retention: RetentionWindow,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("pasteflow");

        Self {
            data_dir,
            poll_interval_ms: 300,
            page_size: 50,
            max_capture_size: 100 * 1024 * 1024,
            compress_threshold: 4096,
            preview_length: 500,
            ignore_apps: Vec::new(),
            skip_transient: true,
            retention: RetentionWindow::Days(30),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = dirs::config_dir()
            .unwrap_or_default()
            .join("pasteflow")
            .join("config.toml");

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&config_path, toml::to_string_pretty(&config)?)?;
            Ok(config)
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("history.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            poll_interval_ms = 150
            ignore_apps = ["1Password"]

            [retention]
            unit = "weeks"
            count = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.poll_interval_ms, 150);
        assert_eq!(config.ignore_apps, vec!["1Password".to_string()]);
        assert_eq!(config.retention, RetentionWindow::Weeks(2));
        assert_eq!(config.page_size, Config::default().page_size);
    }

    #[test]
    fn default_config_round_trips() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.retention, config.retention);
        assert_eq!(back.compress_threshold, config.compress_threshold);
    }
}
