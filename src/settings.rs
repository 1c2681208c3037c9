use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::ApiConfig;
use crate::types::WeekIndex;

pub const BASE_URL_ENV: &str = "SHIFTDESK_BASE_URL";

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
const MIN_REQUEST_TIMEOUT_MS: u64 = 500;
const MAX_REQUEST_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csrf_token: Option<String>,
    pub request_timeout_ms: u64,
    pub rollback_on_failure: bool,
    /// Week shown first, as `YYYYwW`. Defaults to the current week.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_week: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            csrf_token: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            rollback_on_failure: false,
            start_week: None,
        }
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("shiftdesk");
        path.push("settings.toml");
        Some(path)
    }

    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(mut settings) => {
                    settings.validate();
                    settings
                }
                Err(error) => {
                    warn!(
                        "failed to parse settings config '{}': {}",
                        path.display(),
                        error
                    );
                    Self::default()
                }
            },
            Err(error) => {
                warn!(
                    "failed to read settings config '{}': {}",
                    path.display(),
                    error
                );
                Self::default()
            }
        }
    }

    pub fn save_to_path(&self, path: &Path) -> anyhow::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("invalid settings config path"))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory '{}'", parent.display()))?;

        let mut validated = self.clone();
        validated.validate();
        let contents =
            toml::to_string_pretty(&validated).context("failed to serialize settings to TOML")?;

        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("invalid settings config file name"))?
            .to_string_lossy()
            .to_string();
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

        fs::write(&tmp_path, contents).with_context(|| {
            format!(
                "failed to write temporary settings file '{}'",
                tmp_path.display()
            )
        })?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "failed to atomically rename settings file '{}' to '{}'",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }

    /// Applies the `--base-url` flag, then `SHIFTDESK_BASE_URL`, over the file
    /// value.
    pub fn with_overrides(mut self, base_url_flag: Option<&str>) -> Self {
        let from_env = std::env::var(BASE_URL_ENV).ok();
        if let Some(base_url) = base_url_flag.or(from_env.as_deref()) {
            self.base_url = base_url.to_string();
            self.validate();
        }
        self
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.base_url.clone(),
            csrf_token: self.csrf_token.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn start_week(&self) -> WeekIndex {
        self.start_week
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(WeekIndex::current)
    }

    fn validate(&mut self) {
        self.request_timeout_ms = self
            .request_timeout_ms
            .clamp(MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS);

        let base_url = self.base_url.trim().trim_end_matches('/');
        self.base_url = if base_url.starts_with("http://") || base_url.starts_with("https://") {
            base_url.to_string()
        } else {
            warn!(
                "invalid base_url '{}' in settings config; falling back to {}",
                self.base_url, DEFAULT_BASE_URL
            );
            DEFAULT_BASE_URL.to_string()
        };

        self.csrf_token = self
            .csrf_token
            .take()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        if let Some(raw) = self.start_week.as_deref()
            && raw.parse::<WeekIndex>().is_err()
        {
            warn!(
                "invalid start_week '{}' in settings config; using the current week",
                raw
            );
            self.start_week = None;
        }
    }
}
