use crate::backend::fetcher::FetchOptions;
use crate::constants;
use crate::errors;
use anyhow::{Context, ensure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "SINGBOX_MANAGER";

/// Application settings. Layered as: optional file, then
/// `SINGBOX_MANAGER_*` environment variables, then command line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "constants::default_data_directory")]
    pub data_dir: PathBuf,

    #[serde(default = "constants::default_settings_path")]
    pub settings_path: PathBuf,

    #[serde(default)]
    pub singbox_binary_path: Option<PathBuf>,

    #[serde(default = "constants::default_log_directory")]
    pub log_directory: PathBuf,

    #[serde(default)]
    pub log_retention_days: Option<u32>,

    #[serde(default = "default_update_interval")]
    pub update_interval: String,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    #[serde(default = "default_tls_verify_peer")]
    pub tls_verify_peer: bool,
}

fn default_update_interval() -> String {
    humantime::format_duration(constants::DEFAULT_UPDATE_INTERVAL).to_string()
}

fn default_fetch_timeout() -> String {
    humantime::format_duration(constants::DEFAULT_FETCH_TIMEOUT).to_string()
}

fn default_connect_timeout() -> String {
    humantime::format_duration(constants::DEFAULT_CONNECT_TIMEOUT).to_string()
}

fn default_max_body_bytes() -> u64 {
    constants::DEFAULT_MAX_BODY_BYTES
}

fn default_tls_verify_peer() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: constants::default_data_directory(),
            settings_path: constants::default_settings_path(),
            singbox_binary_path: None,
            log_directory: constants::default_log_directory(),
            log_retention_days: None,
            update_interval: default_update_interval(),
            fetch_timeout: default_fetch_timeout(),
            connect_timeout: default_connect_timeout(),
            max_body_bytes: default_max_body_bytes(),
            tls_verify_peer: default_tls_verify_peer(),
        }
    }
}

fn parse_duration(field: &str, value: &str) -> anyhow::Result<Duration> {
    let duration = humantime::parse_duration(value.trim())
        .with_context(|| format!("Invalid duration for {}: '{}'", field, value))?;
    ensure!(!duration.is_zero(), "{} must be greater than zero", field);
    Ok(duration)
}

impl AppConfig {
    pub fn load(config_file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX).try_parsing(true),
        );

        let app_config: AppConfig = builder
            .build()
            .context("Failed to read application configuration")?
            .try_deserialize()
            .context("Failed to parse application configuration")?;

        app_config
            .validate()
            .context("Application configuration validation failed")?;

        Ok(app_config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.update_interval()?;
        self.fetch_timeout()?;
        self.connect_timeout()?;

        ensure!(self.max_body_bytes > 0, "max_body_bytes must be greater than zero");

        if let Some(days) = self.log_retention_days {
            ensure!(
                (1..=3650).contains(&days),
                errors::logs::retention_invalid(days)
            );
        }

        Ok(())
    }

    pub fn update_interval(&self) -> anyhow::Result<Duration> {
        parse_duration("update_interval", &self.update_interval)
    }

    pub fn fetch_timeout(&self) -> anyhow::Result<Duration> {
        parse_duration("fetch_timeout", &self.fetch_timeout)
    }

    pub fn connect_timeout(&self) -> anyhow::Result<Duration> {
        parse_duration("connect_timeout", &self.connect_timeout)
    }

    pub fn subscription_path(&self) -> PathBuf {
        self.data_dir.join(constants::SUBSCRIPTION_FILE_NAME)
    }

    pub fn catalog_directory(&self) -> PathBuf {
        self.data_dir.join(constants::CATALOG_DIR_NAME)
    }

    /// Configured binary, or `sing-box` next to the running executable.
    pub fn resolved_binary_path(&self) -> PathBuf {
        self.singbox_binary_path.clone().unwrap_or_else(|| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(Path::to_path_buf));
            match exe_dir {
                Some(dir) => dir.join(constants::singbox_binary_name()),
                None => PathBuf::from(constants::singbox_binary_name()),
            }
        })
    }

    pub fn fetch_options(&self) -> anyhow::Result<FetchOptions> {
        Ok(FetchOptions {
            user_agent: constants::user_agent(),
            timeout: self.fetch_timeout()?,
            connect_timeout: self.connect_timeout()?,
            max_body_bytes: self.max_body_bytes,
            verify_peer: self.tls_verify_peer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let app_config = AppConfig::default();
        assert!(app_config.validate().is_ok());
        assert!(app_config.tls_verify_peer);
        assert_eq!(
            app_config.update_interval().unwrap(),
            constants::DEFAULT_UPDATE_INTERVAL
        );
        assert_eq!(
            app_config.fetch_timeout().unwrap(),
            constants::DEFAULT_FETCH_TIMEOUT
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        let app_config = AppConfig {
            update_interval: "0s".to_string(),
            ..AppConfig::default()
        };
        assert!(app_config.validate().is_err());
    }

    #[test]
    fn test_unparsable_timeout_rejected() {
        let app_config = AppConfig {
            fetch_timeout: "soon".to_string(),
            ..AppConfig::default()
        };
        let error = app_config.validate().unwrap_err();
        assert!(error.to_string().contains("fetch_timeout"));
    }

    #[test]
    fn test_retention_bounds() {
        for (days, ok) in [(0, false), (1, true), (3650, true), (3651, false)] {
            let app_config = AppConfig {
                log_retention_days: Some(days),
                ..AppConfig::default()
            };
            assert_eq!(app_config.validate().is_ok(), ok, "days = {}", days);
        }
    }

    #[test]
    fn test_fetch_options_follow_config() {
        let app_config = AppConfig {
            fetch_timeout: "5s".to_string(),
            connect_timeout: "2s".to_string(),
            max_body_bytes: 1024,
            tls_verify_peer: false,
            ..AppConfig::default()
        };
        let options = app_config.fetch_options().unwrap();
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.connect_timeout, Duration::from_secs(2));
        assert_eq!(options.max_body_bytes, 1024);
        assert!(!options.verify_peer);
        assert!(options.user_agent.starts_with("singbox-manager/"));
    }

    #[test]
    fn test_paths_derive_from_data_dir() {
        let app_config = AppConfig {
            data_dir: PathBuf::from("/var/lib/singbox-manager"),
            ..AppConfig::default()
        };
        assert_eq!(
            app_config.subscription_path(),
            PathBuf::from("/var/lib/singbox-manager/subscription_config.json")
        );
        assert_eq!(
            app_config.catalog_directory(),
            PathBuf::from("/var/lib/singbox-manager/configs")
        );
    }
}
