use std::path::PathBuf;
use std::time::Duration;

pub const APP_TITLE: &str = "sing-box Manager";
pub const APP_DIR_NAME: &str = "singbox-manager";
pub const PRODUCT_NAME: &str = "singbox-manager";

pub const SUBSCRIPTION_FILE_NAME: &str = "subscription_config.json";
pub const SETTINGS_FILE_NAME: &str = "settings.yaml";
pub const CATALOG_DIR_NAME: &str = "configs";
pub const SETTINGS_KEY_URL: &str = "subscription/url";

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_REDIRECTS: usize = 10;

pub fn user_agent() -> String {
    format!("{}/{}", PRODUCT_NAME, env!("CARGO_PKG_VERSION"))
}

pub fn default_log_directory() -> PathBuf {
    PathBuf::from(".").join("logs")
}

pub fn default_data_directory() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join(SETTINGS_FILE_NAME)
}

pub fn singbox_binary_name() -> &'static str {
    if cfg!(windows) {
        "sing-box.exe"
    } else {
        "sing-box"
    }
}
