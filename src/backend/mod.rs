pub mod app_config;
pub mod catalog;
pub mod controller;
pub mod fetcher;
pub mod mock_process;
pub mod process;
pub mod reconciler;
pub mod settings;
pub mod store;
pub mod tls;
pub mod types;
pub mod validator;

use anyhow::Result;
use fetcher::FetchError;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use types::{ProxyProcessState, SubscriptionUrl};

pub type FetchFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, FetchError>> + Send>>;

/// Lifecycle control for the managed proxy binary. Start and stop are
/// requests; state changes are reported through the channel the manager
/// was built with.
pub trait ProcessManager: Send + Sync {
    fn start(&mut self, config_path: &Path) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn current_state(&self) -> ProxyProcessState;

    /// Tail of the process' stderr, for log views.
    fn recent_output(&self) -> String {
        String::new()
    }

    /// Resolves once the last started process has fully exited.
    fn stopped(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Locally imported configurations. A non-empty catalog always has a
/// current entry.
pub trait ConfigCatalog: Send + Sync {
    fn count(&self) -> usize;
    fn current_name(&self) -> Option<String>;
    fn current_index(&self) -> Option<usize>;
    fn current_file_path(&self) -> Option<PathBuf>;

    fn select(&mut self, index: usize) -> Result<()>;
    fn import(&mut self, source: &Path) -> Result<String>;
    fn refresh(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Persisted per-user preferences.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str, default: &str) -> String;
    fn set(&mut self, key: &str, value: &str);
    fn flush(&mut self) -> Result<()>;
}

/// Something that can download a subscription document.
pub trait SubscriptionSource: Send + Sync {
    fn fetch(&self, url: &SubscriptionUrl) -> FetchFuture;
}
