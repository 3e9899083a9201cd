// sing-box Manager
// Entry point for the headless sync supervisor

use anyhow::{Context, Result};
use clap::Parser;
use singbox_manager::backend::ProcessManager;
use singbox_manager::backend::app_config::AppConfig;
use singbox_manager::backend::catalog::DirectoryCatalog;
use singbox_manager::backend::controller::{
    Collaborators, ControllerHandle, ControllerOptions, SyncController,
};
use singbox_manager::backend::fetcher::SubscriptionFetcher;
use singbox_manager::backend::mock_process::MockProcessManager;
use singbox_manager::backend::process::{SingBoxProcess, cleanup_old_logs};
use singbox_manager::backend::settings::FileSettings;
use singbox_manager::backend::store::ConfigStore;
use singbox_manager::constants;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const MOCK_ENV_VAR: &str = "SINGBOX_MANAGER_MOCK";

#[derive(Parser, Debug)]
#[command(name = "singbox_manager")]
#[command(about = "sing-box Manager - keeps a sing-box config in sync with a subscription URL")]
struct Args {
    #[arg(long, help = "Path to application configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Directory holding the subscription config and local catalog")]
    data_dir: Option<PathBuf>,

    #[arg(long, help = "Path to sing-box binary")]
    singbox_path: Option<PathBuf>,

    #[arg(long, help = "Save this subscription URL and fetch it")]
    url: Option<String>,

    #[arg(long, help = "Import a local sing-box config file into the catalog")]
    import: Option<PathBuf>,

    #[arg(long, help = "Select a local config by index")]
    select: Option<usize>,

    #[arg(long, help = "Start sing-box with the active config")]
    start: bool,

    #[arg(long, help = "Do not verify the subscription server's TLS certificate")]
    insecure_skip_tls_verify: bool,

    #[arg(long, help = "Write stdout logs as JSON")]
    json_logs: bool,
}

impl Args {
    fn apply_overrides(&self, app_config: &mut AppConfig) {
        if let Some(data_dir) = &self.data_dir {
            app_config.data_dir = data_dir.clone();
        }
        if let Some(singbox_path) = &self.singbox_path {
            app_config.singbox_binary_path = Some(singbox_path.clone());
        }
        if self.insecure_skip_tls_verify {
            app_config.tls_verify_peer = false;
        }
    }
}

fn setup_tracing(log_directory: &Path, json_stdout: bool) -> Result<()> {
    std::fs::create_dir_all(log_directory)
        .context(singbox_manager::errors::logs::FAILED_TO_CREATE_DIR)?;

    let file_appender = tracing_appender::rolling::daily(log_directory, "app.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json_stdout {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).json())
            .with(fmt::layer().json().with_writer(std::io::stdout))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).json())
            .with(fmt::layer().pretty().with_writer(std::io::stdout))
            .init();
    }

    std::mem::forget(_guard);

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut app_config = AppConfig::load(args.config.as_deref())?;
    args.apply_overrides(&mut app_config);

    setup_tracing(&app_config.log_directory, args.json_logs)
        .context("Failed to initialize tracing")?;

    let shutdown = CancellationToken::new();
    let shutdown_for_panic = shutdown.clone();
    std::panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("Application panic: {:?}", panic_info);
        shutdown_for_panic.cancel();
    }));

    tracing::info!("{} {} starting", constants::APP_TITLE, env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(args, app_config, shutdown))
}

async fn run(args: Args, app_config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    if let Some(days) = app_config.log_retention_days {
        match cleanup_old_logs(&app_config.log_directory, days).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!("Removed {} old sing-box log files", removed),
            Err(e) => tracing::warn!("Log cleanup failed: {:#}", e),
        }
    }

    let binary_path = app_config.resolved_binary_path();
    tracing::info!("Data directory: {}", app_config.data_dir.display());
    tracing::info!("Settings file: {}", app_config.settings_path.display());
    tracing::info!("Binary path: {}", binary_path.display());

    let use_mock = std::env::var(MOCK_ENV_VAR).is_ok();
    if use_mock {
        tracing::info!("Running in MOCK mode - no real processes will be spawned");
    } else if !binary_path.exists() {
        tracing::warn!(
            "{}",
            singbox_manager::errors::binary::not_found(&binary_path.display().to_string())
        );
    }

    let fetcher = SubscriptionFetcher::new(&app_config.fetch_options()?)
        .context("Failed to build HTTP client")?;
    let settings = FileSettings::load(&app_config.settings_path)?;
    let catalog = DirectoryCatalog::open(&app_config.catalog_directory())?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let process: Box<dyn ProcessManager> = if use_mock {
        Box::new(MockProcessManager::new(events_tx))
    } else {
        Box::new(SingBoxProcess::new(
            binary_path,
            app_config.log_directory.clone(),
            events_tx,
        ))
    };

    let (controller, handle, inbox) = SyncController::new(
        Collaborators {
            source: Arc::new(fetcher),
            store: ConfigStore::new(&app_config.data_dir),
            settings: Box::new(settings),
            catalog: Box::new(catalog),
            process,
            process_events: events_rx,
        },
        ControllerOptions {
            update_interval: app_config.update_interval()?,
            watch_store: true,
        },
    );

    let controller_task = tokio::spawn(controller.run(inbox, shutdown.clone()));

    apply_cli_actions(&args, &handle).await;

    tracing::info!("Running. Press Ctrl+C to exit.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("Ctrl+C received, shutting down"),
            Err(e) => tracing::error!("Error listening for Ctrl+C: {}", e),
        },
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    controller_task
        .await
        .context("Sync controller task failed")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn apply_cli_actions(args: &Args, handle: &ControllerHandle) {
    if let Some(path) = &args.import {
        match handle.import_local(path).await {
            Ok(name) => tracing::info!("Imported local config '{}'", name),
            Err(e) => tracing::error!("Import failed: {}", e),
        }
    }

    if let Some(index) = args.select
        && let Err(e) = handle.select_local(index).await
    {
        tracing::error!("Selecting local config {} failed: {}", index, e);
    }

    if let Some(url) = &args.url {
        match handle.set_url(url).await {
            Ok(accepted) => tracing::info!("Subscription URL set to {}", accepted.url),
            Err(e) => tracing::error!("Subscription URL rejected: {}", e),
        }
    }

    if args.start
        && let Err(e) = handle.start_proxy().await
    {
        tracing::error!("Failed to start sing-box: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_args_defaults() {
        let args = Args::parse_from(["singbox_manager"]);
        assert!(args.config.is_none());
        assert!(args.url.is_none());
        assert!(!args.start);
        assert!(!args.insecure_skip_tls_verify);
    }

    #[test]
    fn test_cli_args_config_path() {
        let args = Args::parse_from(["singbox_manager", "--config", "manager.yaml"]);
        assert_eq!(args.config.unwrap(), PathBuf::from("manager.yaml"));
    }

    #[test]
    fn test_cli_args_actions() {
        let args = Args::parse_from([
            "singbox_manager",
            "--url",
            "https://sub.example.com/config",
            "--import",
            "home.json",
            "--select",
            "2",
            "--start",
        ]);
        assert_eq!(args.url.as_deref(), Some("https://sub.example.com/config"));
        assert_eq!(args.import.unwrap(), PathBuf::from("home.json"));
        assert_eq!(args.select, Some(2));
        assert!(args.start);
    }

    #[test]
    fn test_cli_overrides_app_config() {
        let args = Args::parse_from([
            "singbox_manager",
            "--data-dir",
            "/tmp/singbox",
            "--singbox-path",
            "/usr/bin/sing-box",
            "--insecure-skip-tls-verify",
        ]);
        let mut app_config = AppConfig::default();
        args.apply_overrides(&mut app_config);

        assert_eq!(app_config.data_dir, PathBuf::from("/tmp/singbox"));
        assert_eq!(
            app_config.singbox_binary_path,
            Some(PathBuf::from("/usr/bin/sing-box"))
        );
        assert!(!app_config.tls_verify_peer);
    }

    #[test]
    fn test_select_rejects_non_numeric() {
        let result = Args::try_parse_from(["singbox_manager", "--select", "first"]);
        assert!(result.is_err());
    }
}
