//! The subscription sync controller.
//!
//! All state lives in [`SyncController`], which runs as one task and
//! handles one event at a time: commands from [`ControllerHandle`]s, fetch
//! completions, process state changes, changes to the stored document and
//! timer ticks. Network I/O happens in spawned [`FetchSession`]s whose
//! results come back through the inbox.

use crate::backend::fetcher::{FetchCompletion, FetchError, FetchSession};
use crate::backend::reconciler::{self, Action, SubscriptionCandidate};
use crate::backend::store::{ConfigStore, StoreError, StoreWatcher};
use crate::backend::types::{
    ActiveConfig, FetchSessionId, ProxyProcessState, SubscriptionUrl, SyncState, Timestamp,
    UrlAccepted, UrlError,
};
use crate::backend::validator::{ValidationError, validate};
use crate::backend::{ConfigCatalog, ProcessManager, SettingsStore, SubscriptionSource, tls};
use crate::constants::{self, SETTINGS_KEY_URL};
use crate::errors;
use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error(transparent)]
    InvalidUrl(#[from] UrlError),
    #[error("no subscription URL configured")]
    NotConfigured,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Settings(String),
    #[error("no configuration available")]
    NoConfiguration,
    #[error("{0}")]
    Process(String),
    #[error("{0}")]
    Catalog(String),
    #[error("sync controller is not running")]
    ControllerGone,
}

/// Everything an observer needs to render the controller's state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusSnapshot {
    pub message: String,
    pub warning: Option<String>,
    pub preview: String,
    pub active: ActiveConfig,
    pub sync_state: SyncState,
    pub process_state: ProxyProcessState,
    pub subscription_url: Option<SubscriptionUrl>,
    pub last_error: Option<SyncError>,
    pub last_update: Option<Timestamp>,
}

/// Latest [`StatusSnapshot`], readable without going through the
/// controller.
#[derive(Debug)]
pub struct StatusBoard {
    current: ArcSwap<StatusSnapshot>,
    version: watch::Sender<u64>,
}

impl StatusBoard {
    fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(StatusSnapshot::default()),
            version: watch::Sender::new(0),
        }
    }

    pub fn load(&self) -> Arc<StatusSnapshot> {
        self.current.load_full()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn update(&self, change: impl FnOnce(&mut StatusSnapshot)) {
        let mut next = StatusSnapshot::clone(&self.current.load());
        change(&mut next);
        self.current.store(Arc::new(next));
        self.version.send_modify(|version| *version += 1);
    }
}

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

#[derive(Debug)]
enum Command {
    SetUrl { raw: String, reply: Reply<UrlAccepted> },
    UpdateNow { reply: Reply<FetchSessionId> },
    StartProxy { reply: Reply<()> },
    StopProxy { reply: Reply<()> },
    SelectLocal { index: usize, reply: Reply<()> },
    ImportLocal { path: PathBuf, reply: Reply<String> },
}

/// Cloneable front door to a running [`SyncController`].
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<StatusBoard>,
    proxy_active: watch::Receiver<bool>,
}

impl ControllerHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| SyncError::ControllerGone)?;
        response.await.map_err(|_| SyncError::ControllerGone)?
    }

    /// Validates, persists and starts syncing a new subscription URL.
    pub async fn set_url(&self, raw: &str) -> Result<UrlAccepted, SyncError> {
        let raw = raw.to_string();
        self.request(|reply| Command::SetUrl { raw, reply }).await
    }

    /// Fetches now, replacing any download still in flight.
    pub async fn update_now(&self) -> Result<FetchSessionId, SyncError> {
        self.request(|reply| Command::UpdateNow { reply }).await
    }

    pub async fn start_proxy(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::StartProxy { reply }).await
    }

    pub async fn stop_proxy(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::StopProxy { reply }).await
    }

    pub async fn select_local(&self, index: usize) -> Result<(), SyncError> {
        self.request(|reply| Command::SelectLocal { index, reply })
            .await
    }

    pub async fn import_local(&self, path: &Path) -> Result<String, SyncError> {
        let path = path.to_path_buf();
        self.request(|reply| Command::ImportLocal { path, reply })
            .await
    }

    pub fn status(&self) -> Arc<StatusSnapshot> {
        self.status.load()
    }

    /// Waits until the status satisfies `predicate` and returns that snapshot.
    pub async fn wait_for_status(
        &self,
        predicate: impl Fn(&StatusSnapshot) -> bool,
    ) -> Arc<StatusSnapshot> {
        let mut changes = self.status.subscribe();
        loop {
            let snapshot = self.status.load();
            if predicate(&snapshot) || changes.changed().await.is_err() {
                return snapshot;
            }
        }
    }

    /// Whether the proxy should be considered on, for tray-style consumers.
    pub fn proxy_active(&self) -> watch::Receiver<bool> {
        self.proxy_active.clone()
    }
}

/// The collaborators the controller drives.
pub struct Collaborators {
    pub source: Arc<dyn SubscriptionSource>,
    pub store: ConfigStore,
    pub settings: Box<dyn SettingsStore>,
    pub catalog: Box<dyn ConfigCatalog>,
    pub process: Box<dyn ProcessManager>,
    pub process_events: mpsc::UnboundedReceiver<ProxyProcessState>,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub update_interval: Duration,
    pub watch_store: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            update_interval: constants::DEFAULT_UPDATE_INTERVAL,
            watch_store: true,
        }
    }
}

/// Event sources consumed by [`SyncController::run`].
pub struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedReceiver<FetchCompletion>,
    process_events: mpsc::UnboundedReceiver<ProxyProcessState>,
    store_watcher: Option<StoreWatcher>,
}

pub struct SyncController {
    source: Arc<dyn SubscriptionSource>,
    store: ConfigStore,
    settings: Box<dyn SettingsStore>,
    catalog: Box<dyn ConfigCatalog>,
    process: Box<dyn ProcessManager>,

    url: Option<SubscriptionUrl>,
    update_interval: Duration,
    ticker: Option<Interval>,

    next_session: FetchSessionId,
    in_flight: Option<FetchSession>,
    completions: mpsc::UnboundedSender<FetchCompletion>,

    sync_state: SyncState,
    active: ActiveConfig,
    active_bytes: Option<Vec<u8>>,

    status: Arc<StatusBoard>,
    proxy_active: watch::Sender<bool>,
}

impl SyncController {
    pub fn new(
        collaborators: Collaborators,
        options: ControllerOptions,
    ) -> (Self, ControllerHandle, Inbox) {
        let Collaborators {
            source,
            store,
            settings,
            catalog,
            process,
            process_events,
        } = collaborators;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (proxy_active_tx, proxy_active_rx) = watch::channel(process.current_state().is_active());
        let status = Arc::new(StatusBoard::new());

        let store_watcher = if options.watch_store {
            store
                .watch()
                .inspect_err(|e| tracing::warn!("Not watching subscription config: {:#}", e))
                .ok()
        } else {
            None
        };

        let controller = Self {
            source,
            store,
            settings,
            catalog,
            process,
            url: None,
            update_interval: options.update_interval,
            ticker: None,
            next_session: FetchSessionId::first(),
            in_flight: None,
            completions: completion_tx,
            sync_state: SyncState::Idle,
            active: ActiveConfig::Unavailable,
            active_bytes: None,
            status: status.clone(),
            proxy_active: proxy_active_tx,
        };

        let handle = ControllerHandle {
            commands: command_tx,
            status,
            proxy_active: proxy_active_rx,
        };

        let inbox = Inbox {
            commands: command_rx,
            completions: completion_rx,
            process_events,
            store_watcher,
        };

        (controller, handle, inbox)
    }

    /// Runs until `shutdown` fires or every handle is dropped, then stops
    /// the managed process.
    pub async fn run(mut self, mut inbox: Inbox, shutdown: CancellationToken) {
        self.startup().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                Some(completion) = inbox.completions.recv() => {
                    self.on_fetch_completed(completion).await;
                }
                Some(state) = inbox.process_events.recv() => self.on_process_state(state),
                command = inbox.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                change = next_store_change(&mut inbox.store_watcher) => match change {
                    Some(()) => self.on_store_changed().await,
                    None => {
                        tracing::warn!("Subscription config watcher stopped");
                        inbox.store_watcher = None;
                    }
                },
                _ = next_tick(&mut self.ticker) => self.on_tick(),
            }
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetUrl { raw, reply } => {
                let _ = reply.send(self.set_url(&raw).await);
            }
            Command::UpdateNow { reply } => {
                let _ = reply.send(self.update_now());
            }
            Command::StartProxy { reply } => {
                let _ = reply.send(self.start_proxy());
            }
            Command::StopProxy { reply } => {
                let _ = reply.send(self.stop_proxy());
            }
            Command::SelectLocal { index, reply } => {
                let _ = reply.send(self.select_local(index).await);
            }
            Command::ImportLocal { path, reply } => {
                let _ = reply.send(self.import_local(&path).await);
            }
        }
    }

    async fn startup(&mut self) {
        let stored = self.settings.get(SETTINGS_KEY_URL, "");
        if !stored.trim().is_empty() {
            match SubscriptionUrl::parse(&stored) {
                Ok(url) => self.url = Some(url),
                Err(e) => tracing::warn!(
                    "{}",
                    errors::url::stored_value_invalid(&stored, &e.to_string())
                ),
            }
        }
        self.status
            .update(|status| status.subscription_url = self.url.clone());

        self.reconcile().await;

        if self.url.is_some() {
            let outcome = self.status.load().message.clone();
            self.begin_fetch();
            self.announce(&errors::subscription::loaded(
                outcome.trim_start_matches("Status: "),
            ));
            self.ensure_timer();
        } else {
            tracing::info!("{}", errors::subscription::NOT_CONFIGURED);
        }
    }

    async fn set_url(&mut self, raw: &str) -> Result<UrlAccepted, SyncError> {
        let url = SubscriptionUrl::parse(raw).inspect_err(|e| {
            tracing::warn!("Rejected subscription URL: {}", e.user_message());
        })?;

        self.settings.set(SETTINGS_KEY_URL, url.as_str());
        self.settings
            .flush()
            .map_err(|e| SyncError::Settings(format!("{:#}", e)))?;

        let accepted = UrlAccepted::new(url.clone());
        if let Some(warning) = accepted.warning() {
            tracing::warn!("{}", warning);
        }

        self.url = Some(url);
        self.status.update(|status| {
            status.subscription_url = self.url.clone();
            status.warning = accepted.warning().map(str::to_string);
        });
        tracing::info!("{}", errors::subscription::SAVED);

        self.announce(errors::subscription::SAVING);
        self.begin_fetch();
        self.ensure_timer();

        Ok(accepted)
    }

    fn update_now(&mut self) -> Result<FetchSessionId, SyncError> {
        if self.url.is_none() {
            tracing::warn!("{}", errors::subscription::NO_URL_FOR_UPDATE);
            return Err(SyncError::NotConfigured);
        }
        self.announce(errors::subscription::MANUAL_UPDATE);
        self.begin_fetch().ok_or(SyncError::NotConfigured)
    }

    fn on_tick(&mut self) {
        if self.url.is_none() {
            tracing::debug!("{}", errors::subscription::NOT_CONFIGURED);
            return;
        }
        if self.in_flight.is_some() {
            tracing::debug!("Scheduled update skipped, a download is still in flight");
            return;
        }
        self.begin_fetch();
    }

    /// Starts a fetch, aborting whatever was in flight.
    fn begin_fetch(&mut self) -> Option<FetchSessionId> {
        let url = self.url.clone()?;

        if let Some(previous) = self.in_flight.take() {
            previous.abort();
        }

        let id = self.next_session;
        self.next_session = id.next();
        self.in_flight = Some(FetchSession::spawn(
            id,
            &self.source,
            &url,
            self.completions.clone(),
        ));
        self.set_sync_state(SyncState::Fetching);
        self.announce(errors::subscription::DOWNLOADING);
        tracing::debug!("Fetch session {} started for {}", id, url);

        Some(id)
    }

    /// The first tick comes one interval from now; callers fetch
    /// immediately themselves.
    fn ensure_timer(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.update_interval, self.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        tracing::info!(
            "Subscription updates every {}",
            humantime::format_duration(self.update_interval)
        );
    }

    async fn on_fetch_completed(&mut self, completion: FetchCompletion) {
        let current = self.in_flight.as_ref().map(FetchSession::id);
        if current != Some(completion.session) {
            tracing::debug!("Ignoring completion of stale fetch session {}", completion.session);
            return;
        }
        self.in_flight = None;

        match completion.result {
            Ok(bytes) => self.apply(bytes).await,
            Err(FetchError::Cancelled) => {}
            Err(error) => self.report_fetch_failure(error),
        }

        self.set_sync_state(SyncState::Idle);
    }

    fn report_fetch_failure(&mut self, error: FetchError) {
        let detail = error.to_string();
        let (message, preview) = if error.is_tls() {
            let diagnostics = tls::diagnose();
            (
                errors::subscription::tls_failed(&detail, &diagnostics),
                errors::subscription::tls_failed_preview(&detail, &diagnostics),
            )
        } else {
            (
                errors::subscription::download_failed(&detail),
                errors::subscription::download_failed_preview(&detail),
            )
        };
        self.fail(message, preview, SyncError::Fetch(error));
    }

    async fn apply(&mut self, bytes: Vec<u8>) {
        self.set_sync_state(SyncState::Applying);

        let document = match validate(&bytes) {
            Ok(document) => document,
            Err(error) => {
                let (message, preview) = match &error {
                    ValidationError::Empty => (
                        errors::subscription::EMPTY.to_string(),
                        errors::subscription::EMPTY_PREVIEW.to_string(),
                    ),
                    ValidationError::Malformed(parse_error) => (
                        errors::subscription::malformed(parse_error),
                        errors::subscription::malformed_preview(
                            parse_error,
                            &String::from_utf8_lossy(&bytes),
                        ),
                    ),
                    ValidationError::NotAnObject => (
                        errors::subscription::NOT_AN_OBJECT.to_string(),
                        errors::subscription::NOT_AN_OBJECT_PREVIEW.to_string(),
                    ),
                    ValidationError::MissingRequiredSections => (
                        errors::subscription::MISSING_SECTIONS.to_string(),
                        errors::subscription::MISSING_SECTIONS_PREVIEW.to_string(),
                    ),
                };
                self.fail(message, preview, SyncError::Validation(error));
                return;
            }
        };

        let now = Timestamp::now();
        let unchanged = self.active.is_subscription()
            && self.active_bytes.as_deref() == Some(document.raw());
        if unchanged {
            let message = errors::subscription::unchanged(&now.local_display());
            tracing::info!("{}", message);
            self.status.update(|status| {
                status.message = message;
                status.preview = document.pretty().to_string();
                status.last_error = None;
                status.last_update = Some(now);
            });
            return;
        }

        if let Err(error) = self.store.write(&document).await {
            let message = errors::subscription::save_failed(&error.to_string());
            self.fail(message.clone(), message, SyncError::Store(error));
            return;
        }

        self.active = ActiveConfig::Subscription {
            path: self.store.path().to_path_buf(),
        };
        self.active_bytes = Some(document.raw().to_vec());

        let message = errors::subscription::updated(&now.local_display());
        tracing::info!("{}", message);
        self.status.update(|status| {
            status.message = message;
            status.preview = document.pretty().to_string();
            status.active = self.active.clone();
            status.last_error = None;
            status.last_update = Some(now);
        });

        let action = reconciler::plan_after_update(
            true,
            self.process.current_state(),
            self.store.path(),
        );
        self.perform(action);
    }

    async fn load_candidate(&self) -> (SubscriptionCandidate, Option<Vec<u8>>) {
        if self.url.is_none() {
            return (SubscriptionCandidate::NotConfigured, None);
        }
        match self.store.read().await {
            Ok(bytes) => match validate(&bytes) {
                Ok(document) => (SubscriptionCandidate::Valid(document), Some(bytes)),
                Err(error) => (SubscriptionCandidate::Invalid(error), None),
            },
            Err(StoreError::NotFound { .. }) => (SubscriptionCandidate::Missing, None),
            Err(error) => (SubscriptionCandidate::Unreadable(error), None),
        }
    }

    /// Recomputes the active configuration and brings the process in line.
    async fn reconcile(&mut self) {
        let (candidate, bytes) = self.load_candidate().await;
        let selection =
            reconciler::select_active(&candidate, self.store.path(), self.catalog.as_ref());

        let content_changed = selection.active.is_subscription() && bytes != self.active_bytes;
        let previous = std::mem::replace(&mut self.active, selection.active);
        self.active_bytes = if self.active.is_subscription() {
            bytes
        } else {
            None
        };

        tracing::info!("{} (active: {})", selection.status, self.active);
        self.status.update(|status| {
            status.message = selection.status;
            status.preview = selection.preview;
            status.active = self.active.clone();
        });

        let action = reconciler::plan_for_selection(
            &previous,
            &self.active,
            content_changed,
            self.process.current_state(),
        );
        self.perform(action);
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::None => {}
            Action::Stop => {
                tracing::info!("No usable configuration, stopping sing-box");
                if let Err(e) = self.process.stop() {
                    tracing::warn!("Failed to stop sing-box: {:#}", e);
                }
            }
            Action::Restart { config_path } => {
                tracing::info!("Restarting sing-box with {}", config_path.display());
                if let Err(e) = self.process.stop() {
                    tracing::warn!("Failed to stop sing-box before restart: {:#}", e);
                }
                if let Err(e) = self.process.start(&config_path) {
                    let detail = format!("{:#}", e);
                    let message = errors::process::restart_failed(&detail);
                    tracing::error!("{}", message);
                    self.status.update(|status| {
                        status.message = message;
                        status.last_error = Some(SyncError::Process(detail));
                    });
                }
            }
        }
    }

    fn start_proxy(&mut self) -> Result<(), SyncError> {
        let Some(config_path) = self.active.path().map(Path::to_path_buf) else {
            tracing::warn!("{}", errors::process::NO_CONFIGURATION);
            return Err(SyncError::NoConfiguration);
        };
        self.process
            .start(&config_path)
            .map_err(|e| SyncError::Process(format!("{:#}", e)))
    }

    fn stop_proxy(&mut self) -> Result<(), SyncError> {
        self.process
            .stop()
            .map_err(|e| SyncError::Process(format!("{:#}", e)))
    }

    async fn select_local(&mut self, index: usize) -> Result<(), SyncError> {
        self.catalog
            .select(index)
            .map_err(|e| SyncError::Catalog(format!("{:#}", e)))?;
        self.reconcile().await;
        Ok(())
    }

    async fn import_local(&mut self, path: &Path) -> Result<String, SyncError> {
        let name = self
            .catalog
            .import(path)
            .map_err(|e| SyncError::Catalog(format!("{:#}", e)))?;
        self.reconcile().await;
        Ok(name)
    }

    fn on_process_state(&mut self, state: ProxyProcessState) {
        tracing::info!("sing-box is {}", state);
        self.status.update(|status| status.process_state = state);
        self.proxy_active.send_if_modified(|active| {
            let next = state.is_active();
            let modified = *active != next;
            *active = next;
            modified
        });
    }

    /// Someone else touched the stored document.
    async fn on_store_changed(&mut self) {
        if self.url.is_none() {
            return;
        }
        let on_disk = self.store.read().await.ok();
        if self.active.is_subscription() && on_disk.is_some() && on_disk == self.active_bytes {
            return;
        }
        tracing::info!(
            "Subscription config changed on disk: {}",
            self.store.path().display()
        );
        self.reconcile().await;
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutting down sync controller");

        if let Some(session) = self.in_flight.take() {
            session.abort();
        }
        self.ticker = None;

        if self.process.current_state().is_active()
            && let Err(e) = self.process.stop()
        {
            tracing::warn!("Failed to stop sing-box during shutdown: {:#}", e);
        }
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.process.stopped())
            .await
            .is_err()
        {
            tracing::warn!("sing-box did not exit before shutdown completed");
        }

        tracing::info!("Sync controller shutdown complete");
    }

    fn announce(&self, message: &str) {
        tracing::info!("{}", message);
        self.status
            .update(|status| status.message = message.to_string());
    }

    fn fail(&self, message: String, preview: String, error: SyncError) {
        tracing::warn!("{}", message);
        self.status.update(|status| {
            status.message = message;
            status.preview = preview;
            status.last_error = Some(error);
        });
    }

    fn set_sync_state(&mut self, state: SyncState) {
        self.sync_state = state;
        self.status.update(|status| status.sync_state = state);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_store_change(watcher: &mut Option<StoreWatcher>) -> Option<()> {
    match watcher {
        Some(watcher) => watcher.next_change().await,
        None => std::future::pending().await,
    }
}
