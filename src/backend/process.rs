use crate::backend::ProcessManager;
use crate::backend::types::ProxyProcessState;
use crate::errors;
use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STDERR_TAIL_BYTES: usize = 4096;
const KILL_TIMEOUT: Duration = Duration::from_secs(5);
const PREVIOUS_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Lifecycle {
    generation: u64,
    state: ProxyProcessState,
}

#[derive(Debug)]
struct Shared {
    lifecycle: Mutex<Lifecycle>,
    events: mpsc::UnboundedSender<ProxyProcessState>,
    stderr_tail: Mutex<String>,
    log_path: Mutex<Option<PathBuf>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> ProxyProcessState {
        lock(&self.lifecycle).state
    }

    /// Transitions reported by a superseded run are dropped.
    fn transition(&self, generation: u64, state: ProxyProcessState) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.generation != generation || lifecycle.state == state {
            return;
        }
        if state == ProxyProcessState::Running && lifecycle.state != ProxyProcessState::Starting {
            return;
        }
        lifecycle.state = state;
        let _ = self.events.send(state);
        tracing::debug!("sing-box run {} is now {}", generation, state);
    }

    fn push_stderr(&self, line: &str) {
        let mut tail = lock(&self.stderr_tail);
        tail.push_str(line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_BYTES {
            let mut cut = tail.len() - STDERR_TAIL_BYTES;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }
}

struct RunHandle {
    cancellation_token: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Runs `sing-box run -c <config>` and reports its lifecycle.
///
/// A restart is a `stop` followed by `start`. The new process is only
/// spawned once the previous one has exited, so both never hold the same
/// inbound ports.
pub struct SingBoxProcess {
    binary_path: PathBuf,
    log_directory: PathBuf,
    shared: Arc<Shared>,
    current: Option<RunHandle>,
}

impl SingBoxProcess {
    pub fn new(
        binary_path: PathBuf,
        log_directory: PathBuf,
        events: mpsc::UnboundedSender<ProxyProcessState>,
    ) -> Self {
        Self {
            binary_path,
            log_directory,
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle {
                    generation: 0,
                    state: ProxyProcessState::NotRunning,
                }),
                events,
                stderr_tail: Mutex::new(String::new()),
                log_path: Mutex::new(None),
            }),
            current: None,
        }
    }

    /// Log file of the current or most recent run.
    pub fn log_path(&self) -> Option<PathBuf> {
        lock(&self.shared.log_path).clone()
    }
}

impl ProcessManager for SingBoxProcess {
    fn start(&mut self, config_path: &Path) -> Result<()> {
        anyhow::ensure!(
            self.binary_path.exists(),
            errors::binary::not_found(&self.binary_path.display().to_string())
        );

        let generation = {
            let mut lifecycle = lock(&self.shared.lifecycle);
            anyhow::ensure!(!lifecycle.state.is_active(), errors::process::ALREADY_RUNNING);
            lifecycle.generation += 1;
            lifecycle.state = ProxyProcessState::Starting;
            let _ = self.shared.events.send(ProxyProcessState::Starting);
            lifecycle.generation
        };

        let cancellation_token = CancellationToken::new();
        let previous = self.current.take().map(|run| run.supervisor);
        let run = Run {
            generation,
            binary_path: self.binary_path.clone(),
            config_path: config_path.to_path_buf(),
            log_directory: self.log_directory.clone(),
            shared: self.shared.clone(),
            cancellation_token: cancellation_token.clone(),
        };

        tracing::info!(
            "Starting sing-box (run {}) with {}",
            generation,
            config_path.display()
        );

        let supervisor = tokio::spawn(run.supervise(previous));
        self.current = Some(RunHandle {
            cancellation_token,
            supervisor,
        });

        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let generation = {
            let lifecycle = lock(&self.shared.lifecycle);
            match lifecycle.state {
                ProxyProcessState::NotRunning => anyhow::bail!(errors::process::NOT_RUNNING),
                ProxyProcessState::Stopping => anyhow::bail!(errors::process::ALREADY_STOPPING),
                ProxyProcessState::Starting | ProxyProcessState::Running => lifecycle.generation,
            }
        };

        self.shared
            .transition(generation, ProxyProcessState::Stopping);
        if let Some(run) = &self.current {
            run.cancellation_token.cancel();
        }

        tracing::info!("Stopping sing-box (run {})", generation);
        Ok(())
    }

    fn current_state(&self) -> ProxyProcessState {
        self.shared.state()
    }

    fn recent_output(&self) -> String {
        lock(&self.shared.stderr_tail).clone()
    }

    fn stopped(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        match self.current.take() {
            Some(run) => Box::pin(async move {
                let _ = run.supervisor.await;
            }),
            None => Box::pin(async {}),
        }
    }
}

impl Drop for SingBoxProcess {
    fn drop(&mut self) {
        if let Some(run) = &self.current {
            run.cancellation_token.cancel();
        }
    }
}

struct Run {
    generation: u64,
    binary_path: PathBuf,
    config_path: PathBuf,
    log_directory: PathBuf,
    shared: Arc<Shared>,
    cancellation_token: CancellationToken,
}

impl Run {
    async fn supervise(self, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous
            && tokio::time::timeout(PREVIOUS_EXIT_TIMEOUT, previous).await.is_err()
        {
            tracing::warn!("Previous sing-box run did not exit in time, starting anyway");
        }

        if self.cancellation_token.is_cancelled() {
            self.shared
                .transition(self.generation, ProxyProcessState::NotRunning);
            return;
        }

        let child = match spawn_singbox_process(&self.binary_path, &self.config_path) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("{:#}", e);
                self.shared.push_stderr(&format!("{:#}", e));
                self.shared
                    .transition(self.generation, ProxyProcessState::NotRunning);
                return;
            }
        };

        match self.monitor(child).await {
            Ok(Some(status)) if !status.success() => {
                tracing::warn!("sing-box exited with {}", status);
            }
            Ok(Some(status)) => tracing::info!("sing-box exited with {}", status),
            Ok(None) => {}
            Err(e) => tracing::error!("sing-box monitor failed: {:#}", e),
        }

        self.shared
            .transition(self.generation, ProxyProcessState::NotRunning);
    }

    async fn monitor(&self, mut child: Child) -> Result<Option<ExitStatus>> {
        let pid = child.id().unwrap_or_default();
        let log_path = self.log_directory.join(format!(
            "sing-box-{}-{}.log",
            pid,
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        ));

        let stdout = child
            .stdout
            .take()
            .context(errors::process::FAILED_TO_CAPTURE_STDOUT)?;
        let stderr = child
            .stderr
            .take()
            .context(errors::process::FAILED_TO_CAPTURE_STDERR)?;

        tokio::fs::create_dir_all(&self.log_directory)
            .await
            .context(errors::logs::FAILED_TO_CREATE_DIR)?;
        let log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .context(errors::logs::FAILED_TO_CREATE_FILE)?;
        *lock(&self.shared.log_path) = Some(log_path.clone());

        tracing::info!("sing-box running with PID {}, log: {}", pid, log_path.display());
        self.shared
            .transition(self.generation, ProxyProcessState::Running);

        let mut log_writer = BufWriter::new(log_file);
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut log_ok = true;

        let status = loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    break terminate(&mut child, pid).await;
                }
                status = child.wait() => {
                    break status.ok();
                }
                line = stdout_lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if log_ok {
                            log_ok = append_line(&mut log_writer, &log_path, "STDOUT", &line).await;
                        }
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        tracing::error!("Error reading sing-box stdout: {}", e);
                        stdout_open = false;
                    }
                },
                line = stderr_lines.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        self.shared.push_stderr(&line);
                        if log_ok {
                            log_ok = append_line(&mut log_writer, &log_path, "STDERR", &line).await;
                        }
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        tracing::error!("Error reading sing-box stderr: {}", e);
                        stderr_open = false;
                    }
                },
            }
        };

        // Whatever the process printed right before exiting.
        let drain = async {
            while stderr_open && let Ok(Some(line)) = stderr_lines.next_line().await {
                self.shared.push_stderr(&line);
                if log_ok {
                    log_ok = append_line(&mut log_writer, &log_path, "STDERR", &line).await;
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), drain).await;

        if let Err(e) = log_writer.flush().await {
            tracing::error!("{}", errors::logs::failed_to_flush(&e.to_string()));
        }

        Ok(status)
    }
}

async fn terminate(child: &mut Child, pid: u32) -> Option<ExitStatus> {
    match child.start_kill() {
        Ok(_) => tracing::info!("Sent kill signal to sing-box {}", pid),
        Err(e) => tracing::warn!("Failed to send kill signal to sing-box {}: {}", pid, e),
    }

    match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::error!("Error waiting for sing-box {}: {}", pid, e);
            None
        }
        Err(_) => {
            tracing::warn!("sing-box {} did not exit within timeout", pid);
            None
        }
    }
}

async fn append_line<W>(writer: &mut W, log_path: &Path, stream: &str, line: &str) -> bool
where
    W: AsyncWriteExt + Unpin,
{
    let timestamp = chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let entry = format!("[{}] [{}] {}\n", timestamp, stream, line);
    match writer.write_all(entry.as_bytes()).await {
        Ok(()) => true,
        Err(e) => {
            if e.kind() == std::io::ErrorKind::StorageFull
                || e.to_string().contains("No space left on device")
            {
                tracing::error!(
                    "{}",
                    errors::disk::full_log_write(&log_path.display().to_string())
                );
            } else {
                tracing::error!("{}", errors::logs::failed_to_write(&e.to_string()));
            }
            false
        }
    }
}

pub fn spawn_singbox_process(binary_path: &Path, config_path: &Path) -> Result<Child> {
    tracing::info!(
        "Spawning sing-box process: {} run -c {}",
        binary_path.display(),
        config_path.display()
    );

    let mut command = Command::new(binary_path);
    command
        .arg("run")
        .arg("-c")
        .arg(config_path)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    command.spawn().map_err(|e| {
        let binary = binary_path.display().to_string();
        match e.kind() {
            std::io::ErrorKind::NotFound => {
                anyhow::anyhow!(errors::binary::not_found_simple(&binary))
            }
            std::io::ErrorKind::PermissionDenied => {
                anyhow::anyhow!(errors::binary::permission_denied(&binary))
            }
            std::io::ErrorKind::AddrInUse => anyhow::anyhow!(errors::process::PORT_IN_USE),
            _ => anyhow::anyhow!(errors::process::spawn_failed(&e.to_string())),
        }
    })
}

/// Deletes `sing-box-*.log` files older than the retention window.
pub async fn cleanup_old_logs(log_directory: &Path, retention_days: u32) -> Result<usize> {
    let cutoff_time = std::time::SystemTime::now()
        - Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);

    let mut read_dir = match tokio::fs::read_dir(log_directory).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Failed to read log directory: {}", log_directory.display())
            });
        }
    };

    let mut deleted_count = 0;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        let is_process_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("sing-box-") && name.ends_with(".log"));

        if is_process_log
            && let Ok(metadata) = entry.metadata().await
            && let Ok(modified) = metadata.modified()
            && modified < cutoff_time
        {
            match tokio::fs::remove_file(&path).await {
                Ok(_) => {
                    tracing::info!("Deleted old log file: {}", path.display());
                    deleted_count += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to delete old log file {}: {}", path.display(), e);
                }
            }
        }
    }

    if deleted_count > 0 {
        tracing::info!("Cleaned up {} old log files", deleted_count);
    }

    Ok(deleted_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "singbox_process_test_{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_missing_binary_is_rejected_before_spawning() {
        let dir = temp_dir();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = SingBoxProcess::new(dir.join("no-such-sing-box"), dir.join("logs"), tx);

        let error = process.start(&dir.join("config.json")).unwrap_err();
        assert!(error.to_string().contains("sing-box binary not found"));
        assert_eq!(process.current_state(), ProxyProcessState::NotRunning);
        assert!(rx.try_recv().is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let dir = temp_dir();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut process = SingBoxProcess::new(dir.join("sing-box"), dir.join("logs"), tx);

        let error = process.stop().unwrap_err();
        assert_eq!(error.to_string(), errors::process::NOT_RUNNING);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let process = SingBoxProcess::new(PathBuf::from("sing-box"), PathBuf::from("logs"), tx);

        for i in 0..1000 {
            process.shared.push_stderr(&format!("line {} ü", i));
        }

        let tail = process.recent_output();
        assert!(tail.len() <= STDERR_TAIL_BYTES);
        assert!(tail.ends_with("line 999 ü\n"));
    }

    #[test]
    fn test_stale_transitions_are_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let process = SingBoxProcess::new(PathBuf::from("sing-box"), PathBuf::from("logs"), tx);
        {
            let mut lifecycle = lock(&process.shared.lifecycle);
            lifecycle.generation = 2;
            lifecycle.state = ProxyProcessState::Starting;
        }

        process.shared.transition(1, ProxyProcessState::Running);
        assert_eq!(process.current_state(), ProxyProcessState::Starting);
        assert!(rx.try_recv().is_err());

        process.shared.transition(2, ProxyProcessState::Running);
        assert_eq!(rx.try_recv().unwrap(), ProxyProcessState::Running);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_and_foreign_files() {
        let dir = temp_dir();
        std::fs::write(dir.join("sing-box-100-20240101_000000.log"), "x").unwrap();
        std::fs::write(dir.join("singbox-manager.log.2024-01-01"), "x").unwrap();

        let deleted = cleanup_old_logs(&dir, 7).await.unwrap();
        assert_eq!(deleted, 0);
        assert!(dir.join("sing-box-100-20240101_000000.log").exists());

        assert_eq!(cleanup_old_logs(&dir.join("missing"), 7).await.unwrap(), 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_binary_and_captures_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = temp_dir();
        let binary = dir.join("sing-box");
        std::fs::write(
            &binary,
            "#!/bin/sh\necho \"started $*\"\necho \"warming up\" >&2\nexec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = SingBoxProcess::new(binary, dir.join("logs"), tx);
        process.start(&dir.join("config.json")).unwrap();

        assert_eq!(rx.recv().await, Some(ProxyProcessState::Starting));
        assert_eq!(rx.recv().await, Some(ProxyProcessState::Running));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !process.recent_output().contains("warming up")
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(process.recent_output().contains("warming up"));

        process.stop().unwrap();
        assert_eq!(rx.recv().await, Some(ProxyProcessState::Stopping));
        process.stopped().await;
        assert_eq!(rx.recv().await, Some(ProxyProcessState::NotRunning));

        let log = std::fs::read_to_string(process.log_path().unwrap()).unwrap();
        assert!(log.contains("[STDOUT] started run -c"));
        assert!(log.contains("[STDERR] warming up"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
