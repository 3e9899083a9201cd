use crate::backend::ProcessManager;
use crate::backend::types::ProxyProcessState;
use crate::errors;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessCall {
    Start(PathBuf),
    Stop,
}

#[derive(Debug, Default)]
struct MockState {
    state: ProxyProcessState,
    pid: Option<u32>,
    calls: Vec<ProcessCall>,
    fail_next_start: bool,
}

/// Shared view into a [`MockProcessManager`] that stays usable after the
/// manager itself was handed to the controller.
#[derive(Debug, Clone)]
pub struct MockProbe {
    inner: Arc<Mutex<MockState>>,
    events: mpsc::UnboundedSender<ProxyProcessState>,
}

impl MockProbe {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<ProcessCall> {
        self.lock().calls.clone()
    }

    pub fn starts(&self) -> Vec<PathBuf> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ProcessCall::Start(path) => Some(path.clone()),
                ProcessCall::Stop => None,
            })
            .collect()
    }

    pub fn state(&self) -> ProxyProcessState {
        self.lock().state
    }

    pub fn fail_next_start(&self) {
        self.lock().fail_next_start = true;
    }

    /// Simulates the proxy exiting on its own.
    pub fn crash(&self) {
        let mut inner = self.lock();
        if inner.state != ProxyProcessState::NotRunning {
            tracing::info!("MOCK: sing-box (PID {:?}) exited unexpectedly", inner.pid);
            inner.state = ProxyProcessState::NotRunning;
            inner.pid = None;
            let _ = self.events.send(ProxyProcessState::NotRunning);
        }
    }

    fn transition(&self, inner: &mut MockState, state: ProxyProcessState) {
        inner.state = state;
        let _ = self.events.send(state);
    }
}

/// Process manager that never spawns anything. Start and stop complete
/// immediately, reporting the same transitions a real process would.
#[derive(Debug)]
pub struct MockProcessManager {
    probe: MockProbe,
}

impl MockProcessManager {
    pub fn new(events: mpsc::UnboundedSender<ProxyProcessState>) -> Self {
        Self {
            probe: MockProbe {
                inner: Arc::new(Mutex::new(MockState::default())),
                events,
            },
        }
    }

    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    fn generate_fake_pid() -> u32 {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        (timestamp % 100000) as u32 + 10000
    }
}

impl ProcessManager for MockProcessManager {
    fn start(&mut self, config_path: &Path) -> Result<()> {
        let probe = self.probe.clone();
        let mut inner = probe.lock();
        inner.calls.push(ProcessCall::Start(config_path.to_path_buf()));

        anyhow::ensure!(!inner.state.is_active(), errors::process::ALREADY_RUNNING);

        if std::mem::take(&mut inner.fail_next_start) {
            anyhow::bail!(errors::process::spawn_failed("mock start failure"));
        }

        let pid = Self::generate_fake_pid();
        probe.transition(&mut inner, ProxyProcessState::Starting);
        inner.pid = Some(pid);
        probe.transition(&mut inner, ProxyProcessState::Running);

        tracing::info!(
            "MOCK: Started sing-box with {} (fake PID {})",
            config_path.display(),
            pid
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let probe = self.probe.clone();
        let mut inner = probe.lock();
        inner.calls.push(ProcessCall::Stop);

        match inner.state {
            ProxyProcessState::NotRunning => anyhow::bail!(errors::process::NOT_RUNNING),
            ProxyProcessState::Stopping => anyhow::bail!(errors::process::ALREADY_STOPPING),
            ProxyProcessState::Starting | ProxyProcessState::Running => {}
        }

        probe.transition(&mut inner, ProxyProcessState::Stopping);
        let pid = inner.pid.take();
        probe.transition(&mut inner, ProxyProcessState::NotRunning);

        tracing::info!("MOCK: Stopped sing-box (fake PID {:?})", pid);
        Ok(())
    }

    fn current_state(&self) -> ProxyProcessState {
        self.probe.state()
    }

    fn recent_output(&self) -> String {
        match self.probe.lock().pid {
            Some(pid) => format!("mock sing-box {} running\n", pid),
            None => String::new(),
        }
    }
}
