use crate::config::{BackendConfig, BackendDefaults};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a backend target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// No process (not started yet, exited cleanly, or stopped)
    Stopped,
    /// Process spawned, health endpoint not answered yet
    Starting,
    /// Process answered its health endpoint at least once
    Running,
    /// Process crashed, waiting for the cooldown before relaunch
    Restarting,
    /// Restart budget exhausted, target left down
    Failed,
}

/// Inputs to the target state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEvent {
    /// A new process was spawned
    Spawned,
    /// The health endpoint returned 200
    ProbeSucceeded,
    /// Unexpected exit with restart budget left
    CrashedWithRetry,
    /// Unexpected exit with the budget exhausted
    CrashedTerminal,
    /// Exit code 0 or terminated by a signal
    ExitedCleanly,
    /// Shutdown requested
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition from {from:?} on {event:?}")]
pub struct TransitionError {
    pub from: TargetState,
    pub event: TargetEvent,
}

impl TargetState {
    /// Transition table
    pub fn next(self, event: TargetEvent) -> Result<TargetState, TransitionError> {
        use TargetEvent::*;
        use TargetState::*;

        match (self, event) {
            (Stopped | Restarting, Spawned) => Ok(Starting),
            (Starting | Running, ProbeSucceeded) => Ok(Running),
            (Stopped | Starting | Running | Restarting, CrashedWithRetry) => Ok(Restarting),
            (Stopped | Starting | Running | Restarting, CrashedTerminal) => Ok(Failed),
            (Starting | Running, ExitedCleanly) => Ok(Stopped),
            (Failed, Stop) => Ok(Failed),
            (_, Stop) => Ok(Stopped),
            (from, event) => Err(TransitionError { from, event }),
        }
    }

    /// Whether traffic may be forwarded while in this state (readiness permitting)
    pub fn allows_traffic(self) -> bool {
        !matches!(self, TargetState::Restarting | TargetState::Failed)
    }
}

/// Observed health of a target
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub is_ready: bool,
    pub last_checked_at: Option<Instant>,
}

struct TargetRecord {
    state: TargetState,
    readiness: Readiness,
    /// Relaunches performed after unexpected exits
    restart_count: u32,
    /// Processes spawned in total
    launches: u32,
    monitor_started: bool,
}

impl TargetRecord {
    fn new() -> Self {
        Self {
            state: TargetState::Stopped,
            readiness: Readiness::default(),
            restart_count: 0,
            launches: 0,
            monitor_started: false,
        }
    }
}

enum ExitOutcome {
    Exited(std::io::Result<ExitStatus>),
    SpawnFailed,
    Stopped,
}

/// Supervises the backend processes.
///
/// Each supervised target gets one monitor task that owns its child and
/// loops spawn → wait → cooldown, so there is never more than one process
/// per target. Readiness and the state machine live in the same record and
/// are read by the router through [`accepts_traffic`](Supervisor::accepts_traffic).
///
/// [`new`](Supervisor::new) returns `Arc<Self>`; the lifecycle methods take
/// `self: &Arc<Self>` so monitor tasks can hold a reference.
pub struct Supervisor {
    targets: DashMap<String, Mutex<TargetRecord>>,
    configs: BTreeMap<String, BackendConfig>,
    defaults: BackendDefaults,
    shutdown_tx: watch::Sender<bool>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(configs: BTreeMap<String, BackendConfig>, defaults: BackendDefaults) -> Arc<Self> {
        let targets = DashMap::new();
        for name in configs.keys() {
            targets.insert(name.clone(), Mutex::new(TargetRecord::new()));
        }
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            targets,
            configs,
            defaults,
            shutdown_tx,
            monitors: Mutex::new(Vec::new()),
        })
    }

    pub fn target_names(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    pub fn get_config(&self, name: &str) -> Option<&BackendConfig> {
        self.configs.get(name)
    }

    pub fn defaults(&self) -> &BackendDefaults {
        &self.defaults
    }

    pub fn state(&self, name: &str) -> TargetState {
        self.targets
            .get(name)
            .map(|r| r.lock().state)
            .unwrap_or(TargetState::Stopped)
    }

    pub fn readiness(&self, name: &str) -> Option<Readiness> {
        self.targets.get(name).map(|r| r.lock().readiness)
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.readiness(name).map(|r| r.is_ready).unwrap_or(false)
    }

    /// Single source of truth for forwarding: ready, and not crashed or failed
    pub fn accepts_traffic(&self, name: &str) -> bool {
        self.targets
            .get(name)
            .map(|r| {
                let guard = r.lock();
                guard.readiness.is_ready && guard.state.allows_traffic()
            })
            .unwrap_or(false)
    }

    pub fn restart_count(&self, name: &str) -> u32 {
        self.targets.get(name).map(|r| r.lock().restart_count).unwrap_or(0)
    }

    pub fn launches(&self, name: &str) -> u32 {
        self.targets.get(name).map(|r| r.lock().launches).unwrap_or(0)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Record a probe result. Returns true when readiness flipped.
    ///
    /// Successes are ignored while the target is restarting or failed.
    pub fn record_probe(&self, name: &str, healthy: bool) -> bool {
        let Some(record) = self.targets.get(name) else {
            return false;
        };
        let mut guard = record.lock();
        guard.readiness.last_checked_at = Some(Instant::now());

        if healthy {
            if !guard.state.allows_traffic() {
                return false;
            }
            if let Ok(next) = guard.state.next(TargetEvent::ProbeSucceeded) {
                guard.state = next;
            }
            let changed = !guard.readiness.is_ready;
            guard.readiness.is_ready = true;
            changed
        } else {
            let changed = guard.readiness.is_ready;
            guard.readiness.is_ready = false;
            changed
        }
    }

    pub fn mark_ready(&self, name: &str) -> bool {
        self.record_probe(name, true)
    }

    pub fn mark_not_ready(&self, name: &str) -> bool {
        self.record_probe(name, false)
    }

    /// Feed an event to the target's state machine
    fn apply(&self, name: &str, event: TargetEvent) -> Option<TargetState> {
        let record = self.targets.get(name)?;
        let mut guard = record.lock();
        match guard.state.next(event) {
            Ok(next) => {
                if next != guard.state {
                    debug!(backend = name, from = ?guard.state, to = ?next, ?event, "Backend state changed");
                }
                guard.state = next;
                if !next.allows_traffic() || next == TargetState::Stopped {
                    guard.readiness.is_ready = false;
                }
                Some(next)
            }
            Err(e) => {
                warn!(backend = name, error = %e, "Ignoring backend state event");
                None
            }
        }
    }

    /// Start supervising a backend. Unsupervised (external) backends are only probed.
    pub fn start(self: &Arc<Self>, name: &str) -> anyhow::Result<()> {
        let config = self
            .get_config(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown backend: {}", name))?;

        if self.is_shutting_down() {
            anyhow::bail!("Supervisor is shutting down");
        }

        if !config.is_supervised() {
            info!(backend = name, port = config.port, "Backend is managed externally, probing only");
            return Ok(());
        }

        {
            let record = self
                .targets
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("Unknown backend: {}", name))?;
            let mut guard = record.lock();
            if guard.monitor_started {
                debug!(backend = name, "Backend already supervised");
                return Ok(());
            }
            guard.monitor_started = true;
        }

        let supervisor = Arc::clone(self);
        let name_owned = name.to_string();
        let handle = tokio::spawn(async move {
            supervisor.supervise(name_owned, config).await;
        });
        self.monitors.lock().push(handle);

        Ok(())
    }

    /// Start every configured backend
    pub fn start_all(self: &Arc<Self>) {
        for name in self.target_names() {
            if let Err(e) = self.start(&name) {
                error!(backend = %name, error = %e, "Failed to start backend supervision");
            }
        }
    }

    /// Monitor loop for one target
    async fn supervise(self: Arc<Self>, name: String, config: BackendConfig) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let max_restarts = config.max_restarts(&self.defaults);
        let cooldown = config.restart_cooldown(&self.defaults);
        let grace_period = config.shutdown_grace_period(&self.defaults);

        loop {
            if *shutdown_rx.borrow() {
                self.apply(&name, TargetEvent::Stop);
                break;
            }

            let outcome = match self.spawn_child(&name, &config) {
                Ok(mut child) => {
                    tokio::select! {
                        status = child.wait() => ExitOutcome::Exited(status),
                        _ = shutdown_requested(&mut shutdown_rx) => {
                            stop_child(&name, &mut child, grace_period).await;
                            ExitOutcome::Stopped
                        }
                    }
                }
                Err(e) => {
                    error!(backend = %name, error = %e, "Failed to spawn backend process");
                    ExitOutcome::SpawnFailed
                }
            };

            if let Some(record) = self.targets.get(&name) {
                record.lock().readiness.is_ready = false;
            }

            match outcome {
                ExitOutcome::Stopped => {
                    self.apply(&name, TargetEvent::Stop);
                    break;
                }
                ExitOutcome::Exited(Ok(status)) => match status.code() {
                    Some(0) => {
                        info!(backend = %name, "Backend process exited cleanly, not restarting");
                        self.apply(&name, TargetEvent::ExitedCleanly);
                        break;
                    }
                    None => {
                        info!(backend = %name, ?status, "Backend process terminated by signal, not restarting");
                        self.apply(&name, TargetEvent::ExitedCleanly);
                        break;
                    }
                    Some(code) => {
                        warn!(backend = %name, code, "Backend process exited unexpectedly");
                    }
                },
                ExitOutcome::Exited(Err(e)) => {
                    error!(backend = %name, error = %e, "Error waiting for backend process");
                }
                ExitOutcome::SpawnFailed => {}
            }

            // Unexpected exit: restart within budget, otherwise leave the target down
            let attempt = {
                let Some(record) = self.targets.get(&name) else {
                    break;
                };
                let mut guard = record.lock();
                if guard.restart_count >= max_restarts {
                    None
                } else {
                    guard.restart_count += 1;
                    Some(guard.restart_count)
                }
            };

            let Some(attempt) = attempt else {
                error!(
                    backend = %name,
                    max_restarts,
                    "Backend exceeded its restart budget, leaving it down"
                );
                self.apply(&name, TargetEvent::CrashedTerminal);
                break;
            };

            self.apply(&name, TargetEvent::CrashedWithRetry);
            warn!(
                backend = %name,
                attempt,
                max_restarts,
                cooldown_ms = cooldown.as_millis() as u64,
                "Restarting backend after cooldown"
            );

            tokio::select! {
                _ = tokio::time::sleep(cooldown) => {}
                _ = shutdown_requested(&mut shutdown_rx) => {
                    self.apply(&name, TargetEvent::Stop);
                    break;
                }
            }
        }

        debug!(backend = %name, state = ?self.state(&name), "Backend supervision ended");
    }

    fn spawn_child(&self, name: &str, config: &BackendConfig) -> anyhow::Result<Child> {
        let (program, args) = config.argv()?;

        info!(backend = name, command = %program, ?args, port = config.port, "Starting backend");

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", config.port.to_string());

        let mut child = cmd.spawn()?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            stream_output(name.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            stream_output(name.to_string(), "stderr", stderr);
        }

        if let Some(record) = self.targets.get(name) {
            record.lock().launches += 1;
        }
        self.apply(name, TargetEvent::Spawned);

        info!(backend = name, pid = pid.unwrap_or(0), "Backend process spawned");
        Ok(child)
    }

    /// Stop all backends and wait for their monitors to finish
    pub async fn stop_all(&self) {
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.monitors.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Backend monitor task failed");
            }
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopping| *stopping).await;
}

/// Forward a child's output into the log, one line per event
fn stream_output<R>(name: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if stream == "stderr" {
                warn!(target: "backend", backend = %name, stream, "{}", line);
            } else {
                info!(target: "backend", backend = %name, stream, "{}", line);
            }
        }
    });
}

/// SIGTERM, wait for the grace period, then SIGKILL
async fn stop_child(name: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(backend = name, pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(backend = name, ?status, "Backend process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(backend = name, error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                backend = name,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}
