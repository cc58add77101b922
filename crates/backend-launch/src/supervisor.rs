//! Backend server process supervision.
//!
//! The supervisor owns at most one backend child process and moves it
//! through `Stopped → Starting → Running → Stopping → Stopped`:
//!
//! - [`ServerSupervisor::start`] spawns the process and resolves only once the
//!   readiness probe succeeds. If the child exits first, the start fails
//!   immediately with the exit code/signal.
//! - [`ServerSupervisor::kill`] sends a graceful termination signal and waits a
//!   bounded time for the exit. It never escalates on its own;
//!   [`ServerSupervisor::force_kill`] is the explicit escalation path.
//! - Dropping the supervisor force-kills a live child.
//!
//! Every output line is stripped of ANSI codes, forwarded to the observer and
//! appended to a rotated log file.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::args::{compose_server_args, CoreLaunchPaths, ServerArgs};
use crate::log_files::{strip_ansi, ServerLog, DEFAULT_MAX_LOG_FILES};
use crate::probe::{HealthProbe, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TIMEOUT};
use crate::process::{configure_no_window, ExitInfo, OutputLines};

/// Default time to wait for the process to exit after a termination signal.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of recent output lines kept in memory per process.
const OUTPUT_BUFFER_LINES: usize = 1000;

/// Coarse startup progress reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerProgress {
    StartingEnvironment,
    StartingServer,
    Ready,
    Error,
}

/// Receives backend output and startup progress.
///
/// Called from reader tasks; implementations must not block.
pub trait ServerObserver: Send + Sync {
    fn on_output(&self, line: &str);
    fn on_server_progress(&self, status: ServerProgress);
}

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Starting => write!(f, "starting"),
            ServerState::Running => write!(f, "running"),
            ServerState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Errors from [`ServerSupervisor`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Backend server is {0}; it must be stopped before starting")]
    NotStopped(ServerState),

    #[error("Failed to spawn backend server {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open backend log: {0}")]
    Log(#[source] std::io::Error),

    #[error("Backend server exited with {0} before it became ready")]
    ServerExited(ExitInfo),

    #[error("Backend server did not become ready at {url} within {timeout:?}")]
    StartTimeout { url: String, timeout: Duration },

    #[error("Backend server did not exit within {0:?}")]
    KillTimeout(Duration),

    #[error("Backend server has not been started")]
    NeverStarted,
}

/// Program used to run the backend, plus the arguments that precede the
/// generated launch arguments (typically the backend's main script).
#[derive(Debug, Clone)]
pub struct ServerCommand {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Configuration for a [`ServerSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: ServerCommand,
    pub core_paths: CoreLaunchPaths,
    /// Directory holding the rotated backend logs.
    pub log_dir: PathBuf,
    /// Base name of the log file (`<name>.log`).
    pub log_name: String,
    pub max_log_files: usize,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub kill_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(command: ServerCommand, core_paths: CoreLaunchPaths, log_dir: PathBuf) -> Self {
        Self {
            command,
            core_paths,
            log_dir,
            log_name: "backend".to_string(),
            max_log_files: DEFAULT_MAX_LOG_FILES,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Force,
}

/// The single live backend process, owned by the supervisor.
struct ProcessHandle {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    output: Arc<StdMutex<VecDeque<String>>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    terminate_tx: mpsc::UnboundedSender<Termination>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        #[cfg(unix)]
        if self.is_alive() {
            if let Some(pid) = self.pid {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
        // Aborting the watcher drops the Child, which is kill_on_drop.
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Launches the backend and tracks its lifecycle.
pub struct ServerSupervisor {
    config: SupervisorConfig,
    observer: Arc<dyn ServerObserver>,
    state: Arc<StdMutex<ServerState>>,
    handle: StdMutex<Option<ProcessHandle>>,
    last_args: StdMutex<Option<ServerArgs>>,
}

impl ServerSupervisor {
    pub fn new(config: SupervisorConfig, observer: Arc<dyn ServerObserver>) -> Self {
        Self {
            config,
            observer,
            state: Arc::new(StdMutex::new(ServerState::Stopped)),
            handle: StdMutex::new(None),
            last_args: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap()
    }

    /// OS process id of the live backend, if any.
    pub fn pid(&self) -> Option<u32> {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .filter(|h| h.is_alive())
            .and_then(|h| h.pid)
    }

    /// Recent output lines of the current (or most recent) backend process.
    pub fn recent_output(&self) -> Vec<String> {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.output.lock().unwrap().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Arguments of the most recent start attempt.
    pub fn last_args(&self) -> Option<ServerArgs> {
        self.last_args.lock().unwrap().clone()
    }

    /// Full argument list passed to the backend program for `args`.
    pub fn launch_args(&self, args: &ServerArgs) -> Vec<String> {
        let mut all = self.config.command.leading_args.clone();
        all.extend(compose_server_args(args, &self.config.core_paths));
        all
    }

    /// Start the backend and wait until it answers the readiness probe.
    pub async fn start(&self, args: ServerArgs) -> Result<(), SupervisorError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ServerState::Stopped {
                return Err(SupervisorError::NotStopped(*state));
            }
            *state = ServerState::Starting;
        }
        *self.last_args.lock().unwrap() = Some(args.clone());

        self.observer
            .on_server_progress(ServerProgress::StartingServer);

        let result = self.launch_and_wait(&args).await;
        if let Err(ref e) = result {
            error!("[supervisor] Backend failed to start: {}", e);
            self.observer.on_server_progress(ServerProgress::Error);
        }
        result
    }

    /// Kill the current backend (if any) and start it again with the last arguments.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let args = self.last_args().ok_or(SupervisorError::NeverStarted)?;
        self.kill().await?;
        self.start(args).await
    }

    /// Gracefully terminate the backend and wait for it to exit.
    ///
    /// No-op when no process is running.
    pub async fn kill(&self) -> Result<(), SupervisorError> {
        self.terminate(Termination::Graceful).await
    }

    /// Forcefully kill the backend (and its process group on Unix).
    pub async fn force_kill(&self) -> Result<(), SupervisorError> {
        self.terminate(Termination::Force).await
    }

    async fn launch_and_wait(&self, args: &ServerArgs) -> Result<(), SupervisorError> {
        let log = match ServerLog::create(
            &self.config.log_dir,
            &self.config.log_name,
            self.config.max_log_files,
        )
        .await
        {
            Ok(log) => Arc::new(log),
            Err(e) => {
                self.set_state(ServerState::Stopped);
                return Err(SupervisorError::Log(e));
            }
        };

        let launch_args = self.launch_args(args);
        let command = &self.config.command;
        info!(
            "[supervisor] Starting backend: {:?} {:?}",
            command.program, launch_args
        );

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&launch_args)
            .current_dir(&command.working_dir)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_no_window(&mut cmd);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.set_state(ServerState::Stopped);
                return Err(SupervisorError::Spawn {
                    program: command.program.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        info!("[supervisor] Backend spawned with pid {:?}", pid);

        let alive = Arc::new(AtomicBool::new(true));
        let output = Arc::new(StdMutex::new(VecDeque::with_capacity(OUTPUT_BUFFER_LINES)));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (terminate_tx, terminate_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(3);
        if let Some(stdout) = child.stdout.take() {
            tasks.push(self.spawn_reader(stdout, log.clone(), output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tasks.push(self.spawn_reader(stderr, log.clone(), output.clone()));
        }
        tasks.push(tokio::spawn(watch_process(
            child,
            terminate_rx,
            exit_tx,
            alive.clone(),
            self.state.clone(),
            self.observer.clone(),
        )));

        // Replaces (and drops) the handle of a previous, already exited process.
        *self.handle.lock().unwrap() = Some(ProcessHandle {
            pid,
            alive,
            output,
            exit_rx: exit_rx.clone(),
            terminate_tx,
            tasks,
        });

        let probe = HealthProbe::new(
            &args.base_url(),
            self.config.probe_interval,
            self.config.probe_timeout,
        );

        tokio::select! {
            biased;

            exit = wait_for_exit(exit_rx) => {
                Err(SupervisorError::ServerExited(exit))
            }
            ready = probe.wait_until_ready() => match ready {
                Ok(()) => {
                    {
                        let mut state = self.state.lock().unwrap();
                        if *state == ServerState::Starting {
                            *state = ServerState::Running;
                        }
                    }
                    info!("[supervisor] Backend is ready at {}", args.base_url());
                    self.observer.on_server_progress(ServerProgress::Ready);
                    Ok(())
                }
                Err(timeout) => {
                    warn!("[supervisor] {}; terminating backend", timeout);
                    if let Err(e) = self.kill().await {
                        warn!("[supervisor] Backend did not stop after start timeout: {}", e);
                    }
                    Err(SupervisorError::StartTimeout {
                        url: timeout.url,
                        timeout: timeout.timeout,
                    })
                }
            }
        }
    }

    fn spawn_reader<R>(
        &self,
        reader: R,
        log: Arc<ServerLog>,
        output: Arc<StdMutex<VecDeque<String>>>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let observer = self.observer.clone();
        tokio::spawn(async move {
            let mut lines = OutputLines::new(reader);
            loop {
                let raw = match lines.next_line().await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[supervisor] Stopped reading backend output: {}", e);
                        break;
                    }
                };
                let line = strip_ansi(&raw);
                log.write_line(&line).await;
                {
                    let mut buffer = output.lock().unwrap();
                    if buffer.len() == OUTPUT_BUFFER_LINES {
                        buffer.pop_front();
                    }
                    buffer.push_back(line.clone());
                }
                observer.on_output(&line);
            }
        })
    }

    async fn terminate(&self, mode: Termination) -> Result<(), SupervisorError> {
        let (terminate_tx, exit_rx) = {
            let handle = self.handle.lock().unwrap();
            match handle.as_ref() {
                Some(h) if h.is_alive() => (h.terminate_tx.clone(), h.exit_rx.clone()),
                _ => {
                    info!("[supervisor] No backend process to kill");
                    return Ok(());
                }
            }
        };

        info!("[supervisor] Killing backend server ({:?})", mode);
        self.set_state(ServerState::Stopping);
        let _ = terminate_tx.send(mode);

        match tokio::time::timeout(self.config.kill_timeout, wait_for_exit(exit_rx)).await {
            Ok(exit) => {
                info!("[supervisor] Backend exited with {}", exit);
                Ok(())
            }
            Err(_) => Err(SupervisorError::KillTimeout(self.config.kill_timeout)),
        }
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap() = state;
    }
}

/// Wait until the watcher publishes the exit status.
async fn wait_for_exit(mut exit_rx: watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    match exit_rx.wait_for(|exit| exit.is_some()).await {
        Ok(exit) => exit.clone().unwrap_or(ExitInfo {
            code: None,
            signal: None,
        }),
        // Watcher gone without reporting: treat as exited.
        Err(_) => ExitInfo {
            code: None,
            signal: None,
        },
    }
}

/// Owns the child: waits for exit and applies termination requests.
async fn watch_process(
    mut child: Child,
    mut terminate_rx: mpsc::UnboundedReceiver<Termination>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    alive: Arc<AtomicBool>,
    state: Arc<StdMutex<ServerState>>,
    observer: Arc<dyn ServerObserver>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(mode) = terminate_rx.recv() => send_termination(&mut child, mode),
        }
    };

    let exit = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            error!("[supervisor] Failed to wait for backend: {}", e);
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };

    alive.store(false, Ordering::SeqCst);
    let previous = {
        let mut state = state.lock().unwrap();
        std::mem::replace(&mut *state, ServerState::Stopped)
    };

    match previous {
        ServerState::Running if !exit.success() => {
            error!("[supervisor] Backend exited unexpectedly with {}", exit);
            observer.on_output(&format!("Backend server exited with {}", exit));
            observer.on_server_progress(ServerProgress::Error);
        }
        ServerState::Running => info!("[supervisor] Backend exited cleanly"),
        _ => info!("[supervisor] Backend exited with {} while {}", exit, previous),
    }

    let _ = exit_tx.send(Some(exit));
}

fn send_termination(child: &mut Child, mode: Termination) {
    match mode {
        #[cfg(unix)]
        Termination::Graceful => {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!("[supervisor] Failed to send SIGTERM to {}: {}", pid, e);
                }
            }
        }
        #[cfg(not(unix))]
        Termination::Graceful => {
            if let Err(e) = child.start_kill() {
                warn!("[supervisor] Failed to terminate backend: {}", e);
            }
        }
        Termination::Force => {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    if e != nix::errno::Errno::ESRCH {
                        warn!("[supervisor] Failed to kill process group {}: {}", pid, e);
                    }
                }
            }
            if let Err(e) = child.start_kill() {
                warn!("[supervisor] Failed to kill backend: {}", e);
            }
        }
    }
}
