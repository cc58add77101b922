//! Application orchestration: install → validate → start → serve requests →
//! shut down.

use std::future::Future;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use backend_launch::args::{LISTEN_FLAG, PORT_FLAG};
use backend_launch::{
    find_available_port, next_port_range, HealthProbe, ServerArgs, ServerCommand,
    ServerProgress, ServerState, ServerSupervisor, SupervisorConfig, SupervisorError,
};
use log::{info, warn};

use crate::app_state::AppState;
use crate::config::{LauncherConfig, DEFAULT_HOST, DEFAULT_PORT};
use crate::events::track;
use crate::install_manager::{InstallError, InstallOutcome, InstallWizard, InstallationManager};
use crate::installation::Installation;
use crate::observer::{LauncherObserver, ObserverRegistry, Subscription};
use crate::protocol::{Request, Response, ServerStatus};
use crate::server_config::register_bundled_custom_nodes;
use crate::troubleshooting::Troubleshooting;

/// Start attempts when the chosen port is taken between discovery and bind.
const MAX_START_ATTEMPTS: usize = 2;

impl LauncherObserver for AppState {
    fn on_server_progress(&self, status: ServerProgress) {
        self.set_server_progress(status);
    }
}

/// Session state that exists once an installation is known.
struct Session {
    installation: Arc<Installation>,
    supervisor: Arc<ServerSupervisor>,
    troubleshooting: Arc<Troubleshooting>,
}

pub struct DesktopApp {
    config: LauncherConfig,
    app_state: Arc<AppState>,
    observers: Arc<ObserverRegistry>,
    manager: InstallationManager,
    session: RwLock<Option<Arc<Session>>>,
    server_url: RwLock<Option<String>>,
    _app_state_subscription: Subscription,
}

impl DesktopApp {
    pub fn new(
        config: LauncherConfig,
        app_state: Arc<AppState>,
        observers: Arc<ObserverRegistry>,
    ) -> Self {
        let subscription = observers.subscribe(app_state.clone());
        Self {
            manager: InstallationManager::new(config.clone(), observers.clone(), app_state.clone()),
            config,
            app_state,
            observers,
            session: RwLock::new(None),
            server_url: RwLock::new(None),
            _app_state_subscription: subscription,
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn app_state(&self) -> &Arc<AppState> {
        &self.app_state
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    pub fn installation(&self) -> Option<Arc<Installation>> {
        self.session().map(|s| s.installation.clone())
    }

    pub fn supervisor(&self) -> Option<Arc<ServerSupervisor>> {
        self.session().map(|s| s.supervisor.clone())
    }

    pub fn troubleshooting(&self) -> Option<Arc<Troubleshooting>> {
        self.session().map(|s| s.troubleshooting.clone())
    }

    /// URL of the ready backend, once started.
    pub fn server_url(&self) -> Option<String> {
        self.server_url.read().ok().and_then(|u| u.clone())
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.read().ok().and_then(|s| s.clone())
    }

    /// Run the install manager and keep the resulting installation.
    pub async fn ensure_installed(
        &self,
        wizard: &dyn InstallWizard,
    ) -> Result<InstallOutcome, InstallError> {
        let outcome = self.manager.ensure_installed(wizard).await?;
        self.attach(outcome.installation().clone());
        Ok(outcome)
    }

    /// Load an existing installation without the first-run flow.
    pub async fn load_installation(&self) -> Result<Option<Arc<Installation>>, InstallError> {
        let installation = self.manager.load_installation().await?;
        if let Some(installation) = &installation {
            self.attach(installation.clone());
        }
        Ok(installation)
    }

    fn attach(&self, installation: Arc<Installation>) {
        // At most one backend process: keep a supervisor that still owns one.
        let supervisor = match self.supervisor() {
            Some(live) if live.state() != ServerState::Stopped => {
                warn!(
                    "[app] Backend is {:?}; keeping its supervisor for the reloaded installation",
                    live.state()
                );
                live
            }
            _ => Arc::new(self.build_supervisor(&installation)),
        };
        let troubleshooting = Arc::new(
            Troubleshooting::new(installation.clone()).with_supervisor(supervisor.clone()),
        );
        if let Ok(mut session) = self.session.write() {
            *session = Some(Arc::new(Session {
                installation,
                supervisor,
                troubleshooting,
            }));
        }
    }

    fn build_supervisor(&self, installation: &Installation) -> ServerSupervisor {
        let resources = &self.config.resources;
        let command = ServerCommand {
            program: installation.environment().python_path(),
            leading_args: vec![resources.main_script.to_string_lossy().to_string()],
            working_dir: resources.server_dir.clone(),
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
        };
        let core_paths = installation.core_paths(
            resources.front_end_root.clone(),
            self.config.paths.extra_models_config(),
        );

        let mut config = SupervisorConfig::new(command, core_paths, self.config.paths.log_dir.clone());
        config.probe_interval = self.config.timings.probe_interval;
        config.probe_timeout = self.config.timings.probe_timeout;
        config.kill_timeout = self.config.timings.kill_timeout;

        ServerSupervisor::new(config, self.observers.clone())
    }

    /// Listen address from dev overrides, then configured args, then defaults.
    ///
    /// `listen` and `port` are removed from the extra args.
    pub fn resolve_server_args(&self, installation: &Installation) -> ServerArgs {
        let mut extra_args = installation.descriptor().configured_launch_args.clone();
        let configured_host = extra_args.remove(LISTEN_FLAG).filter(|h| !h.is_empty());
        let configured_port = extra_args.remove(PORT_FLAG).and_then(|p| match p.parse::<u16>() {
            Ok(port) if port != 0 => Some(port),
            _ => {
                warn!("[app] Ignoring invalid configured port {:?}", p);
                None
            }
        });

        let overrides = &self.config.overrides;
        let host = overrides
            .host
            .clone()
            .or(configured_host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = overrides.port.or(configured_port).unwrap_or(DEFAULT_PORT);

        ServerArgs::new(host, port).with_extra_args(extra_args)
    }

    /// Start the backend and wait until it is ready.
    ///
    /// With `use_external_server` only waits for an already running server.
    pub async fn start_server(&self) -> Result<ServerArgs> {
        let session = self
            .session()
            .ok_or_else(|| anyhow!("No installation loaded"))?;
        let mut args = self.resolve_server_args(&session.installation);

        self.observers
            .notify_server_progress(ServerProgress::StartingEnvironment);

        if self.config.overrides.use_external_server {
            info!("[app] Using external server at {}", args.base_url());
            let probe = HealthProbe::new(
                &args.base_url(),
                self.config.timings.probe_interval,
                self.config.timings.probe_timeout,
            );
            if let Err(e) = probe.wait_until_ready().await {
                self.observers.notify_server_progress(ServerProgress::Error);
                return Err(e.into());
            }
            self.observers.notify_server_progress(ServerProgress::Ready);
            self.set_server_url(&args);
            return Ok(args);
        }

        register_bundled_custom_nodes(
            &self.config.paths.extra_models_config(),
            session.installation.base_path(),
            &self.config.resources.server_dir.join("custom_nodes"),
        )
        .context("Failed to register bundled custom nodes")?;

        let mut scan_from = args.port;
        for attempt in 1..=MAX_START_ATTEMPTS {
            let (start, end) = next_port_range(scan_from);
            args.port = find_available_port(&args.host, start, end).await?;
            info!("[app] Starting backend on {} (attempt {})", args.base_url(), attempt);

            match track("server:start", session.supervisor.start(args.clone())).await {
                Ok(()) => {
                    self.set_server_url(&args);
                    return Ok(args);
                }
                Err(SupervisorError::ServerExited(exit))
                    if attempt < MAX_START_ATTEMPTS && port_taken(&args).await =>
                {
                    warn!(
                        "[app] Backend exited with {} and port {} is now in use; retrying",
                        exit, args.port
                    );
                    scan_from = args.port.saturating_add(1);
                }
                Err(e) => return Err(e).context("Backend server failed to start"),
            }
        }
        Err(anyhow!("Backend server failed to start"))
    }

    /// [`start_server`](Self::start_server), abandoned when `cancel` finishes
    /// first. A backend spawned by the abandoned start is shut down and
    /// `Ok(None)` returned.
    pub async fn start_server_until<F>(&self, cancel: F) -> Result<Option<ServerArgs>>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            started = self.start_server() => started.map(Some),
            () = cancel => {
                info!("[app] Startup cancelled; stopping backend");
                self.shutdown().await?;
                Ok(None)
            }
        }
    }

    /// Stop the backend, escalating to a forced kill if it ignores the
    /// graceful signal.
    pub async fn shutdown(&self) -> Result<()> {
        self.app_state.set_quitting();
        let Some(supervisor) = self.supervisor() else {
            return Ok(());
        };

        match supervisor.kill().await {
            Ok(()) => Ok(()),
            Err(SupervisorError::KillTimeout(timeout)) => {
                warn!(
                    "[app] Backend ignored termination for {:?}; forcing",
                    timeout
                );
                supervisor.force_kill().await.map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current backend status.
    pub fn server_status(&self) -> ServerStatus {
        let supervisor = self.supervisor();
        ServerStatus {
            state: supervisor
                .as_ref()
                .map(|s| s.state())
                .unwrap_or(ServerState::Stopped),
            health: self.app_state.install_health(),
            url: self.server_url(),
            pid: supervisor.and_then(|s| s.pid()),
            launcher_started_at: self.app_state.started_at(),
        }
    }

    /// Handle one UI request.
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::FindPort { host, start, end } => {
                let end = end.unwrap_or_else(|| next_port_range(start).1);
                match find_available_port(&host, start, end).await {
                    Ok(port) => Response::Port { port },
                    Err(e) => Response::error(e),
                }
            }
            Request::ServerStatus => Response::Status {
                status: self.server_status(),
            },
            request => {
                let Some(troubleshooting) = self.troubleshooting() else {
                    return Response::error("No installation loaded");
                };
                self.handle_recovery(&troubleshooting, request).await
            }
        }
    }

    async fn handle_recovery(&self, troubleshooting: &Troubleshooting, request: Request) -> Response {
        let action = match request {
            Request::GetValidationState => {
                return Response::Validation {
                    report: troubleshooting.validation_state().as_ref().clone(),
                }
            }
            Request::ValidateInstallation => {
                return Response::Validation {
                    report: troubleshooting.validate().await.as_ref().clone(),
                }
            }
            Request::RestartCore => {
                return match troubleshooting.restart_server().await {
                    Ok(()) => Response::Restarted,
                    Err(e) => Response::error(format!("{:#}", e)),
                }
            }
            Request::InstallRequirements => troubleshooting.reinstall_requirements().await,
            Request::ClearCache => troubleshooting.clear_package_cache().await,
            Request::ResetVenv => troubleshooting.reset_environment().await,
            Request::FindPort { .. } | Request::ServerStatus => {
                return Response::error("Unsupported request")
            }
        };

        match action {
            Ok(success) => Response::ActionResult { success },
            Err(e) => Response::error(format!("{:#}", e)),
        }
    }

    /// Handle a raw JSON request and encode the response.
    pub async fn handle_json(&self, payload: &str) -> String {
        let response = match Request::from_json(payload) {
            Ok(request) => self.handle(request).await,
            Err(rejected) => rejected,
        };
        response.to_json()
    }

    fn set_server_url(&self, args: &ServerArgs) {
        if let Ok(mut url) = self.server_url.write() {
            *url = Some(args.base_url());
        }
    }
}

async fn port_taken(args: &ServerArgs) -> bool {
    find_available_port(&args.host, args.port, args.port.saturating_add(1))
        .await
        .is_err()
}
