//! desktop-launcher CLI entry point.
//!
//! Runs the launcher headless: installs on first run, validates, starts the
//! backend server and keeps it running until Ctrl-C.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use backend_env::TorchDevice;
use backend_launch::{find_available_port, next_port_range, HealthProbe, ServerProgress};
use clap::{Parser, Subcommand, ValueEnum};
use desktop_launcher::{
    AppState, DesktopApp, DesktopConfig, DevOverrides, InstallOptions, InstallOutcome,
    InstallWizard, LauncherConfig, LauncherObserver, LauncherPaths, ObserverRegistry,
    ValidationReport,
};
use futures::future::BoxFuture;
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "desktop-launcher")]
#[command(about = "Install, validate and run the local backend server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory holding config.json (default: platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Directory for new installations and logs (default: platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// App resources with the backend sources and bundled uv
    #[arg(long, global = true)]
    resources_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install if needed, start the backend and run until Ctrl-C (default)
    Run {
        /// Base path for a first-run install
        #[arg(long)]
        base_path: Option<PathBuf>,

        /// Compute device for a first-run install (default: detected)
        #[arg(long, value_parser = parse_device)]
        device: Option<TorchDevice>,

        /// Existing install whose models should be reused
        #[arg(long)]
        migrate_from: Option<PathBuf>,
    },

    /// Validate the current installation
    Validate {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run a repair action on the current installation
    Repair {
        #[arg(value_enum)]
        action: RepairAction,
    },

    /// Find a free port for the backend
    FindPort {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value = "8000")]
        start: u16,

        /// Exclusive end of the scan (default: start + 1000)
        #[arg(long)]
        end: Option<u16>,
    },

    /// Show installation and server status
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RepairAction {
    /// Delete and recreate the Python environment
    ResetVenv,
    /// Reinstall the required packages
    Reinstall,
    /// Clear the package cache
    ClearCache,
}

fn parse_device(value: &str) -> Result<TorchDevice, String> {
    match value.to_ascii_lowercase().as_str() {
        "nvidia" => Ok(TorchDevice::Nvidia),
        "mps" => Ok(TorchDevice::Mps),
        "cpu" => Ok(TorchDevice::Cpu),
        "unsupported" => Ok(TorchDevice::Unsupported),
        other => Err(format!(
            "unknown device {other:?} (expected nvidia, mps, cpu or unsupported)"
        )),
    }
}

/// Answers the first-run questions from CLI flags.
struct CliWizard {
    base_path: Option<PathBuf>,
    device: Option<TorchDevice>,
    migrate_from: Option<PathBuf>,
}

impl InstallWizard for CliWizard {
    fn request_options<'a>(
        &'a self,
        suggested_base_path: &'a Path,
    ) -> BoxFuture<'a, Result<InstallOptions>> {
        Box::pin(async move {
            let device = match self.device {
                Some(device) => device,
                None => TorchDevice::detect().await,
            };
            Ok(InstallOptions {
                base_path: self
                    .base_path
                    .clone()
                    .unwrap_or_else(|| suggested_base_path.to_path_buf()),
                device,
                migration_source: self.migrate_from.clone(),
                extra_launch_args: None,
            })
        })
    }
}

/// Prints backend output to stdout.
struct ConsoleObserver;

impl LauncherObserver for ConsoleObserver {
    fn on_output(&self, line: &str) {
        println!("{line}");
    }

    fn on_server_progress(&self, status: ServerProgress) {
        info!("Server progress: {:?}", status);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config = launcher_config(&cli);

    match cli.command {
        None => run(config, None, None, None).await,
        Some(Commands::Run {
            base_path,
            device,
            migrate_from,
        }) => run(config, base_path, device, migrate_from).await,
        Some(Commands::Validate { json }) => validate(config, json).await,
        Some(Commands::Repair { action }) => repair(config, action).await,
        Some(Commands::FindPort { host, start, end }) => {
            let end = end.unwrap_or_else(|| next_port_range(start).1);
            let port = find_available_port(&host, start, end).await?;
            println!("{port}");
            Ok(())
        }
        Some(Commands::Status { json }) => status(config, json).await,
    }
}

fn launcher_config(cli: &Cli) -> LauncherConfig {
    let mut paths = LauncherPaths::default();
    if let Some(dir) = &cli.config_dir {
        paths.config_dir = dir.clone();
    }
    if let Some(dir) = &cli.data_dir {
        paths.log_dir = dir.join("logs");
        paths.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.resources_dir {
        paths.resources_dir = dir.clone();
    }
    LauncherConfig::new(paths, DevOverrides::from_env())
}

fn new_app(config: LauncherConfig) -> Result<DesktopApp> {
    let app_state = AppState::initialize()?;
    Ok(DesktopApp::new(config, app_state, ObserverRegistry::new()))
}

async fn run(
    config: LauncherConfig,
    base_path: Option<PathBuf>,
    device: Option<TorchDevice>,
    migrate_from: Option<PathBuf>,
) -> Result<()> {
    info!("desktop-launcher starting...");
    info!("  Config dir: {:?}", config.paths.config_dir);
    info!("  Resources: {:?}", config.paths.resources_dir);
    info!("  Logs: {:?}", config.paths.log_dir);

    let app = new_app(config)?;
    let _console = app.observers().subscribe(Arc::new(ConsoleObserver));

    let wizard = CliWizard {
        base_path,
        device,
        migrate_from,
    };
    if let InstallOutcome::NeedsRepair(installation) = app.ensure_installed(&wizard).await? {
        print_report(&installation.validation());
        eprintln!();
        eprintln!("The installation needs repair. Try `desktop-launcher repair reinstall`.");
        std::process::exit(1);
    }

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    match app.start_server_until(interrupted).await {
        Ok(Some(args)) => {
            println!("Backend ready at {}", args.base_url());
            tokio::signal::ctrl_c().await?;
        }
        Ok(None) => {
            info!("Interrupted during startup");
            return Ok(());
        }
        Err(e) => {
            app.shutdown().await?;
            return Err(e);
        }
    }

    info!("Shutting down...");
    app.shutdown().await
}

async fn validate(config: LauncherConfig, json: bool) -> Result<()> {
    let app = new_app(config)?;
    let Some(installation) = app.load_installation().await? else {
        bail!("No completed installation found; run `desktop-launcher run` first");
    };

    let report = installation.validate().await;
    if json {
        println!("{}", serde_json::to_string_pretty(report.as_ref())?);
    } else {
        print_report(&report);
    }
    if report.has_issues {
        std::process::exit(1);
    }
    Ok(())
}

async fn repair(config: LauncherConfig, action: RepairAction) -> Result<()> {
    let app = new_app(config)?;
    let _console = app.observers().subscribe(Arc::new(ConsoleObserver));
    if app.load_installation().await?.is_none() {
        bail!("No completed installation found; run `desktop-launcher run` first");
    }
    let Some(troubleshooting) = app.troubleshooting() else {
        bail!("Installation could not be loaded");
    };

    let success = match action {
        RepairAction::ResetVenv => troubleshooting.reset_environment().await?,
        RepairAction::Reinstall => troubleshooting.reinstall_requirements().await?,
        RepairAction::ClearCache => troubleshooting.clear_package_cache().await?,
    };

    println!();
    println!("Repair {}", if success { "succeeded" } else { "failed" });
    print_report(&troubleshooting.validation_state());
    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn status(config: LauncherConfig, json: bool) -> Result<()> {
    let desktop = DesktopConfig::load(&config.paths.config_file())?;
    let app = new_app(config)?;
    let installation = app.load_installation().await?;

    let url = installation
        .as_ref()
        .map(|i| app.resolve_server_args(i).base_url());
    let responding = match &url {
        Some(url) => {
            HealthProbe::new(url, Duration::from_secs(1), Duration::ZERO)
                .check()
                .await
        }
        None => false,
    };

    if json {
        let output = serde_json::json!({
            "install_state": desktop.install_state,
            "base_path": desktop.base_path,
            "device": desktop.device,
            "installed_at": desktop.installed_at,
            "url": url,
            "responding": responding,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("desktop-launcher Status");
        println!("=======================");
        println!(
            "Install state: {}",
            match desktop.install_state {
                Some(state) => format!("{:?}", state).to_lowercase(),
                None => "not installed".to_string(),
            }
        );
        if let Some(base) = &desktop.base_path {
            println!("Base path:     {}", base.display());
        }
        if let Some(device) = desktop.device {
            println!("Device:        {}", device);
        }
        if let Some(url) = &url {
            println!("Server URL:    {}", url);
            println!("Responding:    {}", if responding { "yes" } else { "no" });
        }
    }
    Ok(())
}

fn print_report(report: &ValidationReport) {
    let mark = |ok: bool| if ok { "ok" } else { "MISSING" };
    println!("Base path exists:     {}", mark(report.base_path_exists));
    println!("Base path writable:   {}", mark(report.base_path_writable));
    println!("uv available:         {}", mark(report.uv_present));
    println!("Environment exists:   {}", mark(report.environment_exists));
    println!("Environment valid:    {}", mark(report.environment_is_valid));
    println!("Required packages:    {}", mark(report.required_packages_present));
    for message in &report.error_messages {
        println!("  - {}", message);
    }
}
