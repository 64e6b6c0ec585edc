//! sandboxml-launcher CLI entry point.
//!
//! Runs the SandboxML server headless (optionally opening it in the
//! browser) and exposes the individual launch steps for troubleshooting.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand};
use log::info;

use launcher::config::LauncherConfig;
use launcher::installer::{InstallOutcome, InstallerBridge, LogProgress};
use launcher::lifecycle::{LifecycleState, Orchestrator};
use launcher::locator::{RuntimeLocation, RuntimeLocator};
use launcher::packages::{PackageCheck, PackageStatus};
use launcher::platform::PlatformOps;
use launcher::signals::forward_signals;
use launcher::surface::ConsoleSurface;

#[derive(Parser, Debug)]
#[command(name = "sandboxml-launcher")]
#[command(about = "Start and supervise the SandboxML R server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory containing run-r.sh / run-r.bat and the installer
    #[arg(long, global = true)]
    resource_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the server and wait until it exits (default if no command specified)
    Run {
        /// Skip R discovery and package checks
        #[arg(long)]
        dev: bool,

        /// Server port (default: 3000, or SANDBOXML_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Open the app in the default browser once it is ready
        #[arg(long)]
        open: bool,
    },

    /// Show where R was found
    Locate {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Check which required R packages are missing
    Check {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run the bundled package installer
    Install,

    /// Kill whatever is still listening on the server port
    ReclaimPort {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut config = LauncherConfig::from_env();
    if let Some(dir) = cli.resource_dir {
        config.resource_dir = dir;
    }

    let result = match cli.command {
        None => run(config, false).await,
        Some(Commands::Run { dev, port, open }) => {
            if dev {
                config.dev_mode = true;
            }
            if let Some(port) = port {
                config.port = port;
            }
            run(config, open).await
        }
        Some(Commands::Locate { json }) => locate(&config, json).await,
        Some(Commands::Check { json }) => check(&config, json).await,
        Some(Commands::Install) => install(&config).await,
        Some(Commands::ReclaimPort { port }) => reclaim_port(port.unwrap_or(config.port)).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: LauncherConfig, open: bool) -> anyhow::Result<bool> {
    info!("sandboxml-launcher starting...");
    info!("Configuration:");
    info!("  Resource dir: {:?}", config.resource_dir);
    info!("  Server URL:   {}", config.server_url());
    info!("  Dev mode:     {}", config.dev_mode);

    let surface = ConsoleSurface::new(PlatformOps::current(), open);
    let mut orchestrator = Orchestrator::new(config, surface)?;
    let signals = forward_signals(orchestrator.handle());

    let state = orchestrator.run().await;
    signals.abort();

    Ok(state == LifecycleState::Terminated && orchestrator.failure().is_none())
}

async fn locate(config: &LauncherConfig, json: bool) -> anyhow::Result<bool> {
    let locator = RuntimeLocator::for_platform(PlatformOps::current(), config.locate_timeout);
    let location = locator.locate().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&location)?);
    } else {
        match &location {
            RuntimeLocation::Found {
                invocation,
                method,
                search_path,
            } => {
                println!("R found: {} (via {})", invocation.display(), method);
                if let Some(path) = search_path {
                    println!("PATH: {}", path);
                }
            }
            RuntimeLocation::NotFound => {
                println!("R not found.");
                println!("Download it from {}", PlatformOps::current().download_url());
            }
        }
    }
    Ok(location.is_found())
}

async fn check(config: &LauncherConfig, json: bool) -> anyhow::Result<bool> {
    let locator = RuntimeLocator::for_platform(PlatformOps::current(), config.locate_timeout);
    let location = locator.locate().await;
    let Some(runtime) = location.invocation() else {
        anyhow::bail!("R not found; cannot check packages");
    };

    let status = PackageCheck::new(
        config.required_packages.clone(),
        config.package_check_timeout,
    )
    .check(runtime, location.search_path())
    .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        match &status {
            PackageStatus::Satisfied => println!("All required packages are installed."),
            PackageStatus::Missing(missing) => {
                println!("Missing packages:");
                for package in missing {
                    println!("  {}", package);
                }
            }
        }
    }
    Ok(status.is_satisfied())
}

async fn install(config: &LauncherConfig) -> anyhow::Result<bool> {
    let platform = PlatformOps::current();
    let locator = RuntimeLocator::for_platform(platform, config.locate_timeout);
    let location = locator.locate().await;
    let Some(runtime) = location.invocation() else {
        anyhow::bail!("R not found; install it from {}", platform.download_url());
    };

    let bridge = InstallerBridge::new(
        config.installer_path(platform),
        config.resource_dir.clone(),
        platform,
    );
    let in_progress = AtomicBool::new(false);
    let outcome = bridge
        .install(runtime, location.search_path(), &LogProgress, &in_progress)
        .await;
    match outcome {
        InstallOutcome::Success => {
            println!("Packages installed successfully.");
            Ok(true)
        }
        InstallOutcome::InstallerMissing(path) => {
            eprintln!("Package installer not found at {}", path.display());
            Ok(false)
        }
        InstallOutcome::Failure(message) => {
            eprintln!("Package installation failed:");
            eprintln!("{}", message);
            Ok(false)
        }
    }
}

async fn reclaim_port(port: u16) -> anyhow::Result<bool> {
    let platform = PlatformOps::current();
    let listeners = platform
        .listeners_on_port(port)
        .await
        .map_err(anyhow::Error::msg)?;
    if listeners.is_empty() {
        println!("Nothing is listening on port {}.", port);
        return Ok(true);
    }

    println!("Killing {} listener(s) on port {}...", listeners.len(), port);
    let outcome = platform.reclaim_port(port).await;
    Ok(outcome.is_completed())
}
