//! The launch state machine.
//!
//! One [`Orchestrator`] owns every piece of session state. Everything that
//! happens concurrently (server exit, readiness, window close, signals)
//! arrives as a [`LifecycleEvent`] on a single channel and is handled in
//! order by the task running [`Orchestrator::run`].
//!
//! ```text
//! Init ─┬─> LocatingRuntime ─┬─> Installing ──┐
//!       │                    ├─> NoRuntimeFound ──> Failed
//!       │                    └────────────────┤
//!       └─────── (dev) ───────────────────────┴─> Starting ─> Polling ─> Ready
//!                                                     any ─> ShuttingDown ─> Terminated
//! ```

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::config::{LauncherConfig, PORT_ENV_VAR, RUNTIME_ENV_VAR};
use crate::error::LaunchError;
use crate::installer::{InstallOutcome, InstallerBridge};
use crate::locator::{HostProbe, RuntimeLocation, RuntimeLocator, SystemHost};
use crate::packages::{PackageCheck, PackageStatus};
use crate::platform::PlatformOps;
use crate::poller::ReadinessPoller;
use crate::supervisor::{ExitReport, ProcessSupervisor};
use crate::surface::{RuntimeChoice, Surface};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Init,
    LocatingRuntime,
    Installing,
    NoRuntimeFound,
    Starting,
    Polling,
    Ready,
    ShuttingDown,
    Failed,
    Terminated,
}

impl LifecycleState {
    /// Whether `self -> next` is a legal transition.
    pub fn allows(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Init, LocatingRuntime | Starting | ShuttingDown | Failed)
                | (
                    LocatingRuntime,
                    Installing | NoRuntimeFound | Starting | ShuttingDown | Failed
                )
                | (NoRuntimeFound, Failed | ShuttingDown)
                | (Installing, Starting | Failed | ShuttingDown)
                | (Starting, Polling | Failed | ShuttingDown)
                | (Polling, Ready | Failed | ShuttingDown)
                | (Ready, ShuttingDown | Failed)
                | (ShuttingDown, Terminated)
                | (Failed, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Terminated
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Init => "init",
            LifecycleState::LocatingRuntime => "locating-runtime",
            LifecycleState::Installing => "installing",
            LifecycleState::NoRuntimeFound => "no-runtime-found",
            LifecycleState::Starting => "starting",
            LifecycleState::Polling => "polling",
            LifecycleState::Ready => "ready",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Failed => "failed",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The readiness probe got an answer.
    ServerReady,
    ServerExited(ExitReport),
    WindowClosed,
    AllWindowsClosed,
    QuitRequested,
    /// A termination signal arrived (`"SIGTERM"`, `"SIGINT"`, `"ctrl-c"`).
    Signal(&'static str),
    /// The app was re-activated (dock click); re-present the window.
    Activate,
}

impl LifecycleEvent {
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::WindowClosed
                | LifecycleEvent::AllWindowsClosed
                | LifecycleEvent::QuitRequested
                | LifecycleEvent::Signal(_)
        )
    }
}

/// Sends events to a running orchestrator from any thread.
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleHandle {
    /// Returns `false` once the orchestrator is gone.
    pub fn send(&self, event: LifecycleEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Await `work`, giving up as soon as a shutdown event arrives.
///
/// Other events are dropped: nothing but shutdown may interrupt discovery,
/// package checks or installation, and `Activate` must not recreate the
/// window while the installer runs.
pub async fn race_shutdown<F: Future>(
    events: &mut mpsc::UnboundedReceiver<LifecycleEvent>,
    work: F,
) -> Result<F::Output, LifecycleEvent> {
    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return Ok(output),
            event = events.recv() => match event {
                Some(event) if event.is_shutdown() => return Err(event),
                Some(event) => debug!("[lifecycle] Ignoring {:?} while busy", event),
                None => return Ok(work.await),
            },
        }
    }
}

/// The R installation a launch runs with.
struct ResolvedRuntime {
    invocation: PathBuf,
    /// PATH of the shell that found R, passed to everything that runs it.
    search_path: Option<String>,
}

pub struct Orchestrator<S, H = SystemHost> {
    config: LauncherConfig,
    platform: PlatformOps,
    surface: S,
    locator: RuntimeLocator<H>,
    packages: PackageCheck,
    installer: InstallerBridge,
    supervisor: ProcessSupervisor,
    poller: ReadinessPoller,
    state: LifecycleState,
    history: Vec<LifecycleState>,
    install_in_progress: AtomicBool,
    presented: bool,
    failure: Option<LaunchError>,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    events_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl<S: Surface> Orchestrator<S, SystemHost> {
    pub fn new(config: LauncherConfig, surface: S) -> anyhow::Result<Self> {
        let locator = RuntimeLocator::for_platform(PlatformOps::current(), config.locate_timeout);
        Self::with_locator(config, surface, locator)
    }
}

impl<S: Surface, H: HostProbe> Orchestrator<S, H> {
    pub fn with_locator(
        config: LauncherConfig,
        surface: S,
        locator: RuntimeLocator<H>,
    ) -> anyhow::Result<Self> {
        let platform = PlatformOps::current();
        let poller = ReadinessPoller::new(config.poll_interval, config.probe_timeout)
            .context("Failed to build readiness probe client")?;
        let packages = PackageCheck::new(
            config.required_packages.clone(),
            config.package_check_timeout,
        );
        let installer = InstallerBridge::new(
            config.installer_path(platform),
            config.resource_dir.clone(),
            platform,
        );
        let supervisor = ProcessSupervisor::new(&config, platform);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            platform,
            surface,
            locator,
            packages,
            installer,
            supervisor,
            poller,
            state: LifecycleState::Init,
            history: vec![LifecycleState::Init],
            install_in_progress: AtomicBool::new(false),
            presented: false,
            failure: None,
            events_tx,
            events_rx,
        })
    }

    pub fn handle(&self) -> LifecycleHandle {
        LifecycleHandle {
            tx: self.events_tx.clone(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Every state entered so far, starting with `Init`.
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn failure(&self) -> Option<&LaunchError> {
        self.failure.as_ref()
    }

    pub fn install_in_progress(&self) -> bool {
        self.install_in_progress.load(Ordering::SeqCst)
    }

    pub fn presented(&self) -> bool {
        self.presented
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Run one launch attempt to completion. Always ends in `Terminated`.
    pub async fn run(&mut self) -> LifecycleState {
        if let Err(err) = self.drive().await {
            self.fail(err).await;
        }
        self.terminate().await;
        self.state
    }

    fn transition(&mut self, next: LifecycleState) -> bool {
        if !self.state.allows(next) {
            warn!(
                "[lifecycle] Ignoring illegal transition {} -> {}",
                self.state, next
            );
            return false;
        }
        info!("[lifecycle] {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
        true
    }

    fn begin_shutdown(&mut self, event: LifecycleEvent) {
        info!("[lifecycle] Shutting down ({:?})", event);
        self.transition(LifecycleState::ShuttingDown);
    }

    async fn drive(&mut self) -> Result<(), LaunchError> {
        let runtime = if self.config.dev_mode {
            info!("[lifecycle] Development mode, skipping R discovery");
            None
        } else {
            match self.prepare_runtime().await? {
                Some(runtime) => Some(runtime),
                // Shutdown requested while preparing
                None => return Ok(()),
            }
        };

        self.transition(LifecycleState::Starting);
        if let Some(runtime) = &runtime {
            let invocation = &runtime.invocation;
            if invocation.is_absolute() && !invocation.exists() {
                return Err(LaunchError::RuntimeVanished(invocation.clone()));
            }
        }

        let mut env = vec![(PORT_ENV_VAR.to_string(), self.config.port.to_string())];
        if let Some(runtime) = &runtime {
            env.push((
                RUNTIME_ENV_VAR.to_string(),
                runtime.invocation.to_string_lossy().to_string(),
            ));
            if let Some(path) = &runtime.search_path {
                env.push(("PATH".to_string(), path.clone()));
            }
        }

        let script = self.config.script_path(self.platform);
        let tx = self.events_tx.clone();
        self.supervisor
            .start(&script, &self.config.resource_dir, &env, move |report| {
                let _ = tx.send(LifecycleEvent::ServerExited(report));
            })
            .await?;

        self.transition(LifecycleState::Polling);
        let tx = self.events_tx.clone();
        let poll = self.poller.start(self.config.server_url(), move || {
            let _ = tx.send(LifecycleEvent::ServerReady);
        });
        self.supervisor.track_poll(poll);

        self.event_loop().await
    }

    /// Locate R and install missing packages. `Ok(None)` means shutdown was requested.
    async fn prepare_runtime(&mut self) -> Result<Option<ResolvedRuntime>, LaunchError> {
        self.transition(LifecycleState::LocatingRuntime);

        let location = match race_shutdown(&mut self.events_rx, self.locator.locate()).await {
            Ok(location) => location,
            Err(event) => {
                self.begin_shutdown(event);
                return Ok(None);
            }
        };

        let runtime = match location {
            RuntimeLocation::Found {
                invocation,
                method,
                search_path,
            } => {
                info!("[lifecycle] Using R {:?} ({})", invocation, method);
                ResolvedRuntime {
                    invocation,
                    search_path,
                }
            }
            RuntimeLocation::NotFound => {
                self.transition(LifecycleState::NoRuntimeFound);
                let url = self.platform.download_url();
                match race_shutdown(&mut self.events_rx, self.surface.choose_missing_runtime(url))
                    .await
                {
                    Ok(RuntimeChoice::Download) => {
                        info!("[lifecycle] Opening {}", url);
                        let _ = self.platform.open_url(url);
                    }
                    Ok(RuntimeChoice::Quit) => {}
                    Err(event) => {
                        self.begin_shutdown(event);
                        return Ok(None);
                    }
                }
                return Err(LaunchError::RuntimeNotFound);
            }
        };

        let check = self
            .packages
            .check(&runtime.invocation, runtime.search_path.as_deref());
        let status = match race_shutdown(&mut self.events_rx, check).await {
            Ok(status) => status,
            Err(event) => {
                self.begin_shutdown(event);
                return Ok(None);
            }
        };

        if let PackageStatus::Missing(missing) = status {
            info!("[lifecycle] Installing {} missing package(s)", missing.len());
            self.transition(LifecycleState::Installing);
            let install = self.installer.install(
                &runtime.invocation,
                runtime.search_path.as_deref(),
                &self.surface,
                &self.install_in_progress,
            );
            match race_shutdown(&mut self.events_rx, install).await {
                Ok(InstallOutcome::Success) => {}
                Ok(InstallOutcome::InstallerMissing(path)) => {
                    return Err(LaunchError::InstallerMissing(path));
                }
                Ok(InstallOutcome::Failure(message)) => {
                    return Err(LaunchError::InstallFailed(message));
                }
                Err(event) => {
                    self.begin_shutdown(event);
                    return Ok(None);
                }
            }
        }

        Ok(Some(runtime))
    }

    async fn event_loop(&mut self) -> Result<(), LaunchError> {
        while let Some(event) = self.events_rx.recv().await {
            match event {
                LifecycleEvent::ServerReady => {
                    if self.state != LifecycleState::Polling {
                        debug!("[lifecycle] Late readiness signal in {}", self.state);
                        continue;
                    }
                    self.transition(LifecycleState::Ready);
                    self.supervisor.clear_poll();
                    self.presented = true;
                    self.surface.present(&self.config.server_url());
                }
                LifecycleEvent::ServerExited(report) => {
                    self.supervisor.record_exit(&report);
                    match self.supervisor.diagnose_exit(&report) {
                        Some(err) => return Err(err),
                        None => {
                            info!("[lifecycle] Server exited cleanly");
                            self.transition(LifecycleState::ShuttingDown);
                            return Ok(());
                        }
                    }
                }
                LifecycleEvent::Activate => {
                    if self.state == LifecycleState::Ready {
                        self.surface.present(&self.config.server_url());
                    }
                }
                event => {
                    self.begin_shutdown(event);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn fail(&mut self, err: LaunchError) {
        error!("[lifecycle] Launch failed: {}", err);
        self.transition(LifecycleState::Failed);
        self.supervisor.stop().await;

        if !matches!(err, LaunchError::RuntimeNotFound) {
            if let Err(event) =
                race_shutdown(&mut self.events_rx, self.surface.show_error(&err)).await
            {
                debug!("[lifecycle] Error dialog interrupted by {:?}", event);
            }
        }
        self.failure = Some(err);
    }

    async fn terminate(&mut self) {
        self.supervisor.stop().await;
        if self.state != LifecycleState::Terminated {
            self.transition(LifecycleState::Terminated);
        }
        self.surface.quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            Init,
            LocatingRuntime,
            Installing,
            Starting,
            Polling,
            Ready,
            ShuttingDown,
            Terminated,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].allows(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Init.allows(Starting));
        assert!(LocatingRuntime.allows(Starting));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Init.allows(Ready));
        assert!(!Polling.allows(Installing));
        assert!(!Terminated.allows(Init));
        assert!(!Failed.allows(ShuttingDown));
        assert!(!NoRuntimeFound.allows(Starting));
        assert!(!Ready.allows(Polling));
    }

    #[test]
    fn test_every_live_state_can_shut_down() {
        for state in [Init, LocatingRuntime, Installing, NoRuntimeFound, Starting, Polling, Ready] {
            assert!(state.allows(ShuttingDown), "{}", state);
        }
    }

    #[test]
    fn test_shutdown_events() {
        assert!(LifecycleEvent::WindowClosed.is_shutdown());
        assert!(LifecycleEvent::Signal("SIGTERM").is_shutdown());
        assert!(!LifecycleEvent::Activate.is_shutdown());
        assert!(!LifecycleEvent::ServerReady.is_shutdown());
    }

    #[tokio::test]
    async fn test_race_shutdown_interrupts_work() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(LifecycleEvent::Activate).unwrap();
        tx.send(LifecycleEvent::QuitRequested).unwrap();

        let result = race_shutdown(&mut rx, std::future::pending::<()>()).await;
        assert_eq!(result, Err(LifecycleEvent::QuitRequested));
    }

    #[tokio::test]
    async fn test_race_shutdown_returns_output() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(LifecycleEvent::Activate).unwrap();

        let result = race_shutdown(&mut rx, async { 42 }).await;
        assert_eq!(result, Ok(42));
        drop(tx);
    }
}
