//! End-to-end launch sessions against fake launch scripts.
//!
//! Each test writes a `run-r.sh` into a temporary resource directory and
//! drives a real orchestrator through it. POSIX only: the scripts are
//! shell scripts and teardown relies on process groups.

#![cfg(unix)]

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use launcher::config::LauncherConfig;
use launcher::error::LaunchError;
use launcher::installer::{InstallPhase, InstallProgress};
use launcher::lifecycle::{LifecycleEvent, LifecycleHandle, LifecycleState, Orchestrator};
use launcher::locator::{HostProbe, RuntimeLocator, ShellMatch, SystemHost};
use launcher::platform::{PackageManagerQuery, PlatformOps, ShellProbe};
use launcher::poller::ReadinessPoller;
use launcher::supervisor::ProcessSupervisor;
use launcher::surface::{RuntimeChoice, Surface};
use serial_test::serial;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use LifecycleState::*;

#[derive(Debug, Clone, PartialEq)]
enum Record {
    RequestAnswered,
    Present(String),
    Error(String),
    RuntimeChoice,
    Install(InstallPhase),
    /// Whether the launch script had already run when the installer finished.
    LaunchMarkerAtInstallEnd(bool),
    Quit,
}

/// Surface that records every call, optionally closing the window once presented.
#[derive(Clone, Default)]
struct RecordingSurface {
    log: Arc<Mutex<Vec<Record>>>,
    close_on_present: Arc<Mutex<Option<LifecycleHandle>>>,
    launch_marker: Arc<Mutex<Option<PathBuf>>>,
}

impl RecordingSurface {
    fn records(&self) -> Vec<Record> {
        self.log.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn presented(&self) -> bool {
        self.records()
            .iter()
            .any(|r| matches!(r, Record::Present(_)))
    }

    fn close_window_when_presented(&self, handle: LifecycleHandle) {
        *self.close_on_present.lock().unwrap() = Some(handle);
    }

    /// Record whether `marker` exists each time an install finishes.
    fn watch_launch_marker(&self, marker: PathBuf) {
        *self.launch_marker.lock().unwrap() = Some(marker);
    }
}

impl InstallProgress for RecordingSurface {
    fn on_install(&self, phase: InstallPhase) {
        let finished = matches!(phase, InstallPhase::Finished { .. });
        let mut log = self.log.lock().unwrap();
        log.push(Record::Install(phase));
        if finished {
            if let Some(marker) = self.launch_marker.lock().unwrap().as_ref() {
                log.push(Record::LaunchMarkerAtInstallEnd(marker.exists()));
            }
        }
    }
}

impl Surface for RecordingSurface {
    fn present(&self, url: &str) {
        self.log.lock().unwrap().push(Record::Present(url.to_string()));
        if let Some(handle) = self.close_on_present.lock().unwrap().as_ref() {
            handle.send(LifecycleEvent::WindowClosed);
        }
    }

    fn show_error(&self, error: &LaunchError) -> impl Future<Output = ()> + Send {
        self.log.lock().unwrap().push(Record::Error(error.to_string()));
        std::future::ready(())
    }

    fn choose_missing_runtime(
        &self,
        _download_url: &str,
    ) -> impl Future<Output = RuntimeChoice> + Send {
        self.log.lock().unwrap().push(Record::RuntimeChoice);
        std::future::ready(RuntimeChoice::Quit)
    }

    fn quit(&self) {
        self.log.lock().unwrap().push(Record::Quit);
    }
}

/// Host with a single known R binary and no working shells.
struct FakeHost {
    runtime: Option<PathBuf>,
}

impl HostProbe for FakeHost {
    fn is_runtime_binary(&self, path: &Path) -> bool {
        self.runtime.as_deref() == Some(path)
    }

    fn probe_shell(
        &self,
        _probe: &ShellProbe,
    ) -> impl Future<Output = Option<ShellMatch>> + Send {
        std::future::ready(None)
    }

    fn query_prefix(
        &self,
        _query: &PackageManagerQuery,
    ) -> impl Future<Output = Option<PathBuf>> + Send {
        std::future::ready(None)
    }
}

fn fake_locator(runtime: Option<PathBuf>) -> RuntimeLocator<FakeHost> {
    let fixed: Vec<PathBuf> = runtime.iter().cloned().collect();
    RuntimeLocator::new(FakeHost { runtime }, PlatformOps::Posix)
        .with_fixed_paths(fixed)
        .with_shell_probes(vec![])
        .with_package_manager(None)
}

/// Locator that can only find R by asking `/bin/sh` with `search_path`.
fn shell_only_locator(search_path: &str) -> RuntimeLocator<SystemHost> {
    RuntimeLocator::new(SystemHost::default(), PlatformOps::Posix)
        .with_fixed_paths(vec![])
        .with_shell_probes(vec![ShellProbe {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), PlatformOps::Posix.shell_probe_script()],
            path_env: Some(search_path.to_string()),
        }])
        .with_package_manager(None)
}

fn command_available(program: &str, arg: &str) -> bool {
    std::process::Command::new(program)
        .arg(arg)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok()
}

/// `setsid`, `python3` and a port lookup tool are needed to leave an
/// orphan listener behind.
fn orphan_tools_available() -> bool {
    let python = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success());
    let setsid = std::process::Command::new("setsid")
        .arg("true")
        .status()
        .is_ok_and(|s| s.success());
    let lookup = command_available("lsof", "-v") || command_available("fuser", "-V");
    python && setsid && lookup
}

async fn port_accepts_connections(port: u16) -> bool {
    tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_ok()
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_config(temp_dir: &TempDir, port: u16) -> LauncherConfig {
    LauncherConfig {
        resource_dir: temp_dir.path().to_path_buf(),
        host: "127.0.0.1".to_string(),
        port,
        poll_interval: Duration::from_millis(50),
        probe_timeout: Duration::from_millis(500),
        stop_grace: Duration::from_secs(2),
        dev_mode: true,
        ..Default::default()
    }
}

/// Answer every request with 200, recording the answer before sending it.
async fn serve_http(listener: TcpListener, log: Arc<Mutex<Vec<Record>>>) {
    while let Ok((mut stream, _)) = listener.accept().await {
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        log.lock().unwrap().push(Record::RequestAnswered);
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
            .await;
    }
}

async fn run_with_timeout<S: Surface, H: HostProbe>(
    orchestrator: &mut Orchestrator<S, H>,
) -> LifecycleState {
    tokio::time::timeout(Duration::from_secs(20), orchestrator.run())
        .await
        .expect("session did not terminate")
}

#[tokio::test]
#[serial]
async fn test_window_presented_only_after_server_answers() {
    let temp_dir = TempDir::new().unwrap();
    write_script(temp_dir.path(), "run-r.sh", "sleep 30");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let surface = RecordingSurface::default();
    let server = tokio::spawn({
        let log = surface.log.clone();
        async move {
            // Let a few readiness requests fail first
            tokio::time::sleep(Duration::from_millis(300)).await;
            serve_http(listener, log).await;
        }
    });

    let mut orchestrator =
        Orchestrator::new(test_config(&temp_dir, port), surface.clone()).unwrap();
    surface.close_window_when_presented(orchestrator.handle());

    let state = run_with_timeout(&mut orchestrator).await;
    server.abort();

    assert_eq!(state, Terminated);
    assert_eq!(
        orchestrator.history(),
        &[Init, Starting, Polling, Ready, ShuttingDown, Terminated]
    );
    assert!(orchestrator.presented());
    assert!(orchestrator.failure().is_none());

    let records = surface.records();
    let first_answer = records
        .iter()
        .position(|r| *r == Record::RequestAnswered)
        .expect("no request answered");
    let present = records
        .iter()
        .position(|r| matches!(r, Record::Present(_)))
        .expect("window never presented");
    assert!(first_answer < present);
    assert_eq!(records.last(), Some(&Record::Quit));
    assert!(surface.errors().is_empty());
}

#[tokio::test]
#[serial]
async fn test_port_free_after_window_close() {
    let python_available = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success());
    if !python_available {
        eprintln!("python3 not available, skipping");
        return;
    }

    let temp_dir = TempDir::new().unwrap();
    write_script(
        temp_dir.path(),
        "run-r.sh",
        "exec python3 -m http.server \"$SANDBOXML_PORT\" --bind 127.0.0.1",
    );
    let port = free_port();

    let surface = RecordingSurface::default();
    let mut orchestrator =
        Orchestrator::new(test_config(&temp_dir, port), surface.clone()).unwrap();
    surface.close_window_when_presented(orchestrator.handle());

    let state = run_with_timeout(&mut orchestrator).await;
    assert_eq!(state, Terminated);
    assert!(surface.presented());

    // Nothing may still accept connections on the port
    tokio::time::sleep(Duration::from_millis(200)).await;
    let connect = tokio::net::TcpStream::connect(("127.0.0.1", port)).await;
    assert!(connect.is_err(), "port {} still has a listener", port);
}

#[tokio::test]
async fn test_stop_without_server_is_noop() {
    let config = LauncherConfig {
        port: free_port(),
        ..Default::default()
    };
    let mut supervisor = ProcessSupervisor::new(&config, PlatformOps::current());
    for _ in 0..5 {
        supervisor.stop().await;
        assert!(supervisor.process().is_none());
        assert!(supervisor.last_exit().is_none());
    }
}

#[tokio::test]
#[serial]
async fn test_missing_launch_script_fails() {
    let temp_dir = TempDir::new().unwrap();
    let surface = RecordingSurface::default();
    let mut orchestrator =
        Orchestrator::new(test_config(&temp_dir, free_port()), surface.clone()).unwrap();

    let state = run_with_timeout(&mut orchestrator).await;

    assert_eq!(state, Terminated);
    assert_eq!(orchestrator.history(), &[Init, Starting, Failed, Terminated]);
    assert!(matches!(
        orchestrator.failure(),
        Some(LaunchError::ScriptNotFound(_))
    ));
    let errors = surface.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("run-r.sh"));
    assert!(!surface.presented());
}

#[tokio::test]
#[serial]
async fn test_command_not_found_exit_reported_once() {
    let temp_dir = TempDir::new().unwrap();
    write_script(temp_dir.path(), "run-r.sh", "sleep 1\nexit 127");

    let surface = RecordingSurface::default();
    let mut config = test_config(&temp_dir, free_port());
    config.poll_interval = Duration::from_millis(100);
    let mut orchestrator = Orchestrator::new(config, surface.clone()).unwrap();

    let state = run_with_timeout(&mut orchestrator).await;

    assert_eq!(state, Terminated);
    assert_eq!(
        orchestrator.history(),
        &[Init, Starting, Polling, Failed, Terminated]
    );
    assert!(matches!(
        orchestrator.failure(),
        Some(LaunchError::CommandNotFound { code: 127 })
    ));
    let errors = surface.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("PATH"));
    assert!(!surface.presented());
}

#[tokio::test]
#[serial]
async fn test_crash_quotes_server_log() {
    let temp_dir = TempDir::new().unwrap();
    write_script(
        temp_dir.path(),
        "run-r.sh",
        "echo 'Error: there is no package called shiny' > sandboxml.log\nexit 1",
    );

    let surface = RecordingSurface::default();
    let mut orchestrator =
        Orchestrator::new(test_config(&temp_dir, free_port()), surface.clone()).unwrap();

    run_with_timeout(&mut orchestrator).await;

    let errors = surface.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("no package called shiny"));
}

#[tokio::test]
#[serial]
async fn test_clean_server_exit_ends_session_quietly() {
    let temp_dir = TempDir::new().unwrap();
    write_script(temp_dir.path(), "run-r.sh", "exit 0");

    let surface = RecordingSurface::default();
    let mut orchestrator =
        Orchestrator::new(test_config(&temp_dir, free_port()), surface.clone()).unwrap();

    let state = run_with_timeout(&mut orchestrator).await;

    assert_eq!(state, Terminated);
    assert_eq!(
        orchestrator.history(),
        &[Init, Starting, Polling, ShuttingDown, Terminated]
    );
    assert!(surface.errors().is_empty());
    assert!(orchestrator.failure().is_none());
}

#[tokio::test]
#[serial]
async fn test_quit_while_polling_stops_server() {
    let temp_dir = TempDir::new().unwrap();
    write_script(temp_dir.path(), "run-r.sh", "sleep 30");

    let surface = RecordingSurface::default();
    let mut orchestrator =
        Orchestrator::new(test_config(&temp_dir, free_port()), surface.clone()).unwrap();

    let handle = orchestrator.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.send(LifecycleEvent::Signal("SIGTERM"));
    });

    let started = std::time::Instant::now();
    let state = run_with_timeout(&mut orchestrator).await;

    assert_eq!(state, Terminated);
    assert_eq!(
        orchestrator.history(),
        &[Init, Starting, Polling, ShuttingDown, Terminated]
    );
    assert!(!surface.presented());
    assert!(surface.errors().is_empty());
    // Terminated by signal, not by waiting for `sleep 30`
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
#[serial]
async fn test_unreachable_server_keeps_polling() {
    let port = free_port();
    let poller = ReadinessPoller::new(Duration::from_millis(20), Duration::from_millis(200)).unwrap();
    let poll = poller.start(format!("http://127.0.0.1:{}", port), || {
        panic!("nothing is listening");
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while poll.attempts() < 5 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(poll.attempts() >= 5);
    poll.cancel();
}

#[tokio::test]
#[serial]
async fn test_missing_runtime_offers_download_then_fails() {
    let temp_dir = TempDir::new().unwrap();
    write_script(temp_dir.path(), "run-r.sh", "sleep 30");

    let mut config = test_config(&temp_dir, free_port());
    config.dev_mode = false;
    let surface = RecordingSurface::default();
    let mut orchestrator =
        Orchestrator::with_locator(config, surface.clone(), fake_locator(None)).unwrap();

    let state = run_with_timeout(&mut orchestrator).await;

    assert_eq!(state, Terminated);
    assert_eq!(
        orchestrator.history(),
        &[Init, LocatingRuntime, NoRuntimeFound, Failed, Terminated]
    );
    assert!(matches!(
        orchestrator.failure(),
        Some(LaunchError::RuntimeNotFound)
    ));
    let records = surface.records();
    assert!(records.contains(&Record::RuntimeChoice));
    // The choice dialog is the only error surface for a missing runtime
    assert!(surface.errors().is_empty());
}

#[tokio::test]
#[serial]
async fn test_failed_install_is_surfaced() {
    let temp_dir = TempDir::new().unwrap();
    write_script(temp_dir.path(), "run-r.sh", "sleep 30");
    write_script(
        temp_dir.path(),
        "install-packages.sh",
        "echo \"using $R_PATH\"\necho 'package shiny is not available' >&2\nexit 1",
    );
    let fake_r = write_script(temp_dir.path(), "R", "echo 'MISSING: shiny'\nexit 1");

    let mut config = test_config(&temp_dir, free_port());
    config.dev_mode = false;
    config.required_packages = vec!["shiny".to_string()];
    let surface = RecordingSurface::default();
    let mut orchestrator =
        Orchestrator::with_locator(config, surface.clone(), fake_locator(Some(fake_r.clone())))
            .unwrap();

    let state = run_with_timeout(&mut orchestrator).await;

    assert_eq!(state, Terminated);
    assert_eq!(
        orchestrator.history(),
        &[Init, LocatingRuntime, Installing, Failed, Terminated]
    );
    assert!(!orchestrator.install_in_progress());

    let records = surface.records();
    assert!(records.contains(&Record::Install(InstallPhase::Started {
        installer: temp_dir.path().join("install-packages.sh"),
    })));
    assert!(records
        .iter()
        .any(|r| matches!(r, Record::Install(InstallPhase::Output { line, .. }) if line.contains(&*fake_r.to_string_lossy()))));
    assert!(records.contains(&Record::Install(InstallPhase::Finished { success: false })));

    let errors = surface.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("package shiny is not available"));
}

#[tokio::test]
#[serial]
async fn test_satisfied_packages_skip_install() {
    let temp_dir = TempDir::new().unwrap();
    write_script(temp_dir.path(), "run-r.sh", "echo \"$R_PATH\" > r-path.txt\nexit 0");
    let fake_r = write_script(temp_dir.path(), "R", "exit 0");

    let mut config = test_config(&temp_dir, free_port());
    config.dev_mode = false;
    config.required_packages = vec!["shiny".to_string()];
    let surface = RecordingSurface::default();
    let mut orchestrator =
        Orchestrator::with_locator(config, surface.clone(), fake_locator(Some(fake_r.clone())))
            .unwrap();

    run_with_timeout(&mut orchestrator).await;

    assert_eq!(
        orchestrator.history(),
        &[Init, LocatingRuntime, Starting, Polling, ShuttingDown, Terminated]
    );
    let passed = std::fs::read_to_string(temp_dir.path().join("r-path.txt")).unwrap();
    assert_eq!(passed.trim(), fake_r.to_string_lossy());
    assert!(!surface
        .records()
        .iter()
        .any(|r| matches!(r, Record::Install(_))));
}

#[tokio::test]
#[serial]
async fn test_installed_packages_continue_launch() {
    let temp_dir = TempDir::new().unwrap();
    let marker = temp_dir.path().join("r-path.txt");
    write_script(temp_dir.path(), "run-r.sh", "echo \"$R_PATH\" > r-path.txt\nexit 0");
    write_script(
        temp_dir.path(),
        "install-packages.sh",
        "echo \"installing shiny with $R_PATH\"\nexit 0",
    );
    let fake_r = write_script(temp_dir.path(), "R", "echo 'MISSING: shiny'\nexit 1");

    let mut config = test_config(&temp_dir, free_port());
    config.dev_mode = false;
    config.required_packages = vec!["shiny".to_string()];
    let surface = RecordingSurface::default();
    surface.watch_launch_marker(marker.clone());
    let mut orchestrator =
        Orchestrator::with_locator(config, surface.clone(), fake_locator(Some(fake_r.clone())))
            .unwrap();

    let state = run_with_timeout(&mut orchestrator).await;

    assert_eq!(state, Terminated);
    assert_eq!(
        &orchestrator.history()[..5],
        &[Init, LocatingRuntime, Installing, Starting, Polling]
    );
    assert!(orchestrator.failure().is_none());
    assert!(!orchestrator.install_in_progress());

    // The progress surface closed before the launch script ran
    let records = surface.records();
    let finished = records
        .iter()
        .position(|r| *r == Record::Install(InstallPhase::Finished { success: true }))
        .expect("install never finished");
    assert_eq!(
        records.get(finished + 1),
        Some(&Record::LaunchMarkerAtInstallEnd(false))
    );

    let passed = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(passed.trim(), fake_r.to_string_lossy());
    assert!(surface.errors().is_empty());
}

#[tokio::test]
#[serial]
async fn test_runtime_found_through_shell_keeps_its_path() {
    let temp_dir = TempDir::new().unwrap();
    let r_home = TempDir::new().unwrap();
    let r_bin = r_home.path().join("bin");
    std::fs::create_dir_all(&r_bin).unwrap();
    // R itself needs a tool that only the discovering shell's PATH has
    write_script(&r_bin, "sandboxml-r-helper", "exit 0");
    let fake_r = write_script(&r_bin, "R", "sandboxml-r-helper || exit 127\nexit 0");
    let search_path = format!("{}:/usr/bin:/bin", r_bin.display());
    assert!(!std::env::var("PATH")
        .unwrap_or_default()
        .split(':')
        .any(|dir| Path::new(dir) == r_bin));

    write_script(
        temp_dir.path(),
        "run-r.sh",
        "echo \"$R_PATH\" > r-path.txt\necho \"$PATH\" > path.txt\nexit 0",
    );

    let mut config = test_config(&temp_dir, free_port());
    config.dev_mode = false;
    config.required_packages = vec!["shiny".to_string()];
    let surface = RecordingSurface::default();
    let mut orchestrator = Orchestrator::with_locator(
        config,
        surface.clone(),
        shell_only_locator(&search_path),
    )
    .unwrap();

    let state = run_with_timeout(&mut orchestrator).await;

    assert_eq!(state, Terminated);
    // The package check ran with the shell's PATH, so nothing was installed
    assert_eq!(
        orchestrator.history(),
        &[Init, LocatingRuntime, Starting, Polling, ShuttingDown, Terminated]
    );
    assert!(orchestrator.failure().is_none());

    let r_path = std::fs::read_to_string(temp_dir.path().join("r-path.txt")).unwrap();
    assert_eq!(r_path.trim(), fake_r.to_string_lossy());
    let path = std::fs::read_to_string(temp_dir.path().join("path.txt")).unwrap();
    assert_eq!(path.trim(), search_path);
}

#[tokio::test]
#[serial]
async fn test_orphan_listener_reclaimed_after_window_close() {
    if !orphan_tools_available() {
        eprintln!("setsid, python3 or lsof/fuser not available, skipping");
        return;
    }

    let temp_dir = TempDir::new().unwrap();
    // The listener runs in its own session, out of reach of the group signal
    write_script(
        temp_dir.path(),
        "run-r.sh",
        "setsid python3 -m http.server \"$SANDBOXML_PORT\" --bind 127.0.0.1 >/dev/null 2>&1 &\n\
         exec sleep 30",
    );
    let port = free_port();

    let surface = RecordingSurface::default();
    let mut orchestrator =
        Orchestrator::new(test_config(&temp_dir, port), surface.clone()).unwrap();
    surface.close_window_when_presented(orchestrator.handle());

    let state = run_with_timeout(&mut orchestrator).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let still_listening = port_accepts_connections(port).await;
    if still_listening {
        let _ = PlatformOps::Posix.reclaim_port(port).await;
    }

    assert_eq!(state, Terminated);
    assert!(surface.presented());
    assert!(!still_listening, "orphan still listening on port {}", port);
}

#[tokio::test]
#[serial]
async fn test_orphan_listener_reclaimed_after_server_exit() {
    if !orphan_tools_available() {
        eprintln!("setsid, python3 or lsof/fuser not available, skipping");
        return;
    }

    let temp_dir = TempDir::new().unwrap();
    // The script exits cleanly and leaves its listener behind
    write_script(
        temp_dir.path(),
        "run-r.sh",
        "setsid python3 -m http.server \"$SANDBOXML_PORT\" --bind 127.0.0.1 >/dev/null 2>&1 &\n\
         sleep 2\n\
         exit 0",
    );
    let port = free_port();

    let surface = RecordingSurface::default();
    let mut orchestrator =
        Orchestrator::new(test_config(&temp_dir, port), surface.clone()).unwrap();

    let state = run_with_timeout(&mut orchestrator).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let still_listening = port_accepts_connections(port).await;
    if still_listening {
        let _ = PlatformOps::Posix.reclaim_port(port).await;
    }

    assert_eq!(state, Terminated);
    assert!(orchestrator.failure().is_none());
    assert!(orchestrator.history().contains(&ShuttingDown));
    assert!(!still_listening, "orphan still listening on port {}", port);
}
