//! Spawn, watch and stop the R server.
//!
//! The supervisor owns at most one server process and at most one
//! readiness poll. `stop()` is safe to call from every shutdown path, any
//! number of times; once a server has been launched it always ends by
//! killing whatever still listens on the server port, because R can leave
//! a listening child behind after its parent shell exits.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::config::LauncherConfig;
use crate::error::LaunchError;
use crate::platform::PlatformOps;
use crate::poller::ReadinessPoll;

/// How the server process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// Terminating signal on POSIX.
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// A launched server. Kept as a record after it is released.
#[derive(Debug)]
pub struct SupervisedProcess {
    pub pid: Option<u32>,
    pub working_dir: PathBuf,
    pub script_path: PathBuf,
    /// Set once the exit was observed.
    pub exit: Option<ExitReport>,
    alive: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

impl SupervisedProcess {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

pub struct ProcessSupervisor {
    platform: PlatformOps,
    port: u16,
    stop_grace: Duration,
    log_file: String,
    excerpt_chars: usize,
    process: Option<SupervisedProcess>,
    readiness: Option<ReadinessPoll>,
    /// Set once a server was launched; cleared after the port was reclaimed.
    reclaim_pending: bool,
    log_path: Option<PathBuf>,
    /// The last server handle given up by `record_exit` or `stop`.
    released: Option<SupervisedProcess>,
}

impl ProcessSupervisor {
    pub fn new(config: &LauncherConfig, platform: PlatformOps) -> Self {
        Self {
            platform,
            port: config.port,
            stop_grace: config.stop_grace,
            log_file: config.log_file.clone(),
            excerpt_chars: config.log_excerpt_chars,
            process: None,
            readiness: None,
            reclaim_pending: false,
            log_path: None,
            released: None,
        }
    }

    pub fn process(&self) -> Option<&SupervisedProcess> {
        self.process.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.is_alive())
    }

    pub fn released(&self) -> Option<&SupervisedProcess> {
        self.released.as_ref()
    }

    pub fn last_exit(&self) -> Option<ExitReport> {
        self.released.as_ref().and_then(|p| p.exit)
    }

    /// Spawn the launch script. `on_exit` runs once when the process exits.
    pub async fn start(
        &mut self,
        script: &Path,
        working_dir: &Path,
        env: &[(String, String)],
        on_exit: impl FnOnce(ExitReport) + Send + 'static,
    ) -> Result<(), LaunchError> {
        if self.process.is_some() {
            warn!("[supervisor] Server already running, stopping it first");
            self.stop().await;
        }

        if !script.is_file() {
            error!("[supervisor] Launch script not found at {:?}", script);
            return Err(LaunchError::ScriptNotFound(script.to_path_buf()));
        }

        let _ = self.platform.ensure_executable(script);

        let mut cmd = self.platform.shell_command(script);
        cmd.current_dir(working_dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::SpawnFailed(e.to_string()))?;

        let pid = child.id();
        info!("[supervisor] Started {:?} (pid {:?})", script, pid);
        self.reclaim_pending = true;
        self.log_path = Some(working_dir.join(&self.log_file));
        self.released = None;

        let alive = Arc::new(AtomicBool::new(true));
        let watcher = tokio::spawn({
            let alive = alive.clone();
            async move {
                let report = match child.wait().await {
                    Ok(status) => ExitReport::from(status),
                    Err(e) => {
                        warn!("[supervisor] Failed to wait for server: {}", e);
                        ExitReport::default()
                    }
                };
                alive.store(false, Ordering::SeqCst);
                info!("[supervisor] Server exited ({})", report);
                on_exit(report);
            }
        });

        self.process = Some(SupervisedProcess {
            pid,
            working_dir: working_dir.to_path_buf(),
            script_path: script.to_path_buf(),
            exit: None,
            alive,
            watcher,
        });
        Ok(())
    }

    /// Remember how the server exited and release the process handle.
    pub fn record_exit(&mut self, report: &ExitReport) {
        if let Some(process) = self.process.take() {
            debug!("[supervisor] Released pid {:?} ({})", process.pid, report);
            self.released = Some(process);
        }
        if let Some(process) = self.released.as_mut() {
            process.exit = Some(*report);
        }
    }

    /// Turn an abnormal exit into the error shown to the user.
    pub fn diagnose_exit(&self, report: &ExitReport) -> Option<LaunchError> {
        if report.success() {
            return None;
        }
        if let Some(code) = report.code {
            if code == self.platform.command_not_found_code() {
                return Some(LaunchError::CommandNotFound { code });
            }
        }
        let detail = self
            .log_path
            .as_deref()
            .and_then(|path| read_log_excerpt(path, self.excerpt_chars))
            .map(|excerpt| format!("Server log:\n{}", excerpt))
            .unwrap_or_else(|| {
                format!(
                    "Check the log at {} for details.",
                    self.log_path
                        .as_deref()
                        .unwrap_or(Path::new(&self.log_file))
                        .display()
                )
            });
        Some(LaunchError::ServerCrashed {
            status: report.to_string(),
            detail,
        })
    }

    /// Track the readiness poll so `stop()` can cancel it. Replaces any previous poll.
    pub fn track_poll(&mut self, poll: ReadinessPoll) {
        if let Some(previous) = self.readiness.replace(poll) {
            previous.cancel();
        }
    }

    pub fn clear_poll(&mut self) {
        if let Some(poll) = self.readiness.take() {
            poll.cancel();
        }
    }

    pub fn poll_attempts(&self) -> Option<u32> {
        self.readiness.as_ref().map(|p| p.attempts())
    }

    /// Stop the server and free its port. Idempotent.
    pub async fn stop(&mut self) {
        self.clear_poll();

        let process = self.process.take();
        if process.is_none() && !self.reclaim_pending {
            debug!("[supervisor] Nothing to stop");
            return;
        }

        if let Some(mut process) = process {
            if let (true, Some(pid)) = (process.is_alive(), process.pid) {
                info!("[supervisor] Stopping server (pid {})", pid);
                let _ = self.platform.terminate_tree(pid).await;
                match tokio::time::timeout(self.stop_grace, &mut process.watcher).await {
                    Ok(_) => debug!("[supervisor] Server exited after terminate"),
                    Err(_) => {
                        warn!(
                            "[supervisor] Server did not exit within {:?}, killing it",
                            self.stop_grace
                        );
                        let _ = self.platform.force_kill_tree(pid).await;
                        process.watcher.abort();
                    }
                }
            }
            self.released = Some(process);
        }

        let _ = self.platform.reclaim_port(self.port).await;
        self.reclaim_pending = false;
        info!("[supervisor] Stopped, port {} reclaimed", self.port);
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            process.watcher.abort();
            if let (true, Some(pid)) = (process.is_alive(), process.pid) {
                let _ = self.platform.kill_tree_now(pid);
            }
        }
    }
}

/// First `max_chars` characters of the server log, if it exists and is non-empty.
pub fn read_log_excerpt(path: &Path, max_chars: usize) -> Option<String> {
    use std::io::Read;

    let file = std::fs::File::open(path).ok()?;
    // A UTF-8 char is at most 4 bytes
    let mut bytes = Vec::new();
    file.take((max_chars as u64).saturating_mul(4))
        .read_to_end(&mut bytes)
        .ok()?;
    let text = String::from_utf8_lossy(&bytes);
    let excerpt: String = text.chars().take(max_chars).collect();
    let excerpt = excerpt.trim_end();
    if excerpt.trim().is_empty() {
        None
    } else {
        Some(excerpt.to_string())
    }
}
