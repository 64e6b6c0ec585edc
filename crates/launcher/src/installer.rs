//! Run the bundled package installer.
//!
//! The installer script lives next to the launch script and receives the
//! detected R invocation in `R_PATH`. Output is streamed line by line to an
//! [`InstallProgress`] handler so the UI can show it while it runs.
//!
//! The installer runs in its own process group. Whatever it leaves behind
//! (the R session doing `install.packages`, a stray background job) is
//! killed with the group when the install is cancelled or when output
//! pipes are still held open after the installer exits.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::config::RUNTIME_ENV_VAR;
use crate::platform::PlatformOps;

/// How long output is still read after the installer exits.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Success,
    /// The installer script is not in the resource directory. Nothing ran.
    InstallerMissing(PathBuf),
    Failure(String),
}

impl InstallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InstallOutcome::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Installer progress events. Serializable for transport to a webview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum InstallPhase {
    Started { installer: PathBuf },
    Output { stream: OutputStream, line: String },
    Finished { success: bool },
}

/// Receives installer progress.
pub trait InstallProgress: Send + Sync {
    fn on_install(&self, phase: InstallPhase);
}

/// Log-only progress handler.
pub struct LogProgress;

impl InstallProgress for LogProgress {
    fn on_install(&self, phase: InstallPhase) {
        match phase {
            InstallPhase::Started { installer } => {
                info!("[installer] Running {:?}", installer);
            }
            InstallPhase::Output { stream, line } => match stream {
                OutputStream::Stdout => info!("[installer] {}", line),
                OutputStream::Stderr => warn!("[installer] {}", line),
            },
            InstallPhase::Finished { success } => {
                info!("[installer] Finished (success: {})", success);
            }
        }
    }
}

/// Everything observed during one installer run.
#[derive(Debug, Clone, Default)]
pub struct InstallSession {
    pub installer: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl InstallSession {
    /// Failure message preference: stderr, then stdout, then a generic one.
    pub fn outcome(&self) -> InstallOutcome {
        if self.exit_code == Some(0) {
            return InstallOutcome::Success;
        }
        let message = if !self.stderr.trim().is_empty() {
            self.stderr.trim().to_string()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("Installer exited with code {}", code),
                None => "Installer was terminated before it finished".to_string(),
            }
        };
        InstallOutcome::Failure(message)
    }
}

/// Clears the in-progress flag and closes the progress surface on every exit path.
///
/// While `process_group` is set the installer's group may still have
/// members, and dropping the guard kills it.
struct InstallGuard<'a> {
    progress: &'a dyn InstallProgress,
    in_progress: &'a AtomicBool,
    platform: PlatformOps,
    process_group: Option<u32>,
    success: bool,
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        if let Some(pid) = self.process_group.take() {
            debug!("[installer] Killing installer process group {}", pid);
            let _ = self.platform.kill_tree_now(pid);
        }
        self.in_progress.store(false, Ordering::SeqCst);
        self.progress.on_install(InstallPhase::Finished {
            success: self.success,
        });
    }
}

#[derive(Debug, Clone)]
pub struct InstallerBridge {
    pub installer: PathBuf,
    pub working_dir: PathBuf,
    pub platform: PlatformOps,
}

impl InstallerBridge {
    pub fn new(installer: PathBuf, working_dir: PathBuf, platform: PlatformOps) -> Self {
        Self {
            installer,
            working_dir,
            platform,
        }
    }

    /// Run the installer to completion.
    ///
    /// `search_path` becomes the installer's PATH when set. Dropping the
    /// returned future kills the installer and everything it started.
    pub async fn install(
        &self,
        runtime: &Path,
        search_path: Option<&str>,
        progress: &dyn InstallProgress,
        in_progress: &AtomicBool,
    ) -> InstallOutcome {
        if !self.installer.is_file() {
            error!("[installer] Installer not found at {:?}", self.installer);
            return InstallOutcome::InstallerMissing(self.installer.clone());
        }

        in_progress.store(true, Ordering::SeqCst);
        progress.on_install(InstallPhase::Started {
            installer: self.installer.clone(),
        });
        let mut guard = InstallGuard {
            progress,
            in_progress,
            platform: self.platform,
            process_group: None,
            success: false,
        };

        let _ = self.platform.ensure_executable(&self.installer);

        let mut session = InstallSession {
            installer: self.installer.clone(),
            env: vec![(
                RUNTIME_ENV_VAR.to_string(),
                runtime.to_string_lossy().to_string(),
            )],
            ..Default::default()
        };
        if let Some(path) = search_path {
            session.env.push(("PATH".to_string(), path.to_string()));
        }

        let mut cmd = self.platform.shell_command(&self.installer);
        cmd.current_dir(&self.working_dir)
            .envs(session.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("[installer] Failed to spawn installer: {}", e);
                return InstallOutcome::Failure(format!("Failed to run the package installer: {}", e));
            }
        };
        guard.process_group = child.id();

        let stdout_text = Mutex::new(String::new());
        let stderr_text = Mutex::new(String::new());
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let drain = async {
            tokio::join!(
                stream_lines(stdout, OutputStream::Stdout, progress, &stdout_text),
                stream_lines(stderr, OutputStream::Stderr, progress, &stderr_text),
            );
        };
        tokio::pin!(drain);

        let mut drained = false;
        let status = tokio::select! {
            status = child.wait() => status,
            _ = &mut drain => {
                drained = true;
                child.wait().await
            }
        };
        if !drained {
            drained = tokio::time::timeout(DRAIN_GRACE, &mut drain).await.is_ok();
            if !drained {
                warn!(
                    "[installer] Output still open {:?} after the installer exited",
                    DRAIN_GRACE
                );
            }
        }

        match status {
            Ok(status) => {
                session.exit_code = status.code();
                if drained {
                    // Nothing is left holding the pipes
                    guard.process_group = None;
                }
            }
            Err(e) => {
                error!("[installer] Failed to wait for installer: {}", e);
            }
        }
        session.stdout = take_text(&stdout_text);
        session.stderr = take_text(&stderr_text);

        let outcome = session.outcome();
        guard.success = outcome.is_success();
        match &outcome {
            InstallOutcome::Success => info!("[installer] Packages installed"),
            InstallOutcome::InstallerMissing(path) => {
                error!("[installer] Installer not found at {:?}", path)
            }
            InstallOutcome::Failure(message) => error!("[installer] Failed: {}", message),
        }
        outcome
    }
}

/// Forward each line to `progress` and append it to `collected`.
async fn stream_lines<R: AsyncRead + Unpin>(
    reader: Option<R>,
    stream: OutputStream,
    progress: &dyn InstallProgress,
    collected: &Mutex<String>,
) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Ok(mut text) = collected.lock() {
                    text.push_str(&line);
                    text.push('\n');
                }
                progress.on_install(InstallPhase::Output { stream, line });
            }
            Ok(None) => break,
            Err(e) => {
                warn!("[installer] Error reading installer output: {}", e);
                break;
            }
        }
    }
}

fn take_text(text: &Mutex<String>) -> String {
    text.lock()
        .map(|mut text| std::mem::take(&mut *text))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_prefers_stderr() {
        let session = InstallSession {
            stdout: "partial output".to_string(),
            stderr: "package 'caret' is not available\n".to_string(),
            exit_code: Some(1),
            ..Default::default()
        };
        assert_eq!(
            session.outcome(),
            InstallOutcome::Failure("package 'caret' is not available".to_string())
        );
    }

    #[test]
    fn test_outcome_falls_back_to_stdout_then_generic() {
        let session = InstallSession {
            stdout: "no mirror\n".to_string(),
            exit_code: Some(2),
            ..Default::default()
        };
        assert_eq!(session.outcome(), InstallOutcome::Failure("no mirror".to_string()));

        let session = InstallSession {
            exit_code: Some(2),
            ..Default::default()
        };
        assert_eq!(
            session.outcome(),
            InstallOutcome::Failure("Installer exited with code 2".to_string())
        );
    }

    #[test]
    fn test_outcome_success_ignores_output() {
        let session = InstallSession {
            stderr: "Warning: something".to_string(),
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(session.outcome(), InstallOutcome::Success);
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_value(InstallPhase::Output {
            stream: OutputStream::Stderr,
            line: "x".to_string(),
        })
        .unwrap();
        assert_eq!(json["phase"], "output");
        assert_eq!(json["stream"], "stderr");
    }
}
