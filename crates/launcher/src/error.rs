//! Launch failures and best-effort outcomes.
//!
//! Anything that stops a launch attempt from making progress is a
//! [`LaunchError`] and goes to the user through the surface. Cleanup steps
//! that are allowed to fail (permission fixes, port reclamation) return a
//! [`BestEffort`] instead, which is logged and never propagated.

use std::fmt;
use std::path::PathBuf;

use log::{debug, warn};

/// Coarse classification of a launch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// R could not be found (or disappeared before spawn).
    Discovery,
    /// Package installation failed.
    Install,
    /// The server process could not be started.
    Spawn,
    /// The server process started and then exited with an error.
    RuntimeCrash,
}

/// Errors that end a launch attempt.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("R is not installed on this computer")]
    RuntimeNotFound,

    #[error("R was found at {0} but is no longer available")]
    RuntimeVanished(PathBuf),

    #[error("Package installer not found at {0}")]
    InstallerMissing(PathBuf),

    #[error("Failed to install required R packages:\n\n{0}")]
    InstallFailed(String),

    #[error("Launch script not found at {0}")]
    ScriptNotFound(PathBuf),

    #[error("Failed to start the R server: {0}")]
    SpawnFailed(String),

    #[error(
        "The R server could not find the R executable (exit code {code}). \
         Make sure R is installed and available on your PATH, then restart SandboxML."
    )]
    CommandNotFound { code: i32 },

    #[error("The R server stopped unexpectedly ({status}).\n\n{detail}")]
    ServerCrashed { status: String, detail: String },
}

impl LaunchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LaunchError::RuntimeNotFound | LaunchError::RuntimeVanished(_) => {
                FailureKind::Discovery
            }
            LaunchError::InstallerMissing(_) | LaunchError::InstallFailed(_) => {
                FailureKind::Install
            }
            LaunchError::ScriptNotFound(_) | LaunchError::SpawnFailed(_) => FailureKind::Spawn,
            LaunchError::CommandNotFound { .. } | LaunchError::ServerCrashed { .. } => {
                FailureKind::RuntimeCrash
            }
        }
    }

    /// Short dialog title for the failure.
    pub fn title(&self) -> &'static str {
        match self.kind() {
            FailureKind::Discovery => "R Not Found",
            FailureKind::Install => "Package Installation Failed",
            FailureKind::Spawn => "Failed to Start SandboxML",
            FailureKind::RuntimeCrash => "SandboxML Server Error",
        }
    }
}

/// Outcome of an operation whose failure must not abort the caller.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort {
    Completed,
    Tolerated {
        operation: &'static str,
        reason: String,
    },
}

impl BestEffort {
    /// Run `op`, converting its error into a logged [`BestEffort::Tolerated`].
    pub fn attempt<E: fmt::Display>(
        operation: &'static str,
        op: impl FnOnce() -> Result<(), E>,
    ) -> Self {
        match op() {
            Ok(()) => {
                debug!("[best-effort] {} completed", operation);
                BestEffort::Completed
            }
            Err(e) => BestEffort::tolerate(operation, e),
        }
    }

    /// Record a tolerated failure, logging it at warn level.
    pub fn tolerate(operation: &'static str, reason: impl fmt::Display) -> Self {
        let reason = reason.to_string();
        warn!("[best-effort] {} failed (continuing): {}", operation, reason);
        BestEffort::Tolerated { operation, reason }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, BestEffort::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kinds() {
        assert_eq!(LaunchError::RuntimeNotFound.kind(), FailureKind::Discovery);
        assert_eq!(
            LaunchError::InstallFailed("boom".into()).kind(),
            FailureKind::Install
        );
        assert_eq!(
            LaunchError::ScriptNotFound(PathBuf::from("run-r.sh")).kind(),
            FailureKind::Spawn
        );
        assert_eq!(
            LaunchError::CommandNotFound { code: 127 }.kind(),
            FailureKind::RuntimeCrash
        );
    }

    #[test]
    fn test_command_not_found_message_mentions_path() {
        let message = LaunchError::CommandNotFound { code: 127 }.to_string();
        assert!(message.contains("PATH"));
        assert!(message.contains("127"));
    }

    #[test]
    fn test_best_effort_attempt() {
        let ok = BestEffort::attempt("noop", || Ok::<(), String>(()));
        assert!(ok.is_completed());

        let failed = BestEffort::attempt("chmod", || Err("permission denied"));
        assert_eq!(
            failed,
            BestEffort::Tolerated {
                operation: "chmod",
                reason: "permission denied".to_string(),
            }
        );
    }
}
