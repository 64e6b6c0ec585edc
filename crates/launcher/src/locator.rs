//! Find an R installation on the host.
//!
//! Windowed apps started from Finder, the Start menu or a desktop launcher
//! inherit a minimal PATH, so looking up `R` on PATH alone is not enough.
//! The locator tries, in order, and stops at the first hit:
//!
//! 1. well-known absolute install paths for this OS
//! 2. `R --version` through each candidate shell and PATH, keeping the
//!    path the shell resolved and the PATH it ran with
//! 3. the package manager's install prefix (`brew --prefix`)
//!
//! All host access goes through [`HostProbe`] so the search order can be
//! tested without touching the machine.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;

use crate::platform::{PackageManagerQuery, PlatformOps, ShellProbe};

/// How R was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    FixedPath,
    ShellProbe,
    PackageManager,
}

impl std::fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryMethod::FixedPath => write!(f, "fixed path"),
            DiscoveryMethod::ShellProbe => write!(f, "shell probe"),
            DiscoveryMethod::PackageManager => write!(f, "package manager"),
        }
    }
}

/// Result of one search. Recomputed on every launch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RuntimeLocation {
    Found {
        /// Absolute path, or a bare command name when a shell found R but
        /// did not report where.
        invocation: PathBuf,
        method: DiscoveryMethod,
        /// PATH of the shell that found R. Everything that runs R later
        /// gets this PATH so helper tools resolve the same way.
        #[serde(skip_serializing_if = "Option::is_none")]
        search_path: Option<String>,
    },
    NotFound,
}

impl RuntimeLocation {
    pub fn is_found(&self) -> bool {
        matches!(self, RuntimeLocation::Found { .. })
    }

    pub fn invocation(&self) -> Option<&Path> {
        match self {
            RuntimeLocation::Found { invocation, .. } => Some(invocation),
            RuntimeLocation::NotFound => None,
        }
    }

    pub fn search_path(&self) -> Option<&str> {
        match self {
            RuntimeLocation::Found { search_path, .. } => search_path.as_deref(),
            RuntimeLocation::NotFound => None,
        }
    }
}

/// What a successful shell probe reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellMatch {
    /// Absolute path the shell resolved R to.
    pub resolved: Option<PathBuf>,
    /// PATH the shell ran with.
    pub search_path: Option<String>,
}

impl ShellMatch {
    /// Parse probe stdout: the resolved path first, the shell's PATH last.
    /// `fallback_path` is the PATH the probe was started with.
    pub fn parse(stdout: &str, fallback_path: Option<&str>) -> Self {
        let lines: Vec<&str> = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        let resolved = lines
            .first()
            .map(PathBuf::from)
            .filter(|path| path.is_absolute());
        let search_path = match lines.as_slice() {
            [_, .., last] => Some(last.to_string()),
            _ => fallback_path.map(str::to_string),
        };
        Self {
            resolved,
            search_path,
        }
    }
}

/// Read-only view of the host used by the locator.
pub trait HostProbe: Send + Sync {
    /// Whether `path` is an existing, runnable file.
    fn is_runtime_binary(&self, path: &Path) -> bool;

    /// Run a shell probe; `Some` when it exits successfully.
    fn probe_shell(
        &self,
        probe: &ShellProbe,
    ) -> impl Future<Output = Option<ShellMatch>> + Send;

    /// Install prefix reported by a package manager, if any.
    fn query_prefix(
        &self,
        query: &PackageManagerQuery,
    ) -> impl Future<Output = Option<PathBuf>> + Send;
}

/// The real machine.
#[derive(Debug, Clone)]
pub struct SystemHost {
    /// Per-probe timeout; a hung shell is killed when it expires.
    pub timeout: Duration,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl HostProbe for SystemHost {
    fn is_runtime_binary(&self, path: &Path) -> bool {
        let Ok(metadata) = std::fs::metadata(path) else {
            return false;
        };
        if !metadata.is_file() {
            return false;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode() & 0o111 != 0
        }
        #[cfg(not(unix))]
        {
            true
        }
    }

    fn probe_shell(
        &self,
        probe: &ShellProbe,
    ) -> impl Future<Output = Option<ShellMatch>> + Send {
        let mut command = probe.command();
        let fallback_path = probe.path_env.clone();
        let limit = self.timeout;
        async move {
            match tokio::time::timeout(limit, command.output()).await {
                Ok(Ok(output)) if output.status.success() => Some(ShellMatch::parse(
                    &String::from_utf8_lossy(&output.stdout),
                    fallback_path.as_deref(),
                )),
                Ok(Ok(_)) => None,
                Ok(Err(e)) => {
                    debug!("[locator] Shell could not run: {}", e);
                    None
                }
                Err(_) => {
                    debug!("[locator] Shell timed out after {:?}", limit);
                    None
                }
            }
        }
    }

    fn query_prefix(
        &self,
        query: &PackageManagerQuery,
    ) -> impl Future<Output = Option<PathBuf>> + Send {
        let mut command = tokio::process::Command::new(&query.program);
        command
            .args(&query.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let limit = self.timeout;
        async move {
            let output = tokio::time::timeout(limit, command.output())
                .await
                .ok()?
                .ok()?;
            if !output.status.success() {
                return None;
            }
            let prefix = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if prefix.is_empty() {
                None
            } else {
                Some(PathBuf::from(prefix))
            }
        }
    }
}

/// Searches for R using a fixed strategy order.
pub struct RuntimeLocator<H = SystemHost> {
    host: H,
    bare_command: PathBuf,
    fixed_paths: Vec<PathBuf>,
    shell_probes: Vec<ShellProbe>,
    package_manager: Option<PackageManagerQuery>,
}

impl RuntimeLocator<SystemHost> {
    /// Locator for the real host with the platform's candidate lists.
    pub fn for_platform(platform: PlatformOps, timeout: Duration) -> Self {
        RuntimeLocator::new(SystemHost { timeout }, platform)
    }
}

impl<H: HostProbe> RuntimeLocator<H> {
    pub fn new(host: H, platform: PlatformOps) -> Self {
        Self {
            host,
            bare_command: PathBuf::from(platform.runtime_command()),
            fixed_paths: platform.fixed_runtime_paths(),
            shell_probes: platform.shell_probes(),
            package_manager: platform.package_manager_query(),
        }
    }

    pub fn with_fixed_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.fixed_paths = paths;
        self
    }

    pub fn with_shell_probes(mut self, probes: Vec<ShellProbe>) -> Self {
        self.shell_probes = probes;
        self
    }

    pub fn with_package_manager(mut self, query: Option<PackageManagerQuery>) -> Self {
        self.package_manager = query;
        self
    }

    pub async fn locate(&self) -> RuntimeLocation {
        for path in &self.fixed_paths {
            if self.host.is_runtime_binary(path) {
                info!("[locator] Found R at {:?}", path);
                return RuntimeLocation::Found {
                    invocation: path.clone(),
                    method: DiscoveryMethod::FixedPath,
                    search_path: None,
                };
            }
        }
        debug!(
            "[locator] None of {} fixed paths exist, probing shells",
            self.fixed_paths.len()
        );

        for probe in &self.shell_probes {
            debug!("[locator] Trying {}", probe);
            if let Some(found) = self.host.probe_shell(probe).await {
                let invocation = found
                    .resolved
                    .unwrap_or_else(|| self.bare_command.clone());
                info!("[locator] Found R at {:?} through {}", invocation, probe);
                return RuntimeLocation::Found {
                    invocation,
                    method: DiscoveryMethod::ShellProbe,
                    search_path: found.search_path,
                };
            }
        }

        if let Some(query) = &self.package_manager {
            if let Some(prefix) = self.host.query_prefix(query).await {
                let candidate = prefix.join(&query.binary);
                if self.host.is_runtime_binary(&candidate) {
                    info!("[locator] Found R via {} at {:?}", query.program, candidate);
                    return RuntimeLocation::Found {
                        invocation: candidate,
                        method: DiscoveryMethod::PackageManager,
                        search_path: None,
                    };
                }
                debug!("[locator] {} prefix {:?} has no R", query.program, prefix);
            }
        }

        info!("[locator] R not found");
        RuntimeLocation::NotFound
    }
}
