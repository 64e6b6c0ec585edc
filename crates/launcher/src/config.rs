//! Launcher configuration.
//!
//! Defaults match the packaged app; environment variables and CLI flags
//! override them.

use std::path::PathBuf;
use std::time::Duration;

use crate::platform::PlatformOps;

/// R packages the SandboxML server needs.
pub const REQUIRED_PACKAGES: &[&str] = &[
    "shiny",
    "cluster",
    "factoextra",
    "dplyr",
    "shinyFiles",
    "ggplot2",
    "fs",
    "DT",
    "markdown",
    "naniar",
    "missRanger",
    "readr",
    "gridExtra",
    "rlang",
    "randomForest",
    "caret",
    "pROC",
    "shinyjs",
];

/// Environment variable carrying the detected R invocation to child processes.
pub const RUNTIME_ENV_VAR: &str = "R_PATH";

/// Environment variable carrying the expected server port to the launch script.
pub const PORT_ENV_VAR: &str = "SANDBOXML_PORT";

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Directory holding the launch script, installer and R app.
    /// Also the working directory of the server.
    pub resource_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Delay between readiness probes.
    pub poll_interval: Duration,
    /// Timeout of a single readiness probe.
    pub probe_timeout: Duration,
    /// Timeout of each shell / package-manager probe while locating R.
    pub locate_timeout: Duration,
    /// Timeout of the installed-packages check.
    pub package_check_timeout: Duration,
    /// How long stop waits for the server to exit before force-killing it.
    pub stop_grace: Duration,
    /// Server log file, relative to the working directory.
    pub log_file: String,
    /// Number of characters of the server log quoted in crash reports.
    pub log_excerpt_chars: usize,
    pub required_packages: Vec<String>,
    /// Skip R discovery and package checks (running from a source checkout).
    pub dev_mode: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            resource_dir: PathBuf::from("."),
            host: "localhost".to_string(),
            port: 3000,
            poll_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(2),
            locate_timeout: Duration::from_secs(5),
            package_check_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(3),
            log_file: "sandboxml.log".to_string(),
            log_excerpt_chars: 500,
            required_packages: REQUIRED_PACKAGES.iter().map(|p| p.to_string()).collect(),
            dev_mode: false,
        }
    }
}

impl LauncherConfig {
    /// Defaults plus `SANDBOXML_*` environment overrides.
    pub fn from_env() -> Self {
        let dev_mode = crate::is_dev_mode();
        let port = std::env::var(PORT_ENV_VAR)
            .ok()
            .and_then(|raw| raw.trim().parse::<u16>().ok())
            .unwrap_or(3000);
        Self {
            resource_dir: crate::default_resource_dir(dev_mode),
            port,
            dev_mode,
            ..Default::default()
        }
    }

    /// Readiness endpoint of the server.
    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn script_path(&self, platform: PlatformOps) -> PathBuf {
        self.resource_dir.join(platform.launch_script_name())
    }

    pub fn installer_path(&self, platform: PlatformOps) -> PathBuf {
        self.resource_dir.join(platform.installer_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LauncherConfig::default();
        assert_eq!(config.server_url(), "http://localhost:3000");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.log_excerpt_chars, 500);
        assert!(config.required_packages.iter().any(|p| p == "shiny"));
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_resource_paths() {
        let config = LauncherConfig {
            resource_dir: PathBuf::from("/app/resources"),
            ..Default::default()
        };
        assert_eq!(
            config.script_path(PlatformOps::Posix),
            PathBuf::from("/app/resources/run-r.sh")
        );
        assert_eq!(
            config.installer_path(PlatformOps::Windows),
            PathBuf::from("/app/resources/install-packages.bat")
        );
    }
}
