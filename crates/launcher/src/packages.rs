//! Check which required R packages are missing.
//!
//! The located R is asked directly: a small expression compares the
//! required list against `installed.packages()` and prints
//! `MISSING: pkg1, pkg2` before exiting with status 1.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::process::Command;

const MISSING_PREFIX: &str = "MISSING:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "packages", rename_all = "snake_case")]
pub enum PackageStatus {
    Satisfied,
    Missing(Vec<String>),
}

impl PackageStatus {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PackageStatus::Satisfied)
    }
}

#[derive(Debug, Clone)]
pub struct PackageCheck {
    pub packages: Vec<String>,
    pub timeout: Duration,
}

impl PackageCheck {
    pub fn new(packages: Vec<String>, timeout: Duration) -> Self {
        Self { packages, timeout }
    }

    /// R expression that reports missing packages.
    pub fn expression(&self) -> String {
        let quoted: Vec<String> = self
            .packages
            .iter()
            .map(|p| format!("'{}'", p.replace('\'', "")))
            .collect();
        format!(
            "required <- c({}); \
             missing <- setdiff(required, rownames(installed.packages())); \
             if (length(missing) > 0) {{ \
               cat('{} ', paste(missing, collapse = ', '), '\\n', sep = ''); \
               quit(status = 1) \
             }}",
            quoted.join(", "),
            MISSING_PREFIX
        )
    }

    /// Run the check with the given R invocation.
    ///
    /// `search_path` replaces PATH for R, as for the shell that found it.
    /// A check that cannot run, times out or produces no `MISSING:` line
    /// reports every required package as missing.
    pub async fn check(&self, runtime: &Path, search_path: Option<&str>) -> PackageStatus {
        if self.packages.is_empty() {
            return PackageStatus::Satisfied;
        }

        let mut cmd = Command::new(runtime);
        cmd.args(["--vanilla", "--slave", "-e"])
            .arg(self.expression())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = search_path {
            cmd.env("PATH", path);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("[packages] Failed to run {:?}: {}", runtime, e);
                return self.all_missing();
            }
            Err(_) => {
                warn!("[packages] Package check timed out after {:?}", self.timeout);
                return self.all_missing();
            }
        };

        if output.status.success() {
            info!("[packages] All {} required packages installed", self.packages.len());
            return PackageStatus::Satisfied;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_missing(&stdout) {
            Some(missing) if !missing.is_empty() => {
                info!("[packages] Missing: {}", missing.join(", "));
                PackageStatus::Missing(missing)
            }
            _ => {
                debug!(
                    "[packages] Unrecognised check output ({}): {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                self.all_missing()
            }
        }
    }

    fn all_missing(&self) -> PackageStatus {
        PackageStatus::Missing(self.packages.clone())
    }
}

/// Parse the `MISSING: a, b` line from the check's stdout.
pub fn parse_missing(stdout: &str) -> Option<Vec<String>> {
    let line = stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix(MISSING_PREFIX))?;
    Some(
        line.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect(),
    )
}
