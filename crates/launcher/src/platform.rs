//! Platform operations for POSIX and Windows hosts.
//!
//! Every OS-conditional decision the launcher makes lives here: script and
//! installer names, where R is usually installed, how to probe shells, how
//! to tear down a process tree and how to find whoever is holding the
//! server port. A single [`PlatformOps`] value is selected at startup and
//! passed to the components that need it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use log::{debug, info};
use tokio::process::Command;

use crate::error::BestEffort;

/// Upper bound for helper tools (`lsof`, `taskkill`, `netstat`, ...).
const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Shells tried, in order, when looking for R through a shell.
const POSIX_SHELLS: &[&str] = &["/bin/zsh", "/bin/bash", "/bin/sh"];

/// PATH values tried in addition to the inherited one.
const FALLBACK_PATHS: &[&str] = &[
    "/opt/homebrew/bin:/usr/local/bin:/usr/bin:/bin",
    "/usr/local/bin:/usr/bin:/bin:/opt/local/bin",
];

const MACOS_R_PATHS: &[&str] = &[
    "/Library/Frameworks/R.framework/Resources/bin/R",
    "/opt/homebrew/bin/R",
    "/usr/local/bin/R",
    "/opt/local/bin/R",
];

const LINUX_R_PATHS: &[&str] = &[
    "/usr/bin/R",
    "/usr/local/bin/R",
    "/usr/lib/R/bin/R",
    "/usr/lib64/R/bin/R",
];

/// Conda distributions that commonly ship their own R.
const CONDA_DIRS: &[&str] = &["miniforge3", "miniconda3", "anaconda3"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformOps {
    Posix,
    Windows,
}

/// A shell invocation used to look for R.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellProbe {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// PATH override; `None` inherits the launcher's environment.
    pub path_env: Option<String>,
}

impl ShellProbe {
    /// Build the probe command. On success stdout carries the resolved
    /// runtime path and the shell's PATH, see [`PlatformOps::shell_probe_script`].
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(path) = &self.path_env {
            cmd.env("PATH", path);
        }
        cmd
    }
}

impl fmt::Display for ShellProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program.display(), self.args.join(" "))?;
        match &self.path_env {
            Some(path) => write!(f, " (PATH={})", path),
            None => write!(f, " (inherited PATH)"),
        }
    }
}

/// Ask a package manager for its install prefix, then look for R under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManagerQuery {
    pub program: String,
    pub args: Vec<String>,
    /// Path of the R binary relative to the reported prefix.
    pub binary: PathBuf,
}

impl PlatformOps {
    pub fn current() -> Self {
        if cfg!(windows) {
            PlatformOps::Windows
        } else {
            PlatformOps::Posix
        }
    }

    pub fn launch_script_name(self) -> &'static str {
        match self {
            PlatformOps::Posix => "run-r.sh",
            PlatformOps::Windows => "run-r.bat",
        }
    }

    pub fn installer_name(self) -> &'static str {
        match self {
            PlatformOps::Posix => "install-packages.sh",
            PlatformOps::Windows => "install-packages.bat",
        }
    }

    /// Bare command name used when R is found through a shell.
    pub fn runtime_command(self) -> &'static str {
        "R"
    }

    /// Exit code the platform shell uses for "command not found".
    pub fn command_not_found_code(self) -> i32 {
        match self {
            PlatformOps::Posix => 127,
            PlatformOps::Windows => 9009,
        }
    }

    pub fn download_url(self) -> &'static str {
        match self {
            PlatformOps::Windows => "https://cran.r-project.org/bin/windows/base/",
            PlatformOps::Posix if cfg!(target_os = "macos") => {
                "https://cran.r-project.org/bin/macosx/"
            }
            PlatformOps::Posix => "https://cran.r-project.org/bin/linux/",
        }
    }

    /// Run `script` through the platform shell.
    pub fn shell_command(self, script: &Path) -> Command {
        match self {
            PlatformOps::Posix => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(shell_quote(script));
                cmd
            }
            PlatformOps::Windows => {
                let mut cmd = Command::new("cmd");
                cmd.arg("/C").arg(script);
                cmd
            }
        }
    }

    /// Set the executable bit on a bundled script. Packaging tools sometimes drop it.
    pub fn ensure_executable(self, path: &Path) -> BestEffort {
        match self {
            PlatformOps::Posix => {
                BestEffort::attempt("mark script executable", || make_executable(path))
            }
            PlatformOps::Windows => BestEffort::Completed,
        }
    }

    /// Ask the server process (and everything it started) to exit.
    pub async fn terminate_tree(self, pid: u32) -> BestEffort {
        match self {
            PlatformOps::Posix => {
                BestEffort::attempt("signal server process group", || {
                    signal_process_group(pid)
                })
            }
            PlatformOps::Windows => {
                let pid = pid.to_string();
                match run_tool("taskkill", &["/PID", &pid, "/T", "/F"]).await {
                    Ok(output) if output.status.success() => BestEffort::Completed,
                    Ok(output) => BestEffort::tolerate(
                        "taskkill server process tree",
                        String::from_utf8_lossy(&output.stderr).trim(),
                    ),
                    Err(e) => BestEffort::tolerate("taskkill server process tree", e),
                }
            }
        }
    }

    /// Kill the server's process tree outright after the grace period expired.
    pub async fn force_kill_tree(self, pid: u32) -> BestEffort {
        match self {
            PlatformOps::Posix => {
                BestEffort::attempt("kill server process group", || kill_process_group(pid))
            }
            PlatformOps::Windows => match self.kill_process(pid).await {
                Ok(()) => BestEffort::Completed,
                Err(e) => BestEffort::tolerate("kill server process tree", e),
            },
        }
    }

    /// Kill a process tree without awaiting. Usable from `Drop`.
    pub fn kill_tree_now(self, pid: u32) -> BestEffort {
        match self {
            PlatformOps::Posix => {
                BestEffort::attempt("kill process group", || kill_process_group(pid))
            }
            PlatformOps::Windows => {
                let pid = pid.to_string();
                let status = std::process::Command::new("taskkill")
                    .args(["/PID", &pid, "/T", "/F"])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
                match status {
                    Ok(status) if status.success() => BestEffort::Completed,
                    Ok(status) => BestEffort::tolerate("taskkill process tree", status),
                    Err(e) => BestEffort::tolerate("taskkill process tree", e),
                }
            }
        }
    }

    /// Kill every process listening on `port`, except the launcher itself.
    pub async fn reclaim_port(self, port: u16) -> BestEffort {
        let pids = match self.listeners_on_port(port).await {
            Ok(pids) => pids,
            Err(e) => return BestEffort::tolerate("reclaim server port", e),
        };

        let own_pid = std::process::id();
        let mut failures = Vec::new();
        for pid in pids.into_iter().filter(|pid| *pid != own_pid) {
            info!("[platform] Killing pid {} still listening on port {}", pid, port);
            if let Err(e) = self.kill_process(pid).await {
                failures.push(format!("pid {}: {}", pid, e));
            }
        }

        if failures.is_empty() {
            BestEffort::Completed
        } else {
            BestEffort::tolerate("reclaim server port", failures.join("; "))
        }
    }

    /// PIDs of processes listening on a local TCP port.
    pub async fn listeners_on_port(self, port: u16) -> Result<Vec<u32>, String> {
        match self {
            PlatformOps::Posix => {
                let target = format!("-iTCP:{}", port);
                match run_tool("lsof", &["-nP", "-t", &target, "-sTCP:LISTEN"]).await {
                    // lsof exits 1 when nothing matches
                    Ok(output) => Ok(parse_pid_list(&String::from_utf8_lossy(&output.stdout))),
                    Err(lsof_err) => {
                        debug!("[platform] {}, falling back to fuser", lsof_err);
                        let port_arg = port.to_string();
                        let output = run_tool("fuser", &["-n", "tcp", &port_arg]).await?;
                        Ok(parse_pid_list(&String::from_utf8_lossy(&output.stdout)))
                    }
                }
            }
            PlatformOps::Windows => {
                let output = run_tool("netstat", &["-ano", "-p", "TCP"]).await?;
                Ok(parse_netstat_listeners(
                    &String::from_utf8_lossy(&output.stdout),
                    port,
                ))
            }
        }
    }

    async fn kill_process(self, pid: u32) -> Result<(), String> {
        match self {
            PlatformOps::Posix => force_kill(pid),
            PlatformOps::Windows => {
                let pid = pid.to_string();
                let output = run_tool("taskkill", &["/PID", &pid, "/T", "/F"]).await?;
                if output.status.success() {
                    Ok(())
                } else {
                    Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
                }
            }
        }
    }

    /// Open a URL in the user's default browser.
    pub fn open_url(self, url: &str) -> BestEffort {
        let mut cmd = match self {
            PlatformOps::Windows => {
                let mut cmd = std::process::Command::new("cmd");
                cmd.args(["/C", "start", ""]).arg(url);
                cmd
            }
            PlatformOps::Posix if cfg!(target_os = "macos") => {
                let mut cmd = std::process::Command::new("open");
                cmd.arg(url);
                cmd
            }
            PlatformOps::Posix => {
                let mut cmd = std::process::Command::new("xdg-open");
                cmd.arg(url);
                cmd
            }
        };
        BestEffort::attempt("open url", || cmd.spawn().map(|_| ()))
    }

    /// Well-known absolute install locations of R, most likely first.
    pub fn fixed_runtime_paths(self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        match self {
            PlatformOps::Posix => {
                let known = if cfg!(target_os = "macos") {
                    MACOS_R_PATHS
                } else {
                    LINUX_R_PATHS
                };
                paths.extend(known.iter().map(PathBuf::from));
                // rig and the Posit binaries install versioned trees under /opt/R
                paths.extend(versioned_installs(Path::new("/opt/R"), &["bin", "R"]));
                if let Some(home) = dirs::home_dir() {
                    for conda in CONDA_DIRS {
                        paths.push(home.join(conda).join("bin").join("R"));
                    }
                }
            }
            PlatformOps::Windows => {
                for var in ["ProgramFiles", "ProgramW6432", "ProgramFiles(x86)"] {
                    let Some(root) = std::env::var_os(var) else {
                        continue;
                    };
                    let root = PathBuf::from(root).join("R");
                    paths.extend(versioned_installs(&root, &["bin", "R.exe"]));
                    paths.extend(versioned_installs(&root, &["bin", "x64", "R.exe"]));
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        paths.retain(|p| seen.insert(p.clone()));
        paths
    }

    /// Script run by every shell probe.
    ///
    /// Succeeds only if R runs, then prints the absolute path the shell
    /// resolved and the shell's PATH on separate lines. Later steps reuse
    /// both because the launcher's own PATH usually cannot find R.
    pub fn shell_probe_script(self) -> String {
        let runtime = self.runtime_command();
        match self {
            PlatformOps::Posix => format!(
                "{0} --version >/dev/null 2>&1 && command -v {0} && printf '%s\\n' \"$PATH\"",
                runtime
            ),
            PlatformOps::Windows => format!(
                "{0} --version >nul 2>&1 && where {0} && echo %PATH%",
                runtime
            ),
        }
    }

    /// Shell × PATH combinations that might resolve a bare `R`.
    pub fn shell_probes(self) -> Vec<ShellProbe> {
        let command = self.shell_probe_script();
        match self {
            PlatformOps::Posix => {
                let mut probes = Vec::new();
                for shell in POSIX_SHELLS {
                    // Login shell picks up PATH changes made in profile files
                    probes.push(ShellProbe {
                        program: PathBuf::from(shell),
                        args: vec!["-l".to_string(), "-c".to_string(), command.clone()],
                        path_env: None,
                    });
                    for path in FALLBACK_PATHS {
                        probes.push(ShellProbe {
                            program: PathBuf::from(shell),
                            args: vec!["-c".to_string(), command.clone()],
                            path_env: Some(path.to_string()),
                        });
                    }
                }
                probes
            }
            PlatformOps::Windows => vec![ShellProbe {
                program: PathBuf::from("cmd"),
                args: vec!["/C".to_string(), command],
                path_env: None,
            }],
        }
    }

    pub fn package_manager_query(self) -> Option<PackageManagerQuery> {
        match self {
            PlatformOps::Posix => Some(PackageManagerQuery {
                program: "brew".to_string(),
                args: vec!["--prefix".to_string()],
                binary: PathBuf::from("bin").join("R"),
            }),
            PlatformOps::Windows => None,
        }
    }
}

/// Subdirectories of `root`, highest version first, each joined with `tail`.
fn versioned_installs(root: &Path, tail: &[&str]) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut dirs: Vec<(Vec<u64>, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (version_key(&name), path)
        })
        .collect();
    dirs.sort_by(|a, b| b.cmp(a));
    dirs.into_iter()
        .map(|(_, dir)| dir)
        .map(|dir| tail.iter().fold(dir, |acc, part| acc.join(part)))
        .collect()
}

/// Numeric components of a directory name: `R-4.10.0` is `[4, 10, 0]`.
fn version_key(name: &str) -> Vec<u64> {
    name.split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Quote a path for `/bin/sh -c`.
pub fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

/// Parse whitespace-separated PIDs (`lsof -t`, `fuser`), keeping first occurrences.
pub fn parse_pid_list(output: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for pid in output.split_whitespace().filter_map(|t| t.parse::<u32>().ok()) {
        if pid != 0 && !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}

/// Extract listening PIDs for `port` from `netstat -ano` output.
pub fn parse_netstat_listeners(output: &str, port: u16) -> Vec<u32> {
    let port = port.to_string();
    let mut pids = Vec::new();
    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("TCP") {
            continue;
        }
        if !cols[3].eq_ignore_ascii_case("LISTENING") {
            continue;
        }
        if cols[1].rsplit(':').next() != Some(port.as_str()) {
            continue;
        }
        if let Ok(pid) = cols[4].parse::<u32>() {
            if pid != 0 && !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

async fn run_tool(program: &str, args: &[&str]) -> Result<Output, String> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match tokio::time::timeout(TOOL_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("failed to run {}: {}", program, e)),
        Err(_) => Err(format!("{} timed out after {:?}", program, TOOL_TIMEOUT)),
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_process_group(pid: u32) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid as i32);
    match killpg(pid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        // Not a group leader after all; signal the process itself
        Err(Errno::EPERM) => match kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.to_string()),
        },
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(not(unix))]
fn signal_process_group(_pid: u32) -> Result<(), String> {
    Err("process groups are not supported on this platform".to_string())
}

/// SIGKILL the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(Errno::EPERM) => force_kill(pid),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> Result<(), String> {
    Err("process groups are not supported on this platform".to_string())
}

#[cfg(unix)]
fn force_kill(pid: u32) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(not(unix))]
fn force_kill(_pid: u32) -> Result<(), String> {
    Err("signals are not supported on this platform".to_string())
}
