//! Launcher for the SandboxML desktop app.
//!
//! SandboxML is an R/Shiny server wrapped in a native window. This crate
//! does everything around the window: find R, install missing packages,
//! start `run-r.sh` / `run-r.bat`, wait for the server to answer on
//! `http://localhost:3000`, and tear the whole process tree down again on
//! every exit path.
//!
//! The window itself is abstracted behind [`surface::Surface`]; the
//! `sandboxml` shell crate implements it with a webview, and
//! [`surface::ConsoleSurface`] implements it headless for the CLI.

pub mod config;
pub mod error;
pub mod installer;
pub mod lifecycle;
pub mod locator;
pub mod packages;
pub mod platform;
pub mod poller;
pub mod signals;
pub mod supervisor;
pub mod surface;

use std::path::PathBuf;

pub use config::LauncherConfig;
pub use error::{BestEffort, FailureKind, LaunchError};
pub use lifecycle::{LifecycleEvent, LifecycleHandle, LifecycleState, Orchestrator};
pub use locator::{DiscoveryMethod, RuntimeLocation, RuntimeLocator};
pub use platform::PlatformOps;
pub use surface::{RuntimeChoice, Surface};

/// Environment variable that switches the launcher into development mode.
pub const DEV_MODE_ENV_VAR: &str = "SANDBOXML_DEV";

/// Environment variable overriding the resource directory.
pub const RESOURCE_DIR_ENV_VAR: &str = "SANDBOXML_RESOURCE_DIR";

/// Development mode skips R discovery and runs from the source checkout.
pub fn is_dev_mode() -> bool {
    std::env::var(DEV_MODE_ENV_VAR).is_ok_and(|v| v == "1")
}

/// Directory holding the launch script, installer and R sources.
///
/// Resolution order:
/// 1. `SANDBOXML_RESOURCE_DIR` if set
/// 2. the current directory in development mode
/// 3. the packaged location next to the executable
///    (`Contents/Resources` on macOS, `resources/` elsewhere)
/// 4. the executable's directory
pub fn default_resource_dir(dev_mode: bool) -> PathBuf {
    if let Some(dir) = std::env::var_os(RESOURCE_DIR_ENV_VAR) {
        return PathBuf::from(dir);
    }

    if dev_mode {
        if let Ok(cwd) = std::env::current_dir() {
            return cwd;
        }
    }

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()));
    let Some(exe_dir) = exe_dir else {
        return PathBuf::from(".");
    };

    let packaged = if cfg!(target_os = "macos") {
        exe_dir.join("..").join("Resources")
    } else {
        exe_dir.join("resources")
    };
    if packaged.is_dir() {
        packaged
    } else {
        exe_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_dev_mode_flag() {
        std::env::remove_var(DEV_MODE_ENV_VAR);
        assert!(!is_dev_mode());
        std::env::set_var(DEV_MODE_ENV_VAR, "1");
        assert!(is_dev_mode());
        std::env::set_var(DEV_MODE_ENV_VAR, "true");
        assert!(!is_dev_mode());
        std::env::remove_var(DEV_MODE_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_resource_dir_override() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::env::set_var(RESOURCE_DIR_ENV_VAR, tmp.path());
        assert_eq!(default_resource_dir(false), tmp.path());
        std::env::remove_var(RESOURCE_DIR_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_dev_mode_uses_cwd() {
        std::env::remove_var(RESOURCE_DIR_ENV_VAR);
        assert_eq!(
            default_resource_dir(true),
            std::env::current_dir().unwrap()
        );
    }
}
