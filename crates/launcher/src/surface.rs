//! The user-facing side of the launcher.
//!
//! A [`Surface`] presents the app once the server is ready, shows errors,
//! asks what to do when R is missing and displays installer progress. The
//! orchestrator never talks to a window directly.

use std::future::Future;

use log::{error, info, warn};

use crate::error::LaunchError;
use crate::installer::{InstallPhase, InstallProgress, LogProgress};
use crate::platform::PlatformOps;

/// Answer to the "R is not installed" dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeChoice {
    Download,
    Quit,
}

pub trait Surface: InstallProgress {
    /// Show the app pointed at `url`. Called only after the server answered,
    /// and again when the app is re-activated.
    fn present(&self, url: &str);

    /// Show a blocking error dialog; resolves when dismissed.
    fn show_error(&self, error: &LaunchError) -> impl Future<Output = ()> + Send;

    /// Offer to download R or quit.
    fn choose_missing_runtime(
        &self,
        download_url: &str,
    ) -> impl Future<Output = RuntimeChoice> + Send;

    /// The session has terminated; close everything.
    fn quit(&self);
}

/// Headless surface: logs instead of drawing, optionally opens the browser.
#[derive(Debug, Clone)]
pub struct ConsoleSurface {
    pub platform: PlatformOps,
    /// Open the server URL in the default browser once ready.
    pub open_browser: bool,
    /// Answer given when R is missing.
    pub missing_runtime_choice: RuntimeChoice,
}

impl ConsoleSurface {
    pub fn new(platform: PlatformOps, open_browser: bool) -> Self {
        Self {
            platform,
            open_browser,
            missing_runtime_choice: RuntimeChoice::Quit,
        }
    }
}

impl InstallProgress for ConsoleSurface {
    fn on_install(&self, phase: InstallPhase) {
        LogProgress.on_install(phase);
    }
}

impl Surface for ConsoleSurface {
    fn present(&self, url: &str) {
        info!("[surface] SandboxML is ready at {}", url);
        if self.open_browser {
            let _ = self.platform.open_url(url);
        }
    }

    fn show_error(&self, error: &LaunchError) -> impl Future<Output = ()> + Send {
        error!("[surface] {}: {}", error.title(), error);
        std::future::ready(())
    }

    fn choose_missing_runtime(
        &self,
        download_url: &str,
    ) -> impl Future<Output = RuntimeChoice> + Send {
        warn!(
            "[surface] R is not installed. Download it from {}",
            download_url
        );
        std::future::ready(self.missing_runtime_choice)
    }

    fn quit(&self) {
        info!("[surface] Session ended");
    }
}
