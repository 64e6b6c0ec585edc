//! SandboxML desktop app.
//!
//! Creates a hidden window, hands the launch to the orchestrator on a
//! background thread and shows the window once the R server answers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use launcher::config::LauncherConfig;
use launcher::lifecycle::Orchestrator;
use launcher::signals::forward_signals;
use log::{error, info};
use muda::{
    accelerator::{Accelerator, Code, Modifiers},
    Menu, MenuItem, PredefinedMenuItem, Submenu,
};
use tao::{
    dpi::Size,
    event_loop::{EventLoop, EventLoopBuilder},
    window::WindowBuilder,
};

mod pages;
mod window;

use window::{ReplySlot, ShellEvent, WindowSurface, MENU_CLOSE_ID, MENU_QUIT_ID};

#[derive(Parser, Debug)]
#[command(name = "sandboxml")]
#[command(about = "SandboxML desktop app")]
struct Cli {
    /// Run from a source checkout: skip R discovery and package checks
    #[arg(long)]
    dev: bool,

    /// Directory containing run-r.sh / run-r.bat and the installer
    #[arg(long)]
    resource_dir: Option<PathBuf>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();
    info!("Starting SandboxML");

    let mut config = LauncherConfig::from_env();
    if cli.dev {
        config.dev_mode = true;
    }
    if let Some(dir) = cli.resource_dir {
        config.resource_dir = dir;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let event_loop: EventLoop<ShellEvent> = EventLoopBuilder::with_user_event().build();

    let window = WindowBuilder::new()
        .with_title("SandboxML")
        .with_inner_size(Size::Logical((1200.0, 900.0).into()))
        .with_visible(false)
        .build(&event_loop)
        .map_err(|e| anyhow::anyhow!("Failed to create window: {}", e))?;

    let menu_bar = Menu::new();
    let app_menu = Submenu::new("SandboxML", true);
    let quit_item = MenuItem::with_id(
        MENU_QUIT_ID,
        "Quit SandboxML",
        true,
        Some(Accelerator::new(Some(Modifiers::SUPER), Code::KeyQ)),
    );
    app_menu.append(&PredefinedMenuItem::about(None, None)).ok();
    app_menu.append(&PredefinedMenuItem::separator()).ok();
    app_menu.append(&quit_item).ok();
    menu_bar.append(&app_menu).ok();

    let window_menu = Submenu::new("Window", true);
    let close_item = MenuItem::with_id(
        MENU_CLOSE_ID,
        "Close Window",
        true,
        Some(Accelerator::new(Some(Modifiers::SUPER), Code::KeyW)),
    );
    window_menu.append(&PredefinedMenuItem::minimize(None)).ok();
    window_menu.append(&close_item).ok();
    menu_bar.append(&window_menu).ok();

    #[cfg(target_os = "macos")]
    menu_bar.init_for_nsapp();
    #[cfg(target_os = "windows")]
    {
        use tao::platform::windows::WindowExtWindows;
        menu_bar.init_for_hwnd(window.hwnd() as _).ok();
    }
    // Linux: Menu bar initialization skipped - requires GTK integration

    let reply: ReplySlot = Arc::new(Mutex::new(None));
    let webview = window::build_webview(&window, reply.clone(), event_loop.create_proxy())
        .map_err(|e| anyhow::anyhow!("Failed to create webview: {}", e))?;

    let surface = WindowSurface::new(event_loop.create_proxy(), reply);
    let mut orchestrator = Orchestrator::new(config, surface)?;
    let handle = orchestrator.handle();

    let signal_handle = handle.clone();
    std::thread::Builder::new()
        .name("sandboxml-launcher".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to start async runtime: {}", e);
                    std::process::exit(1);
                }
            };
            rt.block_on(async move {
                let signals = forward_signals(signal_handle);
                let state = orchestrator.run().await;
                signals.abort();
                info!("Launcher finished in state {}", state);
            });
        })
        .context("Failed to start launcher thread")?;

    window::run(event_loop, window, webview, handle)
}
