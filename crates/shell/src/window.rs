//! The native window and its bridge to the orchestrator.
//!
//! The orchestrator runs on its own thread and talks to the window through
//! [`WindowSurface`], which turns every surface call into a [`ShellEvent`]
//! on the tao event loop. Dialog answers come back from the webview over
//! IPC and resolve the pending reply.

use std::future::Future;
use std::sync::{Arc, Mutex};

use launcher::error::LaunchError;
use launcher::installer::{InstallPhase, InstallProgress};
use launcher::lifecycle::{LifecycleEvent, LifecycleHandle};
use launcher::surface::{RuntimeChoice, Surface};
use log::{debug, error, info, warn};
use muda::MenuEvent;
use tao::{
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopProxy},
    window::Window,
};
use tokio::sync::oneshot;
use wry::{http::Request, WebView, WebViewBuilder};

use crate::pages;

pub const MENU_QUIT_ID: &str = "quit";
pub const MENU_CLOSE_ID: &str = "close";

#[derive(Debug, Clone)]
pub enum ShellEvent {
    Present { url: String },
    ShowError { title: String, message: String },
    AskRuntime { download_url: String },
    Install(InstallPhase),
    InstallPageReady,
    Quit,
}

/// Answer to the dialog currently on screen.
pub type ReplySlot = Arc<Mutex<Option<oneshot::Sender<String>>>>;

pub struct WindowSurface {
    proxy: Mutex<EventLoopProxy<ShellEvent>>,
    reply: ReplySlot,
}

impl WindowSurface {
    pub fn new(proxy: EventLoopProxy<ShellEvent>, reply: ReplySlot) -> Self {
        Self {
            proxy: Mutex::new(proxy),
            reply,
        }
    }

    fn send(&self, event: ShellEvent) -> bool {
        let Ok(proxy) = self.proxy.lock() else {
            return false;
        };
        match proxy.send_event(event) {
            Ok(()) => true,
            Err(e) => {
                warn!("[window] Event loop closed: {:?}", e);
                false
            }
        }
    }

    /// Show a dialog and wait for the webview's answer.
    ///
    /// Resolves to `None` when the window goes away before answering.
    fn ask(&self, event: ShellEvent) -> impl Future<Output = Option<String>> + Send {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slot) = self.reply.lock() {
            *slot = Some(tx);
        }
        if !self.send(event) {
            // Drop the sender so the receiver resolves immediately
            if let Ok(mut slot) = self.reply.lock() {
                slot.take();
            }
        }
        async move { rx.await.ok() }
    }
}

impl InstallProgress for WindowSurface {
    fn on_install(&self, phase: InstallPhase) {
        self.send(ShellEvent::Install(phase));
    }
}

impl Surface for WindowSurface {
    fn present(&self, url: &str) {
        self.send(ShellEvent::Present {
            url: url.to_string(),
        });
    }

    fn show_error(&self, error: &LaunchError) -> impl Future<Output = ()> + Send {
        let reply = self.ask(ShellEvent::ShowError {
            title: error.title().to_string(),
            message: error.to_string(),
        });
        async move {
            reply.await;
        }
    }

    fn choose_missing_runtime(
        &self,
        download_url: &str,
    ) -> impl Future<Output = RuntimeChoice> + Send {
        let reply = self.ask(ShellEvent::AskRuntime {
            download_url: download_url.to_string(),
        });
        async move {
            match reply.await.as_deref() {
                Some("download") => RuntimeChoice::Download,
                _ => RuntimeChoice::Quit,
            }
        }
    }

    fn quit(&self) {
        self.send(ShellEvent::Quit);
    }
}

pub fn build_webview(
    window: &Window,
    reply: ReplySlot,
    proxy: EventLoopProxy<ShellEvent>,
) -> wry::Result<WebView> {
    WebViewBuilder::new()
        .with_html(pages::splash())
        .with_ipc_handler(move |request: Request<String>| {
            let answer = request.body().clone();
            debug!("[window] IPC message: {}", answer);
            if answer == pages::INSTALL_PAGE_READY {
                let _ = proxy.send_event(ShellEvent::InstallPageReady);
                return;
            }
            let pending = reply.lock().ok().and_then(|mut slot| slot.take());
            match pending {
                Some(tx) => {
                    let _ = tx.send(answer);
                }
                None => debug!("[window] No dialog waiting for an answer"),
            }
        })
        .build(window)
}

/// Run the event loop on the main thread. Never returns.
///
/// Window close, menu quit and dock re-activation are forwarded to the
/// orchestrator; the loop only exits when the orchestrator says so.
pub fn run(
    event_loop: EventLoop<ShellEvent>,
    window: Window,
    webview: WebView,
    handle: LifecycleHandle,
) -> ! {
    let mut presented = false;
    let mut install_log = pages::InstallLog::default();

    event_loop.run(move |event, _, control_flow| {
        *control_flow = ControlFlow::Wait;

        if let Ok(menu_event) = MenuEvent::receiver().try_recv() {
            match menu_event.id().0.as_str() {
                MENU_QUIT_ID => {
                    handle.send(LifecycleEvent::QuitRequested);
                }
                MENU_CLOSE_ID => {
                    window.set_visible(false);
                    handle.send(LifecycleEvent::WindowClosed);
                }
                _ => {}
            }
        }

        match event {
            Event::WindowEvent {
                event: WindowEvent::CloseRequested,
                ..
            } => {
                info!("[window] Close requested");
                window.set_visible(false);
                handle.send(LifecycleEvent::WindowClosed);
            }
            Event::Reopen { .. } => {
                handle.send(LifecycleEvent::Activate);
            }
            Event::UserEvent(shell_event) => match shell_event {
                ShellEvent::Present { url } => {
                    if !presented {
                        info!("[window] Loading {}", url);
                        if let Err(e) = webview.load_url(&url) {
                            error!("[window] Failed to load {}: {:?}", url, e);
                        }
                        presented = true;
                    }
                    window.set_visible(true);
                    window.set_focus();
                }
                ShellEvent::ShowError { title, message } => {
                    window.set_title(&format!("SandboxML - {}", title));
                    show_page(&webview, &pages::error(&title, &message));
                    window.set_visible(true);
                    window.set_focus();
                }
                ShellEvent::AskRuntime { download_url } => {
                    show_page(&webview, &pages::missing_runtime(&download_url));
                    window.set_visible(true);
                    window.set_focus();
                }
                ShellEvent::Install(phase) => match phase {
                    InstallPhase::Started { .. } => {
                        window.set_title("SandboxML - Installing R packages");
                        install_log.reset();
                        show_page(&webview, &pages::install_progress());
                        window.set_visible(true);
                    }
                    InstallPhase::Output { line, .. } => {
                        if let Some(script) = install_log.push(line) {
                            run_script(&webview, &script);
                        }
                    }
                    InstallPhase::Finished { .. } => {
                        // The app window appears only once the server is ready
                        window.set_title("SandboxML");
                        if !presented {
                            window.set_visible(false);
                            show_page(&webview, &pages::splash());
                        }
                    }
                },
                ShellEvent::InstallPageReady => {
                    if let Some(script) = install_log.mark_ready() {
                        run_script(&webview, &script);
                    }
                }
                ShellEvent::Quit => {
                    info!("[window] Session ended, exiting");
                    *control_flow = ControlFlow::Exit;
                }
            },
            _ => {}
        }
    })
}

fn run_script(webview: &WebView, script: &str) {
    webview
        .evaluate_script(script)
        .unwrap_or_else(|e| error!("Failed to evaluate script: {:?}", e));
}

fn show_page(webview: &WebView, html: &str) {
    if let Err(e) = webview.load_html(html) {
        error!("[window] Failed to load page: {:?}", e);
    }
}
