//! Local HTML shown before the server is ready.
//!
//! Strings are embedded as JSON literals and inserted with `textContent`,
//! so messages from logs never become markup.

const STYLE: &str = r#"
body { font-family: -apple-system, "Segoe UI", sans-serif; margin: 0; padding: 32px;
       background: #f7f7f8; color: #1f2328; }
h1 { font-size: 20px; margin: 0 0 16px; }
pre { background: #fff; border: 1px solid #d0d7de; border-radius: 6px; padding: 12px;
      white-space: pre-wrap; max-height: 560px; overflow: auto; font-size: 12px; }
button { font-size: 14px; padding: 6px 16px; margin-right: 8px; }
"#;

fn page(body: &str, script: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><style>{}</style></head>\
         <body>{}<script>{}</script></body></html>",
        STYLE, body, script
    )
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        // Keep `</script>` in a message from closing the script element
        .replace('<', "\\u003c")
}

pub fn splash() -> String {
    page("<h1>Starting SandboxML…</h1>", "")
}

/// Error dialog; the button posts `dismiss`.
pub fn error(title: &str, message: &str) -> String {
    page(
        "<h1 id=\"title\"></h1><pre id=\"message\"></pre>\
         <button onclick=\"window.ipc.postMessage('dismiss')\">OK</button>",
        &format!(
            "document.getElementById('title').textContent = {};\
             document.getElementById('message').textContent = {};",
            js_string(title),
            js_string(message)
        ),
    )
}

/// Missing-runtime choice; buttons post `download` or `quit`.
pub fn missing_runtime(download_url: &str) -> String {
    page(
        "<h1>R Not Found</h1>\
         <p>SandboxML needs R, which is not installed on this computer.</p>\
         <p>Download it from <span id=\"url\"></span>, install it and start SandboxML again.</p>\
         <button onclick=\"window.ipc.postMessage('download')\">Download R</button>\
         <button onclick=\"window.ipc.postMessage('quit')\">Quit</button>",
        &format!(
            "document.getElementById('url').textContent = {};",
            js_string(download_url)
        ),
    )
}

/// Message the install page posts once `appendLine` exists.
pub const INSTALL_PAGE_READY: &str = "install-ready";

/// Installer progress; lines are appended with `appendLine(text)`.
pub fn install_progress() -> String {
    page(
        "<h1>Installing required R packages…</h1>\
         <p>This only happens once and can take several minutes.</p>\
         <pre id=\"log\"></pre>",
        &format!(
            "function appendLine(line) {{\
               const log = document.getElementById('log');\
               log.textContent += line + '\\n';\
               log.scrollTop = log.scrollHeight;\
             }}\
             window.ipc.postMessage('{}');",
            INSTALL_PAGE_READY
        ),
    )
}

/// Installer output held back until the progress page can take it.
///
/// `load_html` returns before the page runs its script, so lines that
/// arrive in between are queued and flushed on [`INSTALL_PAGE_READY`].
#[derive(Debug, Default)]
pub struct InstallLog {
    ready: bool,
    pending: Vec<String>,
}

impl InstallLog {
    /// A fresh progress page is loading.
    pub fn reset(&mut self) {
        self.ready = false;
        self.pending.clear();
    }

    /// Returns the script to run now, or `None` if the line was queued.
    pub fn push(&mut self, line: String) -> Option<String> {
        if self.ready {
            Some(append_line_script(&line))
        } else {
            self.pending.push(line);
            None
        }
    }

    /// The page loaded; returns the queued lines as one script.
    pub fn mark_ready(&mut self) -> Option<String> {
        self.ready = true;
        if self.pending.is_empty() {
            return None;
        }
        let script = self
            .pending
            .drain(..)
            .map(|line| append_line_script(&line))
            .collect::<Vec<_>>()
            .join(";");
        Some(script)
    }
}

pub fn append_line_script(line: &str) -> String {
    format!("appendLine({})", js_string(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_page_escapes_message() {
        let html = error("Failed", "</script><b>boom</b>\n\"quoted\"");
        assert!(!html.contains("</script><b>"));
        assert!(html.contains(r#"\"quoted\""#));
        assert!(html.contains("'dismiss'"));
    }

    #[test]
    fn test_append_line_script() {
        assert_eq!(append_line_script("a 'b'"), r#"appendLine("a 'b'")"#);
    }

    #[test]
    fn test_install_page_announces_itself() {
        let html = install_progress();
        assert!(html.contains("function appendLine"));
        assert!(html.contains("postMessage('install-ready')"));
    }

    #[test]
    fn test_install_log_queues_until_page_ready() {
        let mut log = InstallLog::default();
        assert_eq!(log.push("first".to_string()), None);
        assert_eq!(log.push("second".to_string()), None);

        assert_eq!(
            log.mark_ready().as_deref(),
            Some(r#"appendLine("first");appendLine("second")"#)
        );
        assert_eq!(
            log.push("third".to_string()).as_deref(),
            Some(r#"appendLine("third")"#)
        );
        assert_eq!(log.mark_ready(), None);
    }

    #[test]
    fn test_install_log_reset_drops_stale_lines() {
        let mut log = InstallLog::default();
        log.mark_ready();
        log.reset();
        assert_eq!(log.push("again".to_string()), None);
        assert_eq!(
            log.mark_ready().as_deref(),
            Some(r#"appendLine("again")"#)
        );
    }

    #[test]
    fn test_missing_runtime_buttons() {
        let html = missing_runtime("https://cran.r-project.org/bin/macosx/");
        assert!(html.contains("'download'"));
        assert!(html.contains("'quit'"));
    }
}
