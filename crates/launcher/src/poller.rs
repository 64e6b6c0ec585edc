//! Wait for the server to answer HTTP requests.
//!
//! Any HTTP response counts as ready, including error statuses: Shiny is
//! listening once it answers at all. Connection failures are expected while
//! R boots and are only logged at debug level.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::task::JoinHandle;

pub struct ReadinessPoller {
    client: reqwest::Client,
    interval: Duration,
}

impl ReadinessPoller {
    pub fn new(interval: Duration, probe_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(probe_timeout)
            .build()?;
        Ok(Self { client, interval })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe `url` until it answers, then call `on_ready` once.
    ///
    /// Polling never gives up on its own; cancel it through the returned handle.
    pub fn start(
        &self,
        url: impl Into<String>,
        on_ready: impl FnOnce() + Send + 'static,
    ) -> ReadinessPoll {
        let url = url.into();
        let attempts = Arc::new(AtomicU32::new(0));
        let client = self.client.clone();
        let interval = self.interval;

        let task = tokio::spawn({
            let url = url.clone();
            let attempts = attempts.clone();
            async move {
                loop {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    match client.get(&url).send().await {
                        Ok(response) => {
                            info!(
                                "[poller] {} answered with {} after {} attempt(s)",
                                url,
                                response.status(),
                                attempt
                            );
                            on_ready();
                            return;
                        }
                        Err(e) => {
                            debug!("[poller] Attempt {} against {} failed: {}", attempt, url, e);
                        }
                    }
                    tokio::time::sleep(interval).await;
                }
            }
        });

        ReadinessPoll {
            url,
            attempts,
            task,
        }
    }
}

/// A running poll. Dropping it cancels the poll.
pub struct ReadinessPoll {
    url: String,
    attempts: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl ReadinessPoll {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Probes made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(&self) {
        if !self.task.is_finished() {
            debug!("[poller] Cancelling poll of {}", self.url);
            self.task.abort();
        }
    }
}

impl Drop for ReadinessPoll {
    fn drop(&mut self) {
        self.task.abort();
    }
}
