//! Reporter: periodically drains buffered events and POSTs them to the
//! backend in JSON, with exponential backoff retries.

use crate::config::Config;
use crate::logger::LogEvent;
use anyhow::Result;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct Payload<'a> {
    sensor: &'a str,
    events: &'a [LogEvent],
}

pub struct Reporter {
    cfg: Config,
    buffer: Arc<RwLock<Vec<LogEvent>>>,
    client: Client,
    shutdown: broadcast::Receiver<()>,
}

impl Reporter {
    pub fn new(
        cfg: Config,
        buffer: Arc<RwLock<Vec<LogEvent>>>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let client = Client::new();
        Self {
            cfg,
            buffer,
            client,
            shutdown,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => { info!("reporter shutdown"); return Ok(()); }
                _ = tokio::time::sleep(std::time::Duration::from_secs(self.cfg.report_interval_seconds)) => {}
            }

            let url = match &self.cfg.backend_url {
                Some(u) => u.clone(),
                // Without a backend the buffer just keeps accumulating for
                // whoever inspects it; nothing to deliver.
                None => continue,
            };

            let mut events = Vec::new();
            {
                let mut w = self.buffer.write().await;
                if w.is_empty() {
                    continue;
                }
                events.append(&mut *w);
            }

            let payload = Payload {
                sensor: &self.cfg.sensor_id,
                events: &events,
            };
            if self.send_with_retry(&url, &payload).await {
                debug!(count = events.len(), "report delivered");
            } else {
                warn!("failed to deliver events after retries; returning them to the buffer");
                let mut w = self.buffer.write().await;
                events.append(&mut *w);
                *w = events;
            }
        }
    }

    async fn send_with_retry(&self, url: &str, payload: &Payload<'_>) -> bool {
        let mut backoff = 1u64;
        let max_retries = 5;
        for _attempt in 0..=max_retries {
            let mut req = self.client.post(url).json(payload);
            if let Some(token) = &self.cfg.backend_token {
                req = req.bearer_auth(token);
            }
            match req.send().await {
                Ok(r) if r.status().is_success() => return true,
                Ok(r) => warn!(status = ?r.status(), "report failed status"),
                Err(e) => warn!(error = ?e, "report POST error"),
            }
            tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
            backoff = std::cmp::min(backoff * 2, 60);
        }
        false
    }

    /// Sends one batch immediately (used by tests and the shutdown flush).
    /// With no backend configured this is a successful no-op.
    pub async fn send_once(&self, events: Vec<LogEvent>) -> bool {
        let Some(url) = &self.cfg.backend_url else {
            return true;
        };
        if events.is_empty() {
            return true;
        }
        let payload = Payload {
            sensor: &self.cfg.sensor_id,
            events: &events,
        };
        self.send_with_retry(url, &payload).await
    }
}
