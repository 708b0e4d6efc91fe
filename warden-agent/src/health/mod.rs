//! Periodic liveness check against the companion reasoning backend.
//!
//! Only the latest [`HealthStatus`] is kept. Agents read it through a
//! `watch` receiver, so a slow or failing probe never holds a lock that a
//! mutation cycle needs.

pub mod backend;

pub use backend::{Backend, HttpBackend};

use crate::config::HealthConfig;
use crate::utils::ProbeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub backend_reachable: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct HealthProbe {
    backend: Option<Arc<dyn Backend>>,
    interval: Duration,
    status: watch::Sender<HealthStatus>,
}

impl HealthProbe {
    pub fn new(backend: Option<Arc<dyn Backend>>, interval: Duration) -> Self {
        let (status, _) = watch::channel(HealthStatus::default());
        Self {
            backend,
            interval,
            status,
        }
    }

    pub fn from_config(config: &HealthConfig) -> Result<Self, reqwest::Error> {
        let backend = match &config.endpoint {
            Some(url) => {
                let http = HttpBackend::new(url.clone(), Duration::from_millis(config.timeout_ms))?;
                Some(Arc::new(http) as Arc<dyn Backend>)
            }
            None => None,
        };
        Ok(Self::new(backend, Duration::from_secs(config.interval_secs.max(1))))
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.status.subscribe()
    }

    pub fn current(&self) -> HealthStatus {
        self.status.borrow().clone()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.backend.as_ref().map(|b| b.describe())
    }

    /// Run one check and publish the result
    pub async fn probe_once(&self) -> HealthStatus {
        let started = Instant::now();
        let result = match &self.backend {
            Some(backend) => backend.check().await,
            None => Err(ProbeError::NotConfigured),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = match result {
            Ok(()) => HealthStatus {
                backend_reachable: true,
                last_checked_at: Some(Utc::now()),
                latency_ms: Some(latency_ms),
                last_error: None,
            },
            Err(e) => HealthStatus {
                backend_reachable: false,
                last_checked_at: Some(Utc::now()),
                latency_ms: None,
                last_error: Some(e.to_string()),
            },
        };

        let previous = self.status.send_replace(status.clone());
        if previous.backend_reachable != status.backend_reachable || previous.last_checked_at.is_none() {
            if status.backend_reachable {
                info!(latency_ms, "Reasoning backend reachable");
            } else {
                warn!(
                    error = status.last_error.as_deref().unwrap_or_default(),
                    "Reasoning backend unreachable"
                );
            }
        } else {
            debug!(reachable = status.backend_reachable, latency_ms, "Health probe tick");
        }

        status
    }

    /// Probe on a fixed interval until cancelled
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.probe_once().await;
                    }
                }
            }
            info!("Health probe stopped");
        })
    }
}
