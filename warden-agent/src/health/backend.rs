//! Reasoning backend reachability checks.

use crate::utils::ProbeError;
use async_trait::async_trait;
use std::time::Duration;

/// Anything the probe can ask "are you there?".
#[async_trait]
pub trait Backend: Send + Sync {
    async fn check(&self) -> Result<(), ProbeError>;

    /// Shown in status output
    fn describe(&self) -> String;
}

/// Plain `GET <url>`; any 2xx within the timeout counts as reachable.
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn check(&self) -> Result<(), ProbeError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let response = tokio::time::timeout(self.timeout, self.client.get(&self.url).send())
            .await
            .map_err(|_| ProbeError::Timeout(timeout_ms))?
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout(timeout_ms)
                } else {
                    ProbeError::Unreachable(e.to_string())
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(response.status().as_u16()))
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
