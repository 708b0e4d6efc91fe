//! Backend-driven rewrites: each file is sent to the reasoning backend,
//! which may answer with replacement content.

use super::{Capability, MutationRequest, WorkspaceView};
use crate::utils::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct RewriteRequest<'a> {
    agent_id: &'a str,
    path: String,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct RewriteResponse {
    /// `None` means "leave the file alone"
    #[serde(default)]
    content: Option<String>,
}

pub struct Remote {
    client: reqwest::Client,
    endpoint: String,
}

impl Remote {
    pub fn new(endpoint: impl Into<String>) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Capability for Remote {
    fn name(&self) -> &str {
        "remote"
    }

    fn requires_backend(&self) -> bool {
        true
    }

    async fn propose(&self, view: &WorkspaceView) -> Result<Vec<MutationRequest>> {
        let mut requests = Vec::new();
        for file in view.files()? {
            let content = tokio::fs::read(&file.path).await?;
            let Ok(text) = std::str::from_utf8(&content) else {
                continue;
            };

            let body = RewriteRequest {
                agent_id: &view.agent_id,
                path: file.relative_path.to_string_lossy().to_string(),
                content: text,
            };
            let response: RewriteResponse = self
                .client
                .post(&self.endpoint)
                .json(&body)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            match response.content {
                Some(rewritten) if rewritten != text => {
                    debug!(agent_id = %view.agent_id, path = %file.path.display(), "Backend proposed rewrite");
                    requests.push(MutationRequest::new(file.path, rewritten));
                }
                _ => {}
            }
        }
        Ok(requests)
    }
}
