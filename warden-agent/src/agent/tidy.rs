//! Whitespace normalizer: strips trailing blanks and fixes final newlines.

use super::{Capability, MutationRequest, WorkspaceView};
use crate::utils::Result;
use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Default)]
pub struct Tidy;

impl Tidy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Capability for Tidy {
    fn name(&self) -> &str {
        "tidy"
    }

    async fn propose(&self, view: &WorkspaceView) -> Result<Vec<MutationRequest>> {
        let mut requests = Vec::new();
        for file in view.files()? {
            let content = tokio::fs::read(&file.path).await?;
            // Binary files are left alone
            let Ok(text) = std::str::from_utf8(&content) else {
                continue;
            };
            let tidied = tidy_text(text);
            if tidied != text {
                debug!(agent_id = %view.agent_id, path = %file.path.display(), "Proposing tidy");
                requests.push(MutationRequest::new(file.path, tidied));
            }
        }
        Ok(requests)
    }
}

/// Trailing spaces/tabs removed per line, trailing blank lines collapsed,
/// exactly one final newline. Line endings (`\n` or `\r\n`) are kept.
pub fn tidy_text(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    let mut lines: Vec<String> = text
        .split('\n')
        .map(|line| {
            let (body, cr) = match line.strip_suffix('\r') {
                Some(body) => (body, "\r"),
                None => (line, ""),
            };
            format!("{}{}", body.trim_end_matches([' ', '\t']), cr)
        })
        .collect();

    while lines
        .last()
        .map(|l| l.trim_end_matches('\r').is_empty())
        .unwrap_or(false)
    {
        lines.pop();
    }

    let crlf = lines.first().map(|l| l.ends_with('\r')).unwrap_or(false);
    let mut out = lines.join("\n");
    out.push_str(if crlf && !out.ends_with('\r') { "\r\n" } else { "\n" });
    out
}
