/// Built-in hook implementations.
///
/// These ship with netwarden and can be enabled per job type. Each hook is a
/// concrete struct that implements the `Hook` trait.
use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::info;
use url::Url;

use crate::registry::Hook;
use crate::types::{PostJobPayload, WebHookFormat};

// ---------------------------------------------------------------------------
// Logging hook: logs every finished job
// ---------------------------------------------------------------------------

pub struct LoggingHook {
    pub prefix: String,
}

impl LoggingHook {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

#[async_trait]
impl Hook for LoggingHook {
    fn name(&self) -> &str {
        "logging_hook"
    }

    async fn execute(&self, payload: &PostJobPayload) -> Result<String> {
        info!(
            job_id = payload.job_id,
            job_type = %payload.job_type,
            status = %payload.status,
            "[{}] Job finished",
            self.prefix
        );
        Ok(format!("logged {}_{}", payload.job_type, payload.job_id))
    }
}

// ---------------------------------------------------------------------------
// Web hook: posts the job summary to an http(s) endpoint
// ---------------------------------------------------------------------------

pub struct WebHook {
    name: String,
    url: Url,
    format: WebHookFormat,
    client: Client,
}

impl WebHook {
    /// Build a web hook. `ssl_validation = false` accepts any server certificate.
    pub fn new(
        name: impl Into<String>,
        url: &str,
        format: WebHookFormat,
        ssl_validation: bool,
    ) -> Result<Self> {
        let url = parse_hook_url(url)?;
        let client = Client::builder()
            .danger_accept_invalid_certs(!ssl_validation)
            .build()?;
        Ok(Self { name: name.into(), url, format, client })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Only absolute http and https URLs are accepted.
pub fn parse_hook_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("Empty URL");
    }
    let url = Url::parse(trimmed).map_err(|e| anyhow::anyhow!("Invalid URL: {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => bail!("Invalid protocol: {other}"),
    }
}

#[async_trait]
impl Hook for WebHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, payload: &PostJobPayload) -> Result<String> {
        let body = self.format.encode(payload)?;
        let resp = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, self.format.content_type())
            .body(body)
            .send()
            .await?;
        Ok(format!("HTTP response code {}", resp.status().as_u16()))
    }
}
