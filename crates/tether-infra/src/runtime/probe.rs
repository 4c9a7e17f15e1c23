//! Generic JSON status probe over HTTP.
//!
//! `GET {status_url}` with `{id}` replaced by the URL-encoded correlation
//! value; the status is read from the response body with a JSON pointer.
//! Abort is a `POST {cancel_url}`.

use std::time::Duration;

use tether_core::reconcile::payload::pointer_string;
use tether_core::reconcile::probe::PollProbe;
use tether_types::config::ProbeConfig;
use tether_types::error::ProbeError;
use tether_types::signal::ExternalStatus;

const ID_PLACEHOLDER: &str = "{id}";
const MAX_ERROR_BODY: usize = 256;

#[derive(Clone)]
pub struct HttpPollProbe {
    client: reqwest::Client,
    config: ProbeConfig,
}

impl HttpPollProbe {
    pub fn new(config: ProbeConfig) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url_for(template: &str, correlation_value: &str) -> String {
        template.replace(ID_PLACEHOLDER, &urlencoding::encode(correlation_value))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProbeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut message = response.text().await.unwrap_or_default();
        if message.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Err(ProbeError::Provider {
            status: status.as_u16(),
            message,
        })
    }
}

impl std::fmt::Debug for HttpPollProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPollProbe")
            .field("status_url", &self.config.status_url)
            .field("cancel_url", &self.config.cancel_url)
            .finish()
    }
}

impl PollProbe for HttpPollProbe {
    async fn probe(&self, correlation_value: &str) -> Result<ExternalStatus, ProbeError> {
        let url = Self::url_for(&self.config.status_url, correlation_value);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProbeError::Decode(e.to_string()))?;

        let status = pointer_string(&body, &self.config.status_pointer).ok_or_else(|| {
            ProbeError::Decode(format!("no status at {}", self.config.status_pointer))
        })?;

        let mut snapshot = ExternalStatus::new(status);
        snapshot.summary = self
            .config
            .summary_pointer
            .as_deref()
            .and_then(|p| pointer_string(&body, p));
        snapshot.external_ref = self
            .config
            .external_ref_pointer
            .as_deref()
            .and_then(|p| pointer_string(&body, p));
        Ok(snapshot)
    }

    async fn abort(&self, correlation_value: &str) -> Result<(), ProbeError> {
        let template = self
            .config
            .cancel_url
            .as_deref()
            .ok_or_else(|| ProbeError::NotConfigured("probe.cancel_url".to_string()))?;
        let url = Self::url_for(template, correlation_value);

        let response = self
            .authorize(self.client.post(&url))
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        Self::check_status(response).await.map(|_| ())
    }
}
