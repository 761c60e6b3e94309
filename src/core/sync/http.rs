use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::transport::{RecordAck, Transport, TransportError, UploadBatch};
use crate::core::inbox::IncomingCommand;

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    acks: Vec<RecordAck>,
}

#[derive(Deserialize)]
struct CommandsResponse {
    #[serde(default)]
    commands: Vec<IncomingCommand>,
}

/// JSON-over-HTTP transport against the management server.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("outpost/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, agent_id: &str, tail: &str) -> String {
        format!("{}/api/agents/{}/{}", self.base_url, agent_id, tail)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::Status {
            code: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload(&self, batch: &UploadBatch) -> Result<Vec<RecordAck>, TransportError> {
        let url = self.endpoint(&batch.agent_id, "records");
        debug!("[sync] POST {} ({} record(s))", url, batch.records.len());
        let resp = self
            .client
            .post(&url)
            .json(batch)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let parsed: UploadResponse = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(parsed.acks)
    }

    async fn poll_commands(&self, agent_id: &str) -> Result<Vec<IncomingCommand>, TransportError> {
        let url = self.endpoint(agent_id, "commands");
        debug!("[sync] GET {}", url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let parsed: CommandsResponse = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(parsed.commands)
    }
}
