//! HTTP + SSE implementation of the agent transport.
//!
//! Talks to the agent-run API:
//!
//! - `GET  {base}/agent-run/{id}/status` — liveness/terminal-status query
//! - `POST {base}/agent-run/{id}/stop`   — best-effort cancellation
//! - `GET  {base}/agent-run/{id}/stream` — SSE event stream

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;

use super::{AgentStatusResponse, AgentTransport, RawMessageStream, TransportError};

/// Production transport over HTTP and server-sent events.
pub struct HttpAgentTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpAgentTransport {
    /// Create a transport for the given API base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
        }
    }

    /// Attach a bearer token sent with every request.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn url(&self, run_id: &str, leaf: &str) -> String {
        format!(
            "{}/agent-run/{}/{}",
            self.base_url.trim_end_matches('/'),
            run_id,
            leaf
        )
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }
}

/// Convert a non-success response into the matching [`TransportError`].
async fn error_for(response: reqwest::Response, run_id: &str) -> TransportError {
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return TransportError::NotFound(run_id.to_string());
    }
    let body = response.text().await.unwrap_or_default();
    TransportError::HttpStatus {
        status: status.as_u16(),
        body,
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn get_agent_status(&self, run_id: &str) -> Result<AgentStatusResponse, TransportError> {
        let url = self.url(run_id, "status");
        tracing::debug!(url, "http: GET agent status");
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_for(response, run_id).await);
        }

        response
            .json()
            .await
            .map_err(|e| TransportError::RequestFailed(format!("failed to parse status: {}", e)))
    }

    async fn stop_agent(&self, run_id: &str) -> Result<(), TransportError> {
        let url = self.url(run_id, "stop");
        tracing::debug!(url, "http: POST stop agent");
        let response = self
            .request(self.client.post(&url))
            .send()
            .await
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_for(response, run_id).await);
        }
        Ok(())
    }

    fn stream_agent(&self, run_id: &str) -> RawMessageStream {
        let client = self.client.clone();
        let url = self.url(run_id, "stream");
        let api_key = self.api_key.clone();
        let run_id = run_id.to_string();

        Box::pin(async_stream::stream! {
            let mut request = client.get(&url);
            if let Some(ref key) = api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(TransportError::RequestFailed(e.to_string()));
                    return;
                }
            };

            if !response.status().is_success() {
                yield Err(error_for(response, &run_id).await);
                return;
            }

            tracing::debug!(url, "http: SSE stream started");
            let mut sse_stream = response.bytes_stream().eventsource();

            while let Some(event) = sse_stream.next().await {
                match event {
                    Ok(event) => yield Ok(event.data),
                    Err(e) => {
                        yield Err(TransportError::Stream(e.to_string()));
                        return;
                    }
                }
            }

            // Server closed the stream; the session decides what that means.
            tracing::debug!(url, "http: SSE stream ended");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let transport = HttpAgentTransport::new("http://localhost:8000/api/");
        assert_eq!(
            transport.url("r1", "status"),
            "http://localhost:8000/api/agent-run/r1/status"
        );
        assert_eq!(
            transport.url("r1", "stream"),
            "http://localhost:8000/api/agent-run/r1/stream"
        );
    }
}
