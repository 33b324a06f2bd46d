//! Transport contract for the agent-run stream.
//!
//! Defines the [`AgentTransport`] trait the reconstruction engine depends
//! on: a liveness/terminal-status query, a best-effort stop request, and the
//! raw message stream. [`HttpAgentTransport`] implements it over HTTP + SSE;
//! [`MockTransport`] scripts it for tests.

mod http;
mod mock;

pub use http::HttpAgentTransport;
pub use mock::MockTransport;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;

use crate::status::is_expected_not_found;

/// Error type for transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The run does not exist (or no longer exists) on the server.
    #[error("agent run not found: {0}")]
    NotFound(String),

    /// Request failed due to network or connection issues.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The server answered with an unexpected HTTP status.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// The status code.
        status: u16,
        /// Response body, best effort.
        body: String,
    },

    /// The open stream failed mid-flight.
    #[error("stream failed: {0}")]
    Stream(String),
}

impl TransportError {
    /// Whether this failure is the benign "run is gone" class: an expected
    /// race with an already-finished run, resolved silently to
    /// `agent_not_running` rather than surfaced as an error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::HttpStatus { status: 404, .. } => true,
            Self::RequestFailed(msg) | Self::Stream(msg) | Self::HttpStatus { body: msg, .. } => {
                is_expected_not_found(msg)
            }
        }
    }
}

/// Response of the liveness/terminal-status query.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentStatusResponse {
    /// Server-reported status: `"running"`, `"completed"`, `"stopped"`,
    /// `"failed"`, ...
    pub status: String,
    /// Optional error or stop message attached to the status.
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentStatusResponse {
    /// Whether the run is still executing.
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// A pinned, owned stream of raw transport messages.
///
/// Each item is one raw, possibly `data: `-prefixed JSON payload. Dropping
/// the stream tears the connection down; teardown is idempotent and safe
/// mid-stream.
pub type RawMessageStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Trait for agent-run transports.
///
/// Implementations must be thread-safe (`Send + Sync`) for use behind a
/// shared handle in async contexts.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Query the run's current status.
    ///
    /// # Errors
    ///
    /// May fail with a "not found"-class error for an unknown or expired
    /// run; see [`TransportError::is_not_found`].
    async fn get_agent_status(&self, run_id: &str) -> Result<AgentStatusResponse, TransportError>;

    /// Request cancellation of the run, best effort.
    ///
    /// A failure here must be reported to the caller but must not reopen
    /// or retry the stream.
    async fn stop_agent(&self, run_id: &str) -> Result<(), TransportError>;

    /// Open the live event stream for the run.
    fn stream_agent(&self, run_id: &str) -> RawMessageStream;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(TransportError::NotFound("r1".to_string()).is_not_found());
        assert!(
            TransportError::HttpStatus {
                status: 404,
                body: String::new()
            }
            .is_not_found()
        );
        assert!(TransportError::RequestFailed("run does not exist".to_string()).is_not_found());
        assert!(!TransportError::RequestFailed("connection reset".to_string()).is_not_found());
        assert!(
            !TransportError::HttpStatus {
                status: 500,
                body: "internal".to_string()
            }
            .is_not_found()
        );
    }

    #[test]
    fn test_status_response_parsing() {
        let json = r#"{"status": "running"}"#;
        let response: AgentStatusResponse = serde_json::from_str(json).unwrap();
        assert!(response.is_running());
        assert_eq!(response.error, None);

        let json = r#"{"status": "stopped", "error": "balance is -5 credits"}"#;
        let response: AgentStatusResponse = serde_json::from_str(json).unwrap();
        assert!(!response.is_running());
        assert_eq!(response.error.as_deref(), Some("balance is -5 credits"));
    }
}
