//! Mock agent transport for testing.
//!
//! Provides [`MockTransport`], a scriptable implementation of
//! [`AgentTransport`] for unit and integration testing: status replies are
//! consumed FIFO (falling back to the last one), the stream yields the
//! scripted messages, and stop requests are recorded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{AgentStatusResponse, AgentTransport, RawMessageStream, TransportError};

#[derive(Debug, Default)]
struct MockState {
    statuses: VecDeque<Result<AgentStatusResponse, TransportError>>,
    last_status: Option<Result<AgentStatusResponse, TransportError>>,
    messages: Vec<Result<String, TransportError>>,
    hold_open: bool,
    stop_error: Option<TransportError>,
    stop_calls: Vec<String>,
    stream_opens: Vec<String>,
}

/// A scriptable mock transport.
///
/// # Examples
///
/// ```
/// use reflow_core::transport::{AgentTransport, MockTransport};
///
/// # async fn example() {
/// let transport = MockTransport::new()
///     .with_status("running")
///     .with_message(r#"{"type":"assistant","sequence":0,"content":"Hi"}"#);
///
/// let status = transport.get_agent_status("r1").await.unwrap();
/// assert!(status.is_running());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a mock with nothing scripted. Status queries report
    /// `"running"` until told otherwise; the stream closes immediately.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            // Recover from a panic in another test thread.
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a status reply (FIFO). The last reply is repeated once the
    /// queue is drained.
    #[must_use]
    pub fn with_status(self, status: &str) -> Self {
        self.lock().statuses.push_back(Ok(AgentStatusResponse {
            status: status.to_string(),
            error: None,
        }));
        self
    }

    /// Queue a status reply carrying an error/stop message.
    #[must_use]
    pub fn with_status_message(self, status: &str, message: &str) -> Self {
        self.lock().statuses.push_back(Ok(AgentStatusResponse {
            status: status.to_string(),
            error: Some(message.to_string()),
        }));
        self
    }

    /// Queue a failing status reply.
    #[must_use]
    pub fn with_status_error(self, error: TransportError) -> Self {
        self.lock().statuses.push_back(Err(error));
        self
    }

    /// Append a raw message the stream will yield.
    #[must_use]
    pub fn with_message(self, raw: &str) -> Self {
        self.lock().messages.push(Ok(raw.to_string()));
        self
    }

    /// Append a mid-stream error the stream will yield.
    #[must_use]
    pub fn with_stream_error(self, error: TransportError) -> Self {
        self.lock().messages.push(Err(error));
        self
    }

    /// Keep the stream open (pending forever) after the scripted messages
    /// instead of closing it.
    #[must_use]
    pub fn hold_open(self) -> Self {
        self.lock().hold_open = true;
        self
    }

    /// Make `stop_agent` fail with the given error.
    #[must_use]
    pub fn with_stop_error(self, error: TransportError) -> Self {
        self.lock().stop_error = Some(error);
        self
    }

    /// Run ids passed to `stop_agent` so far.
    pub fn stop_calls(&self) -> Vec<String> {
        self.lock().stop_calls.clone()
    }

    /// Run ids passed to `stream_agent` so far.
    pub fn stream_opens(&self) -> Vec<String> {
        self.lock().stream_opens.clone()
    }
}

#[async_trait]
impl AgentTransport for MockTransport {
    async fn get_agent_status(&self, _run_id: &str) -> Result<AgentStatusResponse, TransportError> {
        let mut state = self.lock();
        match state.statuses.pop_front() {
            Some(reply) => {
                state.last_status = Some(reply.clone());
                reply
            }
            None => match &state.last_status {
                Some(reply) => reply.clone(),
                None => Ok(AgentStatusResponse {
                    status: "running".to_string(),
                    error: None,
                }),
            },
        }
    }

    async fn stop_agent(&self, run_id: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.stop_calls.push(run_id.to_string());
        match &state.stop_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn stream_agent(&self, run_id: &str) -> RawMessageStream {
        let (messages, hold_open) = {
            let mut state = self.lock();
            state.stream_opens.push(run_id.to_string());
            (state.messages.clone(), state.hold_open)
        };

        Box::pin(async_stream::stream! {
            for message in messages {
                yield message;
            }
            if hold_open {
                futures::future::pending::<()>().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_statuses_fifo_with_repeat() {
        let transport = MockTransport::new()
            .with_status("running")
            .with_status("completed");

        assert_eq!(transport.get_agent_status("r1").await.unwrap().status, "running");
        assert_eq!(transport.get_agent_status("r1").await.unwrap().status, "completed");
        // Queue drained: last reply repeats.
        assert_eq!(transport.get_agent_status("r1").await.unwrap().status, "completed");
    }

    #[tokio::test]
    async fn test_default_status_is_running() {
        let transport = MockTransport::new();
        assert!(transport.get_agent_status("r1").await.unwrap().is_running());
    }

    #[tokio::test]
    async fn test_scripted_stream_then_close() {
        let transport = MockTransport::new().with_message("one").with_message("two");

        let mut stream = transport.stream_agent("r1");
        assert_eq!(stream.next().await.unwrap().unwrap(), "one");
        assert_eq!(stream.next().await.unwrap().unwrap(), "two");
        assert!(stream.next().await.is_none());
        assert_eq!(transport.stream_opens(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_recorded_and_fails_when_scripted() {
        let transport = MockTransport::new()
            .with_stop_error(TransportError::RequestFailed("boom".to_string()));

        let result = transport.stop_agent("r1").await;
        assert!(result.is_err());
        assert_eq!(transport.stop_calls(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_transport_is_object_safe() {
        let transport: Box<dyn AgentTransport> = Box::new(MockTransport::new());
        assert!(transport.get_agent_status("r1").await.unwrap().is_running());
    }
}
