//! Per-run reconstruction state.
//!
//! [`StreamSession`] owns everything mutable about one tracked agent run:
//! its status, the delta accumulator, the text buffer, and the recorded
//! results. Event routing is synchronous; the async driver in
//! [`consumer`](crate::consumer) feeds it one event at a time.
//!
//! [`InstanceRegistry`] hands out the monotonically increasing instance ids
//! that distinguish the current session from any superseded one. The
//! registry is injectable (one per consumer) so concurrent consumers, e.g.
//! in tests, never share numbering.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::accumulator::DeltaAccumulator;
use crate::config::StreamConfig;
use crate::event::{StatusType, StreamEvent, ToolOutputEvent};
use crate::reconstruct::{ReconstructedToolCall, ReconstructionState, reconstruct_all};
use crate::status::{BillingAlert, RunStatus, is_billing_message};
use crate::text::{TextBuffer, TextFragment};

/// Monotonic source of session instance ids.
///
/// Any event whose owning instance no longer matches [`current`] belongs to
/// a superseded stream and must be discarded, never merged.
///
/// [`current`]: InstanceRegistry::current
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    counter: AtomicU64,
}

impl InstanceRegistry {
    /// Create a registry starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate the current instance and return the next one.
    pub fn advance(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The currently valid instance id.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Whether `instance` is still the current one.
    pub fn is_current(&self, instance: u64) -> bool {
        self.current() == instance
    }
}

/// Consistent view of the run, as surfaced to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSnapshot {
    /// Current run status.
    pub status: RunStatus,
    /// Canonical ordered assistant text.
    pub text_content: String,
    /// Reconstructed tool calls, ordered by index.
    pub tool_calls: Vec<ReconstructedToolCall>,
    /// Surfaced error message, when the run ended in error.
    pub error: Option<String>,
    /// Id of the tracked run; `None` once the session is finalized.
    pub agent_run_id: Option<String>,
}

/// What an applied event asks the driver to do beyond routine publication.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// State may have advanced; nothing else to do.
    Progress,
    /// Live tool output to pass through to the observer, verbatim.
    ToolOutput(ToolOutputEvent),
    /// Billing-classified halt; emit the alert and finalize as stopped.
    Billing(BillingAlert),
    /// The streaming turn completed cleanly.
    Complete,
    /// The server reported an unexpected error.
    Fatal(String),
}

/// All mutable reconstruction state for one tracked run.
///
/// Created fresh (empty) when a run starts; cleared again by
/// [`finalize`](StreamSession::finalize). Never shared across session
/// instances.
#[derive(Debug)]
pub struct StreamSession {
    thread_id: String,
    run_id: String,
    instance: u64,
    status: RunStatus,
    error: Option<String>,
    warnings: Vec<String>,
    accumulator: DeltaAccumulator,
    text: TextBuffer,
    results: ReconstructionState,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl StreamSession {
    /// Create a session in [`RunStatus::Connecting`] with empty state.
    pub fn new(
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        instance: u64,
        config: &StreamConfig,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            instance,
            status: RunStatus::Connecting,
            error: None,
            warnings: Vec::new(),
            accumulator: DeltaAccumulator::new(),
            text: TextBuffer::new(config.flush_max_pending, config.flush_max_latency()),
            results: ReconstructionState::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// The run this session tracks.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The owning thread/conversation context.
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// The instance id this session was created under.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Current status.
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Whether the session has reached a terminal status.
    pub fn is_finalized(&self) -> bool {
        self.status.is_terminal()
    }

    /// When the session was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the session was finalized, if it has been.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Warnings recorded during the session (e.g. disconnect notices).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Whether an event owned by (`instance`, `thread_id`, `run_id`) may be
    /// processed: the instance must still be current in `registry` and both
    /// identities must match this session.
    pub fn owns_event(
        &self,
        registry: &InstanceRegistry,
        thread_id: &str,
        run_id: &str,
    ) -> bool {
        registry.is_current(self.instance) && self.thread_id == thread_id && self.run_id == run_id
    }

    /// Route one decoded event into the reconstruction state.
    ///
    /// The first inbound event moves a connecting session to streaming.
    /// Events arriving after finalization are dropped.
    pub fn apply_event(&mut self, event: StreamEvent) -> SessionSignal {
        if self.is_finalized() {
            tracing::debug!(run_id = %self.run_id, "session: event after finalize dropped");
            return SessionSignal::Progress;
        }
        if self.status == RunStatus::Connecting {
            self.status = RunStatus::Streaming;
        }

        match event {
            StreamEvent::AssistantChunk { sequence, text } => {
                let flush_now = self.text.push(TextFragment {
                    sequence,
                    content: text,
                });
                if flush_now {
                    self.text.flush();
                }
                SessionSignal::Progress
            }
            StreamEvent::ToolCallDelta(delta) => {
                self.accumulator.apply(&delta);
                SessionSignal::Progress
            }
            StreamEvent::ToolResult(result) => {
                self.results.record_result(&result);
                SessionSignal::Progress
            }
            StreamEvent::AssistantComplete {} => SessionSignal::Complete,
            StreamEvent::Status {
                status_type,
                message,
            } => self.apply_status(status_type, message),
            StreamEvent::ToolOutput(output) => SessionSignal::ToolOutput(output),
        }
    }

    fn apply_status(&mut self, status_type: StatusType, message: Option<String>) -> SessionSignal {
        match status_type {
            StatusType::Finish => SessionSignal::Complete,
            StatusType::Error => {
                let message = message.unwrap_or_else(|| "agent run error".to_string());
                if is_billing_message(&message) {
                    SessionSignal::Billing(BillingAlert::from_message(&message))
                } else {
                    SessionSignal::Fatal(message)
                }
            }
            // Per-tool lifecycle notices carry no tool id; completion is
            // driven by tool_result events alone.
            StatusType::ToolCompleted | StatusType::ToolFailed | StatusType::ToolError => {
                tracing::debug!(?status_type, "session: tool status notice");
                SessionSignal::Progress
            }
        }
    }

    /// Flush pending text into the ordered set.
    pub fn flush_text(&mut self) {
        self.text.flush();
    }

    /// Record a user-visible warning (e.g. "may still be running").
    pub fn record_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Finalize the session: force-flush the text buffer so no trailing
    /// fragment is dropped, capture the final snapshot, then clear all
    /// reconstruction state.
    ///
    /// The returned snapshot carries the final text and tool calls but a
    /// cleared `agent_run_id`, matching the session's end of life.
    pub fn finalize(&mut self, status: RunStatus, error: Option<String>) -> RunSnapshot {
        self.text.flush();
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
        tracing::debug!(run_id = %self.run_id, %status, "session: finalized");

        let snapshot = RunSnapshot {
            agent_run_id: None,
            ..self.snapshot()
        };

        self.accumulator.clear();
        self.text.clear();
        self.results.clear();
        snapshot
    }

    /// Build the current consistent view.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            status: self.status,
            text_content: self.text.ordered_text(),
            tool_calls: reconstruct_all(&self.accumulator, &self.results),
            error: self.error.clone(),
            agent_run_id: Some(self.run_id.clone()),
        }
    }
}
