//! Wire events for the agent-run stream.
//!
//! This module defines the [`StreamEvent`] union decoded from each raw
//! transport message, and [`parse_stream_event`] which handles the SSE
//! `data: ` prefix and the plain-text completion sentinel before any JSON
//! decoding happens.

use serde::{Deserialize, Serialize};

/// Plain-text sentinel the worker emits when a run finishes cleanly.
///
/// Checked against the raw payload before JSON decoding so a sentinel-only
/// message never reaches the generic parse-failure path.
pub const COMPLETION_SENTINEL: &str = "Worker run completed successfully";

/// Prefix carried by messages relayed verbatim from an SSE frame.
const SSE_DATA_PREFIX: &str = "data: ";

/// Events delivered over the agent-run stream.
///
/// Each variant corresponds to one `"type"` tag on the wire. Field names are
/// camelCase on the wire and snake_case here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A fragment of the assistant's text, ordered by `sequence`.
    #[serde(rename = "assistant")]
    AssistantChunk {
        /// Position of this fragment in the logical text.
        sequence: u64,
        /// The fragment itself.
        #[serde(rename = "content")]
        text: String,
    },

    /// An incremental (or full-snapshot) update to a tool call's arguments.
    #[serde(rename = "tool_call")]
    ToolCallDelta(ToolCallDeltaEvent),

    /// The completed result of a tool call, arriving independently of its
    /// argument deltas.
    #[serde(rename = "tool_result")]
    ToolResult(ToolResultEvent),

    /// Terminates a streaming assistant turn.
    AssistantComplete {},

    /// Coarse lifecycle notification from the server.
    #[serde(rename = "status")]
    Status {
        /// What happened.
        #[serde(rename = "statusType")]
        status_type: StatusType,
        /// Optional human-readable detail.
        #[serde(default)]
        message: Option<String>,
    },

    /// Live output from a running tool, passed through verbatim to the
    /// observer and never merged into the reconstruction.
    #[serde(rename = "tool_output")]
    ToolOutput(ToolOutputEvent),
}

/// Kinds of [`StreamEvent::Status`] notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    /// A tool finished successfully.
    ToolCompleted,
    /// A tool finished unsuccessfully.
    ToolFailed,
    /// A tool raised an error.
    ToolError,
    /// The run finished.
    Finish,
    /// The run errored; `message` carries the cause.
    Error,
}

/// Payload of a `tool_call` wire event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallDeltaEvent {
    /// Identity of the tool call this fragment belongs to.
    pub tool_call_id: String,
    /// Function name; may arrive on a later chunk than the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    /// Display position of the tool call within the turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Position of this fragment in the argument string.
    pub sequence: u64,
    /// `true` when `arguments_delta` carries an incremental fragment.
    #[serde(default)]
    pub is_delta: bool,
    /// Incremental argument fragment (delta events).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments_delta: Option<String>,
    /// Full argument snapshot (non-delta events); string or object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

/// Payload of a `tool_result` wire event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEvent {
    /// Identity of the tool call this result belongs to.
    pub tool_call_id: String,
    /// Function name, always present on results.
    pub function_name: String,
    /// Display position of the tool call within the turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// The outcome.
    pub result: ToolResultPayload,
}

/// Outcome of a completed tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    /// Whether the tool succeeded.
    pub success: bool,
    /// Tool output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error detail on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

/// Payload of a `tool_output` wire event (auxiliary live-output channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutputEvent {
    /// Identity of the tool call producing output.
    pub tool_call_id: String,
    /// Name of the running tool.
    pub tool_name: String,
    /// Raw output chunk.
    pub output: String,
    /// Whether this is the final output chunk.
    pub is_final: bool,
}

/// Error type for stream payload decoding.
#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
    /// The payload was empty after prefix stripping.
    #[error("empty stream payload")]
    Empty,

    /// The payload was not valid JSON or did not match any event shape.
    #[error("malformed stream payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode one raw transport message into a [`StreamEvent`].
///
/// Strips an optional SSE `data: ` prefix, then checks for the plain-text
/// [`COMPLETION_SENTINEL`] before attempting JSON decoding. A sentinel
/// payload decodes to [`StreamEvent::AssistantComplete`].
///
/// # Errors
///
/// Returns [`EventParseError`] when the payload is empty or fails to decode.
/// Callers drop malformed payloads; they are never treated as terminal.
pub fn parse_stream_event(raw: &str) -> Result<StreamEvent, EventParseError> {
    let payload = raw.strip_prefix(SSE_DATA_PREFIX).unwrap_or(raw).trim();

    if payload.is_empty() {
        return Err(EventParseError::Empty);
    }

    // Sentinel check happens on the raw text so that the worker's non-JSON
    // completion message terminates the turn instead of parse-failing.
    if payload.contains(COMPLETION_SENTINEL) {
        return Ok(StreamEvent::AssistantComplete {});
    }

    Ok(serde_json::from_str(payload)?)
}
