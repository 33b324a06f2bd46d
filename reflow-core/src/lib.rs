//! Reflow core library.
//!
//! Reconstructs a consistent view of an in-progress AI agent run from its
//! live, chunked, possibly-reordered event stream: the growing assistant
//! text, and the set of in-flight and completed tool calls with their
//! arguments and results. Tolerates duplicated and out-of-order delivery,
//! transport disconnects, and races against a newly started run.

pub mod accumulator;
pub mod config;
pub mod consumer;
pub mod event;
pub mod reconstruct;
pub mod session;
pub mod status;
pub mod text;
pub mod transport;

pub use accumulator::{AccumulatedToolCall, ArgumentChunk, DeltaAccumulator};
pub use config::{Config, ConfigError, StreamConfig};
pub use consumer::{AgentRunConsumer, NullObserver, RunObserver, SessionError};
pub use event::{
    EventParseError, StatusType, StreamEvent, ToolCallDeltaEvent, ToolOutputEvent,
    ToolResultEvent, ToolResultPayload, parse_stream_event,
};
pub use reconstruct::{ReconstructedToolCall, ReconstructionState, reconstruct_all};
pub use session::{InstanceRegistry, RunSnapshot, StreamSession};
pub use status::{BillingAlert, RunStatus, map_agent_status};
pub use text::{TextBuffer, TextFragment};
pub use transport::{
    AgentStatusResponse, AgentTransport, HttpAgentTransport, MockTransport, TransportError,
};
