//! Sequence-ordered accumulation of tool-call argument fragments.
//!
//! [`DeltaAccumulator`] merges out-of-order and duplicated argument deltas
//! per tool call into one coherent argument string. Fragments carry a
//! `sequence` number scoped to their tool call; a fragment with a
//! previously-seen sequence replaces that slot rather than appending, which
//! absorbs transport retransmissions without duplicating data.

use std::collections::HashMap;

use crate::event::ToolCallDeltaEvent;

/// One received argument fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentChunk {
    /// Position of this fragment in the argument string.
    pub sequence: u64,
    /// The fragment text.
    pub delta: String,
}

/// All state accumulated for a single tool call.
///
/// Metadata is mutated in place as later chunks reveal more (the function
/// name may arrive after the first delta). `chunks` is kept sorted ascending
/// by sequence; the merged argument string is always derived, never stored.
#[derive(Debug, Clone)]
pub struct AccumulatedToolCall {
    /// Identity of the tool call.
    pub tool_call_id: String,
    /// Function name, once some chunk has carried it.
    pub function_name: Option<String>,
    /// Display position within the turn, once some chunk has carried it.
    pub index: Option<u32>,
    chunks: Vec<ArgumentChunk>,
}

impl AccumulatedToolCall {
    fn new(tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            function_name: None,
            index: None,
            chunks: Vec::new(),
        }
    }

    /// The fragments received so far, ascending by sequence.
    pub fn chunks(&self) -> &[ArgumentChunk] {
        &self.chunks
    }

    /// Concatenation of all fragments in sequence order.
    pub fn merged_arguments(&self) -> String {
        self.chunks.iter().map(|c| c.delta.as_str()).collect()
    }

    /// Insert or replace the fragment at `sequence`.
    fn apply_delta(&mut self, sequence: u64, delta: &str) {
        match self.chunks.binary_search_by_key(&sequence, |c| c.sequence) {
            // Duplicate retransmission: replace the slot, idempotently.
            Ok(pos) => self.chunks[pos].delta = delta.to_string(),
            Err(pos) => self.chunks.insert(
                pos,
                ArgumentChunk {
                    sequence,
                    delta: delta.to_string(),
                },
            ),
        }
    }

    /// Replace all fragments with a single full snapshot at `sequence`.
    fn apply_snapshot(&mut self, sequence: u64, arguments: String) {
        self.chunks.clear();
        self.chunks.push(ArgumentChunk {
            sequence,
            delta: arguments,
        });
    }
}

/// Keyed store of partially-received tool calls.
///
/// Entries are created on first sight of a `tool_call_id`; there is no
/// closed corpus of valid ids, so an unknown id always creates a new entry
/// rather than being dropped. Discovery order is tracked so downstream
/// sorting can break index ties deterministically.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    entries: HashMap<String, AccumulatedToolCall>,
    order: Vec<String>,
}

impl DeltaAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one `tool_call` wire event into the store.
    ///
    /// Delta events (`is_delta` with a fragment) replace-or-insert at their
    /// sequence slot. Full-snapshot events (non-delta `arguments`) supersede
    /// every previously accumulated fragment for that tool call. Events
    /// carrying neither still create the entry and update metadata.
    pub fn apply(&mut self, event: &ToolCallDeltaEvent) {
        let entry = self
            .entries
            .entry(event.tool_call_id.clone())
            .or_insert_with(|| {
                self.order.push(event.tool_call_id.clone());
                AccumulatedToolCall::new(&event.tool_call_id)
            });

        if let Some(ref name) = event.function_name {
            entry.function_name = Some(name.clone());
        }
        if let Some(index) = event.index {
            entry.index = Some(index);
        }

        if event.is_delta
            && let Some(ref delta) = event.arguments_delta
        {
            entry.apply_delta(event.sequence, delta);
        } else if let Some(ref arguments) = event.arguments {
            let snapshot = match arguments {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            entry.apply_snapshot(event.sequence, snapshot);
        }
    }

    /// Look up one tool call by id.
    pub fn get(&self, tool_call_id: &str) -> Option<&AccumulatedToolCall> {
        self.entries.get(tool_call_id)
    }

    /// Whether an entry exists for `tool_call_id`.
    pub fn contains(&self, tool_call_id: &str) -> bool {
        self.entries.contains_key(tool_call_id)
    }

    /// Iterate entries in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &AccumulatedToolCall> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Number of tracked tool calls.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no tool calls are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all accumulated state.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
