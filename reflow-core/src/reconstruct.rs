//! Reconciliation of tool results with accumulated tool calls.
//!
//! Results arrive as independent events and may race ahead of the argument
//! deltas for the same tool call. [`ReconstructionState`] records completed
//! ids and result payloads; [`reconstruct_all`] derives the single coherent
//! tool-call list the presentation layer consumes. Reconstruction is pure:
//! calling it twice over unchanged inputs yields structurally identical
//! output.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::accumulator::DeltaAccumulator;
use crate::event::{ToolResultEvent, ToolResultPayload};

/// Placeholder arguments for a tool call whose result arrived before any
/// delta was observed.
const EMPTY_ARGUMENTS: &str = "{}";

/// Fallback function name for entries that never revealed one.
const UNKNOWN_FUNCTION: &str = "unknown";

/// A tool call as surfaced to the consumer: derived, ephemeral, recomputed
/// per surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconstructedToolCall {
    /// Identity of the tool call.
    pub tool_call_id: String,
    /// Function name, from deltas or from the result event.
    pub function_name: String,
    /// Display position within the turn; missing on the wire defaults to 0.
    pub index: u32,
    /// Merged argument string (possibly still growing).
    pub arguments: String,
    /// True iff a result has been recorded for this id, independent of
    /// whether delta chunks have stopped arriving.
    pub completed: bool,
    /// The recorded result, when one has arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultPayload>,
}

/// Recorded outcome of one tool call.
#[derive(Debug, Clone)]
struct ResultRecord {
    function_name: String,
    index: Option<u32>,
    payload: ToolResultPayload,
}

/// Cross-reference store for completed tool results.
#[derive(Debug, Default)]
pub struct ReconstructionState {
    completed_ids: HashSet<String>,
    results: HashMap<String, ResultRecord>,
    /// Discovery order of result arrivals, for deterministic tie-breaks.
    order: Vec<String>,
}

impl ReconstructionState {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one `tool_result` wire event.
    ///
    /// Recording the same id twice keeps the latest payload; the completed
    /// set is unaffected by duplicates.
    pub fn record_result(&mut self, event: &ToolResultEvent) {
        if self.completed_ids.insert(event.tool_call_id.clone()) {
            self.order.push(event.tool_call_id.clone());
        }
        self.results.insert(
            event.tool_call_id.clone(),
            ResultRecord {
                function_name: event.function_name.clone(),
                index: event.index,
                payload: event.result.clone(),
            },
        );
    }

    /// Whether a result has been recorded for `tool_call_id`.
    pub fn is_completed(&self, tool_call_id: &str) -> bool {
        self.completed_ids.contains(tool_call_id)
    }

    /// Number of recorded results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether no results are recorded.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Drop all recorded results.
    pub fn clear(&mut self) {
        self.completed_ids.clear();
        self.results.clear();
        self.order.clear();
    }
}

/// Derive the coherent tool-call list from accumulated deltas and results.
///
/// Every accumulator entry appears, marked completed and carrying its result
/// when one is recorded. Every result whose id has no accumulator entry is
/// synthesized with empty `"{}"` arguments and `completed = true` — a tool
/// call that finished before any delta was observed must still appear. The
/// combined list is sorted ascending by index (missing index defaults to 0);
/// ties preserve discovery order.
pub fn reconstruct_all(
    accumulator: &DeltaAccumulator,
    results: &ReconstructionState,
) -> Vec<ReconstructedToolCall> {
    let mut calls: Vec<ReconstructedToolCall> = accumulator
        .iter()
        .map(|entry| {
            let record = results.results.get(&entry.tool_call_id);
            ReconstructedToolCall {
                tool_call_id: entry.tool_call_id.clone(),
                function_name: entry
                    .function_name
                    .clone()
                    .or_else(|| record.map(|r| r.function_name.clone()))
                    .unwrap_or_else(|| UNKNOWN_FUNCTION.to_string()),
                index: entry.index.or_else(|| record.and_then(|r| r.index)).unwrap_or(0),
                arguments: entry.merged_arguments(),
                completed: results.is_completed(&entry.tool_call_id),
                tool_result: record.map(|r| r.payload.clone()),
            }
        })
        .collect();

    for id in &results.order {
        if accumulator.contains(id) {
            continue;
        }
        if let Some(record) = results.results.get(id) {
            calls.push(ReconstructedToolCall {
                tool_call_id: id.clone(),
                function_name: record.function_name.clone(),
                index: record.index.unwrap_or(0),
                arguments: EMPTY_ARGUMENTS.to_string(),
                completed: true,
                tool_result: Some(record.payload.clone()),
            });
        }
    }

    // Stable sort keeps discovery order for equal indices.
    calls.sort_by_key(|c| c.index);
    calls
}

/// Key capturing everything that makes a reconstruction observably new:
/// ids, function names, argument lengths, and completion flags.
///
/// Used to suppress redundant downstream notifications, never to alter
/// correctness.
pub fn change_key(calls: &[ReconstructedToolCall]) -> String {
    let mut key = String::new();
    for call in calls {
        key.push_str(&call.tool_call_id);
        key.push(':');
        key.push_str(&call.function_name);
        key.push(':');
        key.push_str(&call.arguments.len().to_string());
        key.push(':');
        key.push(if call.completed { '1' } else { '0' });
        key.push(';');
    }
    key
}

/// Key capturing only the structure: tool-call count and function names.
/// Structural changes are never delayed by the cadence policy.
pub fn structural_key(calls: &[ReconstructedToolCall]) -> String {
    let mut key = format!("{}|", calls.len());
    for call in calls {
        key.push_str(&call.function_name);
        key.push(';');
    }
    key
}

/// Cadence gate for downstream reconstruction notifications.
///
/// Always notifies on a structural change (count or any function name);
/// otherwise notifies only when at least the minimum interval has elapsed
/// since the last notification. Bounds re-render frequency under rapid
/// delta bursts without ever delaying structural changes.
#[derive(Debug)]
pub struct NotifyGate {
    min_interval: Duration,
    last_notify: Option<Instant>,
    last_change_key: String,
    last_structural_key: String,
}

impl NotifyGate {
    /// Create a gate with the given minimum interval between non-structural
    /// notifications.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_notify: None,
            last_change_key: String::new(),
            last_structural_key: String::new(),
        }
    }

    /// Decide whether to notify for this reconstruction, and if so record
    /// the notification.
    pub fn should_notify(&mut self, calls: &[ReconstructedToolCall]) -> bool {
        let change = change_key(calls);
        if change == self.last_change_key {
            return false;
        }

        let structural = structural_key(calls);
        let structure_changed = structural != self.last_structural_key;
        let interval_elapsed = match self.last_notify {
            Some(at) => at.elapsed() >= self.min_interval,
            None => true,
        };

        if structure_changed || interval_elapsed {
            self.last_notify = Some(Instant::now());
            self.last_change_key = change;
            self.last_structural_key = structural;
            return true;
        }
        false
    }

    /// Forget gating history, e.g. on session reset.
    pub fn reset(&mut self) {
        self.last_notify = None;
        self.last_change_key.clear();
        self.last_structural_key.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ToolCallDeltaEvent;

    fn delta(id: &str, index: Option<u32>, sequence: u64, fragment: &str) -> ToolCallDeltaEvent {
        ToolCallDeltaEvent {
            tool_call_id: id.to_string(),
            function_name: Some(format!("fn-{id}")),
            index,
            sequence,
            is_delta: true,
            arguments_delta: Some(fragment.to_string()),
            arguments: None,
        }
    }

    fn result(id: &str, output: &str) -> ToolResultEvent {
        ToolResultEvent {
            tool_call_id: id.to_string(),
            function_name: format!("fn-{id}"),
            index: None,
            result: ToolResultPayload {
                success: true,
                output: Some(serde_json::json!(output)),
                error: None,
            },
        }
    }

    #[test]
    fn test_accumulated_call_reconstructed() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(&delta("t1", Some(0), 0, "{\"path\":"));
        acc.apply(&delta("t1", Some(0), 1, "\"/a.txt\"}"));
        let state = ReconstructionState::new();

        let calls = reconstruct_all(&acc, &state);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_call_id, "t1");
        assert_eq!(calls[0].arguments, "{\"path\":\"/a.txt\"}");
        assert!(!calls[0].completed);
        assert!(calls[0].tool_result.is_none());
    }

    #[test]
    fn test_result_marks_completed() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(&delta("t1", Some(0), 0, "{}"));
        let mut state = ReconstructionState::new();
        state.record_result(&result("t1", "ok"));

        let calls = reconstruct_all(&acc, &state);
        assert!(calls[0].completed);
        let payload = calls[0].tool_result.as_ref().unwrap();
        assert_eq!(payload.output, Some(serde_json::json!("ok")));
    }

    #[test]
    fn test_result_before_delta_synthesized() {
        // P4: a result with no prior delta still appears, completed, with
        // the empty-arguments placeholder.
        let acc = DeltaAccumulator::new();
        let mut state = ReconstructionState::new();
        state.record_result(&result("t1", "ok"));

        let calls = reconstruct_all(&acc, &state);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_call_id, "t1");
        assert_eq!(calls[0].arguments, "{}");
        assert!(calls[0].completed);
        assert_eq!(calls[0].function_name, "fn-t1");
    }

    #[test]
    fn test_sorted_by_index_with_discovery_ties() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(&delta("late", Some(2), 0, "a"));
        acc.apply(&delta("early", Some(0), 0, "b"));
        // Same index as "early": discovery order breaks the tie.
        acc.apply(&delta("tied", Some(0), 0, "c"));
        let state = ReconstructionState::new();

        let calls = reconstruct_all(&acc, &state);
        let ids: Vec<&str> = calls.iter().map(|c| c.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "tied", "late"]);
    }

    #[test]
    fn test_missing_index_defaults_to_zero() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(&delta("bare", None, 0, "x"));
        acc.apply(&delta("indexed", Some(1), 0, "y"));
        let state = ReconstructionState::new();

        let calls = reconstruct_all(&acc, &state);
        assert_eq!(calls[0].tool_call_id, "bare");
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[1].tool_call_id, "indexed");
    }

    #[test]
    fn test_reconstruction_is_idempotent() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(&delta("t1", Some(0), 0, "{}"));
        let mut state = ReconstructionState::new();
        state.record_result(&result("t2", "done"));

        let first = reconstruct_all(&acc, &state);
        let second = reconstruct_all(&acc, &state);
        assert_eq!(first, second);
        assert_eq!(change_key(&first), change_key(&second));
    }

    #[test]
    fn test_function_name_falls_back_to_result() {
        let mut acc = DeltaAccumulator::new();
        let mut anonymous = delta("t1", None, 0, "{}");
        anonymous.function_name = None;
        acc.apply(&anonymous);
        let mut state = ReconstructionState::new();
        state.record_result(&result("t1", "ok"));

        let calls = reconstruct_all(&acc, &state);
        assert_eq!(calls[0].function_name, "fn-t1");
    }

    #[test]
    fn test_function_name_unknown_without_any_source() {
        let mut acc = DeltaAccumulator::new();
        let mut anonymous = delta("t1", None, 0, "{}");
        anonymous.function_name = None;
        acc.apply(&anonymous);
        let state = ReconstructionState::new();

        let calls = reconstruct_all(&acc, &state);
        assert_eq!(calls[0].function_name, "unknown");
    }

    #[test]
    fn test_gate_notifies_on_structural_change_immediately() {
        let mut gate = NotifyGate::new(Duration::from_millis(50));
        let mut acc = DeltaAccumulator::new();
        let state = ReconstructionState::new();

        acc.apply(&delta("t1", Some(0), 0, "a"));
        assert!(gate.should_notify(&reconstruct_all(&acc, &state)));

        // New tool call: structural, not delayed even though <50ms elapsed.
        acc.apply(&delta("t2", Some(1), 0, "b"));
        assert!(gate.should_notify(&reconstruct_all(&acc, &state)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_rate_limits_argument_growth() {
        let mut gate = NotifyGate::new(Duration::from_millis(50));
        let mut acc = DeltaAccumulator::new();
        let state = ReconstructionState::new();

        acc.apply(&delta("t1", Some(0), 0, "a"));
        assert!(gate.should_notify(&reconstruct_all(&acc, &state)));

        // Argument-only growth within the interval is suppressed.
        acc.apply(&delta("t1", Some(0), 1, "b"));
        assert!(!gate.should_notify(&reconstruct_all(&acc, &state)));

        // After the interval, the same pending change goes through.
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(gate.should_notify(&reconstruct_all(&acc, &state)));
    }

    #[test]
    fn test_gate_suppresses_unchanged_reconstruction() {
        let mut gate = NotifyGate::new(Duration::from_millis(0));
        let mut acc = DeltaAccumulator::new();
        let state = ReconstructionState::new();
        acc.apply(&delta("t1", Some(0), 0, "a"));

        let calls = reconstruct_all(&acc, &state);
        assert!(gate.should_notify(&calls));
        assert!(!gate.should_notify(&calls));
    }
}
