//! Run status state machine values and error classification.
//!
//! Provides [`RunStatus`], the mapping from server-reported agent statuses
//! to terminal run states, and the message classifiers that decide whether
//! a failure is benign, billing-related, or a genuine error.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Status of the tracked agent run.
///
/// Exactly one value is current per session. The last five variants are
/// terminal: once reached, the session is finalized and its reconstruction
/// state is cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No run is being tracked.
    #[default]
    Idle,
    /// A run was requested and its liveness is being verified.
    Connecting,
    /// The stream is open and events are being consumed.
    Streaming,
    /// The run finished successfully.
    Completed,
    /// The run was stopped, either by the user or by the server.
    Stopped,
    /// The server reported the run as failed.
    Failed,
    /// An unexpected transport or protocol error ended the session.
    Error,
    /// The run does not exist or is no longer running.
    AgentNotRunning,
}

impl RunStatus {
    /// Whether this status ends the session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Stopped | Self::Failed | Self::Error | Self::AgentNotRunning
        )
    }

    /// Snake-case name, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::AgentNotRunning => "agent_not_running",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a server-reported agent status string to a terminal [`RunStatus`].
///
/// `"running"` is not a terminal status and must be handled by the caller
/// before mapping; it falls through to [`RunStatus::AgentNotRunning`] here
/// together with every unrecognized value, because a run the server reports
/// under an unknown status cannot be streamed.
pub fn map_agent_status(status: &str) -> RunStatus {
    match status {
        "completed" => RunStatus::Completed,
        "stopped" => RunStatus::Stopped,
        "failed" => RunStatus::Failed,
        "error" => RunStatus::Error,
        _ => RunStatus::AgentNotRunning,
    }
}

/// Phrases that mark a failure as the benign already-finished race.
///
/// Matching is case-insensitive on the whole message.
const NOT_FOUND_PHRASES: &[&str] = &["not found", "404", "does not exist", "not running"];

/// Vocabulary that routes an error or stop message to the billing channel.
const BILLING_PHRASES: &[&str] = &["credit", "balance", "billing", "payment", "subscription"];

/// Whether a failure message describes an expected "run is gone" condition.
///
/// These resolve silently to [`RunStatus::AgentNotRunning`] and never reach
/// the generic error reporter.
pub fn is_expected_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    NOT_FOUND_PHRASES.iter().any(|p| lower.contains(p))
}

/// Whether a message matches the credit/balance/billing vocabulary.
pub fn is_billing_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    BILLING_PHRASES.iter().any(|p| lower.contains(p))
}

static BALANCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    // The server phrases exhausted-credit stops as "... balance is <n> credits".
    Regex::new(r"balance is (-?\d+) credits").unwrap_or_else(|e| panic!("invalid balance regex: {e}"))
});

/// Extract the numeric balance from a billing message, when present.
pub fn extract_billing_balance(message: &str) -> Option<i64> {
    BALANCE_RE
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Structured payload for the billing-alert side channel.
///
/// Emitted to the observer instead of the generic error path when a run is
/// halted over credits; the consuming surface decides how to render it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingAlert {
    /// Always `true`; distinguishes the payload from a plain error string.
    pub is_alert: bool,
    /// Short headline for the alert surface.
    pub alert_title: String,
    /// Detail line, carrying the balance when one was extracted.
    pub alert_subtitle: String,
    /// Balance parsed out of the message, if the server included one.
    pub balance: Option<i64>,
}

impl BillingAlert {
    /// Build the alert payload from a billing-classified message.
    pub fn from_message(message: &str) -> Self {
        let balance = extract_billing_balance(message);
        let alert_subtitle = match balance {
            Some(balance) => {
                format!("Your balance is {balance} credits. Upgrade your plan to continue.")
            }
            None => message.to_string(),
        };
        Self {
            is_alert: true,
            alert_title: "Your agent ran out of credits".to_string(),
            alert_subtitle,
            balance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert!(RunStatus::AgentNotRunning.is_terminal());
        assert!(!RunStatus::Idle.is_terminal());
        assert!(!RunStatus::Connecting.is_terminal());
        assert!(!RunStatus::Streaming.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&RunStatus::AgentNotRunning).unwrap(),
            "\"agent_not_running\""
        );
        assert_eq!(
            serde_json::to_string(&RunStatus::Streaming).unwrap(),
            "\"streaming\""
        );
    }

    #[test]
    fn test_status_display_matches_as_str() {
        assert_eq!(RunStatus::Connecting.to_string(), "connecting");
        assert_eq!(RunStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_map_agent_status_terminal() {
        assert_eq!(map_agent_status("completed"), RunStatus::Completed);
        assert_eq!(map_agent_status("stopped"), RunStatus::Stopped);
        assert_eq!(map_agent_status("failed"), RunStatus::Failed);
        assert_eq!(map_agent_status("error"), RunStatus::Error);
    }

    #[test]
    fn test_map_agent_status_unknown() {
        assert_eq!(map_agent_status("queued"), RunStatus::AgentNotRunning);
        assert_eq!(map_agent_status(""), RunStatus::AgentNotRunning);
        // "running" is not terminal; callers must branch on it first.
        assert_eq!(map_agent_status("running"), RunStatus::AgentNotRunning);
    }

    #[test]
    fn test_expected_not_found_phrases() {
        assert!(is_expected_not_found("Agent run not found"));
        assert!(is_expected_not_found("HTTP 404"));
        assert!(is_expected_not_found("run r1 does not exist"));
        assert!(is_expected_not_found("agent is NOT RUNNING"));
        assert!(!is_expected_not_found("connection reset by peer"));
    }

    #[test]
    fn test_billing_vocabulary() {
        assert!(is_billing_message("Insufficient credits: balance is -5 credits"));
        assert!(is_billing_message("Billing limit reached"));
        assert!(is_billing_message("payment required"));
        assert!(!is_billing_message("internal server error"));
    }

    #[test]
    fn test_extract_balance_negative() {
        assert_eq!(
            extract_billing_balance("Insufficient credits: balance is -5 credits"),
            Some(-5)
        );
    }

    #[test]
    fn test_extract_balance_positive() {
        assert_eq!(extract_billing_balance("balance is 120 credits"), Some(120));
    }

    #[test]
    fn test_extract_balance_absent() {
        assert_eq!(extract_billing_balance("You are out of credits"), None);
    }

    #[test]
    fn test_billing_alert_with_balance() {
        let alert = BillingAlert::from_message("Insufficient credits: balance is -5 credits");
        assert!(alert.is_alert);
        assert!(alert.alert_title.contains("ran out of credits"));
        assert!(alert.alert_subtitle.contains("-5"));
        assert_eq!(alert.balance, Some(-5));
    }

    #[test]
    fn test_billing_alert_without_balance() {
        let alert = BillingAlert::from_message("Billing hold on this account");
        assert!(alert.is_alert);
        assert_eq!(alert.balance, None);
        assert_eq!(alert.alert_subtitle, "Billing hold on this account");
    }
}
