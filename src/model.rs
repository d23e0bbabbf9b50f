use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Log stage used by the legacy clarification protocol: a log entry with this
/// stage carries the remote question as its message.
pub const REPROMPT_STAGE: &str = "reprompt";

/// Log stage for client-side error markers appended on poll failure.
pub const ERROR_STAGE: &str = "error";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub user_agent: String,
    pub clarification_mode: ClarificationMode,
}

/// How the client decides that the remote run is waiting on the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ClarificationMode {
    /// Explicit protocol: `status == needs_input` plus a `pending_question` field.
    StatusField,
    /// Legacy protocol: scan newly arrived log entries for the reprompt marker stage.
    LogMarker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    // Older backends report "queued" before the pipeline picks the run up.
    #[serde(alias = "queued")]
    Running,
    NeedsInput,
    Success,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Error)
    }

    /// Human-readable label for status lines.
    pub fn label(self) -> &'static str {
        match self {
            RunStatus::Idle => "Idle",
            RunStatus::Running => "Running...",
            RunStatus::NeedsInput => "Waiting for input",
            RunStatus::Success => "Success",
            RunStatus::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub stage: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl LogEntry {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub action: String,
    pub message: String,
}

/// Structured output reported by the remote run once it finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub final_message: String,
    #[serde(default)]
    pub actions: Vec<ActionItem>,
}

/// Full status payload returned by one status fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: RunStatus,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub pending_question: Option<String>,
    #[serde(default)]
    pub result: Option<RunResult>,
}

/// Response to a run submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAccepted {
    pub run_id: String,
}

/// Acknowledgement for a delivered clarification answer. Advisory only; the
/// client resumes regardless of its content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepromptAck {
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Final record of one run, serialized for `--json` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(default)]
    pub timestamp_utc: String,
    pub base_url: String,
    pub run_id: String,
    pub prompt: String,
    pub status: RunStatus,
    pub logs: Vec<LogEntry>,
    pub result: Option<RunResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        run_id: String,
    },
    StatusChanged {
        status: RunStatus,
    },
    LogAppended {
        entry: LogEntry,
    },
    /// The remote run is paused and wants an answer to `question`. Emitted at
    /// most once per distinct outstanding question.
    ClarificationRequested {
        question: String,
    },
    Info(InfoEvent),
    RunCompleted {
        // Box to keep RunEvent size small; RunReport carries the full log.
        report: Box<RunReport>,
    },
}

/// Structured info events emitted by the controller and consumed by UI/CLI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    AnswerSent { run_id: String },
    AnswerDeliveryFailed { message: String },
    AnswerSkipped,
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::AnswerSent { run_id } => {
                format!("Answer delivered for run {}", run_id)
            }
            // The message already names the phase (RunError display).
            InfoEvent::AnswerDeliveryFailed { message } => message.clone(),
            InfoEvent::AnswerSkipped => "Empty answer, nothing sent".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_snapshot_decodes_wire_payload() {
        let snap: StatusSnapshot = serde_json::from_str(
            r#"{
                "status": "running",
                "logs": [{"stage": "plan", "message": "thinking"}],
                "pending_question": null,
                "result": null
            }"#,
        )
        .unwrap();
        assert_eq!(snap.status, RunStatus::Running);
        assert_eq!(snap.logs.len(), 1);
        assert_eq!(snap.logs[0].stage, "plan");
        assert!(snap.pending_question.is_none());
        assert!(snap.result.is_none());
    }

    #[test]
    fn queued_status_is_treated_as_running() {
        let snap: StatusSnapshot =
            serde_json::from_str(r#"{"status": "queued", "logs": []}"#).unwrap();
        assert_eq!(snap.status, RunStatus::Running);
    }

    #[test]
    fn snapshot_fields_default_when_absent() {
        let snap: StatusSnapshot = serde_json::from_str(r#"{"status": "success"}"#).unwrap();
        assert!(snap.logs.is_empty());
        assert!(snap.result.is_none());
    }

    #[test]
    fn result_decodes_with_ordered_actions() {
        let snap: StatusSnapshot = serde_json::from_str(
            r#"{
                "status": "success",
                "logs": [],
                "result": {
                    "final_message": "Done",
                    "actions": [
                        {"action": "click", "message": "Submit button"},
                        {"action": "type", "message": "email field"}
                    ]
                }
            }"#,
        )
        .unwrap();
        let result = snap.result.unwrap();
        assert_eq!(result.final_message, "Done");
        assert_eq!(result.actions[0].action, "click");
        assert_eq!(result.actions[1].action, "type");
    }

    #[test]
    fn reprompt_ack_tolerates_empty_body() {
        let ack: RepromptAck = serde_json::from_str("{}").unwrap();
        assert!(!ack.acknowledged);
        assert!(ack.message.is_none());
    }

    #[test]
    fn log_entry_keeps_optional_timestamp() {
        let entry: LogEntry = serde_json::from_str(
            r#"{"stage": "queued", "message": "Run submitted", "timestamp": "2025-01-01T00:00:00"}"#,
        )
        .unwrap();
        assert_eq!(entry.timestamp.as_deref(), Some("2025-01-01T00:00:00"));
    }
}
