//! Execution outcome and wire records shared by the dispatcher, the loop driver and the
//! HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    List,
    Detail,
    Create,
    Update,
    Delete,
    Clarify,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::List => "list",
            Intent::Detail => "detail",
            Intent::Create => "create",
            Intent::Update => "update",
            Intent::Delete => "delete",
            Intent::Clarify => "clarify",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingIdentifier,
    MissingTitle,
    MissingUpdates,
    MultipleMatches,
    TaskNotFound,
    UnknownAction,
    NoAction,
}

/// `result` is the backend payload on success, `{code, message}` on failure and
/// `{reason, ...}` when skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub status: ExecutionStatus,
    pub result: Value,
}

impl Execution {
    pub fn success(result: Value) -> Self {
        Self {
            status: ExecutionStatus::Success,
            result,
        }
    }

    pub fn failed(result: Value) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result,
        }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            status: ExecutionStatus::Skipped,
            result: json!({ "reason": reason }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn is_skipped(&self) -> bool {
        self.status == ExecutionStatus::Skipped
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        if !self.is_skipped() {
            return None;
        }
        self.result
            .get("reason")
            .and_then(|reason| serde_json::from_value(reason.clone()).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub intent: Intent,
    pub params: Value,
}

impl ActionRecord {
    pub fn clarify() -> Self {
        Self {
            intent: Intent::Clarify,
            params: json!({}),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// The planner answered.
    Final,
    /// Same action and result twice in a row.
    Repeated,
    /// A successful get/create/update/delete.
    Completed,
    StepLimit,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub session_id: String,
    pub assistant_message: String,
    pub action: ActionRecord,
    pub execution: Execution,
    pub terminal: TerminalReason,
}
