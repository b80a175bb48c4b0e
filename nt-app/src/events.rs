use crate::outcome::{Execution, Intent};
use serde_json::{Value, json};

pub const CODE_INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Progress of one turn, in emission order. A stream always ends with exactly one
/// `Done` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Delta {
        session_id: String,
        content: String,
    },
    Action {
        step: usize,
        action: &'static str,
        intent: Intent,
        input: Value,
    },
    Execution(Execution),
    Done {
        session_id: String,
        assistant_message: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl AgentEvent {
    pub fn internal_error(message: impl Into<String>) -> Self {
        AgentEvent::Error {
            code: CODE_INTERNAL_ERROR.to_string(),
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Delta { .. } => "delta",
            AgentEvent::Action { .. } => "action",
            AgentEvent::Execution(_) => "execution",
            AgentEvent::Done { .. } => "done",
            AgentEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Done { .. } | AgentEvent::Error { .. })
    }

    /// JSON payload for the wire.
    pub fn data(&self) -> Value {
        match self {
            AgentEvent::Delta {
                session_id,
                content,
            } => json!({ "sessionId": session_id, "content": content }),
            AgentEvent::Action {
                step,
                action,
                intent,
                input,
            } => json!({ "step": step, "action": action, "intent": intent, "input": input }),
            AgentEvent::Execution(execution) => json!(execution),
            AgentEvent::Done {
                session_id,
                assistant_message,
            } => json!({ "sessionId": session_id, "assistantMessage": assistant_message }),
            AgentEvent::Error { code, message } => json!({ "code": code, "message": message }),
        }
    }
}
