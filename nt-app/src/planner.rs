//! Planning capability: one think/act proposal per call.

use crate::normalize::clean_text;
use crate::outcome::Intent;
use async_trait::async_trait;
use nt_llm::{ChatMessage, LlmClient};
use serde_json::Value;
use std::time::Instant;

pub const FALLBACK_ANSWER: &str = "Sorry, I couldn't understand your request, please rephrase.";

/// Closed set of step kinds. Unrecognized names become `Clarify`, which dispatches as
/// a skipped step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanAction {
    List,
    Get,
    Create,
    Update,
    Delete,
    Final,
    Clarify,
}

impl PlanAction {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "list" | "list_tasks" => PlanAction::List,
            "get" | "get_task" | "detail" => PlanAction::Get,
            "create" | "create_task" => PlanAction::Create,
            "update" | "update_task" => PlanAction::Update,
            "delete" | "delete_task" => PlanAction::Delete,
            "final" => PlanAction::Final,
            _ => PlanAction::Clarify,
        }
    }

    pub fn tool_name(self) -> &'static str {
        match self {
            PlanAction::List => "list_tasks",
            PlanAction::Get => "get_task",
            PlanAction::Create => "create_task",
            PlanAction::Update => "update_task",
            PlanAction::Delete => "delete_task",
            PlanAction::Final => "final",
            PlanAction::Clarify => "clarify",
        }
    }

    pub fn intent(self) -> Intent {
        match self {
            PlanAction::List => Intent::List,
            PlanAction::Get => Intent::Detail,
            PlanAction::Create => Intent::Create,
            PlanAction::Update => Intent::Update,
            PlanAction::Delete => Intent::Delete,
            PlanAction::Final | PlanAction::Clarify => Intent::Clarify,
        }
    }

    /// Successful steps of these kinds end the turn.
    pub fn is_conversational_endpoint(self) -> bool {
        matches!(
            self,
            PlanAction::Get | PlanAction::Create | PlanAction::Update | PlanAction::Delete
        )
    }

    pub fn invalidates_listing(self) -> bool {
        matches!(
            self,
            PlanAction::Create | PlanAction::Update | PlanAction::Delete
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanProposal {
    pub thought: String,
    pub action: PlanAction,
    pub action_input: Value,
    pub final_answer: String,
}

impl PlanProposal {
    pub fn fallback() -> Self {
        Self {
            thought: String::new(),
            action: PlanAction::Final,
            action_input: Value::Object(Default::default()),
            final_answer: FALLBACK_ANSWER.to_string(),
        }
    }

    pub fn final_answer(text: impl Into<String>) -> Self {
        Self {
            final_answer: text.into(),
            ..Self::fallback()
        }
    }

    pub fn step(action: PlanAction, action_input: Value) -> Self {
        Self {
            thought: String::new(),
            action,
            action_input,
            final_answer: String::new(),
        }
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = thought.into();
        self
    }

    /// Lenient decode of the response contract. Only a JSON object is required; a
    /// missing action means `final`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let action = object
            .get("action")
            .and_then(Value::as_str)
            .map(PlanAction::parse)
            .unwrap_or(PlanAction::Final);
        Some(Self {
            thought: object.get("thought").and_then(clean_text).unwrap_or_default(),
            action,
            action_input: object
                .get("action_input")
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default())),
            final_answer: object.get("final").and_then(clean_text).unwrap_or_default(),
        })
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Never fails: implementations return [`PlanProposal::fallback`] instead.
    async fn plan(&self, context: &str, scratchpad: &str) -> PlanProposal;
}

pub struct LlmPlanner {
    client: LlmClient,
    max_retries: usize,
}

impl LlmPlanner {
    pub fn new(client: LlmClient, max_retries: usize) -> Self {
        Self {
            client,
            max_retries,
        }
    }

    fn messages(context: &str, scratchpad: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "{RESPONSE_CONTRACT}\n\nConversation:\n{context}\n\nPrevious thoughts and observations:\n{scratchpad}\n"
            )),
        ]
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.client.model()))]
    async fn plan(&self, context: &str, scratchpad: &str) -> PlanProposal {
        let messages = Self::messages(context, scratchpad);
        for attempt in 0..=self.max_retries {
            let started = Instant::now();
            let response = match self.client.chat(&messages, true).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(%error, attempt, "planner call failed");
                    return PlanProposal::fallback();
                }
            };
            tracing::debug!(
                attempt,
                latency_ms = started.elapsed().as_millis() as u64,
                prompt_tokens = response.usage.prompt_tokens,
                completion_tokens = response.usage.completion_tokens,
                "planner responded"
            );
            match extract_json_object(&response.message.content)
                .as_ref()
                .and_then(PlanProposal::from_value)
            {
                Some(proposal) => return proposal,
                None => tracing::warn!(
                    attempt,
                    content_len = response.message.content.len(),
                    "planner returned no usable JSON object"
                ),
            }
        }
        PlanProposal::fallback()
    }
}

/// First balanced `{...}` in `text` that parses as JSON. Code fences and prose around
/// the object are ignored.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&text[start..]) {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..start + end]) {
                if value.is_object() {
                    return Some(value);
                }
            }
        }
        search_from = start + 1;
    }
    None
}

fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(index + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

const SYSTEM_PROMPT: &str = r#"You are the NexusTodo conversational task assistant. You work in a ReAct loop (thought -> action -> observation).
Reply with a single JSON object and nothing else.
`action` must be one of: list_tasks | get_task | create_task | update_task | delete_task | final.
When information is missing, use list_tasks or get_task to gather it.
When the user wants to delete or update and the filter is clear, call delete_task/update_task directly; only use list_tasks to narrow down candidates when the target is unclear.
Write operations need no second confirmation.
`status` may only be one of: 待办 (todo), 进行中 (in-progress), 已完成 (done), 已延期 (deferred), 已取消 (cancelled).
"unfinished" / "not done" / "open" tasks: set action_input.query.status_list to ["待办","进行中","已延期"].
"finish" / "done" / "mark as complete": update_task with action_input.status = "已完成".
"cancel" / "drop" / "abandon": update_task with action_input.status = "已取消".
"postpone" / "defer": update_task with action_input.status = "已延期".
"start" / "working on": update_task with action_input.status = "进行中".
"rename": update_task with action_input.title = the new title and action_input.query.keyword = the old title (without a trailing "task").
"tag as X" / "add tag X": put X into action_input.tags.
"delete" / "remove" / "clear" / "clean up": delete_task.
If list_tasks was only used to locate the target of an update or delete, continue with update_task/delete_task in the next step instead of finishing.
taskId must be a UUID; leave it empty when unsure.
"these" / "the ones above" / "the tasks you just listed": give their ordinals in action_input.selection_indices.
"all" / "every" / "bulk": set action_input.bulk to true.
"containing X" / "with X in the title": put X into action_input.query.keyword.
When the user picks a candidate by number ("delete 3", "pick 2"), set action_input.selection_index to that number."#;

const RESPONSE_CONTRACT: &str = r#"Return JSON:
{
  "thought": "short reasoning",
  "action": "list_tasks|get_task|create_task|update_task|delete_task|final",
  "action_input": {
    "taskId": "string?",
    "taskIds": ["string"],
    "title": "string?",
    "description": "string?",
    "status": "待办|进行中|已完成|已延期|已取消?",
    "tags": ["string"],
    "bulk": true,
    "selection_index": 1,
    "selection_indices": [1, 2],
    "query": {"status": "string?", "status_list": ["string"], "tags": ["string"], "keyword": "string?"}
  },
  "final": "reply to the user when action = final"
}"#;
