//! Loop driver: plan, normalize, resolve, dispatch, observe, repeat.
//!
//! One call to [`AssistantAgent::run_turn`] handles one conversational turn. Session
//! state is re-read from the store at every step and never cached across an await.

use crate::config::LoopConfig;
use crate::dispatcher::{Dispatcher, DisplayLimits};
use crate::events::AgentEvent;
use crate::normalize::normalize_action_input;
use crate::outcome::{ActionRecord, Execution, SkipReason, TerminalReason, TurnResult};
use crate::planner::{PlanAction, Planner};
use crate::resolver::apply_selection;
use crate::session::SessionStore;
use anyhow::Result;
use nt_llm::{ChatMessage, Role};
use nt_tasks::{Task, TaskBackend};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const CONCLUSION_DEFAULT: &str = "Done.";
const CONCLUSION_STEP_LIMIT: &str = "step limit reached.";

pub struct AssistantAgent {
    planner: Arc<dyn Planner>,
    sessions: Arc<SessionStore>,
    max_steps: usize,
    limits: DisplayLimits,
}

impl AssistantAgent {
    pub fn new(planner: Arc<dyn Planner>, sessions: Arc<SessionStore>, cfg: &LoopConfig) -> Self {
        Self {
            planner,
            sessions,
            max_steps: cfg.react_max_steps.max(1),
            limits: DisplayLimits {
                display_cap: cfg.display_cap,
                clarify_cap: cfg.clarify_cap,
            },
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Runs the turn to completion and returns its result.
    pub async fn run_turn(
        &self,
        backend: &dyn TaskBackend,
        session_id: Option<&str>,
        messages: Vec<ChatMessage>,
    ) -> Result<TurnResult> {
        self.drive(backend, session_id, messages, None).await
    }

    /// Runs the turn on a spawned task and returns its event stream. The task runs to
    /// completion even if the receiver is dropped early.
    pub fn run_turn_streaming(
        self: &Arc<Self>,
        backend: Arc<dyn TaskBackend>,
        session_id: Option<String>,
        messages: Vec<ChatMessage>,
    ) -> UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = Arc::clone(self);
        let fault_tx = tx.clone();
        let turn = tokio::spawn(async move {
            let result = agent
                .drive(backend.as_ref(), session_id.as_deref(), messages, Some(&tx))
                .await;
            if let Err(error) = result {
                tracing::error!(error = %error, "assistant turn failed");
                let _ = tx.send(AgentEvent::internal_error(error.to_string()));
            }
        });
        tokio::spawn(async move {
            if let Err(join_error) = turn.await {
                tracing::error!(error = %join_error, "assistant turn task aborted");
                let _ = fault_tx.send(AgentEvent::internal_error(join_error.to_string()));
            }
        });
        rx
    }

    #[tracing::instrument(level = "info", skip_all, fields(session_id = tracing::field::Empty))]
    async fn drive(
        &self,
        backend: &dyn TaskBackend,
        session_id: Option<&str>,
        messages: Vec<ChatMessage>,
        emit: Option<&UnboundedSender<AgentEvent>>,
    ) -> Result<TurnResult> {
        if messages.is_empty() {
            return Err(anyhow::anyhow!("a turn needs at least one message"));
        }
        let turn_started = Instant::now();
        let session_id = self.sessions.get_or_create(session_id).id;
        tracing::Span::current().record("session_id", session_id.as_str());

        let incoming = messages.len();
        if incoming > 1 {
            self.sessions.replace_messages(&session_id, messages);
        } else {
            self.sessions.append_messages(&session_id, messages);
        }

        let context = self.build_context(&session_id);
        tracing::info!(
            incoming_messages = incoming,
            context_len = context.len(),
            max_steps = self.max_steps,
            "assistant turn started"
        );

        let emitter = Emitter {
            tx: emit,
            session_id: &session_id,
        };
        let dispatcher = Dispatcher::new(backend, &self.sessions, &session_id, self.limits);
        let mut scratchpad = String::new();
        let mut trace: Vec<String> = Vec::new();
        let mut last_execution = Execution::skipped(SkipReason::NoAction);
        let mut last_action = ActionRecord::clarify();
        let mut last_action_key = String::new();
        let mut last_result_key = String::new();

        for step in 1..=self.max_steps {
            let plan_started = Instant::now();
            let proposal = self.planner.plan(&context, &scratchpad).await;
            let action = proposal.action;
            tracing::info!(
                step,
                action = action.tool_name(),
                latency_ms = plan_started.elapsed().as_millis() as u64,
                "planner proposed step"
            );

            let params = normalize_action_input(action, &proposal.action_input);
            let (_, pending) = self.sessions.pending(&session_id);
            let recent = self.sessions.recent(&session_id);
            let params = apply_selection(params, &pending, &recent);

            let thought = proposal.thought.trim();
            if !thought.is_empty() {
                let line = format!("Thought({step}): {thought}");
                emitter.delta(&line);
                trace.push(line);
            }

            if action == PlanAction::Final {
                let final_text = non_empty(&proposal.final_answer).unwrap_or(CONCLUSION_DEFAULT);
                let assistant_message = self.conclude(&emitter, &mut trace, final_text);
                return Ok(self.finish(
                    session_id.clone(),
                    assistant_message,
                    last_action,
                    last_execution,
                    TerminalReason::Final,
                    turn_started,
                ));
            }

            let input = serde_json::to_value(&params)?;
            emitter.send(AgentEvent::Action {
                step,
                action: action.tool_name(),
                intent: action.intent(),
                input: input.clone(),
            });

            let outcome = dispatcher.dispatch(action, &params).await;
            trace.push(format!("Action({step}): {}", action.tool_name()));
            trace.push(format!("Observation({step}): {}", outcome.observation));
            emitter.send(AgentEvent::Execution(outcome.execution.clone()));
            emitter.delta(&format!("Observation({step}): {}", outcome.observation));

            if !outcome.execution.is_skipped() {
                self.sessions.clear_pending(&session_id);
                if let Some(listing) = outcome.listing.as_ref() {
                    let shown: Vec<Task> =
                        listing.iter().take(self.limits.display_cap).cloned().collect();
                    self.sessions.set_recent(&session_id, shown);
                }
                if action.invalidates_listing() {
                    self.sessions.clear_recent(&session_id);
                }
            }

            last_execution = outcome.execution;
            last_action = outcome.action;
            let input_json = serde_json::to_string(&input)?;
            let action_key = format!("{}:{input_json}", action.tool_name());
            let result_key = serde_json::to_string(&last_execution.result)?;

            let terminal = if last_execution.is_success()
                && action_key == last_action_key
                && result_key == last_result_key
            {
                Some(TerminalReason::Repeated)
            } else if last_execution.is_success() && action.is_conversational_endpoint() {
                Some(TerminalReason::Completed)
            } else {
                None
            };
            if let Some(reason) = terminal {
                let conclusion = non_empty(&outcome.assistant_message).unwrap_or(CONCLUSION_DEFAULT);
                let assistant_message = self.conclude(&emitter, &mut trace, conclusion);
                return Ok(self.finish(
                    session_id.clone(),
                    assistant_message,
                    last_action,
                    last_execution,
                    reason,
                    turn_started,
                ));
            }

            scratchpad.push_str(&format!(
                "Thought: {thought}\nAction: {}\nAction Input: {input_json}\nObservation: {result_key}\n\n",
                action.tool_name(),
            ));
            last_action_key = action_key;
            last_result_key = result_key;
        }

        tracing::warn!(max_steps = self.max_steps, "assistant step limit reached");
        let assistant_message = self.conclude(&emitter, &mut trace, CONCLUSION_STEP_LIMIT);
        Ok(self.finish(
            session_id.clone(),
            assistant_message,
            last_action,
            last_execution,
            TerminalReason::StepLimit,
            turn_started,
        ))
    }

    /// Transcript lines, preceded by the pending candidates (or, when nothing is
    /// pending, the most recent listing) so ordinals can be grounded.
    fn build_context(&self, session_id: &str) -> String {
        let mut lines: Vec<String> = Vec::new();
        let (pending_intent, pending) = self.sessions.pending(session_id);
        if !pending.is_empty() {
            lines.push(
                "system: Pending candidate tasks (select by ordinal or taskId):".to_string(),
            );
            lines.push(format!(
                "system: Pending intent: {}",
                pending_intent.map(|i| i.as_str()).unwrap_or("unknown")
            ));
            lines.extend(self.candidate_lines(&pending));
        } else {
            let recent = self.sessions.recent(session_id);
            if !recent.is_empty() {
                lines.push(
                    "system: Most recent task list (select or filter by ordinal):".to_string(),
                );
                lines.extend(self.candidate_lines(&recent));
            }
        }
        lines.extend(
            self.sessions
                .messages(session_id)
                .iter()
                .map(|m| format!("{}: {}", role_label(m.role), m.content)),
        );
        lines.join("\n")
    }

    fn candidate_lines<'t>(&self, tasks: &'t [Task]) -> impl Iterator<Item = String> + 't {
        tasks
            .iter()
            .take(self.limits.display_cap)
            .enumerate()
            .map(|(idx, task)| {
                let title = non_empty(&task.title).unwrap_or("(untitled)");
                let tags = if task.tags.is_empty() {
                    "no tags".to_string()
                } else {
                    format!("tags: {}", task.tags.join(", "))
                };
                format!(
                    "system: {}. {title} ({}, {tags}, id: {})",
                    idx + 1,
                    task.status,
                    task.task_id
                )
            })
    }

    fn conclude(&self, emitter: &Emitter<'_>, trace: &mut Vec<String>, text: &str) -> String {
        let line = format!("Conclusion: {text}");
        emitter.delta(&line);
        trace.push(line);
        let assistant_message = trace.join("\n");
        self.sessions.append_messages(
            emitter.session_id,
            vec![ChatMessage::assistant(assistant_message.clone())],
        );
        emitter.send(AgentEvent::Done {
            session_id: emitter.session_id.to_string(),
            assistant_message: assistant_message.clone(),
        });
        assistant_message
    }

    fn finish(
        &self,
        session_id: String,
        assistant_message: String,
        action: ActionRecord,
        execution: Execution,
        terminal: TerminalReason,
        started: Instant,
    ) -> TurnResult {
        tracing::info!(
            terminal = ?terminal,
            status = ?execution.status,
            latency_ms = started.elapsed().as_millis() as u64,
            "assistant turn completed"
        );
        TurnResult {
            session_id,
            assistant_message,
            action,
            execution,
            terminal,
        }
    }
}

/// Optional event sink bound to one session. Send errors mean the consumer left.
struct Emitter<'a> {
    tx: Option<&'a UnboundedSender<AgentEvent>>,
    session_id: &'a str,
}

impl Emitter<'_> {
    fn send(&self, event: AgentEvent) {
        if let Some(tx) = self.tx {
            let _ = tx.send(event);
        }
    }

    fn delta(&self, line: &str) {
        self.send(AgentEvent::Delta {
            session_id: self.session_id.to_string(),
            content: format!("{line}\n"),
        });
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn non_empty(text: &str) -> Option<&str> {
    let text = text.trim();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{ExecutionStatus, Intent};
    use crate::planner::PlanProposal;
    use async_trait::async_trait;
    use nt_tasks::{InMemoryTaskBackend, TaskStatus};
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Replays canned proposals and records what it was asked.
    struct ScriptedPlanner {
        script: Mutex<VecDeque<PlanProposal>>,
        calls: Mutex<Vec<(String, String)>>,
        repeat_last: Option<PlanProposal>,
    }

    impl ScriptedPlanner {
        fn new(script: Vec<PlanProposal>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                repeat_last: None,
            })
        }

        fn forever(proposal: PlanProposal) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                repeat_last: Some(proposal),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().expect("calls lock").len()
        }

        fn contexts(&self) -> Vec<String> {
            self.calls
                .lock()
                .expect("calls lock")
                .iter()
                .map(|(context, _)| context.clone())
                .collect()
        }

        fn scratchpads(&self) -> Vec<String> {
            self.calls
                .lock()
                .expect("calls lock")
                .iter()
                .map(|(_, scratchpad)| scratchpad.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn plan(&self, context: &str, scratchpad: &str) -> PlanProposal {
            self.calls
                .lock()
                .expect("calls lock")
                .push((context.to_string(), scratchpad.to_string()));
            let next = self.script.lock().expect("script lock").pop_front();
            next.or_else(|| self.repeat_last.clone())
                .unwrap_or_else(|| PlanProposal::final_answer("script exhausted"))
        }
    }

    fn agent(planner: Arc<ScriptedPlanner>, max_steps: usize) -> Arc<AssistantAgent> {
        let cfg = LoopConfig {
            react_max_steps: max_steps,
            ..LoopConfig::default()
        };
        Arc::new(AssistantAgent::new(
            planner,
            Arc::new(SessionStore::new(cfg.max_session_messages)),
            &cfg,
        ))
    }

    fn task(title: &str) -> Task {
        Task::new(Uuid::new_v4().to_string(), title)
    }

    fn step(action: PlanAction, input: Value) -> PlanProposal {
        PlanProposal::step(action, input)
    }

    fn say(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::user(text)]
    }

    #[tokio::test]
    async fn repeated_identical_step_stops_without_third_call() {
        let backend = InMemoryTaskBackend::with_tasks(vec![task("write report"), task("walk dog")]);
        let list = step(PlanAction::List, json!({ "query": { "keyword": "report" } }));
        let planner = ScriptedPlanner::new(vec![
            list.clone(),
            list,
            PlanProposal::final_answer("should not be reached"),
        ]);
        let agent = agent(planner.clone(), 10);

        let turn = agent
            .run_turn(&backend, None, say("show report tasks"))
            .await
            .expect("turn");
        assert_eq!(planner.call_count(), 2);
        assert_eq!(turn.terminal, TerminalReason::Repeated);
        assert_eq!(turn.execution.status, ExecutionStatus::Success);
        assert!(turn.assistant_message.ends_with("Conclusion: Found these tasks:\n1. write report (待办)"));
        assert_eq!(turn.action.intent, Intent::List);
    }

    #[tokio::test]
    async fn unfinished_tasks_scenario() {
        let backend = InMemoryTaskBackend::with_tasks(vec![
            task("write report"),
            task("review pr").with_status(TaskStatus::InProgress),
            task("old idea").with_status(TaskStatus::Deferred),
            task("shipped").with_status(TaskStatus::Done),
            task("dropped").with_status(TaskStatus::Cancelled),
        ]);
        let planner = ScriptedPlanner::new(vec![
            step(
                PlanAction::List,
                json!({ "query": { "status_list": ["待办", "进行中", "已延期"] } }),
            )
            .with_thought("the user wants unfinished tasks"),
            PlanProposal::final_answer("You have 3 unfinished tasks: write report, review pr, old idea."),
        ]);
        let agent = agent(planner.clone(), 10);

        let turn = agent
            .run_turn(&backend, Some("s-1"), say("list my unfinished tasks"))
            .await
            .expect("turn");
        assert_eq!(backend.list_calls(), 3);
        assert_eq!(planner.call_count(), 2);
        assert_eq!(turn.terminal, TerminalReason::Final);
        assert_eq!(turn.session_id, "s-1");
        assert_eq!(turn.execution.result.as_array().map(Vec::len), Some(3));
        let expected = "Thought(1): the user wants unfinished tasks\n\
                        Action(1): list_tasks\n\
                        Observation(1): Found tasks: write report, review pr, old idea\n\
                        Conclusion: You have 3 unfinished tasks: write report, review pr, old idea.";
        assert_eq!(turn.assistant_message, expected);

        let scratchpad = &planner.scratchpads()[1];
        assert!(scratchpad.starts_with("Thought: the user wants unfinished tasks\nAction: list_tasks\n"));
        assert_eq!(agent.sessions().recent("s-1").len(), 3);

        let messages = agent.sessions().messages("s-1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, expected);
    }

    #[tokio::test]
    async fn step_limit_is_reported() {
        let backend = InMemoryTaskBackend::new();
        let planner = ScriptedPlanner::forever(step(PlanAction::Get, json!({})));
        let agent = agent(planner.clone(), 3);

        let turn = agent.run_turn(&backend, None, say("show it")).await.expect("turn");
        assert_eq!(planner.call_count(), 3);
        assert_eq!(turn.terminal, TerminalReason::StepLimit);
        assert_eq!(turn.execution.skip_reason(), Some(SkipReason::MissingIdentifier));
        assert!(turn.assistant_message.ends_with("Conclusion: step limit reached."));
        assert_eq!(backend.list_calls(), 0);
    }

    #[tokio::test]
    async fn planner_failure_finishes_with_apology() {
        let backend = InMemoryTaskBackend::new();
        let planner = ScriptedPlanner::new(vec![PlanProposal::fallback()]);
        let agent = agent(planner, 10);

        let turn = agent.run_turn(&backend, None, say("???")).await.expect("turn");
        assert_eq!(turn.terminal, TerminalReason::Final);
        assert_eq!(
            turn.assistant_message,
            format!("Conclusion: {}", crate::planner::FALLBACK_ANSWER)
        );
        assert_eq!(turn.execution.skip_reason(), Some(SkipReason::NoAction));
        assert_eq!(turn.action.intent, Intent::Clarify);
    }

    #[tokio::test]
    async fn successful_mutation_ends_the_turn() {
        let backend = InMemoryTaskBackend::new();
        let planner = ScriptedPlanner::new(vec![step(
            PlanAction::Create,
            json!({ "title": "Buy milk", "tags": "home" }),
        )]);
        let agent = agent(planner.clone(), 10);

        let turn = agent
            .run_turn(&backend, None, say("add buy milk"))
            .await
            .expect("turn");
        assert_eq!(planner.call_count(), 1);
        assert_eq!(turn.terminal, TerminalReason::Completed);
        assert_eq!(turn.action.intent, Intent::Create);
        assert!(turn.assistant_message.ends_with("Conclusion: Created task: Buy milk (status: 待办, tags: home)."));
        assert_eq!(backend.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn clarification_then_ordinal_selection() {
        let first = task("weekly report");
        let second = task("monthly report");
        let backend = InMemoryTaskBackend::with_tasks(vec![first.clone(), second.clone()]);
        let planner = ScriptedPlanner::new(vec![
            step(PlanAction::Get, json!({ "title": "report" })),
            PlanProposal::final_answer("Which report do you mean?"),
            step(PlanAction::Delete, json!({ "selection_index": 2 })),
        ]);
        let agent = agent(planner.clone(), 10);

        let turn = agent
            .run_turn(&backend, Some("s"), say("show the report"))
            .await
            .expect("first turn");
        assert_eq!(turn.terminal, TerminalReason::Final);
        assert_eq!(turn.execution.skip_reason(), Some(SkipReason::MultipleMatches));
        let (intent, pending) = agent.sessions().pending("s");
        assert_eq!(intent, Some(Intent::Detail));
        assert_eq!(pending.len(), 2);

        let turn = agent
            .run_turn(&backend, Some("s"), say("delete the second one"))
            .await
            .expect("second turn");
        assert_eq!(turn.terminal, TerminalReason::Completed);
        assert_eq!(turn.action.params["taskId"], json!(second.task_id));
        assert_eq!(backend.snapshot().await, vec![first]);
        assert!(agent.sessions().pending("s").1.is_empty());

        let context = &planner.contexts()[2];
        assert!(context.starts_with("system: Pending candidate tasks"));
        assert!(context.contains("system: Pending intent: detail"));
        assert!(context.contains(&format!("system: 2. monthly report (待办, no tags, id: {})", second.task_id)));
        assert!(context.ends_with("user: delete the second one"));
    }

    #[tokio::test]
    async fn recent_listing_is_capped_and_cleared_by_mutation() {
        let backend = InMemoryTaskBackend::with_tasks((0..10).map(|i| task(&format!("t{i}"))).collect());
        let planner = ScriptedPlanner::new(vec![
            step(PlanAction::List, json!({})),
            PlanProposal::final_answer("Here they are."),
            step(PlanAction::Update, json!({ "selection_index": 1, "status": "已完成" })),
        ]);
        let agent = agent(planner.clone(), 10);

        agent.run_turn(&backend, Some("s"), say("list")).await.expect("list turn");
        let recent = agent.sessions().recent("s");
        assert_eq!(recent.len(), 8);

        let turn = agent
            .run_turn(&backend, Some("s"), say("finish the first"))
            .await
            .expect("update turn");
        assert_eq!(turn.terminal, TerminalReason::Completed);
        assert_eq!(turn.action.params["taskId"], json!(recent[0].task_id));
        assert!(agent.sessions().recent("s").is_empty());
        assert!(planner.contexts()[2].starts_with("system: Most recent task list"));
    }

    #[tokio::test]
    async fn multi_message_request_replaces_transcript() {
        let backend = InMemoryTaskBackend::new();
        let planner = ScriptedPlanner::new(vec![
            PlanProposal::final_answer("one"),
            PlanProposal::final_answer("two"),
        ]);
        let agent = agent(planner, 10);
        agent.run_turn(&backend, Some("s"), say("hello")).await.expect("turn");
        assert_eq!(agent.sessions().messages("s").len(), 2);

        let history = vec![ChatMessage::user("a"), ChatMessage::assistant("b"), ChatMessage::user("c")];
        agent.run_turn(&backend, Some("s"), history).await.expect("turn");
        let contents: Vec<String> = agent
            .sessions()
            .messages("s")
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["a", "b", "c", "Conclusion: two"]);
    }

    #[tokio::test]
    async fn empty_message_list_is_a_fault() {
        let backend = InMemoryTaskBackend::new();
        let agent = agent(ScriptedPlanner::new(vec![]), 10);
        let err = agent
            .run_turn(&backend, None, Vec::new())
            .await
            .expect_err("empty turn");
        assert!(err.to_string().contains("at least one message"));
    }

    #[tokio::test]
    async fn stream_emits_ordered_events_and_one_terminal() {
        let backend: Arc<dyn TaskBackend> = Arc::new(InMemoryTaskBackend::new());
        let planner = ScriptedPlanner::new(vec![
            step(PlanAction::Create, json!({ "title": "stream me" })).with_thought("create it"),
        ]);
        let agent = agent(planner, 10);

        let mut rx = agent.run_turn_streaming(backend, Some("s".to_string()), say("create stream me"));
        let mut names = Vec::new();
        while let Some(event) = rx.recv().await {
            names.push(event.name());
            if event.is_terminal() {
                if let AgentEvent::Done { assistant_message, .. } = &event {
                    assert!(assistant_message.contains("Created task: stream me"));
                }
                break;
            }
        }
        assert_eq!(names, vec!["delta", "action", "execution", "delta", "delta", "done"]);
    }

    #[tokio::test]
    async fn stream_reports_faults_as_error_event() {
        let backend: Arc<dyn TaskBackend> = Arc::new(InMemoryTaskBackend::new());
        let agent = agent(ScriptedPlanner::new(vec![]), 10);
        let mut rx = agent.run_turn_streaming(backend, None, Vec::new());
        match rx.recv().await {
            Some(AgentEvent::Error { code, .. }) => assert_eq!(code, "INTERNAL_ERROR"),
            other => panic!("expected error event, got {other:?}"),
        }
    }
}
