//! Executes one normalized action against the task backend.
//!
//! Required fields are checked before any backend call; a missing field yields a
//! `skipped` execution with a reason instead of a failed round-trip.

use crate::normalize::{ActionParams, TaskQuery};
use crate::outcome::{ActionRecord, Execution, ExecutionStatus, Intent, SkipReason};
use crate::planner::PlanAction;
use crate::resolver::{Resolution, filter_tasks, resolve};
use crate::session::SessionStore;
use nt_tasks::{BackendError, NewTask, Task, TaskBackend, TaskFilter, TaskPatch};
use serde_json::{Value, json};
use std::collections::HashSet;

const UNTITLED: &str = "(untitled)";
const NO_MATCHES: &str = "No matching tasks found.";
const NOT_FOUND: &str = "I couldn't find that task, please be more specific.";

#[derive(Debug, Clone, Copy)]
pub struct DisplayLimits {
    /// Items shown in listings and kept as recent candidates.
    pub display_cap: usize,
    /// Candidates offered in a clarification.
    pub clarify_cap: usize,
}

impl Default for DisplayLimits {
    fn default() -> Self {
        Self {
            display_cap: 8,
            clarify_cap: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub action: ActionRecord,
    pub execution: Execution,
    /// Short text fed back to the planner and shown in the trace.
    pub observation: String,
    /// User-facing rendering of the execution.
    pub assistant_message: String,
    /// Full result of a successful list, for recent-candidate bookkeeping.
    pub listing: Option<Vec<Task>>,
}

struct Reply {
    message: String,
    execution: Execution,
    listing: Option<Vec<Task>>,
}

impl Reply {
    fn new(message: impl Into<String>, execution: Execution) -> Self {
        Self {
            message: message.into(),
            execution,
            listing: None,
        }
    }

    fn skipped(message: impl Into<String>, reason: SkipReason) -> Self {
        Self::new(message, Execution::skipped(reason))
    }

    fn backend_error(error: &BackendError) -> Self {
        tracing::warn!(code = %error.code, status = error.status, message = %error.message, "backend call failed");
        Self::new(
            format!("Operation failed: {}", error.message),
            Execution::failed(json!({ "code": error.code, "message": error.message })),
        )
    }
}

/// Per-turn dispatch context.
pub struct Dispatcher<'a> {
    backend: &'a dyn TaskBackend,
    sessions: &'a SessionStore,
    session_id: &'a str,
    limits: DisplayLimits,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        backend: &'a dyn TaskBackend,
        sessions: &'a SessionStore,
        session_id: &'a str,
        limits: DisplayLimits,
    ) -> Self {
        Self {
            backend,
            sessions,
            session_id,
            limits,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(session_id = %self.session_id, action = action.tool_name()))]
    pub async fn dispatch(&self, action: PlanAction, params: &ActionParams) -> DispatchOutcome {
        let reply = match action {
            PlanAction::List => self.list(&params.query).await,
            PlanAction::Get => self.get(params).await,
            PlanAction::Create => self.create(params).await,
            PlanAction::Update => self.update(params).await,
            PlanAction::Delete => self.delete(params).await,
            PlanAction::Final | PlanAction::Clarify => {
                Reply::skipped("Unrecognized action.", SkipReason::UnknownAction)
            }
        };
        tracing::info!(status = ?reply.execution.status, "action dispatched");
        DispatchOutcome {
            action: ActionRecord {
                intent: action.intent(),
                params: serde_json::to_value(params).unwrap_or_else(|_| json!({})),
            },
            observation: summarize_execution(&reply.execution),
            assistant_message: reply.message,
            execution: reply.execution,
            listing: reply.listing,
        }
    }

    async fn list(&self, query: &TaskQuery) -> Reply {
        match self.tasks_for_query(query).await {
            Ok(tasks) => Reply {
                message: format_task_list(&tasks, self.limits.display_cap),
                execution: Execution::success(tasks_value(&tasks)),
                listing: Some(tasks),
            },
            Err(error) => Reply::backend_error(&error),
        }
    }

    async fn get(&self, params: &ActionParams) -> Reply {
        if params.task_id.is_none() && params.search_keyword().is_none() {
            return Reply::skipped(
                "A task id or keyword is needed to show task details.",
                SkipReason::MissingIdentifier,
            );
        }
        let task_id = match self.resolve_single(params, Intent::Detail).await {
            Ok(task_id) => task_id,
            Err(reply) => return reply,
        };
        match self.backend.get_task(&task_id).await {
            Ok(task) => Reply::new(format_task_detail(&task), Execution::success(task_value(&task))),
            Err(error) => Reply::backend_error(&error),
        }
    }

    async fn create(&self, params: &ActionParams) -> Reply {
        let Some(title) = params.title.clone() else {
            return Reply::skipped(
                "A task title is required to create a task.",
                SkipReason::MissingTitle,
            );
        };
        let new_task = NewTask {
            title,
            description: params.description.clone(),
            tags: params.tags.clone(),
        };
        match self.backend.create_task(&new_task).await {
            Ok(task) => {
                let title = non_empty(&task.title).unwrap_or(&new_task.title);
                let message = format!(
                    "Created task: {title} (status: {}{}).",
                    task.status,
                    tags_suffix(&task.tags)
                );
                Reply::new(message, Execution::success(task_value(&task)))
            }
            Err(error) => Reply::backend_error(&error),
        }
    }

    async fn update(&self, params: &ActionParams) -> Reply {
        let patch = TaskPatch {
            title: params.title.clone(),
            description: params.description.clone(),
            status: params.status,
            tags: params.tags.clone(),
        };
        if patch.is_empty() {
            return Reply::skipped("Nothing to update was given.", SkipReason::MissingUpdates);
        }

        if let Some(task_ids) = params.task_ids.as_ref() {
            return self.update_each(task_ids, &patch).await;
        }

        if params.bulk || !params.query.is_empty() {
            let tasks = match self.tasks_for_query(&params.query).await {
                Ok(tasks) => tasks,
                Err(error) => return Reply::backend_error(&error),
            };
            if tasks.is_empty() {
                return Reply::new(NO_MATCHES, Execution::success(json!([])));
            }
            if !params.bulk && tasks.len() > 1 {
                return self.clarify(Intent::Update, tasks);
            }
            let ids = task_ids_of(&tasks);
            return self.update_each(&ids, &patch).await;
        }

        let task_id = match self.resolve_single(params, Intent::Update).await {
            Ok(task_id) => task_id,
            Err(reply) => return reply,
        };
        match self.backend.update_task(&task_id, &patch).await {
            Ok(task) => Reply::new(
                format!("Updated task: {}.", non_empty(&task.title).unwrap_or(&task_id)),
                Execution::success(task_value(&task)),
            ),
            Err(error) => Reply::backend_error(&error),
        }
    }

    async fn delete(&self, params: &ActionParams) -> Reply {
        let query = &params.query;
        let has_target = params.task_id.is_some()
            || params.task_ids.is_some()
            || params.bulk
            || !query.is_empty()
            || params.title.is_some();
        if !has_target {
            return Reply::skipped(
                "A task id or filter is required to delete tasks.",
                SkipReason::MissingIdentifier,
            );
        }

        if let Some(task_ids) = params.task_ids.as_ref() {
            return self.delete_each(task_ids).await;
        }

        // A bare keyword means "everything matching", unlike update. An explicit id
        // without `bulk` always targets that one task.
        let bulk = params.bulk || query.keyword.is_some();
        let explicit_single = params.task_id.is_some() && !params.bulk;
        if !explicit_single && (bulk || !query.is_empty()) {
            let tasks = match self.tasks_for_query(query).await {
                Ok(tasks) => tasks,
                Err(error) => return Reply::backend_error(&error),
            };
            if tasks.is_empty() {
                return Reply::new(NO_MATCHES, Execution::success(json!([])));
            }
            if !bulk && tasks.len() > 1 {
                return self.clarify(Intent::Delete, tasks);
            }
            let ids = task_ids_of(&tasks);
            return self.delete_each(&ids).await;
        }

        let task_id = match self.resolve_single(params, Intent::Delete).await {
            Ok(task_id) => task_id,
            Err(reply) => return reply,
        };
        match self.backend.delete_task(&task_id).await {
            Ok(()) => Reply::new(
                "Deleted the task.",
                Execution::success(json!({ "taskId": task_id })),
            ),
            Err(error) => Reply::backend_error(&error),
        }
    }

    /// Single-item resolution; ambiguity stores pending candidates under `intent`.
    async fn resolve_single(&self, params: &ActionParams, intent: Intent) -> Result<String, Reply> {
        match resolve(self.backend, params).await {
            Ok(Resolution::Single(task_id)) => Ok(task_id),
            Ok(Resolution::Candidates(candidates)) => Err(self.clarify(intent, candidates)),
            Ok(Resolution::None) => Err(Reply::skipped(NOT_FOUND, SkipReason::TaskNotFound)),
            Err(error) => Err(Reply::backend_error(&error)),
        }
    }

    fn clarify(&self, intent: Intent, candidates: Vec<Task>) -> Reply {
        let shown = &candidates[..candidates.len().min(self.limits.clarify_cap)];
        let lines: Vec<String> = shown
            .iter()
            .enumerate()
            .map(|(idx, task)| {
                format!(
                    "{}. {} ({}) id: {}",
                    idx + 1,
                    title_or_untitled(task),
                    task.status,
                    task.task_id
                )
            })
            .collect();
        let message = format!(
            "Found several matching tasks, please pick one or add detail:\n{}",
            lines.join("\n")
        );
        let execution = Execution {
            status: ExecutionStatus::Skipped,
            result: json!({
                "reason": SkipReason::MultipleMatches,
                "candidates": tasks_value(shown),
            }),
        };
        self.sessions.set_pending(self.session_id, intent, candidates);
        Reply::new(message, execution)
    }

    /// One backend query per status in `status_list` (deduplicated by id), otherwise a
    /// single query; the keyword is applied locally.
    async fn tasks_for_query(&self, query: &TaskQuery) -> Result<Vec<Task>, BackendError> {
        let mut collected = match query.status_list.as_ref() {
            Some(statuses) => {
                let mut seen = HashSet::new();
                let mut collected = Vec::new();
                for status in statuses {
                    let filter = TaskFilter {
                        status: Some(*status),
                        tags: query.tags.clone(),
                    };
                    for task in self.backend.list_tasks(&filter).await? {
                        if task.task_id.is_empty() || seen.insert(task.task_id.clone()) {
                            collected.push(task);
                        }
                    }
                }
                collected
            }
            None => {
                let filter = TaskFilter {
                    status: query.status,
                    tags: query.tags.clone(),
                };
                self.backend.list_tasks(&filter).await?
            }
        };
        if let Some(keyword) = query.keyword.as_deref() {
            collected = filter_tasks(collected, keyword);
        }
        Ok(collected)
    }

    async fn update_each(&self, task_ids: &[String], patch: &TaskPatch) -> Reply {
        let mut updated = Vec::new();
        let mut failed = Vec::new();
        for task_id in task_ids {
            match self.backend.update_task(task_id, patch).await {
                Ok(task) => updated.push(task_value(&task)),
                Err(error) => failed.push(failure_entry(task_id, &error)),
            }
        }
        let mut message = format!("Updated {} task(s).", updated.len());
        if !failed.is_empty() {
            message.push_str(&format!(" {} task(s) failed to update.", failed.len()));
        }
        Reply::new(message, batch_execution("updated", updated, failed))
    }

    async fn delete_each(&self, task_ids: &[String]) -> Reply {
        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for task_id in task_ids {
            match self.backend.delete_task(task_id).await {
                Ok(()) => deleted.push(json!({ "taskId": task_id })),
                Err(error) => failed.push(failure_entry(task_id, &error)),
            }
        }
        let mut message = format!("Deleted {} task(s).", deleted.len());
        if !failed.is_empty() {
            message.push_str(&format!(" {} task(s) failed to delete.", failed.len()));
        }
        Reply::new(message, batch_execution("deleted", deleted, failed))
    }
}

fn batch_execution(key: &str, done: Vec<Value>, failed: Vec<Value>) -> Execution {
    let status = if failed.is_empty() {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::Failed
    };
    let mut result = serde_json::Map::new();
    result.insert(key.to_string(), Value::Array(done));
    result.insert("failed".to_string(), Value::Array(failed));
    Execution {
        status,
        result: Value::Object(result),
    }
}

fn failure_entry(task_id: &str, error: &BackendError) -> Value {
    json!({
        "taskId": task_id,
        "error": { "code": error.code, "message": error.message },
    })
}

fn task_ids_of(tasks: &[Task]) -> Vec<String> {
    tasks
        .iter()
        .filter(|task| !task.task_id.is_empty())
        .map(|task| task.task_id.clone())
        .collect()
}

fn task_value(task: &Task) -> Value {
    serde_json::to_value(task).unwrap_or(Value::Null)
}

fn tasks_value(tasks: &[Task]) -> Value {
    Value::Array(tasks.iter().map(task_value).collect())
}

fn non_empty(text: &str) -> Option<&str> {
    let text = text.trim();
    (!text.is_empty()).then_some(text)
}

fn title_or_untitled(task: &Task) -> &str {
    non_empty(&task.title).unwrap_or(UNTITLED)
}

fn tags_suffix(tags: &[String]) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!(", tags: {}", tags.join(", "))
    }
}

pub fn format_task_list(tasks: &[Task], display_cap: usize) -> String {
    if tasks.is_empty() {
        return NO_MATCHES.to_string();
    }
    let lines: Vec<String> = tasks
        .iter()
        .take(display_cap)
        .enumerate()
        .map(|(idx, task)| {
            format!(
                "{}. {} ({}{})",
                idx + 1,
                title_or_untitled(task),
                task.status,
                tags_suffix(&task.tags)
            )
        })
        .collect();
    let mut out = format!("Found these tasks:\n{}", lines.join("\n"));
    if tasks.len() > display_cap {
        out.push_str(&format!("\n...{} tasks in total", tasks.len()));
    }
    out
}

pub fn format_task_detail(task: &Task) -> String {
    let mut parts = vec![
        format!("Task: {}", title_or_untitled(task)),
        format!("Status: {}", task.status),
    ];
    if let Some(description) = non_empty(&task.description) {
        parts.push(format!("Description: {description}"));
    }
    if !task.tags.is_empty() {
        parts.push(format!("Tags: {}", task.tags.join(", ")));
    }
    parts.join("\n")
}

/// Observation text for the trace and the planner's scratchpad.
pub fn summarize_execution(execution: &Execution) -> String {
    match (execution.status, &execution.result) {
        (ExecutionStatus::Success, Value::Array(items)) => {
            if items.is_empty() {
                return NO_MATCHES.to_string();
            }
            let titles: Vec<&str> = items
                .iter()
                .take(5)
                .map(|item| {
                    item.get("title")
                        .and_then(Value::as_str)
                        .and_then(non_empty)
                        .unwrap_or(UNTITLED)
                })
                .collect();
            let mut out = format!("Found tasks: {}", titles.join(", "));
            if items.len() > 5 {
                out.push_str(&format!(" and more, {} in total", items.len()));
            }
            out
        }
        (ExecutionStatus::Success, Value::Object(map)) => {
            if let Some(updated) = map.get("updated").and_then(Value::as_array) {
                return format!("Updated {} task(s).", updated.len());
            }
            if let Some(deleted) = map.get("deleted").and_then(Value::as_array) {
                return format!("Deleted {} task(s).", deleted.len());
            }
            match map.get("title").and_then(Value::as_str).and_then(non_empty) {
                Some(title) => format!("Got task: {title}"),
                None => "Done.".to_string(),
            }
        }
        (ExecutionStatus::Success, _) => "Done.".to_string(),
        (ExecutionStatus::Failed, _) => "Execution failed.".to_string(),
        (ExecutionStatus::Skipped, _) => "Step not executed.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_action_input;
    use async_trait::async_trait;
    use nt_tasks::{InMemoryTaskBackend, TaskStatus};
    use uuid::Uuid;

    fn task(title: &str) -> Task {
        Task::new(Uuid::new_v4().to_string(), title)
    }

    async fn run(
        backend: &dyn TaskBackend,
        sessions: &SessionStore,
        action: PlanAction,
        raw: Value,
    ) -> DispatchOutcome {
        let params = normalize_action_input(action, &raw);
        Dispatcher::new(backend, sessions, "s1", DisplayLimits::default())
            .dispatch(action, &params)
            .await
    }

    fn titles(tasks: &[Task]) -> Vec<String> {
        let mut out: Vec<String> = tasks.iter().map(|t| t.title.clone()).collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn missing_fields_skip_before_backend_calls() {
        let backend = InMemoryTaskBackend::with_tasks(vec![task("a")]);
        let sessions = SessionStore::new(12);
        let cases = [
            (PlanAction::Get, json!({}), SkipReason::MissingIdentifier),
            (PlanAction::Create, json!({ "description": "x" }), SkipReason::MissingTitle),
            (PlanAction::Update, json!({ "taskId": Uuid::new_v4().to_string() }), SkipReason::MissingUpdates),
            (PlanAction::Delete, json!({ "description": "x" }), SkipReason::MissingIdentifier),
            (PlanAction::Clarify, json!({}), SkipReason::UnknownAction),
        ];
        for (action, raw, reason) in cases {
            let outcome = run(&backend, &sessions, action, raw).await;
            assert_eq!(outcome.execution.skip_reason(), Some(reason), "{action:?}");
            assert_eq!(outcome.observation, "Step not executed.");
        }
        assert_eq!(backend.list_calls(), 0);
        assert_eq!(backend.mutation_calls(), 0);
    }

    #[tokio::test]
    async fn status_list_issues_one_query_per_status_and_dedupes() {
        let backend = InMemoryTaskBackend::with_tasks(vec![
            task("write report"),
            task("review pr").with_status(TaskStatus::InProgress),
            task("old idea").with_status(TaskStatus::Deferred),
            task("shipped").with_status(TaskStatus::Done),
        ]);
        let sessions = SessionStore::new(12);
        let outcome = run(
            &backend,
            &sessions,
            PlanAction::List,
            json!({ "query": { "status_list": ["待办", "进行中", "已延期", "进行中"] } }),
        )
        .await;
        assert_eq!(backend.list_calls(), 3);
        assert!(outcome.execution.is_success());
        let items = outcome.execution.result.as_array().expect("list payload");
        assert_eq!(items.len(), 3);
        assert!(outcome.assistant_message.contains("1. write report (待办)"));
        assert!(!outcome.assistant_message.contains("shipped"));
    }

    #[tokio::test]
    async fn empty_listing_is_success() {
        let backend = InMemoryTaskBackend::new();
        let sessions = SessionStore::new(12);
        let outcome = run(&backend, &sessions, PlanAction::List, json!({ "query": { "keyword": "x" } })).await;
        assert_eq!(outcome.execution, Execution::success(json!([])));
        assert_eq!(outcome.observation, NO_MATCHES);
    }

    #[tokio::test]
    async fn listing_message_is_capped() {
        let backend = InMemoryTaskBackend::with_tasks((0..10).map(|i| task(&format!("t{i}"))).collect());
        let sessions = SessionStore::new(12);
        let outcome = run(&backend, &sessions, PlanAction::List, json!({})).await;
        assert_eq!(outcome.execution.result.as_array().map(Vec::len), Some(10));
        assert!(outcome.assistant_message.contains("8. t7"));
        assert!(!outcome.assistant_message.contains("9. t8"));
        assert!(outcome.assistant_message.ends_with("...10 tasks in total"));
        assert_eq!(outcome.observation, "Found tasks: t0, t1, t2, t3, t4 and more, 10 in total");
    }

    #[tokio::test]
    async fn bulk_delete_by_bare_keyword() {
        let backend = InMemoryTaskBackend::with_tasks(vec![task("demo-A"), task("demo-B"), task("other")]);
        let sessions = SessionStore::new(12);
        let outcome = run(&backend, &sessions, PlanAction::Delete, json!({ "query": { "keyword": "demo" } })).await;
        assert!(outcome.execution.is_success());
        assert_eq!(outcome.execution.result["deleted"].as_array().map(Vec::len), Some(2));
        assert_eq!(titles(&backend.snapshot().await), vec!["other"]);
        assert_eq!(outcome.observation, "Deleted 2 task(s).");
    }

    #[tokio::test]
    async fn update_by_query_without_bulk_asks_which_one() {
        let a = task("draft email");
        let b = task("draft slides");
        let backend = InMemoryTaskBackend::with_tasks(vec![a.clone(), b.clone()]);
        let sessions = SessionStore::new(12);
        let outcome = run(
            &backend,
            &sessions,
            PlanAction::Update,
            json!({ "status": "已完成", "bulk": false, "query": { "status": "待办" } }),
        )
        .await;
        assert_eq!(outcome.execution.skip_reason(), Some(SkipReason::MultipleMatches));
        let candidates = outcome.execution.result["candidates"].as_array().expect("candidates");
        assert_eq!(candidates.len(), 2);
        assert_eq!(backend.mutation_calls(), 0);
        assert!(backend.snapshot().await.iter().all(|t| t.status == TaskStatus::Todo));

        let (intent, pending) = sessions.pending("s1");
        assert_eq!(intent, Some(Intent::Update));
        assert_eq!(pending, vec![a, b]);
    }

    #[tokio::test]
    async fn bulk_update_touches_every_match() {
        let backend = InMemoryTaskBackend::with_tasks(vec![task("a"), task("b")]);
        let sessions = SessionStore::new(12);
        let outcome = run(
            &backend,
            &sessions,
            PlanAction::Update,
            json!({ "status": "done", "bulk": true }),
        )
        .await;
        assert!(outcome.execution.is_success());
        assert_eq!(outcome.execution.result["updated"].as_array().map(Vec::len), Some(2));
        assert!(backend.snapshot().await.iter().all(|t| t.status == TaskStatus::Done));
    }

    #[tokio::test]
    async fn clarification_lists_at_most_five() {
        let backend = InMemoryTaskBackend::with_tasks((0..7).map(|i| task(&format!("report {i}"))).collect());
        let sessions = SessionStore::new(12);
        let outcome = run(&backend, &sessions, PlanAction::Get, json!({ "title": "report" })).await;
        assert_eq!(outcome.execution.skip_reason(), Some(SkipReason::MultipleMatches));
        assert_eq!(outcome.execution.result["candidates"].as_array().map(Vec::len), Some(5));
        assert!(outcome.assistant_message.contains("5. report 4"));
        assert!(!outcome.assistant_message.contains("6. report 5"));
        let (intent, pending) = sessions.pending("s1");
        assert_eq!(intent, Some(Intent::Detail));
        assert_eq!(pending.len(), 7);
    }

    #[tokio::test]
    async fn single_update_and_not_found() {
        let target = task("Buy milk");
        let backend = InMemoryTaskBackend::with_tasks(vec![target.clone(), task("walk dog")]);
        let sessions = SessionStore::new(12);
        let outcome = run(
            &backend,
            &sessions,
            PlanAction::Update,
            json!({ "taskId": target.task_id, "tags": "home，errand" }),
        )
        .await;
        assert!(outcome.execution.is_success());
        assert_eq!(outcome.assistant_message, "Updated task: Buy milk.");
        assert_eq!(outcome.execution.result["tags"], json!(["home", "errand"]));

        let outcome = run(
            &backend,
            &sessions,
            PlanAction::Get,
            json!({ "query": { "keyword": "xyz-nonexistent" } }),
        )
        .await;
        assert_eq!(outcome.execution.skip_reason(), Some(SkipReason::TaskNotFound));
    }

    #[tokio::test]
    async fn delete_by_title_matches_as_keyword() {
        let target = task("grocery run");
        let backend = InMemoryTaskBackend::with_tasks(vec![target.clone(), task("laundry")]);
        let sessions = SessionStore::new(12);
        // the title becomes the query keyword, so this is a keyword delete
        let outcome = run(&backend, &sessions, PlanAction::Delete, json!({ "title": "grocery" })).await;
        assert!(outcome.execution.is_success());
        assert_eq!(titles(&backend.snapshot().await), vec!["laundry"]);
    }

    #[tokio::test]
    async fn task_ids_collect_partial_failures() {
        let kept = task("kept");
        let backend = InMemoryTaskBackend::with_tasks(vec![kept.clone()]);
        let sessions = SessionStore::new(12);
        let missing = Uuid::new_v4().to_string();
        let outcome = run(
            &backend,
            &sessions,
            PlanAction::Delete,
            json!({ "taskIds": [kept.task_id, missing] }),
        )
        .await;
        assert_eq!(outcome.execution.status, ExecutionStatus::Failed);
        assert_eq!(outcome.execution.result["deleted"], json!([{ "taskId": kept.task_id }]));
        assert_eq!(outcome.execution.result["failed"][0]["taskId"], json!(missing));
        assert_eq!(outcome.execution.result["failed"][0]["error"]["code"], "TASK_NOT_FOUND");
        assert_eq!(outcome.assistant_message, "Deleted 1 task(s). 1 task(s) failed to delete.");
    }

    struct DownBackend;

    #[async_trait]
    impl TaskBackend for DownBackend {
        async fn list_tasks(&self, _filter: &TaskFilter) -> nt_tasks::Result<Vec<Task>> {
            Err(BackendError::unavailable("connection refused"))
        }
        async fn get_task(&self, _task_id: &str) -> nt_tasks::Result<Task> {
            Err(BackendError::unavailable("connection refused"))
        }
        async fn create_task(&self, _new_task: &NewTask) -> nt_tasks::Result<Task> {
            Err(BackendError::unavailable("connection refused"))
        }
        async fn update_task(&self, _task_id: &str, _patch: &TaskPatch) -> nt_tasks::Result<Task> {
            Err(BackendError::unavailable("connection refused"))
        }
        async fn delete_task(&self, _task_id: &str) -> nt_tasks::Result<()> {
            Err(BackendError::unavailable("connection refused"))
        }
    }

    #[tokio::test]
    async fn backend_failures_become_failed_outcomes() {
        let sessions = SessionStore::new(12);
        let outcome = run(&DownBackend, &sessions, PlanAction::Create, json!({ "title": "x" })).await;
        assert_eq!(outcome.execution.status, ExecutionStatus::Failed);
        assert_eq!(outcome.execution.result["code"], "BAD_GATEWAY");
        assert!(outcome.assistant_message.starts_with("Operation failed: task service unavailable"));
        assert_eq!(outcome.observation, "Execution failed.");
        assert_eq!(outcome.action.intent, Intent::Create);
    }

    fn report_seed() -> Vec<Task> {
        vec![task("weekly report"), task("monthly report"), task("groceries")]
    }

    #[tokio::test]
    async fn update_with_bare_keyword_asks_which_one() {
        let backend = InMemoryTaskBackend::with_tasks(report_seed());
        let sessions = SessionStore::new(12);
        let outcome = run(
            &backend,
            &sessions,
            PlanAction::Update,
            json!({ "status": "已完成", "query": { "keyword": "report" } }),
        )
        .await;
        assert_eq!(outcome.execution.skip_reason(), Some(SkipReason::MultipleMatches));
        assert_eq!(backend.mutation_calls(), 0);
        let (intent, pending) = sessions.pending("s1");
        assert_eq!(intent, Some(Intent::Update));
        assert_eq!(titles(&pending), vec!["monthly report", "weekly report"]);
    }

    #[tokio::test]
    async fn delete_with_same_bare_keyword_removes_every_match() {
        let backend = InMemoryTaskBackend::with_tasks(report_seed());
        let sessions = SessionStore::new(12);
        let outcome = run(&backend, &sessions, PlanAction::Delete, json!({ "query": { "keyword": "report" } })).await;
        assert!(outcome.execution.is_success());
        assert_eq!(outcome.execution.result["deleted"].as_array().map(Vec::len), Some(2));
        assert_eq!(titles(&backend.snapshot().await), vec!["groceries"]);
    }

    #[tokio::test]
    async fn delete_by_status_only_without_bulk_asks_which_one() {
        let backend = InMemoryTaskBackend::with_tasks(report_seed());
        let sessions = SessionStore::new(12);
        let outcome = run(&backend, &sessions, PlanAction::Delete, json!({ "query": { "status": "待办" } })).await;
        assert_eq!(outcome.execution.skip_reason(), Some(SkipReason::MultipleMatches));
        assert_eq!(backend.mutation_calls(), 0);
        assert_eq!(backend.snapshot().await.len(), 3);

        let outcome = run(
            &backend,
            &sessions,
            PlanAction::Delete,
            json!({ "bulk": true, "query": { "status": "待办" } }),
        )
        .await;
        assert!(outcome.execution.is_success());
        assert!(backend.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn delete_with_explicit_id_and_title_removes_only_that_task() {
        let weekly = task("weekly report");
        let backend = InMemoryTaskBackend::with_tasks(vec![weekly.clone(), task("monthly report")]);
        let sessions = SessionStore::new(12);
        let outcome = run(
            &backend,
            &sessions,
            PlanAction::Delete,
            json!({ "taskId": weekly.task_id, "title": "report" }),
        )
        .await;
        assert!(outcome.execution.is_success());
        assert_eq!(outcome.execution.result["taskId"], json!(weekly.task_id));
        assert_eq!(titles(&backend.snapshot().await), vec!["monthly report"]);
    }
}
