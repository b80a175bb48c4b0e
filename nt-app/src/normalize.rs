//! Planner output -> canonical action parameters.
//!
//! Every function here is total: malformed fields normalize to `None` instead of
//! failing the whole action.

use crate::planner::PlanAction;
use nt_tasks::TaskStatus;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Filter block shared by list and bulk update/delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_list: Option<Vec<TaskStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

impl TaskQuery {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.status_list.is_none()
            && self.tags.is_none()
            && self.keyword.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionParams {
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "taskIds", skip_serializing_if = "Option::is_none")]
    pub task_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub bulk: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_indices: Option<Vec<i64>>,
    pub query: TaskQuery,
}

impl ActionParams {
    /// Query keyword, else title.
    pub fn search_keyword(&self) -> Option<&str> {
        self.query.keyword.as_deref().or(self.title.as_deref())
    }

    /// Ordinals requested by the planner; a single index wins over a list.
    pub fn selections(&self) -> Vec<i64> {
        match self.selection_index {
            Some(index) => vec![index],
            None => self.selection_indices.clone().unwrap_or_default(),
        }
    }
}

static NULL: Value = Value::Null;

fn get<'a>(map: &'a serde_json::Map<String, Value>, key: &str) -> &'a Value {
    map.get(key).unwrap_or(&NULL)
}

pub fn normalize_action_input(action: PlanAction, raw: &Value) -> ActionParams {
    let empty = serde_json::Map::new();
    let input = raw.as_object().unwrap_or(&empty);
    let query = get(input, "query").as_object().unwrap_or(&empty);
    let field = |key: &str| get(input, key);
    let query_field = |key: &str| get(query, key);

    let title = clean_text(field("title"));
    let mut keyword = clean_text(query_field("keyword"));
    if keyword.is_none() && !matches!(action, PlanAction::Update | PlanAction::Create) {
        keyword = title.clone();
    }

    let status_list = match query_field("status_list") {
        Value::Null => query_field("statusList"),
        other => other,
    };
    let selection_indices = match field("selection_indices") {
        Value::Null => field("selection"),
        other => other,
    };

    ActionParams {
        task_id: normalize_task_id(field("taskId")),
        task_ids: normalize_task_ids(field("taskIds")),
        title,
        description: clean_text(field("description")),
        status: normalize_status(field("status")),
        tags: coerce_list(field("tags")),
        bulk: coerce_bool(field("bulk")),
        selection_index: coerce_int(field("selection_index")),
        selection_indices: coerce_int_list(selection_indices),
        query: TaskQuery {
            status: normalize_status(query_field("status")),
            status_list: coerce_status_list(status_list),
            tags: coerce_list(query_field("tags")),
            keyword,
        },
    }
}

/// Trimmed text; empty strings and null are absent. Scalars are stringified.
pub fn clean_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

/// Canonical hyphenated lowercase UUID, or `None`.
pub fn normalize_task_id(value: &Value) -> Option<String> {
    let text = clean_text(value)?;
    Uuid::parse_str(&text).ok().map(|id| id.to_string())
}

pub fn normalize_task_ids(value: &Value) -> Option<Vec<String>> {
    let candidates: Vec<Value> = match value {
        Value::Null => return None,
        Value::Array(items) => items.clone(),
        Value::String(s) => split_delimited(s).into_iter().map(Value::String).collect(),
        other => vec![other.clone()],
    };
    let mut ids: Vec<String> = Vec::new();
    for id in candidates.iter().filter_map(normalize_task_id) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    (!ids.is_empty()).then_some(ids)
}

/// Accepts a list or a comma-separated string (ASCII or full-width comma).
pub fn coerce_list(value: &Value) -> Option<Vec<String>> {
    let items: Vec<String> = match value {
        Value::Null => return None,
        Value::Array(items) => items.iter().filter_map(clean_text).collect(),
        Value::String(s) => split_delimited(s),
        other => clean_text(other).into_iter().collect(),
    };
    (!items.is_empty()).then_some(items)
}

pub fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn coerce_int_list(value: &Value) -> Option<Vec<i64>> {
    let items: Vec<i64> = match value {
        Value::Null => return None,
        Value::Array(items) => items.iter().filter_map(coerce_int).collect(),
        Value::String(s) => split_delimited(s)
            .iter()
            .filter_map(|part| part.parse().ok())
            .collect(),
        other => coerce_int(other).into_iter().collect(),
    };
    (!items.is_empty()).then_some(items)
}

/// Exact match against the closed vocabulary; anything else is absent.
pub fn normalize_status(value: &Value) -> Option<TaskStatus> {
    value.as_str().and_then(TaskStatus::parse)
}

pub fn coerce_status_list(value: &Value) -> Option<Vec<TaskStatus>> {
    let mut statuses: Vec<TaskStatus> = Vec::new();
    for status in coerce_list(value)?.iter().filter_map(|s| TaskStatus::parse(s)) {
        if !statuses.contains(&status) {
            statuses.push(status);
        }
    }
    (!statuses.is_empty()).then_some(statuses)
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ),
        _ => false,
    }
}

fn split_delimited(text: &str) -> Vec<String> {
    text.split([',', '，'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
