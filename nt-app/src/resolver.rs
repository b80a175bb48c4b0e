//! Reference resolution: keyword/title search and ordinal selection against
//! previously shown candidates.

use crate::normalize::{ActionParams, normalize_task_id};
use nt_tasks::{BackendError, Task, TaskBackend, TaskFilter};

const GENERIC_SUFFIXES: &[&str] = &["任务", "事项", "事情", "task", "item", "todo"];
const QUOTE_PAIRS: &[(char, char)] = &[('"', '"'), ('\'', '\''), ('“', '”'), ('“', '“'), ('”', '”')];

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Single(String),
    Candidates(Vec<Task>),
    None,
}

/// Lowercased search variants: the keyword itself, the keyword without a trailing
/// generic noun, and the keyword without one pair of surrounding quotes.
pub fn keyword_variants(keyword: &str) -> Vec<String> {
    let base = keyword.trim().to_lowercase();
    if base.is_empty() {
        return Vec::new();
    }
    let mut variants = vec![base.clone()];
    let mut push = |candidate: &str| {
        let candidate = candidate.trim();
        if !candidate.is_empty() && !variants.iter().any(|v| v == candidate) {
            variants.push(candidate.to_string());
        }
    };

    for suffix in GENERIC_SUFFIXES {
        if let Some(stripped) = base.strip_suffix(suffix) {
            push(stripped);
        }
    }

    let mut chars = base.chars();
    if let (Some(first), Some(last)) = (chars.next(), chars.next_back()) {
        if QUOTE_PAIRS.contains(&(first, last)) {
            push(chars.as_str());
        }
    }
    variants
}

/// Case-insensitive substring match on title or description, any variant.
pub fn filter_tasks(tasks: Vec<Task>, keyword: &str) -> Vec<Task> {
    let variants = keyword_variants(keyword);
    if variants.is_empty() {
        return tasks;
    }
    tasks
        .into_iter()
        .filter(|task| {
            let title = task.title.to_lowercase();
            let description = task.description.to_lowercase();
            variants
                .iter()
                .any(|v| title.contains(v.as_str()) || description.contains(v.as_str()))
        })
        .collect()
}

/// An explicit `taskId` wins; otherwise search by keyword (query keyword, then title)
/// over the unfiltered list.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn resolve(
    backend: &dyn TaskBackend,
    params: &ActionParams,
) -> Result<Resolution, BackendError> {
    if let Some(task_id) = params.task_id.as_ref() {
        return Ok(Resolution::Single(task_id.clone()));
    }
    let Some(keyword) = params.search_keyword() else {
        return Ok(Resolution::None);
    };

    let tasks = backend.list_tasks(&TaskFilter::default()).await?;
    let mut matches = filter_tasks(tasks, keyword);
    tracing::debug!(keyword = %keyword, matches = matches.len(), "keyword resolution");
    match matches.len() {
        0 => Ok(Resolution::None),
        1 => Ok(Resolution::Single(matches.remove(0).task_id)),
        _ => Ok(Resolution::Candidates(matches)),
    }
}

/// Maps 1-based ordinals onto pending candidates (or recent ones when nothing is
/// pending). Out-of-range ordinals are ignored; one survivor fills `task_id`, more
/// fill `task_ids`.
pub fn apply_selection(mut params: ActionParams, pending: &[Task], recent: &[Task]) -> ActionParams {
    let selections = params.selections();
    if selections.is_empty() {
        return params;
    }
    let candidates = if pending.is_empty() { recent } else { pending };
    if candidates.is_empty() {
        return params;
    }

    let mut ids: Vec<String> = Vec::new();
    for ordinal in selections {
        let Some(task) = usize::try_from(ordinal)
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|index| candidates.get(index))
        else {
            continue;
        };
        let Some(id) = normalize_task_id(&serde_json::Value::String(task.task_id.clone())) else {
            continue;
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    match ids.len() {
        0 => {}
        1 => params.task_id = ids.pop(),
        _ => params.task_ids = Some(ids),
    }
    params
}
