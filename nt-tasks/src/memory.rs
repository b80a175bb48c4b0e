use crate::error::{BackendError, Result};
use crate::traits::TaskBackend;
use crate::types::{NewTask, Task, TaskFilter, TaskPatch};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Process-local task store with the task service's filter semantics: status equality
/// and tag-subset matching.
#[derive(Default)]
pub struct InMemoryTaskBackend {
    tasks: RwLock<Vec<Task>>,
    list_calls: AtomicUsize,
    mutation_calls: AtomicUsize,
}

impl InMemoryTaskBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store. Tasks without an id get a fresh UUID.
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let tasks = tasks
            .into_iter()
            .map(|mut task| {
                if task.task_id.trim().is_empty() {
                    task.task_id = Uuid::new_v4().to_string();
                }
                task
            })
            .collect();
        Self {
            tasks: RwLock::new(tasks),
            ..Self::default()
        }
    }

    pub async fn snapshot(&self) -> Vec<Task> {
        self.tasks.read().await.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn mutation_calls(&self) -> usize {
        self.mutation_calls.load(Ordering::SeqCst)
    }
}

fn matches_filter(task: &Task, filter: &TaskFilter) -> bool {
    if let Some(status) = filter.status {
        if task.status != status {
            return false;
        }
    }
    if let Some(tags) = filter.tags.as_ref() {
        if !tags.iter().all(|tag| task.tags.contains(tag)) {
            return false;
        }
    }
    true
}

#[async_trait]
impl TaskBackend for InMemoryTaskBackend {
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let tasks = self.tasks.read().await;
        Ok(tasks
            .iter()
            .filter(|task| matches_filter(task, filter))
            .cloned()
            .collect())
    }

    async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|task| task.task_id == task_id)
            .cloned()
            .ok_or_else(|| BackendError::not_found(task_id))
    }

    async fn create_task(&self, new_task: &NewTask) -> Result<Task> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        let title = new_task.title.trim();
        if title.is_empty() {
            return Err(BackendError::new(
                400,
                "INVALID_REQUEST",
                "title must not be empty",
            ));
        }
        let now = Utc::now().to_rfc3339();
        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            user_id: None,
            title: title.to_string(),
            description: new_task.description.clone().unwrap_or_default(),
            status: Default::default(),
            tags: new_task.tags.clone().unwrap_or_default(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
        };
        self.tasks.write().await.push(task.clone());
        Ok(task)
    }

    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .iter_mut()
            .find(|task| task.task_id == task_id)
            .ok_or_else(|| BackendError::not_found(task_id))?;
        if let Some(title) = patch.title.as_ref() {
            task.title = title.clone();
        }
        if let Some(description) = patch.description.as_ref() {
            task.description = description.clone();
        }
        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(tags) = patch.tags.as_ref() {
            task.tags = tags.clone();
        }
        task.updated_at = Some(Utc::now().to_rfc3339());
        Ok(task.clone())
    }

    async fn delete_task(&self, task_id: &str) -> Result<()> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|task| task.task_id != task_id);
        if tasks.len() == before {
            return Err(BackendError::not_found(task_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CODE_TASK_NOT_FOUND;
    use crate::types::TaskStatus;

    #[tokio::test]
    async fn list_filters_by_status_and_tag_subset() {
        let backend = InMemoryTaskBackend::with_tasks(vec![
            Task::new("", "a").with_tags(["work", "urgent"]),
            Task::new("", "b").with_status(TaskStatus::Done).with_tags(["work"]),
        ]);
        assert!(
            backend
                .snapshot()
                .await
                .iter()
                .all(|task| Uuid::parse_str(&task.task_id).is_ok())
        );

        let work = backend
            .list_tasks(&TaskFilter {
                status: None,
                tags: Some(vec!["work".to_string()]),
            })
            .await
            .expect("list");
        assert_eq!(work.len(), 2);

        let urgent_todo = backend
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Todo),
                tags: Some(vec!["urgent".to_string()]),
            })
            .await
            .expect("list");
        assert_eq!(urgent_todo.len(), 1);
        assert_eq!(urgent_todo[0].title, "a");
        assert_eq!(backend.list_calls(), 2);
    }

    #[tokio::test]
    async fn create_assigns_uuid_and_default_status() {
        let backend = InMemoryTaskBackend::new();
        let task = backend
            .create_task(&NewTask {
                title: " Buy milk ".to_string(),
                description: None,
                tags: Some(vec!["home".to_string()]),
            })
            .await
            .expect("create");
        assert!(Uuid::parse_str(&task.task_id).is_ok());
        assert_eq!(task.title, "Buy milk");
        assert_eq!(task.status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn missing_ids_report_not_found() {
        let backend = InMemoryTaskBackend::new();
        let err = backend.delete_task("nope").await.expect_err("missing");
        assert_eq!((err.status, err.code.as_str()), (404, CODE_TASK_NOT_FOUND));
        let err = backend
            .update_task("nope", &TaskPatch::default())
            .await
            .expect_err("missing");
        assert_eq!((err.status, err.code.as_str()), (404, CODE_TASK_NOT_FOUND));
    }
}
