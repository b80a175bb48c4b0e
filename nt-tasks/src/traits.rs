use crate::error::Result;
use crate::types::{NewTask, Task, TaskFilter, TaskPatch};
use async_trait::async_trait;

/// Remote task store. Every call reports failure as a [`crate::BackendError`]; transport
/// problems never escape as panics.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;
    async fn get_task(&self, task_id: &str) -> Result<Task>;
    async fn create_task(&self, new_task: &NewTask) -> Result<Task>;
    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task>;
    async fn delete_task(&self, task_id: &str) -> Result<()>;
}
