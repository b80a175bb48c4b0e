use crate::error::{BackendError, Result};
use crate::traits::TaskBackend;
use crate::types::{NewTask, Task, TaskFilter, TaskPatch};
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct HttpTaskBackendConfig {
    pub base_url: String,
    pub timeout: Duration,
}

/// Caller credentials forwarded verbatim to the task service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendIdentity {
    pub authorization: String,
    pub user_id: String,
    pub device_id: String,
}

/// HTTP client for the task service. Cloning is cheap; [`HttpTaskBackend::with_identity`]
/// scopes a clone to one caller.
#[derive(Clone)]
pub struct HttpTaskBackend {
    http: reqwest::Client,
    base_url: String,
    identity: BackendIdentity,
}

impl HttpTaskBackend {
    pub fn new(cfg: HttpTaskBackendConfig) -> Result<Self> {
        let base_url = cfg.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(BackendError::new(
                0,
                "INVALID_CONFIG",
                "task service base_url must not be empty",
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(BackendError::unavailable)?;
        Ok(Self {
            http,
            base_url,
            identity: BackendIdentity::default(),
        })
    }

    pub fn with_identity(&self, identity: BackendIdentity) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            identity,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.http.request(method, url);
        if !self.identity.authorization.is_empty() {
            req = req.header("Authorization", &self.identity.authorization);
        }
        if !self.identity.user_id.is_empty() {
            req = req.header("X-User-ID", &self.identity.user_id);
        }
        if !self.identity.device_id.is_empty() {
            req = req.header("X-Device-ID", &self.identity.device_id);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Option<serde_json::Value>> {
        let started = Instant::now();
        let response = req.send().await.map_err(BackendError::unavailable)?;
        let status = response.status();
        let body = response.text().await.map_err(BackendError::unavailable)?;
        tracing::debug!(
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            body_len = body.len(),
            "task service responded"
        );
        if !status.is_success() {
            return Err(BackendError::from_response(status.as_u16(), &body));
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        let payload: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            BackendError::new(
                status.as_u16(),
                "TASK_API_ERROR",
                format!("task service returned invalid json: {e}"),
            )
        })?;
        Ok(Some(unwrap_data_envelope(payload)))
    }

    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let payload = self.send(req).await?.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(payload).map_err(|e| {
            BackendError::new(
                200,
                "TASK_API_ERROR",
                format!("unexpected task service payload: {e}"),
            )
        })
    }
}

fn unwrap_data_envelope(payload: serde_json::Value) -> serde_json::Value {
    match payload {
        serde_json::Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(serde_json::Value::Null)
        }
        other => other,
    }
}

fn list_query(filter: &TaskFilter) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(status) = filter.status {
        params.push(("status", status.label().to_string()));
    }
    if let Some(tags) = filter.tags.as_ref().filter(|tags| !tags.is_empty()) {
        params.push(("tags", tags.join(",")));
    }
    params
}

#[async_trait]
impl TaskBackend for HttpTaskBackend {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let req = self.request(Method::GET, "/tasks").query(&list_query(filter));
        let tasks: Option<Vec<Task>> = self.send_json(req).await?;
        Ok(tasks.unwrap_or_default())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(task_id = %task_id))]
    async fn get_task(&self, task_id: &str) -> Result<Task> {
        let req = self.request(Method::GET, &format!("/tasks/{task_id}"));
        self.send_json(req).await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn create_task(&self, new_task: &NewTask) -> Result<Task> {
        let req = self.request(Method::POST, "/tasks").json(new_task);
        self.send_json(req).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(task_id = %task_id))]
    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task> {
        let req = self
            .request(Method::PUT, &format!("/tasks/{task_id}"))
            .json(patch);
        self.send_json(req).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(task_id = %task_id))]
    async fn delete_task(&self, task_id: &str) -> Result<()> {
        let req = self.request(Method::DELETE, &format!("/tasks/{task_id}"));
        self.send(req).await?;
        Ok(())
    }
}
