//! NexusTodo agent server: state wiring, HTTP layers and graceful shutdown.

use crate::assistant::AssistantAgent;
use crate::config::{AgentConfig, BackendMode};
use crate::planner::{LlmPlanner, Planner};
use crate::routes;
use crate::session::SessionStore;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use chrono::{DateTime, Utc};
use nt_llm::{ChatMessage, LlmClient, LlmClientConfig};
use nt_tasks::{BackendIdentity, HttpTaskBackend, HttpTaskBackendConfig, InMemoryTaskBackend, TaskBackend};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Task store shared by all requests. HTTP mode scopes a client to each caller.
#[derive(Clone)]
pub enum BackendHandle {
    Http(HttpTaskBackend),
    Memory(Arc<InMemoryTaskBackend>),
}

impl BackendHandle {
    pub fn from_config(cfg: &AgentConfig) -> Result<Self> {
        match cfg.backend.mode {
            BackendMode::Http => {
                let http = HttpTaskBackend::new(HttpTaskBackendConfig {
                    base_url: cfg.backend.base_url.clone(),
                    timeout: cfg.backend_timeout(),
                })?;
                tracing::info!(base_url = %http.base_url(), "task service client configured");
                Ok(BackendHandle::Http(http))
            }
            BackendMode::Memory => Ok(BackendHandle::Memory(Arc::new(InMemoryTaskBackend::new()))),
        }
    }

    pub fn for_identity(&self, identity: BackendIdentity) -> Arc<dyn TaskBackend> {
        match self {
            BackendHandle::Http(http) => Arc::new(http.with_identity(identity)),
            BackendHandle::Memory(memory) => memory.clone(),
        }
    }

    pub fn mode(&self) -> BackendMode {
        match self {
            BackendHandle::Http(_) => BackendMode::Http,
            BackendHandle::Memory(_) => BackendMode::Memory,
        }
    }
}

pub struct AgentState {
    pub agent: Arc<AssistantAgent>,
    pub backend: BackendHandle,
    pub sse_chunk_size: usize,
    pub model: String,
    pub started_at: DateTime<Utc>,
    /// Cancelled on SIGTERM/ctrl-c; open event streams end so graceful shutdown can drain.
    pub shutdown: CancellationToken,
}

impl AgentState {
    pub fn new(cfg: &AgentConfig, planner: Arc<dyn Planner>, backend: BackendHandle) -> Self {
        let sessions = Arc::new(SessionStore::new(cfg.agent.max_session_messages));
        Self {
            agent: Arc::new(AssistantAgent::new(planner, sessions, &cfg.agent)),
            backend,
            sse_chunk_size: cfg.agent.sse_chunk_size.max(1),
            model: cfg.llm.model.clone(),
            started_at: Utc::now(),
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn build_llm_client(cfg: &AgentConfig) -> Result<LlmClient> {
    if cfg.llm.model_type != "chat" {
        tracing::warn!(model_type = %cfg.llm.model_type, "only chat models are supported; using chat completions");
    }
    let client = LlmClient::new(LlmClientConfig {
        base_url: cfg.llm.base_url.clone(),
        api_key: cfg.llm.api_key.clone(),
        model: cfg.llm.model.clone(),
        temperature: Some(cfg.llm.temperature),
        timeout: cfg.llm_timeout(),
    })?;
    tracing::info!(model = %client.model(), base_url = %client.base_url(), "llm client configured");
    Ok(client)
}

pub fn build_state(cfg: &AgentConfig) -> Result<Arc<AgentState>> {
    let planner: Arc<dyn Planner> = Arc::new(LlmPlanner::new(
        build_llm_client(cfg)?,
        cfg.planner.max_retries,
    ));
    let backend = BackendHandle::from_config(cfg)?;
    Ok(Arc::new(AgentState::new(cfg, planner, backend)))
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AgentConfig::load(config_path).await?;
    let addr = parse_bind_addr(&cfg.server.bind_addr)?;
    build_llm_client(&cfg)?;
    BackendHandle::from_config(&cfg)?;
    tracing::info!(
        bind_addr = %addr,
        llm_base_url = %cfg.llm.base_url,
        model = %cfg.llm.model,
        backend_mode = ?cfg.backend.mode,
        backend_base_url = %cfg.backend.base_url,
        react_max_steps = cfg.agent.react_max_steps,
        max_session_messages = cfg.agent.max_session_messages,
        "config ok"
    );
    println!("nexustodo-agent doctor: config ok");
    println!("  bind_addr      {addr}");
    println!("  llm            {} ({})", cfg.llm.model, cfg.llm.base_url);
    println!("  backend        {:?} ({})", cfg.backend.mode, cfg.backend.base_url);
    println!("  max_steps      {}", cfg.agent.react_max_steps);
    Ok(())
}

/// Runs a single turn from the command line and prints the result JSON.
pub async fn chat_once(config_path: Option<PathBuf>, message: &str, session_id: Option<&str>) -> Result<()> {
    let cfg = AgentConfig::load(config_path).await?;
    let state = build_state(&cfg)?;
    let env = |key: &str| std::env::var(key).unwrap_or_default();
    let backend = state.backend.for_identity(BackendIdentity {
        authorization: env("NEXUSTODO_TOKEN"),
        user_id: env("NEXUSTODO_USER_ID"),
        device_id: env("NEXUSTODO_DEVICE_ID"),
    });
    let turn = state
        .agent
        .run_turn(backend.as_ref(), session_id, vec![ChatMessage::user(message)])
        .await?;
    println!("{}", serde_json::to_string_pretty(&turn)?);
    Ok(())
}

pub fn build_app(state: Arc<AgentState>, cfg: &AgentConfig) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AgentConfig::load(config_path).await?;
    let addr = parse_bind_addr(&cfg.server.bind_addr)?;
    tracing::info!(
        bind_addr = %addr,
        model = %cfg.llm.model,
        llm_base_url = %cfg.llm.base_url,
        backend_mode = ?cfg.backend.mode,
        backend_base_url = %cfg.backend.base_url,
        react_max_steps = cfg.agent.react_max_steps,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        "nexustodo agent starting"
    );

    let state = build_state(&cfg)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind failed for {addr}: {e}"))?;
    let shutdown = state.shutdown.clone();
    let app = build_app(state, &cfg);

    tracing::info!(%addr, "nexustodo agent serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    tracing::info!("http server shutdown completed");
    Ok(())
}

fn parse_bind_addr(raw: &str) -> Result<SocketAddr> {
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {raw:?}: {e}"))
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
pub(crate) fn test_state(planner: Arc<dyn Planner>) -> (Arc<AgentState>, Arc<InMemoryTaskBackend>) {
    let memory = Arc::new(InMemoryTaskBackend::new());
    let cfg = AgentConfig::default();
    let state = AgentState::new(&cfg, planner, BackendHandle::Memory(memory.clone()));
    (Arc::new(state), memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_must_be_socket_addr() {
        assert_eq!(
            parse_bind_addr("0.0.0.0:15590").expect("addr").port(),
            15590
        );
        assert!(parse_bind_addr("localhost").is_err());
    }

    #[test]
    fn memory_backend_ignores_identity() {
        let mut cfg = AgentConfig::default();
        cfg.backend.mode = BackendMode::Memory;
        let handle = BackendHandle::from_config(&cfg).expect("backend");
        assert_eq!(handle.mode(), BackendMode::Memory);
        let a = handle.for_identity(BackendIdentity::default());
        let b = handle.for_identity(BackendIdentity {
            authorization: "Bearer x".to_string(),
            user_id: "u".to_string(),
            device_id: "d".to_string(),
        });
        assert!(std::ptr::addr_eq(Arc::as_ptr(&a), Arc::as_ptr(&b)));
    }
}
