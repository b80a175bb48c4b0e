//! OpenAI-compatible chat client used by the task assistant planner.
//!
//! Pure HTTP client: no knowledge of tasks, sessions or the planning loop.

mod client;
mod error;
mod openai;
mod types;

pub use client::{LlmClient, LlmClientConfig};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
