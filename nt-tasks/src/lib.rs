//! Task store access for the NexusTodo assistant.
//!
//! The assistant core only sees [`TaskBackend`]; the HTTP implementation talks to the
//! task service, the in-memory one backs tests and local development.

mod error;
mod http;
mod memory;
mod traits;
mod types;

pub use error::{BackendError, Result};
pub use http::{BackendIdentity, HttpTaskBackend, HttpTaskBackendConfig};
pub use memory::InMemoryTaskBackend;
pub use traits::TaskBackend;
pub use types::{NewTask, Task, TaskFilter, TaskPatch, TaskStatus};
