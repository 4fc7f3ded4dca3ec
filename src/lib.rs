pub mod args;
pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod runtime;
pub mod service;
pub mod session;
pub mod theme;

// Re-export the core session types at crate root for convenience
pub use chat::{ChatEntry, ChatLog, Role};
pub use client::{ClientUpdate, SubmitOutcome, SubmitRejection, TaskSessionClient};
pub use error::{ServiceError, SessionError};
pub use runtime::{ClientHandle, EntryFollower, spawn_client};
pub use service::{HttpTaskService, TaskService};
pub use session::{SessionState, TaskSession};
