//! HTTP API for the task rewards service.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET /api/tasks` - List tasks with the caller's progress
//! - `POST /api/tasks/check` - Check a task and grant its reward when complete

mod auth;
mod error;
mod routes;
pub mod types;

pub use auth::AuthUser;
pub use error::NOT_COMPLETED;
pub use routes::{app, serve, AppState};
pub use types::*;
