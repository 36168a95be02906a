//! # Task Rewards
//!
//! Verifies that a user has completed a gamified task and grants its reward
//! exactly once.
//!
//! This library provides:
//! - An HTTP API for checking and listing tasks
//! - Completion strategies for channel membership, referrals and timed visits
//! - A progress store whose reward grant is a single conditional write
//!
//! ## Check Flow
//!
//! ```text
//!   POST /api/tasks/check ──► Dispatcher ──► strategy (per TaskKind)
//!                                 │               │
//!                                 │               ├─ MembershipClient (Bot API)
//!                                 │               ├─ IdentityVerifier (init data)
//!                                 │               └─ Clock
//!                                 ▼
//!                          ProgressStore::grant_reward (at most once)
//! ```
//!
//! ## Modules
//! - `task`: Task kinds, progress records, strategies and the dispatcher
//! - `store`: Progress storage (SQLite, in-memory)
//! - `telegram`: Bot API membership client and init data verification
//! - `api`: axum routes and bearer auth

pub mod api;
pub mod clock;
pub mod config;
pub mod store;
pub mod task;
pub mod telegram;
pub mod util;

pub use config::Config;
pub use task::{Dispatcher, Outcome, TaskError};
