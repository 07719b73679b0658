//! Client Module
//!
//! Retrying wrappers around the backend drivers.
//!
//! ## Responsibilities
//! - `RetryingClient`: blocking calls, sleeps between retries
//! - `AsyncClient`: the same verbs as futures, run on a bounded pool
//! - `RetryPolicy`: one classification shared by both, so identical error
//!   sequences produce identical retry decisions

mod async_client;
mod retry;
mod sync_client;

pub use async_client::{AsyncClient, WorkerPool};
pub use retry::{Decision, RetryEvent, RetryHook, RetryPolicy, RetryState};
pub use sync_client::{RetryingClient, Sleeper};
