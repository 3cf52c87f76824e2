//! Request handlers.
//!
//! Each submodule provides the async handler functions for one resource.
//! Handlers delegate to the [`Tracker`](tumbler_pipeline::Tracker) held in
//! [`AppState`](crate::state::AppState) and map errors via
//! [`AppError`](crate::error::AppError).

pub mod executions;
pub mod jobs;
pub mod stream;
pub mod submit;
