//! Domain types shared by every tumbler crate.
//!
//! Pure data and validation only: no I/O, no locking, no async. The
//! stateful components (registry, store, event bus, coordinator) live in
//! `tumbler-events` and `tumbler-pipeline`.

pub mod definition;
pub mod error;
pub mod path;
pub mod state;
pub mod types;
