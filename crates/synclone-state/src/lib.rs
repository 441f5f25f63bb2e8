//! Durable session state for synclone runs.
//!
//! One JSON file per (provider, organization) session, written atomically so
//! a crash mid-write never leaves a torn record. [`store::SessionStore`] owns
//! all disk access; [`models::CloneState`] is the record it persists.

pub mod models;
pub mod store;

pub use models::{
    CloneState, CloneStrategy, CompletedRepo, FailedRepo, SessionId, SessionStatus, StateProgress,
};
pub use store::{SessionStore, StateError};
