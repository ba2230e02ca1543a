//! `SQLite` storage for the Cardlink agent.
//!
//! Provides persistence for the deferred job queue.

mod db;
mod models;
mod queries;

pub use db::{DatabaseError, QueueDatabase};
pub use models::*;
