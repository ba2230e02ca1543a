//! Queue database connection and initialization.

pub use cardlink_core::db::DatabaseError;

cardlink_core::define_database!(QueueDatabase, "Queue database migrations complete");
