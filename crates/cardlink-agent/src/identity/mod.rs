//! Agent identity persistence.

mod store;

pub use store::{AgentIdentity, AgentPaths, IdentityError};
