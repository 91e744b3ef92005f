//! Memory and persistence backends for AgentPilot.
//!
//! - [`InMemoryMemoryStore`] / [`InMemoryExecutionStore`]: tests and ephemeral runs
//! - [`NoopExecutionStore`]: persistence disabled
//! - [`SqliteStore`]: durable store implementing both traits

pub mod in_memory;
pub mod noop;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::{InMemoryExecutionStore, InMemoryMemoryStore};
pub use noop::NoopExecutionStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
