//! # AgentPilot Core
//!
//! Domain types, collaborator traits, and error definitions for the AgentPilot
//! orchestration engine. This crate has **no framework dependencies**: it
//! defines the model every other crate implements against.
//!
//! ## Collaborators
//!
//! The execution core talks to the outside world only through the traits
//! declared here:
//! - [`Provider`]: the Model Invocation Port (chat completion against a model id)
//! - [`ApiCaller`]: external `api_call` operations
//! - [`MemoryStore`]: learned patterns keyed by (scope, type, key)
//! - [`ExecutionStore`]: execution records and append-only routing history
//!
//! Implementations live in their respective crates, which keeps the
//! interpreter testable with fakes.

pub mod api;
pub mod error;
pub mod event;
pub mod execution;
pub mod memory;
pub mod message;
pub mod persistence;
pub mod provider;
pub mod routing;

// Re-export key types at crate root for ergonomics
pub use api::{ApiCaller, ApiRequest, ApiResponse};
pub use error::{Error, ProviderError, Result, StoreError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use execution::{ExecutionId, ExecutionRecord, ExecutionStatus};
pub use memory::{
    MemoryEntry, MemoryKey, MemoryOrder, MemoryQuery, MemoryStore, MemoryType, MemoryUpdate, MemoryWrite,
    SweepPolicy, memory_update,
};
pub use message::{Message, MessageToolCall, Role};
pub use persistence::ExecutionStore;
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use routing::{ComplexityFactors, DecisionSource, RoutingDecision, StepType, Tier};
