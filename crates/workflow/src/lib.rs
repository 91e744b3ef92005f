//! Workflow engine: definitions, the step interpreter, guardrails, run
//! lifecycle and interval scheduling.

pub mod context;
pub mod definition;
pub mod error;
pub mod executor;
pub mod expression;
pub mod guardrails;
pub mod manager;
pub mod scheduler;
pub mod schema;

pub use context::ExecutionContext;
pub use definition::{InputBinding, Step, StepKind, ValueRef, Workflow};
pub use error::WorkflowError;
pub use executor::{Collaborators, ExecutionOutcome, StepExecutor, preview_inputs, step_profile};
pub use expression::{Expr, ExprError};
pub use guardrails::{CircuitBreaker, LoopDetector, RetryPolicy, TokenBudget};
pub use manager::{ExecutionManager, ExecutionReport};
pub use scheduler::{IntervalScheduler, Schedule, TriggeredRun};
pub use schema::{OutputSchema, SchemaType};
