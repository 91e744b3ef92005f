//! Complexity-based routing for AgentPilot.
//!
//! - [`TaskComplexityAnalyzer`] scores a step 0 to 10 from six weighted factors
//! - [`RoutingEngine`] turns that score, the agent score and any learned
//!   pattern into a [`RoutingDecision`](agentpilot_core::RoutingDecision)
//! - [`LearningEngine`] folds each step outcome back into the pattern with an
//!   exponential moving average

pub mod complexity;
pub mod learning;
pub mod pattern;
pub mod router;

pub use complexity::{ComplexityAnalyzer, ComplexityAssessment, StepProfile, TaskComplexityAnalyzer, estimate_tokens};
pub use learning::{LearningEngine, Observation, RunOutcome, apply_observation};
pub use pattern::RoutingPattern;
pub use router::{RouteRequest, RoutingEngine};
