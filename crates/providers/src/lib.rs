//! Model providers and API action callers for AgentPilot.
//!
//! All providers implement `agentpilot_core::Provider`; all `api_call`
//! targets implement `agentpilot_core::ApiCaller`. The router selects the
//! provider for a model id, the registry selects the caller for an operation.

pub mod actions;
pub mod openai_compat;
pub mod router;

pub use actions::{ApiRegistry, EchoAction, EmailAction, EmailFetchAction, HttpApiCaller, LogAction};
pub use openai_compat::OpenAiCompatProvider;
pub use router::{ProviderRouter, build_from_config};
