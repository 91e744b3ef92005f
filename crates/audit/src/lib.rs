//! Audit trail for AgentPilot.
//!
//! The engine emits one structured entry per significant run transition
//! (run started, step routed, step completed, run completed/failed). Each
//! entry carries a severity and a compliance tag. Recording never blocks the
//! caller: sinks either write synchronously to cheap targets (tracing, an
//! in-memory buffer) or hand the entry to a channel drained elsewhere.

pub mod entry;
pub mod logger;

pub use entry::{AuditEntry, AuditEvent, AuditOutcome, Severity};
pub use logger::{AuditLogger, AuditSink, ChannelSink, TracingSink};
