//! Audit logger and sinks.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::entry::{AuditEntry, AuditEvent, AuditOutcome};

/// Where audit entries are written.
///
/// `record` must not block: the engine calls it inline while a run is active.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Audit logger that keeps the most recent entries in memory and forwards
/// every entry to its sinks.
pub struct AuditLogger {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("entry_count", &self.count())
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

const DEFAULT_CAPACITY: usize = 10_000;

impl AuditLogger {
    /// Create a new audit logger with no sinks.
    pub fn new() -> Self {
        Self::with_sinks(Vec::new())
    }

    /// Create a new audit logger with the given sinks.
    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: DEFAULT_CAPACITY,
            sinks,
        }
    }

    /// Limit how many entries are retained in memory (oldest dropped first).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an audit event, classified with its default severity and tag.
    pub fn log(&self, event: AuditEvent, actor: &str, target: &str, outcome: AuditOutcome, details: Option<String>) {
        let (severity, tag) = event.classify();
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
            actor: actor.into(),
            target: target.into(),
            outcome,
            severity,
            compliance_tag: tag.into(),
            details,
        };

        {
            let mut buffer = self.buffer();
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(entry.clone());
        }

        for sink in &self.sinks {
            sink.record(&entry);
        }
    }

    /// Get all retained entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.buffer().iter().cloned().collect()
    }

    /// Entries belonging to one execution.
    pub fn entries_for(&self, execution_id: &str) -> Vec<AuditEntry> {
        self.buffer()
            .iter()
            .filter(|e| e.target == execution_id)
            .cloned()
            .collect()
    }

    /// Get entries filtered by outcome.
    pub fn entries_by_outcome(&self, outcome: AuditOutcome) -> Vec<AuditEntry> {
        self.buffer().iter().filter(|e| e.outcome == outcome).cloned().collect()
    }

    /// Count of retained entries.
    pub fn count(&self) -> usize {
        self.buffer().len()
    }
}

/// A tracing-based audit sink that logs entries via `tracing`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        match entry.severity {
            crate::Severity::Critical => tracing::warn!(
                event = ?entry.event,
                actor = %entry.actor,
                execution_id = %entry.target,
                outcome = ?entry.outcome,
                tag = %entry.compliance_tag,
                details = ?entry.details,
                "AUDIT"
            ),
            _ => tracing::info!(
                event = ?entry.event,
                actor = %entry.actor,
                execution_id = %entry.target,
                outcome = ?entry.outcome,
                tag = %entry.compliance_tag,
                "AUDIT"
            ),
        }
    }
}

/// Hands entries to an unbounded channel so a background task can ship them
/// (to a database, a webhook) without the engine waiting.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AuditEntry>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelSink {
    fn record(&self, entry: &AuditEntry) {
        if self.tx.send(entry.clone()).is_err() {
            tracing::debug!("audit channel closed, dropping entry");
        }
    }
}
