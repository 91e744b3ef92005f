//! MemoryStore trait: the keyed store of learned patterns.
//!
//! Entries are addressed by `(scope, memory type, key)`. The scope is usually
//! an agent id, the key a step type or workflow id. Entries are upserted and
//! only ever removed by an importance/staleness sweep, which runs outside the
//! execution hot path.
//!
//! Concurrent learning updates to the same key must not lose writes, so the
//! trait exposes an atomic read-modify-write ([`MemoryStore::update`]) next to
//! the plain `upsert`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// What kind of knowledge an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Per (agent, step type) tier success statistics
    RoutingPattern,
    /// Per (agent, workflow) run outcome statistics
    ExecutionOutcome,
    /// Free-form operator preferences
    UserPreference,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoutingPattern => "routing_pattern",
            Self::ExecutionOutcome => "execution_outcome",
            Self::UserPreference => "user_preference",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "routing_pattern" => Ok(Self::RoutingPattern),
            "execution_outcome" => Ok(Self::ExecutionOutcome),
            "user_preference" => Ok(Self::UserPreference),
            other => Err(format!("unknown memory type '{other}'")),
        }
    }
}

/// Composite address of one memory entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryKey {
    pub scope: String,
    pub memory_type: MemoryType,
    pub key: String,
}

impl MemoryKey {
    pub fn new(scope: impl Into<String>, memory_type: MemoryType, key: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            memory_type,
            key: key.into(),
        }
    }

    /// A routing pattern for `(agent, step_type)`.
    pub fn routing_pattern(agent_id: &str, step_type: &str) -> Self {
        Self::new(agent_id, MemoryType::RoutingPattern, step_type)
    }
}

impl std::fmt::Display for MemoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.memory_type, self.key)
    }
}

/// A single stored entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: MemoryKey,

    /// Type-specific payload (e.g. an encoded routing pattern)
    pub value: serde_json::Value,

    /// 0 to 10; low-importance entries are eligible for sweeping
    pub importance: f64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Refreshed on every `get`
    pub last_accessed: DateTime<Utc>,
}

/// The payload a writer supplies; the store owns the timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWrite {
    pub value: serde_json::Value,
    pub importance: f64,
}

/// Read-modify-write closure for [`MemoryStore::update`].
///
/// Receives the current entry (if any). Returning `None` leaves the store
/// untouched.
pub type MemoryUpdate = Box<dyn FnOnce(Option<&MemoryEntry>) -> Option<MemoryWrite> + Send>;

/// Box a closure as a [`MemoryUpdate`].
pub fn memory_update<F>(apply: F) -> MemoryUpdate
where
    F: FnOnce(Option<&MemoryEntry>) -> Option<MemoryWrite> + Send + 'static,
{
    Box::new(apply)
}

/// Sort order for `list_top`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOrder {
    #[default]
    Importance,
    LastAccessed,
    UpdatedAt,
}

/// A listing query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub scope: String,

    /// Restrict to one memory type
    #[serde(default)]
    pub memory_type: Option<MemoryType>,

    #[serde(default)]
    pub min_importance: f64,

    #[serde(default = "default_limit")]
    pub limit: usize,

    #[serde(default)]
    pub order_by: MemoryOrder,
}

fn default_limit() -> usize {
    10
}

impl MemoryQuery {
    pub fn scope(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            memory_type: None,
            min_importance: 0.0,
            limit: default_limit(),
            order_by: MemoryOrder::default(),
        }
    }

    pub fn of_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether an entry passes the scope/type/importance filters.
    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        entry.key.scope == self.scope
            && self.memory_type.is_none_or(|t| t == entry.key.memory_type)
            && entry.importance >= self.min_importance
    }

    /// Sort entries in place according to `order_by` (descending).
    pub fn sort(&self, entries: &mut [MemoryEntry]) {
        match self.order_by {
            MemoryOrder::Importance => entries.sort_by(|a, b| b.importance.total_cmp(&a.importance)),
            MemoryOrder::LastAccessed => entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed)),
            MemoryOrder::UpdatedAt => entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
        }
    }
}

/// Which entries a maintenance sweep removes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPolicy {
    /// Entries strictly below this importance are candidates
    pub min_importance: f64,

    /// ...and only if unused for longer than this many days
    pub max_idle_days: u32,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            min_importance: 3.0,
            max_idle_days: 90,
        }
    }
}

impl SweepPolicy {
    /// Both conditions must hold: low importance AND stale.
    pub fn is_expired(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> bool {
        entry.importance < self.min_importance
            && now - entry.last_accessed > Duration::days(i64::from(self.max_idle_days))
    }
}

/// The core MemoryStore trait.
///
/// Implementations: in-memory (tests, ephemeral runs), SQLite.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// The backend name (e.g. "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Fetch one entry, refreshing its `last_accessed`.
    async fn get(&self, key: &MemoryKey) -> Result<Option<MemoryEntry>, StoreError>;

    /// Top-N entries of a scope after filtering and ordering.
    async fn list_top(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StoreError>;

    /// Insert or overwrite an entry.
    async fn upsert(&self, key: &MemoryKey, write: MemoryWrite) -> Result<MemoryEntry, StoreError>;

    /// Atomically read, transform and write one entry.
    ///
    /// No other write to the same key may interleave between the read and the
    /// write. Returns the entry as stored afterwards.
    async fn update(&self, key: &MemoryKey, apply: MemoryUpdate) -> Result<Option<MemoryEntry>, StoreError>;

    /// Remove entries the policy marks as expired. Returns how many were removed.
    async fn sweep(&self, policy: &SweepPolicy) -> Result<usize, StoreError>;

    /// Total number of entries.
    async fn count(&self) -> Result<usize, StoreError>;
}
