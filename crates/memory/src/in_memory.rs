//! In-memory backends: useful for testing and ephemeral runs.

use agentpilot_core::error::StoreError;
use agentpilot_core::execution::{ExecutionId, ExecutionRecord};
use agentpilot_core::memory::{
    MemoryEntry, MemoryKey, MemoryQuery, MemoryStore, MemoryUpdate, MemoryWrite, SweepPolicy,
};
use agentpilot_core::persistence::ExecutionStore;
use agentpilot_core::routing::RoutingDecision;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A memory store backed by a `HashMap`.
///
/// `update` holds the write lock across the caller's closure, so
/// read-modify-write cycles on the same key never interleave.
pub struct InMemoryMemoryStore {
    entries: RwLock<HashMap<MemoryKey, MemoryEntry>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert an entry verbatim, timestamps included.
    pub async fn import(&self, entry: MemoryEntry) {
        self.entries.write().await.insert(entry.key.clone(), entry);
    }

    fn write_entry(entries: &mut HashMap<MemoryKey, MemoryEntry>, key: &MemoryKey, write: MemoryWrite) -> MemoryEntry {
        let now = Utc::now();
        let entry = entries.entry(key.clone()).or_insert_with(|| MemoryEntry {
            key: key.clone(),
            value: serde_json::Value::Null,
            importance: 0.0,
            created_at: now,
            updated_at: now,
            last_accessed: now,
        });
        entry.value = write.value;
        entry.importance = write.importance;
        entry.updated_at = now;
        entry.last_accessed = now;
        entry.clone()
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get(&self, key: &MemoryKey) -> Result<Option<MemoryEntry>, StoreError> {
        let mut entries = self.entries.write().await;
        Ok(entries.get_mut(key).map(|entry| {
            entry.last_accessed = Utc::now();
            entry.clone()
        }))
    }

    async fn list_top(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StoreError> {
        let entries = self.entries.read().await;
        let mut results: Vec<MemoryEntry> = entries.values().filter(|e| query.matches(e)).cloned().collect();
        query.sort(&mut results);
        results.truncate(query.limit);
        Ok(results)
    }

    async fn upsert(&self, key: &MemoryKey, write: MemoryWrite) -> Result<MemoryEntry, StoreError> {
        let mut entries = self.entries.write().await;
        Ok(Self::write_entry(&mut entries, key, write))
    }

    async fn update(&self, key: &MemoryKey, apply: MemoryUpdate) -> Result<Option<MemoryEntry>, StoreError> {
        let mut entries = self.entries.write().await;
        match apply(entries.get(key)) {
            Some(write) => Ok(Some(Self::write_entry(&mut entries, key, write))),
            None => Ok(entries.get(key).cloned()),
        }
    }

    async fn sweep(&self, policy: &SweepPolicy) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !policy.is_expired(e, now));
        Ok(before - entries.len())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.entries.read().await.len())
    }
}

/// Execution records and routing history kept in process memory.
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
    history: RwLock<Vec<RoutingDecision>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Every routing decision across all runs, in append order.
    pub async fn all_routing_history(&self) -> Vec<RoutingDecision> {
        self.history.read().await.clone()
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_execution_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Storage(format!("execution {} already exists", record.id)));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_execution_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(existing) if existing.is_closed() => Err(StoreError::AlreadyClosed(record.id.to_string())),
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id.to_string())),
        }
    }

    async fn append_routing_history(&self, decision: &RoutingDecision) -> Result<(), StoreError> {
        self.history.write().await.push(decision.clone());
        Ok(())
    }

    async fn get_execution_record(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn routing_history(&self, id: &ExecutionId) -> Result<Vec<RoutingDecision>, StoreError> {
        Ok(self
            .history
            .read()
            .await
            .iter()
            .filter(|d| &d.execution_id == id)
            .cloned()
            .collect())
    }
}
