//! SQLite backend for learned memory and execution persistence.
//!
//! One database file, three tables:
//! - `memory_entries`: keyed by `(scope, memory_type, key)`
//! - `executions`: one row per run, the full record kept as JSON
//! - `routing_history`: append-only routing decisions
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so they compare
//! lexicographically in SQL.

use agentpilot_core::error::StoreError;
use agentpilot_core::execution::{ExecutionId, ExecutionRecord};
use agentpilot_core::memory::{
    MemoryEntry, MemoryKey, MemoryQuery, MemoryStore, MemoryOrder, MemoryUpdate, MemoryWrite, SweepPolicy,
};
use agentpilot_core::persistence::ExecutionStore;
use agentpilot_core::routing::RoutingDecision;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A durable store implementing both [`MemoryStore`] and [`ExecutionStore`].
pub struct SqliteStore {
    pool: SqlitePool,
    /// Serialises read-modify-write cycles issued through `update`.
    update_lock: Mutex<()>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed(format!("bad timestamp '{s}': {e}")))
}

fn query_err(context: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::QueryFailed(format!("{context}: {e}"))
}

impl SqliteStore {
    /// Open (or create) a database at `path`.
    ///
    /// Pass `":memory:"` for an in-process ephemeral database.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let in_memory = path == ":memory:" || path == "sqlite::memory:";
        let url = if in_memory { "sqlite::memory:" } else { path };

        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // A shared-cache in-memory database locks whole tables across
        // connections, so it gets exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self {
            pool,
            update_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements = [
            (
                "memory_entries table",
                r#"
                CREATE TABLE IF NOT EXISTS memory_entries (
                    scope         TEXT NOT NULL,
                    memory_type   TEXT NOT NULL,
                    key           TEXT NOT NULL,
                    value         TEXT NOT NULL,
                    importance    REAL NOT NULL DEFAULT 0.0,
                    created_at    TEXT NOT NULL,
                    updated_at    TEXT NOT NULL,
                    last_accessed TEXT NOT NULL,
                    PRIMARY KEY (scope, memory_type, key)
                )
                "#,
            ),
            (
                "importance index",
                "CREATE INDEX IF NOT EXISTS idx_memory_scope_importance ON memory_entries(scope, importance DESC)",
            ),
            (
                "executions table",
                r#"
                CREATE TABLE IF NOT EXISTS executions (
                    id          TEXT PRIMARY KEY,
                    workflow_id TEXT NOT NULL,
                    agent_id    TEXT NOT NULL,
                    status      TEXT NOT NULL,
                    started_at  TEXT NOT NULL,
                    ended_at    TEXT,
                    record      TEXT NOT NULL
                )
                "#,
            ),
            (
                "routing_history table",
                r#"
                CREATE TABLE IF NOT EXISTS routing_history (
                    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
                    execution_id     TEXT NOT NULL,
                    agent_id         TEXT NOT NULL,
                    step_index       INTEGER NOT NULL,
                    step_type        TEXT NOT NULL,
                    tier             TEXT NOT NULL,
                    model_id         TEXT NOT NULL,
                    source           TEXT NOT NULL,
                    complexity_score REAL NOT NULL,
                    decided_at       TEXT NOT NULL,
                    decision         TEXT NOT NULL
                )
                "#,
            ),
            (
                "routing_history index",
                "CREATE INDEX IF NOT EXISTS idx_routing_history_execution ON routing_history(execution_id, seq)",
            ),
        ];

        for (name, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{name}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Parse a `MemoryEntry` from a row.
    fn row_to_entry(row: &SqliteRow) -> Result<MemoryEntry, StoreError> {
        let get = |col: &str| -> Result<String, StoreError> {
            row.try_get::<String, _>(col)
                .map_err(|e| StoreError::QueryFailed(format!("{col} column: {e}")))
        };

        let memory_type = get("memory_type")?.parse().map_err(StoreError::QueryFailed)?;
        let value = serde_json::from_str(&get("value")?)
            .map_err(|e| StoreError::QueryFailed(format!("value column: {e}")))?;
        let importance: f64 = row
            .try_get("importance")
            .map_err(|e| StoreError::QueryFailed(format!("importance column: {e}")))?;

        Ok(MemoryEntry {
            key: MemoryKey::new(get("scope")?, memory_type, get("key")?),
            value,
            importance,
            created_at: parse_ts(&get("created_at")?)?,
            updated_at: parse_ts(&get("updated_at")?)?,
            last_accessed: parse_ts(&get("last_accessed")?)?,
        })
    }

    fn upsert_query<'q>(key: &'q MemoryKey, value: String, importance: f64, now: String) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        sqlx::query(
            r#"
            INSERT INTO memory_entries (scope, memory_type, key, value, importance, created_at, updated_at, last_accessed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)
            ON CONFLICT(scope, memory_type, key) DO UPDATE SET
                value = excluded.value,
                importance = excluded.importance,
                updated_at = excluded.updated_at,
                last_accessed = excluded.last_accessed
            RETURNING *
            "#,
        )
        .bind(&key.scope)
        .bind(key.memory_type.as_str())
        .bind(&key.key)
        .bind(value)
        .bind(importance)
        .bind(now)
    }

    fn encode_value(write: &MemoryWrite) -> Result<String, StoreError> {
        serde_json::to_string(&write.value).map_err(|e| StoreError::Storage(format!("value serialization: {e}")))
    }

    /// Insert an entry verbatim, timestamps included.
    pub async fn import(&self, entry: &MemoryEntry) -> Result<(), StoreError> {
        let value = serde_json::to_string(&entry.value)
            .map_err(|e| StoreError::Storage(format!("value serialization: {e}")))?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO memory_entries
                (scope, memory_type, key, value, importance, created_at, updated_at, last_accessed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&entry.key.scope)
        .bind(entry.key.memory_type.as_str())
        .bind(&entry.key.key)
        .bind(value)
        .bind(entry.importance)
        .bind(ts(entry.created_at))
        .bind(ts(entry.updated_at))
        .bind(ts(entry.last_accessed))
        .execute(&self.pool)
        .await
        .map_err(query_err("import"))?;
        Ok(())
    }

    fn encode_record(record: &ExecutionRecord) -> Result<String, StoreError> {
        serde_json::to_string(record).map_err(|e| StoreError::Storage(format!("record serialization: {e}")))
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &MemoryKey) -> Result<Option<MemoryEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE memory_entries SET last_accessed = ?4
            WHERE scope = ?1 AND memory_type = ?2 AND key = ?3
            RETURNING *
            "#,
        )
        .bind(&key.scope)
        .bind(key.memory_type.as_str())
        .bind(&key.key)
        .bind(ts(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err("get"))?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn list_top(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StoreError> {
        let order_column = match query.order_by {
            MemoryOrder::Importance => "importance",
            MemoryOrder::LastAccessed => "last_accessed",
            MemoryOrder::UpdatedAt => "updated_at",
        };
        let type_filter = if query.memory_type.is_some() { "AND memory_type = ?4" } else { "" };
        let sql = format!(
            r#"
            SELECT * FROM memory_entries
            WHERE scope = ?1 AND importance >= ?2 {type_filter}
            ORDER BY {order_column} DESC
            LIMIT ?3
            "#
        );

        let mut db_query = sqlx::query(&sql)
            .bind(&query.scope)
            .bind(query.min_importance)
            .bind(query.limit as i64);
        if let Some(memory_type) = query.memory_type {
            db_query = db_query.bind(memory_type.as_str());
        }

        let rows = db_query.fetch_all(&self.pool).await.map_err(query_err("list_top"))?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn upsert(&self, key: &MemoryKey, write: MemoryWrite) -> Result<MemoryEntry, StoreError> {
        let value = Self::encode_value(&write)?;
        let row = Self::upsert_query(key, value, write.importance, ts(Utc::now()))
            .fetch_one(&self.pool)
            .await
            .map_err(query_err("upsert"))?;
        debug!(key = %key, "memory entry upserted");
        Self::row_to_entry(&row)
    }

    async fn update(&self, key: &MemoryKey, apply: MemoryUpdate) -> Result<Option<MemoryEntry>, StoreError> {
        let _guard = self.update_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(query_err("begin"))?;

        let current = sqlx::query("SELECT * FROM memory_entries WHERE scope = ?1 AND memory_type = ?2 AND key = ?3")
            .bind(&key.scope)
            .bind(key.memory_type.as_str())
            .bind(&key.key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err("update read"))?
            .as_ref()
            .map(Self::row_to_entry)
            .transpose()?;

        let Some(write) = apply(current.as_ref()) else {
            tx.rollback().await.map_err(query_err("rollback"))?;
            return Ok(current);
        };

        let value = Self::encode_value(&write)?;
        let row = Self::upsert_query(key, value, write.importance, ts(Utc::now()))
            .fetch_one(&mut *tx)
            .await
            .map_err(query_err("update write"))?;
        let entry = Self::row_to_entry(&row)?;
        tx.commit().await.map_err(query_err("commit"))?;
        Ok(Some(entry))
    }

    async fn sweep(&self, policy: &SweepPolicy) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - Duration::days(i64::from(policy.max_idle_days));
        let result = sqlx::query("DELETE FROM memory_entries WHERE importance < ?1 AND last_accessed < ?2")
            .bind(policy.min_importance)
            .bind(ts(cutoff))
            .execute(&self.pool)
            .await
            .map_err(query_err("sweep"))?;
        let removed = result.rows_affected() as usize;
        info!(removed, "memory sweep complete");
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM memory_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(query_err("count"))?;
        let n: i64 = row.try_get("n").map_err(query_err("count column"))?;
        Ok(n as usize)
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_execution_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_id, agent_id, status, started_at, ended_at, record)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.workflow_id)
        .bind(&record.agent_id)
        .bind(record.status.as_str())
        .bind(ts(record.started_at))
        .bind(record.ended_at.map(ts))
        .bind(Self::encode_record(record)?)
        .execute(&self.pool)
        .await
        .map_err(query_err("create execution"))?;
        Ok(())
    }

    async fn update_execution_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        // Terminal rows are never rewritten
        let result = sqlx::query(
            r#"
            UPDATE executions SET status = ?2, ended_at = ?3, record = ?4
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.status.as_str())
        .bind(record.ended_at.map(ts))
        .bind(Self::encode_record(record)?)
        .execute(&self.pool)
        .await
        .map_err(query_err("update execution"))?;

        if result.rows_affected() == 0 {
            return match self.get_execution_record(&record.id).await? {
                Some(_) => Err(StoreError::AlreadyClosed(record.id.to_string())),
                None => Err(StoreError::NotFound(record.id.to_string())),
            };
        }
        Ok(())
    }

    async fn append_routing_history(&self, decision: &RoutingDecision) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(decision)
            .map_err(|e| StoreError::Storage(format!("decision serialization: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO routing_history
                (execution_id, agent_id, step_index, step_type, tier, model_id, source, complexity_score, decided_at, decision)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(decision.execution_id.as_str())
        .bind(&decision.agent_id)
        .bind(decision.step_index as i64)
        .bind(decision.step_type.as_str())
        .bind(decision.tier.as_str())
        .bind(&decision.model_id)
        .bind(decision.source.to_string())
        .bind(decision.complexity_score)
        .bind(ts(decision.decided_at))
        .bind(encoded)
        .execute(&self.pool)
        .await
        .map_err(query_err("append routing history"))?;
        Ok(())
    }

    async fn get_execution_record(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query("SELECT record FROM executions WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err("get execution"))?;

        row.map(|row| {
            let json: String = row.try_get("record").map_err(query_err("record column"))?;
            serde_json::from_str(&json).map_err(|e| StoreError::QueryFailed(format!("record decode: {e}")))
        })
        .transpose()
    }

    async fn routing_history(&self, id: &ExecutionId) -> Result<Vec<RoutingDecision>, StoreError> {
        let rows = sqlx::query("SELECT decision FROM routing_history WHERE execution_id = ?1 ORDER BY seq")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("routing history"))?;

        rows.iter()
            .map(|row| {
                let json: String = row.try_get("decision").map_err(query_err("decision column"))?;
                serde_json::from_str(&json).map_err(|e| StoreError::QueryFailed(format!("decision decode: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentpilot_core::execution::ExecutionStatus;
    use agentpilot_core::memory::{MemoryType, memory_update};
    use agentpilot_core::routing::{ComplexityFactors, DecisionSource, StepType, Tier};
    use serde_json::json;
    use std::sync::Arc;

    async fn test_store() -> SqliteStore {
        SqliteStore::open(":memory:").await.unwrap()
    }

    fn write(value: serde_json::Value, importance: f64) -> MemoryWrite {
        MemoryWrite { value, importance }
    }

    fn decision(execution_id: &ExecutionId, step_index: usize, tier: Tier) -> RoutingDecision {
        RoutingDecision {
            execution_id: execution_id.clone(),
            agent_id: "agent-1".into(),
            step_index,
            step_type: StepType::LlmDecision,
            tier,
            model_id: "gpt-4o-mini".into(),
            source: DecisionSource::Complexity,
            complexity_score: 2.1,
            effective_complexity: 2.1,
            agent_score: 2.0,
            factors: ComplexityFactors::default(),
            memory_confidence: None,
            memory_success_rate: None,
            decided_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_get_and_count() {
        let db = test_store().await;
        let key = MemoryKey::routing_pattern("agent-1", "transform");
        let first = db.upsert(&key, write(json!({"success_rate": 1.0}), 1.0)).await.unwrap();
        let second = db.upsert(&key, write(json!({"success_rate": 0.7}), 2.0)).await.unwrap();
        assert_eq!(first.created_at, second.created_at);

        let entry = db.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.value["success_rate"], 0.7);
        assert_eq!(entry.importance, 2.0);
        assert_eq!(db.count().await.unwrap(), 1);
        assert!(db.get(&MemoryKey::routing_pattern("agent-1", "api_call")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_is_atomic_under_concurrency() {
        let db = Arc::new(test_store().await);
        let key = MemoryKey::routing_pattern("agent-1", "llm_decision");

        let mut handles = Vec::new();
        for _ in 0..20 {
            let db = db.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                db.update(
                    &key,
                    memory_update(|current| {
                        let n = current.and_then(|e| e.value["n"].as_u64()).unwrap_or(0);
                        Some(MemoryWrite { value: json!({"n": n + 1}), importance: 1.0 })
                    }),
                )
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(db.get(&key).await.unwrap().unwrap().value["n"], 20);
    }

    #[tokio::test]
    async fn list_top_filters_type_and_orders() {
        let db = test_store().await;
        db.upsert(&MemoryKey::new("agent-1", MemoryType::RoutingPattern, "a"), write(json!({}), 4.0))
            .await
            .unwrap();
        db.upsert(&MemoryKey::new("agent-1", MemoryType::RoutingPattern, "b"), write(json!({}), 8.0))
            .await
            .unwrap();
        db.upsert(&MemoryKey::new("agent-1", MemoryType::ExecutionOutcome, "wf"), write(json!({}), 9.0))
            .await
            .unwrap();

        let query = MemoryQuery::scope("agent-1").of_type(MemoryType::RoutingPattern);
        let top = db.list_top(&query).await.unwrap();
        let keys: Vec<_> = top.iter().map(|e| e.key.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);

        let all = db.list_top(&MemoryQuery::scope("agent-1").limit(1)).await.unwrap();
        assert_eq!(all[0].key.memory_type, MemoryType::ExecutionOutcome);
    }

    #[tokio::test]
    async fn sweep_respects_importance_and_age() {
        let db = test_store().await;
        let old = Utc::now() - Duration::days(100);
        for (key, importance) in [("old-low", 2.0), ("old-high", 5.0)] {
            db.import(&MemoryEntry {
                key: MemoryKey::new("agent-1", MemoryType::UserPreference, key),
                value: json!({}),
                importance,
                created_at: old,
                updated_at: old,
                last_accessed: old,
            })
            .await
            .unwrap();
        }
        db.upsert(&MemoryKey::new("agent-1", MemoryType::UserPreference, "new-low"), write(json!({}), 1.0))
            .await
            .unwrap();

        assert_eq!(db.sweep(&SweepPolicy::default()).await.unwrap(), 1);
        assert_eq!(db.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn execution_record_lifecycle() {
        let db = test_store().await;
        let mut record = ExecutionRecord::start(ExecutionId::new(), "wf", "agent-1");
        db.create_execution_record(&record).await.unwrap();

        record.steps_executed = 2;
        db.update_execution_record(&record).await.unwrap();

        record.close(ExecutionStatus::PartialSuccess, None).unwrap();
        db.update_execution_record(&record).await.unwrap();
        assert!(matches!(
            db.update_execution_record(&record).await,
            Err(StoreError::AlreadyClosed(_))
        ));

        let stored = db.get_execution_record(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::PartialSuccess);
        assert_eq!(stored.steps_executed, 2);

        let ghost = ExecutionRecord::start(ExecutionId::new(), "wf", "agent-1");
        assert!(matches!(db.update_execution_record(&ghost).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn routing_history_is_ordered_per_execution() {
        let db = test_store().await;
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        db.append_routing_history(&decision(&a, 0, Tier::Fast)).await.unwrap();
        db.append_routing_history(&decision(&b, 0, Tier::Powerful)).await.unwrap();
        db.append_routing_history(&decision(&a, 1, Tier::Balanced)).await.unwrap();

        let history = db.routing_history(&a).await.unwrap();
        let tiers: Vec<_> = history.iter().map(|d| d.tier).collect();
        assert_eq!(tiers, vec![Tier::Fast, Tier::Balanced]);
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentpilot.db");
        let path = path.to_str().unwrap();
        let key = MemoryKey::routing_pattern("agent-1", "api_call");

        {
            let db = SqliteStore::open(path).await.unwrap();
            db.upsert(&key, write(json!({"tier": "fast"}), 3.0)).await.unwrap();
        }

        let db = SqliteStore::open(path).await.unwrap();
        assert_eq!(db.get(&key).await.unwrap().unwrap().value["tier"], "fast");
    }
}
