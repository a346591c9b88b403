//! Feedback and policy store - SQLite-backed feedback log and policy-state document
//!
//! Each document sits behind its own lock, so feedback writes never block policy reads and
//! vice versa. Caches are filled lazily on first access. A write updates disk and cache inside
//! the same exclusive section and only commits the cache once the row is durable.

pub mod migration;
pub mod schema;

pub use migration::MigrationManager;
pub use schema::*;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, error, info};

use crate::error::StoreError;

/// Hints returned per context lookup.
pub const CONTEXT_HINT_CAP: usize = 10;
const RECENT_NEGATIVE_SAMPLES: usize = 10;

pub struct FeedbackStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    feedback: RwLock<Option<Vec<FeedbackRecord>>>,
    policy: RwLock<Option<PolicyState>>,
}

impl FeedbackStore {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening feedback store at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        Self::with_pool(pool)
    }

    /// Single-connection in-memory store; every pooled handle sees the same database.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        Self::with_pool(pool)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>) -> anyhow::Result<Self> {
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        info!("Feedback store initialized successfully");
        Ok(Self {
            pool: Arc::new(pool),
            feedback: RwLock::new(None),
            policy: RwLock::new(None),
        })
    }

    // ----- feedback log -----

    /// Append a record. Persistence failures propagate and leave the cache untouched.
    pub fn save_feedback(&self, record: FeedbackRecord) -> Result<(), StoreError> {
        let mut guard = self.feedback.write().map_err(|_| StoreError::Poisoned("feedback"))?;
        if guard.is_none() {
            *guard = Some(self.load_feedback()?);
        }

        let metadata = serde_json::to_string(&record.metadata)?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO feedback_records
                (id, message_id, session_id, question, query_text, polarity, reason, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.message_id,
                record.session_id,
                record.question,
                record.sql,
                record.polarity.as_str(),
                record.reason,
                metadata,
                record.timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            error!("Failed to persist feedback {}: {}", record.id, e);
            e
        })?;

        debug!("Saved feedback {} ({})", record.id, record.polarity.as_str());
        if let Some(records) = guard.as_mut() {
            records.push(record);
        }
        Ok(())
    }

    fn load_feedback(&self) -> Result<Vec<FeedbackRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, message_id, session_id, question, query_text, polarity, reason, metadata, created_at
             FROM feedback_records ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, message_id, session_id, question, sql, polarity, reason, metadata, created_at) = row?;
            let polarity = Polarity::parse(&polarity).unwrap_or(Polarity::ThumbsDown);
            records.push(FeedbackRecord {
                id,
                message_id,
                session_id,
                question,
                sql,
                polarity,
                reason,
                metadata: serde_json::from_str(&metadata)?,
                timestamp: parse_timestamp(&created_at),
            });
        }
        debug!("Loaded {} feedback records", records.len());
        Ok(records)
    }

    fn with_feedback<T>(&self, f: impl FnOnce(&[FeedbackRecord]) -> T) -> Result<T, StoreError> {
        {
            let guard = self.feedback.read().map_err(|_| StoreError::Poisoned("feedback"))?;
            if let Some(records) = guard.as_deref() {
                return Ok(f(records));
            }
        }
        let mut guard = self.feedback.write().map_err(|_| StoreError::Poisoned("feedback"))?;
        if guard.is_none() {
            *guard = Some(self.load_feedback()?);
        }
        Ok(f(guard.as_deref().unwrap_or(&[])))
    }

    pub fn all_feedback(&self) -> Result<Vec<FeedbackRecord>, StoreError> {
        self.with_feedback(|records| records.to_vec())
    }

    /// Records whose query touched any of the given tables.
    pub fn feedback_for_tables(&self, tables: &[String]) -> Result<Vec<FeedbackRecord>, StoreError> {
        let wanted: BTreeSet<String> = tables.iter().map(|t| t.to_lowercase()).collect();
        self.with_feedback(|records| {
            records
                .iter()
                .filter(|r| r.touches_any(&wanted))
                .cloned()
                .collect()
        })
    }

    /// Records whose query used the given structural pattern.
    pub fn feedback_with_pattern(&self, pattern: &str) -> Result<Vec<FeedbackRecord>, StoreError> {
        self.with_feedback(|records| {
            records
                .iter()
                .filter(|r| r.metadata.patterns.iter().any(|p| p == pattern))
                .cloned()
                .collect()
        })
    }

    pub fn feedback_by_message_id(&self, message_id: &str) -> Result<Option<FeedbackRecord>, StoreError> {
        self.with_feedback(|records| records.iter().rev().find(|r| r.message_id == message_id).cloned())
    }

    /// The last `limit` records in chronological order.
    pub fn recent_feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>, StoreError> {
        self.with_feedback(|records| {
            let start = records.len().saturating_sub(limit);
            records[start..].to_vec()
        })
    }

    // ----- policy state -----

    fn load_policy(&self) -> Result<PolicyState, StoreError> {
        let conn = self.pool.get()?;
        let document: Option<String> = conn
            .query_row("SELECT document FROM policy_state WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match document {
            Some(doc) => Ok(serde_json::from_str(&doc)?),
            None => Ok(PolicyState::default()),
        }
    }

    fn persist_policy(&self, state: &PolicyState) -> Result<(), StoreError> {
        let document = serde_json::to_string(state)?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO policy_state (id, version, document, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                document = excluded.document,
                updated_at = excluded.updated_at",
            params![state.version as i64, document, state.last_updated.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Apply a mutation to a working copy, persist it with a bumped version, then commit it
    /// to the cache.
    fn mutate_policy<T>(&self, f: impl FnOnce(&mut PolicyState) -> T) -> Result<T, StoreError> {
        let mut guard = self.policy.write().map_err(|_| StoreError::Poisoned("policy"))?;
        let mut working = match guard.as_ref() {
            Some(state) => state.clone(),
            None => self.load_policy()?,
        };

        let result = f(&mut working);
        working.version += 1;
        working.last_updated = Utc::now();

        if let Err(e) = self.persist_policy(&working) {
            error!("Failed to persist policy state v{}: {}", working.version, e);
            return Err(e);
        }
        *guard = Some(working);
        Ok(result)
    }

    fn with_policy<T>(&self, f: impl FnOnce(&PolicyState) -> T) -> Result<T, StoreError> {
        {
            let guard = self.policy.read().map_err(|_| StoreError::Poisoned("policy"))?;
            if let Some(state) = guard.as_ref() {
                return Ok(f(state));
            }
        }
        let mut guard = self.policy.write().map_err(|_| StoreError::Poisoned("policy"))?;
        let state = match guard.take() {
            Some(state) => state,
            None => self.load_policy()?,
        };
        let result = f(&state);
        *guard = Some(state);
        Ok(result)
    }

    pub fn policy_state(&self) -> Result<PolicyState, StoreError> {
        self.with_policy(|state| state.clone())
    }

    /// Merge-or-insert: a hint with the same (type, tables, pattern) gains one supporting
    /// count and +0.1 weight instead of being duplicated. Always persists.
    pub fn add_policy_hint(&self, hint: PolicyHint) -> Result<PolicyHint, StoreError> {
        self.mutate_policy(|state| state.upsert(hint, MergeMode::Reinforce))
    }

    /// Merge-or-insert that overwrites weight and supporting count of a matching hint.
    pub fn replace_policy_hint(&self, hint: PolicyHint) -> Result<PolicyHint, StoreError> {
        self.mutate_policy(|state| state.upsert(hint, MergeMode::Replace))
    }

    /// Hints at or above `min_weight` that are general or share a table with `tables`,
    /// heaviest first.
    pub fn hints_for_context(&self, tables: &[String], min_weight: f64) -> Result<Vec<PolicyHint>, StoreError> {
        self.with_policy(|state| state.hints_for_context(tables, min_weight, CONTEXT_HINT_CAP))
    }

    // ----- aggregate views -----

    pub fn aggregated_stats(&self) -> Result<FeedbackStats, StoreError> {
        let mut stats = self.with_feedback(|records| {
            let totals = tally(records);
            let mut by_table: BTreeMap<String, TableFeedback> = BTreeMap::new();
            for record in records {
                for table in &record.metadata.tables {
                    let entry = by_table.entry(table.to_lowercase()).or_default();
                    if record.polarity.is_positive() {
                        entry.thumbs_up += 1;
                    } else {
                        entry.thumbs_down += 1;
                    }
                }
            }
            let recent_negative = records
                .iter()
                .rev()
                .filter(|r| !r.polarity.is_positive())
                .take(RECENT_NEGATIVE_SAMPLES)
                .map(|r| NegativeSample {
                    question: truncate(&r.question, 100),
                    sql: truncate(&r.sql, 200),
                    tables: r.metadata.tables.clone(),
                    reason: r.reason.clone(),
                })
                .collect();

            FeedbackStats {
                total_feedback: totals.total(),
                thumbs_up_count: totals.thumbs_up,
                thumbs_down_count: totals.thumbs_down,
                success_rate: totals.success_rate(),
                feedback_by_table: by_table,
                recent_negative,
                active_hints: 0,
            }
        })?;
        stats.active_hints = self.with_policy(|state| state.hints.len())?;
        Ok(stats)
    }

    /// Destructive reset of both documents.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let mut feedback = self.feedback.write().map_err(|_| StoreError::Poisoned("feedback"))?;
        let mut policy = self.policy.write().map_err(|_| StoreError::Poisoned("policy"))?;
        let conn = self.pool.get()?;
        conn.execute_batch(
            "DELETE FROM feedback_records;
             DELETE FROM policy_state;",
        )?;
        *feedback = Some(Vec::new());
        *policy = Some(PolicyState::default());
        info!("Cleared all feedback and policy data");
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn truncate(s: &str, max_chars: usize) -> String {
    crate::utils::TextUtils::truncate_chars(s, max_chars).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    pub(crate) fn record(id: &str, polarity: Polarity, tables: &[&str]) -> FeedbackRecord {
        FeedbackRecord {
            id: id.to_string(),
            message_id: format!("msg-{}", id),
            session_id: "s1".to_string(),
            question: format!("question {}", id),
            sql: "SELECT 1 FROM t".to_string(),
            polarity,
            reason: None,
            metadata: FeedbackMetadata {
                tables: tables.iter().map(|t| t.to_string()).collect(),
                patterns: vec!["LIMIT".to_string()],
                question_length: 10,
                sql_length: 15,
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_feedback_aggregation() {
        let store = FeedbackStore::new_in_memory().unwrap();
        for i in 0..7 {
            assert_ok!(store.save_feedback(record(&format!("up{}", i), Polarity::ThumbsUp, &["sales"])));
        }
        for i in 0..3 {
            assert_ok!(store.save_feedback(record(&format!("down{}", i), Polarity::ThumbsDown, &["sales"])));
        }
        let stats = store.aggregated_stats().unwrap();
        assert_eq!(stats.total_feedback, 10);
        assert!((stats.success_rate - 0.7).abs() < 1e-9);
        assert_eq!(stats.thumbs_up_count, 7);
        assert_eq!(stats.thumbs_down_count, 3);
        assert_eq!(stats.feedback_by_table["sales"], TableFeedback { thumbs_up: 7, thumbs_down: 3 });
        assert_eq!(stats.recent_negative.len(), 3);
    }

    #[test]
    fn test_add_policy_hint_twice_merges() {
        let store = FeedbackStore::new_in_memory().unwrap();
        let hint = || PolicyHint::new(HintType::Caution, "watch joins", 0.5, vec!["orders".into()], None);
        store.add_policy_hint(hint()).unwrap();
        store.add_policy_hint(hint()).unwrap();

        let state = store.policy_state().unwrap();
        assert_eq!(state.hints.len(), 1);
        assert_eq!(state.hints[0].source_feedback_count, 2);
        assert!((state.hints[0].weight - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_version_increments_on_every_persist() {
        let store = FeedbackStore::new_in_memory().unwrap();
        let v0 = store.policy_state().unwrap().version;
        let hint = PolicyHint::new(HintType::Tip, "tip", 0.5, vec![], Some("JOIN".into()));
        store.add_policy_hint(hint.clone()).unwrap();
        store.add_policy_hint(hint).unwrap();
        assert_eq!(store.policy_state().unwrap().version, v0 + 2);
    }

    #[test]
    fn test_duplicate_feedback_id_propagates_error() {
        let store = FeedbackStore::new_in_memory().unwrap();
        assert_ok!(store.save_feedback(record("a", Polarity::ThumbsUp, &["t"])));
        let err = assert_err!(store.save_feedback(record("a", Polarity::ThumbsDown, &["t"])));
        assert!(matches!(err, StoreError::Database(_)));
        assert_eq!(store.all_feedback().unwrap().len(), 1);
    }

    #[test]
    fn test_queries_over_feedback() {
        let store = FeedbackStore::new_in_memory().unwrap();
        store.save_feedback(record("1", Polarity::ThumbsUp, &["orders"])).unwrap();
        store.save_feedback(record("2", Polarity::ThumbsDown, &["Customers"])).unwrap();
        store.save_feedback(record("3", Polarity::ThumbsDown, &["orders", "items"])).unwrap();

        assert_eq!(store.feedback_for_tables(&["ORDERS".into()]).unwrap().len(), 2);
        assert_eq!(store.feedback_for_tables(&["customers".into()]).unwrap().len(), 1);
        assert_eq!(store.feedback_with_pattern("LIMIT").unwrap().len(), 3);
        assert_eq!(store.feedback_by_message_id("msg-2").unwrap().map(|r| r.id), Some("2".to_string()));
        let recent: Vec<String> = store.recent_feedback(2).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(recent, vec!["2", "3"]);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedback.db");
        {
            let store = FeedbackStore::new(&path).unwrap();
            store.save_feedback(record("1", Polarity::ThumbsUp, &["orders"])).unwrap();
            store
                .add_policy_hint(PolicyHint::new(HintType::Prefer, "use joins", 0.5, vec![], Some("JOIN".into())))
                .unwrap();
        }
        let reopened = FeedbackStore::new(&path).unwrap();
        let records = reopened.all_feedback().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metadata.tables, vec!["orders"]);
        let state = reopened.policy_state().unwrap();
        assert_eq!(state.hints.len(), 1);
        assert_eq!(state.version, PolicyState::default().version + 1);
    }

    #[test]
    fn test_clear_all() {
        let store = FeedbackStore::new_in_memory().unwrap();
        store.save_feedback(record("1", Polarity::ThumbsUp, &["orders"])).unwrap();
        store
            .add_policy_hint(PolicyHint::new(HintType::Tip, "t", 0.5, vec![], None))
            .unwrap();
        store.clear_all().unwrap();
        assert!(store.all_feedback().unwrap().is_empty());
        assert!(store.policy_state().unwrap().hints.is_empty());
        assert_eq!(store.aggregated_stats().unwrap().total_feedback, 0);
    }

    #[test]
    fn test_hints_for_context_via_store() {
        let store = FeedbackStore::new_in_memory().unwrap();
        store
            .add_policy_hint(PolicyHint::new(HintType::Caution, "orders", 0.8, vec!["orders".into()], None))
            .unwrap();
        store
            .add_policy_hint(PolicyHint::new(HintType::Caution, "items", 0.8, vec!["items".into()], None))
            .unwrap();
        let hints = store.hints_for_context(&["orders".into()], 0.3).unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].description, "orders");
    }
}
