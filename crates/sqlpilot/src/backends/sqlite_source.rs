//! Read-only SQLite data source: executes generated queries and serves table DDL as schema context.

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{QueryExecutor, ResultPreview, SchemaChunk, SchemaRetriever};
use crate::error::ExecutionError;
use crate::utils::KeywordExtractor;

/// Interrupts the running statement when dropped unless disarmed.
/// Dropping an in-flight `execute` future (e.g. on timeout) cancels the query.
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            warn!("Interrupting in-flight query");
            handle.interrupt();
        }
    }
}

#[derive(Clone)]
pub struct SqliteSource {
    pool: Arc<Pool<SqliteConnectionManager>>,
    keywords: KeywordExtractor,
}

impl SqliteSource {
    pub fn open_read_only(db_path: &Path) -> anyhow::Result<Self> {
        Self::open_with_pool_size(db_path, 4)
    }

    pub fn open_with_pool_size(db_path: &Path, max_size: u32) -> anyhow::Result<Self> {
        if !db_path.exists() {
            anyhow::bail!("Data database not found at: {}", db_path.display());
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        );
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create data connection pool: {}", e))?;
        info!("Data source opened read-only at: {}", db_path.display());
        Ok(Self {
            pool: Arc::new(pool),
            keywords: KeywordExtractor::default(),
        })
    }

    fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<(String, String)>> {
        let mut stmt = conn.prepare(
            "SELECT name, COALESCE(sql, '') FROM sqlite_master
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    fn score_table(&self, question_lower: &str, keywords: &[String], name: &str, ddl: &str) -> f64 {
        let haystack = format!("{} {}", name, ddl).to_lowercase();
        let keyword_score = if keywords.is_empty() {
            0.0
        } else {
            keywords.iter().filter(|k| haystack.contains(k.as_str())).count() as f64 / keywords.len() as f64
        };
        let name_lower = name.to_lowercase();
        let singular = name_lower.trim_end_matches('s');
        let named = question_lower.contains(&name_lower) || (!singular.is_empty() && question_lower.contains(singular));
        keyword_score + if named { 0.5 } else { 0.0 }
    }
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}

fn run_query(conn: &Connection, sql: &str, row_limit: usize) -> rusqlite::Result<ResultPreview> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let column_count = columns.len();

    let mut rows = stmt.query([])?;
    let mut preview_rows = Vec::new();
    let mut total_rows = 0usize;
    while let Some(row) = rows.next()? {
        total_rows += 1;
        if preview_rows.len() < row_limit {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(value_to_json(row.get_ref(i)?));
            }
            preview_rows.push(values);
        }
    }

    Ok(ResultPreview {
        columns,
        rows: preview_rows,
        total_rows,
        truncated: total_rows > row_limit,
    })
}

#[async_trait]
impl QueryExecutor for SqliteSource {
    async fn execute(&self, sql: &str, row_limit: usize) -> Result<ResultPreview, ExecutionError> {
        let pool = self.pool.clone();
        let conn = tokio::task::spawn_blocking(move || pool.get())
            .await
            .map_err(|e| ExecutionError::new(format!("execution task failed: {}", e)))?
            .map_err(|e| ExecutionError::new(format!("data source unavailable: {}", e)))?;

        let guard = InterruptOnDrop(Some(conn.get_interrupt_handle()));
        let sql = sql.to_string();
        debug!("Executing: {}", sql);
        let result = tokio::task::spawn_blocking(move || run_query(&conn, &sql, row_limit)).await;
        guard.disarm();

        match result {
            Ok(Ok(preview)) => Ok(preview),
            Ok(Err(e)) => Err(ExecutionError::new(e.to_string())),
            Err(e) => Err(ExecutionError::new(format!("execution task failed: {}", e))),
        }
    }
}

#[async_trait]
impl SchemaRetriever for SqliteSource {
    async fn retrieve_schema(&self, question: &str, top_k: usize) -> anyhow::Result<Vec<SchemaChunk>> {
        let pool = self.pool.clone();
        let tables = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<(String, String)>> {
            let conn = pool.get()?;
            Ok(SqliteSource::list_tables(&conn)?)
        })
        .await??;

        let question_lower = question.to_lowercase();
        let keywords = self.keywords.extract(&question_lower);
        let mut chunks: Vec<SchemaChunk> = tables
            .into_iter()
            .map(|(name, ddl)| {
                let score = self.score_table(&question_lower, &keywords, &name, &ddl);
                let mut source = BTreeMap::new();
                source.insert("table".to_string(), name.clone());
                source.insert("origin".to_string(), "sqlite_master".to_string());
                SchemaChunk {
                    content: if ddl.is_empty() { format!("TABLE {}", name) } else { ddl },
                    score,
                    source,
                }
            })
            .collect();

        chunks.sort_by(|a, b| b.score.total_cmp(&a.score));
        chunks.truncate(top_k);
        debug!("Retrieved {} schema chunks", chunks.len());
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn seed(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("warehouse.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (id INTEGER PRIMARY KEY, product TEXT, revenue REAL, region TEXT);
             CREATE TABLE employees (id INTEGER PRIMARY KEY, name TEXT, hired TEXT);
             INSERT INTO sales (product, revenue, region) VALUES
                ('widget', 10.5, 'EU'), ('gadget', 20.0, 'US'), ('widget', 4.5, 'US');",
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_execute_returns_preview() {
        let dir = tempfile::tempdir().unwrap();
        let source = SqliteSource::open_read_only(&seed(&dir)).unwrap();
        let preview = source
            .execute("SELECT product, SUM(revenue) AS total FROM sales GROUP BY product ORDER BY product", 10)
            .await
            .unwrap();
        assert_eq!(preview.columns, vec!["product", "total"]);
        assert_eq!(preview.total_rows, 2);
        assert!(!preview.truncated);
        assert_eq!(preview.rows[0][0], serde_json::json!("gadget"));
        assert_eq!(preview.rows[1][1], serde_json::json!(15.0));
    }

    #[tokio::test]
    async fn test_execute_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let source = SqliteSource::open_read_only(&seed(&dir)).unwrap();
        let preview = source.execute("SELECT id FROM sales", 2).await.unwrap();
        assert_eq!(preview.rows.len(), 2);
        assert_eq!(preview.total_rows, 3);
        assert!(preview.truncated);
    }

    #[tokio::test]
    async fn test_missing_table_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let source = SqliteSource::open_read_only(&seed(&dir)).unwrap();
        let err = source.execute("SELECT * FROM salez", 10).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ExecutionErrorKind::ObjectNotFound);
        let err = source.execute("SELEC * FROM sales", 10).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ExecutionErrorKind::Syntax);
    }

    #[tokio::test]
    async fn test_writes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let source = SqliteSource::open_read_only(&seed(&dir)).unwrap();
        let err = source.execute("DELETE FROM sales", 10).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ExecutionErrorKind::Permission);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_interrupts_query() {
        let dir = tempfile::tempdir().unwrap();
        let source = SqliteSource::open_with_pool_size(&seed(&dir), 1).unwrap();
        let endless = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT COUNT(*) FROM c";
        let outcome = tokio::time::timeout(Duration::from_millis(100), source.execute(endless, 10)).await;
        assert!(outcome.is_err());

        // The single pooled connection must come back once the statement is interrupted.
        let preview = tokio::time::timeout(Duration::from_secs(10), source.execute("SELECT 1 AS one", 10))
            .await
            .expect("connection was not released")
            .unwrap();
        assert_eq!(preview.rows, vec![vec![serde_json::json!(1)]]);
    }

    #[tokio::test]
    async fn test_retrieve_schema_ranks_relevant_table_first() {
        let dir = tempfile::tempdir().unwrap();
        let source = SqliteSource::open_read_only(&seed(&dir)).unwrap();
        let chunks = source.retrieve_schema("Show total revenue by product", 5).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].table(), Some("sales"));
        assert!(chunks[0].content.contains("CREATE TABLE sales"));
        assert!(chunks[0].score > chunks[1].score);

        let top_one = source.retrieve_schema("employees hired last year", 1).await.unwrap();
        assert_eq!(top_one.len(), 1);
        assert_eq!(top_one[0].table(), Some("employees"));
    }
}
