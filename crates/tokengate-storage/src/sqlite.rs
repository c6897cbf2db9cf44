//! SQLite usage store.
//!
//! Durable backend for the usage log and monthly aggregates. The log
//! append and the aggregate upsert run in a single transaction, with the
//! log insert ordered first: after a crash a missing aggregate is
//! derivable from the log, but an aggregate without its log entry would
//! be an unrecoverable quota leak.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokengate_core::{
    AgentId, GateError, Provider, Result, UsageLogEntry, UsageRecord, UsageStore,
};

/// SQLite-backed [`UsageStore`].
pub struct SqliteUsageStore {
    pool: SqlitePool,
}

impl SqliteUsageStore {
    /// Connect to a SQLite database and run migrations.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Storage`] if the connection or migration fails.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| GateError::Storage(format!("Failed to connect to SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create the schema if it does not exist.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_log (
                id TEXT PRIMARY KEY,
                agent TEXT NOT NULL,
                provider TEXT NOT NULL,
                month_year TEXT NOT NULL,
                created_at TEXT NOT NULL,
                tokens_in INTEGER NOT NULL,
                tokens_out INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                model TEXT,
                request_id TEXT,
                success INTEGER NOT NULL,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| GateError::Storage(format!("Migration failed (usage_log): {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_records (
                agent TEXT NOT NULL,
                provider TEXT NOT NULL,
                month_year TEXT NOT NULL,
                tokens_in INTEGER NOT NULL DEFAULT 0,
                tokens_out INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                last_request_at TEXT,
                PRIMARY KEY (agent, provider, month_year)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| GateError::Storage(format!("Migration failed (usage_records): {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_log_window
             ON usage_log (provider, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| GateError::Storage(format!("Migration failed (index): {e}")))?;

        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> UsageRecord {
        let agent: String = row.get("agent");
        let provider: String = row.get("provider");
        let provider = provider.parse().unwrap_or(Provider::Anthropic);
        let last_request_at: Option<DateTime<Utc>> = row.get("last_request_at");

        let mut record = UsageRecord::new(
            AgentId::new(agent),
            provider,
            row.get::<String, _>("month_year"),
        );
        record.tokens_in = row.get::<i64, _>("tokens_in") as u64;
        record.tokens_out = row.get::<i64, _>("tokens_out") as u64;
        record.total_tokens = row.get::<i64, _>("total_tokens") as u64;
        record.request_count = row.get::<i64, _>("request_count") as u64;
        record.last_request_at = last_request_at;
        record
    }
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn append_usage(&self, entry: &UsageLogEntry) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| GateError::Storage(format!("Failed to begin transaction: {e}")))?;

        // Log append happens-before the aggregate upsert.
        sqlx::query(
            r#"
            INSERT INTO usage_log
                (id, agent, provider, month_year, created_at,
                 tokens_in, tokens_out, total_tokens,
                 model, request_id, success, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.agent.as_str())
        .bind(entry.provider.to_string())
        .bind(&entry.month_year)
        .bind(entry.created_at)
        .bind(entry.tokens_in as i64)
        .bind(entry.tokens_out as i64)
        .bind(entry.total_tokens as i64)
        .bind(&entry.model)
        .bind(&entry.request_id)
        .bind(entry.success)
        .bind(&entry.error)
        .execute(&mut *tx)
        .await
        .map_err(|e| GateError::Storage(format!("Failed to append log entry: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO usage_records
                (agent, provider, month_year, tokens_in, tokens_out,
                 total_tokens, request_count, last_request_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
            ON CONFLICT (agent, provider, month_year) DO UPDATE SET
                tokens_in = tokens_in + excluded.tokens_in,
                tokens_out = tokens_out + excluded.tokens_out,
                total_tokens = total_tokens + excluded.total_tokens,
                request_count = request_count + 1,
                last_request_at = excluded.last_request_at
            "#,
        )
        .bind(entry.agent.as_str())
        .bind(entry.provider.to_string())
        .bind(&entry.month_year)
        .bind(entry.tokens_in as i64)
        .bind(entry.tokens_out as i64)
        .bind(entry.total_tokens as i64)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| GateError::Storage(format!("Failed to upsert aggregate: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| GateError::Storage(format!("Failed to commit usage write: {e}")))?;

        Ok(())
    }

    async fn monthly_record(
        &self,
        agent: &AgentId,
        provider: Provider,
        month: &str,
    ) -> Result<Option<UsageRecord>> {
        let row = sqlx::query(
            "SELECT * FROM usage_records
             WHERE agent = ?1 AND provider = ?2 AND month_year = ?3",
        )
        .bind(agent.as_str())
        .bind(provider.to_string())
        .bind(month)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GateError::Storage(format!("Failed to query monthly record: {e}")))?;

        Ok(row.as_ref().map(Self::row_to_record))
    }

    async fn monthly_records(&self, provider: Provider, month: &str) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM usage_records
             WHERE provider = ?1 AND month_year = ?2
             ORDER BY agent",
        )
        .bind(provider.to_string())
        .bind(month)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GateError::Storage(format!("Failed to query monthly records: {e}")))?;

        Ok(rows.iter().map(Self::row_to_record).collect())
    }

    async fn global_monthly_total(&self, provider: Provider, month: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(total_tokens), 0) AS total FROM usage_records
             WHERE provider = ?1 AND month_year = ?2",
        )
        .bind(provider.to_string())
        .bind(month)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| GateError::Storage(format!("Failed to sum monthly usage: {e}")))?;

        Ok(row.get::<i64, _>("total") as u64)
    }

    async fn window_total(
        &self,
        provider: Provider,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(total_tokens), 0) AS total FROM usage_log
             WHERE provider = ?1 AND created_at >= ?2 AND created_at < ?3",
        )
        .bind(provider.to_string())
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| GateError::Storage(format!("Failed to sum window usage: {e}")))?;

        Ok(row.get::<i64, _>("total") as u64)
    }

    async fn records_since(
        &self,
        agent: &AgentId,
        provider: Provider,
        since_month: &str,
    ) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM usage_records
             WHERE agent = ?1 AND provider = ?2 AND month_year >= ?3
             ORDER BY month_year DESC",
        )
        .bind(agent.as_str())
        .bind(provider.to_string())
        .bind(since_month)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GateError::Storage(format!("Failed to query usage history: {e}")))?;

        Ok(rows.iter().map(Self::row_to_record).collect())
    }

    async fn reset_month(
        &self,
        agent: &AgentId,
        provider: Provider,
        month: &str,
    ) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| GateError::Storage(format!("Failed to begin transaction: {e}")))?;

        let log_result = sqlx::query(
            "DELETE FROM usage_log
             WHERE agent = ?1 AND provider = ?2 AND month_year = ?3",
        )
        .bind(agent.as_str())
        .bind(provider.to_string())
        .bind(month)
        .execute(&mut *tx)
        .await
        .map_err(|e| GateError::Storage(format!("Failed to delete log entries: {e}")))?;

        let record_result = sqlx::query(
            "DELETE FROM usage_records
             WHERE agent = ?1 AND provider = ?2 AND month_year = ?3",
        )
        .bind(agent.as_str())
        .bind(provider.to_string())
        .bind(month)
        .execute(&mut *tx)
        .await
        .map_err(|e| GateError::Storage(format!("Failed to delete aggregate: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| GateError::Storage(format!("Failed to commit reset: {e}")))?;

        Ok(log_result.rows_affected() > 0 || record_result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GateError::Storage(format!("Health check failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // A pooled `sqlite::memory:` URL would give every pool connection its
    // own empty database, so tests run against a file in a temp dir.
    async fn make_store() -> (SqliteUsageStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("usage.db").display());
        let store = SqliteUsageStore::new(&url).await.unwrap();
        (store, dir)
    }

    fn entry(agent: &str, provider: Provider, tokens_in: u64, tokens_out: u64) -> UsageLogEntry {
        UsageLogEntry::new(
            AgentId::from(agent),
            provider,
            tokens_in,
            tokens_out,
            Some("test-model".to_string()),
            Some("req-1".to_string()),
            true,
            None,
        )
    }

    #[tokio::test]
    async fn test_append_round_trip() {
        let (store, _dir) = make_store().await;
        let e = entry("imperium", Provider::Anthropic, 120, 80);
        let month = e.month_year.clone();
        store.append_usage(&e).await.unwrap();

        let record = store
            .monthly_record(&AgentId::from("imperium"), Provider::Anthropic, &month)
            .await
            .unwrap()
            .expect("record should exist");
        assert_eq!(record.tokens_in, 120);
        assert_eq!(record.tokens_out, 80);
        assert_eq!(record.total_tokens, 200);
        assert_eq!(record.request_count, 1);
        assert!(record.last_request_at.is_some());
    }

    #[tokio::test]
    async fn test_aggregate_accumulates() {
        let (store, _dir) = make_store().await;
        let e = entry("guardian", Provider::OpenAI, 10, 5);
        let month = e.month_year.clone();
        store.append_usage(&e).await.unwrap();
        store
            .append_usage(&entry("guardian", Provider::OpenAI, 20, 15))
            .await
            .unwrap();

        let record = store
            .monthly_record(&AgentId::from("guardian"), Provider::OpenAI, &month)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.total_tokens, 50);
        assert_eq!(record.request_count, 2);
    }

    #[tokio::test]
    async fn test_aggregate_matches_log_sum() {
        let (store, _dir) = make_store().await;
        let e = entry("imperium", Provider::Anthropic, 100, 50);
        let month = e.month_year.clone();
        let at = e.created_at;
        store.append_usage(&e).await.unwrap();
        store
            .append_usage(&entry("guardian", Provider::Anthropic, 30, 20))
            .await
            .unwrap();

        let global = store
            .global_monthly_total(Provider::Anthropic, &month)
            .await
            .unwrap();
        let window = store
            .window_total(
                Provider::Anthropic,
                at - chrono::Duration::hours(1),
                at + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(global, 200);
        assert_eq!(window, 200);
    }

    #[tokio::test]
    async fn test_window_excludes_other_provider() {
        let (store, _dir) = make_store().await;
        let e = entry("imperium", Provider::Anthropic, 100, 0);
        let at = e.created_at;
        store.append_usage(&e).await.unwrap();
        store
            .append_usage(&entry("imperium", Provider::OpenAI, 999, 0))
            .await
            .unwrap();

        let window = store
            .window_total(
                Provider::Anthropic,
                at - chrono::Duration::hours(1),
                at + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(window, 100);
    }

    #[tokio::test]
    async fn test_reset_month() {
        let (store, _dir) = make_store().await;
        let e = entry("sandbox", Provider::Anthropic, 500, 0);
        let month = e.month_year.clone();
        store.append_usage(&e).await.unwrap();

        assert!(store
            .reset_month(&AgentId::from("sandbox"), Provider::Anthropic, &month)
            .await
            .unwrap());
        assert!(store
            .monthly_record(&AgentId::from("sandbox"), Provider::Anthropic, &month)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store
                .global_monthly_total(Provider::Anthropic, &month)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_records_since_orders_newest_first() {
        let (store, _dir) = make_store().await;
        // Two entries in the current month; history query returns one row.
        let e = entry("conquest", Provider::Anthropic, 10, 0);
        store.append_usage(&e).await.unwrap();
        store
            .append_usage(&entry("conquest", Provider::Anthropic, 20, 0))
            .await
            .unwrap();

        let history = store
            .records_since(&AgentId::from("conquest"), Provider::Anthropic, "2020-01")
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].total_tokens, 30);
    }

    #[tokio::test]
    async fn test_failed_calls_are_logged() {
        let (store, _dir) = make_store().await;
        let failed = UsageLogEntry::new(
            AgentId::from("imperium"),
            Provider::Anthropic,
            40,
            0,
            Some("test-model".to_string()),
            None,
            false,
            Some("upstream 500".to_string()),
        );
        let month = failed.month_year.clone();
        store.append_usage(&failed).await.unwrap();

        // Failed calls still count toward usage so repeated failures
        // remain visible.
        let record = store
            .monthly_record(&AgentId::from("imperium"), Provider::Anthropic, &month)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.total_tokens, 40);
        assert_eq!(record.request_count, 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (store, _dir) = make_store().await;
        assert!(store.health_check().await.is_ok());
    }
}
