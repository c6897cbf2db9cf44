//! In-memory usage store for development and testing.
//!
//! Keeps only the append-only log; monthly aggregates are derived on read
//! by folding matching log entries, so the derivation invariant
//! (`total_tokens == Σ log totals`) holds by construction. All methods are
//! `O(n)` linear scans. Data is lost when the struct is dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokengate_core::{AgentId, Provider, Result, UsageLogEntry, UsageRecord, UsageStore};
use tokio::sync::RwLock;

/// In-memory [`UsageStore`] backed by a `Vec` of log entries.
pub struct InMemoryUsageStore {
    log: RwLock<Vec<UsageLogEntry>>,
}

impl InMemoryUsageStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self {
            log: RwLock::new(Vec::new()),
        }
    }

    /// Fold entries matching one (agent, provider, month) into an aggregate.
    fn fold(
        entries: &[UsageLogEntry],
        agent: &AgentId,
        provider: Provider,
        month: &str,
    ) -> Option<UsageRecord> {
        let mut record: Option<UsageRecord> = None;
        for entry in entries {
            if entry.agent == *agent && entry.provider == provider && entry.month_year == month {
                record
                    .get_or_insert_with(|| {
                        UsageRecord::new(agent.clone(), provider, month.to_string())
                    })
                    .absorb(entry);
            }
        }
        record
    }
}

impl Default for InMemoryUsageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn append_usage(&self, entry: &UsageLogEntry) -> Result<()> {
        let mut log = self.log.write().await;
        log.push(entry.clone());
        Ok(())
    }

    async fn monthly_record(
        &self,
        agent: &AgentId,
        provider: Provider,
        month: &str,
    ) -> Result<Option<UsageRecord>> {
        let log = self.log.read().await;
        Ok(Self::fold(&log, agent, provider, month))
    }

    async fn monthly_records(&self, provider: Provider, month: &str) -> Result<Vec<UsageRecord>> {
        let log = self.log.read().await;
        let mut agents: Vec<AgentId> = log
            .iter()
            .filter(|e| e.provider == provider && e.month_year == month)
            .map(|e| e.agent.clone())
            .collect();
        agents.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        agents.dedup();

        Ok(agents
            .iter()
            .filter_map(|agent| Self::fold(&log, agent, provider, month))
            .collect())
    }

    async fn global_monthly_total(&self, provider: Provider, month: &str) -> Result<u64> {
        let log = self.log.read().await;
        Ok(log
            .iter()
            .filter(|e| e.provider == provider && e.month_year == month)
            .map(|e| e.total_tokens)
            .sum())
    }

    async fn window_total(
        &self,
        provider: Provider,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let log = self.log.read().await;
        Ok(log
            .iter()
            .filter(|e| e.provider == provider && e.created_at >= start && e.created_at < end)
            .map(|e| e.total_tokens)
            .sum())
    }

    async fn records_since(
        &self,
        agent: &AgentId,
        provider: Provider,
        since_month: &str,
    ) -> Result<Vec<UsageRecord>> {
        let log = self.log.read().await;
        let mut months: Vec<String> = log
            .iter()
            .filter(|e| {
                e.agent == *agent
                    && e.provider == provider
                    && e.month_year.as_str() >= since_month
            })
            .map(|e| e.month_year.clone())
            .collect();
        months.sort();
        months.dedup();
        months.reverse();

        Ok(months
            .iter()
            .filter_map(|month| Self::fold(&log, agent, provider, month))
            .collect())
    }

    async fn reset_month(
        &self,
        agent: &AgentId,
        provider: Provider,
        month: &str,
    ) -> Result<bool> {
        let mut log = self.log.write().await;
        let initial = log.len();
        log.retain(|e| {
            !(e.agent == *agent && e.provider == provider && e.month_year == month)
        });
        Ok(log.len() < initial)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
