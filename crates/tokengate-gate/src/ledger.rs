//! Usage recording and derived snapshots.
//!
//! Every attempted call lands here, successful or not: failed calls are
//! recorded with zero completion tokens so a storm of failures stays
//! visible in the accounting. Recording never aborts the call path — a
//! store that cannot be written is logged and acknowledged as
//! unpersisted rather than turned into a caller-facing error.
//!
//! Usage percentage and status are never stored. They are derived from
//! the global monthly total at snapshot time, so every reader sees the
//! same number.

use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use tokengate_core::{
    month_key, AgentId, GateConfig, Provider, Result, UsageLogEntry, UsageRecord, UsageStatus,
    UsageStore,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::windows::RateWindowTracker;

/// Acknowledgement of a recorded call.
#[derive(Debug, Clone)]
pub struct RecordAck {
    /// ID of the log entry that was (or failed to be) written.
    pub entry_id: Uuid,
    /// Whether the entry reached the durable store.
    pub persisted: bool,
    /// Month the usage was accounted to.
    pub month_year: String,
}

/// Provider-wide usage snapshot for one month.
#[derive(Debug, Clone)]
pub struct ProviderUsageSummary {
    /// Provider this summary covers.
    pub provider: Provider,
    /// Month key (`YYYY-MM`).
    pub month_year: String,
    /// Sum of all agents' tokens this month.
    pub global_total: u64,
    /// The enforced monthly ceiling.
    pub enforced_limit: u64,
    /// `global_total / enforced_limit`, as a percentage.
    pub usage_percentage: f64,
    /// Status derived from `usage_percentage`.
    pub status: UsageStatus,
    /// Per-agent monthly aggregates.
    pub agents: Vec<UsageRecord>,
}

/// Records usage and serves derived views of it.
pub struct UsageLedger {
    config: GateConfig,
    store: Arc<dyn UsageStore>,
    windows: Arc<RateWindowTracker>,
}

impl UsageLedger {
    /// Create a ledger over the given store and window tracker.
    pub fn new(
        config: GateConfig,
        store: Arc<dyn UsageStore>,
        windows: Arc<RateWindowTracker>,
    ) -> Self {
        Self {
            config,
            store,
            windows,
        }
    }

    /// Record one attempted call.
    ///
    /// Failed calls pass `success = false` and zero `tokens_out`; their
    /// input-side estimate still counts toward every ceiling.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        agent: &AgentId,
        provider: Provider,
        tokens_in: u64,
        tokens_out: u64,
        model: Option<String>,
        request_id: Option<String>,
        success: bool,
        error_message: Option<String>,
    ) -> RecordAck {
        let entry = UsageLogEntry::new(
            agent.clone(),
            provider,
            tokens_in,
            tokens_out,
            model,
            request_id,
            success,
            error_message,
        );

        let persisted = match self.store.append_usage(&entry).await {
            Ok(()) => true,
            Err(e) => {
                // Never let accounting failure abort the call path.
                error!(%agent, %provider, error = %e, "Failed to persist usage entry");
                false
            }
        };

        // Write through into any live window memo so freshly spent tokens
        // are visible to the very next admission check.
        self.windows
            .note_usage(provider, entry.total_tokens, entry.created_at);

        debug!(
            %agent,
            %provider,
            tokens = entry.total_tokens,
            success,
            persisted,
            "Usage recorded"
        );

        RecordAck {
            entry_id: entry.id,
            persisted,
            month_year: entry.month_year,
        }
    }

    /// One agent's monthly aggregate with globally derived percentage and
    /// status, or `None` if the agent has no usage this month.
    pub async fn agent_usage(
        &self,
        agent: &AgentId,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>> {
        let month = month_key(now);
        let Some(record) = self.store.monthly_record(agent, provider, &month).await? else {
            return Ok(None);
        };
        let global = self.store.global_monthly_total(provider, &month).await?;
        Ok(Some(record.with_global_usage(
            global,
            self.config.enforced_monthly_limit(provider),
            self.config.warning_threshold,
            self.config.critical_threshold,
        )))
    }

    /// Provider-wide snapshot for the current month.
    pub async fn provider_summary(
        &self,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<ProviderUsageSummary> {
        let month = month_key(now);
        let global_total = self.store.global_monthly_total(provider, &month).await?;
        let enforced_limit = self.config.enforced_monthly_limit(provider);
        let usage_percentage = if enforced_limit > 0 {
            (global_total as f64 / enforced_limit as f64) * 100.0
        } else {
            0.0
        };
        let status = UsageStatus::from_percentage(
            usage_percentage,
            self.config.warning_threshold,
            self.config.critical_threshold,
        );

        let agents = self
            .store
            .monthly_records(provider, &month)
            .await?
            .into_iter()
            .map(|r| {
                r.with_global_usage(
                    global_total,
                    enforced_limit,
                    self.config.warning_threshold,
                    self.config.critical_threshold,
                )
            })
            .collect();

        Ok(ProviderUsageSummary {
            provider,
            month_year: month,
            global_total,
            enforced_limit,
            usage_percentage,
            status,
            agents,
        })
    }

    /// Providers whose global usage has crossed the warning threshold
    /// this month.
    pub async fn usage_alerts(&self, now: DateTime<Utc>) -> Result<Vec<ProviderUsageSummary>> {
        let mut alerts = Vec::new();
        for provider in [Provider::Anthropic, Provider::OpenAI] {
            let summary = self.provider_summary(provider, now).await?;
            if summary.status != UsageStatus::Active {
                alerts.push(summary);
            }
        }
        Ok(alerts)
    }

    /// Monthly aggregates for one agent going back `months` months,
    /// newest first.
    pub async fn usage_history(
        &self,
        agent: &AgentId,
        provider: Provider,
        months: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>> {
        let since = now
            .checked_sub_months(Months::new(months))
            .unwrap_or(now);
        self.store
            .records_since(agent, provider, &month_key(since))
            .await
    }

    /// Delete one agent's usage for the current month.
    ///
    /// The only operation that makes usage figures go backwards; window
    /// memos are invalidated so the next admission check refetches.
    pub async fn reset(
        &self,
        agent: &AgentId,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let month = month_key(now);
        let deleted = self.store.reset_month(agent, provider, &month).await?;
        self.windows.invalidate(provider);
        if deleted {
            info!(%agent, %provider, %month, "Monthly usage reset");
        }
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
