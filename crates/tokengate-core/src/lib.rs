//! Core types, traits, and errors for tokengate
//!
//! This crate contains the foundational types shared across all tokengate
//! components: agent and provider identities, usage records and log entries,
//! the quota configuration object, the error taxonomy, and the storage /
//! completion-client abstractions.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifier for an independent logical caller ("agent").
///
/// All agents share the global token ceiling for a given provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    /// Create a new agent ID.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The agent name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An external completion-API provider.
///
/// `Anthropic` is the configured primary; `OpenAI` is the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAI,
}

impl Provider {
    /// The other provider (primary ↔ secondary).
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Anthropic => Self::OpenAI,
            Self::OpenAI => Self::Anthropic,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAI => write!(f, "openai"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAI),
            _ => Err(format!("unknown provider: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Time bucket keys
// ---------------------------------------------------------------------------

/// Calendar-month key, e.g. `2026-08`.
#[must_use]
pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Calendar-day key, e.g. `2026-08-29`.
#[must_use]
pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Clock-hour key, e.g. `2026-08-29-14`.
#[must_use]
pub fn hour_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d-%H").to_string()
}

// ---------------------------------------------------------------------------
// Usage types
// ---------------------------------------------------------------------------

/// Derived status of a monthly usage record, computed from the GLOBAL
/// (all-agents) usage percentage against the shared enforced ceiling.
///
/// Never stored independently — recomputed on every write and read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Active,
    Warning,
    Critical,
    LimitReached,
}

impl UsageStatus {
    /// Derive a status from a usage percentage and the configured thresholds.
    #[must_use]
    pub fn from_percentage(pct: f64, warning: f64, critical: f64) -> Self {
        if pct >= 100.0 {
            Self::LimitReached
        } else if pct >= critical {
            Self::Critical
        } else if pct >= warning {
            Self::Warning
        } else {
            Self::Active
        }
    }
}

impl std::fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
            Self::LimitReached => write!(f, "limit_reached"),
        }
    }
}

/// Monthly usage aggregate for one (agent, provider, month) key.
///
/// The raw token and request counters are persisted; `usage_percentage` and
/// `status` are derived from the global provider usage when a snapshot is
/// produced. The invariant `total_tokens == Σ matching UsageLogEntry totals`
/// holds for all sequences of writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Agent this aggregate belongs to.
    pub agent: AgentId,
    /// Provider the tokens were consumed against.
    pub provider: Provider,
    /// Calendar-month key (`YYYY-MM`).
    pub month_year: String,
    /// Total prompt tokens this month.
    pub tokens_in: u64,
    /// Total completion tokens this month.
    pub tokens_out: u64,
    /// `tokens_in + tokens_out`.
    pub total_tokens: u64,
    /// Number of recorded calls (successful or failed).
    pub request_count: u64,
    /// Timestamp of the most recent recorded call.
    pub last_request_at: Option<DateTime<Utc>>,
    /// Global usage against the shared enforced ceiling, in percent.
    /// Derived — filled in when a snapshot is taken.
    pub usage_percentage: f64,
    /// Derived from `usage_percentage`.
    pub status: UsageStatus,
}

impl UsageRecord {
    /// Create an empty aggregate for a month (lazily, on first use).
    pub fn new(agent: AgentId, provider: Provider, month_year: impl Into<String>) -> Self {
        Self {
            agent,
            provider,
            month_year: month_year.into(),
            tokens_in: 0,
            tokens_out: 0,
            total_tokens: 0,
            request_count: 0,
            last_request_at: None,
            usage_percentage: 0.0,
            status: UsageStatus::Active,
        }
    }

    /// Fold one log entry into the aggregate.
    pub fn absorb(&mut self, entry: &UsageLogEntry) {
        self.tokens_in += entry.tokens_in;
        self.tokens_out += entry.tokens_out;
        self.total_tokens += entry.total_tokens;
        self.request_count += 1;
        self.last_request_at = Some(match self.last_request_at {
            Some(prev) => prev.max(entry.created_at),
            None => entry.created_at,
        });
    }

    /// Derive `usage_percentage` and `status` from the global provider total.
    #[must_use]
    pub fn with_global_usage(
        mut self,
        global_total: u64,
        enforced_limit: u64,
        warning: f64,
        critical: f64,
    ) -> Self {
        let pct = if enforced_limit > 0 {
            (global_total as f64 / enforced_limit as f64) * 100.0
        } else {
            0.0
        };
        self.usage_percentage = pct;
        self.status = UsageStatus::from_percentage(pct, warning, critical);
        self
    }
}

/// One immutable, append-only entry in the per-call usage log.
///
/// The log is the sole source of truth for hourly and daily sums; window
/// views are always derived from it, never separately counted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    /// Unique identifier for this entry.
    pub id: Uuid,
    /// Agent that made (or attempted) the call.
    pub agent: AgentId,
    /// Provider the call was accounted against.
    pub provider: Provider,
    /// Calendar-month key (`YYYY-MM`), redundant with `created_at` for
    /// cheap monthly filtering.
    pub month_year: String,
    /// When the call completed.
    pub created_at: DateTime<Utc>,
    /// Prompt tokens consumed (measured or estimated).
    pub tokens_in: u64,
    /// Completion tokens consumed (0 for failed calls).
    pub tokens_out: u64,
    /// `tokens_in + tokens_out`.
    pub total_tokens: u64,
    /// Model the call was made with, when known.
    pub model: Option<String>,
    /// Provider-assigned request ID, when reported.
    pub request_id: Option<String>,
    /// Whether the call succeeded.
    pub success: bool,
    /// Error description for failed or denied calls.
    pub error: Option<String>,
}

impl UsageLogEntry {
    /// Create a log entry timestamped now.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: AgentId,
        provider: Provider,
        tokens_in: u64,
        tokens_out: u64,
        model: Option<String>,
        request_id: Option<String>,
        success: bool,
        error: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent,
            provider,
            month_year: month_key(now),
            created_at: now,
            tokens_in,
            tokens_out,
            total_tokens: tokens_in + tokens_out,
            model,
            request_id,
            success,
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-provider ceiling configuration.
///
/// Daily and hourly ceilings are fractions of the ENFORCED monthly ceiling;
/// the two providers have different quota shapes and therefore distinct
/// fractions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Nominal monthly token ceiling published by the provider plan.
    pub nominal_monthly_limit: u64,
    /// Fraction of the enforced monthly ceiling allowed per day.
    pub daily_fraction: f64,
    /// Fraction of the enforced monthly ceiling allowed per hour.
    pub hourly_fraction: f64,
    /// API key for the provider, if configured.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL override for the provider API.
    #[serde(default)]
    pub base_url: Option<String>,
}

/// How provider reachability is decided before selecting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReachabilityMode {
    /// Cheap HTTP probe against the provider base URL, cached for a short
    /// TTL so admission latency is decoupled from network round-trips.
    Http,
    /// Treat "credential present" as "reachable". Optimistic: the provider
    /// may still reject calls. An explicit policy choice, not a default.
    Credential,
}

fn default_enforced_fraction() -> f64 {
    0.7
}
fn default_request_limit() -> u64 {
    1_000
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_max_concurrent() -> u32 {
    5
}
fn default_fallback_threshold() -> f64 {
    0.7
}
fn default_warning_threshold() -> f64 {
    80.0
}
fn default_critical_threshold() -> f64 {
    95.0
}
fn default_min_daily_fraction() -> f64 {
    0.02
}
fn default_reachability() -> ReachabilityMode {
    ReachabilityMode::Http
}
fn default_probe_ttl_secs() -> u64 {
    30
}
fn default_probe_timeout_ms() -> u64 {
    1_000
}
fn default_call_timeout_secs() -> u64 {
    120
}

/// The single configuration object owned by the admission layer.
///
/// All ceiling fractions and thresholds live here — nowhere else — so the
/// same knob can never be declared twice with drifting values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Primary provider ceilings.
    pub anthropic: ProviderLimits,
    /// Secondary provider ceilings.
    pub openai: ProviderLimits,
    /// Fraction of the nominal monthly ceiling actually enforced, leaving
    /// headroom (e.g. 0.7 enforces 70 %).
    #[serde(default = "default_enforced_fraction")]
    pub enforced_fraction: f64,
    /// Maximum estimated tokens for a single request.
    #[serde(default = "default_request_limit")]
    pub request_limit: u64,
    /// Minimum spacing between consecutive calls from one agent, in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Global cap on admitted-but-not-yet-completed calls.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Primary usage fraction at which the selector fails over (e.g. 0.7).
    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: f64,
    /// Usage percentage at which records enter `warning` status.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    /// Usage percentage at which records enter `critical` status.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    /// Minimum daily usage fraction near month-end. A policy nudge only —
    /// it never overrides the hourly/daily/monthly checks.
    #[serde(default = "default_min_daily_fraction")]
    pub min_daily_fraction: f64,
    /// Reachability policy for provider selection.
    #[serde(default = "default_reachability")]
    pub reachability: ReachabilityMode,
    /// TTL for cached reachability probe results, in seconds.
    #[serde(default = "default_probe_ttl_secs")]
    pub probe_ttl_secs: u64,
    /// Timeout for a single reachability probe, in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Timeout for the outbound completion call itself, in seconds.
    /// Independent of admission, which never blocks on the network.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl GateConfig {
    /// Ceilings for a provider.
    #[must_use]
    pub fn limits(&self, provider: Provider) -> &ProviderLimits {
        match provider {
            Provider::Anthropic => &self.anthropic,
            Provider::OpenAI => &self.openai,
        }
    }

    /// The enforced monthly ceiling: `nominal × enforced_fraction`.
    #[must_use]
    pub fn enforced_monthly_limit(&self, provider: Provider) -> u64 {
        (self.limits(provider).nominal_monthly_limit as f64 * self.enforced_fraction) as u64
    }

    /// Daily token ceiling for a provider.
    #[must_use]
    pub fn daily_limit(&self, provider: Provider) -> u64 {
        (self.enforced_monthly_limit(provider) as f64 * self.limits(provider).daily_fraction) as u64
    }

    /// Hourly token ceiling for a provider.
    #[must_use]
    pub fn hourly_limit(&self, provider: Provider) -> u64 {
        (self.enforced_monthly_limit(provider) as f64 * self.limits(provider).hourly_fraction)
            as u64
    }

    /// Validate the configuration at startup.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] for a missing ceiling or an
    /// out-of-range fraction/threshold. Fatal — callers should not start
    /// with an invalid config.
    pub fn validate(&self) -> Result<()> {
        for provider in [Provider::Anthropic, Provider::OpenAI] {
            let limits = self.limits(provider);
            if limits.nominal_monthly_limit == 0 {
                return Err(GateError::Config(format!(
                    "{provider}: nominal_monthly_limit must be > 0"
                )));
            }
            for (name, value) in [
                ("daily_fraction", limits.daily_fraction),
                ("hourly_fraction", limits.hourly_fraction),
            ] {
                if !(0.0..=1.0).contains(&value) || value == 0.0 {
                    return Err(GateError::Config(format!(
                        "{provider}: {name} must be in (0, 1], got {value}"
                    )));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.enforced_fraction) || self.enforced_fraction == 0.0 {
            return Err(GateError::Config(format!(
                "enforced_fraction must be in (0, 1], got {}",
                self.enforced_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.fallback_threshold) {
            return Err(GateError::Config(format!(
                "fallback_threshold must be in [0, 1], got {}",
                self.fallback_threshold
            )));
        }
        if self.request_limit == 0 {
            return Err(GateError::Config("request_limit must be > 0".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(GateError::Config("max_concurrent must be > 0".to_string()));
        }
        if self.warning_threshold >= self.critical_threshold {
            return Err(GateError::Config(format!(
                "warning_threshold ({}) must be below critical_threshold ({})",
                self.warning_threshold, self.critical_threshold
            )));
        }
        Ok(())
    }

    /// Whether `at` falls in the month-end window where the minimum-daily
    /// usage floor may be nudged (last week of the month).
    #[must_use]
    pub fn in_month_end_window(&self, at: DateTime<Utc>) -> bool {
        at.day() > 23
    }
}

// ---------------------------------------------------------------------------
// Denial reasons
// ---------------------------------------------------------------------------

/// Why an admission check denied a prospective call.
///
/// Each variant carries the diagnostics a caller needs to decide whether to
/// wait or switch provider. `code()` gives the stable wire reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    /// The agent's cooldown period has not elapsed.
    Cooldown {
        /// Seconds until the agent may call again.
        remaining_secs: u64,
    },
    /// The global in-flight call cap is saturated.
    TooManyConcurrent { active: u32, max: u32 },
    /// The request's estimated tokens exceed the per-request ceiling.
    RequestTooLarge {
        estimated_tokens: u64,
        request_limit: u64,
    },
    /// Admitting the call would exceed the hourly ceiling.
    HourlyExceeded {
        hourly_usage: u64,
        hourly_limit: u64,
        estimated_tokens: u64,
    },
    /// Admitting the call would exceed the daily ceiling.
    DailyExceeded {
        daily_usage: u64,
        daily_limit: u64,
        estimated_tokens: u64,
    },
    /// Admitting the call would exceed the enforced monthly ceiling.
    MonthlyExceeded {
        global_usage: u64,
        enforced_limit: u64,
        estimated_tokens: u64,
    },
}

impl DenialReason {
    /// Stable machine-readable reason code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cooldown { .. } => "cooldown",
            Self::TooManyConcurrent { .. } => "too_many_concurrent",
            Self::RequestTooLarge { .. } => "request_too_large",
            Self::HourlyExceeded { .. } => "hourly_exceeded",
            Self::DailyExceeded { .. } => "daily_exceeded",
            Self::MonthlyExceeded { .. } => "monthly_exceeded",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cooldown { remaining_secs } => {
                write!(f, "cooldown ({remaining_secs}s remaining)")
            }
            Self::TooManyConcurrent { active, max } => {
                write!(f, "too_many_concurrent ({active}/{max} in flight)")
            }
            Self::RequestTooLarge {
                estimated_tokens,
                request_limit,
            } => write!(
                f,
                "request_too_large ({estimated_tokens} tokens > {request_limit} limit)"
            ),
            Self::HourlyExceeded {
                hourly_usage,
                hourly_limit,
                estimated_tokens,
            } => write!(
                f,
                "hourly_exceeded ({hourly_usage} + {estimated_tokens} > {hourly_limit})"
            ),
            Self::DailyExceeded {
                daily_usage,
                daily_limit,
                estimated_tokens,
            } => write!(
                f,
                "daily_exceeded ({daily_usage} + {estimated_tokens} > {daily_limit})"
            ),
            Self::MonthlyExceeded {
                global_usage,
                enforced_limit,
                estimated_tokens,
            } => write!(
                f,
                "monthly_exceeded ({global_usage} + {estimated_tokens} > {enforced_limit})"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum GateError {
    /// Invalid or missing configuration — fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable store failure. Caught and logged at the ledger boundary;
    /// never allowed to abort the hot call path.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A ceiling or pacing check denied the call. Recoverable — the caller
    /// can wait or switch provider.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(DenialReason),

    /// The provider could not be reached. Triggers one fallback attempt.
    #[error("Provider {provider} unreachable")]
    ProviderUnreachable {
        /// Which provider failed the reachability check.
        provider: Provider,
    },

    /// The outbound completion call itself failed.
    #[error("Provider {provider} call failed: {message}")]
    Provider {
        /// Provider the call was made against.
        provider: Provider,
        /// Upstream error description.
        message: String,
    },

    /// Neither provider could take the call. Terminal for this call;
    /// carries both providers' diagnostics so the failure is never silent.
    #[error("Both providers exhausted (primary: {primary_reason}; secondary: {secondary_reason})")]
    BothProvidersExhausted {
        /// Why the primary was rejected.
        primary_reason: String,
        /// Why the secondary was rejected.
        secondary_reason: String,
    },

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `std::result::Result<T, GateError>`.
pub type Result<T> = std::result::Result<T, GateError>;

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Durable store contract for usage accounting.
///
/// Any store providing atomic upsert-by-key plus append satisfies this.
/// Dev/test: in-memory. Production: SQLite.
#[async_trait::async_trait]
pub trait UsageStore: Send + Sync {
    /// Append a log entry and fold it into the monthly aggregate in one
    /// transaction. The log append is ordered before the aggregate upsert:
    /// a missing aggregate is derivable from the log, but an aggregate
    /// without its log entry is not.
    async fn append_usage(&self, entry: &UsageLogEntry) -> Result<()>;

    /// The monthly aggregate for one (agent, provider, month), if any
    /// usage has been recorded.
    async fn monthly_record(
        &self,
        agent: &AgentId,
        provider: Provider,
        month: &str,
    ) -> Result<Option<UsageRecord>>;

    /// All monthly aggregates for a provider and month.
    async fn monthly_records(&self, provider: Provider, month: &str) -> Result<Vec<UsageRecord>>;

    /// Sum of `total_tokens` across ALL agents for a provider and month.
    async fn global_monthly_total(&self, provider: Provider, month: &str) -> Result<u64>;

    /// Sum of `total_tokens` over log entries with
    /// `start <= created_at < end` for a provider. Always derived from the
    /// log, never from separately maintained counters.
    async fn window_total(
        &self,
        provider: Provider,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64>;

    /// Monthly aggregates for one agent/provider from `since_month`
    /// (inclusive), newest first.
    async fn records_since(
        &self,
        agent: &AgentId,
        provider: Provider,
        since_month: &str,
    ) -> Result<Vec<UsageRecord>>;

    /// Delete the aggregate and all matching log entries for one
    /// (agent, provider, month). Returns whether anything was deleted.
    /// The only way usage figures ever go backwards.
    async fn reset_month(
        &self,
        agent: &AgentId,
        provider: Provider,
        month: &str,
    ) -> Result<bool>;

    /// Health check for the store.
    async fn health_check(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Completion client trait
// ---------------------------------------------------------------------------

/// Response from an outbound completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The completion text.
    pub text: String,
    /// Prompt tokens as reported by the provider (0 if not reported).
    pub tokens_in: u64,
    /// Completion tokens as reported by the provider (0 if not reported).
    pub tokens_out: u64,
    /// Provider-assigned request ID, when present.
    pub request_id: Option<String>,
}

/// Outbound HTTP client for one completion-API provider.
#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    /// Which provider this client talks to.
    fn provider(&self) -> Provider;

    /// Execute a completion call.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Provider`] on transport or upstream failure.
    async fn send(
        &self,
        prompt: &str,
        model: &str,
        max_tokens: u32,
    ) -> Result<CompletionResponse>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_config() -> GateConfig {
        GateConfig {
            anthropic: ProviderLimits {
                nominal_monthly_limit: 1_000_000,
                daily_fraction: 0.15,
                hourly_fraction: 0.02,
                api_key: None,
                base_url: None,
            },
            openai: ProviderLimits {
                nominal_monthly_limit: 500_000,
                daily_fraction: 0.12,
                hourly_fraction: 0.01,
                api_key: None,
                base_url: None,
            },
            enforced_fraction: 0.7,
            request_limit: 1_000,
            cooldown_secs: 60,
            max_concurrent: 5,
            fallback_threshold: 0.7,
            warning_threshold: 80.0,
            critical_threshold: 95.0,
            min_daily_fraction: 0.02,
            reachability: ReachabilityMode::Http,
            probe_ttl_secs: 30,
            probe_timeout_ms: 1_000,
            call_timeout_secs: 120,
        }
    }

    // -- identities ---------------------------------------------------------

    #[test]
    fn test_provider_round_trip() {
        for p in [Provider::Anthropic, Provider::OpenAI] {
            let parsed: Provider = p.to_string().parse().unwrap();
            assert_eq!(parsed, p);
        }
        assert!("gemini".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_other() {
        assert_eq!(Provider::Anthropic.other(), Provider::OpenAI);
        assert_eq!(Provider::OpenAI.other(), Provider::Anthropic);
    }

    // -- time keys ----------------------------------------------------------

    #[test]
    fn test_bucket_keys() {
        let at = Utc.with_ymd_and_hms(2026, 8, 29, 14, 5, 0).unwrap();
        assert_eq!(month_key(at), "2026-08");
        assert_eq!(day_key(at), "2026-08-29");
        assert_eq!(hour_key(at), "2026-08-29-14");
    }

    // -- status derivation --------------------------------------------------

    #[test]
    fn test_status_thresholds() {
        assert_eq!(
            UsageStatus::from_percentage(10.0, 80.0, 95.0),
            UsageStatus::Active
        );
        assert_eq!(
            UsageStatus::from_percentage(80.0, 80.0, 95.0),
            UsageStatus::Warning
        );
        assert_eq!(
            UsageStatus::from_percentage(95.0, 80.0, 95.0),
            UsageStatus::Critical
        );
        assert_eq!(
            UsageStatus::from_percentage(100.0, 80.0, 95.0),
            UsageStatus::LimitReached
        );
    }

    #[test]
    fn test_record_absorb_and_derive() {
        let mut record =
            UsageRecord::new(AgentId::from("imperium"), Provider::Anthropic, "2026-08");
        let entry = UsageLogEntry::new(
            AgentId::from("imperium"),
            Provider::Anthropic,
            100,
            50,
            Some("claude-sonnet".to_string()),
            None,
            true,
            None,
        );
        record.absorb(&entry);
        assert_eq!(record.total_tokens, 150);
        assert_eq!(record.request_count, 1);
        assert_eq!(record.last_request_at, Some(entry.created_at));

        // Derived percentage uses the GLOBAL total, not this record's own.
        let derived = record.with_global_usage(850_000, 1_000_000, 80.0, 95.0);
        assert!((derived.usage_percentage - 85.0).abs() < 1e-9);
        assert_eq!(derived.status, UsageStatus::Warning);
    }

    #[test]
    fn test_log_entry_totals() {
        let entry = UsageLogEntry::new(
            AgentId::from("guardian"),
            Provider::OpenAI,
            30,
            0,
            None,
            None,
            false,
            Some("timeout".to_string()),
        );
        assert_eq!(entry.total_tokens, 30);
        assert!(!entry.success);
        assert_eq!(entry.month_year, month_key(entry.created_at));
    }

    // -- config -------------------------------------------------------------

    #[test]
    fn test_config_derived_limits() {
        let config = test_config();
        assert_eq!(config.enforced_monthly_limit(Provider::Anthropic), 700_000);
        assert_eq!(config.daily_limit(Provider::Anthropic), 105_000);
        assert_eq!(config.hourly_limit(Provider::Anthropic), 14_000);
        assert_eq!(config.enforced_monthly_limit(Provider::OpenAI), 350_000);
    }

    #[test]
    fn test_config_valid() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_config_missing_ceiling_is_fatal() {
        let mut config = test_config();
        config.openai.nominal_monthly_limit = 0;
        assert!(matches!(config.validate(), Err(GateError::Config(_))));
    }

    #[test]
    fn test_config_bad_fraction_is_fatal() {
        let mut config = test_config();
        config.enforced_fraction = 1.5;
        assert!(matches!(config.validate(), Err(GateError::Config(_))));

        let mut config = test_config();
        config.anthropic.hourly_fraction = 0.0;
        assert!(matches!(config.validate(), Err(GateError::Config(_))));
    }

    #[test]
    fn test_config_threshold_ordering() {
        let mut config = test_config();
        config.warning_threshold = 96.0;
        assert!(matches!(config.validate(), Err(GateError::Config(_))));
    }

    #[test]
    fn test_month_end_window() {
        let config = test_config();
        let early = Utc.with_ymd_and_hms(2026, 8, 10, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 8, 28, 0, 0, 0).unwrap();
        assert!(!config.in_month_end_window(early));
        assert!(config.in_month_end_window(late));
    }

    // -- denial reasons -----------------------------------------------------

    #[test]
    fn test_denial_reason_codes() {
        let reasons = [
            (DenialReason::Cooldown { remaining_secs: 10 }, "cooldown"),
            (
                DenialReason::TooManyConcurrent { active: 5, max: 5 },
                "too_many_concurrent",
            ),
            (
                DenialReason::RequestTooLarge {
                    estimated_tokens: 2_000,
                    request_limit: 1_000,
                },
                "request_too_large",
            ),
            (
                DenialReason::HourlyExceeded {
                    hourly_usage: 900,
                    hourly_limit: 1_000,
                    estimated_tokens: 200,
                },
                "hourly_exceeded",
            ),
            (
                DenialReason::DailyExceeded {
                    daily_usage: 900,
                    daily_limit: 1_000,
                    estimated_tokens: 200,
                },
                "daily_exceeded",
            ),
            (
                DenialReason::MonthlyExceeded {
                    global_usage: 99_990,
                    enforced_limit: 100_000,
                    estimated_tokens: 20,
                },
                "monthly_exceeded",
            ),
        ];
        for (reason, code) in reasons {
            assert_eq!(reason.code(), code);
            assert!(reason.to_string().starts_with(code));
        }
    }
}
