//! End-to-end tests for the gated call path: selection, admission,
//! fallback, execution, and accounting working together over the
//! in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokengate_core::{
    AgentId, CompletionClient, CompletionResponse, GateConfig, GateError, Provider,
    ProviderLimits, ReachabilityMode, Result, UsageLogEntry, UsageStore,
};
use tokengate_gate::{CallRequest, ReachabilityProbe, TokenGate};
use tokengate_storage::InMemoryUsageStore;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

enum Behavior {
    /// Respond with text and provider-reported token counts.
    Succeed { tokens_in: u64, tokens_out: u64 },
    /// Respond with text but no token counts.
    SucceedWithoutUsage,
    /// Fail with an upstream error.
    Fail,
}

struct MockClient {
    provider: Provider,
    behavior: Behavior,
    calls: AtomicUsize,
}

impl MockClient {
    fn new(provider: Provider, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            provider,
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for MockClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn send(
        &self,
        _prompt: &str,
        _model: &str,
        _max_tokens: u32,
    ) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed {
                tokens_in,
                tokens_out,
            } => Ok(CompletionResponse {
                text: "mock completion".to_string(),
                tokens_in,
                tokens_out,
                request_id: Some("mock-req".to_string()),
            }),
            Behavior::SucceedWithoutUsage => Ok(CompletionResponse {
                text: "mock completion".to_string(),
                tokens_in: 0,
                tokens_out: 0,
                request_id: None,
            }),
            Behavior::Fail => Err(GateError::Provider {
                provider: self.provider,
                message: "upstream 500".to_string(),
            }),
        }
    }
}

struct AlwaysReachable;

#[async_trait]
impl ReachabilityProbe for AlwaysReachable {
    async fn is_reachable(&self, _provider: Provider) -> bool {
        true
    }
}

struct PrimaryDown;

#[async_trait]
impl ReachabilityProbe for PrimaryDown {
    async fn is_reachable(&self, provider: Provider) -> bool {
        provider != Provider::Anthropic
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Wide daily/hourly windows and no cooldown, so individual tests can
/// turn on exactly the ceiling they exercise.
fn config() -> GateConfig {
    let limits = |nominal| ProviderLimits {
        nominal_monthly_limit: nominal,
        daily_fraction: 1.0,
        hourly_fraction: 1.0,
        api_key: None,
        base_url: None,
    };
    GateConfig {
        anthropic: limits(1_000_000),
        openai: limits(500_000),
        enforced_fraction: 0.7,
        request_limit: 1_000,
        cooldown_secs: 0,
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

fn request(agent: &str) -> CallRequest {
    CallRequest {
        agent: AgentId::from(agent),
        prompt: "summarize the latest build failures".to_string(),
        model: "test-model".to_string(),
        max_tokens: 100,
    }
}

async fn seed(store: &InMemoryUsageStore, provider: Provider, total: u64) {
    store
        .append_usage(&UsageLogEntry::new(
            AgentId::from("historic"),
            provider,
            total,
            0,
            None,
            None,
            true,
            None,
        ))
        .await
        .unwrap();
}

fn gate(
    cfg: GateConfig,
    store: Arc<InMemoryUsageStore>,
    probe: Arc<dyn ReachabilityProbe>,
    anthropic: Arc<MockClient>,
    openai: Arc<MockClient>,
) -> TokenGate {
    let clients: Vec<Arc<dyn CompletionClient>> = vec![anthropic, openai];
    TokenGate::new(cfg, store, probe, clients).unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_successful_call_uses_primary_and_records_reported_tokens() {
    let store = Arc::new(InMemoryUsageStore::new());
    let anthropic = MockClient::new(
        Provider::Anthropic,
        Behavior::Succeed {
            tokens_in: 42,
            tokens_out: 17,
        },
    );
    let openai = MockClient::new(Provider::OpenAI, Behavior::SucceedWithoutUsage);
    let gate = gate(
        config(),
        store.clone(),
        Arc::new(AlwaysReachable),
        anthropic.clone(),
        openai.clone(),
    );

    let outcome = gate.call(&request("imperium")).await.unwrap();
    assert_eq!(outcome.provider, Provider::Anthropic);
    assert_eq!(anthropic.call_count(), 1);
    assert_eq!(openai.call_count(), 0);
    assert!(outcome.record.persisted);

    let record = gate
        .ledger()
        .agent_usage(&AgentId::from("imperium"), Provider::Anthropic, Utc::now())
        .await
        .unwrap()
        .expect("usage should be recorded");
    assert_eq!(record.tokens_in, 42);
    assert_eq!(record.tokens_out, 17);
    assert_eq!(record.request_count, 1);
}

#[tokio::test]
async fn test_unreported_usage_falls_back_to_estimates() {
    let store = Arc::new(InMemoryUsageStore::new());
    let anthropic = MockClient::new(Provider::Anthropic, Behavior::SucceedWithoutUsage);
    let openai = MockClient::new(Provider::OpenAI, Behavior::SucceedWithoutUsage);
    let gate = gate(
        config(),
        store,
        Arc::new(AlwaysReachable),
        anthropic,
        openai,
    );

    gate.call(&request("imperium")).await.unwrap();
    let record = gate
        .ledger()
        .agent_usage(&AgentId::from("imperium"), Provider::Anthropic, Utc::now())
        .await
        .unwrap()
        .unwrap();
    // Word-count estimates, never zero for a non-empty exchange.
    assert!(record.tokens_in > 0);
    assert!(record.tokens_out > 0);
}

#[tokio::test]
async fn test_spent_primary_routes_to_secondary() {
    let store = Arc::new(InMemoryUsageStore::new());
    // 72% of anthropic's 700_000 enforced limit.
    seed(&store, Provider::Anthropic, 504_000).await;
    let anthropic = MockClient::new(
        Provider::Anthropic,
        Behavior::Succeed {
            tokens_in: 1,
            tokens_out: 1,
        },
    );
    let openai = MockClient::new(
        Provider::OpenAI,
        Behavior::Succeed {
            tokens_in: 9,
            tokens_out: 4,
        },
    );
    let gate = gate(
        config(),
        store,
        Arc::new(AlwaysReachable),
        anthropic.clone(),
        openai.clone(),
    );

    let outcome = gate.call(&request("imperium")).await.unwrap();
    assert_eq!(outcome.provider, Provider::OpenAI);
    assert_eq!(anthropic.call_count(), 0);
    assert_eq!(openai.call_count(), 1);
}

#[tokio::test]
async fn test_unreachable_primary_routes_to_secondary() {
    let store = Arc::new(InMemoryUsageStore::new());
    let anthropic = MockClient::new(Provider::Anthropic, Behavior::Fail);
    let openai = MockClient::new(
        Provider::OpenAI,
        Behavior::Succeed {
            tokens_in: 5,
            tokens_out: 5,
        },
    );
    let gate = gate(
        config(),
        store,
        Arc::new(PrimaryDown),
        anthropic.clone(),
        openai.clone(),
    );

    let outcome = gate.call(&request("imperium")).await.unwrap();
    assert_eq!(outcome.provider, Provider::OpenAI);
    assert_eq!(anthropic.call_count(), 0);
}

#[tokio::test]
async fn test_both_providers_exhausted_is_recorded_and_reported() {
    let store = Arc::new(InMemoryUsageStore::new());
    seed(&store, Provider::Anthropic, 700_000).await;
    seed(&store, Provider::OpenAI, 350_000).await;
    let anthropic = MockClient::new(Provider::Anthropic, Behavior::Fail);
    let openai = MockClient::new(Provider::OpenAI, Behavior::Fail);
    let gate = gate(
        config(),
        store,
        Arc::new(AlwaysReachable),
        anthropic.clone(),
        openai.clone(),
    );

    let err = gate.call(&request("imperium")).await.unwrap_err();
    match err {
        GateError::BothProvidersExhausted {
            primary_reason,
            secondary_reason,
        } => {
            assert!(!primary_reason.is_empty());
            assert!(!secondary_reason.is_empty());
        }
        other => panic!("expected exhaustion, got {other}"),
    }
    // No network call was made, but the refusal left a failed entry with
    // zero tokens.
    assert_eq!(anthropic.call_count(), 0);
    assert_eq!(openai.call_count(), 0);
    let record = gate
        .ledger()
        .agent_usage(&AgentId::from("imperium"), Provider::Anthropic, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.total_tokens, 0);
    assert_eq!(record.request_count, 1);
}

#[tokio::test]
async fn test_cooldown_refuses_rapid_second_call() {
    let store = Arc::new(InMemoryUsageStore::new());
    let mut cfg = config();
    cfg.cooldown_secs = 60;
    let anthropic = MockClient::new(
        Provider::Anthropic,
        Behavior::Succeed {
            tokens_in: 1,
            tokens_out: 1,
        },
    );
    let openai = MockClient::new(Provider::OpenAI, Behavior::SucceedWithoutUsage);
    let gate = gate(
        cfg,
        store,
        Arc::new(AlwaysReachable),
        anthropic,
        openai,
    );

    gate.call(&request("imperium")).await.unwrap();
    // The fallback hop cannot dodge the cooldown: it is per agent, not
    // per provider.
    let err = gate.call(&request("imperium")).await.unwrap_err();
    match err {
        GateError::BothProvidersExhausted { primary_reason, .. } => {
            assert!(primary_reason.contains("cooldown"));
        }
        other => panic!("expected exhaustion, got {other}"),
    }
}

#[tokio::test]
async fn test_upstream_failure_is_recorded_with_estimated_input() {
    let store = Arc::new(InMemoryUsageStore::new());
    let anthropic = MockClient::new(Provider::Anthropic, Behavior::Fail);
    let openai = MockClient::new(Provider::OpenAI, Behavior::SucceedWithoutUsage);
    let gate = gate(
        config(),
        store,
        Arc::new(AlwaysReachable),
        anthropic,
        openai,
    );

    let err = gate.call(&request("imperium")).await.unwrap_err();
    assert!(matches!(err, GateError::Provider { .. }));

    let record = gate
        .ledger()
        .agent_usage(&AgentId::from("imperium"), Provider::Anthropic, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert!(record.tokens_in > 0);
    assert_eq!(record.tokens_out, 0);
}

#[tokio::test]
async fn test_missing_client_refuses_to_assemble() {
    let store: Arc<dyn UsageStore> = Arc::new(InMemoryUsageStore::new());
    let only_anthropic: Vec<Arc<dyn CompletionClient>> = vec![MockClient::new(
        Provider::Anthropic,
        Behavior::SucceedWithoutUsage,
    )];
    let result = TokenGate::new(
        config(),
        store,
        Arc::new(AlwaysReachable),
        only_anthropic,
    );
    assert!(matches!(result, Err(GateError::Config(_))));
}
