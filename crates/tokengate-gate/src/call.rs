//! The gated call path.
//!
//! One entry point, [`TokenGate::call`], owns the full lifecycle of an
//! outbound completion call: estimate, select a provider, pass
//! admission, execute under a timeout, and record what happened. A
//! denial on the selected provider earns exactly one fallback attempt
//! against the other provider — never a retry loop — and a call that is
//! refused by both is itself recorded, so refusals leave a trace in the
//! accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokengate_core::{
    AgentId, CompletionClient, CompletionResponse, GateConfig, GateError, Provider, Result,
    UsageStore,
};
use tracing::{info, warn};

use crate::admission::{AdmissionController, AdmissionDecision, AdmissionPermit};
use crate::estimate::estimate_tokens;
use crate::ledger::{RecordAck, UsageLedger};
use crate::reachability::{probe_for, ReachabilityProbe};
use crate::selector::{ProviderSelector, Selection};
use crate::windows::RateWindowTracker;

/// One completion call to be gated.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Agent making the call.
    pub agent: AgentId,
    /// Prompt text.
    pub prompt: String,
    /// Model to request from the provider.
    pub model: String,
    /// Completion token budget for the call.
    pub max_tokens: u32,
}

/// Result of a successfully gated and executed call.
#[derive(Debug)]
pub struct CallOutcome {
    /// Provider the call was sent to.
    pub provider: Provider,
    /// The provider's response.
    pub response: CompletionResponse,
    /// Pre-call token estimate the call was admitted under.
    pub estimated_tokens: u64,
    /// Accounting acknowledgement.
    pub record: RecordAck,
}

/// The gate every outbound completion call goes through.
pub struct TokenGate {
    config: GateConfig,
    ledger: UsageLedger,
    admission: Arc<AdmissionController>,
    selector: ProviderSelector,
    clients: HashMap<Provider, Arc<dyn CompletionClient>>,
}

impl TokenGate {
    /// Assemble a gate from its parts.
    ///
    /// Both providers must have a client; selection assumes it can hand
    /// a call to either.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] on invalid configuration or a
    /// missing client.
    pub fn new(
        config: GateConfig,
        store: Arc<dyn UsageStore>,
        probe: Arc<dyn ReachabilityProbe>,
        clients: Vec<Arc<dyn CompletionClient>>,
    ) -> Result<Self> {
        config.validate()?;

        let clients: HashMap<Provider, Arc<dyn CompletionClient>> = clients
            .into_iter()
            .map(|c| (c.provider(), c))
            .collect();
        for provider in [Provider::Anthropic, Provider::OpenAI] {
            if !clients.contains_key(&provider) {
                return Err(GateError::Config(format!(
                    "No completion client for {provider}"
                )));
            }
        }

        let windows = Arc::new(RateWindowTracker::new(
            store.clone(),
            Duration::from_secs(5),
        ));
        let admission = Arc::new(AdmissionController::new(
            config.clone(),
            store.clone(),
            windows.clone(),
        ));
        let ledger = UsageLedger::new(config.clone(), store.clone(), windows);
        let selector = ProviderSelector::new(
            config.clone(),
            store,
            admission.clone(),
            probe,
        );

        Ok(Self {
            config,
            ledger,
            admission,
            selector,
            clients,
        })
    }

    /// Assemble a gate with real HTTP clients and the configured
    /// reachability probe.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] if configuration is invalid or
    /// either provider is missing an API key.
    pub fn from_config(config: GateConfig, store: Arc<dyn UsageStore>) -> Result<Self> {
        let probe = probe_for(&config);
        let clients: Vec<Arc<dyn CompletionClient>> = vec![
            Arc::new(crate::client::AnthropicClient::from_config(&config)?),
            Arc::new(crate::client::OpenAiClient::from_config(&config)?),
        ];
        Self::new(config, store, probe, clients)
    }

    /// The ledger, for usage snapshots and resets.
    #[must_use]
    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Which provider a call of the given estimated size would go to
    /// right now. Advisory only; [`TokenGate::call`] re-selects.
    pub async fn recommend_provider(&self, estimated_tokens: u64) -> Selection {
        self.selector.select(estimated_tokens, Utc::now()).await
    }

    /// Gate, execute, and record one completion call.
    ///
    /// # Errors
    ///
    /// - [`GateError::BothProvidersExhausted`] when no provider can take
    ///   the call; the refusal is recorded as a failed entry.
    /// - [`GateError::Provider`] when the upstream call fails or times
    ///   out; the attempt is recorded with estimated input tokens.
    pub async fn call(&self, request: &CallRequest) -> Result<CallOutcome> {
        let now = Utc::now();
        let estimated_tokens = estimate_tokens(&request.prompt, request.max_tokens);

        let (provider, permit) = match self.selector.select(estimated_tokens, now).await {
            Selection::Chosen { provider, reason } => {
                info!(agent = %request.agent, %provider, %reason, "Provider selected");
                match self
                    .admission
                    .admit(&request.agent, provider, estimated_tokens, now)
                    .await
                {
                    AdmissionDecision::Admitted(permit) => (provider, permit),
                    AdmissionDecision::Denied(first) => {
                        // One fallback hop, never a loop.
                        let fallback = provider.other();
                        match self
                            .admission
                            .admit(&request.agent, fallback, estimated_tokens, now)
                            .await
                        {
                            AdmissionDecision::Admitted(permit) => {
                                info!(
                                    agent = %request.agent,
                                    from = %provider,
                                    to = %fallback,
                                    reason = %first,
                                    "Admitted on fallback provider"
                                );
                                (fallback, permit)
                            }
                            AdmissionDecision::Denied(second) => {
                                return Err(self
                                    .refuse(request, first.to_string(), second.to_string())
                                    .await);
                            }
                        }
                    }
                }
            }
            Selection::Exhausted {
                primary_reason,
                secondary_reason,
            } => {
                return Err(self.refuse(request, primary_reason, secondary_reason).await);
            }
        };

        self.execute(request, provider, estimated_tokens, permit)
            .await
    }

    async fn execute(
        &self,
        request: &CallRequest,
        provider: Provider,
        estimated_tokens: u64,
        permit: AdmissionPermit,
    ) -> Result<CallOutcome> {
        // The permit holds the concurrency slot until accounting is done.
        let _permit = permit;

        let client = self.clients.get(&provider).ok_or_else(|| {
            GateError::Config(format!("No completion client for {provider}"))
        })?;

        let timeout = Duration::from_secs(self.config.call_timeout_secs);
        let sent = tokio::time::timeout(
            timeout,
            client.send(&request.prompt, &request.model, request.max_tokens),
        )
        .await;

        match sent {
            Ok(Ok(response)) => {
                // Prefer provider-reported counts; fall back to word
                // estimates when the provider reports nothing.
                let (tokens_in, tokens_out) =
                    if response.tokens_in == 0 && response.tokens_out == 0 {
                        (
                            estimate_tokens(&request.prompt, 0),
                            estimate_tokens(&response.text, 0),
                        )
                    } else {
                        (response.tokens_in, response.tokens_out)
                    };

                let record = self
                    .ledger
                    .record(
                        &request.agent,
                        provider,
                        tokens_in,
                        tokens_out,
                        Some(request.model.clone()),
                        response.request_id.clone(),
                        true,
                        None,
                    )
                    .await;

                Ok(CallOutcome {
                    provider,
                    response,
                    estimated_tokens,
                    record,
                })
            }
            Ok(Err(e)) => {
                warn!(agent = %request.agent, %provider, error = %e, "Upstream call failed");
                self.ledger
                    .record(
                        &request.agent,
                        provider,
                        estimate_tokens(&request.prompt, 0),
                        0,
                        Some(request.model.clone()),
                        None,
                        false,
                        Some(e.to_string()),
                    )
                    .await;
                Err(e)
            }
            Err(_) => {
                let message = format!("Timed out after {}s", self.config.call_timeout_secs);
                warn!(agent = %request.agent, %provider, %message, "Upstream call timed out");
                self.ledger
                    .record(
                        &request.agent,
                        provider,
                        estimate_tokens(&request.prompt, 0),
                        0,
                        Some(request.model.clone()),
                        None,
                        false,
                        Some(message.clone()),
                    )
                    .await;
                Err(GateError::Provider { provider, message })
            }
        }
    }

    /// Record a refusal (zero tokens, failed entry) and build the error.
    async fn refuse(
        &self,
        request: &CallRequest,
        primary_reason: String,
        secondary_reason: String,
    ) -> GateError {
        self.ledger
            .record(
                &request.agent,
                Provider::Anthropic,
                0,
                0,
                Some(request.model.clone()),
                None,
                false,
                Some(format!("refused: {primary_reason}; {secondary_reason}")),
            )
            .await;
        GateError::BothProvidersExhausted {
            primary_reason,
            secondary_reason,
        }
    }
}
