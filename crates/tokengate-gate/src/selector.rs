//! Primary/secondary provider choice.
//!
//! Anthropic is primary; OpenAI is the fallback. The selector prefers
//! the primary until it is unreachable, over a ceiling, or past the
//! fallback threshold of its monthly budget, and only then offers the
//! secondary — provided the secondary itself still has monthly headroom.
//! When neither qualifies, both diagnostics are surfaced so the refusal
//! is never silent.
//!
//! Selection is advisory: the admission gate re-checks whichever
//! provider is chosen, so a stale probe answer can cost one wasted
//! attempt but never a busted ceiling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokengate_core::{month_key, GateConfig, Provider, UsageStore};
use tracing::{debug, warn};

use crate::admission::AdmissionController;
use crate::reachability::ReachabilityProbe;

/// Outcome of provider selection.
#[derive(Debug)]
pub enum Selection {
    /// Send the call to this provider.
    Chosen {
        /// The provider to use.
        provider: Provider,
        /// Why it was chosen (for logs and diagnostics).
        reason: String,
    },
    /// Neither provider can take the call.
    Exhausted {
        /// Why the primary was passed over.
        primary_reason: String,
        /// Why the secondary was passed over.
        secondary_reason: String,
    },
}

/// Chooses which provider a call should go to.
pub struct ProviderSelector {
    config: GateConfig,
    store: Arc<dyn UsageStore>,
    admission: Arc<AdmissionController>,
    probe: Arc<dyn ReachabilityProbe>,
}

impl ProviderSelector {
    const PRIMARY: Provider = Provider::Anthropic;
    const SECONDARY: Provider = Provider::OpenAI;

    /// Create a selector.
    pub fn new(
        config: GateConfig,
        store: Arc<dyn UsageStore>,
        admission: Arc<AdmissionController>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        Self {
            config,
            store,
            admission,
            probe,
        }
    }

    /// Pick a provider for a call of the given estimated size.
    pub async fn select(&self, estimated_tokens: u64, now: DateTime<Utc>) -> Selection {
        if !self.probe.is_reachable(Self::PRIMARY).await {
            return self
                .fall_back(format!("{} unreachable", Self::PRIMARY), now)
                .await;
        }

        if let Some(denial) = self.admission.peek(Self::PRIMARY, estimated_tokens, now).await {
            return self
                .fall_back(format!("{} over ceiling: {denial}", Self::PRIMARY), now)
                .await;
        }

        let primary_pct = self.usage_percentage(Self::PRIMARY, now).await;
        let threshold_pct = self.config.fallback_threshold * 100.0;
        if primary_pct < threshold_pct {
            debug!(
                provider = %Self::PRIMARY,
                usage_pct = primary_pct,
                "Primary selected"
            );
            return Selection::Chosen {
                provider: Self::PRIMARY,
                reason: format!("primary at {primary_pct:.1}% of monthly budget"),
            };
        }

        self.fall_back(
            format!(
                "{} at {primary_pct:.1}% of monthly budget (threshold {threshold_pct:.0}%)",
                Self::PRIMARY
            ),
            now,
        )
        .await
    }

    async fn fall_back(&self, primary_reason: String, now: DateTime<Utc>) -> Selection {
        let secondary_pct = self.usage_percentage(Self::SECONDARY, now).await;
        if secondary_pct < 100.0 {
            debug!(
                provider = %Self::SECONDARY,
                usage_pct = secondary_pct,
                %primary_reason,
                "Falling back to secondary"
            );
            return Selection::Chosen {
                provider: Self::SECONDARY,
                reason: format!("fallback ({primary_reason})"),
            };
        }

        let secondary_reason = format!(
            "{} at {secondary_pct:.1}% of monthly budget",
            Self::SECONDARY
        );
        warn!(%primary_reason, %secondary_reason, "No provider available");
        Selection::Exhausted {
            primary_reason,
            secondary_reason,
        }
    }

    async fn usage_percentage(&self, provider: Provider, now: DateTime<Utc>) -> f64 {
        let enforced = self.config.enforced_monthly_limit(provider);
        if enforced == 0 {
            return 100.0;
        }
        match self
            .store
            .global_monthly_total(provider, &month_key(now))
            .await
        {
            Ok(total) => (total as f64 / enforced as f64) * 100.0,
            Err(e) => {
                warn!(%provider, error = %e, "Monthly usage unavailable, assuming zero");
                0.0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
