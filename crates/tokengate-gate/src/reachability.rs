//! Provider reachability checks.
//!
//! Selection wants a cheap "is this provider worth trying" signal. Two
//! policies exist: an HTTP probe (any response, including an error
//! status, counts as reachable — only transport failure does not), and
//! an optimistic credential check that treats a configured API key as
//! proof of life. The probe result is cached for a short TTL so the
//! admission path never waits on a fresh network round-trip per call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokengate_core::{GateConfig, Provider, ReachabilityMode};
use tracing::debug;

const ANTHROPIC_DEFAULT_URL: &str = "https://api.anthropic.com";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";

/// Decides whether a provider is worth sending a call to.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Whether the provider currently looks reachable.
    async fn is_reachable(&self, provider: Provider) -> bool;
}

/// Build the probe stack selected by the configuration.
#[must_use]
pub fn probe_for(config: &GateConfig) -> Arc<dyn ReachabilityProbe> {
    let ttl = Duration::from_secs(config.probe_ttl_secs);
    match config.reachability {
        ReachabilityMode::Http => Arc::new(CachedProbe::new(HttpProbe::new(config), ttl)),
        ReachabilityMode::Credential => Arc::new(CredentialProbe::new(config)),
    }
}

// ---------------------------------------------------------------------------
// HTTP probe
// ---------------------------------------------------------------------------

/// Probes the provider base URL with a short-timeout GET.
pub struct HttpProbe {
    client: reqwest::Client,
    anthropic_url: String,
    openai_url: String,
}

impl HttpProbe {
    /// Build a probe from the configured base URLs and probe timeout.
    #[must_use]
    pub fn new(config: &GateConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.probe_timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            client,
            anthropic_url: config
                .anthropic
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_URL.to_string()),
            openai_url: config
                .openai
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string()),
        }
    }

    fn url(&self, provider: Provider) -> &str {
        match provider {
            Provider::Anthropic => &self.anthropic_url,
            Provider::OpenAI => &self.openai_url,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self, provider: Provider) -> bool {
        // A 4xx from the API root still proves the host answers.
        match self.client.get(self.url(provider)).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(%provider, error = %e, "Reachability probe failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cached probe
// ---------------------------------------------------------------------------

/// Wraps another probe and caches its answer per provider for a TTL.
pub struct CachedProbe<P> {
    inner: P,
    ttl: Duration,
    cache: Mutex<HashMap<Provider, (bool, Instant)>>,
}

impl<P: ReachabilityProbe> CachedProbe<P> {
    /// Cache `inner`'s answers for `ttl`.
    pub fn new(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<P: ReachabilityProbe> ReachabilityProbe for CachedProbe<P> {
    async fn is_reachable(&self, provider: Provider) -> bool {
        {
            let cache = match self.cache.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some((reachable, at)) = cache.get(&provider) {
                if at.elapsed() < self.ttl {
                    return *reachable;
                }
            }
        }

        let reachable = self.inner.is_reachable(provider).await;
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.insert(provider, (reachable, Instant::now()));
        reachable
    }
}

// ---------------------------------------------------------------------------
// Credential probe
// ---------------------------------------------------------------------------

/// Treats "API key configured" as "reachable".
///
/// Optimistic: the provider may still refuse the call, in which case the
/// failure surfaces from the call itself and is recorded like any other.
/// Selected explicitly via [`ReachabilityMode::Credential`].
pub struct CredentialProbe {
    anthropic_key: bool,
    openai_key: bool,
}

impl CredentialProbe {
    /// Snapshot which providers have credentials configured.
    #[must_use]
    pub fn new(config: &GateConfig) -> Self {
        Self {
            anthropic_key: config.anthropic.api_key.is_some(),
            openai_key: config.openai.api_key.is_some(),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for CredentialProbe {
    async fn is_reachable(&self, provider: Provider) -> bool {
        match provider {
            Provider::Anthropic => self.anthropic_key,
            Provider::OpenAI => self.openai_key,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokengate_core::ProviderLimits;

    fn config(anthropic_key: Option<&str>, openai_key: Option<&str>) -> GateConfig {
        let limits = |key: Option<&str>| ProviderLimits {
            nominal_monthly_limit: 1_000_000,
            daily_fraction: 0.15,
            hourly_fraction: 0.02,
            api_key: key.map(String::from),
            base_url: None,
        };
        GateConfig {
            anthropic: limits(anthropic_key),
            openai: limits(openai_key),
            enforced_fraction: 0.7,
            request_limit: 1_000,
            cooldown_secs: 60,
            max_concurrent: 5,
            fallback_threshold: 0.7,
            warning_threshold: 80.0,
            critical_threshold: 95.0,
            min_daily_fraction: 0.02,
            reachability: ReachabilityMode::Credential,
            probe_ttl_secs: 30,
            probe_timeout_ms: 1_000,
            call_timeout_secs: 120,
        }
    }

    struct CountingProbe {
        calls: AtomicUsize,
        answer: bool,
    }

    #[async_trait]
    impl ReachabilityProbe for CountingProbe {
        async fn is_reachable(&self, _provider: Provider) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    #[tokio::test]
    async fn test_credential_probe_reflects_configured_keys() {
        let probe = CredentialProbe::new(&config(Some("sk-ant"), None));
        assert!(probe.is_reachable(Provider::Anthropic).await);
        assert!(!probe.is_reachable(Provider::OpenAI).await);
    }

    #[tokio::test]
    async fn test_cached_probe_reuses_fresh_answer() {
        let probe = CachedProbe::new(
            CountingProbe {
                calls: AtomicUsize::new(0),
                answer: true,
            },
            Duration::from_secs(60),
        );

        assert!(probe.is_reachable(Provider::Anthropic).await);
        assert!(probe.is_reachable(Provider::Anthropic).await);
        assert!(probe.is_reachable(Provider::Anthropic).await);
        assert_eq!(probe.inner.calls.load(Ordering::SeqCst), 1);

        // The other provider is cached separately.
        assert!(probe.is_reachable(Provider::OpenAI).await);
        assert_eq!(probe.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cached_probe_refetches_after_ttl() {
        let probe = CachedProbe::new(
            CountingProbe {
                calls: AtomicUsize::new(0),
                answer: false,
            },
            Duration::from_secs(0),
        );
        probe.is_reachable(Provider::Anthropic).await;
        probe.is_reachable(Provider::Anthropic).await;
        assert_eq!(probe.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_probe_for_honours_mode() {
        let cfg = config(Some("k"), Some("k"));
        // Credential mode: no network probe is ever constructed.
        let probe = probe_for(&cfg);
        drop(probe);

        let mut http_cfg = config(None, None);
        http_cfg.reachability = ReachabilityMode::Http;
        let probe = probe_for(&http_cfg);
        drop(probe);
    }
}
