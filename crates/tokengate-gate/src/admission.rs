//! The admission gate.
//!
//! Every outbound call passes through [`AdmissionController::admit`]
//! before any network I/O. Usage sums are fetched first, outside the
//! lock; the pacing and concurrency checks plus the ceiling comparisons
//! then run inside one short critical section, so two racing calls can
//! never both slip under a cooldown or a concurrency slot. No await is
//! ever held across the lock.
//!
//! Admission hands out an [`AdmissionPermit`]: an RAII guard whose drop
//! releases the concurrency slot exactly once, including when the call
//! future is cancelled mid-flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokengate_core::{month_key, AgentId, DenialReason, GateConfig, Provider, UsageStore};
use tracing::{debug, info, warn};

use crate::windows::RateWindowTracker;

struct GateState {
    in_flight: u32,
    last_request: HashMap<AgentId, Instant>,
}

/// Outcome of an admission check.
pub enum AdmissionDecision {
    /// The call may proceed; the permit holds its concurrency slot.
    Admitted(AdmissionPermit),
    /// The call was refused.
    Denied(DenialReason),
}

impl AdmissionDecision {
    /// Whether the call was admitted.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }
}

/// RAII concurrency slot. Dropping it releases the slot.
pub struct AdmissionPermit {
    state: Arc<Mutex<GateState>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// The single admission decision point shared by all agents.
pub struct AdmissionController {
    config: GateConfig,
    store: Arc<dyn UsageStore>,
    windows: Arc<RateWindowTracker>,
    state: Arc<Mutex<GateState>>,
}

impl AdmissionController {
    /// Create a controller over the given store and window tracker.
    pub fn new(
        config: GateConfig,
        store: Arc<dyn UsageStore>,
        windows: Arc<RateWindowTracker>,
    ) -> Self {
        Self {
            config,
            store,
            windows,
            state: Arc::new(Mutex::new(GateState {
                in_flight: 0,
                last_request: HashMap::new(),
            })),
        }
    }

    /// Decide whether a call may proceed against a provider.
    ///
    /// Infallible by design: a store that cannot be read is logged and
    /// treated as zero usage rather than blocking every call behind a
    /// storage outage.
    pub async fn admit(
        &self,
        agent: &AgentId,
        provider: Provider,
        estimated_tokens: u64,
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        // All storage reads happen before the lock is taken. Fetching
        // ahead of the cooldown check is unobservable: reads deny nothing.
        let global_usage = self.global_usage(provider, now).await;
        let daily_usage = self.windows.daily_usage(provider, now).await;
        let hourly_usage = self.windows.hourly_usage(provider, now).await;

        self.nudge_month_end_floor(provider, daily_usage, now);

        let mut state = lock_state(&self.state);

        // Check order is fixed: cooldown, concurrency, request size,
        // hourly, daily, monthly. Short-circuits on the first failure.
        if let Some(last) = state.last_request.get(agent) {
            let cooldown = Duration::from_secs(self.config.cooldown_secs);
            let elapsed = last.elapsed();
            if elapsed < cooldown {
                let remaining_secs = (cooldown - elapsed).as_secs().max(1);
                drop(state);
                return self.deny(agent, provider, DenialReason::Cooldown { remaining_secs });
            }
        }

        if state.in_flight >= self.config.max_concurrent {
            let active = state.in_flight;
            drop(state);
            return self.deny(
                agent,
                provider,
                DenialReason::TooManyConcurrent {
                    active,
                    max: self.config.max_concurrent,
                },
            );
        }

        if estimated_tokens > self.config.request_limit {
            drop(state);
            return self.deny(
                agent,
                provider,
                DenialReason::RequestTooLarge {
                    estimated_tokens,
                    request_limit: self.config.request_limit,
                },
            );
        }

        if let Some(reason) =
            self.ceiling_check(provider, estimated_tokens, global_usage, daily_usage, hourly_usage)
        {
            drop(state);
            return self.deny(agent, provider, reason);
        }

        state.in_flight += 1;
        state.last_request.insert(agent.clone(), Instant::now());
        let in_flight = state.in_flight;
        drop(state);

        debug!(%agent, %provider, estimated_tokens, in_flight, "Call admitted");
        AdmissionDecision::Admitted(AdmissionPermit {
            state: Arc::clone(&self.state),
        })
    }

    /// Read-only preview of the ceiling checks, for provider selection.
    ///
    /// Ignores pacing and concurrency (those are per-moment, not
    /// per-provider) and never mutates gate state.
    pub async fn peek(
        &self,
        provider: Provider,
        estimated_tokens: u64,
        now: DateTime<Utc>,
    ) -> Option<DenialReason> {
        if estimated_tokens > self.config.request_limit {
            return Some(DenialReason::RequestTooLarge {
                estimated_tokens,
                request_limit: self.config.request_limit,
            });
        }
        let global_usage = self.global_usage(provider, now).await;
        let daily_usage = self.windows.daily_usage(provider, now).await;
        let hourly_usage = self.windows.hourly_usage(provider, now).await;
        self.ceiling_check(provider, estimated_tokens, global_usage, daily_usage, hourly_usage)
    }

    /// Number of admitted-but-not-yet-completed calls.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        lock_state(&self.state).in_flight
    }

    fn ceiling_check(
        &self,
        provider: Provider,
        estimated_tokens: u64,
        global_usage: u64,
        daily_usage: u64,
        hourly_usage: u64,
    ) -> Option<DenialReason> {
        let hourly_limit = self.config.hourly_limit(provider);
        if hourly_usage + estimated_tokens > hourly_limit {
            return Some(DenialReason::HourlyExceeded {
                hourly_usage,
                hourly_limit,
                estimated_tokens,
            });
        }

        let daily_limit = self.config.daily_limit(provider);
        if daily_usage + estimated_tokens > daily_limit {
            return Some(DenialReason::DailyExceeded {
                daily_usage,
                daily_limit,
                estimated_tokens,
            });
        }

        let enforced_limit = self.config.enforced_monthly_limit(provider);
        if global_usage + estimated_tokens > enforced_limit {
            return Some(DenialReason::MonthlyExceeded {
                global_usage,
                enforced_limit,
                estimated_tokens,
            });
        }

        None
    }

    async fn global_usage(&self, provider: Provider, now: DateTime<Utc>) -> u64 {
        match self
            .store
            .global_monthly_total(provider, &month_key(now))
            .await
        {
            Ok(total) => total,
            Err(e) => {
                // Fail open rather than hard-stopping every agent.
                warn!(%provider, error = %e, "Monthly usage unavailable, assuming zero");
                0
            }
        }
    }

    /// Near month-end, unspent daily budget is about to expire. This is a
    /// nudge in the logs only; it never loosens or overrides a ceiling.
    fn nudge_month_end_floor(&self, provider: Provider, daily_usage: u64, now: DateTime<Utc>) {
        if !self.config.in_month_end_window(now) {
            return;
        }
        let floor = (self.config.enforced_monthly_limit(provider) as f64
            * self.config.min_daily_fraction) as u64;
        if daily_usage < floor {
            info!(
                %provider,
                daily_usage,
                floor,
                "Daily usage below the month-end floor; budget will expire unspent"
            );
        }
    }

    fn deny(
        &self,
        agent: &AgentId,
        provider: Provider,
        reason: DenialReason,
    ) -> AdmissionDecision {
        warn!(%agent, %provider, code = reason.code(), %reason, "Call denied");
        AdmissionDecision::Denied(reason)
    }
}

fn lock_state(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
