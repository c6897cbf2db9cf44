//! Admission control and usage accounting for outbound completion calls.
//!
//! Multiple agents share two completion providers behind fixed token
//! budgets. Every outbound call passes through one gate that enforces
//! monthly, daily, and hourly ceilings, per-agent pacing, and a global
//! concurrency cap, then picks a provider (with one fallback hop) and
//! records what was actually spent.
//!
//! The pieces, bottom up:
//!
//! - [`RateWindowTracker`] — log-derived daily/hourly usage sums with a
//!   short-lived memo.
//! - [`AdmissionController`] — the single decision point; hands out RAII
//!   [`AdmissionPermit`]s that release the concurrency slot on drop.
//! - [`UsageLedger`] — records every attempt (success or failure) and
//!   serves derived usage snapshots.
//! - [`ProviderSelector`] — reachability- and headroom-aware provider
//!   choice.
//! - [`TokenGate`] — the one call path tying the above together.

pub mod admission;
pub mod call;
pub mod client;
pub mod config;
pub mod estimate;
pub mod ledger;
pub mod reachability;
pub mod selector;
pub mod windows;

pub use admission::{AdmissionController, AdmissionDecision, AdmissionPermit};
pub use call::{CallOutcome, CallRequest, TokenGate};
pub use client::{AnthropicClient, OpenAiClient};
pub use config::{load_config, parse_config};
pub use estimate::estimate_tokens;
pub use ledger::{ProviderUsageSummary, RecordAck, UsageLedger};
pub use reachability::{probe_for, CachedProbe, CredentialProbe, HttpProbe, ReachabilityProbe};
pub use selector::{ProviderSelector, Selection};
pub use windows::RateWindowTracker;
