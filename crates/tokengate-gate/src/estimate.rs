//! Pre-call token estimation.
//!
//! Admission decisions happen before the provider reports real counts, so
//! the gate works from a deliberately pessimistic estimate: prompt words
//! scaled by 1.3 plus the full `max_tokens` completion budget. Actual
//! accounting later replaces the estimate with provider-reported counts
//! when available.

/// Estimate the worst-case token cost of a completion call.
#[must_use]
pub fn estimate_tokens(prompt: &str, max_tokens: u32) -> u64 {
    let words = prompt.split_whitespace().count();
    (words as f64 * 1.3).ceil() as u64 + u64::from(max_tokens)
}
