//! Metric helpers for `wirepipe`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled every helper is a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking pipes currently rented or registered.
pub const PIPES_ACTIVE: &str = "wirepipe_pipes_active";
/// Name of the counter tracking outbound data chunks.
pub const CHUNKS_SENT: &str = "wirepipe_chunks_sent_total";
/// Name of the counter tracking messages dropped for stale or unknown ids.
pub const STALE_DROPS: &str = "wirepipe_stale_drops_total";

/// Increment the active pipes gauge.
#[cfg(feature = "metrics")]
pub fn inc_pipes() { gauge!(PIPES_ACTIVE).increment(1.0); }

/// Decrement the active pipes gauge.
#[cfg(feature = "metrics")]
pub fn dec_pipes() { gauge!(PIPES_ACTIVE).decrement(1.0); }

/// Record one outbound data chunk.
#[cfg(feature = "metrics")]
pub fn inc_chunks_sent() { counter!(CHUNKS_SENT).increment(1); }

/// Record a message dropped because its pipe id was unknown or recycled.
#[cfg(feature = "metrics")]
pub fn inc_stale_drops() { counter!(STALE_DROPS).increment(1); }

#[cfg(not(feature = "metrics"))]
pub fn inc_pipes() {}
#[cfg(not(feature = "metrics"))]
pub fn dec_pipes() {}
#[cfg(not(feature = "metrics"))]
pub fn inc_chunks_sent() {}
#[cfg(not(feature = "metrics"))]
pub fn inc_stale_drops() {}
