//! Watermark configuration supplied by the owning session.
//!
//! The three thresholds drive the bidirectional backpressure tiers: the high
//! mark raises advisory pause, the cutoff is the hard safety valve, and the
//! low mark relieves pause once the consumer catches up.

use std::num::NonZeroUsize;

/// Buffer thresholds and the outbound chunk size for every pipe of a session.
#[derive(Clone, Copy, Debug)]
pub struct WatermarkConfig {
    low_water_mark: usize,
    high_water_mark: usize,
    high_water_cutoff: usize,
    flush_chunk_size: NonZeroUsize,
}

impl WatermarkConfig {
    /// Build a configuration, enforcing
    /// `low_water_mark < high_water_mark < high_water_cutoff`.
    ///
    /// Returns `None` when the ordering does not hold.
    #[must_use]
    pub fn new(
        low_water_mark: usize,
        high_water_mark: usize,
        high_water_cutoff: usize,
        flush_chunk_size: NonZeroUsize,
    ) -> Option<Self> {
        if low_water_mark >= high_water_mark || high_water_mark >= high_water_cutoff {
            return None;
        }
        Some(Self {
            low_water_mark,
            high_water_mark,
            high_water_cutoff,
            flush_chunk_size,
        })
    }

    /// Buffered length at or below which pause is relieved.
    #[must_use]
    pub const fn low_water_mark(&self) -> usize { self.low_water_mark }

    /// Buffered length at which the reader raises pause.
    #[must_use]
    pub const fn high_water_mark(&self) -> usize { self.high_water_mark }

    /// Buffered length at which further inbound data is rejected outright.
    #[must_use]
    pub const fn high_water_cutoff(&self) -> usize { self.high_water_cutoff }

    /// Largest payload a single outbound data message may carry.
    #[must_use]
    pub const fn flush_chunk_size(&self) -> NonZeroUsize { self.flush_chunk_size }
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            low_water_mark: 16 * 1024,
            high_water_mark: 64 * 1024,
            high_water_cutoff: 1024 * 1024,
            flush_chunk_size: NonZeroUsize::new(16 * 1024).expect("chunk size is non-zero"),
        }
    }
}
