//! Process tick clock. Every timer in the engine (QoS timeslices, retry
//! delays, reconnect backoff, loss timeouts) is expressed in ticks computed
//! once from the tick rate, never in wall-clock time sampled ad hoc.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// Tick rate used by the monotonic source: one tick per microsecond.
const SYSTEM_TICKS_HZ: u64 = 1_000_000;

/// A source of monotonic ticks. The manual variant is driven explicitly,
/// which keeps timer behavior deterministic under test.
#[derive(Debug)]
pub enum TickSource {
    System { origin: Instant },
    Manual { now: AtomicU64, hz: u64 },
}

impl TickSource {
    pub fn system() -> Self {
        TickSource::System {
            origin: Instant::now(),
        }
    }

    /// A manually advanced source with the given tick rate.
    pub fn manual(hz: u64) -> Self {
        assert!(hz > 0, "tick rate must be non-zero");
        TickSource::Manual {
            now: AtomicU64::new(0),
            hz,
        }
    }

    /// Current tick count.
    pub fn ticks(&self) -> u64 {
        match self {
            TickSource::System {
                origin,
            } => origin.elapsed().as_micros() as u64,
            TickSource::Manual {
                now, ..
            } => now.load(Ordering::Relaxed),
        }
    }

    /// Ticks per second.
    pub fn ticks_hz(&self) -> u64 {
        match self {
            TickSource::System {
                ..
            } => SYSTEM_TICKS_HZ,
            TickSource::Manual {
                hz, ..
            } => *hz,
        }
    }

    /// Advance a manual source. No effect on the system source.
    pub fn advance(&self, ticks: u64) {
        if let TickSource::Manual {
            now, ..
        } = self
        {
            now.fetch_add(ticks, Ordering::Relaxed);
        }
    }

    /// Convert microseconds into ticks at this source's rate.
    pub fn us_to_ticks(&self, us: u64) -> u64 {
        let hz = self.ticks_hz();
        // Split to avoid overflow for large intervals.
        (us / 1_000_000) * hz + (us % 1_000_000) * hz / 1_000_000
    }

    /// Convert milliseconds into ticks at this source's rate.
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        self.us_to_ticks(ms * 1_000)
    }

    /// Convert whole seconds into ticks at this source's rate.
    pub fn sec_to_ticks(&self, sec: u64) -> u64 {
        sec * self.ticks_hz()
    }
}

#[cfg(test)]
mod tests {
    use super::TickSource;

    #[test]
    fn manual_source_advances_only_on_demand() {
        let clk = TickSource::manual(1_000);
        assert_eq!(clk.ticks(), 0);
        clk.advance(5);
        assert_eq!(clk.ticks(), 5);
        assert_eq!(clk.ms_to_ticks(1), 1);
        assert_eq!(clk.sec_to_ticks(2), 2_000);
    }

    #[test]
    fn us_conversion_does_not_overflow() {
        let clk = TickSource::manual(2_400_000_000);
        assert_eq!(clk.us_to_ticks(1_000_000), 2_400_000_000);
        assert_eq!(clk.us_to_ticks(3_500_000), 8_400_000_000);
    }
}
