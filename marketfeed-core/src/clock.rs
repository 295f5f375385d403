//! Clock sources with explicit domain separation
//!
//! Two independent domains are exposed and never mixed in one computation:
//! wall-clock epoch milliseconds (comparable with exchange timestamps) and a
//! monotonic nanosecond counter (for internal stage latencies and rolling
//! window bookkeeping).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync {
    /// Wall-clock time in epoch milliseconds.
    fn now_epoch_ms(&self) -> i64;

    /// Monotonic time in nanoseconds. Non-decreasing across calls.
    fn now_mono_ns(&self) -> u64;

    /// Monotonic time in milliseconds.
    fn now_mono_ms(&self) -> u64 {
        self.now_mono_ns() / 1_000_000
    }
}

/// Process-wide origin so every `SystemClock` shares one monotonic domain.
fn mono_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        // Pin the origin early so the first reading is not an outlier.
        let _ = mono_origin();
        Self
    }
}

impl Clock for SystemClock {
    fn now_epoch_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn now_mono_ns(&self) -> u64 {
        mono_origin().elapsed().as_nanos() as u64
    }
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    epoch_ms: AtomicI64,
    mono_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(epoch_ms: i64, mono_ns: u64) -> Self {
        Self {
            epoch_ms: AtomicI64::new(epoch_ms),
            mono_ns: AtomicU64::new(mono_ns),
        }
    }

    /// Advance both domains by the same amount of milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.epoch_ms.fetch_add(ms as i64, Ordering::SeqCst);
        self.mono_ns.fetch_add(ms * 1_000_000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_ms(&self) -> i64 {
        self.epoch_ms.load(Ordering::SeqCst)
    }

    fn now_mono_ns(&self) -> u64 {
        self.mono_ns.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic_is_non_decreasing() {
        let clock = SystemClock::new();
        let mut last = clock.now_mono_ns();
        for _ in 0..1000 {
            let now = clock.now_mono_ns();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_system_clock_wall_is_epoch_ms() {
        let clock = SystemClock::new();
        // 2020-01-01 in epoch ms; anything earlier means the unit is wrong.
        assert!(clock.now_epoch_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000, 5_000_000);
        clock.advance_ms(250);
        assert_eq!(clock.now_epoch_ms(), 1_250);
        assert_eq!(clock.now_mono_ns(), 255_000_000);
        assert_eq!(clock.now_mono_ms(), 255);
    }
}
