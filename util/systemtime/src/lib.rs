//! Wall-clock access for the orchestrator core.
//!
//! Every component reads "now" through [`unix_time_as_millis`] rather than
//! `SystemTime::now()` directly, so tests that exercise time-dependent logic
//! (breaker cooldowns, admission staleness, health check intervals) can pin
//! the clock with the `enable_faketime` feature instead of sleeping in real
//! time.

mod test_faketime;
mod test_realtime;

use std::time::{SystemTime, UNIX_EPOCH};

/// Real wall-clock time in milliseconds since the Unix epoch. Never affected
/// by faketime; used as a baseline to assert faketime actually diverges from
/// reality in tests.
pub fn system_time_as_millis() -> u64 {
    let now = SystemTime::now();
    now.duration_since(UNIX_EPOCH)
        .expect("system time is before the Unix epoch")
        .as_millis() as u64
}

#[cfg(not(feature = "enable_faketime"))]
pub fn unix_time_as_millis() -> u64 {
    system_time_as_millis()
}

#[cfg(feature = "enable_faketime")]
mod faketime_impl {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    static FAKETIME_ENABLED: AtomicBool = AtomicBool::new(false);
    static FAKETIME_MILLIS: AtomicU64 = AtomicU64::new(0);

    pub fn unix_time_as_millis() -> u64 {
        if FAKETIME_ENABLED.load(Ordering::Acquire) {
            FAKETIME_MILLIS.load(Ordering::Acquire)
        } else {
            super::system_time_as_millis()
        }
    }

    /// Guard controlling the process-wide faketime clock. Disables faketime
    /// when dropped, so a test that panics mid-way never leaks a frozen clock
    /// into the next test in the same process.
    pub struct FaketimeGuard;

    impl FaketimeGuard {
        pub fn set_faketime(&self, millis: u64) {
            FAKETIME_MILLIS.store(millis, Ordering::Release);
            FAKETIME_ENABLED.store(true, Ordering::Release);
        }

        pub fn disable_faketime(&self) {
            FAKETIME_ENABLED.store(false, Ordering::Release);
        }
    }

    impl Drop for FaketimeGuard {
        fn drop(&mut self) {
            self.disable_faketime();
        }
    }

    pub fn faketime() -> FaketimeGuard {
        FaketimeGuard
    }
}

#[cfg(feature = "enable_faketime")]
pub use faketime_impl::{faketime, unix_time_as_millis};
