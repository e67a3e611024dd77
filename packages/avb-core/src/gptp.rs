//! gPTP proxy contract: the shared wallclock every clock domain and
//! sequencer times against.

/// Abstraction over the host's gPTP daemon/driver.
pub trait GptpClock: Send + Sync {
    /// Current gPTP wallclock time, in nanoseconds since an
    /// implementation-defined epoch (stable for the lifetime of the
    /// process).
    fn local_time(&self) -> u64;

    /// Cross-timestamps a system clock reading against the gPTP clock,
    /// returning the corresponding gPTP time. Used by HwCapture and ALSA
    /// cross-stamping.
    fn cross_stamp(&self, sys_time_ns: u64, ptp_time_ns: u64) -> u64;
}

/// `CLOCK_MONOTONIC`-backed [`GptpClock`] for hosts without a dedicated gPTP
/// daemon wired in yet. A real deployment should instead cross-stamp against
/// the NIC's PTP hardware clock (`/dev/ptp0`) the way a gPTP daemon's shared
/// memory segment does; until that integration lands this gives
/// `avb-server` a clock that is monotonic and good enough to exercise the
/// rest of the pipeline, at the cost of drifting from any other node's
/// notion of gPTP time.
#[cfg(target_os = "linux")]
pub struct MonotonicClock;

#[cfg(target_os = "linux")]
impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl GptpClock for MonotonicClock {
    fn local_time(&self) -> u64 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: `ts` is a valid out-pointer for `clock_gettime`.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }

    fn cross_stamp(&self, _sys_time_ns: u64, ptp_time_ns: u64) -> u64 {
        ptp_time_ns
    }
}

#[cfg(test)]
pub mod testutil {
    use super::GptpClock;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Software gPTP double backed by a manually-advanced counter, so tests
    /// are deterministic and do not depend on wall-clock time.
    #[derive(Default)]
    pub struct SoftwarePtp {
        now_ns: AtomicU64,
    }

    impl SoftwarePtp {
        #[must_use]
        pub fn new(start_ns: u64) -> Self {
            Self {
                now_ns: AtomicU64::new(start_ns),
            }
        }

        pub fn advance(&self, delta_ns: u64) {
            self.now_ns.fetch_add(delta_ns, Ordering::SeqCst);
        }

        pub fn set(&self, ns: u64) {
            self.now_ns.store(ns, Ordering::SeqCst);
        }
    }

    impl GptpClock for SoftwarePtp {
        fn local_time(&self) -> u64 {
            self.now_ns.load(Ordering::SeqCst)
        }

        fn cross_stamp(&self, _sys_time_ns: u64, ptp_time_ns: u64) -> u64 {
            ptp_time_ns
        }
    }
}
