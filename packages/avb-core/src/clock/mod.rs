//! Clock-domain abstraction: the shared timebase consumed by TX
//! sequencers, RX stream dispatch and the ALSA worker. A clock domain
//! tracks a monotonically increasing event count against gPTP wallclock
//! and filters an instantaneous rate ratio with an EMA, reporting lock
//! state and optionally driving a PLL for hardware clock recovery.

mod hwcapture;

pub use hwcapture::HwCaptureWorker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Unique identifier for a clock domain (matches the `clock_id`/`driver_id`
/// values used by the control API and configuration).
pub type ClockId = u32;

/// Well-known clock domain kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    /// gPTP wallclock, never filtered (ratio is always exactly 1.0).
    Ptp,
    /// Driven by SDP pin edge timestamps via a dedicated polling worker.
    HwCapture,
    /// Derived from a received CRF or audio stream's timestamps.
    RxStream,
    /// Raw free-running local oscillator, no external reference.
    Raw,
}

/// Lock state reported to the event listener when it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
}

/// Filter tuning parameters; defaults chosen so the EMA settles in about one
/// second at a 48kHz polling rate.
#[derive(Debug, Clone, Copy)]
pub struct ClockFilterConfig {
    /// EMA time constant, expressed as a smoothing factor in `(0, 1]`
    /// applied per `advance()` call (higher = faster response).
    pub alpha: f64,
    /// Ratio deviation below which consecutive updates count toward lock.
    pub lock_threshold_1: f64,
    /// Consecutive updates within `lock_threshold_1` required to lock.
    pub lock_threshold_2: u32,
    /// Multiplier on `lock_threshold_1` beyond which lock is cleared.
    pub unlock_factor: f64,
}

impl Default for ClockFilterConfig {
    fn default() -> Self {
        Self {
            alpha: 0.02,
            lock_threshold_1: 0.0001,
            lock_threshold_2: 50,
            unlock_factor: 10.0,
        }
    }
}

/// Receives relative rate-ratio updates so hardware oscillator tuning can
/// track a master clock. Implementations must be non-blocking (no
/// synchronous I/O); this is called from the clock domain's hot update path.
pub trait PllDriver: Send + Sync {
    /// Reports a fresh ratio close to 1.0 for the named driver instance.
    fn update_relative(&self, driver_id: u32, ratio: f64);
}

struct Filter {
    rate_ratio: f64,
    consecutive_within_threshold: u32,
}

/// A clock domain: event-count timeline plus rate-ratio estimator.
pub struct ClockDomain {
    id: ClockId,
    kind: ClockKind,
    config: ClockFilterConfig,
    events: AtomicU64,
    last_event_time_ns: AtomicU64,
    locked: AtomicBool,
    filter: RwLock<Filter>,
    recovery_sink: RwLock<Option<(u32, Arc<dyn PllDriver>)>>,
}

impl ClockDomain {
    /// Creates a new clock domain anchored at `start_time_ns`.
    #[must_use]
    pub fn new(id: ClockId, kind: ClockKind, start_time_ns: u64) -> Self {
        Self::with_config(id, kind, start_time_ns, ClockFilterConfig::default())
    }

    #[must_use]
    pub fn with_config(
        id: ClockId,
        kind: ClockKind,
        start_time_ns: u64,
        config: ClockFilterConfig,
    ) -> Self {
        Self {
            id,
            kind,
            config,
            events: AtomicU64::new(0),
            last_event_time_ns: AtomicU64::new(start_time_ns),
            locked: AtomicBool::new(kind == ClockKind::Ptp),
            filter: RwLock::new(Filter {
                rate_ratio: 1.0,
                consecutive_within_threshold: 0,
            }),
            recovery_sink: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> ClockId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> ClockKind {
        self.kind
    }

    #[must_use]
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn rate_ratio(&self) -> f64 {
        self.filter.read().rate_ratio
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Registers the PLL driver that should receive relative-ratio updates
    /// from this domain's filter.
    pub fn register_recovery_sink(&self, driver_id: u32, sink: Arc<dyn PllDriver>) {
        *self.recovery_sink.write() = Some((driver_id, sink));
    }

    /// Advances the domain by `event_count_delta` nominal events observed at
    /// wallclock `wallclock_ns`, recomputing the filtered rate ratio and
    /// lock state. `nominal_period_ns` is the expected wallclock time per
    /// event at ratio 1.0 (e.g. `1e9 / sample_rate` for an audio clock).
    ///
    /// Returns the lock-state transition, if any, so the caller can notify
    /// an event listener (lock transitions are reported as events, not
    /// surfaced through the `Result` error path).
    pub fn advance(
        &self,
        event_count_delta: u64,
        wallclock_ns: u64,
        nominal_period_ns: f64,
    ) -> Option<LockState> {
        if event_count_delta == 0 {
            return None;
        }
        self.events.fetch_add(event_count_delta, Ordering::AcqRel);
        let prev_time = self.last_event_time_ns.swap(wallclock_ns, Ordering::AcqRel);
        let elapsed = wallclock_ns.saturating_sub(prev_time);
        if elapsed == 0 || nominal_period_ns <= 0.0 {
            return None;
        }

        let nominal_elapsed = event_count_delta as f64 * nominal_period_ns;
        let instantaneous_ratio = nominal_elapsed / elapsed as f64;

        let mut filter = self.filter.write();
        filter.rate_ratio += self.config.alpha * (instantaneous_ratio - filter.rate_ratio);
        let ratio = filter.rate_ratio;

        let deviation = (instantaneous_ratio - ratio).abs();
        let was_locked = self.locked.load(Ordering::Acquire);
        let mut transition = None;

        if deviation < self.config.lock_threshold_1 {
            filter.consecutive_within_threshold =
                filter.consecutive_within_threshold.saturating_add(1);
            if !was_locked && filter.consecutive_within_threshold >= self.config.lock_threshold_2 {
                self.locked.store(true, Ordering::Release);
                transition = Some(LockState::Locked);
            }
        } else {
            filter.consecutive_within_threshold = 0;
            if was_locked && deviation > self.config.lock_threshold_1 * self.config.unlock_factor {
                self.locked.store(false, Ordering::Release);
                transition = Some(LockState::Unlocked);
            }
        }
        drop(filter);

        if let Some((driver_id, sink)) = self.recovery_sink.read().as_ref() {
            sink.update_relative(*driver_id, ratio);
        }

        transition
    }

    /// Extrapolates the current media-tick position given `wallclock_ns`,
    /// using the filtered rate ratio.
    #[must_use]
    pub fn now_in_media_ticks(&self, wallclock_ns: u64, nominal_period_ns: f64) -> u64 {
        let last_time = self.last_event_time_ns.load(Ordering::Acquire);
        let events = self.events.load(Ordering::Acquire);
        if nominal_period_ns <= 0.0 {
            return events;
        }
        let elapsed = wallclock_ns.saturating_sub(last_time) as f64;
        let ratio = self.rate_ratio();
        let extra_events = (elapsed / nominal_period_ns) * ratio;
        events + extra_events as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        last: parking_lot::Mutex<Option<f64>>,
    }

    impl PllDriver for RecordingSink {
        fn update_relative(&self, _driver_id: u32, ratio: f64) {
            *self.last.lock() = Some(ratio);
        }
    }

    #[test]
    fn events_are_monotonically_non_decreasing() {
        let dom = ClockDomain::new(1, ClockKind::RxStream, 0);
        let nominal = 1e9 / 48_000.0;
        let mut t = 0u64;
        let mut last = 0u64;
        for _ in 0..100 {
            t += nominal as u64;
            dom.advance(1, t, nominal);
            let now = dom.events();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn rate_ratio_converges_near_one_for_nominal_input() {
        let dom = ClockDomain::new(1, ClockKind::RxStream, 0);
        let nominal = 1e9 / 48_000.0;
        let mut t = 0u64;
        for _ in 0..2000 {
            t += nominal as u64;
            dom.advance(1, t, nominal);
        }
        assert!((dom.rate_ratio() - 1.0).abs() < 0.02);
    }

    #[test]
    fn locks_after_consecutive_in_threshold_updates() {
        let cfg = ClockFilterConfig {
            lock_threshold_2: 5,
            ..Default::default()
        };
        let dom = ClockDomain::with_config(1, ClockKind::RxStream, 0, cfg);
        let nominal = 1e9 / 48_000.0;
        let mut t = 0u64;
        let mut saw_lock = false;
        for _ in 0..50 {
            t += nominal as u64;
            if let Some(LockState::Locked) = dom.advance(1, t, nominal) {
                saw_lock = true;
            }
        }
        assert!(saw_lock);
        assert!(dom.is_locked());
    }

    #[test]
    fn offset_clock_drives_pll_with_ratio_above_one() {
        let dom = ClockDomain::new(1, ClockKind::RxStream, 0);
        let sink = Arc::new(RecordingSink {
            last: parking_lot::Mutex::new(None),
        });
        dom.register_recovery_sink(0x8086_4711, sink.clone());
        // +100ppm offset: actual wallclock advances slower than nominal.
        let nominal = 1e9 / 48_000.0;
        let actual = nominal / 1.0001;
        let mut t = 0u64;
        for _ in 0..500 {
            t += actual as u64;
            dom.advance(1, t, nominal);
        }
        let ratio = sink.last.lock().unwrap();
        assert!(ratio > 1.00005, "ratio {ratio} should reflect +100ppm offset");
    }

    #[test]
    fn ptp_domain_starts_locked() {
        let dom = ClockDomain::new(0, ClockKind::Ptp, 0);
        assert!(dom.is_locked());
    }
}
