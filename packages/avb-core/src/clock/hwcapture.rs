//! Hardware-capture clock worker: latches one of the NIC's auxiliary
//! timestamp registers on SDP pin edges and feeds the edge period into the
//! owning [`super::ClockDomain`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::gptp::GptpClock;

use super::ClockDomain;

/// Reads the latched capture timestamp for one auxiliary register. The NIC
/// driver implements this; a software double is used in tests.
pub trait CaptureRegister: Send + Sync {
    /// Returns the latest latched timestamp in nanoseconds, if a new edge
    /// has been captured since the last call.
    fn poll_latch(&self) -> Option<u64>;
}

/// Dedicated worker that polls a [`CaptureRegister`] at ≥2.5x the nominal
/// event rate (Shannon-with-margin) and advances a [`ClockDomain`] on every
/// edge, splitting the delta across any missed edges by rounding to the
/// nearest integer number of periods.
pub struct HwCaptureWorker {
    domain: Arc<ClockDomain>,
    register: Arc<dyn CaptureRegister>,
    nominal_period_ns: f64,
    shutdown: Arc<AtomicBool>,
}

impl HwCaptureWorker {
    /// `nominal_freq_mhz` is the nominal clock frequency in milli-Hertz, per
    /// the `clock.hwcapture.nominal` registry key's documented unit.
    #[must_use]
    pub fn new(
        domain: Arc<ClockDomain>,
        register: Arc<dyn CaptureRegister>,
        nominal_freq_mhz: u64,
    ) -> Self {
        let nominal_period_ns = 1.0e12 / nominal_freq_mhz as f64;
        Self {
            domain,
            register,
            nominal_period_ns,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle to cooperatively stop the worker's polling loop.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Runs the polling loop until the shutdown flag is set. Blocking;
    /// intended to be spawned on its own OS thread at elevated priority.
    pub fn run(&self, gptp: &dyn GptpClock) {
        let poll_interval = Duration::from_nanos((self.nominal_period_ns / 2.5) as u64);
        let mut last_edge_time: Option<u64> = None;
        while !self.shutdown.load(Ordering::Relaxed) {
            if let Some(edge_ns) = self.register.poll_latch() {
                if let Some(prev) = last_edge_time {
                    self.handle_edge(prev, edge_ns);
                }
                last_edge_time = Some(edge_ns);
            }
            let _ = gptp.local_time();
            std::thread::sleep(poll_interval);
        }
    }

    /// Processes one observed edge-to-edge interval, splitting it across
    /// however many nominal periods best explain the elapsed time (handles
    /// a missed edge by rounding to the nearest integer period count).
    fn handle_edge(&self, prev_edge_ns: u64, edge_ns: u64) {
        let elapsed = edge_ns.saturating_sub(prev_edge_ns) as f64;
        if elapsed <= 0.0 {
            return;
        }
        let periods = (elapsed / self.nominal_period_ns).round().max(1.0) as u64;
        self.domain.advance(periods, edge_ns, self.nominal_period_ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockKind;

    struct FixedEdges {
        edges: parking_lot::Mutex<std::collections::VecDeque<u64>>,
    }

    impl CaptureRegister for FixedEdges {
        fn poll_latch(&self) -> Option<u64> {
            self.edges.lock().pop_front()
        }
    }

    #[test]
    fn single_missed_edge_is_split_into_two_nominal_periods() {
        let domain = Arc::new(ClockDomain::new(2, ClockKind::HwCapture, 0));
        let register = Arc::new(FixedEdges {
            edges: parking_lot::Mutex::new(std::collections::VecDeque::new()),
        });
        let nominal_freq_mhz = 93_750_000; // 93750 Hz in mHz per registry docs
        let worker = HwCaptureWorker::new(domain.clone(), register, nominal_freq_mhz);

        let period_ns = worker.nominal_period_ns;
        // two periods elapsed with one missed edge in between
        worker.handle_edge(0, (period_ns * 2.0) as u64);
        assert_eq!(domain.events(), 2);
    }

    #[test]
    fn normal_edge_advances_by_one_period() {
        let domain = Arc::new(ClockDomain::new(2, ClockKind::HwCapture, 0));
        let register = Arc::new(FixedEdges {
            edges: parking_lot::Mutex::new(std::collections::VecDeque::new()),
        });
        let worker = HwCaptureWorker::new(domain.clone(), register, 93_750_000);
        let period_ns = worker.nominal_period_ns;
        worker.handle_edge(0, period_ns as u64);
        assert_eq!(domain.events(), 1);
    }
}
