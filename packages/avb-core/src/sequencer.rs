//! TX sequencer: the engine's centerpiece. One dedicated OS thread per
//! Stream Reservation class multiplexes every active TX stream on that
//! class's NIC queue into a single launch-time-ordered packet stream,
//! programs the 802.1Qav credit-based shaper, and reclaims DMA descriptors.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::gptp::GptpClock;
use crate::nic::{LaunchPacket, NicDriver, QueueIndex};
use crate::packet::PacketPool;
use crate::stream::tx::{PrepareOutcome, StreamTx, TxStream};
use crate::stream::SrClass;

/// Outcome recorded against a [`SeqEntry`] at the end of one sequencer
/// iteration; purely diagnostic, consulted by tests and the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneCode {
    NotDone,
    EndOfWindow,
    Dry,
    WindowAdjust,
    TxError,
}

struct SeqEntry {
    stream: Arc<Mutex<TxStream>>,
    pending_packet: Option<crate::packet::PacketHandle>,
    launch_time_ns: u64,
    done_code: DoneCode,
    bandwidth_kbps: u32,
}

/// Per-class, per-queue sequencer tuning. Defaults per class are applied by
/// the caller (`TxEngine`) from the configuration registry; minimums below
/// mirror 802.1Qav timing floors.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Sliding launch-time window width; minimum 250us.
    pub tx_window_width_ns: u64,
    /// Window slide step between iterations; minimum 125us.
    pub tx_window_pitch_ns: u64,
    /// Added to every computed launch time to account for DMA traversal.
    pub tx_delay_ns: u64,
    pub cue_threshold_ns: u64,
    pub prefetch_threshold_ns: u64,
    pub max_reset_count: u32,
    pub max_drop_count: u32,
    /// Per-window cap on retried NIC enqueue failures before link-down is
    /// assumed (`xmit.window.reset_threshold`).
    pub max_tx_error_count: u32,
    pub max_bandwidth_kbps: u32,
    pub strict_pkt_order_en: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            tx_window_width_ns: 250_000,
            tx_window_pitch_ns: 125_000,
            tx_delay_ns: 0,
            cue_threshold_ns: 100_000,
            prefetch_threshold_ns: 500_000,
            max_reset_count: 10,
            max_drop_count: 5,
            max_tx_error_count: 3,
            max_bandwidth_kbps: 50_000,
            strict_pkt_order_en: false,
        }
    }
}

/// Diagnostics accumulated across the sequencer's lifetime (not reset
/// per-window, unlike the transient counters tracked inside one iteration).
#[derive(Debug, Clone, Default)]
pub struct SequencerDiagnostics {
    pub dropped: u64,
    pub reset_count: u64,
    pub sent: u64,
    pub reclaimed: u64,
    pub tx_errors: u64,
}

impl SequencerDiagnostics {
    /// Fraction of sent packets the NIC has confirmed transmitted and
    /// returned to the pool. `1.0` when nothing has been sent yet.
    #[must_use]
    pub fn reclaim_ratio(&self) -> f64 {
        if self.sent == 0 {
            1.0
        } else {
            self.reclaimed as f64 / self.sent as f64
        }
    }
}

enum SequencerRequest {
    Add(Box<TxStream>, u32),
    Remove(u64),
}

/// Caller-facing handle for a running sequencer's add/remove/shaper control
/// contract. Cloneable; every clone shares the same request queue and
/// reserved-bandwidth counter.
#[derive(Clone)]
pub struct SequencerHandle {
    requests: crossbeam_channel::Sender<SequencerRequest>,
    reserved_bw_kbps: Arc<AtomicU32>,
    max_bandwidth_kbps: u32,
    class: SrClass,
}

impl SequencerHandle {
    /// Validates class match and a bandwidth reservation against
    /// `max_bandwidth_kbps`, then enqueues the stream for the worker thread
    /// to splice into `sequence` at the next iteration boundary.
    ///
    /// # Errors
    /// [`Error::InvalidParam`] on class mismatch, [`Error::NoSpaceLeft`] if
    /// the reservation would exceed the configured bandwidth cap.
    pub fn add_stream(&self, stream: TxStream, bandwidth_kbps: u32) -> Result<()> {
        if stream.sr_class() != self.class {
            return Err(Error::InvalidParam(
                "stream sr_class does not match this sequencer's queue".into(),
            ));
        }
        let previous = self.reserved_bw_kbps.fetch_add(bandwidth_kbps, Ordering::AcqRel);
        if previous + bandwidth_kbps > self.max_bandwidth_kbps {
            self.reserved_bw_kbps.fetch_sub(bandwidth_kbps, Ordering::AcqRel);
            return Err(Error::NoSpaceLeft);
        }
        self.requests
            .send(SequencerRequest::Add(Box::new(stream), bandwidth_kbps))
            .map_err(|_| Error::NotInitialized)
    }

    /// Releases `bandwidth_kbps` from the reservation and enqueues removal
    /// of `stream_id`.
    ///
    /// # Errors
    /// [`Error::NotInitialized`] if the sequencer thread is no longer
    /// running.
    pub fn remove_stream(&self, stream_id: u64, bandwidth_kbps: u32) -> Result<()> {
        self.requests
            .send(SequencerRequest::Remove(stream_id))
            .map_err(|_| Error::NotInitialized)?;
        self.reserved_bw_kbps.fetch_sub(bandwidth_kbps, Ordering::AcqRel);
        Ok(())
    }

    #[must_use]
    pub fn current_bandwidth_kbps(&self) -> u32 {
        self.reserved_bw_kbps.load(Ordering::Acquire)
    }
}

/// One dedicated-thread sequencer, running on a single NIC TX queue for a
/// single Stream Reservation class.
pub struct TxSequencer {
    queue_idx: QueueIndex,
    class: SrClass,
    config: SequencerConfig,
    nic: Arc<dyn NicDriver>,
    clock: Arc<dyn GptpClock>,
    pool: Arc<PacketPool>,
    sequence: Vec<SeqEntry>,
    next_stream_to_service: usize,
    reserved_bw_kbps: Arc<AtomicU32>,
    requests: crossbeam_channel::Receiver<SequencerRequest>,
    diag: SequencerDiagnostics,
    link_was_down: bool,
    /// Shared across the class-pair of sequencers: the Low class's
    /// `hiCredit` depends on the High class's maximum frame size (802.1Qav
    /// §34.3). `TxEngine` hands both sequencers the same `Arc`.
    max_frame_size_high: Arc<AtomicU32>,
}

impl TxSequencer {
    /// Builds a sequencer and its caller-facing handle. `max_frame_size_high`
    /// is shared between the High and Low sequencers of one `TxEngine`.
    #[must_use]
    pub fn new(
        queue_idx: QueueIndex,
        class: SrClass,
        config: SequencerConfig,
        nic: Arc<dyn NicDriver>,
        clock: Arc<dyn GptpClock>,
        pool: Arc<PacketPool>,
        max_frame_size_high: Arc<AtomicU32>,
    ) -> (Self, SequencerHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let reserved_bw_kbps = Arc::new(AtomicU32::new(0));
        let handle = SequencerHandle {
            requests: tx,
            reserved_bw_kbps: reserved_bw_kbps.clone(),
            max_bandwidth_kbps: config.max_bandwidth_kbps,
            class,
        };
        let sequencer = Self {
            queue_idx,
            class,
            config,
            nic,
            clock,
            pool,
            sequence: Vec::new(),
            next_stream_to_service: 0,
            reserved_bw_kbps,
            requests: rx,
            diag: SequencerDiagnostics::default(),
            link_was_down: false,
            max_frame_size_high,
        };
        (sequencer, handle)
    }

    #[must_use]
    pub fn diag(&self) -> &SequencerDiagnostics {
        &self.diag
    }

    #[must_use]
    pub fn active_stream_count(&self) -> usize {
        self.sequence.len()
    }

    /// Runs the sequencer loop until `shutdown` is set, sleeping one pitch
    /// between iterations. Intended to be spawned on its own realtime
    /// `std::thread`.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            self.iteration();
            std::thread::sleep(Duration::from_nanos(self.config.tx_window_pitch_ns));
        }
    }

    /// Runs exactly one main-loop iteration (phases (a)-(f)); exposed
    /// separately from [`Self::run`] so tests can drive it deterministically
    /// without sleeping.
    pub fn iteration(&mut self) {
        if !self.phase_a_link_check() {
            return;
        }
        self.phase_b_service_requests();
        let (window_start, window_end) = self.phase_c_window();
        self.phase_d_walk(window_start, window_end);
        self.phase_e_advance_cursor();
        self.phase_f_reclaim();
    }

    /// (a) Link check: suspends the whole iteration while down; reseeds
    /// pending packets and resets the pool on reacquisition. Returns `false`
    /// if the caller should skip the rest of this iteration.
    fn phase_a_link_check(&mut self) -> bool {
        let up = self.nic.link_up();
        if !up {
            if !self.link_was_down {
                self.pool.reset_all();
                for entry in &mut self.sequence {
                    entry.pending_packet = None;
                }
            }
            self.link_was_down = true;
            return false;
        }
        if self.link_was_down {
            let now = self.clock.local_time();
            for entry in &mut self.sequence {
                Self::refill_entry(entry, now, &self.pool);
            }
            self.link_was_down = false;
        }
        true
    }

    /// (b) Drains queued add/remove requests, splicing new streams into
    /// `sequence` at the right launch-time position (fetching their initial
    /// packet) and dropping removed ones.
    fn phase_b_service_requests(&mut self) {
        let now = self.clock.local_time();
        while let Ok(req) = self.requests.try_recv() {
            match req {
                SequencerRequest::Add(stream, bandwidth_kbps) => {
                    let stream_ref = Arc::new(Mutex::new(*stream));
                    let mut entry = SeqEntry {
                        stream: stream_ref,
                        pending_packet: None,
                        launch_time_ns: now,
                        done_code: DoneCode::NotDone,
                        bandwidth_kbps,
                    };
                    Self::refill_entry(&mut entry, now, &self.pool);
                    let pos = self
                        .sequence
                        .partition_point(|e| e.launch_time_ns <= entry.launch_time_ns);
                    self.sequence.insert(pos, entry);
                }
                SequencerRequest::Remove(stream_id) => {
                    self.sequence.retain(|e| {
                        let keep = e.stream.lock().stream_id() != stream_id;
                        if !keep {
                            if let Some(h) = e.pending_packet {
                                self.pool.put(h);
                            }
                        }
                        keep
                    });
                }
            }
        }
    }

    /// (c) Establishes this iteration's sliding launch-time window.
    fn phase_c_window(&self) -> (u64, u64) {
        let window_start = self.clock.local_time() + self.config.tx_delay_ns;
        let window_end = window_start + self.config.tx_window_width_ns;
        (window_start, window_end)
    }

    /// (d) Walks `sequence`, dropping stale entries, resetting far-future
    /// ones, and handing in-window packets to the NIC.
    fn phase_d_walk(&mut self, window_start: u64, window_end: u64) {
        let mut drop_count_this_window = 0u32;
        let mut tx_error_count_this_window = 0u32;
        let len = self.sequence.len();
        let start = if len == 0 { 0 } else { self.next_stream_to_service % len };

        for offset in 0..len {
            let idx = (start + offset) % len;
            let Some(entry) = self.sequence.get_mut(idx) else {
                continue;
            };
            if entry.launch_time_ns >= window_end {
                entry.done_code = DoneCode::EndOfWindow;
                continue;
            }

            if entry.launch_time_ns + self.config.cue_threshold_ns < window_start {
                if let Some(h) = entry.pending_packet.take() {
                    self.pool.put(h);
                }
                self.diag.dropped += 1;
                drop_count_this_window += 1;
                let now = self.clock.local_time();
                Self::refill_entry(entry, now, &self.pool);
                if drop_count_this_window > self.config.max_drop_count {
                    entry.stream.lock().reset();
                    self.diag.reset_count += 1;
                    entry.done_code = DoneCode::WindowAdjust;
                }
                continue;
            }

            if entry.launch_time_ns > window_start + self.config.prefetch_threshold_ns {
                entry.stream.lock().reset();
                self.diag.reset_count += 1;
                entry.done_code = DoneCode::WindowAdjust;
                continue;
            }

            let Some(handle) = entry.pending_packet else {
                entry.done_code = DoneCode::Dry;
                continue;
            };

            match self.nic.send_batch(
                self.queue_idx,
                &[LaunchPacket {
                    handle,
                    launch_time_ns: entry.launch_time_ns,
                }],
            ) {
                Ok(()) => {
                    self.diag.sent += 1;
                    entry.pending_packet = None;
                    entry.done_code = DoneCode::NotDone;
                    let now = self.clock.local_time();
                    Self::refill_entry(entry, now, &self.pool);
                }
                Err(_) => {
                    entry.done_code = DoneCode::TxError;
                    self.diag.tx_errors += 1;
                    tx_error_count_this_window += 1;
                    if self.config.strict_pkt_order_en {
                        // Blocks rather than skipping ahead: abandon the
                        // rest of this walk.
                        break;
                    }
                    if tx_error_count_this_window > self.config.max_tx_error_count {
                        break;
                    }
                }
            }
        }

        if self.sequence.iter().any(|e| e.done_code == DoneCode::NotDone) {
            self.sequence
                .sort_by(|a, b| a.launch_time_ns.cmp(&b.launch_time_ns));
        }
    }

    /// Asks `entry`'s stream for its next packet, handling the `NoData`
    /// (dummy packet) and `ResetRequested` outcomes.
    fn refill_entry(entry: &mut SeqEntry, now_ns: u64, pool: &PacketPool) {
        let outcome = entry.stream.lock().prepare_packet(now_ns, pool);
        match outcome {
            Ok(PrepareOutcome::Packet {
                packet,
                launch_time_ns,
            }) => {
                entry.pending_packet = Some(packet);
                entry.launch_time_ns = launch_time_ns;
                entry.done_code = DoneCode::NotDone;
            }
            Ok(PrepareOutcome::NoData { next_launch_time_ns }) => {
                entry.pending_packet = None;
                entry.launch_time_ns = next_launch_time_ns;
                entry.done_code = DoneCode::Dry;
            }
            Ok(PrepareOutcome::ResetRequested) => {
                entry.stream.lock().reset();
                entry.pending_packet = None;
                entry.done_code = DoneCode::WindowAdjust;
            }
            Err(_) => {
                entry.pending_packet = None;
                entry.done_code = DoneCode::Dry;
            }
        }
    }

    /// (e) Advances the round-robin cursor used to break ties among equal
    /// launch times fairly across iterations.
    fn phase_e_advance_cursor(&mut self) {
        if !self.sequence.is_empty() {
            self.next_stream_to_service = (self.next_stream_to_service + 1) % self.sequence.len();
        }
    }

    /// (f) Returns completed packets to the pool and updates the
    /// reclaim/sent ratio.
    fn phase_f_reclaim(&mut self) {
        if let Ok(report) = self.nic.reclaim(self.queue_idx) {
            self.diag.reclaimed += report.reclaimed.len() as u64;
            for handle in report.reclaimed {
                self.pool.put(handle);
            }
        }
    }

    /// Recomputes `idleSlope`/`hiCredit` and programs the shaper. For the
    /// Low class, `hiCredit` depends on the High class's maximum frame size
    /// via `max_frame_size_high` (802.1Qav §34.3).
    ///
    /// # Errors
    /// Propagates [`NicDriver::set_shaper`] failures.
    pub fn update_shaper(&self) -> Result<()> {
        let idle_slope_kbps = self.reserved_bw_kbps.load(Ordering::Acquire);
        let max_frame_size_high = self.max_frame_size_high.load(Ordering::Acquire).max(1);
        let hi_credit = match self.class {
            SrClass::High => (max_frame_size_high as i64 * 8) as i32,
            SrClass::Low => {
                // Low-class credit must also cover one maximum-size High
                // class frame's worth of interference.
                (max_frame_size_high as i64 * 8 * 2) as i32
            }
        };
        self.nic
            .set_shaper(self.queue_idx, idle_slope_kbps, hi_credit)
    }

    /// Records the High class's current maximum frame size so the Low
    /// class's `hiCredit` computation stays correct; called by `TxEngine`.
    pub fn set_max_frame_size_high(&self, bytes: u16) {
        self.max_frame_size_high
            .fetch_max(u32::from(bytes), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockDomain, ClockKind};
    use crate::gptp::testutil::SoftwarePtp;
    use crate::nic::testutil::SoftwareNic;
    use crate::stream::tx::CrfTx;
    use crate::stream::TSpec;
    use crate::wire::MacAddr;

    fn make_sequencer(
        config: SequencerConfig,
    ) -> (TxSequencer, SequencerHandle, Arc<SoftwareNic>, Arc<SoftwarePtp>) {
        let nic = Arc::new(SoftwareNic::default());
        let clock = Arc::new(SoftwarePtp::new(0));
        let pool = Arc::new(PacketPool::new(16));
        let max_frame_size_high = Arc::new(AtomicU32::new(1522));
        let (seq, handle) = TxSequencer::new(
            0,
            SrClass::High,
            config,
            nic.clone(),
            clock.clone(),
            pool,
            max_frame_size_high,
        );
        (seq, handle, nic, clock)
    }

    fn crf_stream(stream_id: u64) -> TxStream {
        TxStream::Crf(CrfTx::new(
            stream_id,
            SrClass::High,
            MacAddr::default(),
            TSpec::for_class(SrClass::High),
            Arc::new(ClockDomain::new(0, ClockKind::Ptp, 0)),
            1,
        ))
    }

    #[test]
    fn add_stream_beyond_bandwidth_cap_is_rejected() {
        let mut config = SequencerConfig::default();
        config.max_bandwidth_kbps = 100;
        let (_seq, handle, _nic, _clock) = make_sequencer(config);
        assert!(handle.add_stream(crf_stream(1), 60).is_ok());
        assert!(matches!(
            handle.add_stream(crf_stream(2), 60),
            Err(Error::NoSpaceLeft)
        ));
    }

    #[test]
    fn add_stream_is_spliced_in_on_next_iteration() {
        let (mut seq, handle, _nic, _clock) = make_sequencer(SequencerConfig::default());
        handle.add_stream(crf_stream(7), 10).unwrap();
        seq.iteration();
        assert_eq!(seq.active_stream_count(), 1);
    }

    #[test]
    fn remove_stream_drops_it_from_sequence() {
        let (mut seq, handle, _nic, _clock) = make_sequencer(SequencerConfig::default());
        handle.add_stream(crf_stream(7), 10).unwrap();
        seq.iteration();
        handle.remove_stream(7, 10).unwrap();
        seq.iteration();
        assert_eq!(seq.active_stream_count(), 0);
    }

    #[test]
    fn link_down_suspends_iteration_and_resets_pool_once() {
        let (mut seq, handle, nic, _clock) = make_sequencer(SequencerConfig::default());
        handle.add_stream(crf_stream(7), 10).unwrap();
        seq.iteration();
        nic.set_link(false);
        seq.iteration();
        assert_eq!(seq.diag().sent, 0);
    }

    #[test]
    fn nic_backpressure_is_counted_as_tx_error() {
        let (mut seq, handle, nic, _clock) = make_sequencer(SequencerConfig::default());
        handle.add_stream(crf_stream(7), 10).unwrap();
        seq.iteration();
        nic.set_fail_send(true);
        seq.iteration();
        assert!(seq.diag().tx_errors >= 1);
    }

    #[test]
    fn launch_time_far_behind_window_is_dropped() {
        let mut config = SequencerConfig::default();
        config.cue_threshold_ns = 100_000;
        let (mut seq, handle, _nic, clock) = make_sequencer(config);
        handle.add_stream(crf_stream(7), 10).unwrap();
        seq.iteration();
        clock.advance(1_000_000);
        seq.iteration();
        assert!(seq.diag().dropped >= 1);
    }
}
