//! RX engine: one worker thread that demultiplexes incoming AVTP frames to
//! registered stream objects and reports state-change events. Two ingress
//! modes share the same dispatch/registry logic: socket mode (an
//! [`crate::ingress::RxIngress`]) and direct-DMA mode (polling
//! [`crate::nic::NicDriver::read_rx`] across the flexible filter queues).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::events::EventSlot;
use crate::ingress::RxIngress;
use crate::nic::{NicDriver, MAX_RX_FILTERS};
use crate::ringbuffer::RingProducer;
use crate::stream::rx::{AudioRx, CrfRx, VideoRx};
use crate::stream::{RxStream, StreamRx, StreamState};
use crate::wire::{AvtpHeader, MacAddr};

/// Handles above this watermark are synthetic (assigned to wildcard/
/// `id == 0` registrations rather than echoing a caller-supplied AVB stream
/// id), so they can never collide with a real IEEE 1722 stream id in
/// practice.
const SYNTHETIC_HANDLE_BASE: u64 = 1 << 63;

struct RxRegistration {
    stream: RxStream,
    /// `true` for wildcard (`id == 0`) or `rx.ignore.stream_id` streams:
    /// kept in the fallback candidate list even after locking onto an id,
    /// since they must keep accepting other ids too.
    always_candidate: bool,
    bound_stream_id: Option<u64>,
    last_notified: StreamState,
}

enum RxMode {
    Socket(Box<dyn RxIngress>),
    DirectDma,
}

/// Owns every registered RX stream, the ingress worker thread, and the
/// stream-id/wildcard demux tables.
pub struct RxEngine {
    nic: Arc<dyn NicDriver>,
    streams: RwLock<HashMap<u64, RxRegistration>>,
    by_stream_id: RwLock<HashMap<u64, u64>>,
    candidates: RwLock<Vec<u64>>,
    next_synthetic: AtomicU64,
    events: Arc<EventSlot>,
    idle_wait: Duration,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RxEngine {
    #[must_use]
    pub fn new(nic: Arc<dyn NicDriver>, events: Arc<EventSlot>, idle_wait: Duration) -> Self {
        Self {
            nic,
            streams: RwLock::new(HashMap::new()),
            by_stream_id: RwLock::new(HashMap::new()),
            candidates: RwLock::new(Vec::new()),
            next_synthetic: AtomicU64::new(SYNTHETIC_HANDLE_BASE),
            events,
            idle_wait,
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    fn allocate_handle(&self, requested_id: u64) -> u64 {
        if requested_id == 0 {
            self.next_synthetic.fetch_add(1, Ordering::Relaxed)
        } else {
            requested_id
        }
    }

    /// Registers a new RX audio stream and returns its handle (the AVB
    /// stream id for non-wildcard registrations, a synthetic id otherwise).
    ///
    /// # Errors
    /// [`Error::AlreadyInUse`] if `requested_id` is already registered
    /// (non-wildcard only).
    pub fn create_audio_stream(
        &self,
        requested_id: u64,
        ignore_stream_id: bool,
        stream: AudioRx,
    ) -> Result<u64> {
        self.register(requested_id, ignore_stream_id, RxStream::Audio(stream))
    }

    /// Registers a new RX video stream; see [`Self::create_audio_stream`].
    ///
    /// # Errors
    /// [`Error::AlreadyInUse`] if `requested_id` is already registered.
    pub fn create_video_stream(
        &self,
        requested_id: u64,
        ignore_stream_id: bool,
        stream: VideoRx,
    ) -> Result<u64> {
        self.register(requested_id, ignore_stream_id, RxStream::Video(stream))
    }

    /// Registers a new RX CRF stream; see [`Self::create_audio_stream`].
    ///
    /// # Errors
    /// [`Error::AlreadyInUse`] if `requested_id` is already registered.
    pub fn create_crf_stream(
        &self,
        requested_id: u64,
        ignore_stream_id: bool,
        stream: CrfRx,
    ) -> Result<u64> {
        self.register(requested_id, ignore_stream_id, RxStream::Crf(stream))
    }

    fn register(&self, requested_id: u64, ignore_stream_id: bool, stream: RxStream) -> Result<u64> {
        let wildcard = requested_id == 0;
        let handle = self.allocate_handle(requested_id);
        let mut streams = self.streams.write();
        if streams.contains_key(&handle) {
            return Err(Error::AlreadyInUse(format!("rx stream {handle:#x}")));
        }
        let always_candidate = wildcard || ignore_stream_id;
        if !wildcard && !ignore_stream_id {
            self.by_stream_id.write().insert(requested_id, handle);
        }
        if always_candidate {
            self.candidates.write().push(handle);
        }
        streams.insert(
            handle,
            RxRegistration {
                stream,
                always_candidate,
                bound_stream_id: if wildcard { None } else { Some(requested_id) },
                last_notified: StreamState::Inactive,
            },
        );
        Ok(handle)
    }

    /// Destroys a previously registered RX stream.
    ///
    /// # Errors
    /// [`Error::NotFound`] if `handle` is unknown.
    pub fn destroy(&self, handle: u64) -> Result<()> {
        let mut streams = self.streams.write();
        let reg = streams
            .remove(&handle)
            .ok_or_else(|| Error::NotFound(format!("rx stream {handle:#x}")))?;
        if let Some(sid) = reg.bound_stream_id {
            self.by_stream_id.write().remove(&sid);
        }
        self.candidates.write().retain(|&h| h != handle);
        Ok(())
    }

    /// RX streams can never be deactivated once created.
    ///
    /// # Errors
    /// [`Error::NotFound`] if `handle` is unknown; [`Error::NotSupported`]
    /// if `active` is `false`.
    pub fn set_active(&self, handle: u64, active: bool) -> Result<()> {
        if !self.streams.read().contains_key(&handle) {
            return Err(Error::NotFound(format!("rx stream {handle:#x}")));
        }
        if !active {
            return Err(Error::NotSupported("rx streams cannot be deactivated".into()));
        }
        Ok(())
    }

    /// Attaches a local PCM sink to a registered audio stream.
    ///
    /// # Errors
    /// [`Error::NotFound`] if `handle` is unknown; [`Error::InvalidParam`]
    /// if it is not an audio stream.
    pub fn connect_audio_sink(&self, handle: u64, producer: RingProducer) -> Result<()> {
        let mut streams = self.streams.write();
        let reg = streams
            .get_mut(&handle)
            .ok_or_else(|| Error::NotFound(format!("rx stream {handle:#x}")))?;
        match &mut reg.stream {
            RxStream::Audio(s) => {
                s.connect_consumer(producer);
                Ok(())
            }
            _ => Err(Error::InvalidParam("stream is not an audio stream".into())),
        }
    }

    /// Attaches a local payload sink to a registered video stream.
    ///
    /// # Errors
    /// [`Error::NotFound`] if `handle` is unknown; [`Error::InvalidParam`]
    /// if it is not a video stream.
    pub fn connect_video_sink(&self, handle: u64, producer: RingProducer) -> Result<()> {
        let mut streams = self.streams.write();
        let reg = streams
            .get_mut(&handle)
            .ok_or_else(|| Error::NotFound(format!("rx stream {handle:#x}")))?;
        match &mut reg.stream {
            RxStream::Video(s) => {
                s.connect_consumer(producer);
                Ok(())
            }
            _ => Err(Error::InvalidParam("stream is not a video stream".into())),
        }
    }

    /// The most recent clock-reference sample time received on a registered
    /// CRF stream, consumed by a clock domain's recovery loop.
    #[must_use]
    pub fn crf_last_sample_time_ns(&self, handle: u64) -> Option<u64> {
        match &self.streams.read().get(&handle)?.stream {
            RxStream::Crf(s) => s.last_sample_time_ns(),
            _ => None,
        }
    }

    #[must_use]
    pub fn state(&self, handle: u64) -> Option<StreamState> {
        self.streams.read().get(&handle).map(|r| r.stream.state())
    }

    #[must_use]
    pub fn dmac(&self, handle: u64) -> Option<MacAddr> {
        self.streams.read().get(&handle).map(|r| r.stream.dmac())
    }

    /// Feeds one received Ethernet frame through the demux/dispatch logic.
    /// Fast path: exact `stream_id` match. Fallback: any wildcard or
    /// `ignore_stream_id` candidate, which locks onto the id (wildcard) or
    /// simply accepts it (ignore-stream-id) once it first produces a
    /// non-`Inactive` state.
    fn dispatch_packet(&self, frame: &[u8], now_ns: u64) {
        let Ok(hdr) = AvtpHeader::decode(frame) else {
            return;
        };

        let fast = self.by_stream_id.read().get(&hdr.stream_id).copied();
        if let Some(handle) = fast {
            self.dispatch_to(handle, frame, now_ns);
            return;
        }

        let candidates = self.candidates.read().clone();
        for handle in candidates {
            if self.dispatch_to(handle, frame, now_ns) {
                return;
            }
        }
    }

    /// Dispatches `frame` to `handle`'s stream; returns `true` if it was
    /// accepted (state left `Inactive`).
    fn dispatch_to(&self, handle: u64, frame: &[u8], now_ns: u64) -> bool {
        let mut streams = self.streams.write();
        let Some(reg) = streams.get_mut(&handle) else {
            return false;
        };
        let state = reg.stream.dispatch(frame, now_ns);
        if state == StreamState::Inactive {
            return false;
        }
        if let Some(sid) = reg.stream.stream_id() {
            if reg.bound_stream_id != Some(sid) {
                reg.bound_stream_id = Some(sid);
                self.by_stream_id.write().insert(sid, handle);
                if !reg.always_candidate {
                    drop(streams);
                    self.candidates.write().retain(|&h| h != handle);
                    streams = self.streams.write();
                }
            }
        }
        if let Some(reg) = streams.get_mut(&handle) {
            if reg.last_notified != state {
                reg.last_notified = state;
                let stream_id = reg.stream.stream_id().unwrap_or(handle);
                drop(streams);
                self.events.notify_stream_status(stream_id, state);
            }
        }
        true
    }

    /// Re-evaluates idle timeouts for every registered stream; called
    /// periodically by the worker loop.
    fn sweep_idle(&self, now_ns: u64) {
        let handles: Vec<u64> = self.streams.read().keys().copied().collect();
        for handle in handles {
            let mut streams = self.streams.write();
            let Some(reg) = streams.get_mut(&handle) else {
                continue;
            };
            let state = reg.stream.check_idle(now_ns);
            if reg.last_notified != state {
                reg.last_notified = state;
                let stream_id = reg.stream.stream_id().unwrap_or(handle);
                drop(streams);
                self.events.notify_stream_status(stream_id, state);
            }
        }
    }

    /// Starts the socket-mode worker thread.
    pub fn start_socket_mode(self: &Arc<Self>, ingress: Box<dyn RxIngress>) {
        self.spawn(RxMode::Socket(ingress));
    }

    /// Starts the direct-DMA-mode worker thread, polling queues
    /// `0..MAX_RX_FILTERS`.
    pub fn start_direct_dma_mode(self: &Arc<Self>) {
        self.spawn(RxMode::DirectDma);
    }

    fn spawn(self: &Arc<Self>, mut mode: RxMode) {
        let engine = self.clone();
        let shutdown = self.shutdown.clone();
        let idle_wait = self.idle_wait;
        let thread = std::thread::spawn(move || {
            let mut buf = vec![0u8; 1522];
            let mut last_sweep_ns = 0u64;
            while !shutdown.load(Ordering::Relaxed) {
                match &mut mode {
                    RxMode::Socket(ingress) => match ingress.recv(&mut buf, idle_wait) {
                        Ok(Some(n)) => {
                            let now_ns = monotonic_now_ns();
                            engine.dispatch_packet(&buf[..n], now_ns);
                        }
                        Ok(None) => {}
                        Err(err) => log::warn!("rx socket ingress error: {err}"),
                    },
                    RxMode::DirectDma => {
                        let mut any = false;
                        for queue in 0..MAX_RX_FILTERS as u8 {
                            match engine.nic.read_rx(queue, &mut buf) {
                                Ok(Some(n)) => {
                                    any = true;
                                    let now_ns = monotonic_now_ns();
                                    engine.dispatch_packet(&buf[..n], now_ns);
                                }
                                Ok(None) => {}
                                Err(err) => log::warn!("rx direct-dma read error: {err}"),
                            }
                        }
                        if !any {
                            std::thread::sleep(Duration::from_micros(100));
                        }
                    }
                }
                let now_ns = monotonic_now_ns();
                if now_ns.saturating_sub(last_sweep_ns) >= idle_wait.as_nanos() as u64 {
                    engine.sweep_idle(now_ns);
                    last_sweep_ns = now_ns;
                }
            }
        });
        *self.thread.lock() = Some(thread);
    }

    /// Stops the worker thread, joining cooperatively.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RxEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wallclock used only to timestamp frames picked up by the worker thread,
/// which does not otherwise have direct access to a [`crate::gptp::GptpClock`]
/// (the engine is constructed before any one NIC-bound clock is chosen, and
/// stream dispatch only needs a monotonically increasing reference, not the
/// gPTP-disciplined one). Grounded on the stream-level `now_ns` plumbing
/// already used throughout `dispatch`/`check_idle`.
fn monotonic_now_ns() -> u64 {
    use std::time::Instant;
    thread_local! {
        static EPOCH: Instant = Instant::now();
    }
    EPOCH.with(|epoch| epoch.elapsed().as_nanos() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::testutil::SoftwareNic;
    use crate::stream::{SrClass, TSpec};
    use crate::wire::{AvtpSubtype, AVTP_VERSION, COMMON_HEADER_LEN};

    fn crf_frame(stream_id: u64, seq: u8, ts: u64) -> Vec<u8> {
        let hdr = AvtpHeader {
            subtype: AvtpSubtype::Crf,
            sv: true,
            version: AVTP_VERSION,
            mr: true,
            gv: false,
            tv: true,
            sequence_num: seq,
            tu: false,
            stream_id,
        };
        let mut buf = vec![0u8; COMMON_HEADER_LEN + 8];
        hdr.encode(&mut buf[..COMMON_HEADER_LEN]).unwrap();
        buf[COMMON_HEADER_LEN..].copy_from_slice(&ts.to_be_bytes());
        buf
    }

    fn engine() -> Arc<RxEngine> {
        let nic = Arc::new(SoftwareNic::default());
        let events = Arc::new(EventSlot::new());
        Arc::new(RxEngine::new(nic, events, Duration::from_millis(1)))
    }

    #[test]
    fn subtype_mismatch_leaves_state_inactive() {
        let eng = engine();
        let handle = eng
            .create_audio_stream(
                42,
                false,
                AudioRx::new(
                    42,
                    SrClass::High,
                    MacAddr::default(),
                    TSpec::for_class(SrClass::High),
                    1_000_000,
                    false,
                    crate::stream::ChannelLayout::Saf,
                ),
            )
            .unwrap();
        // A CRF frame sent to an audio registration: subtype mismatch, so
        // `accept` bails out before touching state.
        eng.dispatch_to(handle, &crf_frame(42, 0, 1000), 1000);
        assert_eq!(eng.state(handle), Some(StreamState::Inactive));
    }

    #[test]
    fn wildcard_stream_locks_onto_first_observed_id_and_stops_being_a_fallback_candidate() {
        let eng = engine();
        let handle = eng
            .create_crf_stream(
                0,
                false,
                CrfRx::new(0, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 1_000_000, false),
            )
            .unwrap();
        assert_eq!(eng.candidates.read().len(), 1);
        eng.dispatch_packet(&crf_frame(0x1234, 0, 1000), 1000);
        assert_eq!(eng.state(handle), Some(StreamState::Valid));
        assert_eq!(eng.by_stream_id.read().get(&0x1234), Some(&handle));
        assert!(eng.candidates.read().is_empty());
    }

    #[test]
    fn ignore_stream_id_remains_a_candidate_after_locking() {
        let eng = engine();
        let handle = eng
            .create_crf_stream(
                42,
                true,
                CrfRx::new(42, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 1_000_000, true),
            )
            .unwrap();
        eng.dispatch_packet(&crf_frame(42, 0, 1000), 1000);
        eng.dispatch_packet(&crf_frame(0x9999, 0, 2000), 2000);
        assert_eq!(eng.state(handle), Some(StreamState::Valid));
        assert_eq!(eng.streams.read().get(&handle).unwrap().stream.diag().frames_rx, 2);
        assert!(eng.candidates.read().contains(&handle));
    }

    #[test]
    fn destroy_removes_all_index_entries() {
        let eng = engine();
        let handle = eng
            .create_crf_stream(
                42,
                false,
                CrfRx::new(42, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 1_000_000, false),
            )
            .unwrap();
        eng.destroy(handle).unwrap();
        assert!(eng.by_stream_id.read().get(&42).is_none());
        assert!(eng.streams.read().get(&handle).is_none());
    }

    #[test]
    fn rx_streams_reject_deactivation() {
        let eng = engine();
        let handle = eng
            .create_crf_stream(
                42,
                false,
                CrfRx::new(42, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 1_000_000, false),
            )
            .unwrap();
        assert!(matches!(eng.set_active(handle, false), Err(Error::NotSupported(_))));
        assert!(eng.set_active(handle, true).is_ok());
    }

    #[test]
    fn event_listener_is_notified_once_per_transition() {
        use crate::events::EventListener;
        struct Recorder(parking_lot::Mutex<Vec<(u64, StreamState)>>);
        impl EventListener for Recorder {
            fn on_link_status(&self, _up: bool) {}
            fn on_stream_status(&self, stream_id: u64, state: StreamState) {
                self.0.lock().push((stream_id, state));
            }
        }

        let eng = engine();
        let recorder = Arc::new(Recorder(parking_lot::Mutex::new(Vec::new())));
        eng.events.register(recorder.clone()).unwrap();
        eng.create_crf_stream(
            42,
            false,
            CrfRx::new(42, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 1_000_000, false),
        )
        .unwrap();
        eng.dispatch_packet(&crf_frame(42, 0, 1000), 1000);
        eng.dispatch_packet(&crf_frame(42, 1, 2000), 2000);
        assert_eq!(recorder.0.lock().as_slice(), &[(42, StreamState::Valid)]);
    }
}
