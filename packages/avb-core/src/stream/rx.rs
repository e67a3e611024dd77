//! RX-side stream objects: `AudioRx`, `VideoRx`, `CrfRx`, unified behind the
//! [`StreamRx`] capability trait and dispatched through the [`RxStream`]
//! tagged variant, mirroring [`super::tx`].

use crate::ringbuffer::RingProducer;
use crate::wire::{AvtpHeader, AvtpSubtype, MacAddr, COMMON_HEADER_LEN};

use super::{ChannelLayout, SrClass, StreamDiagnostics, StreamState, TSpec};

/// Capability shared by every RX stream subtype.
pub trait StreamRx {
    /// Feeds one received Ethernet frame (already stripped of its L2
    /// header) into the stream, returning the resulting state.
    ///
    /// `now_ns` is the gPTP wallclock at reception, used for late/early
    /// timestamp comparison and idle-timeout tracking.
    fn dispatch(&mut self, raw_frame: &[u8], now_ns: u64) -> StreamState;

    /// Re-evaluates the idle timeout without a new frame; called from the
    /// RX engine's periodic sweep. Transitions `Valid`/`NoData` to
    /// `NoData` once `receive.idlewait` has elapsed since the last frame.
    fn check_idle(&mut self, now_ns: u64) -> StreamState;

    fn state(&self) -> StreamState;
    fn stream_id(&self) -> Option<u64>;
    fn sr_class(&self) -> SrClass;
    fn dmac(&self) -> MacAddr;
    fn diag(&self) -> &StreamDiagnostics;
}

struct Common {
    /// `None` until the first frame is seen on a wildcard (wired-up with
    /// `stream_id == 0`) binding; `Some(0)` is never stored once bound.
    expected_stream_id: Option<u64>,
    wildcard: bool,
    /// When set (`rx.ignore.stream_id`), the stream id is never used as a
    /// filter: every frame of the matching subtype is accepted regardless
    /// of how many distinct stream ids it carries. `expected_stream_id` is
    /// still updated for diagnostics/event reporting, but never locks.
    ignore_stream_id: bool,
    sr_class: SrClass,
    dmac: MacAddr,
    tspec: TSpec,
    consumer: Option<RingProducer>,
    diag: StreamDiagnostics,
    state: StreamState,
    expected_seq: Option<u8>,
    last_mr: bool,
    last_rx_wallclock_ns: u64,
    idle_wait_ns: u64,
}

impl Common {
    fn new(
        stream_id: u64,
        sr_class: SrClass,
        dmac: MacAddr,
        tspec: TSpec,
        idle_wait_ns: u64,
        ignore_stream_id: bool,
    ) -> Self {
        Self {
            expected_stream_id: if stream_id == 0 { None } else { Some(stream_id) },
            wildcard: stream_id == 0,
            ignore_stream_id,
            sr_class,
            dmac,
            tspec,
            consumer: None,
            diag: StreamDiagnostics::default(),
            state: StreamState::Inactive,
            expected_seq: None,
            last_mr: false,
            last_rx_wallclock_ns: 0,
            idle_wait_ns,
        }
    }

    /// Validates subtype and stream id, updates sequence/`mr`/timestamp
    /// diagnostics, and returns the AVTP header plus the payload slice past
    /// the common header if this frame is for us.
    fn accept<'a>(&mut self, raw_frame: &'a [u8], expected: AvtpSubtype, now_ns: u64) -> Option<(AvtpHeader, &'a [u8])> {
        let hdr = match AvtpHeader::decode(raw_frame) {
            Ok(h) => h,
            Err(_) => {
                self.diag.unsupported_format = self.diag.unsupported_format.saturating_add(1);
                self.state = StreamState::InvalidData;
                return None;
            }
        };
        if hdr.subtype != expected {
            return None;
        }
        if self.ignore_stream_id {
            // Never filters on stream id; still remembers the most recently
            // observed one for diagnostics/event reporting.
            self.expected_stream_id = Some(hdr.stream_id);
        } else if let Some(expected_id) = self.expected_stream_id {
            if hdr.stream_id != expected_id {
                return None;
            }
        } else if self.wildcard {
            self.expected_stream_id = Some(hdr.stream_id);
        }

        if hdr.mr && !self.last_mr {
            self.diag.media_locked = self.diag.media_locked.saturating_add(1);
        } else if !hdr.mr && self.last_mr {
            self.diag.media_unlocked = self.diag.media_unlocked.saturating_add(1);
        }
        self.last_mr = hdr.mr;

        if let Some(expected_seq) = self.expected_seq {
            if hdr.sequence_num != expected_seq {
                self.diag.seq_num_mismatch = self.diag.seq_num_mismatch.saturating_add(1);
                self.diag.media_reset = self.diag.media_reset.saturating_add(1);
            }
        }
        self.expected_seq = Some(hdr.sequence_num.wrapping_add(1));

        if hdr.tv {
            self.diag.timestamp_valid = self.diag.timestamp_valid.saturating_add(1);
        } else {
            self.diag.timestamp_not_valid = self.diag.timestamp_not_valid.saturating_add(1);
        }

        self.diag.frames_rx = self.diag.frames_rx.saturating_add(1);
        self.last_rx_wallclock_ns = now_ns;
        self.state = StreamState::Valid;

        let payload = raw_frame.get(COMMON_HEADER_LEN..).unwrap_or(&[]);
        Some((hdr, payload))
    }

    fn check_timestamp(&mut self, sample_time_ns: u64, now_ns: u64) {
        let window = self.tspec.presentation_offset_ns;
        if sample_time_ns.saturating_add(window) < now_ns {
            self.diag.late_timestamp = self.diag.late_timestamp.saturating_add(1);
        } else if sample_time_ns > now_ns.saturating_add(window) {
            self.diag.early_timestamp = self.diag.early_timestamp.saturating_add(1);
        }
    }

    fn check_idle(&mut self, now_ns: u64) -> StreamState {
        if matches!(self.state, StreamState::Valid | StreamState::NoData)
            && now_ns.saturating_sub(self.last_rx_wallclock_ns) > self.idle_wait_ns
        {
            self.diag.stream_interrupted = self.diag.stream_interrupted.saturating_add(1);
            self.state = StreamState::NoData;
        }
        self.state
    }
}

/// AAF audio RX stream.
pub struct AudioRx {
    common: Common,
    #[allow(dead_code)]
    layout: ChannelLayout,
}

impl AudioRx {
    #[must_use]
    pub fn new(
        stream_id: u64,
        sr_class: SrClass,
        dmac: MacAddr,
        tspec: TSpec,
        idle_wait_ns: u64,
        ignore_stream_id: bool,
        layout: ChannelLayout,
    ) -> Self {
        Self {
            common: Common::new(stream_id, sr_class, dmac, tspec, idle_wait_ns, ignore_stream_id),
            layout,
        }
    }

    /// Connects a local PCM consumer (e.g. the ALSA worker's ASRC input) to
    /// this stream's ring.
    pub fn connect_consumer(&mut self, producer: RingProducer) {
        self.common.consumer = Some(producer);
    }
}

impl StreamRx for AudioRx {
    fn dispatch(&mut self, raw_frame: &[u8], now_ns: u64) -> StreamState {
        let Some((_, payload)) = self.common.accept(raw_frame, AvtpSubtype::Aaf, now_ns) else {
            return self.common.state;
        };
        // byte 0 of payload is the channel-layout tag written by AudioTx;
        // everything after it is interleaved PCM.
        let pcm = payload.get(1..).unwrap_or(&[]);
        if let Some(consumer) = &self.common.consumer {
            consumer.write(pcm);
        }
        self.common.state
    }

    fn check_idle(&mut self, now_ns: u64) -> StreamState {
        self.common.check_idle(now_ns)
    }

    fn state(&self) -> StreamState {
        self.common.state
    }
    fn stream_id(&self) -> Option<u64> {
        self.common.expected_stream_id
    }
    fn sr_class(&self) -> SrClass {
        self.common.sr_class
    }
    fn dmac(&self) -> MacAddr {
        self.common.dmac
    }
    fn diag(&self) -> &StreamDiagnostics {
        &self.common.diag
    }
}

/// CVF video RX stream.
pub struct VideoRx {
    common: Common,
}

impl VideoRx {
    #[must_use]
    pub fn new(
        stream_id: u64,
        sr_class: SrClass,
        dmac: MacAddr,
        tspec: TSpec,
        idle_wait_ns: u64,
        ignore_stream_id: bool,
    ) -> Self {
        Self {
            common: Common::new(stream_id, sr_class, dmac, tspec, idle_wait_ns, ignore_stream_id),
        }
    }

    pub fn connect_consumer(&mut self, producer: RingProducer) {
        self.common.consumer = Some(producer);
    }
}

impl StreamRx for VideoRx {
    fn dispatch(&mut self, raw_frame: &[u8], now_ns: u64) -> StreamState {
        let Some((_, payload)) = self.common.accept(raw_frame, AvtpSubtype::Cvf, now_ns) else {
            return self.common.state;
        };
        if let Some(consumer) = &self.common.consumer {
            consumer.write(payload);
        }
        self.common.state
    }

    fn check_idle(&mut self, now_ns: u64) -> StreamState {
        self.common.check_idle(now_ns)
    }

    fn state(&self) -> StreamState {
        self.common.state
    }
    fn stream_id(&self) -> Option<u64> {
        self.common.expected_stream_id
    }
    fn sr_class(&self) -> SrClass {
        self.common.sr_class
    }
    fn dmac(&self) -> MacAddr {
        self.common.dmac
    }
    fn diag(&self) -> &StreamDiagnostics {
        &self.common.diag
    }
}

/// CRF (clock reference) RX stream: feeds a received media clock timestamp
/// into a [`crate::clock::ClockDomain`] rather than a PCM/video sink.
pub struct CrfRx {
    common: Common,
    last_sample_time_ns: Option<u64>,
}

impl CrfRx {
    #[must_use]
    pub fn new(
        stream_id: u64,
        sr_class: SrClass,
        dmac: MacAddr,
        tspec: TSpec,
        idle_wait_ns: u64,
        ignore_stream_id: bool,
    ) -> Self {
        Self {
            common: Common::new(stream_id, sr_class, dmac, tspec, idle_wait_ns, ignore_stream_id),
            last_sample_time_ns: None,
        }
    }

    /// The most recently received clock-reference timestamp, consumed by
    /// the owning clock domain's recovery loop.
    #[must_use]
    pub fn last_sample_time_ns(&self) -> Option<u64> {
        self.last_sample_time_ns
    }
}

impl StreamRx for CrfRx {
    fn dispatch(&mut self, raw_frame: &[u8], now_ns: u64) -> StreamState {
        let Some((_, payload)) = self.common.accept(raw_frame, AvtpSubtype::Crf, now_ns) else {
            return self.common.state;
        };
        if payload.len() >= 8 {
            let ts = u64::from_be_bytes(payload[..8].try_into().unwrap());
            self.common.check_timestamp(ts, now_ns);
            self.last_sample_time_ns = Some(ts);
        }
        self.common.state
    }

    fn check_idle(&mut self, now_ns: u64) -> StreamState {
        self.common.check_idle(now_ns)
    }

    fn state(&self) -> StreamState {
        self.common.state
    }
    fn stream_id(&self) -> Option<u64> {
        self.common.expected_stream_id
    }
    fn sr_class(&self) -> SrClass {
        self.common.sr_class
    }
    fn dmac(&self) -> MacAddr {
        self.common.dmac
    }
    fn diag(&self) -> &StreamDiagnostics {
        &self.common.diag
    }
}

/// Tagged variant over every RX stream subtype; the RX engine stores these
/// directly rather than `Box<dyn StreamRx>`.
pub enum RxStream {
    Audio(AudioRx),
    Video(VideoRx),
    Crf(CrfRx),
}

impl StreamRx for RxStream {
    fn dispatch(&mut self, raw_frame: &[u8], now_ns: u64) -> StreamState {
        match self {
            Self::Audio(s) => s.dispatch(raw_frame, now_ns),
            Self::Video(s) => s.dispatch(raw_frame, now_ns),
            Self::Crf(s) => s.dispatch(raw_frame, now_ns),
        }
    }

    fn check_idle(&mut self, now_ns: u64) -> StreamState {
        match self {
            Self::Audio(s) => s.check_idle(now_ns),
            Self::Video(s) => s.check_idle(now_ns),
            Self::Crf(s) => s.check_idle(now_ns),
        }
    }

    fn state(&self) -> StreamState {
        match self {
            Self::Audio(s) => s.state(),
            Self::Video(s) => s.state(),
            Self::Crf(s) => s.state(),
        }
    }

    fn stream_id(&self) -> Option<u64> {
        match self {
            Self::Audio(s) => s.stream_id(),
            Self::Video(s) => s.stream_id(),
            Self::Crf(s) => s.stream_id(),
        }
    }

    fn sr_class(&self) -> SrClass {
        match self {
            Self::Audio(s) => s.sr_class(),
            Self::Video(s) => s.sr_class(),
            Self::Crf(s) => s.sr_class(),
        }
    }

    fn dmac(&self) -> MacAddr {
        match self {
            Self::Audio(s) => s.dmac(),
            Self::Video(s) => s.dmac(),
            Self::Crf(s) => s.dmac(),
        }
    }

    fn diag(&self) -> &StreamDiagnostics {
        match self {
            Self::Audio(s) => s.diag(),
            Self::Video(s) => s.diag(),
            Self::Crf(s) => s.diag(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::AVTP_VERSION;

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

    #[test]
    fn valid_frame_sequence_transitions_to_valid_state() {
        let mut rx = CrfRx::new(42, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 1_000_000, false);
        let state = rx.dispatch(&crf_frame(42, 0, 1000), 1000);
        assert_eq!(state, StreamState::Valid);
        assert_eq!(rx.diag().frames_rx, 1);
    }

    #[test]
    fn sequence_gap_increments_mismatch_and_reset_diagnostics() {
        let mut rx = CrfRx::new(42, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 1_000_000, false);
        rx.dispatch(&crf_frame(42, 0, 1000), 1000);
        rx.dispatch(&crf_frame(42, 5, 2000), 2000);
        assert_eq!(rx.diag().seq_num_mismatch, 1);
        assert_eq!(rx.diag().media_reset, 1);
    }

    #[test]
    fn wildcard_binds_to_first_observed_stream_id() {
        let mut rx = CrfRx::new(0, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 1_000_000, false);
        assert_eq!(rx.stream_id(), None);
        rx.dispatch(&crf_frame(0x1234, 0, 1000), 1000);
        assert_eq!(rx.stream_id(), Some(0x1234));
    }

    #[test]
    fn frame_for_a_different_stream_is_ignored() {
        let mut rx = CrfRx::new(42, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 1_000_000, false);
        let state = rx.dispatch(&crf_frame(99, 0, 1000), 1000);
        assert_eq!(state, StreamState::Inactive);
        assert_eq!(rx.diag().frames_rx, 0);
    }

    #[test]
    fn idle_timeout_transitions_valid_to_no_data() {
        let mut rx = CrfRx::new(42, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 500, false);
        rx.dispatch(&crf_frame(42, 0, 1000), 1000);
        assert_eq!(rx.state(), StreamState::Valid);
        let state = rx.check_idle(2000);
        assert_eq!(state, StreamState::NoData);
        assert_eq!(rx.diag().stream_interrupted, 1);
    }

    #[test]
    fn late_timestamp_is_flagged_when_far_behind_now() {
        let mut rx = CrfRx::new(42, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 1_000_000, false);
        // presentation_offset_ns defaults to 2_000_000; now is far ahead.
        rx.dispatch(&crf_frame(42, 0, 0), 10_000_000);
        assert_eq!(rx.diag().late_timestamp, 1);
    }

    #[test]
    fn ignore_stream_id_accepts_frames_from_distinct_stream_ids() {
        let mut rx = CrfRx::new(42, SrClass::High, MacAddr::default(), TSpec::for_class(SrClass::High), 1_000_000, true);
        let state = rx.dispatch(&crf_frame(42, 0, 1000), 1000);
        assert_eq!(state, StreamState::Valid);
        let state = rx.dispatch(&crf_frame(0x9999, 0, 2000), 2000);
        assert_eq!(state, StreamState::Valid);
        assert_eq!(rx.stream_id(), Some(0x9999));
        assert_eq!(rx.diag().frames_rx, 2);
    }
}
