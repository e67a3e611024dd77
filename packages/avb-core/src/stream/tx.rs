//! TX-side stream objects: `AudioTx`, `VideoTx`, `CrfTx`, unified behind the
//! [`StreamTx`] capability trait and dispatched through the [`TxStream`]
//! tagged variant (no trait objects — the sequencer holds a concrete enum,
//! not a `dyn` pointer).

use std::sync::Arc;

use crate::clock::ClockDomain;
use crate::error::Result;
use crate::packet::{PacketHandle, PacketPool};
use crate::ringbuffer::RingConsumer;
use crate::wire::{AvtpHeader, AvtpSubtype, MacAddr, AVTP_VERSION, COMMON_HEADER_LEN};

use super::{ChannelLayout, SampleFormat, SrClass, StreamDiagnostics, TSpec, VideoFormat};

/// Outcome of asking a TX stream for its next packet.
pub enum PrepareOutcome {
    /// A packet is ready to hand to the sequencer, along with its launch
    /// time.
    Packet { packet: PacketHandle, launch_time_ns: u64 },
    /// No real data was available; the caller should synthesize a dummy
    /// packet at `last_launch_time + nominal_interval` to keep the shaper
    /// draining credit and preserve the stream's clock phase.
    NoData { next_launch_time_ns: u64 },
    /// The stream wants its pool state and clock re-anchored (mirrors a
    /// `reset()` call); the sequencer should treat this like a cue/prefetch
    /// reset.
    ResetRequested,
}

/// Capability shared by every TX stream subtype.
pub trait StreamTx {
    /// Builds (or reuses pool capacity for) the next packet this stream
    /// wants transmitted, stamped with its target launch time.
    fn prepare_packet(&mut self, clock_now_ns: u64, pool: &PacketPool) -> Result<PrepareOutcome>;

    /// Flushes buffered state and re-anchors the stream's clock phase;
    /// called by the sequencer after too many drops/resets in one window.
    fn reset(&mut self);

    fn stream_id(&self) -> u64;
    fn sr_class(&self) -> SrClass;
    fn dmac(&self) -> MacAddr;
    fn diag(&self) -> &StreamDiagnostics;
}

struct Common {
    stream_id: u64,
    sr_class: SrClass,
    dmac: MacAddr,
    tspec: TSpec,
    clock_domain: Arc<ClockDomain>,
    producer: Option<RingConsumer>,
    diag: StreamDiagnostics,
    sequence_num: u8,
    last_launch_time_ns: u64,
}

impl Common {
    fn new(
        stream_id: u64,
        sr_class: SrClass,
        dmac: MacAddr,
        tspec: TSpec,
        clock_domain: Arc<ClockDomain>,
    ) -> Self {
        Self {
            stream_id,
            sr_class,
            dmac,
            tspec,
            clock_domain,
            producer: None,
            diag: StreamDiagnostics::default(),
            sequence_num: 0,
            last_launch_time_ns: 0,
        }
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.sequence_num;
        // wraps at 256 by construction (u8 wrapping_add)
        self.sequence_num = self.sequence_num.wrapping_add(1);
        seq
    }

    fn next_launch_time(&self, clock_now_ns: u64) -> u64 {
        clock_now_ns + self.tspec.presentation_offset_ns
    }
}

/// AAF audio TX stream.
pub struct AudioTx {
    common: Common,
    channels: u16,
    sample_rate: u32,
    format: SampleFormat,
    layout: ChannelLayout,
    samples_per_packet: usize,
}

impl AudioTx {
    #[must_use]
    pub fn new(
        stream_id: u64,
        sr_class: SrClass,
        dmac: MacAddr,
        tspec: TSpec,
        clock_domain: Arc<ClockDomain>,
        channels: u16,
        sample_rate: u32,
        format: SampleFormat,
        layout: ChannelLayout,
    ) -> Self {
        let samples_per_packet = (sample_rate as u64 * tspec.measurement_interval_ns / 1_000_000_000)
            .max(1) as usize;
        Self {
            common: Common::new(stream_id, sr_class, dmac, tspec, clock_domain),
            channels,
            sample_rate,
            format,
            layout,
            samples_per_packet,
        }
    }

    /// Connects a local PCM producer (e.g. the ALSA worker's ASRC output)
    /// to this stream's ring.
    pub fn connect_producer(&mut self, consumer: RingConsumer) {
        self.common.producer = Some(consumer);
    }
}

impl StreamTx for AudioTx {
    fn prepare_packet(&mut self, clock_now_ns: u64, pool: &PacketPool) -> Result<PrepareOutcome> {
        let launch_time_ns = self.common.next_launch_time(clock_now_ns);
        let frame_bytes = self.samples_per_packet * self.channels as usize * self.format.bytes_per_sample();

        let mut pcm = vec![0u8; frame_bytes];
        let got = self
            .common
            .producer
            .as_ref()
            .map(|p| p.read(&mut pcm))
            .unwrap_or(0);

        if got == 0 {
            let nominal = self.common.tspec.measurement_interval_ns;
            return Ok(PrepareOutcome::NoData {
                next_launch_time_ns: self.common.last_launch_time_ns + nominal,
            });
        }

        let handle = pool.get()?;
        pool.with_packet_mut(handle, |packet| {
            let hdr = AvtpHeader {
                subtype: AvtpSubtype::Aaf,
                sv: true,
                version: AVTP_VERSION,
                mr: false,
                gv: false,
                tv: true,
                sequence_num: self.common.next_seq(),
                tu: false,
                stream_id: self.common.stream_id,
            };
            let buf = packet.buf_mut();
            hdr.encode(&mut buf[..COMMON_HEADER_LEN])
                .expect("buffer sized for header");
            // layout byte distinguishes SAF vs legacy channel ordering,
            // consumed by a receiving AudioRx for payload interpretation.
            buf[COMMON_HEADER_LEN] = match self.layout {
                ChannelLayout::Saf => 0,
                ChannelLayout::Legacy => 1,
            };
            let payload_start = COMMON_HEADER_LEN + 1;
            let end = (payload_start + pcm.len()).min(buf.len());
            let n = end - payload_start;
            buf[payload_start..end].copy_from_slice(&pcm[..n]);
            packet.set_payload_len(end);
            packet.launch_time_ns = launch_time_ns;
        });
        self.common.diag.frames_tx = self.common.diag.frames_tx.saturating_add(1);
        self.common.diag.timestamp_valid = self.common.diag.timestamp_valid.saturating_add(1);
        self.common.last_launch_time_ns = launch_time_ns;
        let _ = self.sample_rate;
        let _ = self.channels;
        Ok(PrepareOutcome::Packet {
            packet: handle,
            launch_time_ns,
        })
    }

    fn reset(&mut self) {
        self.common.diag.reset_count = self.common.diag.reset_count.saturating_add(1);
        self.common.sequence_num = 0;
    }

    fn stream_id(&self) -> u64 {
        self.common.stream_id
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

/// CVF video TX stream.
pub struct VideoTx {
    common: Common,
    format: VideoFormat,
    max_packet_size: u16,
}

impl VideoTx {
    #[must_use]
    pub fn new(
        stream_id: u64,
        sr_class: SrClass,
        dmac: MacAddr,
        tspec: TSpec,
        clock_domain: Arc<ClockDomain>,
        format: VideoFormat,
        max_packet_size: u16,
    ) -> Self {
        Self {
            common: Common::new(stream_id, sr_class, dmac, tspec, clock_domain),
            format,
            max_packet_size,
        }
    }

    pub fn connect_producer(&mut self, consumer: RingConsumer) {
        self.common.producer = Some(consumer);
    }
}

impl StreamTx for VideoTx {
    fn prepare_packet(&mut self, clock_now_ns: u64, pool: &PacketPool) -> Result<PrepareOutcome> {
        let launch_time_ns = self.common.next_launch_time(clock_now_ns);
        let cap = self.max_packet_size as usize;
        let mut chunk = vec![0u8; cap.saturating_sub(COMMON_HEADER_LEN)];
        let got = self
            .common
            .producer
            .as_ref()
            .map(|p| p.read(&mut chunk))
            .unwrap_or(0);

        if got == 0 {
            let nominal = self.common.tspec.measurement_interval_ns;
            return Ok(PrepareOutcome::NoData {
                next_launch_time_ns: self.common.last_launch_time_ns + nominal,
            });
        }

        let handle = pool.get()?;
        pool.with_packet_mut(handle, |packet| {
            let hdr = AvtpHeader {
                subtype: AvtpSubtype::Cvf,
                sv: true,
                version: AVTP_VERSION,
                mr: false,
                gv: false,
                tv: true,
                sequence_num: self.common.next_seq(),
                tu: false,
                stream_id: self.common.stream_id,
            };
            let buf = packet.buf_mut();
            hdr.encode(&mut buf[..COMMON_HEADER_LEN])
                .expect("buffer sized for header");
            let payload_start = COMMON_HEADER_LEN;
            let end = (payload_start + got).min(buf.len());
            let n = end - payload_start;
            buf[payload_start..end].copy_from_slice(&chunk[..n]);
            packet.set_payload_len(end);
            packet.launch_time_ns = launch_time_ns;
        });
        self.common.diag.frames_tx = self.common.diag.frames_tx.saturating_add(1);
        self.common.last_launch_time_ns = launch_time_ns;
        let _ = self.format;
        Ok(PrepareOutcome::Packet {
            packet: handle,
            launch_time_ns,
        })
    }

    fn reset(&mut self) {
        self.common.diag.reset_count = self.common.diag.reset_count.saturating_add(1);
        self.common.sequence_num = 0;
    }

    fn stream_id(&self) -> u64 {
        self.common.stream_id
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

/// CRF (clock reference) TX stream: carries the talker's media clock as a
/// sequence of timestamps rather than payload samples.
pub struct CrfTx {
    common: Common,
    events_per_packet: u32,
}

impl CrfTx {
    #[must_use]
    pub fn new(
        stream_id: u64,
        sr_class: SrClass,
        dmac: MacAddr,
        tspec: TSpec,
        clock_domain: Arc<ClockDomain>,
        events_per_packet: u32,
    ) -> Self {
        Self {
            common: Common::new(stream_id, sr_class, dmac, tspec, clock_domain),
            events_per_packet,
        }
    }
}

impl StreamTx for CrfTx {
    fn prepare_packet(&mut self, clock_now_ns: u64, pool: &PacketPool) -> Result<PrepareOutcome> {
        let launch_time_ns = self.common.next_launch_time(clock_now_ns);
        let handle = pool.get()?;
        pool.with_packet_mut(handle, |packet| {
            let hdr = AvtpHeader {
                subtype: AvtpSubtype::Crf,
                sv: true,
                version: AVTP_VERSION,
                mr: false,
                gv: false,
                tv: true,
                sequence_num: self.common.next_seq(),
                tu: false,
                stream_id: self.common.stream_id,
            };
            let buf = packet.buf_mut();
            hdr.encode(&mut buf[..COMMON_HEADER_LEN])
                .expect("buffer sized for header");
            let media_clock_ticks = self
                .common
                .clock_domain
                .now_in_media_ticks(clock_now_ns, self.common.tspec.measurement_interval_ns as f64);
            let ts_bytes = media_clock_ticks.to_be_bytes();
            let payload_start = COMMON_HEADER_LEN;
            buf[payload_start..payload_start + 8].copy_from_slice(&ts_bytes);
            packet.set_payload_len(payload_start + 8);
            packet.launch_time_ns = launch_time_ns;
        });
        self.common.diag.frames_tx = self.common.diag.frames_tx.saturating_add(1);
        self.common.last_launch_time_ns = launch_time_ns;
        let _ = self.events_per_packet;
        Ok(PrepareOutcome::Packet {
            packet: handle,
            launch_time_ns,
        })
    }

    fn reset(&mut self) {
        self.common.diag.reset_count = self.common.diag.reset_count.saturating_add(1);
        self.common.sequence_num = 0;
    }

    fn stream_id(&self) -> u64 {
        self.common.stream_id
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

/// Tagged variant over every TX stream subtype; the sequencer stores these
/// directly rather than `Box<dyn StreamTx>`.
pub enum TxStream {
    Audio(AudioTx),
    Video(VideoTx),
    Crf(CrfTx),
}

impl StreamTx for TxStream {
    fn prepare_packet(&mut self, clock_now_ns: u64, pool: &PacketPool) -> Result<PrepareOutcome> {
        match self {
            Self::Audio(s) => s.prepare_packet(clock_now_ns, pool),
            Self::Video(s) => s.prepare_packet(clock_now_ns, pool),
            Self::Crf(s) => s.prepare_packet(clock_now_ns, pool),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Audio(s) => s.reset(),
            Self::Video(s) => s.reset(),
            Self::Crf(s) => s.reset(),
        }
    }

    fn stream_id(&self) -> u64 {
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
    use crate::clock::ClockKind;
    use crate::ringbuffer::channel;

    fn clock() -> Arc<ClockDomain> {
        Arc::new(ClockDomain::new(0, ClockKind::Ptp, 0))
    }

    #[test]
    fn audio_tx_yields_no_data_when_ring_is_empty() {
        let pool = PacketPool::new(4);
        let mut stream = AudioTx::new(
            1,
            SrClass::High,
            MacAddr::default(),
            TSpec::for_class(SrClass::High),
            clock(),
            2,
            48_000,
            SampleFormat::S16,
            ChannelLayout::Saf,
        );
        let outcome = stream.prepare_packet(0, &pool).unwrap();
        assert!(matches!(outcome, PrepareOutcome::NoData { .. }));
    }

    #[test]
    fn audio_tx_builds_packet_with_bit_exact_header() {
        let pool = PacketPool::new(4);
        let mut stream = AudioTx::new(
            1,
            SrClass::High,
            MacAddr::default(),
            TSpec::for_class(SrClass::High),
            clock(),
            2,
            48_000,
            SampleFormat::S16,
            ChannelLayout::Saf,
        );
        let (producer, consumer) = channel(4096);
        stream.connect_producer(consumer);
        producer.write(&[0u8; 4096]);

        let outcome = stream.prepare_packet(1_000_000, &pool).unwrap();
        match outcome {
            PrepareOutcome::Packet { packet, .. } => {
                pool.with_packet(packet, |p| {
                    let hdr = AvtpHeader::decode(p.payload()).unwrap();
                    assert_eq!(hdr.subtype, AvtpSubtype::Aaf);
                    assert_eq!(hdr.stream_id, 1);
                    assert_eq!(hdr.sequence_num, 0);
                });
            }
            _ => panic!("expected a packet"),
        }
    }

    #[test]
    fn sequence_number_wraps_at_256() {
        let pool = PacketPool::new(4);
        let mut stream = CrfTx::new(
            1,
            SrClass::High,
            MacAddr::default(),
            TSpec::for_class(SrClass::High),
            clock(),
            1,
        );
        for i in 0..256 {
            let outcome = stream.prepare_packet(i * 1000, &pool).unwrap();
            if let PrepareOutcome::Packet { packet, .. } = outcome {
                pool.put(packet);
            }
        }
        // the 256th call (index 255) should have used seq 255, and the next
        // one wraps back to 0 without panicking (u8 wraps natively).
        let outcome = stream.prepare_packet(256_000, &pool).unwrap();
        if let PrepareOutcome::Packet { packet, .. } = outcome {
            pool.with_packet(packet, |p| {
                let hdr = AvtpHeader::decode(p.payload()).unwrap();
                assert_eq!(hdr.sequence_num, 0);
            });
        }
    }
}
