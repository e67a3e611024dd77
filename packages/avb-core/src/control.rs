//! Control API: the synchronous facade used by the configuration plugin
//! and any runtime controller (§6). Every operation here validates its
//! arguments fully before mutating any state — no partial commits — and
//! returns the [`crate::error::Error`] taxonomy directly rather than a
//! boolean/errno pair.
//!
//! This module is the one place that knows how to turn the abbreviated
//! "create stream" parameters (sample rate, channel count, clock id, MAC
//! assignment mode) into the concrete [`crate::stream::tx::TxStream`] /
//! [`crate::stream::rx::RxStream`] objects that [`crate::engine::TxEngine`]
//! and [`crate::rx_engine::RxEngine`] actually operate on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::clock::{ClockDomain, ClockId, ClockKind, PllDriver};
use crate::error::{Error, Result};
use crate::events::EventListener;
use crate::ringbuffer::{RingConsumer, RingProducer};
use crate::stream::rx::{AudioRx, CrfRx, VideoRx};
use crate::stream::tx::{AudioTx, CrfTx, VideoTx};
use crate::stream::{ChannelLayout, SampleFormat, SrClass, StreamState, TSpec, VideoFormat};
use crate::wire::MacAddr;
use crate::EngineContext;

/// How a stream's destination MAC address is obtained at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAssignMode {
    /// The caller supplies the exact MAC to use.
    Static(MacAddr),
    /// The engine assigns the next MAC from its preassigned MAAP-range
    /// pool and echoes it back through `&mut dmac`. Per §1 scope this core
    /// does not perform MAAP address allocation; it only echoes a
    /// preassigned range handed to it at startup.
    Auto,
}

/// Fixed MAAP-style multicast prefix streams are assigned from in `Auto`
/// mode, matching the example stream ids/dmacs used in spec.md's scenario
/// 1 (`91:e0:f0:00:...`).
const AUTO_MAC_PREFIX: [u8; 4] = [0x91, 0xe0, 0xf0, 0x00];

/// Registry of clock domains known to the engine, keyed by [`ClockId`].
/// Domains created statically at bootstrap (e.g. the gPTP wallclock
/// domain, id 0) and domains derived dynamically from an RX stream
/// (`derive_clock_from_rx`) share this table so `set_clock_recovery_params`
/// can resolve either by id.
#[derive(Default)]
pub struct ClockDomainRegistry {
    domains: RwLock<HashMap<ClockId, Arc<ClockDomain>>>,
}

impl ClockDomainRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: ClockId, domain: Arc<ClockDomain>) {
        self.domains.write().insert(id, domain);
    }

    #[must_use]
    pub fn get(&self, id: ClockId) -> Option<Arc<ClockDomain>> {
        self.domains.read().get(&id).cloned()
    }
}

/// Named PLL driver plugins registered with the engine. The driver itself
/// is loaded once at startup by the caller (dynamic loading of a shared
/// library is outside what Rust can do safely and is treated as an
/// external collaborator per §1); this registry just lets
/// `set_clock_recovery_params` look one up by the `driver_id` the
/// configuration assigned it.
#[derive(Default)]
pub struct PllDriverRegistry {
    drivers: RwLock<HashMap<u32, Arc<dyn PllDriver>>>,
}

impl PllDriverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, driver_id: u32, driver: Arc<dyn PllDriver>) {
        self.drivers.write().insert(driver_id, driver);
    }

    #[must_use]
    pub fn get(&self, driver_id: u32) -> Option<Arc<dyn PllDriver>> {
        self.drivers.read().get(&driver_id).cloned()
    }
}

/// The control-API facade, borrowed from [`EngineContext::control`].
/// Stateless beyond the MAC auto-assignment counter; everything else is
/// delegated to the engines/registries it holds references to.
pub struct ControlApi<'a> {
    ctx: &'a EngineContext,
    next_auto_mac: AtomicU16,
}

impl<'a> ControlApi<'a> {
    pub(crate) fn new(ctx: &'a EngineContext) -> Self {
        Self {
            ctx,
            next_auto_mac: AtomicU16::new(1),
        }
    }

    fn resolve_dmac(&self, mode: MacAssignMode) -> MacAddr {
        match mode {
            MacAssignMode::Static(mac) => mac,
            MacAssignMode::Auto => {
                let n = self.next_auto_mac.fetch_add(1, Ordering::Relaxed);
                let mut bytes = [0u8; 6];
                bytes[..4].copy_from_slice(&AUTO_MAC_PREFIX);
                bytes[4..].copy_from_slice(&n.to_be_bytes());
                MacAddr::new(bytes)
            }
        }
    }

    fn resolve_clock(&self, clock_id: ClockId) -> Result<Arc<ClockDomain>> {
        self.ctx
            .clocks
            .get(clock_id)
            .ok_or_else(|| Error::NotFound(format!("clock domain {clock_id:#x}")))
    }

    fn tspec_for(&self, class: SrClass) -> TSpec {
        self.ctx.tspec_for(class)
    }

    /// `create_tx_audio(sr_class, max_ch, sample_hz, fmt, clock_id,
    /// assign_mode, &mut id, &mut dmac, active, producer)`. `producer` is
    /// the local PCM source (e.g. an ALSA worker's ASRC output) wired into
    /// the stream before it is registered — once registered, an active TX
    /// stream's ownership passes to its sequencer thread and can no longer
    /// be reached for a later `connect` call (see [`Self::connect`]).
    ///
    /// # Errors
    /// [`Error::NotFound`] if `clock_id` is unregistered;
    /// [`Error::AlreadyInUse`] if `stream_id` is already registered;
    /// [`Error::NoSpaceLeft`] if activating would exceed the class's
    /// reserved bandwidth.
    #[allow(clippy::too_many_arguments)]
    pub fn create_tx_audio(
        &self,
        sr_class: SrClass,
        channels: u16,
        sample_hz: u32,
        fmt: SampleFormat,
        clock_id: ClockId,
        assign_mode: MacAssignMode,
        stream_id: u64,
        active: bool,
        producer: Option<RingConsumer>,
    ) -> Result<(u64, MacAddr)> {
        let clock = self.resolve_clock(clock_id)?;
        let dmac = self.resolve_dmac(assign_mode);
        let tspec = self.tspec_for(sr_class);
        let layout = self.ctx.channel_layout();
        let mut stream = AudioTx::new(stream_id, sr_class, dmac, tspec.clone(), clock, channels, sample_hz, fmt, layout);
        if let Some(producer) = producer {
            stream.connect_producer(producer);
        }
        let bandwidth_kbps = estimate_audio_bandwidth_kbps(channels, sample_hz, fmt, &tspec);
        self.ctx
            .tx_engine
            .create_stream(crate::stream::tx::TxStream::Audio(stream), bandwidth_kbps, tspec.max_frame_size, active)?;
        Ok((stream_id, dmac))
    }

    /// `create_rx_audio(sr_class, max_ch, sample_hz, id, dmac, preconfigured,
    /// consumer)`. `id == 0` registers a wildcard (discovery) stream;
    /// `preconfigured` is accepted for parity with the control API shape but
    /// does not change registration behavior (this core has no persisted-
    /// stream store across restarts). `consumer` is the local PCM sink this
    /// stream writes decoded audio into; pass `None` and wire it later via
    /// [`crate::rx_engine::RxEngine::connect_audio_sink`] if the local
    /// endpoint is not ready yet (RX streams, unlike TX, remain reachable
    /// for that after registration).
    ///
    /// # Errors
    /// [`Error::AlreadyInUse`] if `id` is already registered.
    #[allow(clippy::too_many_arguments)]
    pub fn create_rx_audio(
        &self,
        sr_class: SrClass,
        _max_ch: u16,
        _sample_hz: u32,
        stream_id: u64,
        dmac: MacAddr,
        ignore_stream_id: bool,
        layout: ChannelLayout,
        consumer: Option<RingProducer>,
    ) -> Result<u64> {
        let tspec = self.tspec_for(sr_class);
        let idle_wait_ns = self.ctx.idle_wait_ns();
        let mut stream = AudioRx::new(stream_id, sr_class, dmac, tspec, idle_wait_ns, ignore_stream_id, layout);
        if let Some(consumer) = consumer {
            stream.connect_consumer(consumer);
        }
        self.ctx.rx_engine.create_audio_stream(stream_id, ignore_stream_id, stream)
    }

    /// `create_tx_video(sr_class, max_pkt_rate, max_pkt_size, fmt,
    /// clock_id, assign_mode, &mut id, &mut dmac, active, producer)`; see
    /// [`Self::create_tx_audio`] for the `producer` wiring contract.
    ///
    /// # Errors
    /// Same as [`Self::create_tx_audio`].
    #[allow(clippy::too_many_arguments)]
    pub fn create_tx_video(
        &self,
        sr_class: SrClass,
        max_pkt_rate: u32,
        max_pkt_size: u16,
        fmt: VideoFormat,
        clock_id: ClockId,
        assign_mode: MacAssignMode,
        stream_id: u64,
        active: bool,
        producer: Option<RingConsumer>,
    ) -> Result<(u64, MacAddr)> {
        let clock = self.resolve_clock(clock_id)?;
        let dmac = self.resolve_dmac(assign_mode);
        let mut tspec = self.tspec_for(sr_class);
        tspec.max_frame_size = max_pkt_size;
        let mut stream = VideoTx::new(stream_id, sr_class, dmac, tspec, clock, fmt, max_pkt_size);
        if let Some(producer) = producer {
            stream.connect_producer(producer);
        }
        let bandwidth_kbps = estimate_video_bandwidth_kbps(max_pkt_rate, max_pkt_size);
        self.ctx
            .tx_engine
            .create_stream(crate::stream::tx::TxStream::Video(stream), bandwidth_kbps, max_pkt_size, active)?;
        Ok((stream_id, dmac))
    }

    /// `create_rx_video` — analogous to [`Self::create_rx_audio`]; see
    /// [`crate::rx_engine::RxEngine::connect_video_sink`] for late wiring.
    ///
    /// # Errors
    /// [`Error::AlreadyInUse`] if `stream_id` is already registered.
    pub fn create_rx_video(
        &self,
        sr_class: SrClass,
        stream_id: u64,
        dmac: MacAddr,
        ignore_stream_id: bool,
        consumer: Option<RingProducer>,
    ) -> Result<u64> {
        let tspec = self.tspec_for(sr_class);
        let idle_wait_ns = self.ctx.idle_wait_ns();
        let mut stream = VideoRx::new(stream_id, sr_class, dmac, tspec, idle_wait_ns, ignore_stream_id);
        if let Some(consumer) = consumer {
            stream.connect_consumer(consumer);
        }
        self.ctx.rx_engine.create_video_stream(stream_id, ignore_stream_id, stream)
    }

    /// `create_tx_crf` — analogous to [`Self::create_tx_audio`], with
    /// `events_per_packet` replacing the audio channel/rate pair.
    ///
    /// # Errors
    /// Same as [`Self::create_tx_audio`].
    pub fn create_tx_crf(
        &self,
        sr_class: SrClass,
        events_per_packet: u32,
        clock_id: ClockId,
        assign_mode: MacAssignMode,
        stream_id: u64,
        active: bool,
    ) -> Result<(u64, MacAddr)> {
        let clock = self.resolve_clock(clock_id)?;
        let dmac = self.resolve_dmac(assign_mode);
        let tspec = self.tspec_for(sr_class);
        let stream = CrfTx::new(stream_id, sr_class, dmac, tspec.clone(), clock, events_per_packet);
        // CRF packets carry only an 8-byte timestamp payload; bandwidth is
        // dominated by the common header plus that field.
        let bandwidth_kbps = estimate_crf_bandwidth_kbps(events_per_packet, &tspec);
        self.ctx
            .tx_engine
            .create_stream(crate::stream::tx::TxStream::Crf(stream), bandwidth_kbps, tspec.max_frame_size, active)?;
        Ok((stream_id, dmac))
    }

    /// `create_rx_crf` — analogous to [`Self::create_rx_audio`].
    ///
    /// # Errors
    /// [`Error::AlreadyInUse`] if `stream_id` is already registered.
    pub fn create_rx_crf(
        &self,
        sr_class: SrClass,
        stream_id: u64,
        dmac: MacAddr,
        ignore_stream_id: bool,
    ) -> Result<u64> {
        let tspec = self.tspec_for(sr_class);
        let idle_wait_ns = self.ctx.idle_wait_ns();
        let stream = CrfRx::new(stream_id, sr_class, dmac, tspec, idle_wait_ns, ignore_stream_id);
        self.ctx.rx_engine.create_crf_stream(stream_id, ignore_stream_id, stream)
    }

    /// Destroys a TX or RX stream by id/handle. Tries TX first, then RX,
    /// since the two id spaces are disjoint (RX handles for wildcard
    /// streams are synthesized above `1 << 63`, see `rx_engine`).
    ///
    /// # Errors
    /// [`Error::NotFound`] if neither engine knows the id;
    /// [`Error::AlreadyInUse`] if the (TX) stream is still active.
    pub fn destroy(&self, id: u64) -> Result<()> {
        match self.ctx.tx_engine.destroy(id) {
            Ok(()) => return Ok(()),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.ctx.rx_engine.destroy(id)
    }

    /// `set_active(id, bool)`. Deactivation is rejected for RX streams
    /// (they are always live once created, per §6); TX streams may be
    /// deactivated (removed from their sequencer) but per `engine::TxEngine`
    /// cannot be reactivated afterward.
    ///
    /// # Errors
    /// [`Error::NotSupported`] deactivating an RX stream or reactivating a
    /// previously-deactivated TX stream; [`Error::NotFound`] for an unknown
    /// id.
    pub fn set_active(&self, id: u64, active: bool) -> Result<()> {
        if self.ctx.rx_engine.state(id).is_some() {
            return if active {
                Ok(())
            } else {
                Err(Error::NotSupported("RX streams cannot be deactivated".into()))
            };
        }
        self.ctx.tx_engine.set_active(id, active)
    }

    /// `connect(avb_id, local_id)`: binds a local PCM/video ring to an AVB
    /// stream's producer (TX) or consumer (RX) side. This core wires that
    /// ring at stream-creation time instead (`create_tx_audio`/
    /// `create_rx_audio` and their video counterparts take the ring
    /// directly, built via [`crate::ringbuffer::channel`]; RX streams can
    /// additionally be wired later through
    /// [`crate::rx_engine::RxEngine::connect_audio_sink`] since, unlike TX
    /// streams, they remain reachable after registration). `local_id` has
    /// no meaning here as a result — recorded as an Open Question
    /// resolution in DESIGN.md.
    ///
    /// # Errors
    /// [`Error::NotSupported`] always, documenting the above.
    pub fn connect(&self, _avb_id: u64, _local_id: u64) -> Result<()> {
        Err(Error::NotSupported(
            "local endpoints are connected at stream-creation time; see DESIGN.md".into(),
        ))
    }

    /// `disconnect(avb_id)`; see [`Self::connect`].
    ///
    /// # Errors
    /// [`Error::NotSupported`] always.
    pub fn disconnect(&self, _avb_id: u64) -> Result<()> {
        Err(Error::NotSupported(
            "local endpoints are connected at stream-creation time; see DESIGN.md".into(),
        ))
    }

    /// `set_clock_recovery_params(master_clock_id, slave_clock_id,
    /// driver_id)`. Registers `driver_id`'s [`PllDriver`] as the slave
    /// clock's recovery sink; the master clock id is validated but not
    /// otherwise consulted (the slave domain's own filter already tracks
    /// its deviation from wallclock, which *is* the master in every
    /// topology this core supports — see DESIGN.md).
    ///
    /// # Errors
    /// [`Error::NotFound`] if either clock id or the driver id is
    /// unregistered.
    pub fn set_clock_recovery_params(
        &self,
        master_clock_id: ClockId,
        slave_clock_id: ClockId,
        driver_id: u32,
    ) -> Result<()> {
        self.resolve_clock(master_clock_id)?;
        let slave = self.resolve_clock(slave_clock_id)?;
        let driver = self
            .ctx
            .pll_drivers
            .get(driver_id)
            .ok_or_else(|| Error::NotFound(format!("PLL driver {driver_id:#x}")))?;
        slave.register_recovery_sink(driver_id, driver);
        Ok(())
    }

    /// `derive_clock_from_rx(rx_id, &mut clock_id)`: creates a new
    /// `RxStream`-kind clock domain anchored at the current gPTP time and
    /// registers it under a fresh id, for the caller to later feed via the
    /// owning RX stream's `CrfRx::last_sample_time_ns`/`ClockDomain::advance`.
    ///
    /// # Errors
    /// [`Error::NotFound`] if `rx_id` is not a registered RX stream.
    pub fn derive_clock_from_rx(&self, rx_id: u64) -> Result<ClockId> {
        if self.ctx.rx_engine.state(rx_id).is_none() {
            return Err(Error::NotFound(format!("rx stream {rx_id:#x}")));
        }
        let id = self.ctx.next_clock_id();
        let now = self.ctx.clock.local_time();
        let domain = Arc::new(ClockDomain::new(id, ClockKind::RxStream, now));
        self.ctx.clocks.insert(id, domain);
        Ok(id)
    }

    /// `register_event_listener(listener)`: at most one per engine context.
    ///
    /// # Errors
    /// [`Error::AlreadyInUse`] if a listener is already registered.
    pub fn register_event_listener(&self, listener: Arc<dyn EventListener>) -> Result<()> {
        self.ctx.events.register(listener)
    }

    #[must_use]
    pub fn stream_state(&self, id: u64) -> Option<StreamState> {
        self.ctx.rx_engine.state(id)
    }
}

/// AAF payload bytes per sample period: `channels * bytes_per_sample`,
/// scaled to a kbps rate by the class's nominal packet rate
/// (`1e9 / measurement_interval_ns`), plus the fixed AVTP common-header
/// overhead per packet.
fn estimate_audio_bandwidth_kbps(channels: u16, sample_hz: u32, fmt: SampleFormat, tspec: &TSpec) -> u32 {
    let samples_per_packet = (u64::from(sample_hz) * tspec.measurement_interval_ns / 1_000_000_000).max(1);
    let payload_bytes = samples_per_packet * u64::from(channels) * fmt.bytes_per_sample() as u64;
    let frame_bytes = payload_bytes + crate::wire::COMMON_HEADER_LEN as u64 + 18; // +Ethernet/VLAN overhead
    let packets_per_sec = 1_000_000_000u64 / tspec.measurement_interval_ns;
    ((frame_bytes * packets_per_sec * 8) / 1000) as u32
}

fn estimate_video_bandwidth_kbps(max_pkt_rate: u32, max_pkt_size: u16) -> u32 {
    (u64::from(max_pkt_rate) * u64::from(max_pkt_size) * 8 / 1000) as u32
}

fn estimate_crf_bandwidth_kbps(_events_per_packet: u32, tspec: &TSpec) -> u32 {
    let frame_bytes = crate::wire::COMMON_HEADER_LEN as u64 + 8 + 18;
    let packets_per_sec = 1_000_000_000u64 / tspec.measurement_interval_ns;
    ((frame_bytes * packets_per_sec * 8) / 1000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PTP_CLOCK_ID;
    use crate::gptp::testutil::SoftwarePtp;
    use crate::nic::testutil::SoftwareNic;
    use crate::packet::PacketPool;
    use crate::ringbuffer;

    fn context() -> EngineContext {
        let registry = Arc::new(crate::ConfigRegistry::new());
        let nic = Arc::new(SoftwareNic::default());
        let clock = Arc::new(SoftwarePtp::new(0));
        let pool = Arc::new(PacketPool::new(64));
        EngineContext::new(registry, nic, clock, pool)
    }

    #[test]
    fn create_tx_audio_wires_supplied_producer() {
        let ctx = context();
        let (_producer, consumer) = ringbuffer::channel(4096);
        let result = ctx.control().create_tx_audio(
            SrClass::High,
            2,
            48_000,
            SampleFormat::S16,
            PTP_CLOCK_ID,
            MacAssignMode::Auto,
            1,
            true,
            Some(consumer),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn create_rx_audio_without_consumer_still_registers() {
        let ctx = context();
        let result = ctx.control().create_rx_audio(
            SrClass::High,
            2,
            48_000,
            2,
            MacAddr::default(),
            false,
            ChannelLayout::Saf,
            None,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn connect_and_disconnect_are_not_supported() {
        let ctx = context();
        assert!(matches!(ctx.control().connect(1, 1), Err(Error::NotSupported(_))));
        assert!(matches!(ctx.control().disconnect(1), Err(Error::NotSupported(_))));
    }

    #[test]
    fn audio_bandwidth_estimate_is_nonzero() {
        let tspec = TSpec::for_class(SrClass::High);
        let kbps = estimate_audio_bandwidth_kbps(2, 48_000, SampleFormat::S16, &tspec);
        assert!(kbps > 0);
    }

    #[test]
    fn video_bandwidth_estimate_matches_simple_product() {
        assert_eq!(estimate_video_bandwidth_kbps(4000, 1400), 4000 * 1400 * 8 / 1000);
    }
}
