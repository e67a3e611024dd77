//! `EngineContext`: the composition root this core is built around (§9
//! REDESIGN FLAGS — no process-wide singleton/lazy-getter environment).
//! Constructed once by the caller (`avb-server`'s bootstrap module) from a
//! [`ConfigRegistry`], a NIC driver, and a gPTP clock; owns every other
//! long-lived component and is passed by reference to the control API.
//! Teardown follows reverse construction order via field-declaration-order
//! `Drop`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{ClockDomain, ClockKind};
use crate::control::{ClockDomainRegistry, ControlApi, PllDriverRegistry};
use crate::engine::TxEngine;
use crate::events::EventSlot;
use crate::gptp::GptpClock;
use crate::nic::NicDriver;
use crate::packet::PacketPool;
use crate::registry::{keys, ConfigRegistry};
use crate::rx_engine::RxEngine;
use crate::sequencer::SequencerConfig;
use crate::stream::{ChannelLayout, SrClass, TSpec};

/// Well-known id of the gPTP wallclock domain, always registered by
/// [`EngineContext::new`].
pub const PTP_CLOCK_ID: u32 = 0;

fn sequencer_config_for(class: SrClass, reg: &ConfigRegistry) -> SequencerConfig {
    let default = SequencerConfig::default();
    let bw_key = match class {
        SrClass::High => keys::TX_MAXBANDWIDTH_HIGH,
        SrClass::Low => keys::TX_MAXBANDWIDTH_LOW,
    };
    SequencerConfig {
        tx_window_width_ns: reg.get_u64(keys::XMIT_WINDOW_WIDTH, default.tx_window_width_ns).max(250_000),
        tx_window_pitch_ns: reg.get_u64(keys::XMIT_WINDOW_PITCH, default.tx_window_pitch_ns).max(125_000),
        tx_delay_ns: reg.get_u64(keys::TX_DELAY, default.tx_delay_ns),
        cue_threshold_ns: reg.get_u64(keys::XMIT_WINDOW_CUE_THRESHOLD, default.cue_threshold_ns),
        prefetch_threshold_ns: reg.get_u64(keys::XMIT_WINDOW_PREFETCH_THRESHOLD, default.prefetch_threshold_ns),
        max_reset_count: reg.get_u64(keys::XMIT_WINDOW_MAX_RESET_COUNT, u64::from(default.max_reset_count)) as u32,
        max_drop_count: reg.get_u64(keys::XMIT_WINDOW_MAX_DROP_COUNT, u64::from(default.max_drop_count)) as u32,
        max_tx_error_count: default.max_tx_error_count,
        max_bandwidth_kbps: reg.get_u64(bw_key, u64::from(default.max_bandwidth_kbps)) as u32,
        strict_pkt_order_en: reg.get_bool(keys::XMIT_STRICT_PKT_ORDER, default.strict_pkt_order_en),
    }
}

/// The single composition root. Owns the NIC handle, the gPTP clock, the
/// configuration registry, the event slot, every clock/PLL-driver
/// registry, the shared packet pool, and the TX/RX engines built on top of
/// them.
pub struct EngineContext {
    pub(crate) registry: Arc<ConfigRegistry>,
    pub(crate) clock: Arc<dyn GptpClock>,
    pub(crate) nic: Arc<dyn NicDriver>,
    pub(crate) events: Arc<EventSlot>,
    pub(crate) clocks: ClockDomainRegistry,
    pub(crate) pll_drivers: PllDriverRegistry,
    next_clock_id: AtomicU32,
    pub tx_engine: TxEngine,
    pub rx_engine: Arc<RxEngine>,
}

impl EngineContext {
    /// Builds the context: registers the gPTP wallclock as clock domain 0
    /// and constructs the TX/RX engines around the shared packet pool and
    /// NIC handle the caller already built (sequencer threads are started
    /// lazily on first stream, per `TxEngine`; the RX worker thread is
    /// started separately by the caller via `RxEngine::start_socket_mode`/
    /// `start_direct_dma_mode` once its streams are registered).
    ///
    /// `pool` and `nic` are taken already constructed, rather than this
    /// function allocating the pool itself, because a real `NicDriver`
    /// (e.g. `SocketNic`) reads packet bytes out of that same pool when
    /// transmitting — the caller must build the pool first, hand it to the
    /// NIC driver's constructor, and pass the same `Arc` here.
    #[must_use]
    pub fn new(
        registry: Arc<ConfigRegistry>,
        nic: Arc<dyn NicDriver>,
        clock: Arc<dyn GptpClock>,
        pool: Arc<PacketPool>,
    ) -> Self {
        let events = Arc::new(EventSlot::new());

        let high_config = sequencer_config_for(SrClass::High, &registry);
        let low_config = sequencer_config_for(SrClass::Low, &registry);
        let tx_engine = TxEngine::new(nic.clone(), clock.clone(), pool, events.clone(), high_config, low_config);

        let idle_wait_ns = registry.get_u64(keys::RECEIVE_IDLEWAIT, 200_000_000);
        let rx_engine = Arc::new(RxEngine::new(nic.clone(), events.clone(), Duration::from_nanos(idle_wait_ns)));

        let clocks = ClockDomainRegistry::new();
        clocks.insert(PTP_CLOCK_ID, Arc::new(ClockDomain::new(PTP_CLOCK_ID, ClockKind::Ptp, clock.local_time())));

        Self {
            registry,
            clock,
            nic,
            events,
            clocks,
            pll_drivers: PllDriverRegistry::new(),
            next_clock_id: AtomicU32::new(PTP_CLOCK_ID + 1),
            tx_engine,
            rx_engine,
        }
    }

    /// Returns the control-API facade over this context (§6).
    #[must_use]
    pub fn control(&self) -> ControlApi<'_> {
        ControlApi::new(self)
    }

    #[must_use]
    pub fn registry(&self) -> &ConfigRegistry {
        &self.registry
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventSlot> {
        &self.events
    }

    #[must_use]
    pub fn clock_domain(&self, id: crate::clock::ClockId) -> Option<Arc<ClockDomain>> {
        self.clocks.get(id)
    }

    /// Registers a clock domain other than the wallclock under a known id
    /// (e.g. the `HwCapture` domain bootstrap wires up before any stream
    /// references it).
    pub fn register_clock_domain(&self, id: crate::clock::ClockId, domain: Arc<ClockDomain>) {
        self.clocks.insert(id, domain);
    }

    /// Registers a PLL driver plugin instance under the `driver_id` the
    /// configuration assigned it, so `set_clock_recovery_params` can find
    /// it later.
    pub fn register_pll_driver(&self, driver_id: u32, driver: Arc<dyn crate::clock::PllDriver>) {
        self.pll_drivers.register(driver_id, driver);
    }

    pub(crate) fn next_clock_id(&self) -> crate::clock::ClockId {
        self.next_clock_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn tspec_for(&self, class: SrClass) -> TSpec {
        let (interval_key, vlanid_key, vlanprio_key, offset_key, frame_len_key) = match class {
            SrClass::High => (
                keys::TSPEC_INTERVAL_HIGH,
                keys::TSPEC_VLANID_HIGH,
                keys::TSPEC_VLANPRIO_HIGH,
                keys::TSPEC_PRES_OFFSET_HIGH,
                keys::TX_MAXFRAMELENGTH_HIGH,
            ),
            SrClass::Low => (
                keys::TSPEC_INTERVAL_LOW,
                keys::TSPEC_VLANID_LOW,
                keys::TSPEC_VLANPRIO_LOW,
                keys::TSPEC_PRES_OFFSET_LOW,
                keys::TX_MAXFRAMELENGTH_LOW,
            ),
        };
        let default = TSpec::for_class(class);
        TSpec {
            measurement_interval_ns: self.registry.get_u64(interval_key, default.measurement_interval_ns),
            max_frame_size: self.registry.get_u64(frame_len_key, u64::from(default.max_frame_size)) as u16,
            frames_per_interval: default.frames_per_interval,
            vlan_id: self.registry.get_u64(vlanid_key, u64::from(default.vlan_id)) as u16,
            vlan_prio: self.registry.get_u64(vlanprio_key, u64::from(default.vlan_prio)) as u8,
            presentation_offset_ns: self.registry.get_u64(offset_key, default.presentation_offset_ns),
        }
    }

    pub(crate) fn idle_wait_ns(&self) -> u64 {
        self.registry.get_u64(keys::RECEIVE_IDLEWAIT, 200_000_000)
    }

    pub(crate) fn channel_layout(&self) -> ChannelLayout {
        match self.registry.get_str(keys::COMPATIBILITY_AUDIO, "SAF").as_str() {
            "legacy" => ChannelLayout::Legacy,
            _ => ChannelLayout::Saf,
        }
    }

    /// Cascades a link-state transition into the TX engine (which
    /// propagates to every sequencer) and fires the listener exactly once
    /// per actual transition.
    pub fn update_link_status(&self, up: bool) {
        self.tx_engine.update_link_status(up);
    }

    /// Stops the TX sequencer threads and the RX worker thread, joining
    /// each cooperatively. Bounded by one window pitch / one idle-wait
    /// interval respectively.
    pub fn shutdown(&self) {
        self.rx_engine.shutdown();
        self.tx_engine.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gptp::testutil::SoftwarePtp;
    use crate::nic::testutil::SoftwareNic;

    fn context() -> EngineContext {
        let registry = Arc::new(ConfigRegistry::new());
        let nic = Arc::new(SoftwareNic::default());
        let clock = Arc::new(SoftwarePtp::new(0));
        let pool = Arc::new(PacketPool::new(64));
        EngineContext::new(registry, nic, clock, pool)
    }

    #[test]
    fn ptp_clock_domain_is_registered_at_construction() {
        let ctx = context();
        assert!(ctx.clock_domain(PTP_CLOCK_ID).is_some());
    }

    #[test]
    fn sequencer_config_reads_registry_overrides() {
        let registry = Arc::new(ConfigRegistry::new());
        registry.set(keys::TX_MAXBANDWIDTH_HIGH, 12_345u64);
        let cfg = sequencer_config_for(SrClass::High, &registry);
        assert_eq!(cfg.max_bandwidth_kbps, 12_345);
    }

    #[test]
    fn tspec_for_falls_back_to_class_defaults() {
        let ctx = context();
        let tspec = ctx.tspec_for(SrClass::Low);
        assert_eq!(tspec.measurement_interval_ns, SrClass::Low.default_interval_ns());
    }
}
