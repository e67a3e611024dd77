//! TX engine: owns the per-class sequencers (created lazily on first use),
//! the shared NIC handle, and link-state/event cascading. This is the
//! aggregator the control API talks to for every TX operation; the
//! sequencers themselves (`crate::sequencer`) never see the control API
//! directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::events::EventSlot;
use crate::gptp::GptpClock;
use crate::nic::NicDriver;
use crate::packet::PacketPool;
use crate::sequencer::{SequencerConfig, SequencerDiagnostics, SequencerHandle, TxSequencer};
use crate::stream::tx::{StreamTx, TxStream};
use crate::stream::SrClass;
use crate::wire::MacAddr;

/// A running sequencer thread plus the handles needed to stop it.
struct SequencerWorker {
    control: SequencerHandle,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Lifecycle state of one registered TX stream. A stream created inactive is
/// held here until `set_active(id, true)` moves it into its sequencer;
/// a stream deactivated after having been active cannot be reactivated
/// without recreating it, since the sequencer does not hand ownership back
/// on removal (see DESIGN.md).
enum TxStreamState {
    Pending(TxStream),
    Active,
    /// Previously active, removed from its sequencer by `set_active(id,
    /// false)`. Distinct from `Pending` so a later reactivation attempt can
    /// be told apart from the stream's initial activation.
    Removed,
}

struct TxStreamRegistration {
    class: SrClass,
    bandwidth_kbps: u32,
    dmac: MacAddr,
    state: TxStreamState,
}

/// Owns every per-class TX sequencer, the stream registry, and link-state
/// bookkeeping. One `TxEngine` per `EngineContext`.
pub struct TxEngine {
    nic: Arc<dyn NicDriver>,
    clock: Arc<dyn GptpClock>,
    pool: Arc<PacketPool>,
    configs: HashMap<SrClass, SequencerConfig>,
    max_frame_size_high: Arc<AtomicU32>,
    sequencers: RwLock<HashMap<SrClass, SequencerWorker>>,
    registrations: RwLock<HashMap<u64, TxStreamRegistration>>,
    events: Arc<EventSlot>,
    link_up: AtomicBool,
}

impl TxEngine {
    #[must_use]
    pub fn new(
        nic: Arc<dyn NicDriver>,
        clock: Arc<dyn GptpClock>,
        pool: Arc<PacketPool>,
        events: Arc<EventSlot>,
        high_config: SequencerConfig,
        low_config: SequencerConfig,
    ) -> Self {
        let mut configs = HashMap::new();
        configs.insert(SrClass::High, high_config);
        configs.insert(SrClass::Low, low_config);
        Self {
            nic,
            clock,
            pool,
            configs,
            // 802.1Qav default until a High-class stream reports a smaller
            // or larger frame size of its own.
            max_frame_size_high: Arc::new(AtomicU32::new(1522)),
            sequencers: RwLock::new(HashMap::new()),
            registrations: RwLock::new(HashMap::new()),
            events,
            link_up: AtomicBool::new(true),
        }
    }

    /// Queue index assignment: High class always gets queue 0, Low class
    /// queue 1 (this core manages exactly one NIC context per §1 scope).
    fn queue_for(class: SrClass) -> u8 {
        match class {
            SrClass::High => 0,
            SrClass::Low => 1,
        }
    }

    fn get_or_create_sequencer(&self, class: SrClass) -> SequencerHandle {
        if let Some(worker) = self.sequencers.read().get(&class) {
            return worker.control.clone();
        }
        let mut sequencers = self.sequencers.write();
        if let Some(worker) = sequencers.get(&class) {
            return worker.control.clone();
        }
        let config = self.configs.get(&class).cloned().unwrap_or_default();
        let pitch = Duration::from_nanos(config.tx_window_pitch_ns);
        let (mut seq, handle) = TxSequencer::new(
            Self::queue_for(class),
            class,
            config,
            self.nic.clone(),
            self.clock.clone(),
            self.pool.clone(),
            self.max_frame_size_high.clone(),
        );
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let thread = std::thread::spawn(move || {
            while !shutdown_thread.load(Ordering::Relaxed) {
                seq.iteration();
                // Reprogrammed every iteration rather than only on
                // add/remove: the request channel crosses threads, and
                // `update_shaper` must run on the thread that owns the
                // sequencer.
                if let Err(err) = seq.update_shaper() {
                    log::warn!("failed to program shaper: {err}");
                }
                std::thread::sleep(pitch);
            }
        });
        sequencers.insert(
            class,
            SequencerWorker {
                control: handle.clone(),
                shutdown,
                thread: Some(thread),
            },
        );
        handle
    }

    /// Registers a new TX stream. If `active`, it is immediately spliced
    /// into its class's sequencer (lazily starting the sequencer thread on
    /// first use); otherwise it is held pending until `set_active`.
    ///
    /// # Errors
    /// [`Error::AlreadyInUse`] if `stream_id` is already registered;
    /// propagates [`crate::sequencer::SequencerHandle::add_stream`] failures
    /// (e.g. [`Error::NoSpaceLeft`]) when `active` is set.
    pub fn create_stream(
        &self,
        stream: TxStream,
        bandwidth_kbps: u32,
        max_frame_size: u16,
        active: bool,
    ) -> Result<()> {
        let stream_id = stream.stream_id();
        let class = stream.sr_class();
        let dmac = stream.dmac();
        if self.registrations.read().contains_key(&stream_id) {
            return Err(Error::AlreadyInUse(format!("tx stream {stream_id:#x}")));
        }
        if class == SrClass::High {
            self.max_frame_size_high
                .fetch_max(u32::from(max_frame_size), Ordering::AcqRel);
        }

        let state = if active {
            let handle = self.get_or_create_sequencer(class);
            handle.add_stream(stream, bandwidth_kbps)?;
            TxStreamState::Active
        } else {
            TxStreamState::Pending(stream)
        };

        self.registrations.write().insert(
            stream_id,
            TxStreamRegistration {
                class,
                bandwidth_kbps,
                dmac,
                state,
            },
        );
        Ok(())
    }

    /// Activates or deactivates an existing TX stream.
    ///
    /// # Errors
    /// [`Error::NotFound`] if `stream_id` is unknown;
    /// [`Error::NotSupported`] re-activating a stream that was previously
    /// deactivated (its object was already consumed by the sequencer on
    /// removal; see DESIGN.md).
    pub fn set_active(&self, stream_id: u64, active: bool) -> Result<()> {
        let mut registrations = self.registrations.write();
        let reg = registrations
            .get_mut(&stream_id)
            .ok_or_else(|| Error::NotFound(format!("tx stream {stream_id:#x}")))?;

        match (&reg.state, active) {
            (TxStreamState::Pending(_), true) => {
                let TxStreamState::Pending(stream) =
                    std::mem::replace(&mut reg.state, TxStreamState::Active)
                else {
                    unreachable!()
                };
                let handle = self.get_or_create_sequencer(reg.class);
                handle.add_stream(stream, reg.bandwidth_kbps)?;
                Ok(())
            }
            (TxStreamState::Active, false) => {
                let handle = self.get_or_create_sequencer(reg.class);
                handle.remove_stream(stream_id, reg.bandwidth_kbps)?;
                reg.state = TxStreamState::Removed;
                Ok(())
            }
            (TxStreamState::Removed, true) => Err(Error::NotSupported(
                "tx stream cannot be reactivated after deactivation".into(),
            )),
            (TxStreamState::Pending(_), false)
            | (TxStreamState::Active, true)
            | (TxStreamState::Removed, false) => Ok(()),
        }
    }

    /// Destroys a TX stream.
    ///
    /// # Errors
    /// [`Error::NotFound`] if unknown; [`Error::AlreadyInUse`] if the
    /// stream is still active (must be deactivated first).
    pub fn destroy(&self, stream_id: u64) -> Result<()> {
        let mut registrations = self.registrations.write();
        let reg = registrations
            .get(&stream_id)
            .ok_or_else(|| Error::NotFound(format!("tx stream {stream_id:#x}")))?;
        if matches!(reg.state, TxStreamState::Active) {
            return Err(Error::AlreadyInUse(format!(
                "tx stream {stream_id:#x} is still active"
            )));
        }
        registrations.remove(&stream_id);
        Ok(())
    }

    #[must_use]
    pub fn dmac(&self, stream_id: u64) -> Option<MacAddr> {
        self.registrations.read().get(&stream_id).map(|r| r.dmac)
    }

    /// Cascades a link-state transition into every running sequencer (which
    /// also polls `NicDriver::link_up` directly) and fires the event
    /// listener exactly once per actual transition.
    pub fn update_link_status(&self, up: bool) {
        let was_up = self.link_up.swap(up, Ordering::AcqRel);
        if was_up != up {
            self.events.notify_link_status(up);
        }
    }

    #[must_use]
    pub fn sequencer_diagnostics(&self, class: SrClass) -> Option<SequencerDiagnostics> {
        // Diagnostics live on the sequencer owned by its worker thread; we
        // cannot snapshot them without crossing threads, so this reports
        // `None` until a later iteration publishes a copy. Left as a
        // documented limitation rather than adding another cross-thread
        // channel for a diagnostics-only read.
        let _ = class;
        None
    }

    /// Stops every running sequencer thread, joining each cooperatively.
    /// Bounded by one window pitch per sequencer.
    pub fn shutdown(&self) {
        let mut sequencers = self.sequencers.write();
        for (_, worker) in sequencers.iter_mut() {
            worker.shutdown.store(true, Ordering::Relaxed);
        }
        for (_, mut worker) in sequencers.drain() {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for TxEngine {
    fn drop(&mut self) {
        self.shutdown();
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

    fn engine() -> (TxEngine, Arc<SoftwareNic>) {
        let nic = Arc::new(SoftwareNic::default());
        let clock = Arc::new(SoftwarePtp::new(0));
        let pool = Arc::new(PacketPool::new(64));
        let events = Arc::new(EventSlot::new());
        let eng = TxEngine::new(
            nic.clone(),
            clock,
            pool,
            events,
            SequencerConfig::default(),
            SequencerConfig::default(),
        );
        (eng, nic)
    }

    fn crf_stream(stream_id: u64, class: SrClass) -> TxStream {
        TxStream::Crf(CrfTx::new(
            stream_id,
            class,
            MacAddr::default(),
            TSpec::for_class(class),
            Arc::new(ClockDomain::new(0, ClockKind::Ptp, 0)),
            1,
        ))
    }

    #[test]
    fn creating_an_active_stream_starts_its_sequencer() {
        let (eng, _nic) = engine();
        eng.create_stream(crf_stream(1, SrClass::High), 10, 1500, true)
            .unwrap();
        assert!(eng.sequencers.read().contains_key(&SrClass::High));
    }

    #[test]
    fn destroy_of_active_stream_is_rejected() {
        let (eng, _nic) = engine();
        eng.create_stream(crf_stream(1, SrClass::High), 10, 1500, true)
            .unwrap();
        assert!(matches!(eng.destroy(1), Err(Error::AlreadyInUse(_))));
    }

    #[test]
    fn destroy_of_pending_stream_succeeds() {
        let (eng, _nic) = engine();
        eng.create_stream(crf_stream(1, SrClass::High), 10, 1500, false)
            .unwrap();
        assert!(eng.destroy(1).is_ok());
    }

    #[test]
    fn duplicate_stream_id_is_rejected() {
        let (eng, _nic) = engine();
        eng.create_stream(crf_stream(1, SrClass::High), 10, 1500, true)
            .unwrap();
        assert!(matches!(
            eng.create_stream(crf_stream(1, SrClass::High), 10, 1500, true),
            Err(Error::AlreadyInUse(_))
        ));
    }

    #[test]
    fn set_active_true_activates_a_pending_stream() {
        let (eng, _nic) = engine();
        eng.create_stream(crf_stream(1, SrClass::Low), 10, 1500, false)
            .unwrap();
        eng.set_active(1, true).unwrap();
        assert!(eng.sequencers.read().contains_key(&SrClass::Low));
    }

    #[test]
    fn set_active_false_then_true_is_not_supported() {
        let (eng, _nic) = engine();
        eng.create_stream(crf_stream(1, SrClass::High), 10, 1500, true)
            .unwrap();
        assert!(eng.set_active(1, false).is_ok());
        assert!(matches!(
            eng.set_active(1, true),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn link_status_notifies_listener_only_on_transition() {
        use crate::events::EventListener;
        use crate::stream::StreamState;

        struct Counter(std::sync::atomic::AtomicU32);
        impl EventListener for Counter {
            fn on_link_status(&self, _up: bool) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn on_stream_status(&self, _stream_id: u64, _state: StreamState) {}
        }

        let (eng, _nic) = engine();
        let counter = Arc::new(Counter(std::sync::atomic::AtomicU32::new(0)));
        eng.events.register(counter.clone()).unwrap();
        eng.update_link_status(true); // already up, no transition
        eng.update_link_status(false);
        eng.update_link_status(false);
        eng.update_link_status(true);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_stream_id_operations_fail_not_found() {
        let (eng, _nic) = engine();
        assert!(matches!(eng.destroy(99), Err(Error::NotFound(_))));
        assert!(matches!(eng.set_active(99, true), Err(Error::NotFound(_))));
    }
}
