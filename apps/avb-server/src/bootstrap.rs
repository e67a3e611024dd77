//! Composition root: turns a loaded [`DaemonConfig`] into a running
//! [`EngineContext`] with its RX worker started, mirroring the shape of
//! `avb_core::context` tests but wired to real Linux networking instead of
//! the software test doubles.

use std::sync::Arc;

use anyhow::{Context, Result};
use avb_core::packet::PacketPool;
use avb_core::{EngineContext, MonotonicClock};

use crate::config::DaemonConfig;

/// Everything the running daemon owns: the engine context plus any ALSA
/// worker threads bridging it to local sound cards.
pub struct Daemon {
    pub ctx: Arc<EngineContext>,
    #[cfg(feature = "alsa")]
    alsa_workers: Vec<avb_alsa::AlsaWorker>,
}

impl Daemon {
    pub fn shutdown(&self) {
        self.ctx.shutdown();
    }
}

/// Builds the [`EngineContext`] for `config`: opens the raw-socket NIC
/// driver on `config.interface`, starts the RX engine in socket mode (or
/// direct-DMA mode if configured), and registers the gPTP wallclock.
///
/// Real i210-class hardware with a register-level driver, or a hardware
/// PTP clock shared-memory reader, would replace [`avb_core::SocketNic`]/
/// [`MonotonicClock`] here without any other change to this function —
/// that is the seam `avb-core`'s `NicDriver`/`GptpClock` traits exist for.
#[cfg(target_os = "linux")]
pub fn bootstrap(config: &DaemonConfig) -> Result<Daemon> {
    let registry = Arc::new(config.to_registry());
    let pool = Arc::new(PacketPool::new(config.packet_pool_capacity));

    let nic = Arc::new(
        avb_core::SocketNic::open(&config.interface, pool.clone())
            .with_context(|| format!("failed to open NIC on interface {}", config.interface))?,
    );
    let clock: Arc<dyn avb_core::GptpClock> = Arc::new(MonotonicClock::new());

    let ctx = Arc::new(EngineContext::new(registry, nic, clock, pool));

    if config.rx_direct_dma {
        ctx.rx_engine.start_direct_dma_mode();
    } else {
        let ingress = avb_core::ingress::RawSocketIngress::bind(&config.interface)
            .with_context(|| format!("failed to bind RX socket on interface {}", config.interface))?;
        ctx.rx_engine.start_socket_mode(Box::new(ingress));
    }

    log::info!(
        "engine context ready on interface {} (pool capacity {})",
        config.interface,
        config.packet_pool_capacity
    );

    Ok(Daemon {
        ctx,
        #[cfg(feature = "alsa")]
        alsa_workers: Vec::new(),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn bootstrap(_config: &DaemonConfig) -> Result<Daemon> {
    anyhow::bail!("avb-server requires Linux (AF_PACKET raw sockets, ALSA)")
}

/// Registers a PCM device as the local endpoint of an already-created
/// audio stream, spawning its [`avb_alsa::AlsaWorker`] thread. Call after
/// creating the stream through [`EngineContext::control`] but before
/// activating it, passing the matching half of the ring the stream was
/// constructed with.
#[cfg(feature = "alsa")]
pub fn attach_alsa_worker(
    daemon: &mut Daemon,
    worker_config: avb_alsa::AlsaWorkerConfig,
    endpoint: avb_alsa::WorkerEndpoint,
) -> Result<()> {
    let clock: Arc<dyn avb_core::GptpClock> = Arc::new(MonotonicClock::new());
    let worker = avb_alsa::AlsaWorker::spawn(worker_config, clock, endpoint)
        .context("failed to start ALSA worker")?;
    daemon.alsa_workers.push(worker);
    Ok(())
}
