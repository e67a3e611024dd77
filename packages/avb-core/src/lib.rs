//! avb-core - the engine of a userspace AVB (IEEE 1722) stream handler.
//!
//! This crate provides the transport- and platform-independent core of an
//! AVB stream handler daemon: a packet pool, per-1722-subtype stream
//! objects, clock domains, the credit-based-shaper TX sequencer, the TX/RX
//! engines, the control API and the configuration registry. It is designed
//! to be used by a headless server binary (`avb-server`) together with a
//! platform-specific ALSA worker (`avb-alsa`).
//!
//! # Architecture
//!
//! - [`packet`]: fixed-size, refcount-free packet pool
//! - [`wire`]: IEEE 1722/1722a AVTP common-header encode/decode
//! - [`stream`]: per-subtype TX/RX stream objects (AAF/CVF/CRF)
//! - [`clock`]: clock-domain rate-ratio estimator and lock-state machine
//! - [`sequencer`]: per-class TX sequencer (launch-time multiplexer, shaper)
//! - [`engine`]: TX engine (owns sequencers, stream registry, link state)
//! - [`rx_engine`]: RX engine (ingress worker, demux, state machine)
//! - [`control`]: the synchronous control API facade (§6)
//! - [`context`]: [`EngineContext`], the composition root
//! - [`registry`]: key-value configuration store
//! - [`events`]: single-subscriber event interface
//! - [`error`]: unified error taxonomy
//! - [`nic`]: NIC driver trait boundary (+ software test double)
//! - [`gptp`]: gPTP wallclock trait boundary (+ software test double)
//! - [`ingress`]: raw-socket RX ingress (socket mode)
//! - [`ringbuffer`]: SPSC byte ring connecting local endpoints to streams
//!
//! # Abstraction traits
//!
//! [`nic::NicDriver`], [`gptp::GptpClock`], [`ingress::RxIngress`] and
//! [`clock::PllDriver`] decouple the core from the i210-class hardware, the
//! gPTP daemon, and any PLL driver plugin it drives; each has a software
//! double under `#[cfg(test)]` so the engine's testable properties (§8) can
//! be exercised without real hardware.

#![warn(clippy::all)]

pub mod clock;
pub mod context;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod gptp;
pub mod ingress;
pub mod nic;
pub mod nic_socket;
pub mod packet;
pub mod registry;
pub mod ringbuffer;
pub mod rx_engine;
pub mod sequencer;
pub mod stream;
pub mod wire;

pub use context::EngineContext;
pub use control::{ControlApi, MacAssignMode};
pub use engine::TxEngine;
pub use error::{Error, Result};
pub use events::{EventListener, EventSlot};
#[cfg(target_os = "linux")]
pub use gptp::MonotonicClock;
pub use gptp::GptpClock;
pub use registry::{keys, ConfigRegistry, RegistryValue};
pub use rx_engine::RxEngine;
#[cfg(target_os = "linux")]
pub use nic_socket::SocketNic;
pub use stream::{ChannelLayout, SampleFormat, SrClass, StreamState, TSpec, VideoFormat};
pub use wire::MacAddr;
