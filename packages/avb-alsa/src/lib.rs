//! ALSA platform binding for avb-core: the worker thread that bridges a
//! physical sound card to an AVB audio stream's ring buffer, the ASRC
//! buffer and Farrow resampler it uses to track the two independent clock
//! domains, and the format conversion between raw PCM bytes and the
//! resampler's `f32` working domain.
//!
//! This crate is the platform-specific counterpart to `avb-core`: the core
//! crate knows nothing about ALSA, and this crate knows nothing about
//! IEEE 1722 wire formats — the two meet only at the [`avb_core::ringbuffer`]
//! SPSC byte ring each [`worker::AlsaWorker`] shares with a stream object.

#![warn(clippy::all)]
#![cfg(unix)]

pub mod asrc;
pub mod farrow;
pub mod pcm;
pub mod worker;

pub use asrc::{AsrcBuffer, SideTimestamp};
pub use farrow::{FarrowResampler, TransferResult};
pub use worker::{AlsaWorker, AlsaWorkerConfig, AlsaWorkerError, Direction, WorkerEndpoint};
