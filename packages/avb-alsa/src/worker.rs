//! The realtime ALSA worker thread: owns one physical ALSA PCM device, one
//! [`AsrcBuffer`] shared with an AVB audio stream, and a [`FarrowResampler`]
//! bridging the two clock domains.
//!
//! Grounded on `original_source`'s `IasAlsaHandlerWorkerThread` (startup
//! phase / main loop / underrun fallback) and `RustAudio-cpal`'s ALSA
//! backend (`src/host/alsa/mod.rs`) for idiomatic `alsa` crate hw_params
//! setup and cross-stamping via `PCM::status().htstamp()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alsa::pcm::{Access, Format, HwParams, State, PCM};
use alsa::{Direction as AlsaIoDirection, ValueOr};
use avb_core::{GptpClock, SampleFormat};
use thiserror::Error;

use crate::asrc::AsrcBuffer;
use crate::farrow::FarrowResampler;
use crate::pcm;

/// Direction a worker moves frames: `Capture` reads the ALSA device and
/// pushes into the shared ring for a TX stream; `Playback` reads the
/// shared ring (fed by an RX stream) and writes the ALSA device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Capture,
    Playback,
}

#[derive(Debug, Error)]
pub enum AlsaWorkerError {
    #[error("ALSA error: {0}")]
    Alsa(#[from] alsa::Error),
    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u32),
}

pub struct AlsaWorkerConfig {
    pub device: String,
    pub direction: Direction,
    pub channels: u32,
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub period_size: usize,
    pub num_periods: usize,
}

/// Closed-loop ratio controller: drives the Farrow resampler's ratio to
/// pull `numTotalFrames` toward the ASRC buffer's target fill level.
struct SrcController {
    kp: f64,
    ki: f64,
    integral: f64,
}

impl SrcController {
    fn new() -> Self {
        Self {
            kp: 1.0e-6,
            ki: 1.0e-8,
            integral: 0.0,
        }
    }

    fn reset(&mut self) {
        self.integral = 0.0;
    }

    /// `error` is `numTotalFrames - target_level`, in frames. Returns an
    /// adaptive ratio clamped close to 1.0.
    fn update(&mut self, error: f64) -> f64 {
        self.integral += error;
        let ratio = 1.0 + self.kp * error + self.ki * self.integral;
        ratio.clamp(0.995, 1.005)
    }
}

enum LocalEndpoint {
    Capture(avb_core::ringbuffer::RingProducer),
    Playback(avb_core::ringbuffer::RingConsumer),
}

/// Handle to a running worker; dropping it requests shutdown and joins the
/// thread.
pub struct AlsaWorker {
    shutdown: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AlsaWorker {
    /// Opens `config.device`, configures hw params, and spawns the worker
    /// thread. `endpoint` is the local-side ring connected to the AVB
    /// stream object (`RingProducer` for capture, `RingConsumer` for
    /// playback — the opposite end the stream itself holds).
    ///
    /// # Errors
    /// [`AlsaWorkerError`] if the device cannot be opened or configured.
    pub fn spawn(
        config: AlsaWorkerConfig,
        clock: Arc<dyn GptpClock>,
        endpoint: WorkerEndpoint,
    ) -> Result<Self, AlsaWorkerError> {
        let pcm = open_pcm(&config)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let local = match endpoint {
            WorkerEndpoint::Capture(p) => LocalEndpoint::Capture(p),
            WorkerEndpoint::Playback(c) => LocalEndpoint::Playback(c),
        };

        let thread = std::thread::Builder::new()
            .name(format!("avb-alsa-{}", config.device))
            .spawn(move || run(pcm, config, clock, local, thread_shutdown))
            .expect("failed to spawn ALSA worker thread");

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for AlsaWorker {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The local-side ring half passed to [`AlsaWorker::spawn`], opposite of
/// whatever the AVB stream object holds.
pub enum WorkerEndpoint {
    Capture(avb_core::ringbuffer::RingProducer),
    Playback(avb_core::ringbuffer::RingConsumer),
}

fn alsa_format(format: SampleFormat) -> Format {
    if cfg!(target_endian = "big") {
        match format {
            SampleFormat::S16 => Format::S16BE,
            SampleFormat::S32 => Format::S32BE,
            SampleFormat::F32 => Format::FloatBE,
        }
    } else {
        match format {
            SampleFormat::S16 => Format::S16LE,
            SampleFormat::S32 => Format::S32LE,
            SampleFormat::F32 => Format::FloatLE,
        }
    }
}

fn open_pcm(config: &AlsaWorkerConfig) -> Result<PCM, AlsaWorkerError> {
    if config.channels == 0 {
        return Err(AlsaWorkerError::UnsupportedChannels(config.channels));
    }
    let io_direction = match config.direction {
        Direction::Capture => AlsaIoDirection::Capture,
        Direction::Playback => AlsaIoDirection::Playback,
    };
    let pcm = PCM::new(&config.device, io_direction, false)?;
    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(alsa_format(config.format))?;
        hwp.set_rate(config.sample_rate, ValueOr::Nearest)?;
        hwp.set_channels(config.channels)?;
        hwp.set_period_size(config.period_size as alsa::pcm::Frames, ValueOr::Nearest)?;
        hwp.set_periods(config.num_periods as u32, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }
    pcm.prepare()?;
    Ok(pcm)
}

const STARTUP_MIN_PERIODS: u32 = 4;

fn run(
    pcm: PCM,
    config: AlsaWorkerConfig,
    clock: Arc<dyn GptpClock>,
    mut local: LocalEndpoint,
    shutdown: Arc<AtomicBool>,
) {
    let channels = config.channels as usize;
    let period_size = config.period_size;
    let mut asrc = AsrcBuffer::new(channels, period_size, config.num_periods);
    let mut resampler = FarrowResampler::new(channels);
    let mut controller = SrcController::new();

    let mut device_buf = vec![0.0f32; period_size * channels];
    let mut transfer_buf = vec![0.0f32; period_size * channels];
    let mut byte_buf = vec![0u8; period_size * channels * config.format.bytes_per_sample()];

    let mut periods_transferred: u32 = 0;
    let mut startup = true;
    let mut prev_total_frames: i64 = asrc.target_fill_frames() as i64;
    let mut local_frames_total: u64 = 0;
    let mut remote_frames_total: u64 = 0;

    asrc.prefill_silence(asrc.target_fill_frames());

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        if wait_for_period(&pcm).is_err() {
            continue;
        }

        let device_ts_ns = cross_stamp(&pcm, &clock);
        let remote_frames = pump_local_endpoint(&mut local, &mut asrc, &config, &mut byte_buf);
        remote_frames_total += remote_frames as u64;
        asrc.remote = crate::asrc::SideTimestamp {
            transmitted_frames: remote_frames_total,
            timestamp_ns: clock.local_time(),
        };

        let buffer_difftime_ns = asrc.buffer_difftime_ns(device_ts_ns);
        let num_virtual_frames =
            (buffer_difftime_ns * i64::from(config.sample_rate) / 1_000_000_000).max(0) as usize;
        let num_total_frames = asrc.available_frames() as i64 + num_virtual_frames as i64;

        let jump = (num_total_frames - prev_total_frames).abs();
        let valid = jump <= (period_size as i64 / 4);
        prev_total_frames = num_total_frames;

        let ratio = if valid && !startup {
            let error = (num_total_frames - asrc.target_fill_frames() as i64) as f64;
            controller.update(error)
        } else {
            1.0
        };

        let produced = match config.direction {
            Direction::Playback => {
                let available = asrc.read_frames(&mut transfer_buf[..period_size * channels]);
                let result = resampler.process_pull_mode(
                    &transfer_buf[..available * channels],
                    ratio,
                    &mut device_buf[..period_size * channels],
                );
                write_device(&pcm, &device_buf[..period_size * channels], &config);
                result.produced_frames
            }
            Direction::Capture => {
                let captured = read_device(&pcm, &mut device_buf[..period_size * channels], &config);
                let result = resampler.process_push_mode(
                    &device_buf[..captured * channels],
                    ratio,
                    &mut transfer_buf[..period_size * channels],
                );
                asrc.write_frames(&transfer_buf[..result.produced_frames * channels]);
                result.produced_frames
            }
        };

        local_frames_total += produced as u64;
        asrc.local = crate::asrc::SideTimestamp {
            transmitted_frames: local_frames_total,
            timestamp_ns: device_ts_ns,
        };

        if startup {
            periods_transferred += 1;
            let steady_estimate_ok =
                num_virtual_frames <= period_size + period_size / 4;
            if periods_transferred >= STARTUP_MIN_PERIODS && steady_estimate_ok {
                startup = false;
            }
        } else if produced < period_size {
            log::warn!("ASRC buffer underrun on {}, re-priming", config.device);
            startup = true;
            periods_transferred = 0;
            controller.reset();
            resampler.reset();
            asrc.clear();
            asrc.prefill_silence(asrc.target_fill_frames());
        }
    }
}

/// Moves frames between the network-facing ring and the ASRC buffer.
/// Returns the number of frames transferred.
fn pump_local_endpoint(
    local: &mut LocalEndpoint,
    asrc: &mut AsrcBuffer,
    config: &AlsaWorkerConfig,
    byte_buf: &mut [u8],
) -> usize {
    let channels = config.channels as usize;
    match local {
        LocalEndpoint::Capture(producer) => {
            let mut scratch = vec![0.0f32; config.period_size * channels];
            let got = asrc.read_frames(&mut scratch);
            let n = pcm::encode(config.format, &scratch[..got * channels], byte_buf);
            let bytes = n * config.format.bytes_per_sample();
            producer.write(&byte_buf[..bytes]);
            n
        }
        LocalEndpoint::Playback(consumer) => {
            let n = consumer.read(byte_buf);
            let mut scratch = vec![0.0f32; config.period_size * channels];
            let decoded = pcm::decode(config.format, &byte_buf[..n], &mut scratch);
            asrc.write_frames(&scratch[..decoded]);
            decoded
        }
    }
}

fn wait_for_period(pcm: &PCM) -> Result<(), alsa::Error> {
    match pcm.state() {
        State::XRun => {
            pcm.prepare()?;
        }
        _ => {}
    }
    pcm.wait(Some(1000)).map(|_| ())
}

fn cross_stamp(pcm: &PCM, clock: &Arc<dyn GptpClock>) -> u64 {
    let sys_ns = pcm
        .status()
        .ok()
        .map(|status| {
            let ts = status.get_htstamp();
            ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
        })
        .unwrap_or(0);
    clock.cross_stamp(sys_ns, clock.local_time())
}

/// Writes `frames` (interleaved `f32`, `[-1.0, 1.0]`) to the device,
/// converting to the configured hardware format. Returns frames written.
fn write_device(pcm: &PCM, frames: &[f32], config: &AlsaWorkerConfig) -> usize {
    match config.format {
        SampleFormat::S16 => {
            let samples: Vec<i16> = frames.iter().map(|&v| scale_to_i16(v)).collect();
            pcm.io_i16().and_then(|io| io.writei(&samples)).unwrap_or(0)
        }
        SampleFormat::S32 => {
            let samples: Vec<i32> = frames.iter().map(|&v| scale_to_i32(v)).collect();
            pcm.io_i32().and_then(|io| io.writei(&samples)).unwrap_or(0)
        }
        SampleFormat::F32 => pcm.io_f32().and_then(|io| io.writei(frames)).unwrap_or(0),
    }
}

/// Reads up to `frames.len() / channels` frames from the device into
/// `frames` (interleaved `f32`). Returns frames read.
fn read_device(pcm: &PCM, frames: &mut [f32], config: &AlsaWorkerConfig) -> usize {
    let channels = config.channels as usize;
    let want_frames = frames.len() / channels;
    match config.format {
        SampleFormat::S16 => {
            let mut samples = vec![0i16; want_frames * channels];
            let n = pcm.io_i16().and_then(|io| io.readi(&mut samples)).unwrap_or(0);
            for (dst, src) in frames.iter_mut().zip(samples.iter()).take(n * channels) {
                *dst = f32::from(*src) / f32::from(i16::MAX);
            }
            n
        }
        SampleFormat::S32 => {
            let mut samples = vec![0i32; want_frames * channels];
            let n = pcm.io_i32().and_then(|io| io.readi(&mut samples)).unwrap_or(0);
            for (dst, src) in frames.iter_mut().zip(samples.iter()).take(n * channels) {
                *dst = (*src as f32) / (i32::MAX as f32);
            }
            n
        }
        SampleFormat::F32 => pcm.io_f32().and_then(|io| io.readi(frames)).unwrap_or(0),
    }
}

fn scale_to_i16(v: f32) -> i16 {
    (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

fn scale_to_i32(v: f32) -> i32 {
    (v.clamp(-1.0, 1.0) * i32::MAX as f32) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_ratio_stays_within_clamp_bounds() {
        let mut c = SrcController::new();
        for _ in 0..1000 {
            let ratio = c.update(10_000.0);
            assert!((0.995..=1.005).contains(&ratio));
        }
    }

    #[test]
    fn controller_ratio_is_unity_for_zero_error() {
        let mut c = SrcController::new();
        assert!((c.update(0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn controller_reset_clears_integral_windup() {
        let mut c = SrcController::new();
        c.update(5_000.0);
        c.update(5_000.0);
        c.reset();
        assert_eq!(c.integral, 0.0);
    }

    #[test]
    fn open_pcm_rejects_zero_channels() {
        let config = AlsaWorkerConfig {
            device: "default".to_string(),
            direction: Direction::Playback,
            channels: 0,
            sample_rate: 48_000,
            format: SampleFormat::S32,
            period_size: 256,
            num_periods: 4,
        };
        let err = open_pcm(&config).unwrap_err();
        assert!(matches!(err, AlsaWorkerError::UnsupportedChannels(0)));
    }
}
