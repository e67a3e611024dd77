//! ASRC (Asynchronous Sample Rate Conversion) buffer: the frame ring an
//! [`crate::worker::AlsaWorker`] shares between the physical ALSA device
//! and the AVB stream, plus the cross-timestamps both sides publish so the
//! worker can estimate how far the two clocks have drifted apart.
//!
//! Grounded on `original_source`'s `IasAlsaHandlerWorkerThread` /
//! `IasAvbClockDomain` side-timestamp bookkeeping.

/// One side's last transfer count and the gPTP time it was observed at.
#[derive(Debug, Clone, Copy, Default)]
pub struct SideTimestamp {
    pub transmitted_frames: u64,
    pub timestamp_ns: u64,
}

/// Frame ring shared between the ALSA device side ("local") and the AVB
/// stream side ("remote"), sized `num_periods * period_size` frames.
pub struct AsrcBuffer {
    channels: usize,
    period_size: usize,
    ring: Vec<f32>,
    head: usize, // next frame index to read
    tail: usize, // next frame index to write
    len: usize,  // frames currently held
    pub local: SideTimestamp,
    pub remote: SideTimestamp,
}

impl AsrcBuffer {
    #[must_use]
    pub fn new(channels: usize, period_size: usize, num_periods: usize) -> Self {
        let capacity_frames = period_size * num_periods;
        Self {
            channels,
            period_size,
            ring: vec![0.0; capacity_frames * channels],
            head: 0,
            tail: 0,
            len: 0,
            local: SideTimestamp::default(),
            remote: SideTimestamp::default(),
        }
    }

    #[must_use]
    pub fn capacity_frames(&self) -> usize {
        self.ring.len() / self.channels
    }

    #[must_use]
    pub fn available_frames(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.capacity_frames() - self.len
    }

    /// Target fill level per §3: half the ring plus half a period, the
    /// steady-state operating point the closed-loop controller pulls
    /// `numTotalFrames` toward.
    #[must_use]
    pub fn target_fill_frames(&self) -> usize {
        self.capacity_frames() / 2 + self.period_size / 2
    }

    /// Pre-fills the ring with silence, used at the start of the startup
    /// phase and on re-prime after an underrun.
    pub fn prefill_silence(&mut self, frames: usize) {
        let frames = frames.min(self.capacity_frames());
        self.ring.fill(0.0);
        self.head = 0;
        self.tail = (frames * self.channels) % self.ring.len();
        self.len = frames;
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.len = 0;
        self.ring.fill(0.0);
    }

    /// Writes up to `frames.len() / channels` interleaved frames; returns
    /// the number actually written (bounded by free space).
    pub fn write_frames(&mut self, frames: &[f32]) -> usize {
        let channels = self.channels;
        let n = (frames.len() / channels).min(self.free_frames());
        let cap_samples = self.ring.len();
        for i in 0..n * channels {
            let idx = (self.tail * channels + i) % cap_samples;
            self.ring[idx] = frames[i];
        }
        self.tail = (self.tail + n) % self.capacity_frames();
        self.len += n;
        n
    }

    /// Reads up to `out.len() / channels` interleaved frames; returns the
    /// number actually read (bounded by available frames).
    pub fn read_frames(&mut self, out: &mut [f32]) -> usize {
        let channels = self.channels;
        let n = (out.len() / channels).min(self.len);
        let cap_samples = self.ring.len();
        for i in 0..n * channels {
            let idx = (self.head * channels + i) % cap_samples;
            out[i] = self.ring[idx];
        }
        self.head = (self.head + n) % self.capacity_frames();
        self.len -= n;
        n
    }

    /// `bufferDifftime = device.ts - asrcRemote.ts`, the cross-stamp
    /// offset used to derive `numVirtualFrames` for the controller.
    #[must_use]
    pub fn buffer_difftime_ns(&self, device_ts_ns: u64) -> i64 {
        device_ts_ns as i64 - self.remote.timestamp_ns as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_fill_is_half_ring_plus_half_period() {
        let buf = AsrcBuffer::new(2, 256, 4);
        assert_eq!(buf.target_fill_frames(), 512 + 128);
    }

    #[test]
    fn prefill_then_read_yields_silence() {
        let mut buf = AsrcBuffer::new(1, 4, 2);
        buf.prefill_silence(4);
        assert_eq!(buf.available_frames(), 4);
        let mut out = [1.0f32; 4];
        assert_eq!(buf.read_frames(&mut out), 4);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn write_then_read_round_trips_interleaved_frames() {
        let mut buf = AsrcBuffer::new(2, 4, 4);
        let frames = [1.0f32, 2.0, 3.0, 4.0];
        assert_eq!(buf.write_frames(&frames), 2);
        let mut out = [0.0f32; 4];
        assert_eq!(buf.read_frames(&mut out), 2);
        assert_eq!(out, frames);
    }

    #[test]
    fn write_is_bounded_by_free_space() {
        let mut buf = AsrcBuffer::new(1, 2, 1); // capacity 2 frames
        let frames = [1.0f32, 2.0, 3.0, 4.0];
        assert_eq!(buf.write_frames(&frames), 2);
    }
}
