//! Farrow-structure polynomial sample rate converter.
//!
//! A Farrow filter expresses a fractional-delay interpolator as a
//! polynomial in the fractional position `mu`, so an adaptive ratio close
//! to 1.0 can be applied without recomputing filter coefficients every
//! sample. This implementation uses a 4-point Lagrange interpolation
//! polynomial operating on `f32` frames; per-format byte conversion lives
//! in [`crate::pcm`].
//!
//! Grounded on `original_source`'s `IasSrcFarrow` (cubic Farrow SRC driven
//! by an adaptive ratio from the ASRC closed-loop controller) and
//! `RustAudio-cpal`'s ALSA backend for the surrounding PCM conventions.

/// Outcome of one `process_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferResult {
    /// Input frames consumed.
    pub consumed_frames: usize,
    /// Output frames actually produced by interpolation (before any
    /// padding/skipping the caller applies).
    pub produced_frames: usize,
}

/// Per-channel 4-point Farrow interpolator. One instance is shared across
/// all channels of a stream; frames are interleaved.
pub struct FarrowResampler {
    channels: usize,
    history: [Vec<f32>; 4],
    /// Fractional position of the next output sample within the window
    /// `[history[1], history[2]]`, advanced by `ratio` each output frame
    /// and by `-1.0` each time a new input frame is admitted.
    phase: f64,
}

impl FarrowResampler {
    #[must_use]
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            history: std::array::from_fn(|_| vec![0.0f32; channels]),
            phase: 1.0,
        }
    }

    /// Resets interpolation state to silence, used on re-prime after an
    /// underrun forces a fallback to the startup phase.
    pub fn reset(&mut self) {
        for frame in &mut self.history {
            frame.fill(0.0);
        }
        self.phase = 1.0;
    }

    fn admit(&mut self, frame: &[f32]) {
        self.history.rotate_left(1);
        self.history[3].copy_from_slice(frame);
    }

    fn interpolate(&self, mu: f64, out: &mut [f32]) {
        // 4-point Lagrange basis evaluated at the fractional offset `mu`
        // within [history[1], history[2]], history[0]/[3] the outer taps.
        let l0 = -mu * (mu - 1.0) * (mu - 2.0) / 6.0;
        let l1 = (mu + 1.0) * (mu - 1.0) * (mu - 2.0) / 2.0;
        let l2 = -(mu + 1.0) * mu * (mu - 2.0) / 2.0;
        let l3 = (mu + 1.0) * mu * (mu - 1.0) / 6.0;
        for ch in 0..self.channels {
            let v = l0 * f64::from(self.history[0][ch])
                + l1 * f64::from(self.history[1][ch])
                + l2 * f64::from(self.history[2][ch])
                + l3 * f64::from(self.history[3][ch]);
            out[ch] = v as f32;
        }
    }

    /// Advances the interpolator by consuming frames from `input` and
    /// writing interpolated frames into `output`, both interleaved by
    /// `self.channels`. `ratio` is the adaptive conversion ratio (input
    /// frames advanced per output frame), close to 1.0 in steady state.
    ///
    /// Stops early if `input` is exhausted before `output` is filled —
    /// the caller distinguishes pull-mode (pad with silence) from
    /// push-mode (leave short) underrun handling.
    fn transfer(&mut self, input: &[f32], ratio: f64, output: &mut [f32]) -> TransferResult {
        let channels = self.channels;
        let in_frames = input.len() / channels;
        let out_frames = output.len() / channels;
        let mut in_idx = 0;
        let mut out_idx = 0;
        let mut scratch = vec![0.0f32; channels];

        while out_idx < out_frames {
            while self.phase >= 1.0 {
                if in_idx >= in_frames {
                    return TransferResult {
                        consumed_frames: in_idx,
                        produced_frames: out_idx,
                    };
                }
                self.admit(&input[in_idx * channels..(in_idx + 1) * channels]);
                in_idx += 1;
                self.phase -= 1.0;
            }
            self.interpolate(self.phase, &mut scratch);
            output[out_idx * channels..(out_idx + 1) * channels].copy_from_slice(&scratch);
            out_idx += 1;
            self.phase += ratio;
        }
        TransferResult {
            consumed_frames: in_idx,
            produced_frames: out_idx,
        }
    }

    /// Sink direction: pulls frames from the ASRC buffer (`input`) to fill
    /// the ALSA device buffer (`output`). On underrun, the caller should
    /// zero-pad the remainder of `output` so the device still receives a
    /// full period.
    pub fn process_pull_mode(&mut self, input: &[f32], ratio: f64, output: &mut [f32]) -> TransferResult {
        let result = self.transfer(input, ratio, output);
        if result.produced_frames < output.len() / self.channels {
            let start = result.produced_frames * self.channels;
            output[start..].fill(0.0);
        }
        result
    }

    /// Source direction: pushes frames captured from the ALSA device
    /// (`input`) into the ASRC buffer (`output`). On underrun the caller
    /// simply receives fewer produced frames; there is nothing to pad.
    pub fn process_push_mode(&mut self, input: &[f32], ratio: f64, output: &mut [f32]) -> TransferResult {
        self.transfer(input, ratio, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_ratio_reproduces_input_after_warmup() {
        let mut r = FarrowResampler::new(1);
        let input = vec![1.0f32; 16];
        let mut output = vec![0.0f32; 8];
        let result = r.process_pull_mode(&input, 1.0, &mut output);
        assert_eq!(result.produced_frames, 8);
        assert!(output.iter().skip(4).all(|v| (*v - 1.0).abs() < 1e-4));
    }

    #[test]
    fn pull_mode_pads_silence_on_underrun() {
        let mut r = FarrowResampler::new(1);
        let input = vec![1.0f32; 2];
        let mut output = vec![9.0f32; 8];
        let result = r.process_pull_mode(&input, 1.0, &mut output);
        assert!(result.produced_frames < 8);
        assert_eq!(*output.last().unwrap(), 0.0);
    }

    #[test]
    fn push_mode_leaves_output_short_on_underrun() {
        let mut r = FarrowResampler::new(2);
        let input = vec![1.0f32; 4]; // 2 frames, 2 channels
        let mut output = vec![0.0f32; 16]; // room for 8 frames
        let result = r.process_push_mode(&input, 1.0, &mut output);
        assert!(result.produced_frames < 8);
    }

    #[test]
    fn reset_clears_history_and_phase() {
        let mut r = FarrowResampler::new(1);
        let input = vec![5.0f32; 8];
        let mut output = vec![0.0f32; 4];
        r.process_pull_mode(&input, 1.0, &mut output);
        r.reset();
        assert_eq!(r.phase, 1.0);
        assert!(r.history.iter().all(|f| f.iter().all(|v| *v == 0.0)));
    }
}
