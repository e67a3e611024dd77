//! Byte <-> `f32` conversion for the sample formats the ASRC buffer and
//! Farrow resampler operate on in the float domain (§4.7: "Farrow
//! constants differ per format but the control path is identical" — we
//! take that literally and keep the resampler format-agnostic, converting
//! at the edges instead).

use avb_core::SampleFormat;

/// Decodes `bytes` (little-endian, `fmt`-encoded, interleaved) into `out`,
/// one `f32` per sample scaled to `[-1.0, 1.0]`. Returns the number of
/// samples decoded.
pub fn decode(fmt: SampleFormat, bytes: &[u8], out: &mut [f32]) -> usize {
    let bps = fmt.bytes_per_sample();
    let n = (bytes.len() / bps).min(out.len());
    for i in 0..n {
        let chunk = &bytes[i * bps..i * bps + bps];
        out[i] = match fmt {
            SampleFormat::S16 => f32::from(i16::from_le_bytes([chunk[0], chunk[1]])) / f32::from(i16::MAX),
            SampleFormat::S32 => {
                (i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f32) / (i32::MAX as f32)
            }
            SampleFormat::F32 => f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
        };
    }
    n
}

/// Encodes `samples` (`[-1.0, 1.0]`-scaled `f32`) into `out` as
/// little-endian `fmt` bytes. Returns the number of samples encoded.
pub fn encode(fmt: SampleFormat, samples: &[f32], out: &mut [u8]) -> usize {
    let bps = fmt.bytes_per_sample();
    let n = samples.len().min(out.len() / bps);
    for i in 0..n {
        let bytes: [u8; 4] = match fmt {
            SampleFormat::S16 => {
                let v = (samples[i].clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                let b = v.to_le_bytes();
                [b[0], b[1], 0, 0]
            }
            SampleFormat::S32 => {
                let v = (samples[i].clamp(-1.0, 1.0) * i32::MAX as f32) as i32;
                v.to_le_bytes()
            }
            SampleFormat::F32 => samples[i].to_le_bytes(),
        };
        out[i * bps..i * bps + bps].copy_from_slice(&bytes[..bps]);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s16_round_trip_is_close() {
        let samples = [0.5f32, -0.25, 0.0];
        let mut bytes = [0u8; 6];
        assert_eq!(encode(SampleFormat::S16, &samples, &mut bytes), 3);
        let mut back = [0.0f32; 3];
        assert_eq!(decode(SampleFormat::S16, &bytes, &mut back), 3);
        for (a, b) in samples.iter().zip(back.iter()) {
            assert!((a - b).abs() < 0.001, "{a} vs {b}");
        }
    }

    #[test]
    fn f32_round_trip_is_exact() {
        let samples = [0.123_456_7f32, -0.987_654_3];
        let mut bytes = [0u8; 8];
        encode(SampleFormat::F32, &samples, &mut bytes);
        let mut back = [0.0f32; 2];
        decode(SampleFormat::F32, &bytes, &mut back);
        assert_eq!(samples, back);
    }
}
