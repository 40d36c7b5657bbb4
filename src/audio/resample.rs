//! Sample-format conversion between the devices and the wire.
//!
//! The wire carries **mono 16-bit PCM** (16 kHz up, 24 kHz down) while cpal
//! devices run at whatever rate and channel count they prefer, in `f32`.
//! This module provides the glue:
//!
//! 1. [`downmix`]: interleaved multi-channel → mono.
//! 2. [`resample`]: linear-interpolation rate conversion.
//! 3. [`f32_to_pcm16`] / [`pcm16_to_f32`]: sample format conversion.

// ---------------------------------------------------------------------------
// downmix
// ---------------------------------------------------------------------------

/// Mix interleaved multi-channel audio down to mono by averaging channels.
///
/// The output length is `samples.len() / channels`; `channels == 0` yields
/// an empty vector.
///
/// ```rust
/// use duplex_voice::audio::downmix;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, 0.4]; // L R L R
/// let mono = downmix(&stereo, 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[1] - 0.3).abs() < 1e-6);
/// ```
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// resample
// ---------------------------------------------------------------------------

/// Resample mono `samples` from `from_rate` to `to_rate` Hz using linear
/// interpolation.
///
/// Equal rates return the input unchanged; empty input or a zero rate
/// returns an empty vector. Output length is
/// `ceil(samples.len() * to_rate / from_rate)`.
///
/// ```rust
/// use duplex_voice::audio::resample;
///
/// let hi = vec![0.5_f32; 480];
/// assert_eq!(resample(&hi, 48_000, 16_000).len(), 160);
/// assert_eq!(resample(&hi, 24_000, 48_000).len(), 960);
/// ```
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return samples.to_vec();
    }
    if samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return Vec::new();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;

        let sample = match (samples.get(idx), samples.get(idx + 1)) {
            (Some(a), Some(b)) => a * (1.0 - frac) + b * frac,
            (Some(a), None) => *a,
            _ => 0.0,
        };
        output.push(sample);
    }

    output
}

// ---------------------------------------------------------------------------
// Sample format
// ---------------------------------------------------------------------------

/// Convert `[-1.0, 1.0]` floats to 16-bit PCM, clamping out-of-range input.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
        .collect()
}

/// Convert 16-bit PCM to floats in `[-1.0, 1.0)`.
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32_768.0).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
