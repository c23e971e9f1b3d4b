//! Sample rate and sample format conversion
//!
//! Capture runs at 16kHz and playback at 24kHz, while devices usually
//! run at 44.1kHz or 48kHz. Each direction converts independently; nothing
//! here ever converts capture audio to the playback rate.

/// Streaming sample rate converter for microphone audio
///
/// Integer ratios (48kHz → 16kHz) average each group of source samples.
/// Other ratios interpolate linearly. Partial groups and the interpolation
/// phase carry over between calls, so feeding audio in arbitrary chunks
/// gives the same output as feeding it all at once.
#[derive(Debug)]
pub struct Downsampler {
    source_rate: u32,
    target_rate: u32,
    /// Source samples not yet fully consumed
    carry: Vec<i16>,
    /// Next output position in `carry`, in units of 1/target_rate samples
    phase: u64,
}

impl Downsampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        if source_rate == 0 || target_rate == 0 {
            log::warn!(
                "Invalid sample rate (source: {}, target: {}), passing audio through",
                source_rate,
                target_rate
            );
        }
        Self {
            source_rate,
            target_rate,
            carry: Vec::new(),
            phase: 0,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.source_rate == 0 || self.target_rate == 0 || self.source_rate == self.target_rate
    }

    /// Convert the next chunk of audio
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        if self.is_passthrough() {
            return samples.to_vec();
        }

        self.carry.extend_from_slice(samples);

        if self.source_rate > self.target_rate && self.source_rate % self.target_rate == 0 {
            self.average_groups()
        } else {
            self.interpolate()
        }
    }

    fn average_groups(&mut self) -> Vec<i16> {
        let ratio = (self.source_rate / self.target_rate) as usize;
        let whole = self.carry.len() / ratio * ratio;

        let out = self.carry[..whole]
            .chunks(ratio)
            .map(|group| {
                // i64 keeps large groups from overflowing
                let sum: i64 = group.iter().map(|&s| s as i64).sum();
                (sum / ratio as i64) as i16
            })
            .collect();
        self.carry.drain(..whole);
        out
    }

    fn interpolate(&mut self) -> Vec<i16> {
        let target = self.target_rate as u64;
        let step = self.source_rate as u64;
        let mut out = Vec::with_capacity(
            (self.carry.len() as u64 * target / step) as usize + 1,
        );

        loop {
            let idx = (self.phase / target) as usize;
            if idx + 1 >= self.carry.len() {
                break;
            }
            let frac = (self.phase % target) as f32 / target as f32;
            let a = self.carry[idx] as f32;
            let b = self.carry[idx + 1] as f32;
            out.push((a + (b - a) * frac).round() as i16);
            self.phase += step;
        }

        let consumed = ((self.phase / target) as usize).min(self.carry.len());
        self.carry.drain(..consumed);
        self.phase -= consumed as u64 * target;
        out
    }
}

/// Resample normalized float audio with linear interpolation
///
/// Used on the playback side to bring 24kHz speech up to whatever rate the
/// output device runs at.
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == 0 || target_rate == 0 || source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    let step = source_rate as f64 / target_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(last)];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

/// Convert PCM16 samples to floats in [-1.0, 1.0)
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Convert a float sample to PCM16, clamping out-of-range input
pub fn f32_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Convert any cpal sample type to PCM16
pub fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    f32_to_i16(sample.to_sample::<f32>())
}

/// Average interleaved channels down to mono
pub fn to_mono(data: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}
