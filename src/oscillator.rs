//! Oscillator Module
//!
//! Generator sound sources for regions whose sample is `*sine`, `*saw`,
//! `*square`, `*triangle` or `*noise`. The periodic waveforms are produced
//! from band-limited wavetables built once per engine; each table band
//! carries only the harmonics that stay below Nyquist for its frequency
//! range, which keeps sawtooth and square usable in the high register.
//!
//! Unison is handled here as well: a region may ask for several detuned
//! copies spread symmetrically around the center pitch, with linearly
//! interpolated left/right gains for stereo spread.

use rand::rngs::SmallRng;
use rand::Rng;
use std::f32::consts::PI;
use std::sync::Arc;

/// Samples per wavetable band.
const TABLE_SIZE: usize = 2048;

/// Lowest frequency covered by the first table band, in Hz.
const TABLE_BASE_FREQUENCY: f32 = 20.0;

/// Number of octave bands.
const TABLE_BANDS: usize = 10;

/// Periodic generator waveforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorWave {
    /// Pure sine, fundamental only
    Sine,

    /// Sawtooth, all harmonics at 1/n
    Saw,

    /// Square, odd harmonics at 1/n
    Square,

    /// Triangle, odd harmonics at 1/n^2 with alternating sign
    Triangle,
}

/// One band-limited table covering frequencies up to `max_frequency`.
#[derive(Debug, Clone)]
struct TableBand {
    max_frequency: f32,
    samples: Vec<f32>,
}

/// Band-limited wavetables for all generator waveforms, shared by voices.
#[derive(Debug)]
pub struct WavetableSet {
    sine: Vec<TableBand>,
    saw: Vec<TableBand>,
    square: Vec<TableBand>,
    triangle: Vec<TableBand>,
}

impl WavetableSet {
    /// Builds the tables for a sample rate. Done at engine construction,
    /// never on the audio thread.
    pub fn new(sample_rate: f32) -> Arc<Self> {
        let nyquist = sample_rate * 0.5;

        let build = |amplitude: fn(usize) -> f32| -> Vec<TableBand> {
            (0..TABLE_BANDS)
                .map(|band| {
                    let max_frequency = TABLE_BASE_FREQUENCY * (1 << (band + 1)) as f32;
                    let max_harmonic =
                        ((nyquist / max_frequency).floor() as usize).max(1);
                    let mut samples = vec![0.0f32; TABLE_SIZE + 1];
                    for i in 0..TABLE_SIZE {
                        let phase = i as f32 / TABLE_SIZE as f32;
                        let mut value = 0.0f32;
                        for harmonic in 1..=max_harmonic {
                            let gain = amplitude(harmonic);
                            if gain != 0.0 {
                                value += gain
                                    * (2.0 * PI * phase * harmonic as f32).sin();
                            }
                        }
                        samples[i] = value;
                    }
                    // Guard point for interpolation
                    samples[TABLE_SIZE] = samples[0];

                    // Normalize to unit peak
                    let peak = samples
                        .iter()
                        .fold(0.0f32, |max, &s| max.max(s.abs()));
                    if peak > 0.0 {
                        for sample in &mut samples {
                            *sample /= peak;
                        }
                    }

                    TableBand {
                        max_frequency,
                        samples,
                    }
                })
                .collect()
        };

        Arc::new(Self {
            sine: build(|n| if n == 1 { 1.0 } else { 0.0 }),
            saw: build(|n| 1.0 / n as f32),
            square: build(|n| if n % 2 == 1 { 1.0 / n as f32 } else { 0.0 }),
            triangle: build(|n| {
                if n % 2 == 1 {
                    let sign = if (n / 2) % 2 == 0 { 1.0 } else { -1.0 };
                    sign / (n * n) as f32
                } else {
                    0.0
                }
            }),
        })
    }

    fn bands(&self, wave: GeneratorWave) -> &[TableBand] {
        match wave {
            GeneratorWave::Sine => &self.sine,
            GeneratorWave::Saw => &self.saw,
            GeneratorWave::Square => &self.square,
            GeneratorWave::Triangle => &self.triangle,
        }
    }

    /// Reads a waveform at `phase` (0..1) for a playback frequency.
    #[inline]
    pub fn read(&self, wave: GeneratorWave, frequency: f32, phase: f32) -> f32 {
        let bands = self.bands(wave);
        let band = bands
            .iter()
            .find(|band| frequency <= band.max_frequency)
            .unwrap_or(&bands[bands.len() - 1]);

        let position = phase * TABLE_SIZE as f32;
        let index = (position as usize).min(TABLE_SIZE - 1);
        let frac = position - index as f32;
        let a = band.samples[index];
        let b = band.samples[index + 1];
        a + (b - a) * frac
    }
}

/// One unison copy: a phase accumulator plus its detune and stereo gains.
#[derive(Debug, Clone, Copy)]
struct UnisonCopy {
    phase: f32,
    detune_ratio: f32,
    left_gain: f32,
    right_gain: f32,
}

/// A generator oscillator with optional unison.
#[derive(Debug, Clone)]
pub struct GeneratorOscillator {
    wave: GeneratorWave,
    tables: Arc<WavetableSet>,
    copies: Vec<UnisonCopy>,
    sample_rate: f32,
}

impl GeneratorOscillator {
    /// Creates an oscillator.
    ///
    /// # Arguments
    ///
    /// * `wave` - waveform to generate
    /// * `tables` - shared band-limited tables
    /// * `multi` - number of unison copies (1 = plain)
    /// * `detune_cents` - symmetric detune span for unison copies
    /// * `sample_rate` - engine sample rate
    pub fn new(
        wave: GeneratorWave,
        tables: Arc<WavetableSet>,
        multi: usize,
        detune_cents: f32,
        sample_rate: f32,
    ) -> Self {
        let multi = multi.clamp(1, 9);
        let copies = (0..multi)
            .map(|i| {
                // Spread positions in [-1, 1]; a single copy sits at center
                let position = if multi == 1 {
                    0.0
                } else {
                    2.0 * i as f32 / (multi - 1) as f32 - 1.0
                };
                UnisonCopy {
                    phase: 0.0,
                    detune_ratio: 2.0f32.powf(position * detune_cents / 1200.0),
                    left_gain: 0.5 * (1.0 - position),
                    right_gain: 0.5 * (1.0 + position),
                }
            })
            .collect();

        Self {
            wave,
            tables,
            copies,
            sample_rate,
        }
    }

    /// Generates one stereo frame at the given frequency.
    #[inline]
    pub fn next_frame(&mut self, frequency: f32) -> (f32, f32) {
        let mut left = 0.0;
        let mut right = 0.0;
        let normalize = if self.copies.len() > 1 {
            2.0 / self.copies.len() as f32
        } else {
            1.0
        };

        for copy in &mut self.copies {
            let copy_frequency = frequency * copy.detune_ratio;
            let sample = self.tables.read(self.wave, copy_frequency, copy.phase);
            left += sample * copy.left_gain;
            right += sample * copy.right_gain;

            copy.phase += copy_frequency / self.sample_rate;
            if copy.phase >= 1.0 {
                copy.phase -= copy.phase.floor();
            }
        }

        if self.copies.len() == 1 {
            // A single centered copy carries half gain on each side;
            // restore full scale and use it for both channels.
            let mono = left + right;
            (mono, mono)
        } else {
            (left * normalize, right * normalize)
        }
    }

    /// Resets all phases.
    pub fn reset(&mut self) {
        for copy in &mut self.copies {
            copy.phase = 0.0;
        }
    }
}

/// Noise flavor for `*noise` regions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoiseKind {
    /// Uniform in [-bounds, bounds]
    Uniform { bounds: f32 },

    /// Gaussian with the given standard deviation
    Gaussian { deviation: f32 },
}

/// Stateless noise source; the RNG lives on the voice.
#[derive(Debug, Clone, Copy)]
pub struct NoiseGenerator {
    kind: NoiseKind,
}

impl NoiseGenerator {
    pub fn new(kind: NoiseKind) -> Self {
        Self { kind }
    }

    /// Generates one sample.
    #[inline]
    pub fn next_sample(&self, rng: &mut SmallRng) -> f32 {
        match self.kind {
            NoiseKind::Uniform { bounds } => rng.gen_range(-bounds..=bounds),
            NoiseKind::Gaussian { deviation } => {
                // Box-Muller transform
                let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
                let u2: f32 = rng.gen_range(0.0..1.0);
                deviation * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tables() -> Arc<WavetableSet> {
        WavetableSet::new(48000.0)
    }

    #[test]
    fn test_sine_frequency() {
        let mut osc =
            GeneratorOscillator::new(GeneratorWave::Sine, tables(), 1, 0.0, 48000.0);

        // Count zero crossings over one second of 440 Hz
        let mut crossings = 0;
        let mut last = 0.0f32;
        for _ in 0..48000 {
            let (sample, _) = osc.next_frame(440.0);
            if last < 0.0 && sample >= 0.0 {
                crossings += 1;
            }
            last = sample;
        }
        assert!((crossings as i32 - 440).abs() <= 1, "crossings={}", crossings);
    }

    #[test]
    fn test_waveforms_bounded() {
        for wave in [
            GeneratorWave::Sine,
            GeneratorWave::Saw,
            GeneratorWave::Square,
            GeneratorWave::Triangle,
        ] {
            let mut osc = GeneratorOscillator::new(wave, tables(), 1, 0.0, 48000.0);
            for _ in 0..4096 {
                let (l, r) = osc.next_frame(220.0);
                assert!(l.abs() <= 1.01);
                assert!(r.abs() <= 1.01);
            }
        }
    }

    #[test]
    fn test_high_frequency_saw_stays_band_limited() {
        let set = tables();
        // The band chosen for a high fundamental keeps few harmonics;
        // a single-harmonic saw degenerates to a sine: antisymmetric
        let v1 = set.read(GeneratorWave::Saw, 10000.0, 0.25);
        let v2 = set.read(GeneratorWave::Saw, 10000.0, 0.75);
        assert!((v1 + v2).abs() < 0.05);
    }

    #[test]
    fn test_unison_stereo_spread() {
        let mut osc =
            GeneratorOscillator::new(GeneratorWave::Saw, tables(), 3, 25.0, 48000.0);
        let mut left_sum = 0.0f32;
        let mut right_sum = 0.0f32;
        for _ in 0..4800 {
            let (l, r) = osc.next_frame(220.0);
            left_sum += l.abs();
            right_sum += r.abs();
        }
        // Symmetric spread keeps the channels roughly balanced
        let ratio = left_sum / right_sum;
        assert!(ratio > 0.8 && ratio < 1.25, "ratio={}", ratio);
    }

    #[test]
    fn test_single_copy_is_mono() {
        let mut osc =
            GeneratorOscillator::new(GeneratorWave::Triangle, tables(), 1, 0.0, 48000.0);
        for _ in 0..256 {
            let (l, r) = osc.next_frame(330.0);
            assert_eq!(l, r);
        }
    }

    #[test]
    fn test_uniform_noise_bounds() {
        let noise = NoiseGenerator::new(NoiseKind::Uniform { bounds: 0.25 });
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..10000 {
            let sample = noise.next_sample(&mut rng);
            assert!(sample >= -0.25 && sample <= 0.25);
        }
    }

    #[test]
    fn test_gaussian_noise_statistics() {
        let noise = NoiseGenerator::new(NoiseKind::Gaussian { deviation: 0.1 });
        let mut rng = SmallRng::seed_from_u64(2);
        let samples: Vec<f32> = (0..20000).map(|_| noise.next_sample(&mut rng)).collect();
        let mean: f32 = samples.iter().sum::<f32>() / samples.len() as f32;
        let variance: f32 =
            samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 0.01);
        assert!((variance.sqrt() - 0.1).abs() < 0.01);
    }
}
