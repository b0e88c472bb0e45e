//! LFO Module
//!
//! Low-frequency oscillators for parameter modulation. An LFO is described
//! by a base frequency, start phase, onset delay, fade-in time and a list
//! of sub-oscillators, each contributing its own wave at a frequency ratio
//! and scale. An optional step sequencer overrides the waveform entirely.

use crate::smoother::OnePoleSmoother;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;

/// LFO waveform shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LfoWave {
    /// Triangle starting at zero, rising
    #[default]
    Triangle,

    /// Sine
    Sine,

    /// Pulse with 75% high duty
    Pulse75,

    /// Square (50% duty)
    Square,

    /// Pulse with 25% high duty
    Pulse25,

    /// Pulse with 12.5% high duty
    Pulse12_5,

    /// Descending ramp
    Ramp,

    /// Ascending saw
    Saw,

    /// Random sample-and-hold
    RandomSh,
}

/// One sub-oscillator of an LFO.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LfoSub {
    /// Waveform
    pub wave: LfoWave,

    /// DC offset added to the sub's output
    pub offset: f32,

    /// Frequency ratio relative to the LFO base frequency
    pub ratio: f32,

    /// Output scale
    pub scale: f32,
}

impl Default for LfoSub {
    fn default() -> Self {
        Self {
            wave: LfoWave::Triangle,
            offset: 0.0,
            ratio: 1.0,
            scale: 1.0,
        }
    }
}

/// Step sequencer override: steps are values in -1..1 played evenly over
/// one LFO period.
#[derive(Debug, Clone, PartialEq)]
pub struct LfoSteps {
    pub steps: Vec<f32>,
}

/// Full description of one LFO.
#[derive(Debug, Clone, PartialEq)]
pub struct LfoDescription {
    /// Base frequency in Hz
    pub frequency: f32,

    /// Start phase, 0..1
    pub phase: f32,

    /// Onset delay in seconds
    pub delay: f32,

    /// Fade-in time in seconds
    pub fade: f32,

    /// Sub-oscillators; at least one
    pub subs: Vec<LfoSub>,

    /// Optional step sequencer overriding the waves
    pub steps: Option<LfoSteps>,
}

impl Default for LfoDescription {
    fn default() -> Self {
        Self {
            frequency: 0.0,
            phase: 0.0,
            delay: 0.0,
            fade: 0.0,
            subs: vec![LfoSub::default()],
            steps: None,
        }
    }
}

/// Per-sub runtime state.
#[derive(Debug, Clone, Copy)]
struct SubState {
    phase: f32,
    held_value: f32,
}

/// A running LFO instance.
#[derive(Debug, Clone)]
pub struct Lfo {
    description: LfoDescription,
    sample_rate: f32,
    subs: Vec<SubState>,
    delay_remaining: usize,
    fade: OnePoleSmoother,
    rng: SmallRng,
}

impl Lfo {
    /// Creates an instance from a description.
    ///
    /// The RNG seed makes sample-and-hold output reproducible for a fixed
    /// engine seed.
    pub fn new(description: LfoDescription, sample_rate: f32, seed: u64) -> Self {
        let fade = OnePoleSmoother::new(description.fade, sample_rate);
        let subs = description
            .subs
            .iter()
            .map(|_| SubState {
                phase: description.phase.rem_euclid(1.0),
                held_value: 0.0,
            })
            .collect();
        let mut lfo = Self {
            description,
            sample_rate,
            subs,
            delay_remaining: 0,
            fade,
            rng: SmallRng::seed_from_u64(seed),
        };
        lfo.trigger(0);
        lfo
    }

    /// Re-arms the LFO at a block offset.
    pub fn trigger(&mut self, delay: usize) {
        let start_phase = self.description.phase.rem_euclid(1.0);
        for (state, _) in self.subs.iter_mut().zip(&self.description.subs) {
            state.phase = start_phase;
            state.held_value = 0.0;
        }
        self.delay_remaining =
            delay + (self.description.delay * self.sample_rate) as usize;
        self.fade
            .set_time_constant(self.description.fade, self.sample_rate);
        self.fade.reset(if self.description.fade > 0.0 { 0.0 } else { 1.0 });
    }

    fn wave_value(wave: LfoWave, phase: f32, held: f32) -> f32 {
        match wave {
            LfoWave::Triangle => {
                if phase < 0.25 {
                    4.0 * phase
                } else if phase < 0.75 {
                    2.0 - 4.0 * phase
                } else {
                    4.0 * phase - 4.0
                }
            }
            LfoWave::Sine => (2.0 * PI * phase).sin(),
            LfoWave::Pulse75 => {
                if phase < 0.75 {
                    1.0
                } else {
                    -1.0
                }
            }
            LfoWave::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            LfoWave::Pulse25 => {
                if phase < 0.25 {
                    1.0
                } else {
                    -1.0
                }
            }
            LfoWave::Pulse12_5 => {
                if phase < 0.125 {
                    1.0
                } else {
                    -1.0
                }
            }
            LfoWave::Ramp => 1.0 - 2.0 * phase,
            LfoWave::Saw => 2.0 * phase - 1.0,
            LfoWave::RandomSh => held,
        }
    }

    fn step_value(steps: &LfoSteps, phase: f32) -> f32 {
        if steps.steps.is_empty() {
            return 0.0;
        }
        let index = ((phase * steps.steps.len() as f32) as usize)
            .min(steps.steps.len() - 1);
        steps.steps[index]
    }

    /// Renders the next `output.len()` samples into `output`.
    pub fn render(&mut self, output: &mut [f32]) {
        let base_increment = self.description.frequency / self.sample_rate;

        for sample in output.iter_mut() {
            if self.delay_remaining > 0 {
                self.delay_remaining -= 1;
                *sample = 0.0;
                continue;
            }

            let fade_gain = self.fade.process(1.0);
            let mut value = 0.0f32;

            if let Some(steps) = &self.description.steps {
                let state = &mut self.subs[0];
                value = Self::step_value(steps, state.phase);
                state.phase += base_increment;
                if state.phase >= 1.0 {
                    state.phase -= state.phase.floor();
                }
            } else {
                for (state, sub) in self.subs.iter_mut().zip(&self.description.subs) {
                    value += sub.offset
                        + sub.scale
                            * Self::wave_value(sub.wave, state.phase, state.held_value);

                    state.phase += base_increment * sub.ratio;
                    if state.phase >= 1.0 {
                        state.phase -= state.phase.floor();
                        state.held_value = self.rng.gen_range(-1.0..=1.0);
                    }
                }
            }

            *sample = value * fade_gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 1000.0;

    fn simple(frequency: f32, wave: LfoWave) -> LfoDescription {
        LfoDescription {
            frequency,
            subs: vec![LfoSub {
                wave,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn render_n(lfo: &mut Lfo, n: usize) -> Vec<f32> {
        let mut out = vec![0.0; n];
        lfo.render(&mut out);
        out
    }

    #[test]
    fn test_sine_period() {
        let mut lfo = Lfo::new(simple(10.0, LfoWave::Sine), SR, 0);
        let out = render_n(&mut lfo, 100);
        // One full period: quarter points hit 1 and -1
        assert!((out[25] - 1.0).abs() < 0.1);
        assert!((out[75] + 1.0).abs() < 0.1);
    }

    #[test]
    fn test_triangle_starts_at_zero() {
        let mut lfo = Lfo::new(simple(10.0, LfoWave::Triangle), SR, 0);
        let out = render_n(&mut lfo, 100);
        assert!(out[0].abs() < 0.05);
        assert!((out[25] - 1.0).abs() < 0.05);
        assert!((out[75] + 1.0).abs() < 0.05);
    }

    #[test]
    fn test_square_duty() {
        let mut lfo = Lfo::new(simple(10.0, LfoWave::Square), SR, 0);
        let out = render_n(&mut lfo, 100);
        let high = out.iter().filter(|&&v| v > 0.0).count();
        assert!((high as i32 - 50).abs() <= 2);
    }

    #[test]
    fn test_delay_silences_onset() {
        let mut description = simple(10.0, LfoWave::Square);
        description.delay = 0.05;
        let mut lfo = Lfo::new(description, SR, 0);
        let out = render_n(&mut lfo, 100);
        assert!(out[..50].iter().all(|&v| v == 0.0));
        assert!(out[50..].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_fade_in_grows() {
        let mut description = simple(10.0, LfoWave::Square);
        description.fade = 0.2;
        let mut lfo = Lfo::new(description, SR, 0);
        let out = render_n(&mut lfo, 400);
        assert!(out[5].abs() < 0.2);
        assert!(out[395].abs() > 0.6);
    }

    #[test]
    fn test_sub_oscillators_sum() {
        let description = LfoDescription {
            frequency: 10.0,
            subs: vec![
                LfoSub {
                    wave: LfoWave::Square,
                    scale: 0.5,
                    ..Default::default()
                },
                LfoSub {
                    wave: LfoWave::Square,
                    scale: 0.25,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let mut lfo = Lfo::new(description, SR, 0);
        let out = render_n(&mut lfo, 10);
        assert!((out[0] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_step_sequencer_overrides_wave() {
        let description = LfoDescription {
            frequency: 10.0,
            steps: Some(LfoSteps {
                steps: vec![1.0, -1.0, 0.5, -0.5],
            }),
            ..Default::default()
        };
        let mut lfo = Lfo::new(description, SR, 0);
        let out = render_n(&mut lfo, 100);
        // Steps last 25 samples each at 10 Hz / 4 steps over 1 kHz
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[30] + 1.0).abs() < 1e-6);
        assert!((out[60] - 0.5).abs() < 1e-6);
        assert!((out[90] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_random_sh_deterministic_for_seed() {
        let a: Vec<f32> = {
            let mut lfo = Lfo::new(simple(50.0, LfoWave::RandomSh), SR, 42);
            render_n(&mut lfo, 200)
        };
        let b: Vec<f32> = {
            let mut lfo = Lfo::new(simple(50.0, LfoWave::RandomSh), SR, 42);
            render_n(&mut lfo, 200)
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_ratio_scales_sub_frequency() {
        let description = LfoDescription {
            frequency: 5.0,
            subs: vec![LfoSub {
                wave: LfoWave::Saw,
                ratio: 2.0,
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut lfo = Lfo::new(description, SR, 0);
        let out = render_n(&mut lfo, 200);
        // 5 Hz * ratio 2 = 10 Hz: wraps at sample 100
        assert!(out[98] > 0.9);
        assert!(out[102] < -0.9);
    }
}
