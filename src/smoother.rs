//! Smoother Module
//!
//! Control-signal conditioning used throughout the voice pipeline: a
//! one-pole smoother for gain/bend/crossfade targets, a linear ramp for
//! click-free fadeouts, and the windowed power follower the voice stealer
//! consults.

use crate::config::constants::{POWER_FOLLOWER_ATTACK, POWER_FOLLOWER_RELEASE};

/// One-pole lowpass smoother for control values.
///
/// The time constant is the time to cover ~63% of a step. A time constant
/// of zero makes the smoother transparent.
#[derive(Debug, Clone)]
pub struct OnePoleSmoother {
    coeff: f32,
    state: f32,
}

impl OnePoleSmoother {
    /// Creates a smoother with the given time constant in seconds.
    pub fn new(time_constant: f32, sample_rate: f32) -> Self {
        let mut smoother = Self {
            coeff: 1.0,
            state: 0.0,
        };
        smoother.set_time_constant(time_constant, sample_rate);
        smoother
    }

    /// Updates the time constant.
    pub fn set_time_constant(&mut self, time_constant: f32, sample_rate: f32) {
        self.coeff = if time_constant <= 0.0 {
            1.0
        } else {
            1.0 - (-1.0 / (time_constant * sample_rate)).exp()
        };
    }

    /// Jumps the internal state to a value without smoothing.
    pub fn reset(&mut self, value: f32) {
        self.state = value;
    }

    /// Advances one sample toward `target`.
    #[inline]
    pub fn process(&mut self, target: f32) -> f32 {
        self.state += self.coeff * (target - self.state);
        self.state
    }

    /// Fills `output` while approaching `target`.
    pub fn process_block(&mut self, target: f32, output: &mut [f32]) {
        for sample in output.iter_mut() {
            *sample = self.process(target);
        }
    }

    /// Current smoothed value.
    pub fn current(&self) -> f32 {
        self.state
    }
}

/// Linear ramp between two values over a fixed number of samples.
///
/// Used for the short fadeout that avoids clicks when a voice is cut while
/// still audible.
#[derive(Debug, Clone)]
pub struct LinearRamp {
    current: f32,
    step: f32,
    remaining: usize,
}

impl LinearRamp {
    /// Creates an idle ramp holding `value`.
    pub fn new(value: f32) -> Self {
        Self {
            current: value,
            step: 0.0,
            remaining: 0,
        }
    }

    /// Starts a ramp from the current value to `target` over `samples`.
    pub fn ramp_to(&mut self, target: f32, samples: usize) {
        if samples == 0 {
            self.current = target;
            self.remaining = 0;
            self.step = 0.0;
        } else {
            self.step = (target - self.current) / samples as f32;
            self.remaining = samples;
        }
    }

    /// Advances one sample.
    #[inline]
    pub fn process(&mut self) -> f32 {
        if self.remaining > 0 {
            self.current += self.step;
            self.remaining -= 1;
        }
        self.current
    }

    /// True while the ramp is still moving.
    pub fn is_ramping(&self) -> bool {
        self.remaining > 0
    }

    /// Current value.
    pub fn current(&self) -> f32 {
        self.current
    }
}

/// Windowed mean-power tracker with asymmetric attack and release.
///
/// Each processed block contributes its mean squared value (channels
/// summed); the tracker follows rises quickly and falls slowly so the
/// stealer sees a stable loudness estimate.
#[derive(Debug, Clone)]
pub struct PowerFollower {
    mean_power: f32,
    attack_factor: f32,
    release_factor: f32,
}

impl PowerFollower {
    /// Creates a follower for the given rates.
    pub fn new(sample_rate: f32, samples_per_block: usize) -> Self {
        let mut follower = Self {
            mean_power: 0.0,
            attack_factor: 0.0,
            release_factor: 0.0,
        };
        follower.configure(sample_rate, samples_per_block);
        follower
    }

    /// Recomputes tracking factors for new rates. Clamped so a single
    /// block can never overshoot the target.
    pub fn configure(&mut self, sample_rate: f32, samples_per_block: usize) {
        let max_factor = sample_rate / samples_per_block.max(1) as f32;
        self.attack_factor = POWER_FOLLOWER_ATTACK.min(max_factor) / sample_rate;
        self.release_factor = POWER_FOLLOWER_RELEASE.min(max_factor) / sample_rate;
    }

    /// Feeds one rendered stereo block.
    pub fn process(&mut self, left: &[f32], right: &[f32], frames: usize) {
        let frames = frames.min(left.len()).min(right.len());
        if frames == 0 {
            return;
        }

        let mut sum = 0.0f32;
        for i in 0..frames {
            let combined = left[i] + right[i];
            sum += combined * combined;
        }
        let mean = sum / frames as f32;

        let attack = frames as f32 * self.attack_factor;
        let release = frames as f32 * self.release_factor;
        self.mean_power = f32::max(
            self.mean_power * (1.0 - attack) + mean * attack,
            self.mean_power * (1.0 - release) + mean * release,
        );
    }

    /// Current tracked mean power.
    pub fn mean_power(&self) -> f32 {
        self.mean_power
    }

    /// Clears the tracked power.
    pub fn clear(&mut self) {
        self.mean_power = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoother_converges() {
        let mut smoother = OnePoleSmoother::new(0.001, 48000.0);
        smoother.reset(0.0);
        let mut value = 0.0;
        for _ in 0..1000 {
            value = smoother.process(1.0);
        }
        assert!((value - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_smoother_zero_time_is_transparent() {
        let mut smoother = OnePoleSmoother::new(0.0, 48000.0);
        assert_eq!(smoother.process(0.75), 0.75);
    }

    #[test]
    fn test_smoother_monotonic_approach() {
        let mut smoother = OnePoleSmoother::new(0.01, 48000.0);
        smoother.reset(0.0);
        let mut previous = 0.0;
        for _ in 0..100 {
            let value = smoother.process(1.0);
            assert!(value >= previous);
            previous = value;
        }
    }

    #[test]
    fn test_ramp_reaches_target() {
        let mut ramp = LinearRamp::new(1.0);
        ramp.ramp_to(0.0, 10);
        let mut last = 1.0;
        for _ in 0..10 {
            last = ramp.process();
        }
        assert!(last.abs() < 1e-6);
        assert!(!ramp.is_ramping());
    }

    #[test]
    fn test_ramp_zero_samples_jumps() {
        let mut ramp = LinearRamp::new(1.0);
        ramp.ramp_to(0.25, 0);
        assert_eq!(ramp.current(), 0.25);
    }

    #[test]
    fn test_power_follower_tracks_signal() {
        let mut follower = PowerFollower::new(48000.0, 128);
        let loud = vec![0.5f32; 128];
        let silent = vec![0.0f32; 128];

        for _ in 0..100 {
            follower.process(&loud, &loud, 128);
        }
        let loud_power = follower.mean_power();
        assert!(loud_power > 0.1);

        for _ in 0..2000 {
            follower.process(&silent, &silent, 128);
        }
        assert!(follower.mean_power() < loud_power * 0.1);
    }

    #[test]
    fn test_power_follower_attack_faster_than_release() {
        let mut follower = PowerFollower::new(48000.0, 128);
        let loud = vec![0.5f32; 128];
        let silent = vec![0.0f32; 128];

        follower.process(&loud, &loud, 128);
        let after_attack = follower.mean_power();

        follower.process(&silent, &silent, 128);
        let after_release = follower.mean_power();

        // One block of attack gains more power than one block of release sheds
        assert!(after_attack - 0.0 > after_attack - after_release);
    }
}
