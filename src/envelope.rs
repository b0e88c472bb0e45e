//! Envelope Module
//!
//! The amplitude/pitch/filter ADSR envelope generator. Segments are power
//! curves with a configurable shape; release runs at an exponential-style
//! rate so the release time holds regardless of the level at release, and
//! a short linear fadeout after the release floor avoids clicks.

use crate::config::constants::{
    EG_RELEASE_THRESHOLD, EG_TRANSITION_TIME, SUSTAIN_FREE_RUNNING_THRESHOLD, VIRTUALLY_ZERO,
};

/// Enumeration of envelope stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStage {
    /// Initial delay before the attack
    Delay,

    /// Rising to peak
    Attack,

    /// Holding at peak
    Hold,

    /// Falling to the sustain level
    Decay,

    /// Holding at the sustain level
    Sustain,

    /// Falling to the release floor
    Release,

    /// Short linear ramp to exactly zero
    Fadeout,

    /// Envelope has finished
    Done,
}

/// Envelope timing and level parameters, fully evaluated at trigger time
/// (velocity and controller modifiers already applied).
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeParameters {
    /// Delay before attack, seconds
    pub delay: f32,

    /// Attack time, seconds
    pub attack: f32,

    /// Hold time at peak, seconds
    pub hold: f32,

    /// Decay time, seconds
    pub decay: f32,

    /// Sustain level, 0..1
    pub sustain: f32,

    /// Release time, seconds
    pub release: f32,

    /// Starting level, 0..1
    pub start: f32,

    /// Depth scaler applied by the modulation target
    pub depth: f32,

    /// Attack curve shape (0 = linear)
    pub attack_shape: f32,

    /// Decay curve shape
    pub decay_shape: f32,

    /// Release curve shape
    pub release_shape: f32,
}

impl Default for EnvelopeParameters {
    fn default() -> Self {
        Self {
            delay: 0.0,
            attack: 0.0,
            hold: 0.0,
            decay: 0.0,
            sustain: 1.0,
            release: 0.0,
            start: 0.0,
            depth: 1.0,
            attack_shape: 0.0,
            decay_shape: 0.0,
            release_shape: 0.0,
        }
    }
}

/// Power-curve segment evaluation: `t` runs 0..1 along the segment.
#[inline]
fn shaped(t: f32, shape: f32) -> f32 {
    if shape < 0.0 {
        t.powf(-shape + 1.0)
    } else {
        t.powf(1.0 / (shape + 1.0))
    }
}

/// ADSR envelope generator.
#[derive(Debug, Clone)]
pub struct AdsrEnvelope {
    stage: EnvelopeStage,
    current: f32,

    // Segment state
    delay_samples: i64,
    attack_phase: f32,
    attack_step: f32,
    hold_samples: i64,
    decay_phase: f32,
    decay_rate: f32,
    sustain: f32,
    sustain_threshold: f32,
    release_phase: f32,
    release_rate: f32,
    release_level: f32,
    fadeout_delta: f32,

    start: f32,
    attack_shape: f32,
    decay_shape: f32,
    release_shape: f32,

    // Deferred release bookkeeping
    release_pending: bool,
    release_delay: i64,

    free_running: bool,
    sample_rate: f32,
}

impl AdsrEnvelope {
    /// Creates an idle envelope.
    pub fn new(sample_rate: f32) -> Self {
        Self {
            stage: EnvelopeStage::Done,
            current: 0.0,
            delay_samples: 0,
            attack_phase: 0.0,
            attack_step: 1.0,
            hold_samples: 0,
            decay_phase: 1.0,
            decay_rate: 1.0,
            sustain: 1.0,
            sustain_threshold: 1.0,
            release_phase: 1.0,
            release_rate: 1.0,
            release_level: 0.0,
            fadeout_delta: 0.0,
            start: 0.0,
            attack_shape: 0.0,
            decay_shape: 0.0,
            release_shape: 0.0,
            release_pending: false,
            release_delay: -1,
            free_running: false,
            sample_rate,
        }
    }

    fn seconds_to_samples(&self, seconds: f32) -> i64 {
        if seconds <= 0.0 {
            0
        } else {
            (seconds * self.sample_rate) as i64
        }
    }

    fn seconds_to_rate(&self, seconds: f32) -> f32 {
        if seconds <= 0.0 {
            1.0
        } else {
            1.0 / (seconds * self.sample_rate)
        }
    }

    /// Arms the envelope for a new note.
    ///
    /// # Arguments
    ///
    /// * `parameters` - evaluated envelope parameters
    /// * `trigger_delay` - frame offset of the note-on within the block
    /// * `one_shot` - region forces free-running (auto release at sustain)
    pub fn trigger(
        &mut self,
        parameters: &EnvelopeParameters,
        trigger_delay: usize,
        one_shot: bool,
    ) {
        self.stage = EnvelopeStage::Delay;
        self.delay_samples =
            trigger_delay as i64 + self.seconds_to_samples(parameters.delay);
        self.attack_phase = 0.0;
        self.attack_step = self.seconds_to_rate(parameters.attack);
        self.hold_samples = self.seconds_to_samples(parameters.hold);
        self.decay_phase = 1.0;
        self.decay_rate = self.seconds_to_rate(parameters.decay);
        self.sustain = parameters.sustain.clamp(0.0, 1.0);
        self.sustain_threshold = self.sustain + VIRTUALLY_ZERO;
        self.release_phase = 1.0;
        self.release_rate = self.seconds_to_rate(parameters.release);
        self.release_level = 0.0;
        self.start = parameters.start.clamp(0.0, 1.0);
        self.attack_shape = parameters.attack_shape;
        self.decay_shape = parameters.decay_shape;
        self.release_shape = parameters.release_shape;
        self.current = self.start;
        self.release_pending = false;
        self.release_delay = -1;
        self.free_running =
            one_shot || self.sustain <= SUSTAIN_FREE_RUNNING_THRESHOLD;
    }

    /// Schedules the release `delay` frames into the next rendered block.
    pub fn start_release(&mut self, delay: usize) {
        self.release_pending = true;
        self.release_delay = delay as i64;
    }

    /// Replaces the release time (used for fast-release offs).
    pub fn set_release_time(&mut self, seconds: f32) {
        self.release_rate = self.seconds_to_rate(seconds);
    }

    /// Whether the release segment has been entered or scheduled.
    pub fn is_released(&self) -> bool {
        self.release_pending
            || matches!(
                self.stage,
                EnvelopeStage::Release | EnvelopeStage::Fadeout | EnvelopeStage::Done
            )
    }

    /// Whether the envelope has finished.
    pub fn is_done(&self) -> bool {
        self.stage == EnvelopeStage::Done
    }

    /// Current stage.
    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    /// Current output level.
    pub fn current(&self) -> f32 {
        self.current
    }

    fn enter_release(&mut self) {
        self.stage = EnvelopeStage::Release;
        self.release_level = self.current;
        self.release_phase = 1.0;
        self.release_delay = -1;
    }

    /// Renders the next `output.len()` envelope samples.
    pub fn render(&mut self, output: &mut [f32]) {
        let mut index = 0usize;
        let total = output.len();

        while index < total {
            // Handle a scheduled release crossing into this position
            if self.release_pending
                && self.release_delay <= index as i64
                && !matches!(
                    self.stage,
                    EnvelopeStage::Release | EnvelopeStage::Fadeout | EnvelopeStage::Done
                )
            {
                self.enter_release();
            }

            // Bound this run so a pending release interrupts at its frame
            let mut limit = total;
            if self.release_pending
                && self.release_delay > index as i64
                && !matches!(
                    self.stage,
                    EnvelopeStage::Release | EnvelopeStage::Fadeout | EnvelopeStage::Done
                )
            {
                limit = limit.min(self.release_delay as usize);
            }

            match self.stage {
                EnvelopeStage::Delay => {
                    while index < limit && self.delay_samples > 0 {
                        self.delay_samples -= 1;
                        self.current = self.start;
                        output[index] = self.current;
                        index += 1;
                    }
                    if self.delay_samples <= 0 {
                        self.stage = EnvelopeStage::Attack;
                        self.attack_phase = 0.0;
                    }
                }
                EnvelopeStage::Attack => {
                    while index < limit && self.current < 1.0 {
                        self.current = self.start
                            + (1.0 - self.start) * shaped(self.attack_phase, self.attack_shape);
                        output[index] = self.current;
                        index += 1;
                        self.attack_phase = (self.attack_phase + self.attack_step).min(1.0);
                    }
                    if self.current >= 1.0 {
                        self.current = 1.0;
                        self.stage = EnvelopeStage::Hold;
                    }
                }
                EnvelopeStage::Hold => {
                    while index < limit && self.hold_samples > 0 {
                        self.hold_samples -= 1;
                        output[index] = self.current;
                        index += 1;
                    }
                    if self.hold_samples <= 0 {
                        self.stage = EnvelopeStage::Decay;
                        self.decay_phase = 1.0;
                    }
                }
                EnvelopeStage::Decay => {
                    while index < limit && self.current > self.sustain_threshold {
                        self.current = self.sustain
                            + (1.0 - self.sustain) * shaped(self.decay_phase, self.decay_shape);
                        output[index] = self.current;
                        index += 1;
                        self.decay_phase = (self.decay_phase - self.decay_rate).max(0.0);
                    }
                    if self.current <= self.sustain_threshold {
                        self.current = self.current.max(self.sustain);
                        self.stage = EnvelopeStage::Sustain;
                    }
                }
                EnvelopeStage::Sustain => {
                    if self.free_running && !self.release_pending {
                        self.release_pending = true;
                        self.release_delay = index as i64;
                        continue;
                    }
                    while index < limit {
                        output[index] = self.current;
                        index += 1;
                    }
                }
                EnvelopeStage::Release => {
                    while index < limit && self.current > EG_RELEASE_THRESHOLD {
                        self.release_phase = (self.release_phase - self.release_rate).max(0.0);
                        self.current =
                            self.release_level * shaped(self.release_phase, self.release_shape);
                        output[index] = self.current;
                        index += 1;
                    }
                    if self.current <= EG_RELEASE_THRESHOLD {
                        self.stage = EnvelopeStage::Fadeout;
                        self.fadeout_delta = -self.current.max(EG_RELEASE_THRESHOLD)
                            / (self.sample_rate * EG_TRANSITION_TIME);
                    }
                }
                EnvelopeStage::Fadeout => {
                    while index < limit && self.current > 0.0 {
                        self.current = (self.current + self.fadeout_delta).max(0.0);
                        output[index] = self.current;
                        index += 1;
                    }
                    if self.current <= 0.0 {
                        self.stage = EnvelopeStage::Done;
                        self.current = 0.0;
                    }
                }
                EnvelopeStage::Done => {
                    while index < limit {
                        output[index] = 0.0;
                        index += 1;
                    }
                }
            }
        }

        if self.release_pending {
            self.release_delay = (self.release_delay - total as i64).max(-1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48000.0;

    fn render_n(eg: &mut AdsrEnvelope, n: usize) -> Vec<f32> {
        let mut out = vec![0.0; n];
        eg.render(&mut out);
        out
    }

    #[test]
    fn test_instant_attack_full_sustain() {
        let mut eg = AdsrEnvelope::new(SR);
        eg.trigger(&EnvelopeParameters::default(), 0, false);
        let out = render_n(&mut eg, 64);
        assert!((out[1] - 1.0).abs() < 1e-6);
        assert_eq!(eg.stage(), EnvelopeStage::Sustain);
    }

    #[test]
    fn test_attack_ramp_duration() {
        let mut eg = AdsrEnvelope::new(SR);
        let params = EnvelopeParameters {
            attack: 0.01,
            ..Default::default()
        };
        eg.trigger(&params, 0, false);
        let out = render_n(&mut eg, 480);
        // 10 ms at 48 kHz = 480 samples; the ramp should just complete
        assert!(out[100] < 1.0);
        assert!((out[479] - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_delay_holds_start_level() {
        let mut eg = AdsrEnvelope::new(SR);
        let params = EnvelopeParameters {
            delay: 0.001,
            ..Default::default()
        };
        eg.trigger(&params, 0, false);
        let out = render_n(&mut eg, 48);
        assert!(out[0].abs() < 1e-6);
        assert!(out[10].abs() < 1e-6);
    }

    #[test]
    fn test_decay_reaches_sustain() {
        let mut eg = AdsrEnvelope::new(SR);
        let params = EnvelopeParameters {
            decay: 0.005,
            sustain: 0.5,
            ..Default::default()
        };
        eg.trigger(&params, 0, false);
        let out = render_n(&mut eg, 480);
        assert!((out[479] - 0.5).abs() < 1e-2);
        assert_eq!(eg.stage(), EnvelopeStage::Sustain);
    }

    #[test]
    fn test_release_time_independent_of_level() {
        // Release from sustain 1.0 and from sustain 0.25 should both hit
        // the floor in about the configured release time
        for sustain in [1.0f32, 0.25] {
            let mut eg = AdsrEnvelope::new(SR);
            let params = EnvelopeParameters {
                sustain,
                release: 0.01,
                ..Default::default()
            };
            eg.trigger(&params, 0, false);
            render_n(&mut eg, 64);
            eg.start_release(0);
            let out = render_n(&mut eg, 960);
            // After release time + fadeout, output is zero
            assert!(out[959].abs() < 1e-5, "sustain={}", sustain);
        }
    }

    #[test]
    fn test_release_delay_takes_effect_mid_block() {
        let mut eg = AdsrEnvelope::new(SR);
        eg.trigger(&EnvelopeParameters::default(), 0, false);
        render_n(&mut eg, 16);
        eg.start_release(100);
        let out = render_n(&mut eg, 200);
        // Still at sustain before the delay, below after
        assert!((out[99] - 1.0).abs() < 1e-6);
        assert!(out[150] < 1.0);
    }

    #[test]
    fn test_free_running_low_sustain() {
        let mut eg = AdsrEnvelope::new(SR);
        let params = EnvelopeParameters {
            sustain: 0.0,
            decay: 0.001,
            release: 0.001,
            ..Default::default()
        };
        eg.trigger(&params, 0, false);
        render_n(&mut eg, 4800);
        assert!(eg.is_done());
    }

    #[test]
    fn test_one_shot_releases_at_sustain() {
        let mut eg = AdsrEnvelope::new(SR);
        let params = EnvelopeParameters {
            sustain: 1.0,
            release: 0.001,
            ..Default::default()
        };
        eg.trigger(&params, 0, true);
        render_n(&mut eg, 4800);
        assert!(eg.is_done());
    }

    #[test]
    fn test_fadeout_reaches_exact_zero() {
        let mut eg = AdsrEnvelope::new(SR);
        let params = EnvelopeParameters {
            release: 0.001,
            ..Default::default()
        };
        eg.trigger(&params, 0, false);
        render_n(&mut eg, 16);
        eg.start_release(0);
        let out = render_n(&mut eg, 2000);
        assert_eq!(*out.last().unwrap(), 0.0);
        assert!(eg.is_done());
    }

    #[test]
    fn test_trigger_delay_defers_start() {
        let mut eg = AdsrEnvelope::new(SR);
        eg.trigger(&EnvelopeParameters::default(), 32, false);
        let out = render_n(&mut eg, 64);
        assert!(out[16].abs() < 1e-6);
        assert!(out[40] > 0.9);
    }
}
