//! Modulation Matrix Module
//!
//! Combines modulation sources into per-target buffers. Per-voice sources
//! (envelopes, LFOs) are rendered by the voice into buffers once per
//! block and handed over as `SourceBuffers`; per-cycle sources (controller
//! values, aftertouch) are generated here with per-connection smoothing,
//! curve mapping and quantization. Target buffers are produced on demand;
//! connected contributions sum, or multiply for targets flagged as such.

use crate::curve::CurveSet;
use crate::midi_state::MidiState;
use crate::modulation::{ModConnection, ModSource, ModTarget};
use crate::smoother::OnePoleSmoother;

/// Buffers of per-voice sources for the current block, rendered by the
/// voice before matrix evaluation. Missing sources contribute zero.
#[derive(Debug, Default)]
pub struct SourceBuffers<'a> {
    pub amp_eg: Option<&'a [f32]>,
    pub pitch_eg: Option<&'a [f32]>,
    pub fil_eg: Option<&'a [f32]>,
    pub flex_egs: &'a [Vec<f32>],
    pub lfos: &'a [Vec<f32>],

    /// Note-on velocity, 0..1
    pub velocity: f32,
}

/// Per-connection runtime state for controller sources.
#[derive(Debug, Clone)]
struct ControllerState {
    smoother: OnePoleSmoother,
}

/// The per-voice modulation matrix.
#[derive(Debug)]
pub struct ModMatrix {
    connections: Vec<ModConnection>,
    controller_states: Vec<Option<ControllerState>>,
    sample_rate: f32,
}

impl ModMatrix {
    /// Builds the matrix from a region's connection list.
    pub fn new(connections: &[ModConnection], sample_rate: f32) -> Self {
        let controller_states = connections
            .iter()
            .map(|connection| match connection.source {
                ModSource::Controller { smooth, .. } => Some(ControllerState {
                    smoother: OnePoleSmoother::new(
                        smooth as f32 * 0.001,
                        sample_rate,
                    ),
                }),
                _ => None,
            })
            .collect();

        Self {
            connections: connections.to_vec(),
            controller_states,
            sample_rate,
        }
    }

    /// Re-arms controller smoothers at note start so the first block does
    /// not glide in from a stale value.
    pub fn trigger(&mut self, midi: &MidiState, curves: &CurveSet) {
        for (connection, state) in self.connections.iter().zip(&mut self.controller_states) {
            if let (
                ModSource::Controller {
                    cc, curve, step, ..
                },
                Some(state),
            ) = (connection.source, state.as_mut())
            {
                let value = Self::condition(midi.cc_value(cc), curve, step, curves);
                state.smoother.reset(value);
            }
        }
    }

    /// Whether any connection feeds `target`.
    pub fn has_target(&self, target: ModTarget) -> bool {
        self.connections.iter().any(|c| c.target == target)
    }

    fn condition(value: f32, curve: u8, step: u16, curves: &CurveSet) -> f32 {
        let mut value = curves.get(curve as usize).eval(value);
        if step > 0 {
            let step = step as f32 / 127.0;
            value = (value / step).round() * step;
        }
        value
    }

    fn source_value_at(
        source: ModSource,
        buffers: &SourceBuffers,
        frame: usize,
    ) -> f32 {
        let read = |buffer: Option<&[f32]>| {
            buffer
                .and_then(|b| b.get(frame))
                .copied()
                .unwrap_or(0.0)
        };
        match source {
            ModSource::AmpEg => read(buffers.amp_eg),
            ModSource::PitchEg => read(buffers.pitch_eg),
            ModSource::FilEg => read(buffers.fil_eg),
            ModSource::FlexEg(index) => buffers
                .flex_egs
                .get(index as usize)
                .and_then(|b| b.get(frame))
                .copied()
                .unwrap_or(0.0),
            ModSource::Lfo(index) => buffers
                .lfos
                .get(index as usize)
                .and_then(|b| b.get(frame))
                .copied()
                .unwrap_or(0.0),
            ModSource::Velocity => buffers.velocity,
            // Controller and aftertouch are handled in the render loop
            _ => 0.0,
        }
    }

    /// Renders the combined modulation for a target into `output`.
    ///
    /// Additive targets start from zero; multiplicative targets start
    /// from one. Frames beyond the sources' length hold the last value.
    pub fn render_target(
        &mut self,
        target: ModTarget,
        buffers: &SourceBuffers,
        midi: &MidiState,
        curves: &CurveSet,
        output: &mut [f32],
    ) {
        let multiplicative = target.is_multiplicative();
        let neutral = if multiplicative { 1.0 } else { 0.0 };
        output.fill(neutral);

        for index in 0..self.connections.len() {
            let connection = self.connections[index].clone();
            if connection.target != target {
                continue;
            }

            let depth = connection.depth + connection.vel_to_depth * buffers.velocity;

            match connection.source {
                ModSource::Controller {
                    cc, curve, step, ..
                } => {
                    let Some(state) = self.controller_states[index].as_mut() else {
                        continue;
                    };
                    for (frame, out) in output.iter_mut().enumerate() {
                        let raw = midi.cc_value_at(cc, frame);
                        let conditioned = Self::condition(raw, curve, step, curves);
                        let smoothed = state.smoother.process(conditioned);
                        let contribution = Self::scaled(
                            smoothed * depth,
                            connection.depth_mod,
                            buffers,
                            frame,
                        );
                        Self::combine(out, contribution, multiplicative);
                    }
                }
                ModSource::ChannelAftertouch => {
                    let value = midi.channel_aftertouch();
                    for (frame, out) in output.iter_mut().enumerate() {
                        let contribution = Self::scaled(
                            value * depth,
                            connection.depth_mod,
                            buffers,
                            frame,
                        );
                        Self::combine(out, contribution, multiplicative);
                    }
                }
                source => {
                    for (frame, out) in output.iter_mut().enumerate() {
                        let value = Self::source_value_at(source, buffers, frame);
                        let contribution = Self::scaled(
                            value * depth,
                            connection.depth_mod,
                            buffers,
                            frame,
                        );
                        Self::combine(out, contribution, multiplicative);
                    }
                }
            }
        }
    }

    #[inline]
    fn scaled(
        value: f32,
        depth_mod: Option<ModSource>,
        buffers: &SourceBuffers,
        frame: usize,
    ) -> f32 {
        match depth_mod {
            Some(source) => value * Self::source_value_at(source, buffers, frame),
            None => value,
        }
    }

    #[inline]
    fn combine(out: &mut f32, contribution: f32, multiplicative: bool) {
        if multiplicative {
            *out *= contribution;
        } else {
            *out += contribution;
        }
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when no connections exist.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// The sample rate the matrix was built for.
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modulation::ModConnection;

    const SR: f32 = 48000.0;

    #[test]
    fn test_lfo_to_pitch_sums() {
        let connections = vec![
            ModConnection::new(ModSource::Lfo(0), ModTarget::Pitch, 100.0),
            ModConnection::new(ModSource::Lfo(1), ModTarget::Pitch, 50.0),
        ];
        let mut matrix = ModMatrix::new(&connections, SR);
        let midi = MidiState::new(SR);
        let curves = CurveSet::new();

        let lfos = vec![vec![1.0f32; 16], vec![-1.0f32; 16]];
        let buffers = SourceBuffers {
            lfos: &lfos,
            ..Default::default()
        };

        let mut out = vec![0.0; 16];
        matrix.render_target(ModTarget::Pitch, &buffers, &midi, &curves, &mut out);
        assert!(out.iter().all(|&v| (v - 50.0).abs() < 1e-4));
    }

    #[test]
    fn test_velocity_scales_depth() {
        let connections = vec![ModConnection {
            source: ModSource::Lfo(0),
            target: ModTarget::Volume,
            depth: 6.0,
            vel_to_depth: 6.0,
            depth_mod: None,
        }];
        let mut matrix = ModMatrix::new(&connections, SR);
        let midi = MidiState::new(SR);
        let curves = CurveSet::new();

        let lfos = vec![vec![1.0f32; 8]];
        let buffers = SourceBuffers {
            lfos: &lfos,
            velocity: 0.5,
            ..Default::default()
        };

        let mut out = vec![0.0; 8];
        matrix.render_target(ModTarget::Volume, &buffers, &midi, &curves, &mut out);
        // depth 6 + 6 * 0.5 = 9
        assert!((out[0] - 9.0).abs() < 1e-4);
    }

    #[test]
    fn test_controller_source_with_smoothing() {
        let connections = vec![ModConnection::new(
            ModSource::Controller {
                cc: 1,
                curve: 0,
                smooth: 3,
                step: 0,
            },
            ModTarget::Volume,
            12.0,
        )];
        let mut matrix = ModMatrix::new(&connections, SR);
        let mut midi = MidiState::new(SR);
        let curves = CurveSet::new();
        matrix.trigger(&midi, &curves);

        midi.cc_event(0, 1, 1.0);
        let buffers = SourceBuffers::default();
        let mut out = vec![0.0; 512];
        matrix.render_target(ModTarget::Volume, &buffers, &midi, &curves, &mut out);

        // Smoothed: early values below the final target, converging to 12
        assert!(out[0] < 12.0);
        assert!(out[511] > 11.0);
        assert!(out.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_step_quantization() {
        let connections = vec![ModConnection::new(
            ModSource::Controller {
                cc: 1,
                curve: 0,
                smooth: 0,
                step: 64,
            },
            ModTarget::Volume,
            1.0,
        )];
        let mut matrix = ModMatrix::new(&connections, SR);
        let mut midi = MidiState::new(SR);
        let curves = CurveSet::new();

        midi.cc_event(0, 1, 0.3);
        matrix.trigger(&midi, &curves);
        let buffers = SourceBuffers::default();
        let mut out = vec![0.0; 4];
        matrix.render_target(ModTarget::Volume, &buffers, &midi, &curves, &mut out);
        // Quantized to multiples of 64/127
        let step = 64.0 / 127.0;
        assert!((out[0] - step * (0.3f32 / step).round()).abs() < 1e-5);
    }

    #[test]
    fn test_amplitude_is_multiplicative() {
        let connections = vec![
            ModConnection::new(ModSource::Lfo(0), ModTarget::Amplitude, 1.0),
            ModConnection::new(ModSource::Lfo(1), ModTarget::Amplitude, 1.0),
        ];
        let mut matrix = ModMatrix::new(&connections, SR);
        let midi = MidiState::new(SR);
        let curves = CurveSet::new();

        let lfos = vec![vec![0.5f32; 4], vec![0.5f32; 4]];
        let buffers = SourceBuffers {
            lfos: &lfos,
            ..Default::default()
        };

        let mut out = vec![0.0; 4];
        matrix.render_target(ModTarget::Amplitude, &buffers, &midi, &curves, &mut out);
        assert!((out[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_depth_mod_scales_contribution() {
        let connections = vec![ModConnection {
            source: ModSource::Lfo(0),
            target: ModTarget::Pitch,
            depth: 100.0,
            vel_to_depth: 0.0,
            depth_mod: Some(ModSource::Lfo(1)),
        }];
        let mut matrix = ModMatrix::new(&connections, SR);
        let midi = MidiState::new(SR);
        let curves = CurveSet::new();

        let lfos = vec![vec![1.0f32; 4], vec![0.25f32; 4]];
        let buffers = SourceBuffers {
            lfos: &lfos,
            ..Default::default()
        };

        let mut out = vec![0.0; 4];
        matrix.render_target(ModTarget::Pitch, &buffers, &midi, &curves, &mut out);
        assert!((out[0] - 25.0).abs() < 1e-4);
    }

    #[test]
    fn test_unconnected_target_is_neutral() {
        let mut matrix = ModMatrix::new(&[], SR);
        let midi = MidiState::new(SR);
        let curves = CurveSet::new();
        let buffers = SourceBuffers::default();

        let mut out = vec![9.0; 4];
        matrix.render_target(ModTarget::Pitch, &buffers, &midi, &curves, &mut out);
        assert!(out.iter().all(|&v| v == 0.0));

        matrix.render_target(ModTarget::Amplitude, &buffers, &midi, &curves, &mut out);
        assert!(out.iter().all(|&v| v == 1.0));
    }
}
