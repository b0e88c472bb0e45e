//! Region Module
//!
//! The immutable per-SFZ-region playback description plus the small
//! transient state (sequence counter) that advances per trigger. A region
//! is built by merging the opcode pairs of the enclosing `<global>`,
//! `<master>` and `<group>` sections with its own `<region>` section, in
//! that order, then parsing each pair; unknown opcodes become parse
//! warnings, malformed values keep their defaults.

use std::path::PathBuf;

use crate::curve::Curve;
use crate::envelope::EnvelopeParameters;
use crate::error::ParseWarning;
use crate::file_pool::FileId;
use crate::flex_eg::FlexPoint;
use crate::lfo::{LfoDescription, LfoSteps, LfoSub, LfoWave};
use crate::math::{cents_factor, db_to_gain};
use crate::midi_state::MidiState;
use crate::modulation::{ModConnection, ModSource, ModTarget};
use crate::opcode::{
    read_f32, read_i32, read_normalized, read_note, read_usize, split_cc_suffix, split_indexed,
};
use crate::oscillator::GeneratorWave;
use crate::config::constants::{
    DEFAULT_PEDAL_THRESHOLD, DEFAULT_SOSTENUTO_CC, DEFAULT_SUSTAIN_CC, MIN_RELEASE_TIME,
};
use crate::filter::{EqType, FilterType};

use std::f32::consts::FRAC_PI_2;

/// Stable region identity within the engine.
pub type RegionId = usize;

/// An inclusive value range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range<T> {
    pub lo: T,
    pub hi: T,
}

impl<T: PartialOrd + Copy> Range<T> {
    pub fn new(lo: T, hi: T) -> Self {
        Self { lo, hi }
    }

    #[inline]
    pub fn contains(&self, value: T) -> bool {
        value >= self.lo && value <= self.hi
    }
}

/// What a region plays.
#[derive(Debug, Clone, PartialEq)]
pub enum SoundSource {
    /// A sample file on disk
    File {
        path: PathBuf,
        reverse: bool,
    },

    /// A periodic generator waveform
    Generator(GeneratorWave),

    /// The noise generator
    Noise,

    /// Silence (the region still occupies a voice)
    Silence,
}

impl SoundSource {
    pub fn is_generator(&self) -> bool {
        matches!(self, SoundSource::Generator(_) | SoundSource::Noise)
    }
}

/// When a region triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerKind {
    /// On note-on, always
    #[default]
    Attack,

    /// On note-off (or pedal-deferred note-off)
    Release,

    /// On note-off regardless of the sustain pedal
    ReleaseKey,

    /// On note-on when no other note is held
    First,

    /// On note-on when at least one other note is held
    Legato,
}

/// Loop behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// Play through, stop with the note
    #[default]
    NoLoop,

    /// Play through, ignore note-off
    OneShot,

    /// Loop forever
    LoopContinuous,

    /// Loop while the note is held, then play to the end
    LoopSustain,
}

/// How an `off_by` kill releases its victims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffMode {
    /// Short fixed fade (~10 ms)
    #[default]
    Fast,

    /// The victim's own amplitude EG release
    Normal,

    /// A fixed time given by `off_time`
    Time,
}

/// Same-note retrigger masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelfMask {
    /// A new attack offs quieter earlier same-note voices
    #[default]
    Mask,

    /// Earlier voices keep playing
    DontMask,
}

/// Crossfade gain law.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossfadeCurve {
    /// Linear in position
    #[default]
    Gain,

    /// Equal-power sine
    Power,
}

/// A controller-driven additive modifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CcMod {
    pub cc: u16,
    pub value: f32,
}

/// ADSR envelope description with velocity and controller modifiers,
/// evaluated into concrete `EnvelopeParameters` at trigger time.
#[derive(Debug, Clone, PartialEq)]
pub struct EgDescription {
    pub delay: f32,
    pub attack: f32,
    pub hold: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    pub start: f32,
    pub depth: f32,

    pub vel2delay: f32,
    pub vel2attack: f32,
    pub vel2hold: f32,
    pub vel2decay: f32,
    pub vel2sustain: f32,
    pub vel2release: f32,
    pub vel2depth: f32,

    pub cc_attack: Vec<CcMod>,
    pub cc_decay: Vec<CcMod>,
    pub cc_sustain: Vec<CcMod>,
    pub cc_release: Vec<CcMod>,

    pub attack_shape: f32,
    pub decay_shape: f32,
    pub release_shape: f32,
}

impl Default for EgDescription {
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
            vel2delay: 0.0,
            vel2attack: 0.0,
            vel2hold: 0.0,
            vel2decay: 0.0,
            vel2sustain: 0.0,
            vel2release: 0.0,
            vel2depth: 0.0,
            cc_attack: Vec::new(),
            cc_decay: Vec::new(),
            cc_sustain: Vec::new(),
            cc_release: Vec::new(),
            attack_shape: 0.0,
            decay_shape: 0.0,
            release_shape: 0.0,
        }
    }
}

impl EgDescription {
    fn cc_sum(mods: &[CcMod], midi: &MidiState) -> f32 {
        mods.iter()
            .map(|m| midi.cc_value(m.cc) * m.value)
            .sum()
    }

    /// Evaluates the description for a trigger.
    pub fn evaluate(&self, midi: &MidiState, velocity: f32) -> EnvelopeParameters {
        EnvelopeParameters {
            delay: (self.delay + self.vel2delay * velocity).max(0.0),
            attack: (self.attack
                + self.vel2attack * velocity
                + Self::cc_sum(&self.cc_attack, midi))
            .max(0.0),
            hold: (self.hold + self.vel2hold * velocity).max(0.0),
            decay: (self.decay
                + self.vel2decay * velocity
                + Self::cc_sum(&self.cc_decay, midi))
            .max(0.0),
            sustain: (self.sustain
                + self.vel2sustain * velocity
                + Self::cc_sum(&self.cc_sustain, midi))
            .clamp(0.0, 1.0),
            release: (self.release
                + self.vel2release * velocity
                + Self::cc_sum(&self.cc_release, midi))
            .max(0.0),
            start: self.start.clamp(0.0, 1.0),
            depth: self.depth + self.vel2depth * velocity,
            attack_shape: self.attack_shape,
            decay_shape: self.decay_shape,
            release_shape: self.release_shape,
        }
    }
}

/// Per-region filter description.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDescription {
    pub filter_type: FilterType,
    pub cutoff: f32,
    pub resonance: f32,
    pub gain: f32,
    pub keytrack: f32,
    pub keycenter: u8,
    pub veltrack: f32,
    pub random: f32,
}

impl Default for FilterDescription {
    fn default() -> Self {
        Self {
            filter_type: FilterType::Lpf2p,
            cutoff: 20000.0,
            resonance: 0.0,
            gain: 0.0,
            keytrack: 0.0,
            keycenter: 60,
            veltrack: 0.0,
            random: 0.0,
        }
    }
}

/// Per-region EQ band description.
#[derive(Debug, Clone, PartialEq)]
pub struct EqDescription {
    pub eq_type: EqType,
    pub frequency: f32,
    pub bandwidth: f32,
    pub gain: f32,
    pub vel2frequency: f32,
    pub vel2gain: f32,
}

impl Default for EqDescription {
    fn default() -> Self {
        Self {
            eq_type: EqType::Peak,
            frequency: 1000.0,
            bandwidth: 1.0,
            gain: 0.0,
            vel2frequency: 0.0,
            vel2gain: 0.0,
        }
    }
}

/// Flex EG description plus its modulation depths.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlexEgEntry {
    pub points: Vec<FlexPoint>,
    pub sustain_point: usize,
    pub free_running: bool,
    pub amplitude_depth: f32,
    pub pitch_depth: f32,
    pub cutoff_depth: f32,
}

/// LFO description plus v2-style modulation depths.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LfoEntry {
    pub frequency: f32,
    pub phase: f32,
    pub delay: f32,
    pub fade: f32,
    pub wave: LfoWave,
    pub subs: Vec<LfoSub>,
    pub steps: Vec<f32>,
    pub amplitude_depth: f32,
    pub pitch_depth: f32,
    pub cutoff_depth: f32,
    pub pan_depth: f32,
}

impl LfoEntry {
    /// Lowers the entry into an `LfoDescription`.
    pub fn description(&self) -> LfoDescription {
        let subs = if self.subs.is_empty() {
            vec![LfoSub {
                wave: self.wave,
                ..Default::default()
            }]
        } else {
            self.subs.clone()
        };
        LfoDescription {
            frequency: self.frequency,
            phase: self.phase,
            delay: self.delay,
            fade: self.fade,
            subs,
            steps: (!self.steps.is_empty()).then(|| LfoSteps {
                steps: self.steps.clone(),
            }),
        }
    }
}

/// The full per-region description.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: RegionId,

    // Sound source
    pub source: SoundSource,
    pub oscillator_multi: usize,
    pub oscillator_detune: f32,

    // Activation conditions
    pub key_range: Range<u8>,
    pub vel_range: Range<f32>,
    pub bend_range: Range<f32>,
    pub aftertouch_range: Range<f32>,
    pub bpm_range: Range<f32>,
    pub rand_range: Range<f32>,
    pub cc_conditions: Vec<(u16, Range<f32>)>,
    pub cc_triggers: Vec<(u16, Range<f32>)>,
    pub trigger: TriggerKind,

    // Keyswitches
    pub sw_range: Option<Range<u8>>,
    pub sw_last: Option<u8>,
    pub sw_down: Option<u8>,
    pub sw_up: Option<u8>,
    pub sw_previous: Option<u8>,
    pub sw_default: Option<u8>,

    // Round robin
    pub sequence_length: u32,
    pub sequence_position: u32,
    sequence_counter: u32,

    // Playback
    pub offset: u64,
    pub offset_random: u64,
    pub offset_cc: Vec<(u16, f32)>,
    pub sample_end: u64,
    pub count: Option<u32>,
    pub loop_mode: Option<LoopMode>,
    pub loop_start: Option<u64>,
    pub loop_end: Option<u64>,
    pub loop_crossfade: f32,

    // Pitch
    pub pitch_keycenter: u8,
    pub pitch_keytrack: f32,
    pub pitch_veltrack: f32,
    pub pitch_random: f32,
    pub transpose: i32,
    pub tune: f32,
    pub bend_up: f32,
    pub bend_down: f32,
    pub bend_step: f32,

    // Amplitude
    pub amplitude: f32,
    pub volume: f32,
    pub pan: f32,
    pub width: f32,
    pub position: f32,
    pub amp_keycenter: u8,
    pub amp_keytrack: f32,
    pub amp_veltrack: f32,
    pub amp_random: f32,
    pub amp_velcurve: Option<Curve>,
    pub rt_decay: f32,

    // Crossfades
    pub xfin_key: Option<Range<u8>>,
    pub xfout_key: Option<Range<u8>>,
    pub xfin_vel: Option<Range<f32>>,
    pub xfout_vel: Option<Range<f32>>,
    pub xfin_cc: Vec<(u16, Range<f32>)>,
    pub xfout_cc: Vec<(u16, Range<f32>)>,
    pub xf_keycurve: CrossfadeCurve,
    pub xf_velcurve: CrossfadeCurve,
    pub xf_cccurve: CrossfadeCurve,

    // Envelopes
    pub amp_eg: EgDescription,
    pub pitch_eg: Option<EgDescription>,
    pub fil_eg: Option<EgDescription>,
    pub flex_egs: Vec<FlexEgEntry>,

    // LFOs
    pub lfos: Vec<LfoEntry>,

    // Filters and EQ
    pub filters: Vec<FilterDescription>,
    pub eqs: Vec<EqDescription>,

    // Grouping
    pub group: u64,
    pub off_by: Option<u64>,
    pub off_mode: OffMode,
    pub off_time: f32,
    pub polyphony: Option<usize>,
    pub note_polyphony: Option<usize>,
    pub self_mask: SelfMask,

    // Pedals
    pub sustain_cc: u16,
    pub sostenuto_cc: u16,
    pub sustain_threshold: f32,
    pub sostenuto_threshold: f32,
    pub sustain_enabled: bool,
    pub sostenuto_enabled: bool,

    // Modulation routing
    pub connections: Vec<ModConnection>,

    // Bus routing: (bus index, linear gain)
    pub effect_sends: Vec<(usize, f32)>,

    // Assigned at load
    pub file_id: Option<FileId>,
    pub enabled: bool,
}

impl Region {
    /// Creates a region with all defaults.
    pub fn new(id: RegionId) -> Self {
        Self {
            id,
            source: SoundSource::Silence,
            oscillator_multi: 1,
            oscillator_detune: 0.0,
            key_range: Range::new(0, 127),
            vel_range: Range::new(0.0, 1.0),
            bend_range: Range::new(-1.0, 1.0),
            aftertouch_range: Range::new(0.0, 1.0),
            bpm_range: Range::new(0.0, 500.0),
            rand_range: Range::new(0.0, 1.0),
            cc_conditions: Vec::new(),
            cc_triggers: Vec::new(),
            trigger: TriggerKind::Attack,
            sw_range: None,
            sw_last: None,
            sw_down: None,
            sw_up: None,
            sw_previous: None,
            sw_default: None,
            sequence_length: 1,
            sequence_position: 1,
            sequence_counter: 0,
            offset: 0,
            offset_random: 0,
            offset_cc: Vec::new(),
            sample_end: u64::MAX,
            count: None,
            loop_mode: None,
            loop_start: None,
            loop_end: None,
            loop_crossfade: 0.0,
            pitch_keycenter: 60,
            pitch_keytrack: 100.0,
            pitch_veltrack: 0.0,
            pitch_random: 0.0,
            transpose: 0,
            tune: 0.0,
            bend_up: 200.0,
            bend_down: -200.0,
            bend_step: 1.0,
            amplitude: 100.0,
            volume: 0.0,
            pan: 0.0,
            width: 100.0,
            position: 0.0,
            amp_keycenter: 60,
            amp_keytrack: 0.0,
            amp_veltrack: 100.0,
            amp_random: 0.0,
            amp_velcurve: None,
            rt_decay: 0.0,
            xfin_key: None,
            xfout_key: None,
            xfin_vel: None,
            xfout_vel: None,
            xfin_cc: Vec::new(),
            xfout_cc: Vec::new(),
            xf_keycurve: CrossfadeCurve::Gain,
            xf_velcurve: CrossfadeCurve::Gain,
            xf_cccurve: CrossfadeCurve::Gain,
            amp_eg: EgDescription::default(),
            pitch_eg: None,
            fil_eg: None,
            flex_egs: Vec::new(),
            lfos: Vec::new(),
            filters: Vec::new(),
            eqs: Vec::new(),
            group: 0,
            off_by: None,
            off_mode: OffMode::Fast,
            off_time: 0.006,
            polyphony: None,
            note_polyphony: None,
            self_mask: SelfMask::Mask,
            sustain_cc: DEFAULT_SUSTAIN_CC,
            sostenuto_cc: DEFAULT_SOSTENUTO_CC,
            sustain_threshold: DEFAULT_PEDAL_THRESHOLD,
            sostenuto_threshold: DEFAULT_PEDAL_THRESHOLD,
            sustain_enabled: true,
            sostenuto_enabled: true,
            connections: Vec::new(),
            effect_sends: Vec::new(),
            file_id: None,
            enabled: true,
        }
    }

    /// Builds a region from merged opcode pairs.
    pub fn from_opcodes<'a>(
        id: RegionId,
        opcodes: impl IntoIterator<Item = (&'a str, &'a str)>,
        warnings: &mut Vec<ParseWarning>,
    ) -> Self {
        let mut region = Self::new(id);
        for (name, value) in opcodes {
            region.parse_opcode(name, value, warnings);
        }
        region.finalize();
        region
    }

    /// Applies post-parse fixups and invariants.
    pub fn finalize(&mut self) {
        // A play count forces one-shot
        if self.count.is_some() {
            self.loop_mode = Some(LoopMode::OneShot);
        }

        // Release triggers need a positive release to avoid clicks
        if matches!(self.trigger, TriggerKind::Release | TriggerKind::ReleaseKey)
            && self.amp_eg.release < MIN_RELEASE_TIME
        {
            self.amp_eg.release = MIN_RELEASE_TIME;
        }

        // Reverse playback with loop points is not handled
        if let SoundSource::File { reverse: true, .. } = self.source {
            if self.loop_start.is_some() || self.loop_end.is_some() {
                log::warn!(
                    "region {}: loop points on a reversed sample are unsupported, ignoring",
                    self.id
                );
                self.loop_start = None;
                self.loop_end = None;
                self.loop_mode = Some(LoopMode::NoLoop);
            }
        }
    }

    /// Whether this region can play at all.
    pub fn is_disabled(&self) -> bool {
        !self.enabled || self.sample_end == 0
    }

    /// Marks the region unusable (missing or undecodable sample).
    pub fn disable(&mut self) {
        self.enabled = false;
        self.sample_end = 0;
    }

    /// The effective loop mode, deriving the default from the source.
    pub fn effective_loop_mode(&self) -> LoopMode {
        self.loop_mode.unwrap_or({
            if self.loop_start.is_some() || self.loop_end.is_some() {
                LoopMode::LoopContinuous
            } else {
                LoopMode::NoLoop
            }
        })
    }

    // --- Activation ---

    fn keyswitch_matches(
        &self,
        last_keyswitch: Option<u8>,
        previous_note: Option<u8>,
        midi: &MidiState,
    ) -> bool {
        if let Some(required) = self.sw_last {
            let current = last_keyswitch.or(self.sw_default);
            if current != Some(required) {
                return false;
            }
        }
        if let Some(down) = self.sw_down {
            if !midi.is_note_pressed(down) {
                return false;
            }
        }
        if let Some(up) = self.sw_up {
            if midi.is_note_pressed(up) {
                return false;
            }
        }
        if let Some(previous) = self.sw_previous {
            if previous_note != Some(previous) {
                return false;
            }
        }
        true
    }

    fn conditions_match(&self, midi: &MidiState) -> bool {
        if !self.bend_range.contains(midi.pitch_bend()) {
            return false;
        }
        if !self.aftertouch_range.contains(midi.channel_aftertouch()) {
            return false;
        }
        if !self.bpm_range.contains(midi.bpm()) {
            return false;
        }
        self.cc_conditions
            .iter()
            .all(|(cc, range)| range.contains(midi.cc_value(*cc)))
    }

    /// Evaluates note-on activation. `random` is the per-event uniform
    /// draw; `active_notes_before` is the held-note count before this
    /// event, used by `first`/`legato` triggers.
    #[allow(clippy::too_many_arguments)]
    pub fn matches_note_on(
        &mut self,
        key: u8,
        velocity: f32,
        random: f32,
        midi: &MidiState,
        last_keyswitch: Option<u8>,
        previous_note: Option<u8>,
        active_notes_before: usize,
    ) -> bool {
        if self.is_disabled() {
            return false;
        }
        let trigger_ok = match self.trigger {
            TriggerKind::Attack => true,
            TriggerKind::First => active_notes_before == 0,
            TriggerKind::Legato => active_notes_before > 0,
            TriggerKind::Release | TriggerKind::ReleaseKey => false,
        };
        if !trigger_ok
            || !self.key_range.contains(key)
            || !self.vel_range.contains(velocity)
            || !self.rand_range.contains(random)
            || !self.conditions_match(midi)
            || !self.keyswitch_matches(last_keyswitch, previous_note, midi)
        {
            return false;
        }
        self.sequence_matches()
    }

    /// Evaluates note-off activation for release triggers. The stored
    /// note-on velocity drives the velocity check.
    pub fn matches_note_off(
        &mut self,
        key: u8,
        midi: &MidiState,
        last_keyswitch: Option<u8>,
        previous_note: Option<u8>,
    ) -> bool {
        if self.is_disabled() {
            return false;
        }
        if !matches!(self.trigger, TriggerKind::Release | TriggerKind::ReleaseKey) {
            return false;
        }
        let velocity = midi.note_velocity(key);
        if !self.key_range.contains(key)
            || !self.vel_range.contains(velocity)
            || !self.conditions_match(midi)
            || !self.keyswitch_matches(last_keyswitch, previous_note, midi)
        {
            return false;
        }
        self.sequence_matches()
    }

    /// Evaluates CC-triggered activation: true when `value` enters one of
    /// the trigger ranges that `previous` was outside of.
    pub fn matches_cc(&self, number: u16, value: f32, previous: f32) -> bool {
        if self.is_disabled() {
            return false;
        }
        self.cc_triggers.iter().any(|(cc, range)| {
            *cc == number && range.contains(value) && !range.contains(previous)
        })
    }

    /// Advances the round-robin counter; true when the region's slot in
    /// the sequence came up.
    fn sequence_matches(&mut self) -> bool {
        let position = self.sequence_counter % self.sequence_length.max(1);
        self.sequence_counter = self.sequence_counter.wrapping_add(1);
        position == self.sequence_position.saturating_sub(1) % self.sequence_length.max(1)
    }

    /// Resets transient trigger state (sequence position).
    pub fn reset_sequence(&mut self) {
        self.sequence_counter = 0;
    }

    // --- Gain and pitch evaluation ---

    /// The amplitude velocity curve: custom 128-point table or the
    /// default `v^2`, scaled by `amp_veltrack`.
    pub fn velocity_gain(&self, velocity: f32) -> f32 {
        let velocity = velocity.clamp(0.0, 1.0);
        let curve_value = match &self.amp_velcurve {
            Some(curve) => curve.eval(velocity),
            None => velocity * velocity,
        };
        let track = self.amp_veltrack / 100.0;
        let gain = track.abs() * (1.0 - curve_value);
        if track < 0.0 {
            gain
        } else {
            1.0 - gain
        }
    }

    fn crossfade_position<T: Into<f32> + Copy>(range: &Range<T>, value: f32) -> f32 {
        let lo: f32 = range.lo.into();
        let hi: f32 = range.hi.into();
        if hi <= lo {
            return 1.0;
        }
        ((value - lo) / (hi - lo)).clamp(0.0, 1.0)
    }

    /// Fade-in gain over a key range (relative equal-power law).
    fn xf_in_key(range: &Range<u8>, key: u8, curve: CrossfadeCurve) -> f32 {
        let position =
            Self::crossfade_position(&Range::new(range.lo as f32, range.hi as f32), key as f32);
        match curve {
            CrossfadeCurve::Gain => position,
            CrossfadeCurve::Power => (position * FRAC_PI_2).sin(),
        }
    }

    fn xf_out_key(range: &Range<u8>, key: u8, curve: CrossfadeCurve) -> f32 {
        let position =
            Self::crossfade_position(&Range::new(range.lo as f32, range.hi as f32), key as f32);
        match curve {
            CrossfadeCurve::Gain => 1.0 - position,
            CrossfadeCurve::Power => ((1.0 - position) * FRAC_PI_2).sin(),
        }
    }

    /// Fade-in gain over a normalized value range. The equal-power law
    /// advances the quarter sine with the absolute distance into the
    /// fade, so overlapping layers sum to unit power at the hand-off.
    fn xf_in_value(range: &Range<f32>, value: f32, curve: CrossfadeCurve) -> f32 {
        match curve {
            CrossfadeCurve::Gain => Self::crossfade_position(range, value),
            CrossfadeCurve::Power => {
                let span = (range.hi - range.lo).max(0.0);
                let distance = (value - range.lo).clamp(0.0, span);
                (distance * FRAC_PI_2).sin().min(1.0)
            }
        }
    }

    fn xf_out_value(range: &Range<f32>, value: f32, curve: CrossfadeCurve) -> f32 {
        match curve {
            CrossfadeCurve::Gain => 1.0 - Self::crossfade_position(range, value),
            CrossfadeCurve::Power => {
                let span = (range.hi - range.lo).max(0.0);
                let distance = (range.hi - value).clamp(0.0, span);
                (distance * FRAC_PI_2).sin().min(1.0)
            }
        }
    }

    /// Combined key/velocity crossfade gain at trigger time.
    pub fn crossfade_gain(&self, key: u8, velocity: f32) -> f32 {
        let mut gain = 1.0;
        if let Some(range) = &self.xfin_key {
            gain *= Self::xf_in_key(range, key, self.xf_keycurve);
        }
        if let Some(range) = &self.xfout_key {
            gain *= Self::xf_out_key(range, key, self.xf_keycurve);
        }
        if let Some(range) = &self.xfin_vel {
            gain *= Self::xf_in_value(range, velocity, self.xf_velcurve);
        }
        if let Some(range) = &self.xfout_vel {
            gain *= Self::xf_out_value(range, velocity, self.xf_velcurve);
        }
        gain
    }

    /// Controller crossfade gain, re-evaluated per block.
    pub fn cc_crossfade_gain(&self, midi: &MidiState) -> f32 {
        let mut gain = 1.0;
        for (cc, range) in &self.xfin_cc {
            gain *= Self::xf_in_value(range, midi.cc_value(*cc), self.xf_cccurve);
        }
        for (cc, range) in &self.xfout_cc {
            gain *= Self::xf_out_value(range, midi.cc_value(*cc), self.xf_cccurve);
        }
        gain
    }

    /// The base linear gain for a trigger: amplitude, velocity curve,
    /// key tracking and the random dB draw.
    pub fn base_gain(&self, key: u8, velocity: f32, random: f32) -> f32 {
        let mut gain = self.amplitude / 100.0;
        gain *= self.velocity_gain(velocity);
        gain *= db_to_gain(self.amp_keytrack * (key as f32 - self.amp_keycenter as f32));
        gain *= db_to_gain(self.amp_random * random);
        gain *= self.crossfade_gain(key, velocity);
        gain
    }

    /// The base pitch ratio for a trigger, before per-block modulation.
    pub fn base_pitch_cents(&self, key: u8, velocity: f32, random: f32) -> f32 {
        let keytrack = self.pitch_keytrack * (key as f32 - self.pitch_keycenter as f32);
        keytrack
            + self.tune
            + self.transpose as f32 * 100.0
            + self.pitch_veltrack * velocity
            + self.pitch_random * (random * 2.0 - 1.0)
    }

    /// The base pitch ratio including the keytrack cents.
    pub fn base_pitch_ratio(&self, key: u8, velocity: f32, random: f32) -> f32 {
        cents_factor(self.base_pitch_cents(key, velocity, random))
    }

    /// Pitch-bend cents for a normalized bend value, scaled by the bend
    /// range and optionally quantized to `bend_step` cents.
    pub fn bend_cents(&self, bend: f32) -> f32 {
        let cents = if bend >= 0.0 {
            bend * self.bend_up
        } else {
            -bend * self.bend_down
        };
        if self.bend_step > 1.0 {
            (cents / self.bend_step).round() * self.bend_step
        } else {
            cents
        }
    }

    /// The playback start offset for a trigger.
    pub fn start_offset(&self, random: f32, midi: &MidiState) -> u64 {
        let mut offset = self.offset as f32 + self.offset_random as f32 * random;
        for (cc, scale) in &self.offset_cc {
            offset += midi.cc_value(*cc) * scale;
        }
        offset.max(0.0) as u64
    }

    /// rt_decay attenuation in dB for a note held `seconds`.
    pub fn rt_decay_db(&self, seconds: f32) -> f32 {
        -self.rt_decay * seconds.max(0.0)
    }

    // --- Opcode parsing ---

    fn set_f32(target: &mut f32, name: &str, value: &str, warnings: &mut Vec<ParseWarning>) {
        match read_f32(value) {
            Some(parsed) => *target = parsed,
            None => warnings.push(ParseWarning::malformed(name, value)),
        }
    }

    fn set_note(target: &mut u8, name: &str, value: &str, warnings: &mut Vec<ParseWarning>) {
        match read_note(value) {
            Some(parsed) => *target = parsed,
            None => warnings.push(ParseWarning::malformed(name, value)),
        }
    }

    fn filter_at(&mut self, index: usize) -> &mut FilterDescription {
        while self.filters.len() <= index {
            self.filters.push(FilterDescription::default());
        }
        &mut self.filters[index]
    }

    fn eq_at(&mut self, index: usize) -> &mut EqDescription {
        while self.eqs.len() <= index {
            self.eqs.push(EqDescription::default());
        }
        &mut self.eqs[index]
    }

    fn lfo_at(&mut self, index: usize) -> &mut LfoEntry {
        while self.lfos.len() <= index {
            self.lfos.push(LfoEntry::default());
        }
        &mut self.lfos[index]
    }

    fn flex_eg_at(&mut self, index: usize) -> &mut FlexEgEntry {
        while self.flex_egs.len() <= index {
            self.flex_egs.push(FlexEgEntry::default());
        }
        &mut self.flex_egs[index]
    }

    fn parse_sample(&mut self, value: &str) {
        let trimmed = value.trim();
        self.source = match trimmed {
            "*sine" => SoundSource::Generator(GeneratorWave::Sine),
            "*saw" => SoundSource::Generator(GeneratorWave::Saw),
            "*square" => SoundSource::Generator(GeneratorWave::Square),
            "*triangle" => SoundSource::Generator(GeneratorWave::Triangle),
            "*noise" => SoundSource::Noise,
            "*silence" => SoundSource::Silence,
            path => SoundSource::File {
                path: PathBuf::from(path.replace('\\', "/")),
                reverse: false,
            },
        };
    }

    fn parse_trigger(&mut self, value: &str, warnings: &mut Vec<ParseWarning>) {
        self.trigger = match value.trim() {
            "attack" => TriggerKind::Attack,
            "release" => TriggerKind::Release,
            "release_key" => TriggerKind::ReleaseKey,
            "first" => TriggerKind::First,
            "legato" => TriggerKind::Legato,
            _ => {
                warnings.push(ParseWarning::malformed("trigger", value));
                return;
            }
        };
    }

    fn parse_loop_mode(&mut self, value: &str, warnings: &mut Vec<ParseWarning>) {
        self.loop_mode = match value.trim() {
            "no_loop" => Some(LoopMode::NoLoop),
            "one_shot" => Some(LoopMode::OneShot),
            "loop_continuous" => Some(LoopMode::LoopContinuous),
            "loop_sustain" => Some(LoopMode::LoopSustain),
            _ => {
                warnings.push(ParseWarning::malformed("loop_mode", value));
                return;
            }
        };
    }

    fn parse_filter_type(value: &str) -> Option<FilterType> {
        Some(match value.trim() {
            "none" => FilterType::None,
            "lpf_1p" => FilterType::Lpf1p,
            "hpf_1p" => FilterType::Hpf1p,
            "lpf_2p" => FilterType::Lpf2p,
            "hpf_2p" => FilterType::Hpf2p,
            "bpf_2p" => FilterType::Bpf2p,
            "brf_2p" => FilterType::Brf2p,
            "apf_2p" | "apf_1p" => FilterType::Apf2p,
            "lpf_4p" => FilterType::Lpf4p,
            "hpf_4p" => FilterType::Hpf4p,
            "lpf_6p" => FilterType::Lpf6p,
            "hpf_6p" => FilterType::Hpf6p,
            "lpf_sv" => FilterType::LpfSv,
            "hpf_sv" => FilterType::HpfSv,
            "bpf_sv" => FilterType::BpfSv,
            "brf_sv" => FilterType::BrfSv,
            "peq" => FilterType::Peak,
            "lsh" => FilterType::LowShelf,
            "hsh" => FilterType::HighShelf,
            "pink" => FilterType::Pink,
            _ => return None,
        })
    }

    fn parse_lfo_wave(value: &str) -> Option<LfoWave> {
        Some(match read_i32(value)? {
            0 => LfoWave::Triangle,
            1 => LfoWave::Sine,
            2 => LfoWave::Pulse75,
            3 => LfoWave::Square,
            4 => LfoWave::Pulse25,
            5 => LfoWave::Pulse12_5,
            6 => LfoWave::Ramp,
            7 => LfoWave::Saw,
            12 => LfoWave::RandomSh,
            _ => return None,
        })
    }

    fn parse_eg_opcode(
        eg: &mut EgDescription,
        rest: &str,
        value: &str,
        warnings: &mut Vec<ParseWarning>,
    ) -> bool {
        match rest {
            "delay" => Self::set_f32(&mut eg.delay, rest, value, warnings),
            "attack" => Self::set_f32(&mut eg.attack, rest, value, warnings),
            "hold" => Self::set_f32(&mut eg.hold, rest, value, warnings),
            "decay" => Self::set_f32(&mut eg.decay, rest, value, warnings),
            "release" => Self::set_f32(&mut eg.release, rest, value, warnings),
            "sustain" => {
                // Percent in the source format
                if let Some(v) = read_f32(value) {
                    eg.sustain = (v / 100.0).clamp(0.0, 1.0);
                } else {
                    warnings.push(ParseWarning::malformed(rest, value));
                }
            }
            "start" => {
                if let Some(v) = read_f32(value) {
                    eg.start = (v / 100.0).clamp(0.0, 1.0);
                }
            }
            "depth" => Self::set_f32(&mut eg.depth, rest, value, warnings),
            "vel2delay" => Self::set_f32(&mut eg.vel2delay, rest, value, warnings),
            "vel2attack" => Self::set_f32(&mut eg.vel2attack, rest, value, warnings),
            "vel2hold" => Self::set_f32(&mut eg.vel2hold, rest, value, warnings),
            "vel2decay" => Self::set_f32(&mut eg.vel2decay, rest, value, warnings),
            "vel2sustain" => {
                if let Some(v) = read_f32(value) {
                    eg.vel2sustain = v / 100.0;
                }
            }
            "vel2release" => Self::set_f32(&mut eg.vel2release, rest, value, warnings),
            "vel2depth" => Self::set_f32(&mut eg.vel2depth, rest, value, warnings),
            "attack_shape" => Self::set_f32(&mut eg.attack_shape, rest, value, warnings),
            "decay_shape" => Self::set_f32(&mut eg.decay_shape, rest, value, warnings),
            "release_shape" => Self::set_f32(&mut eg.release_shape, rest, value, warnings),
            _ => {
                // attack_oncc1 and friends
                if let Some((param, cc)) = split_cc_suffix(rest) {
                    let list = match param.trim_end_matches("_oncc").trim_end_matches("_cc") {
                        "attack" => &mut eg.cc_attack,
                        "decay" => &mut eg.cc_decay,
                        "release" => &mut eg.cc_release,
                        "sustain" => &mut eg.cc_sustain,
                        _ => return false,
                    };
                    if let Some(v) = read_f32(value) {
                        let scaled = if param.starts_with("sustain") {
                            v / 100.0
                        } else {
                            v
                        };
                        list.push(CcMod { cc, value: scaled });
                    }
                    return true;
                }
                return false;
            }
        }
        true
    }

    /// Parses one opcode into the region. Unknown names or malformed
    /// values are reported through `warnings` and never fail.
    pub fn parse_opcode(&mut self, name: &str, value: &str, warnings: &mut Vec<ParseWarning>) {
        match name {
            "sample" => self.parse_sample(value),
            "direction" => {
                if let SoundSource::File { reverse, .. } = &mut self.source {
                    *reverse = value.trim() == "reverse";
                }
            }
            "oscillator_multi" => {
                if let Some(v) = read_usize(value) {
                    self.oscillator_multi = v.clamp(1, 9);
                }
            }
            "oscillator_detune" => {
                Self::set_f32(&mut self.oscillator_detune, name, value, warnings)
            }

            "key" => {
                if let Some(note) = read_note(value) {
                    self.key_range = Range::new(note, note);
                    self.pitch_keycenter = note;
                } else {
                    warnings.push(ParseWarning::malformed(name, value));
                }
            }
            "lokey" => Self::set_note(&mut self.key_range.lo, name, value, warnings),
            "hikey" => Self::set_note(&mut self.key_range.hi, name, value, warnings),
            "lovel" => {
                if let Some(v) = read_normalized(value) {
                    self.vel_range.lo = v;
                }
            }
            "hivel" => {
                if let Some(v) = read_normalized(value) {
                    self.vel_range.hi = v;
                }
            }
            "lobend" => {
                if let Some(v) = read_f32(value) {
                    self.bend_range.lo = (v / 8192.0).clamp(-1.0, 1.0);
                }
            }
            "hibend" => {
                if let Some(v) = read_f32(value) {
                    self.bend_range.hi = (v / 8192.0).clamp(-1.0, 1.0);
                }
            }
            "lochanaft" => {
                if let Some(v) = read_normalized(value) {
                    self.aftertouch_range.lo = v;
                }
            }
            "hichanaft" => {
                if let Some(v) = read_normalized(value) {
                    self.aftertouch_range.hi = v;
                }
            }
            "lobpm" => Self::set_f32(&mut self.bpm_range.lo, name, value, warnings),
            "hibpm" => Self::set_f32(&mut self.bpm_range.hi, name, value, warnings),
            "lorand" => Self::set_f32(&mut self.rand_range.lo, name, value, warnings),
            "hirand" => Self::set_f32(&mut self.rand_range.hi, name, value, warnings),
            "seq_length" => {
                if let Some(v) = read_usize(value) {
                    self.sequence_length = (v as u32).max(1);
                }
            }
            "seq_position" => {
                if let Some(v) = read_usize(value) {
                    self.sequence_position = (v as u32).max(1);
                }
            }
            "trigger" => self.parse_trigger(value, warnings),

            "sw_lokey" => {
                let mut lo = self.sw_range.map(|r| r.lo).unwrap_or(0);
                Self::set_note(&mut lo, name, value, warnings);
                let hi = self.sw_range.map(|r| r.hi).unwrap_or(127);
                self.sw_range = Some(Range::new(lo, hi));
            }
            "sw_hikey" => {
                let mut hi = self.sw_range.map(|r| r.hi).unwrap_or(127);
                Self::set_note(&mut hi, name, value, warnings);
                let lo = self.sw_range.map(|r| r.lo).unwrap_or(0);
                self.sw_range = Some(Range::new(lo, hi));
            }
            "sw_last" => self.sw_last = read_note(value),
            "sw_down" => self.sw_down = read_note(value),
            "sw_up" => self.sw_up = read_note(value),
            "sw_previous" => self.sw_previous = read_note(value),
            "sw_default" => self.sw_default = read_note(value),

            "offset" => {
                if let Some(v) = read_usize(value) {
                    self.offset = v as u64;
                }
            }
            "offset_random" => {
                if let Some(v) = read_usize(value) {
                    self.offset_random = v as u64;
                }
            }
            "end" => {
                if let Some(v) = read_i32(value) {
                    if v < 0 {
                        self.disable();
                    } else {
                        self.sample_end = v as u64;
                    }
                }
            }
            "count" => self.count = read_usize(value).map(|v| v as u32),
            "loop_mode" | "loopmode" => self.parse_loop_mode(value, warnings),
            "loop_start" | "loopstart" => {
                self.loop_start = read_usize(value).map(|v| v as u64)
            }
            "loop_end" | "loopend" => self.loop_end = read_usize(value).map(|v| v as u64),
            "loop_crossfade" => {
                Self::set_f32(&mut self.loop_crossfade, name, value, warnings)
            }

            "pitch_keycenter" => {
                Self::set_note(&mut self.pitch_keycenter, name, value, warnings)
            }
            "pitch_keytrack" => {
                Self::set_f32(&mut self.pitch_keytrack, name, value, warnings)
            }
            "pitch_veltrack" => {
                Self::set_f32(&mut self.pitch_veltrack, name, value, warnings)
            }
            "pitch_random" => Self::set_f32(&mut self.pitch_random, name, value, warnings),
            "transpose" => {
                if let Some(v) = read_i32(value) {
                    self.transpose = v.clamp(-127, 127);
                }
            }
            "tune" | "pitch" => Self::set_f32(&mut self.tune, name, value, warnings),
            "bend_up" | "bendup" => Self::set_f32(&mut self.bend_up, name, value, warnings),
            "bend_down" | "benddown" => {
                Self::set_f32(&mut self.bend_down, name, value, warnings)
            }
            "bend_step" => Self::set_f32(&mut self.bend_step, name, value, warnings),

            "volume" | "gain" => Self::set_f32(&mut self.volume, name, value, warnings),
            "amplitude" => Self::set_f32(&mut self.amplitude, name, value, warnings),
            "pan" => Self::set_f32(&mut self.pan, name, value, warnings),
            "width" => Self::set_f32(&mut self.width, name, value, warnings),
            "position" => Self::set_f32(&mut self.position, name, value, warnings),
            "amp_keycenter" => {
                Self::set_note(&mut self.amp_keycenter, name, value, warnings)
            }
            "amp_keytrack" => Self::set_f32(&mut self.amp_keytrack, name, value, warnings),
            "amp_veltrack" => Self::set_f32(&mut self.amp_veltrack, name, value, warnings),
            "amp_random" => Self::set_f32(&mut self.amp_random, name, value, warnings),
            "rt_decay" => Self::set_f32(&mut self.rt_decay, name, value, warnings),

            "group" => {
                if let Some(v) = read_usize(value) {
                    self.group = v as u64;
                }
            }
            "off_by" | "offby" => self.off_by = read_usize(value).map(|v| v as u64),
            "off_mode" => {
                self.off_mode = match value.trim() {
                    "fast" => OffMode::Fast,
                    "normal" => OffMode::Normal,
                    "time" => OffMode::Time,
                    _ => {
                        warnings.push(ParseWarning::malformed(name, value));
                        return;
                    }
                };
            }
            "off_time" => Self::set_f32(&mut self.off_time, name, value, warnings),
            "polyphony" => self.polyphony = read_usize(value),
            "note_polyphony" => self.note_polyphony = read_usize(value),
            "note_selfmask" => {
                self.self_mask = match value.trim() {
                    "on" | "mask" => SelfMask::Mask,
                    "off" | "dontmask" => SelfMask::DontMask,
                    _ => {
                        warnings.push(ParseWarning::malformed(name, value));
                        return;
                    }
                };
            }

            "sustain_cc" => {
                if let Some(v) = read_usize(value) {
                    self.sustain_cc = v as u16;
                }
            }
            "sostenuto_cc" => {
                if let Some(v) = read_usize(value) {
                    self.sostenuto_cc = v as u16;
                }
            }
            "sustain_lo" => {
                if let Some(v) = read_normalized(value) {
                    self.sustain_threshold = v;
                }
            }
            "sostenuto_lo" => {
                if let Some(v) = read_normalized(value) {
                    self.sostenuto_threshold = v;
                }
            }
            "sustain_sw" => self.sustain_enabled = value.trim() != "off",
            "sostenuto_sw" => self.sostenuto_enabled = value.trim() != "off",

            "xfin_lokey" => {
                let hi = self.xfin_key.map(|r| r.hi).unwrap_or(127);
                if let Some(v) = read_note(value) {
                    self.xfin_key = Some(Range::new(v, hi));
                }
            }
            "xfin_hikey" => {
                let lo = self.xfin_key.map(|r| r.lo).unwrap_or(0);
                if let Some(v) = read_note(value) {
                    self.xfin_key = Some(Range::new(lo, v));
                }
            }
            "xfout_lokey" => {
                let hi = self.xfout_key.map(|r| r.hi).unwrap_or(127);
                if let Some(v) = read_note(value) {
                    self.xfout_key = Some(Range::new(v, hi));
                }
            }
            "xfout_hikey" => {
                let lo = self.xfout_key.map(|r| r.lo).unwrap_or(0);
                if let Some(v) = read_note(value) {
                    self.xfout_key = Some(Range::new(lo, v));
                }
            }
            "xfin_lovel" => {
                let hi = self.xfin_vel.map(|r| r.hi).unwrap_or(1.0);
                if let Some(v) = read_normalized(value) {
                    self.xfin_vel = Some(Range::new(v, hi));
                }
            }
            "xfin_hivel" => {
                let lo = self.xfin_vel.map(|r| r.lo).unwrap_or(0.0);
                if let Some(v) = read_normalized(value) {
                    self.xfin_vel = Some(Range::new(lo, v));
                }
            }
            "xfout_lovel" => {
                let hi = self.xfout_vel.map(|r| r.hi).unwrap_or(1.0);
                if let Some(v) = read_normalized(value) {
                    self.xfout_vel = Some(Range::new(v, hi));
                }
            }
            "xfout_hivel" => {
                let lo = self.xfout_vel.map(|r| r.lo).unwrap_or(0.0);
                if let Some(v) = read_normalized(value) {
                    self.xfout_vel = Some(Range::new(lo, v));
                }
            }
            "xf_keycurve" => {
                self.xf_keycurve = Self::parse_xf_curve(name, value, warnings);
            }
            "xf_velcurve" => {
                self.xf_velcurve = Self::parse_xf_curve(name, value, warnings);
            }
            "xf_cccurve" => {
                self.xf_cccurve = Self::parse_xf_curve(name, value, warnings);
            }

            _ => self.parse_compound_opcode(name, value, warnings),
        }
    }

    fn parse_xf_curve(
        name: &str,
        value: &str,
        warnings: &mut Vec<ParseWarning>,
    ) -> CrossfadeCurve {
        match value.trim() {
            "gain" => CrossfadeCurve::Gain,
            "power" => CrossfadeCurve::Power,
            _ => {
                warnings.push(ParseWarning::malformed(name, value));
                CrossfadeCurve::Gain
            }
        }
    }

    /// Handles sub-indexed opcode families: CC ranges, per-CC modifiers,
    /// amp velocity curve points, EG/LFO/filter/EQ banks and effect sends.
    fn parse_compound_opcode(
        &mut self,
        name: &str,
        value: &str,
        warnings: &mut Vec<ParseWarning>,
    ) {
        // ampeg_, pitcheg_, fileg_ families
        if let Some(rest) = name.strip_prefix("ampeg_") {
            if Self::parse_eg_opcode(&mut self.amp_eg, rest, value, warnings) {
                return;
            }
        } else if let Some(rest) = name.strip_prefix("pitcheg_") {
            let eg = self.pitch_eg.get_or_insert_with(EgDescription::default);
            if Self::parse_eg_opcode(eg, rest, value, warnings) {
                return;
            }
        } else if let Some(rest) = name.strip_prefix("fileg_") {
            let eg = self.fil_eg.get_or_insert_with(EgDescription::default);
            if Self::parse_eg_opcode(eg, rest, value, warnings) {
                return;
            }
        }

        // v1-style LFOs: amplfo_, pitchlfo_, fillfo_
        for (prefix, target) in [
            ("amplfo_", ModTarget::Volume),
            ("pitchlfo_", ModTarget::Pitch),
            ("fillfo_", ModTarget::FilCutoff(0)),
        ] {
            if let Some(rest) = name.strip_prefix(prefix) {
                let index = match target {
                    ModTarget::Volume => 0,
                    ModTarget::Pitch => 1,
                    _ => 2,
                };
                match rest {
                    "freq" => {
                        if let Some(v) = read_f32(value) {
                            self.lfo_at(index).frequency = v;
                        }
                    }
                    "delay" => {
                        if let Some(v) = read_f32(value) {
                            self.lfo_at(index).delay = v;
                        }
                    }
                    "fade" => {
                        if let Some(v) = read_f32(value) {
                            self.lfo_at(index).fade = v;
                        }
                    }
                    "depth" => {
                        if let Some(v) = read_f32(value) {
                            let entry = self.lfo_at(index);
                            match target {
                                ModTarget::Volume => entry.amplitude_depth = v,
                                ModTarget::Pitch => entry.pitch_depth = v,
                                _ => entry.cutoff_depth = v,
                            }
                        }
                    }
                    _ => warnings.push(ParseWarning::unknown(name, value)),
                }
                return;
            }
        }

        // amp_velcurve_N
        if let Some(rest) = name.strip_prefix("amp_velcurve_") {
            if let (Ok(index), Some(v)) = (rest.parse::<usize>(), read_f32(value)) {
                let index = index.min(127);
                let v = v.clamp(0.0, 1.0);
                let mut points: Vec<(usize, f32)> = match self.amp_velcurve.take() {
                    Some(curve) => (0..128).map(|i| (i, curve.eval_cc(i as u8))).collect(),
                    None => vec![(0, 0.0), (127, 1.0)],
                };
                match points.iter_mut().find(|(i, _)| *i == index) {
                    Some(point) => point.1 = v,
                    None => points.push((index, v)),
                }
                self.amp_velcurve = Some(Curve::from_points(&points));
                return;
            }
            warnings.push(ParseWarning::malformed(name, value));
            return;
        }

        // effectN sends (percent)
        if let Some(rest) = name.strip_prefix("effect") {
            if let (Ok(bus), Some(v)) = (rest.parse::<usize>(), read_f32(value)) {
                if bus >= 1 {
                    self.effect_sends.push((bus - 1, v / 100.0));
                    return;
                }
            }
            warnings.push(ParseWarning::malformed(name, value));
            return;
        }

        // Filter bank without index: cutoff, resonance, fil_type etc.
        match name {
            "cutoff" => {
                if let Some(v) = read_f32(value) {
                    self.filter_at(0).cutoff = v;
                }
                return;
            }
            "resonance" => {
                if let Some(v) = read_f32(value) {
                    self.filter_at(0).resonance = v;
                }
                return;
            }
            "fil_type" | "filtype" => {
                match Self::parse_filter_type(value) {
                    Some(t) => self.filter_at(0).filter_type = t,
                    None => warnings.push(ParseWarning::malformed(name, value)),
                }
                return;
            }
            "fil_keytrack" => {
                if let Some(v) = read_f32(value) {
                    self.filter_at(0).keytrack = v;
                }
                return;
            }
            "fil_keycenter" => {
                if let Some(v) = read_note(value) {
                    self.filter_at(0).keycenter = v;
                }
                return;
            }
            "fil_veltrack" => {
                if let Some(v) = read_f32(value) {
                    self.filter_at(0).veltrack = v;
                }
                return;
            }
            "fil_random" => {
                if let Some(v) = read_f32(value) {
                    self.filter_at(0).random = v;
                }
                return;
            }
            "fil_gain" => {
                if let Some(v) = read_f32(value) {
                    self.filter_at(0).gain = v;
                }
                return;
            }
            _ => {}
        }

        // cutoff2, resonance2, fil2_type: second filter aliases
        if let Some((prefix, index)) = split_cc_suffix(name) {
            match prefix {
                "cutoff" if index >= 1 => {
                    if let Some(v) = read_f32(value) {
                        self.filter_at(index as usize - 1).cutoff = v;
                    }
                    return;
                }
                "resonance" if index >= 1 => {
                    if let Some(v) = read_f32(value) {
                        self.filter_at(index as usize - 1).resonance = v;
                    }
                    return;
                }
                _ => {}
            }
        }

        // eqN_, lfoN_, egN_, filN_ indexed families
        if let Some((prefix, index, rest)) = split_indexed(name) {
            match prefix {
                "eq" if index >= 1 => {
                    let eq = self.eq_at(index - 1);
                    match rest {
                        "freq" => {
                            if let Some(v) = read_f32(value) {
                                eq.frequency = v;
                            }
                        }
                        "bw" => {
                            if let Some(v) = read_f32(value) {
                                eq.bandwidth = v;
                            }
                        }
                        "gain" => {
                            if let Some(v) = read_f32(value) {
                                eq.gain = v;
                            }
                        }
                        "vel2freq" => {
                            if let Some(v) = read_f32(value) {
                                eq.vel2frequency = v;
                            }
                        }
                        "vel2gain" => {
                            if let Some(v) = read_f32(value) {
                                eq.vel2gain = v;
                            }
                        }
                        "type" => {
                            eq.eq_type = match value.trim() {
                                "peak" => EqType::Peak,
                                "lshelf" => EqType::LowShelf,
                                "hshelf" => EqType::HighShelf,
                                _ => {
                                    warnings.push(ParseWarning::malformed(name, value));
                                    return;
                                }
                            };
                        }
                        _ => warnings.push(ParseWarning::unknown(name, value)),
                    }
                    return;
                }
                "fil" if index >= 1 => {
                    let filter = self.filter_at(index - 1);
                    match rest {
                        "type" => match Self::parse_filter_type(value) {
                            Some(t) => filter.filter_type = t,
                            None => warnings.push(ParseWarning::malformed(name, value)),
                        },
                        "keytrack" => {
                            if let Some(v) = read_f32(value) {
                                filter.keytrack = v;
                            }
                        }
                        "keycenter" => {
                            if let Some(v) = read_note(value) {
                                filter.keycenter = v;
                            }
                        }
                        "veltrack" => {
                            if let Some(v) = read_f32(value) {
                                filter.veltrack = v;
                            }
                        }
                        "random" => {
                            if let Some(v) = read_f32(value) {
                                filter.random = v;
                            }
                        }
                        "gain" => {
                            if let Some(v) = read_f32(value) {
                                filter.gain = v;
                            }
                        }
                        _ => warnings.push(ParseWarning::unknown(name, value)),
                    }
                    return;
                }
                "lfo" if index >= 1 => {
                    self.parse_lfo_opcode(index - 1, rest, value, warnings);
                    return;
                }
                "eg" if index >= 1 => {
                    self.parse_flex_eg_opcode(index - 1, rest, value, warnings);
                    return;
                }
                _ => {}
            }
        }

        // CC-suffixed families
        if let Some((prefix, cc)) = split_cc_suffix(name) {
            match prefix {
                "locc" => {
                    let hi = self.cc_condition_range(cc).hi;
                    if let Some(v) = read_normalized(value) {
                        self.set_cc_condition(cc, Range::new(v, hi));
                    }
                    return;
                }
                "hicc" => {
                    let lo = self.cc_condition_range(cc).lo;
                    if let Some(v) = read_normalized(value) {
                        self.set_cc_condition(cc, Range::new(lo, v));
                    }
                    return;
                }
                "on_locc" | "start_locc" => {
                    let hi = self.cc_trigger_range(cc).hi;
                    if let Some(v) = read_normalized(value) {
                        self.set_cc_trigger(cc, Range::new(v, hi));
                    }
                    return;
                }
                "on_hicc" | "start_hicc" => {
                    let lo = self.cc_trigger_range(cc).lo;
                    if let Some(v) = read_normalized(value) {
                        self.set_cc_trigger(cc, Range::new(lo, v));
                    }
                    return;
                }
                "xfin_locc" => {
                    let hi = Self::range_of(&self.xfin_cc, cc).hi;
                    if let Some(v) = read_normalized(value) {
                        Self::set_range(&mut self.xfin_cc, cc, Range::new(v, hi));
                    }
                    return;
                }
                "xfin_hicc" => {
                    let lo = Self::range_of(&self.xfin_cc, cc).lo;
                    if let Some(v) = read_normalized(value) {
                        Self::set_range(&mut self.xfin_cc, cc, Range::new(lo, v));
                    }
                    return;
                }
                "xfout_locc" => {
                    let hi = Self::range_of(&self.xfout_cc, cc).hi;
                    if let Some(v) = read_normalized(value) {
                        Self::set_range(&mut self.xfout_cc, cc, Range::new(v, hi));
                    }
                    return;
                }
                "xfout_hicc" => {
                    let lo = Self::range_of(&self.xfout_cc, cc).lo;
                    if let Some(v) = read_normalized(value) {
                        Self::set_range(&mut self.xfout_cc, cc, Range::new(lo, v));
                    }
                    return;
                }
                "offset_oncc" | "offset_cc" => {
                    if let Some(v) = read_f32(value) {
                        self.offset_cc.push((cc, v));
                    }
                    return;
                }
                "volume_oncc" | "volume_cc" | "gain_cc" | "gain_oncc" => {
                    if let Some(v) = read_f32(value) {
                        self.connections.push(ModConnection::new(
                            ModSource::Controller {
                                cc,
                                curve: 0,
                                smooth: 3,
                                step: 0,
                            },
                            ModTarget::Volume,
                            v,
                        ));
                    }
                    return;
                }
                "amplitude_oncc" | "amplitude_cc" => {
                    if let Some(v) = read_f32(value) {
                        self.connections.push(ModConnection::new(
                            ModSource::Controller {
                                cc,
                                curve: 0,
                                smooth: 3,
                                step: 0,
                            },
                            ModTarget::Amplitude,
                            v / 100.0,
                        ));
                    }
                    return;
                }
                "pan_oncc" | "pan_cc" => {
                    if let Some(v) = read_f32(value) {
                        self.connections.push(ModConnection::new(
                            ModSource::Controller {
                                cc,
                                curve: 1,
                                smooth: 3,
                                step: 0,
                            },
                            ModTarget::Pan,
                            v / 100.0,
                        ));
                    }
                    return;
                }
                "tune_oncc" | "tune_cc" | "pitch_oncc" | "pitch_cc" => {
                    if let Some(v) = read_f32(value) {
                        self.connections.push(ModConnection::new(
                            ModSource::Controller {
                                cc,
                                curve: 0,
                                smooth: 3,
                                step: 0,
                            },
                            ModTarget::Pitch,
                            v,
                        ));
                    }
                    return;
                }
                "cutoff_oncc" | "cutoff_cc" => {
                    if let Some(v) = read_f32(value) {
                        self.connections.push(ModConnection::new(
                            ModSource::Controller {
                                cc,
                                curve: 0,
                                smooth: 3,
                                step: 0,
                            },
                            ModTarget::FilCutoff(0),
                            v,
                        ));
                    }
                    return;
                }
                "resonance_oncc" | "resonance_cc" => {
                    if let Some(v) = read_f32(value) {
                        self.connections.push(ModConnection::new(
                            ModSource::Controller {
                                cc,
                                curve: 0,
                                smooth: 3,
                                step: 0,
                            },
                            ModTarget::FilResonance(0),
                            v,
                        ));
                    }
                    return;
                }
                _ => {}
            }
        }

        warnings.push(ParseWarning::unknown(name, value));
    }

    fn parse_lfo_opcode(
        &mut self,
        index: usize,
        rest: &str,
        value: &str,
        warnings: &mut Vec<ParseWarning>,
    ) {
        let entry = self.lfo_at(index);
        match rest {
            "freq" => {
                if let Some(v) = read_f32(value) {
                    entry.frequency = v;
                }
            }
            "phase" => {
                if let Some(v) = read_f32(value) {
                    entry.phase = v;
                }
            }
            "delay" => {
                if let Some(v) = read_f32(value) {
                    entry.delay = v;
                }
            }
            "fade" => {
                if let Some(v) = read_f32(value) {
                    entry.fade = v;
                }
            }
            "wave" => match Self::parse_lfo_wave(value) {
                Some(wave) => entry.wave = wave,
                None => warnings.push(ParseWarning::malformed("lfo wave", value)),
            },
            "amplitude" => {
                if let Some(v) = read_f32(value) {
                    entry.amplitude_depth = v;
                }
            }
            "pitch" => {
                if let Some(v) = read_f32(value) {
                    entry.pitch_depth = v;
                }
            }
            "cutoff" => {
                if let Some(v) = read_f32(value) {
                    entry.cutoff_depth = v;
                }
            }
            "pan" => {
                if let Some(v) = read_f32(value) {
                    entry.pan_depth = v / 100.0;
                }
            }
            _ => {
                // wave2, offset2, ratio2, scale2: sub-oscillators; stepN
                if let Some((param, sub_index)) = split_cc_suffix(rest) {
                    if param == "step" {
                        let steps = &mut entry.steps;
                        let sub_index = sub_index as usize;
                        if steps.len() <= sub_index.saturating_sub(1) {
                            steps.resize(sub_index.max(1), 0.0);
                        }
                        if let Some(v) = read_f32(value) {
                            steps[sub_index.saturating_sub(1)] = v / 100.0;
                        }
                        return;
                    }

                    let sub_index = (sub_index as usize).saturating_sub(1);
                    while entry.subs.len() <= sub_index {
                        entry.subs.push(LfoSub::default());
                    }
                    match param {
                        "wave" => {
                            if let Some(wave) = Self::parse_lfo_wave(value) {
                                entry.subs[sub_index].wave = wave;
                            }
                        }
                        "offset" => {
                            if let Some(v) = read_f32(value) {
                                entry.subs[sub_index].offset = v;
                            }
                        }
                        "ratio" => {
                            if let Some(v) = read_f32(value) {
                                entry.subs[sub_index].ratio = v;
                            }
                        }
                        "scale" => {
                            if let Some(v) = read_f32(value) {
                                entry.subs[sub_index].scale = v;
                            }
                        }
                        _ => warnings.push(ParseWarning::unknown(rest, value)),
                    }
                    return;
                }
                warnings.push(ParseWarning::unknown(rest, value));
            }
        }
    }

    fn parse_flex_eg_opcode(
        &mut self,
        index: usize,
        rest: &str,
        value: &str,
        warnings: &mut Vec<ParseWarning>,
    ) {
        let entry = self.flex_eg_at(index);
        match rest {
            "sustain" => {
                if let Some(v) = read_usize(value) {
                    entry.sustain_point = v;
                }
            }
            "dynamic" | "freerun" => entry.free_running = value.trim() == "1",
            "amplitude" => {
                if let Some(v) = read_f32(value) {
                    entry.amplitude_depth = v / 100.0;
                }
            }
            "pitch" => {
                if let Some(v) = read_f32(value) {
                    entry.pitch_depth = v;
                }
            }
            "cutoff" => {
                if let Some(v) = read_f32(value) {
                    entry.cutoff_depth = v;
                }
            }
            _ => {
                if let Some((param, point)) = split_cc_suffix(rest) {
                    let point = point as usize;
                    while entry.points.len() <= point {
                        entry.points.push(FlexPoint {
                            time: 0.0,
                            level: 0.0,
                            shape: 0.0,
                        });
                    }
                    match param {
                        "time" => {
                            if let Some(v) = read_f32(value) {
                                entry.points[point].time = v;
                            }
                        }
                        "level" => {
                            if let Some(v) = read_f32(value) {
                                entry.points[point].level = v;
                            }
                        }
                        "shape" => {
                            if let Some(v) = read_f32(value) {
                                entry.points[point].shape = v;
                            }
                        }
                        _ => warnings.push(ParseWarning::unknown(rest, value)),
                    }
                    return;
                }
                warnings.push(ParseWarning::unknown(rest, value));
            }
        }
    }

    fn cc_condition_range(&self, cc: u16) -> Range<f32> {
        Self::range_of(&self.cc_conditions, cc)
    }

    fn set_cc_condition(&mut self, cc: u16, range: Range<f32>) {
        Self::set_range(&mut self.cc_conditions, cc, range);
    }

    fn cc_trigger_range(&self, cc: u16) -> Range<f32> {
        Self::range_of(&self.cc_triggers, cc)
    }

    fn set_cc_trigger(&mut self, cc: u16, range: Range<f32>) {
        Self::set_range(&mut self.cc_triggers, cc, range);
    }

    fn range_of(list: &[(u16, Range<f32>)], cc: u16) -> Range<f32> {
        list.iter()
            .find(|(number, _)| *number == cc)
            .map(|(_, range)| *range)
            .unwrap_or(Range::new(0.0, 1.0))
    }

    fn set_range(list: &mut Vec<(u16, Range<f32>)>, cc: u16, range: Range<f32>) {
        if let Some(entry) = list.iter_mut().find(|(number, _)| *number == cc) {
            entry.1 = range;
        } else {
            list.push((cc, range));
        }
    }
}
