//! Synth Module
//!
//! The engine root: owns the regions, the voice pool, the file pool and
//! the busses; ingests timed events and renders stereo blocks. Events are
//! queued with a frame delay inside the block, dispatched in delay order
//! at the start of `render_block`, and matched against the region
//! activation conditions; matched regions get voices from the pool, with
//! the layered polyphony limits enforced before each admission.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;

use crate::buffer::{AudioBuffer, BufferPool};
use crate::config::constants::{EVENT_QUEUE_CAPACITY, MAX_EFFECT_BUSSES};
use crate::config::EngineConfig;
use crate::curve::{Curve, CurveSet};
use crate::error::{EngineError, ParseWarning};
use crate::file_pool::FilePool;
use crate::math::PanTable;
use crate::midi_state::MidiState;
use crate::opcode::{read_f32, read_normalized, read_usize, split_cc_suffix, Header, Section};
use crate::oscillator::WavetableSet;
use crate::region::{Range, Region, RegionId, SelfMask, SoundSource, TriggerKind};
use crate::region_set::{PolyphonyGroups, RegionSetTree, SetId};
use crate::tuning::{Scale, Tuning};
use crate::voice::{
    RenderContext, StartContext, TriggerEvent, TriggerEventKind, VoiceId, VoiceState,
};
use crate::voice_manager::VoiceManager;

/// A timed event waiting for the next render block.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PendingEvent {
    NoteOn { delay: usize, key: u8, velocity: f32 },
    NoteOff { delay: usize, key: u8, velocity: f32 },
    Cc { delay: usize, number: u16, value: f32 },
    PitchWheel { delay: usize, value: f32 },
    Aftertouch { delay: usize, value: f32 },
    Tempo { delay: usize, seconds_per_quarter: f32 },
}

impl PendingEvent {
    fn delay(&self) -> usize {
        match self {
            PendingEvent::NoteOn { delay, .. }
            | PendingEvent::NoteOff { delay, .. }
            | PendingEvent::Cc { delay, .. }
            | PendingEvent::PitchWheel { delay, .. }
            | PendingEvent::Aftertouch { delay, .. }
            | PendingEvent::Tempo { delay, .. } => *delay,
        }
    }
}

/// A note-off deferred by the sustain or sostenuto pedal; replayed when
/// the pedal falls below its threshold.
#[derive(Debug, Clone, Copy)]
struct DeferredOff {
    key: u8,
    velocity: f32,
}

/// One stereo effect bus with its return gain.
#[derive(Debug)]
struct EffectBus {
    buffer: AudioBuffer,
    gain: f32,
}

/// The sampling engine.
pub struct Synth {
    config: EngineConfig,

    midi: MidiState,
    tuning: Tuning,
    curves: CurveSet,
    pan_table: PanTable,
    wavetables: Arc<WavetableSet>,
    file_pool: FilePool,

    regions: Vec<Region>,
    sets: RegionSetTree,
    region_set_of: Vec<SetId>,

    /// Cached recursive region lists per set, rebuilt at load
    set_regions: Vec<Vec<RegionId>>,

    /// Per-key region index for O(regions-per-key) matching
    key_index: Vec<Vec<RegionId>>,

    /// Union of all keyswitch ranges
    keyswitch_range: Option<Range<u8>>,

    groups: PolyphonyGroups,
    voices: VoiceManager,
    buffer_pool: BufferPool,
    main_bus: AudioBuffer,
    effect_busses: Vec<EffectBus>,

    events: Vec<PendingEvent>,
    deferred_offs: Vec<DeferredOff>,
    sostenuto_captured: [bool; 128],

    rng: SmallRng,
    event_counter: u64,
    last_keyswitch: Option<u8>,
    previous_note: Option<u8>,

    parse_warnings: Vec<ParseWarning>,
    master_gain: f32,

    // Render-path scratch
    matched_scratch: Vec<RegionId>,
    started_scratch: Vec<VoiceId>,
    note_scratch: Vec<VoiceId>,
}

impl Synth {
    /// Creates an engine for a configuration.
    ///
    /// Invalid option values fall back to the defaults; use
    /// `EngineConfig::validate` beforehand to catch them explicitly.
    pub fn new(config: EngineConfig) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(error) => {
                log::warn!("invalid engine configuration, using defaults: {}", error);
                EngineConfig::default()
            }
        };

        let sample_rate = config.sample_rate;
        let block = config.samples_per_block;
        let tuning = Tuning::new(config.tuning_root_key, config.tuning_frequency);
        let mut voices = VoiceManager::new(config.num_voices, sample_rate, block);
        voices.set_stealing_algorithm(config.stealing_algorithm);

        Self {
            midi: MidiState::new(sample_rate),
            tuning,
            curves: CurveSet::new(),
            pan_table: PanTable::new(),
            wavetables: WavetableSet::new(sample_rate),
            file_pool: FilePool::new(config.preload_size, config.oversampling),
            regions: Vec::new(),
            sets: RegionSetTree::new(),
            region_set_of: Vec::new(),
            set_regions: Vec::new(),
            key_index: (0..128).map(|_| Vec::new()).collect(),
            keyswitch_range: None,
            groups: PolyphonyGroups::new(),
            voices,
            buffer_pool: BufferPool::new(block),
            main_bus: AudioBuffer::new(2, block),
            effect_busses: Vec::new(),
            events: Vec::with_capacity(EVENT_QUEUE_CAPACITY),
            deferred_offs: Vec::with_capacity(128),
            sostenuto_captured: [false; 128],
            rng: SmallRng::seed_from_u64(config.rng_seed),
            event_counter: 0,
            last_keyswitch: None,
            previous_note: None,
            parse_warnings: Vec::new(),
            master_gain: 1.0,
            matched_scratch: Vec::with_capacity(64),
            started_scratch: Vec::with_capacity(64),
            note_scratch: Vec::with_capacity(64),
            config,
        }
    }

    // --- Configuration ---

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Changes the sample rate; stops all voices.
    pub fn set_sample_rate(&mut self, sample_rate: f32) -> Result<(), EngineError> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(EngineError::ConfigurationInvalid(format!(
                "sample_rate {sample_rate} must be positive"
            )));
        }
        self.voices.reset_all();
        self.config.sample_rate = sample_rate;
        self.midi.set_sample_rate(sample_rate);
        self.wavetables = WavetableSet::new(sample_rate);
        self.voices
            .configure(sample_rate, self.config.samples_per_block);
        Ok(())
    }

    /// Changes the block size; stops all voices.
    pub fn set_samples_per_block(&mut self, samples_per_block: usize) -> Result<(), EngineError> {
        if samples_per_block == 0
            || samples_per_block > crate::config::constants::MAX_BLOCK_SIZE
        {
            return Err(EngineError::ConfigurationInvalid(format!(
                "samples_per_block {samples_per_block} out of range"
            )));
        }
        self.voices.reset_all();
        self.config.samples_per_block = samples_per_block;
        self.voices
            .configure(self.config.sample_rate, samples_per_block);
        self.buffer_pool.resize(samples_per_block);
        self.main_bus.resize(2, samples_per_block);
        for bus in &mut self.effect_busses {
            bus.buffer.resize(2, samples_per_block);
        }
        Ok(())
    }

    /// Resizes the voice pool; stops all voices.
    pub fn set_num_voices(&mut self, num_voices: usize) -> Result<(), EngineError> {
        if num_voices == 0 || num_voices > crate::config::constants::MAX_VOICES {
            return Err(EngineError::ConfigurationInvalid(format!(
                "num_voices {num_voices} out of range"
            )));
        }
        self.config.num_voices = num_voices;
        self.voices.set_num_voices(
            num_voices,
            self.config.sample_rate,
            self.config.samples_per_block,
        );
        Ok(())
    }

    /// Sets the engine-wide polyphony cap for a `group=` id.
    pub fn set_group_polyphony(&mut self, group: u64, cap: usize) {
        self.groups.set_polyphony(group, cap);
    }

    /// Selects the stealing algorithm.
    pub fn set_stealing_algorithm(&mut self, algorithm: crate::config::StealingAlgorithm) {
        self.config.stealing_algorithm = algorithm;
        self.voices.set_stealing_algorithm(algorithm);
    }

    /// Master output gain (linear).
    pub fn set_master_gain(&mut self, gain: f32) {
        self.master_gain = gain.max(0.0);
    }

    /// Return gain of an effect bus (linear).
    pub fn set_effect_bus_gain(&mut self, bus: usize, gain: f32) {
        if let Some(bus) = self.effect_busses.get_mut(bus) {
            bus.gain = gain.max(0.0);
        }
    }

    /// Number of allocated effect busses.
    pub fn num_effect_busses(&self) -> usize {
        self.effect_busses.len()
    }

    /// Enables waiting for background loads before each block.
    pub fn set_freewheeling(&mut self, freewheeling: bool) {
        self.config.freewheeling = freewheeling;
    }

    /// Replaces 12-TET with a loaded scale (`None` restores it).
    pub fn set_scale(&mut self, scale: Option<&Scale>) {
        let mut tuning = Tuning::new(self.config.tuning_root_key, self.config.tuning_frequency);
        if let Some(scale) = scale {
            tuning.apply_scale(scale);
        }
        self.tuning = tuning;
    }

    // --- Introspection ---

    /// Voices not currently idle.
    pub fn num_active_voices(&self) -> usize {
        self.voices.num_active_voices()
    }

    /// Playing voices that have not entered release.
    pub fn num_unreleased_voices(&self) -> usize {
        self.voices.num_unreleased_voices()
    }

    /// Loaded regions.
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Region access for diagnostics.
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(id)
    }

    /// Unknown opcodes and malformed values from the last load.
    pub fn parse_warnings(&self) -> &[ParseWarning] {
        &self.parse_warnings
    }

    /// Region ids of the currently sounding voices, newest last. For
    /// diagnostics and tests; not meant for the audio thread.
    pub fn active_region_ids(&self) -> Vec<RegionId> {
        self.voices
            .voices()
            .iter()
            .filter(|voice| voice.state() == VoiceState::Playing)
            .filter_map(|voice| voice.region_id())
            .collect()
    }

    /// Distinct sample files held by the pool.
    pub fn num_preloaded_samples(&self) -> usize {
        self.file_pool.num_preloaded()
    }

    // --- Loading ---

    /// Loads an instrument from parsed sections. Stops all voices,
    /// replaces the region structures and triggers preloading for every
    /// referenced sample. Off-audio-thread only.
    pub fn load_sections(&mut self, sections: &[Section]) -> Result<(), EngineError> {
        self.voices.reset_all();
        self.regions.clear();
        self.sets.clear();
        self.region_set_of.clear();
        self.set_regions.clear();
        self.groups.clear();
        self.parse_warnings.clear();
        self.deferred_offs.clear();
        self.sostenuto_captured = [false; 128];
        self.last_keyswitch = None;
        self.previous_note = None;
        self.event_counter = 0;
        self.rng = SmallRng::seed_from_u64(self.config.rng_seed);
        for slot in &mut self.key_index {
            slot.clear();
        }

        let mut global_ops: Vec<(String, String)> = Vec::new();
        let mut master_ops: Vec<(String, String)> = Vec::new();
        let mut group_ops: Vec<(String, String)> = Vec::new();
        let mut master_set: Option<SetId> = None;
        let mut group_set: Option<SetId> = None;
        let mut num_effect_busses = 0usize;
        let mut default_path: Option<PathBuf> = None;

        for section in sections {
            match section.header {
                Header::Global => {
                    global_ops = section.opcodes.clone();
                    master_ops.clear();
                    group_ops.clear();
                    master_set = None;
                    group_set = None;
                    self.apply_set_polyphony(self.sets.root(), &section.opcodes);
                }
                Header::Master => {
                    master_ops = section.opcodes.clone();
                    group_ops.clear();
                    let id = self.sets.add_set(self.sets.root());
                    self.apply_set_polyphony(id, &section.opcodes);
                    master_set = Some(id);
                    group_set = None;
                }
                Header::Group => {
                    group_ops = section.opcodes.clone();
                    let parent = master_set.unwrap_or(self.sets.root());
                    let id = self.sets.add_set(parent);
                    self.apply_set_polyphony(id, &section.opcodes);
                    group_set = Some(id);
                }
                Header::Control => {
                    for (name, value) in &section.opcodes {
                        match name.as_str() {
                            "default_path" => {
                                default_path = Some(PathBuf::from(value.replace('\\', "/")));
                            }
                            _ => {
                                if let Some(("set_cc", cc)) = split_cc_suffix(name) {
                                    if let Some(v) = read_normalized(value) {
                                        self.midi.cc_event(0, cc, v);
                                    }
                                } else {
                                    self.parse_warnings
                                        .push(ParseWarning::unknown(name, value));
                                }
                            }
                        }
                    }
                }
                Header::Curve => {
                    self.load_curve_section(section);
                }
                Header::Effect => {
                    if num_effect_busses < MAX_EFFECT_BUSSES {
                        num_effect_busses += 1;
                    }
                }
                Header::Region => {
                    let id = self.regions.len();
                    let merged = global_ops
                        .iter()
                        .chain(master_ops.iter())
                        .chain(group_ops.iter())
                        .chain(section.opcodes.iter())
                        .map(|(n, v)| (n.as_str(), v.as_str()));
                    let mut region =
                        Region::from_opcodes(id, merged, &mut self.parse_warnings);

                    if let Some(path) = &default_path {
                        if let SoundSource::File { path: sample, .. } = &mut region.source {
                            let joined = path.join(sample.as_path());
                            *sample = joined;
                        }
                    }

                    self.prepare_region(&mut region);

                    let owner = group_set
                        .or(master_set)
                        .unwrap_or(self.sets.root());
                    self.sets.add_region(owner, id);
                    self.region_set_of.push(owner);

                    if region.sw_default.is_some() && self.last_keyswitch.is_none() {
                        self.last_keyswitch = region.sw_default;
                    }
                    for bus in region.effect_sends.iter().map(|(bus, _)| *bus) {
                        num_effect_busses = num_effect_busses.max(bus + 1);
                    }

                    for key in region.key_range.lo..=region.key_range.hi {
                        self.key_index[key as usize].push(id);
                    }
                    self.merge_keyswitch_range(&region);
                    self.regions.push(region);
                }
            }
        }

        // Cache recursive set region lists for polyphony walks
        self.set_regions = (0..self.sets.len())
            .map(|set| self.sets.regions_recursive(set))
            .collect();

        // Allocate effect busses
        let num_effect_busses = num_effect_busses.min(MAX_EFFECT_BUSSES);
        self.effect_busses = (0..num_effect_busses)
            .map(|_| EffectBus {
                buffer: AudioBuffer::new(2, self.config.samples_per_block),
                gain: 1.0,
            })
            .collect();

        log::info!(
            "{}loaded {} regions, {} samples, {} warnings",
            self.log_prefix(),
            self.regions.len(),
            self.file_pool.num_preloaded(),
            self.parse_warnings.len()
        );
        Ok(())
    }

    fn log_prefix(&self) -> &str {
        self.config.logging_prefix.as_deref().unwrap_or("")
    }

    fn apply_set_polyphony(&mut self, set: SetId, opcodes: &[(String, String)]) {
        for (name, value) in opcodes {
            if name == "polyphony" {
                self.sets.get_mut(set).polyphony = read_usize(value);
            }
        }
    }

    fn merge_keyswitch_range(&mut self, region: &Region) {
        if let Some(range) = region.sw_range {
            self.keyswitch_range = Some(match self.keyswitch_range {
                Some(current) => Range::new(current.lo.min(range.lo), current.hi.max(range.hi)),
                None => range,
            });
        }
    }

    /// Preloads the region's sample and fixes up sample-derived fields;
    /// failures disable the region.
    fn prepare_region(&mut self, region: &mut Region) {
        let SoundSource::File { path, reverse } = &region.source else {
            return;
        };
        let path = path.clone();
        let reverse = *reverse;

        let max_offset = region.offset + region.offset_random
            + region
                .offset_cc
                .iter()
                .map(|(_, scale)| scale.abs() as u64)
                .sum::<u64>();

        match self.file_pool.preload(&path, reverse, max_offset) {
            Ok(file_id) => {
                region.file_id = Some(file_id);
                if let Some(info) = self.file_pool.information(file_id) {
                    let original_frames =
                        (info.total_frames / info.oversampling.max(1)) as u64;
                    if region.sample_end == u64::MAX || region.sample_end > original_frames
                    {
                        region.sample_end = original_frames;
                    }
                }
            }
            Err(error) => {
                log::warn!(
                    "{}region {}: {} -> disabled",
                    self.log_prefix(),
                    region.id,
                    error
                );
                region.disable();
            }
        }
    }

    fn load_curve_section(&mut self, section: &Section) {
        let Some(index) = section.get("curve_index").and_then(read_usize) else {
            return;
        };
        let mut anchors: Vec<(usize, f32)> = Vec::new();
        for (name, value) in &section.opcodes {
            if let Some(position) = name.strip_prefix('v').and_then(|v| v.parse::<usize>().ok())
            {
                if let Some(v) = read_f32(value) {
                    anchors.push((position.min(127), v.clamp(-1.0, 1.0)));
                }
            }
        }
        if !anchors.is_empty() {
            self.curves.set(index, Curve::from_points(&anchors));
        }
    }

    // --- Event ingestion (audio thread) ---

    fn push_event(&mut self, event: PendingEvent) {
        if event.delay() >= self.config.samples_per_block {
            return;
        }
        if self.events.len() < EVENT_QUEUE_CAPACITY {
            self.events.push(event);
        }
    }

    /// Queues a note-on for the next block.
    pub fn note_on(&mut self, delay: usize, key: u8, velocity: f32) {
        self.push_event(PendingEvent::NoteOn {
            delay,
            key: key & 127,
            velocity: velocity.clamp(0.0, 1.0),
        });
    }

    /// Queues a note-off.
    pub fn note_off(&mut self, delay: usize, key: u8, velocity: f32) {
        self.push_event(PendingEvent::NoteOff {
            delay,
            key: key & 127,
            velocity: velocity.clamp(0.0, 1.0),
        });
    }

    /// Queues a controller change (normalized 0..1).
    pub fn cc(&mut self, delay: usize, number: u16, value: f32) {
        self.push_event(PendingEvent::Cc {
            delay,
            number,
            value: value.clamp(0.0, 1.0),
        });
    }

    /// Queues a pitch-wheel change (normalized -1..1).
    pub fn pitch_wheel(&mut self, delay: usize, value: f32) {
        self.push_event(PendingEvent::PitchWheel {
            delay,
            value: value.clamp(-1.0, 1.0),
        });
    }

    /// Queues a channel aftertouch change (normalized 0..1).
    pub fn aftertouch(&mut self, delay: usize, value: f32) {
        self.push_event(PendingEvent::Aftertouch {
            delay,
            value: value.clamp(0.0, 1.0),
        });
    }

    /// Queues a tempo change, in seconds per quarter note.
    pub fn tempo(&mut self, delay: usize, seconds_per_quarter: f32) {
        self.push_event(PendingEvent::Tempo {
            delay,
            seconds_per_quarter,
        });
    }

    // --- Rendering ---

    /// Renders one block into planar stereo output. Slices shorter than
    /// the configured block size render fewer frames; anything longer is
    /// truncated to the block size.
    pub fn render_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        let frames = left
            .len()
            .min(right.len())
            .min(self.config.samples_per_block);
        if frames == 0 {
            return;
        }

        if self.config.freewheeling {
            self.file_pool.wait_for_loads();
        }

        // Dispatch events in delay order (stable for equal delays)
        let mut events = std::mem::take(&mut self.events);
        events.sort_by_key(|event| event.delay());
        for event in &events {
            self.dispatch_event(*event);
        }
        events.clear();
        self.events = events;

        // Render voices into the busses
        self.main_bus.clear();
        for bus in &mut self.effect_busses {
            bus.buffer.clear();
        }

        for voice_index in 0..self.voices.num_voices() {
            if self.voices.get(voice_index).state() != VoiceState::Playing {
                continue;
            }
            let Some(region_id) = self.voices.get(voice_index).region_id() else {
                continue;
            };
            let Some(mut scratch) = self.buffer_pool.acquire() else {
                continue;
            };

            let context = RenderContext {
                midi: &self.midi,
                curves: &self.curves,
                pan_table: &self.pan_table,
            };
            let region = &self.regions[region_id];
            let produced =
                self.voices
                    .get_mut(voice_index)
                    .render(region, &mut scratch, frames, &context);

            if produced {
                self.main_bus.accumulate(&scratch, 1.0, frames);
                for &(bus, gain) in &region.effect_sends {
                    if let Some(bus) = self.effect_busses.get_mut(bus) {
                        bus.buffer.accumulate(&scratch, gain, frames);
                    }
                }
            }
            self.buffer_pool.release(scratch);
        }

        // Effect busses fold back into the main bus
        for bus in &self.effect_busses {
            self.main_bus.accumulate(&bus.buffer, bus.gain, frames);
        }

        // Master gain and output
        for (out, sample) in left[..frames]
            .iter_mut()
            .zip(self.main_bus.channel(0))
        {
            *out = sample * self.master_gain;
        }
        for (out, sample) in right[..frames]
            .iter_mut()
            .zip(self.main_bus.channel(1))
        {
            *out = sample * self.master_gain;
        }

        self.midi.advance_block(frames);
        self.voices.cleanup();
    }

    fn dispatch_event(&mut self, event: PendingEvent) {
        match event {
            PendingEvent::NoteOn {
                delay,
                key,
                velocity,
            } => self.dispatch_note_on(delay, key, velocity),
            PendingEvent::NoteOff {
                delay,
                key,
                velocity,
            } => self.dispatch_note_off(delay, key, velocity),
            PendingEvent::Cc {
                delay,
                number,
                value,
            } => self.dispatch_cc(delay, number, value),
            PendingEvent::PitchWheel { delay, value } => {
                self.midi.pitch_bend_event(delay, value);
            }
            PendingEvent::Aftertouch { delay, value } => {
                self.midi.aftertouch_event(delay, value);
            }
            PendingEvent::Tempo {
                delay,
                seconds_per_quarter,
            } => {
                self.midi.tempo_event(delay, seconds_per_quarter);
            }
        }
    }

    fn dispatch_note_on(&mut self, delay: usize, key: u8, velocity: f32) {
        let active_before = self.midi.active_notes();
        self.midi.note_on_event(delay, key, velocity);

        if let Some(range) = self.keyswitch_range {
            if range.contains(key) {
                self.last_keyswitch = Some(key);
            }
        }

        let random: f32 = self.rng.gen();
        self.event_counter += 1;
        let event_id = self.event_counter;

        // Match regions through the per-key index
        self.matched_scratch.clear();
        for index in 0..self.key_index[key as usize].len() {
            let region_id = self.key_index[key as usize][index];
            let matched = self.regions[region_id].matches_note_on(
                key,
                velocity,
                random,
                &self.midi,
                self.last_keyswitch,
                self.previous_note,
                active_before,
            );
            if matched {
                self.matched_scratch.push(region_id);
            }
        }

        let trigger = TriggerEvent {
            kind: TriggerEventKind::NoteOn,
            note: key,
            velocity,
            delay,
            event_id,
        };
        self.start_matched_voices(trigger, random, delay);

        self.previous_note = Some(key);
    }

    fn dispatch_note_off(&mut self, delay: usize, key: u8, velocity: f32) {
        self.midi.note_off_event(delay, key, velocity);

        // Release (or defer) sounding attack voices on this key
        let mut any_deferred = false;
        for voice_index in 0..self.voices.num_voices() {
            let voice = self.voices.get(voice_index);
            if voice.state() != VoiceState::Playing
                || voice.is_released()
                || voice.deferred_release
                || voice.trigger_event().kind != TriggerEventKind::NoteOn
                || voice.trigger_event().note != key
            {
                continue;
            }
            let Some(region) = voice.region_id().and_then(|id| self.regions.get(id)) else {
                continue;
            };
            // One-shot regions ignore the note-off entirely
            if region.effective_loop_mode() == crate::region::LoopMode::OneShot {
                continue;
            }

            let sustain_held = region.sustain_enabled
                && self.midi.cc_value(region.sustain_cc) >= region.sustain_threshold;
            let sostenuto_held = region.sostenuto_enabled
                && self.sostenuto_captured[key as usize]
                && self.midi.cc_value(region.sostenuto_cc) >= region.sostenuto_threshold;

            if sustain_held || sostenuto_held {
                self.voices.get_mut(voice_index).deferred_release = true;
                any_deferred = true;
            } else {
                self.voices.get_mut(voice_index).release(delay);
            }
        }

        // Release-triggered regions
        let random: f32 = self.rng.gen();
        self.event_counter += 1;
        let event_id = self.event_counter;

        self.matched_scratch.clear();
        let mut deferred_region_off = false;
        for index in 0..self.key_index[key as usize].len() {
            let region_id = self.key_index[key as usize][index];
            let region = &self.regions[region_id];
            if !matches!(
                region.trigger,
                TriggerKind::Release | TriggerKind::ReleaseKey
            ) {
                continue;
            }

            // `release` honors the sustain pedal; `release_key` fires
            // regardless
            let pedal_held = region.trigger == TriggerKind::Release
                && ((region.sustain_enabled
                    && self.midi.cc_value(region.sustain_cc) >= region.sustain_threshold)
                    || (region.sostenuto_enabled
                        && self.sostenuto_captured[key as usize]
                        && self.midi.cc_value(region.sostenuto_cc)
                            >= region.sostenuto_threshold));
            if pedal_held {
                deferred_region_off = true;
                continue;
            }

            let matched = self.regions[region_id].matches_note_off(
                key,
                &self.midi,
                self.last_keyswitch,
                self.previous_note,
            );
            if matched {
                self.matched_scratch.push(region_id);
            }
        }

        if any_deferred || deferred_region_off {
            let velocity = self.midi.note_velocity(key);
            if !self
                .deferred_offs
                .iter()
                .any(|deferred| deferred.key == key)
            {
                self.deferred_offs.push(DeferredOff { key, velocity });
            }
        }

        let trigger = TriggerEvent {
            kind: TriggerEventKind::NoteOff,
            note: key,
            velocity: self.midi.note_velocity(key),
            delay,
            event_id,
        };
        self.start_matched_voices(trigger, random, delay);
    }

    fn dispatch_cc(&mut self, delay: usize, number: u16, value: f32) {
        let previous = self.midi.cc_value(number);
        self.midi.cc_event(delay, number, value);

        // MIDI mode messages
        if number == 120 {
            // All sound off
            self.voices.reset_all();
            return;
        }
        if number == 123 {
            // All notes off
            for voice_index in 0..self.voices.num_voices() {
                if self.voices.get(voice_index).state() == VoiceState::Playing {
                    self.voices.get_mut(voice_index).release(delay);
                }
            }
            return;
        }

        self.handle_sostenuto_capture(number, value, previous);
        self.handle_pedal_drop(delay, number, value);
        self.handle_cc_triggers(delay, number, value, previous);
    }

    /// A sostenuto press captures exactly the notes held at the rising
    /// crossing.
    fn handle_sostenuto_capture(&mut self, number: u16, value: f32, previous: f32) {
        let captures = self.regions.iter().any(|region| {
            region.sostenuto_enabled
                && region.sostenuto_cc == number
                && value >= region.sostenuto_threshold
                && previous < region.sostenuto_threshold
        }) || (self.regions.is_empty()
            && number == crate::config::constants::DEFAULT_SOSTENUTO_CC
            && value >= crate::config::constants::DEFAULT_PEDAL_THRESHOLD
            && previous < crate::config::constants::DEFAULT_PEDAL_THRESHOLD);
        if captures {
            for key in 0..128u8 {
                self.sostenuto_captured[key as usize] = self.midi.is_note_pressed(key);
            }
        }

    }

    /// When a pedal falls below its threshold, deferred note-offs fire:
    /// held voices release and release-triggered regions play with their
    /// accumulated rt_decay.
    fn handle_pedal_drop(&mut self, delay: usize, number: u16, value: f32) {
        // Release deferred voices whose pedal this was
        for voice_index in 0..self.voices.num_voices() {
            let voice = self.voices.get(voice_index);
            if voice.state() != VoiceState::Playing || !voice.deferred_release {
                continue;
            }
            let key = voice.trigger_event().note;
            let Some(region) = voice.region_id().and_then(|id| self.regions.get(id)) else {
                continue;
            };

            let sustain_holds = region.sustain_enabled
                && self.midi.cc_value(region.sustain_cc) >= region.sustain_threshold;
            let sostenuto_holds = region.sostenuto_enabled
                && self.sostenuto_captured[key as usize]
                && self.midi.cc_value(region.sostenuto_cc) >= region.sostenuto_threshold;
            let relevant = region.sustain_cc == number || region.sostenuto_cc == number;

            if relevant && !sustain_holds && !sostenuto_holds {
                let voice = self.voices.get_mut(voice_index);
                voice.deferred_release = false;
                voice.release(delay);
            }
        }

        // Fire deferred release-region triggers
        let mut index = 0;
        while index < self.deferred_offs.len() {
            let deferred = self.deferred_offs[index];
            let key = deferred.key;

            let still_held = self.key_index[key as usize].iter().any(|&region_id| {
                let region = &self.regions[region_id];
                (region.sustain_enabled
                    && self.midi.cc_value(region.sustain_cc) >= region.sustain_threshold)
                    || (region.sostenuto_enabled
                        && self.sostenuto_captured[key as usize]
                        && self.midi.cc_value(region.sostenuto_cc)
                            >= region.sostenuto_threshold)
            });
            if still_held {
                index += 1;
                continue;
            }

            self.deferred_offs.swap_remove(index);

            let random: f32 = self.rng.gen();
            self.event_counter += 1;
            let event_id = self.event_counter;

            self.matched_scratch.clear();
            for position in 0..self.key_index[key as usize].len() {
                let region_id = self.key_index[key as usize][position];
                if self.regions[region_id].trigger != TriggerKind::Release {
                    continue;
                }
                let matched = self.regions[region_id].matches_note_off(
                    key,
                    &self.midi,
                    self.last_keyswitch,
                    self.previous_note,
                );
                if matched {
                    self.matched_scratch.push(region_id);
                }
            }

            let trigger = TriggerEvent {
                kind: TriggerEventKind::NoteOff,
                note: key,
                velocity: deferred.velocity,
                delay,
                event_id,
            };
            self.start_matched_voices(trigger, random, delay);
        }

        // Sostenuto fully released: drop the captured set
        let sostenuto_released = !self.regions.iter().any(|region| {
            region.sostenuto_cc == number
                && value >= region.sostenuto_threshold
        }) && number == crate::config::constants::DEFAULT_SOSTENUTO_CC
            && value < crate::config::constants::DEFAULT_PEDAL_THRESHOLD;
        if sostenuto_released {
            self.sostenuto_captured = [false; 128];
        }
    }

    /// CC-triggered regions fire when the controller crosses into their
    /// trigger range.
    fn handle_cc_triggers(&mut self, delay: usize, number: u16, value: f32, previous: f32) {
        self.matched_scratch.clear();
        for region_id in 0..self.regions.len() {
            if self.regions[region_id].matches_cc(number, value, previous) {
                self.matched_scratch.push(region_id);
            }
        }
        if self.matched_scratch.is_empty() {
            return;
        }

        let random: f32 = self.rng.gen();
        self.event_counter += 1;
        let trigger_note = self
            .matched_scratch
            .first()
            .map(|&id| self.regions[id].pitch_keycenter)
            .unwrap_or(60);
        let trigger = TriggerEvent {
            kind: TriggerEventKind::Cc,
            note: trigger_note,
            velocity: value,
            delay,
            event_id: self.event_counter,
        };
        self.start_matched_voices(trigger, random, delay);
    }

    /// Starts a voice per matched region, enforcing the polyphony layers
    /// before each admission, and closes the sister ring.
    fn start_matched_voices(&mut self, trigger: TriggerEvent, random: f32, delay: usize) {
        if self.matched_scratch.is_empty() {
            return;
        }

        self.started_scratch.clear();
        let matched = std::mem::take(&mut self.matched_scratch);

        for &region_id in &matched {
            let Some(voice_id) = self.admit_voice(region_id, trigger.note, delay) else {
                log::debug!("{}voice pool exhausted, event dropped", self.log_prefix());
                continue;
            };

            // off_by: this region silences voices of the named group
            if let Some(off_group) = self.regions[region_id].off_by {
                self.off_group_voices(off_group, delay);
            }

            let context = StartContext {
                midi: &self.midi,
                tuning: &self.tuning,
                curves: &self.curves,
                wavetables: &self.wavetables,
                file_pool: &self.file_pool,
                sample_rate: self.config.sample_rate,
                rng_seed: self.config.rng_seed,
            };
            self.voices
                .get_mut(voice_id)
                .start(&self.regions[region_id], trigger, random, &context);
            self.started_scratch.push(voice_id);
        }

        self.matched_scratch = matched;

        let started = std::mem::take(&mut self.started_scratch);
        self.voices.close_ring(&started);
        self.started_scratch = started;
    }

    /// Offs every unreleased voice of an `off_by` group, per each
    /// victim's off mode.
    fn off_group_voices(&mut self, group: u64, delay: usize) {
        for voice_index in 0..self.voices.num_voices() {
            let voice = self.voices.get(voice_index);
            if voice.state() != VoiceState::Playing || voice.is_released() {
                continue;
            }
            let in_group = voice
                .region_id()
                .and_then(|id| self.regions.get(id))
                .map(|region| region.group == group)
                .unwrap_or(false);
            if in_group {
                self.voices.off_ring(voice_index, delay, &self.regions);
            }
        }
    }

    /// Enforces the polyphony layers for an incoming voice of `region_id`
    /// and returns a pool slot for it, stealing when the pool is full.
    fn admit_voice(&mut self, region_id: RegionId, note: u8, delay: usize) -> Option<VoiceId> {
        let (note_cap, region_cap, group, group_cap, self_mask) = {
            let region = &self.regions[region_id];
            (
                region.note_polyphony,
                region.polyphony,
                region.group,
                self.groups.polyphony(region.group),
                region.self_mask,
            )
        };

        // 1. Note polyphony within the group
        if let Some(cap) = note_cap {
            let mut note_voices = std::mem::take(&mut self.note_scratch);
            self.voices
                .find_note_voices(note, group, &self.regions, &mut note_voices);
            if note_voices.len() >= cap.max(1) {
                let victim = match self_mask {
                    SelfMask::Mask => note_voices
                        .iter()
                        .copied()
                        .min_by(|&a, &b| {
                            self.voices
                                .get(a)
                                .average_power()
                                .partial_cmp(&self.voices.get(b).average_power())
                                .unwrap_or(std::cmp::Ordering::Equal)
                        }),
                    SelfMask::DontMask => note_voices
                        .iter()
                        .copied()
                        .max_by_key(|&id| (self.voices.get(id).age(), std::cmp::Reverse(id))),
                };
                if let Some(victim) = victim {
                    self.voices.off_ring(victim, delay, &self.regions);
                }
            }
            self.note_scratch = note_voices;
        }

        // 2. Region polyphony
        if let Some(cap) = region_cap {
            if self.voices.count_region_voices(region_id) >= cap.max(1) {
                if let Some(victim) = self.oldest_voice_where(|voice| {
                    voice.region_id() == Some(region_id)
                }) {
                    self.voices.off_ring(victim, delay, &self.regions);
                }
            }
        }

        // 3. Group polyphony
        if let Some(cap) = group_cap {
            if self.voices.count_group_voices(group, &self.regions) >= cap {
                let regions = &self.regions;
                if let Some(victim) = self.oldest_voice_where(|voice| {
                    voice
                        .region_id()
                        .and_then(|id| regions.get(id))
                        .map(|r| r.group == group)
                        .unwrap_or(false)
                }) {
                    self.voices.off_ring(victim, delay, &self.regions);
                }
            }
        }

        // 4. Set hierarchy polyphony
        let mut set = Some(self.region_set_of[region_id]);
        while let Some(set_id) = set {
            let node = self.sets.get(set_id);
            let parent = node.parent;
            if let Some(cap) = node.polyphony {
                let members = &self.set_regions[set_id];
                if self.voices.count_set_voices(members) >= cap.max(1) {
                    if let Some(victim) = self.oldest_voice_where(|voice| {
                        voice
                            .region_id()
                            .map(|id| members.contains(&id))
                            .unwrap_or(false)
                    }) {
                        self.voices.off_ring(victim, delay, &self.regions);
                    }
                }
            }
            set = parent;
        }

        // 5. Engine polyphony
        if let Some(free) = self.voices.find_free_voice() {
            return Some(free);
        }
        let victim = self.voices.steal()?;
        self.voices.off_ring(victim, delay, &self.regions);
        self.voices.get_mut(victim).reset();
        Some(victim)
    }

    /// Oldest playing unreleased voice matching a predicate. Equal ages
    /// resolve to the earliest pool slot.
    fn oldest_voice_where(&self, predicate: impl Fn(&crate::voice::Voice) -> bool) -> Option<VoiceId> {
        self.voices
            .voices()
            .iter()
            .filter(|voice| {
                voice.state() == VoiceState::Playing
                    && !voice.is_released()
                    && predicate(voice)
            })
            .max_by_key(|voice| (voice.age(), std::cmp::Reverse(voice.id())))
            .map(|voice| voice.id())
    }
}

impl std::fmt::Debug for Synth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synth")
            .field("regions", &self.regions.len())
            .field("active_voices", &self.num_active_voices())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 512;

    fn engine() -> Synth {
        let config = EngineConfig {
            samples_per_block: BLOCK,
            ..Default::default()
        };
        Synth::new(config)
    }

    fn sine_region() -> Section {
        Section::new(Header::Region)
            .with("sample", "*sine")
            .with("key", "60")
    }

    fn render(synth: &mut Synth) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0; BLOCK];
        let mut right = vec![0.0; BLOCK];
        synth.render_block(&mut left, &mut right);
        (left, right)
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_silence_without_events() {
        let mut synth = engine();
        synth.load_sections(&[sine_region()]).unwrap();
        let (left, right) = render(&mut synth);
        assert!(left.iter().all(|&s| s == 0.0));
        assert!(right.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_note_on_produces_audio() {
        let mut synth = engine();
        synth.load_sections(&[sine_region()]).unwrap();
        synth.note_on(0, 60, 1.0);
        let (left, _) = render(&mut synth);
        assert!(rms(&left) > 0.01);
        assert_eq!(synth.num_active_voices(), 1);
    }

    #[test]
    fn test_note_outside_range_is_ignored() {
        let mut synth = engine();
        synth.load_sections(&[sine_region()]).unwrap();
        synth.note_on(0, 64, 1.0);
        let (left, _) = render(&mut synth);
        assert_eq!(rms(&left), 0.0);
        assert_eq!(synth.num_active_voices(), 0);
    }

    #[test]
    fn test_event_with_late_delay_dropped() {
        let mut synth = engine();
        synth.load_sections(&[sine_region()]).unwrap();
        synth.note_on(BLOCK, 60, 1.0);
        render(&mut synth);
        assert_eq!(synth.num_active_voices(), 0);
    }

    #[test]
    fn test_note_off_for_silent_note_is_noop() {
        let mut synth = engine();
        synth.load_sections(&[sine_region()]).unwrap();
        synth.note_off(0, 60, 0.0);
        let (left, _) = render(&mut synth);
        assert_eq!(rms(&left), 0.0);
        assert_eq!(synth.num_active_voices(), 0);
    }

    #[test]
    fn test_load_clears_previous_instrument() {
        let mut synth = engine();
        synth.load_sections(&[sine_region()]).unwrap();
        synth.note_on(0, 60, 1.0);
        render(&mut synth);
        assert_eq!(synth.num_active_voices(), 1);

        synth.load_sections(&[sine_region()]).unwrap();
        assert_eq!(synth.num_active_voices(), 0);
        assert_eq!(synth.num_regions(), 1);
    }

    #[test]
    fn test_group_hierarchy_merges_opcodes() {
        let mut synth = engine();
        let sections = vec![
            Section::new(Header::Global).with("volume", "-6"),
            Section::new(Header::Group).with("lokey", "50").with("hikey", "70"),
            Section::new(Header::Region).with("sample", "*sine"),
        ];
        synth.load_sections(&sections).unwrap();
        let region = synth.region(0).unwrap();
        assert_eq!(region.volume, -6.0);
        assert_eq!(region.key_range, Range::new(50, 70));
    }

    #[test]
    fn test_unknown_opcodes_collected() {
        let mut synth = engine();
        let sections = vec![Section::new(Header::Region)
            .with("sample", "*sine")
            .with("made_up_opcode", "42")];
        synth.load_sections(&sections).unwrap();
        assert_eq!(synth.parse_warnings().len(), 1);
    }

    #[test]
    fn test_missing_sample_disables_region() {
        let mut synth = engine();
        let sections = vec![Section::new(Header::Region)
            .with("sample", "ripple_no_such_file_anywhere.wav")
            .with("key", "60")];
        synth.load_sections(&sections).unwrap();
        assert!(synth.region(0).unwrap().is_disabled());

        synth.note_on(0, 60, 1.0);
        render(&mut synth);
        assert_eq!(synth.num_active_voices(), 0);
    }

    #[test]
    fn test_region_polyphony_cap() {
        let mut synth = engine();
        let sections = vec![Section::new(Header::Region)
            .with("sample", "*saw")
            .with("key", "60")
            .with("polyphony", "2")
            .with("ampeg_release", "0.05")];
        synth.load_sections(&sections).unwrap();

        synth.note_on(0, 60, 1.0);
        synth.note_on(1, 60, 1.0);
        synth.note_on(2, 60, 1.0);
        render(&mut synth);

        // Exactly two unreleased; the earliest entered release
        assert_eq!(synth.num_unreleased_voices(), 2);
        assert!(synth.num_active_voices() >= 2);
    }

    #[test]
    fn test_engine_polyphony_steals() {
        let config = EngineConfig {
            samples_per_block: BLOCK,
            num_voices: 4,
            stealing_algorithm: crate::config::StealingAlgorithm::Oldest,
            ..Default::default()
        };
        let mut synth = Synth::new(config);
        let sections = vec![Section::new(Header::Region)
            .with("sample", "*sine")
            .with("lokey", "0")
            .with("hikey", "127")];
        synth.load_sections(&sections).unwrap();

        for key in 60..64 {
            synth.note_on(0, key, 1.0);
        }
        render(&mut synth);
        assert_eq!(synth.num_active_voices(), 4);

        synth.note_on(0, 70, 1.0);
        render(&mut synth);
        // Invariant holds: the pool never exceeds its size
        assert!(synth.num_active_voices() <= 4);
    }

    #[test]
    fn test_master_gain_scales_output() {
        let mut synth = engine();
        synth.load_sections(&[sine_region()]).unwrap();
        synth.note_on(0, 60, 1.0);
        let (reference, _) = render(&mut synth);

        let mut quiet = engine();
        quiet.load_sections(&[sine_region()]).unwrap();
        quiet.set_master_gain(0.5);
        quiet.note_on(0, 60, 1.0);
        let (halved, _) = render(&mut quiet);

        let ratio = rms(&halved) / rms(&reference);
        assert!((ratio - 0.5).abs() < 0.01, "ratio={}", ratio);
    }

    #[test]
    fn test_determinism_with_fixed_seed() {
        let run = || {
            let config = EngineConfig {
                samples_per_block: BLOCK,
                rng_seed: 7,
                ..Default::default()
            };
            let mut synth = Synth::new(config);
            let sections = vec![Section::new(Header::Region)
                .with("sample", "*noise")
                .with("key", "60")
                .with("amp_random", "3")
                .with("pitch_random", "20")];
            synth.load_sections(&sections).unwrap();
            synth.note_on(0, 60, 1.0);
            let (left, _) = render(&mut synth);
            left
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_set_num_voices_stops_everything() {
        let mut synth = engine();
        synth.load_sections(&[sine_region()]).unwrap();
        synth.note_on(0, 60, 1.0);
        render(&mut synth);
        assert_eq!(synth.num_active_voices(), 1);

        synth.set_num_voices(8).unwrap();
        assert_eq!(synth.num_active_voices(), 0);
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let mut synth = engine();
        assert!(synth.set_samples_per_block(0).is_err());
        assert!(synth.set_samples_per_block(100000).is_err());
        assert!(synth.set_num_voices(0).is_err());
        assert!(synth.set_sample_rate(-1.0).is_err());
    }
}
