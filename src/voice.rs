//! Voice Module
//!
//! One active playback instance. A voice borrows its region (by id, with
//! the region list guaranteed stable while any voice plays) and holds its
//! file handle for the full duration it is non-idle. Rendering runs the
//! chain: source frames -> pitch modulation -> amplitude envelope ->
//! filters -> EQ -> pan/width, into a scratch buffer the engine then
//! mixes into the busses.

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::buffer::AudioBuffer;
use crate::config::constants::EG_TRANSITION_TIME;
use crate::curve::CurveSet;
use crate::envelope::AdsrEnvelope;
use crate::file_pool::{FileHandle, FilePool};
use crate::filter::{EqBand, Filter};
use crate::flex_eg::{FlexEgDescription, FlexEnvelope};
use crate::lfo::Lfo;
use crate::math::{apply_width_position, cents_factor, db_to_gain, PanTable};
use crate::midi_state::MidiState;
use crate::modulation::{ModConnection, ModMatrix, ModSource, ModTarget, SourceBuffers};
use crate::oscillator::{
    GeneratorOscillator, NoiseGenerator, NoiseKind, WavetableSet,
};
use crate::region::{LoopMode, OffMode, Region, RegionId, SoundSource};
use crate::smoother::{OnePoleSmoother, PowerFollower};
use crate::tuning::Tuning;
use std::sync::Arc;

/// Stable voice identity: the index in the voice pool.
pub type VoiceId = usize;

/// Voice lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    /// Free for allocation
    #[default]
    Idle,

    /// Rendering
    Playing,

    /// Finished this block; returns to Idle on the next
    CleanupPending,
}

/// What started the voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEventKind {
    NoteOn,
    NoteOff,
    Cc,
}

/// The triggering event, kept for matching and stealing decisions.
#[derive(Debug, Clone, Copy)]
pub struct TriggerEvent {
    pub kind: TriggerEventKind,
    pub note: u8,
    pub velocity: f32,
    pub delay: usize,

    /// Shared by all voices started by the same incoming event
    pub event_id: u64,
}

impl Default for TriggerEvent {
    fn default() -> Self {
        Self {
            kind: TriggerEventKind::NoteOn,
            note: 0,
            velocity: 0.0,
            delay: 0,
            event_id: 0,
        }
    }
}

/// Read-only engine facilities a voice needs at trigger time.
pub struct StartContext<'a> {
    pub midi: &'a MidiState,
    pub tuning: &'a Tuning,
    pub curves: &'a CurveSet,
    pub wavetables: &'a Arc<WavetableSet>,
    pub file_pool: &'a FilePool,
    pub sample_rate: f32,
    pub rng_seed: u64,
}

/// Read-only engine facilities a voice needs per render block.
pub struct RenderContext<'a> {
    pub midi: &'a MidiState,
    pub curves: &'a CurveSet,
    pub pan_table: &'a PanTable,
}

/// Source generator resolved at trigger.
#[derive(Debug, Default)]
enum VoiceSource {
    #[default]
    None,
    File(FileHandle),
    Generator(GeneratorOscillator),
    Noise(NoiseGenerator),
    Silence,
}

/// One voice of the pool.
pub struct Voice {
    id: VoiceId,
    state: VoiceState,
    region_id: Option<RegionId>,
    trigger: TriggerEvent,

    /// Blocks since start
    age: u32,

    source: VoiceSource,
    cursor: u64,
    cursor_frac: f32,
    base_pitch_ratio: f32,
    base_gain: f32,
    base_volume_db: f32,
    generator_frequency: f32,
    loop_plays_remaining: u32,
    pending_start_delay: usize,

    amp_eg: AdsrEnvelope,
    pitch_eg: Option<AdsrEnvelope>,
    fil_eg: Option<AdsrEnvelope>,
    flex_egs: Vec<FlexEnvelope>,
    lfos: Vec<Lfo>,
    matrix: ModMatrix,

    filters: Vec<Filter>,
    eqs: Vec<EqBand>,

    bend_smoother: OnePoleSmoother,
    xfade_smoother: OnePoleSmoother,
    power_follower: PowerFollower,
    rng: SmallRng,

    // Sister ring links; self-referential when the voice stands alone
    sister_next: VoiceId,
    sister_prev: VoiceId,

    // Pedal-deferred release flag, managed by the engine
    pub(crate) deferred_release: bool,

    sample_rate: f32,

    // Per-block scratch, sized to the block size
    amp_eg_buffer: Vec<f32>,
    mod_eg_buffer: Vec<f32>,
    fil_eg_buffer: Vec<f32>,
    lfo_buffers: Vec<Vec<f32>>,
    flex_buffers: Vec<Vec<f32>>,
    target_buffer: Vec<f32>,
    pitch_buffer: Vec<f32>,
}

impl Voice {
    /// Creates an idle voice for a pool slot.
    pub fn new(id: VoiceId, sample_rate: f32, samples_per_block: usize) -> Self {
        Self {
            id,
            state: VoiceState::Idle,
            region_id: None,
            trigger: TriggerEvent::default(),
            age: 0,
            source: VoiceSource::None,
            cursor: 0,
            cursor_frac: 0.0,
            base_pitch_ratio: 1.0,
            base_gain: 0.0,
            base_volume_db: 0.0,
            generator_frequency: 440.0,
            loop_plays_remaining: 0,
            pending_start_delay: 0,
            amp_eg: AdsrEnvelope::new(sample_rate),
            pitch_eg: None,
            fil_eg: None,
            flex_egs: Vec::new(),
            lfos: Vec::new(),
            matrix: ModMatrix::new(&[], sample_rate),
            filters: Vec::new(),
            eqs: Vec::new(),
            bend_smoother: OnePoleSmoother::new(0.003, sample_rate),
            xfade_smoother: OnePoleSmoother::new(0.003, sample_rate),
            power_follower: PowerFollower::new(sample_rate, samples_per_block),
            rng: SmallRng::seed_from_u64(id as u64),
            sister_next: id,
            sister_prev: id,
            deferred_release: false,
            sample_rate,
            amp_eg_buffer: vec![0.0; samples_per_block],
            mod_eg_buffer: vec![0.0; samples_per_block],
            fil_eg_buffer: vec![0.0; samples_per_block],
            lfo_buffers: Vec::new(),
            flex_buffers: Vec::new(),
            target_buffer: vec![0.0; samples_per_block],
            pitch_buffer: vec![0.0; samples_per_block],
        }
    }

    /// Reconfigures rates; stops the voice.
    pub fn configure(&mut self, sample_rate: f32, samples_per_block: usize) {
        self.reset();
        self.sample_rate = sample_rate;
        self.amp_eg = AdsrEnvelope::new(sample_rate);
        self.power_follower.configure(sample_rate, samples_per_block);
        self.amp_eg_buffer.resize(samples_per_block, 0.0);
        self.mod_eg_buffer.resize(samples_per_block, 0.0);
        self.fil_eg_buffer.resize(samples_per_block, 0.0);
        self.target_buffer.resize(samples_per_block, 0.0);
        self.pitch_buffer.resize(samples_per_block, 0.0);
        self.lfo_buffers.clear();
        self.flex_buffers.clear();
    }

    // --- Introspection ---

    pub fn id(&self) -> VoiceId {
        self.id
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == VoiceState::Idle
    }

    pub fn region_id(&self) -> Option<RegionId> {
        self.region_id
    }

    pub fn trigger_event(&self) -> &TriggerEvent {
        &self.trigger
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    /// Tracked output power, consulted by the stealer.
    pub fn average_power(&self) -> f32 {
        self.power_follower.mean_power()
    }

    /// Whether the amplitude EG has entered (or scheduled) its release.
    pub fn is_released(&self) -> bool {
        self.amp_eg.is_released()
    }

    pub fn sister_next(&self) -> VoiceId {
        self.sister_next
    }

    pub fn sister_prev(&self) -> VoiceId {
        self.sister_prev
    }

    pub fn set_sister_links(&mut self, prev: VoiceId, next: VoiceId) {
        self.sister_prev = prev;
        self.sister_next = next;
    }

    // --- Lifecycle ---

    /// Starts the voice for a region and trigger event.
    ///
    /// `random` is the uniform draw of the triggering event, shared with
    /// the region matching step so randomized opcodes stay coherent.
    pub fn start(
        &mut self,
        region: &Region,
        trigger: TriggerEvent,
        random: f32,
        context: &StartContext,
    ) {
        self.state = VoiceState::Playing;
        self.region_id = Some(region.id);
        self.trigger = trigger;
        self.age = 0;
        self.cursor_frac = 0.0;
        self.pending_start_delay = trigger.delay;
        self.deferred_release = false;
        self.sister_next = self.id;
        self.sister_prev = self.id;
        self.rng = SmallRng::seed_from_u64(
            context
                .rng_seed
                .wrapping_add(trigger.event_id)
                .wrapping_mul(0x9E3779B97F4A7C15)
                .wrapping_add(self.id as u64),
        );

        let velocity = trigger.velocity;

        // Gain
        self.base_gain = region.base_gain(trigger.note, velocity, random);
        self.base_volume_db = region.volume;
        if trigger.kind == TriggerEventKind::NoteOff && region.rt_decay > 0.0 {
            let held = context.midi.note_duration(trigger.note, trigger.delay);
            self.base_volume_db += region.rt_decay_db(held);
        }

        // Pitch
        let mut pitch_ratio = region.base_pitch_ratio(trigger.note, velocity, random);
        self.generator_frequency = context.tuning.frequency(region.pitch_keycenter);

        // Source
        self.cursor = 0;
        self.loop_plays_remaining = region.count.unwrap_or(1).max(1);
        self.source = match &region.source {
            SoundSource::File { .. } => match region.file_id {
                Some(file_id) => match context.file_pool.get_handle(file_id) {
                    Some(handle) => {
                        let info = handle.data().information();
                        pitch_ratio *=
                            (info.sample_rate / context.sample_rate as f64) as f32;
                        self.cursor = region.start_offset(random, context.midi)
                            * info.oversampling as u64;
                        VoiceSource::File(handle)
                    }
                    None => VoiceSource::Silence,
                },
                None => VoiceSource::Silence,
            },
            SoundSource::Generator(wave) => VoiceSource::Generator(GeneratorOscillator::new(
                *wave,
                Arc::clone(context.wavetables),
                region.oscillator_multi,
                region.oscillator_detune,
                context.sample_rate,
            )),
            SoundSource::Noise => VoiceSource::Noise(NoiseGenerator::new(NoiseKind::Uniform {
                bounds: crate::config::constants::NOISE_BOUNDS,
            })),
            SoundSource::Silence => VoiceSource::Silence,
        };
        self.base_pitch_ratio = pitch_ratio;

        // Envelopes
        let one_shot = region.effective_loop_mode() == LoopMode::OneShot
            && region.source.is_generator();
        self.amp_eg = AdsrEnvelope::new(self.sample_rate);
        self.amp_eg.trigger(
            &region.amp_eg.evaluate(context.midi, velocity),
            trigger.delay,
            one_shot,
        );
        self.pitch_eg = region.pitch_eg.as_ref().map(|description| {
            let mut eg = AdsrEnvelope::new(self.sample_rate);
            eg.trigger(&description.evaluate(context.midi, velocity), trigger.delay, false);
            eg
        });
        self.fil_eg = region.fil_eg.as_ref().map(|description| {
            let mut eg = AdsrEnvelope::new(self.sample_rate);
            eg.trigger(&description.evaluate(context.midi, velocity), trigger.delay, false);
            eg
        });

        self.flex_egs = region
            .flex_egs
            .iter()
            .map(|entry| {
                let description = FlexEgDescription {
                    points: entry.points.clone(),
                    sustain_point: entry.sustain_point,
                    free_running: entry.free_running,
                };
                let mut eg = FlexEnvelope::new(description, self.sample_rate);
                eg.trigger(trigger.delay);
                eg
            })
            .collect();

        self.lfos = region
            .lfos
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let seed = context
                    .rng_seed
                    .wrapping_add(trigger.event_id)
                    .wrapping_add(index as u64 + 1);
                let mut lfo = Lfo::new(entry.description(), self.sample_rate, seed);
                lfo.trigger(trigger.delay);
                lfo
            })
            .collect();

        // Modulation routing: region connections plus the implicit routes
        // of LFO/EG depth opcodes
        let mut connections: Vec<ModConnection> = region.connections.clone();
        for (index, entry) in region.lfos.iter().enumerate() {
            let source = ModSource::Lfo(index as u8);
            if entry.amplitude_depth != 0.0 {
                connections.push(ModConnection::new(source, ModTarget::Volume, entry.amplitude_depth));
            }
            if entry.pitch_depth != 0.0 {
                connections.push(ModConnection::new(source, ModTarget::Pitch, entry.pitch_depth));
            }
            if entry.cutoff_depth != 0.0 {
                connections.push(ModConnection::new(
                    source,
                    ModTarget::FilCutoff(0),
                    entry.cutoff_depth,
                ));
            }
            if entry.pan_depth != 0.0 {
                connections.push(ModConnection::new(source, ModTarget::Pan, entry.pan_depth));
            }
        }
        for (index, entry) in region.flex_egs.iter().enumerate() {
            let source = ModSource::FlexEg(index as u8);
            if entry.amplitude_depth != 0.0 {
                connections.push(ModConnection::new(
                    source,
                    ModTarget::Amplitude,
                    entry.amplitude_depth,
                ));
            }
            if entry.pitch_depth != 0.0 {
                connections.push(ModConnection::new(source, ModTarget::Pitch, entry.pitch_depth));
            }
            if entry.cutoff_depth != 0.0 {
                connections.push(ModConnection::new(
                    source,
                    ModTarget::FilCutoff(0),
                    entry.cutoff_depth,
                ));
            }
        }
        if let Some(description) = &region.pitch_eg {
            connections.push(ModConnection {
                source: ModSource::PitchEg,
                target: ModTarget::Pitch,
                depth: description.depth,
                vel_to_depth: description.vel2depth,
                depth_mod: None,
            });
        }
        if let Some(description) = &region.fil_eg {
            connections.push(ModConnection {
                source: ModSource::FilEg,
                target: ModTarget::FilCutoff(0),
                depth: description.depth,
                vel_to_depth: description.vel2depth,
                depth_mod: None,
            });
        }
        self.matrix = ModMatrix::new(&connections, self.sample_rate);
        self.matrix.trigger(context.midi, context.curves);

        // Filters and EQs
        self.filters = region
            .filters
            .iter()
            .map(|description| Filter::new(description.filter_type, self.sample_rate))
            .collect();
        self.eqs = region
            .eqs
            .iter()
            .map(|description| EqBand::new(description.eq_type, self.sample_rate))
            .collect();

        // Smoothers and scratch
        self.bend_smoother = OnePoleSmoother::new(0.003, self.sample_rate);
        self.bend_smoother
            .reset(region.bend_cents(context.midi.pitch_bend()));
        self.xfade_smoother = OnePoleSmoother::new(0.003, self.sample_rate);
        self.xfade_smoother
            .reset(region.cc_crossfade_gain(context.midi));
        self.power_follower.clear();

        let block = self.amp_eg_buffer.len();
        self.lfo_buffers
            .resize_with(self.lfos.len().max(self.lfo_buffers.len()), || {
                vec![0.0; block]
            });
        self.flex_buffers
            .resize_with(self.flex_egs.len().max(self.flex_buffers.len()), || {
                vec![0.0; block]
            });
    }

    /// Schedules the note release at a block offset.
    pub fn release(&mut self, delay: usize) {
        if self.state != VoiceState::Playing {
            return;
        }
        self.amp_eg.start_release(delay);
        if let Some(eg) = &mut self.pitch_eg {
            eg.start_release(delay);
        }
        if let Some(eg) = &mut self.fil_eg {
            eg.start_release(delay);
        }
        for eg in &mut self.flex_egs {
            eg.release();
        }
    }

    /// Kills the voice per the region's off mode: fast fade, its natural
    /// release, or a fixed time.
    pub fn off(&mut self, delay: usize, mode: OffMode, off_time: f32) {
        match mode {
            OffMode::Fast => self.amp_eg.set_release_time(EG_TRANSITION_TIME),
            OffMode::Time => self.amp_eg.set_release_time(off_time),
            OffMode::Normal => {}
        }
        self.release(delay);
    }

    /// Forces the voice back to the pool immediately.
    pub fn reset(&mut self) {
        self.state = VoiceState::Idle;
        self.region_id = None;
        self.source = VoiceSource::None;
        self.deferred_release = false;
        self.sister_next = self.id;
        self.sister_prev = self.id;
        self.power_follower.clear();
    }

    /// Moves CleanupPending voices back to Idle; called between blocks.
    pub fn cleanup(&mut self) {
        if self.state == VoiceState::CleanupPending {
            self.reset();
        }
    }

    // --- Rendering ---

    /// Renders `frames` stereo frames into `output` (pre-zeroed scratch).
    /// Returns false when the voice produced nothing and can be skipped.
    pub fn render(
        &mut self,
        region: &Region,
        output: &mut AudioBuffer,
        frames: usize,
        context: &RenderContext,
    ) -> bool {
        if self.state != VoiceState::Playing {
            return false;
        }
        let frames = frames.min(output.frames());

        // Per-voice modulator buffers
        self.amp_eg.render(&mut self.amp_eg_buffer[..frames]);
        if let Some(eg) = &mut self.pitch_eg {
            eg.render(&mut self.mod_eg_buffer[..frames]);
        }
        if let Some(eg) = &mut self.fil_eg {
            eg.render(&mut self.fil_eg_buffer[..frames]);
        }
        for (eg, buffer) in self.flex_egs.iter_mut().zip(&mut self.flex_buffers) {
            eg.render(&mut buffer[..frames]);
        }
        for (lfo, buffer) in self.lfos.iter_mut().zip(&mut self.lfo_buffers) {
            lfo.render(&mut buffer[..frames]);
        }

        let released = self.amp_eg.is_released();

        // Pitch modulation: matrix target plus smoothed pitch bend
        {
            let buffers = SourceBuffers {
                amp_eg: Some(&self.amp_eg_buffer[..frames]),
                pitch_eg: self.pitch_eg.as_ref().map(|_| &self.mod_eg_buffer[..frames]),
                fil_eg: self.fil_eg.as_ref().map(|_| &self.fil_eg_buffer[..frames]),
                flex_egs: &self.flex_buffers,
                lfos: &self.lfo_buffers,
                velocity: self.trigger.velocity,
            };
            self.matrix.render_target(
                ModTarget::Pitch,
                &buffers,
                context.midi,
                context.curves,
                &mut self.pitch_buffer[..frames],
            );
        }
        let bend_target = region.bend_cents(context.midi.pitch_bend());
        for sample in self.pitch_buffer[..frames].iter_mut() {
            *sample += self.bend_smoother.process(bend_target);
        }

        // Source frames
        let finished = self.render_source(region, output, frames, released);

        // Amplitude: envelope, volume dB modulation, amplitude percent,
        // controller crossfade
        {
            let buffers = SourceBuffers {
                amp_eg: Some(&self.amp_eg_buffer[..frames]),
                pitch_eg: self.pitch_eg.as_ref().map(|_| &self.mod_eg_buffer[..frames]),
                fil_eg: self.fil_eg.as_ref().map(|_| &self.fil_eg_buffer[..frames]),
                flex_egs: &self.flex_buffers,
                lfos: &self.lfo_buffers,
                velocity: self.trigger.velocity,
            };
            self.matrix.render_target(
                ModTarget::Volume,
                &buffers,
                context.midi,
                context.curves,
                &mut self.target_buffer[..frames],
            );
        }
        let xfade_target = region.cc_crossfade_gain(context.midi);
        {
            let (left, right) = output.stereo_mut();
            for i in 0..frames {
                let volume_db = self.base_volume_db + self.target_buffer[i];
                let gain = self.base_gain
                    * self.amp_eg_buffer[i]
                    * db_to_gain(volume_db)
                    * self.xfade_smoother.process(xfade_target);
                left[i] *= gain;
                right[i] *= gain;
            }
        }

        // Amplitude percent target (multiplicative), only when routed
        if self.matrix.has_target(ModTarget::Amplitude) {
            let buffers = SourceBuffers {
                amp_eg: Some(&self.amp_eg_buffer[..frames]),
                flex_egs: &self.flex_buffers,
                lfos: &self.lfo_buffers,
                velocity: self.trigger.velocity,
                ..Default::default()
            };
            self.matrix.render_target(
                ModTarget::Amplitude,
                &buffers,
                context.midi,
                context.curves,
                &mut self.target_buffer[..frames],
            );
            let (left, right) = output.stereo_mut();
            for i in 0..frames {
                left[i] *= self.target_buffer[i];
                right[i] *= self.target_buffer[i];
            }
        }

        // Filter stage
        self.run_filters(region, output, frames, context);

        // EQ stage
        self.run_eqs(region, output, frames, context);

        // Pan, width, position
        self.run_pan(region, output, frames, context);

        // Power follower for the stealer
        {
            let (left, right) = output.stereo_mut();
            self.power_follower.process(left, right, frames);
        }

        self.age = self.age.saturating_add(1);
        self.pending_start_delay = 0;

        if finished && !self.amp_eg.is_released() {
            // Out of sample data: let the envelope run out
            self.release(frames.saturating_sub(1));
        }
        if self.amp_eg.is_done() {
            self.state = VoiceState::CleanupPending;
        }
        true
    }

    /// Generates source frames into the scratch buffer, applying pitch.
    /// Returns true when the sample data ran out.
    fn render_source(
        &mut self,
        region: &Region,
        output: &mut AudioBuffer,
        frames: usize,
        released: bool,
    ) -> bool {
        let start = self.pending_start_delay.min(frames);
        let mut finished = false;

        match &mut self.source {
            VoiceSource::File(handle) => {
                let view = handle.view();
                let oversampling = handle.data().information().oversampling as u64;
                let channels = view.channels();
                let total = view.total_frames() as u64;
                let end_frame = region
                    .sample_end
                    .saturating_mul(oversampling)
                    .min(total)
                    .max(1);
                let readable = view.frames() as u64;

                // Effective loop points: region opcodes override file
                // metadata
                let metadata_loop = handle.data().information().loop_points;
                let loop_start = region
                    .loop_start
                    .map(|s| s * oversampling)
                    .or(metadata_loop.map(|l| l.start));
                let loop_end = region
                    .loop_end
                    .map(|e| e * oversampling + (oversampling - 1))
                    .or(metadata_loop.map(|l| l.end));
                let loop_mode = region.effective_loop_mode();
                let looping = match loop_mode {
                    LoopMode::LoopContinuous => true,
                    LoopMode::LoopSustain => !released,
                    LoopMode::NoLoop | LoopMode::OneShot => false,
                };
                let (loop_start, loop_end) = match (loop_start, loop_end) {
                    (Some(start), Some(end)) if end > start && end < end_frame => {
                        (start, end)
                    }
                    _ => (0, end_frame.saturating_sub(1)),
                };
                let crossfade_frames =
                    (region.loop_crossfade * self.sample_rate) as u64;

                let (left, right) = output.stereo_mut();
                for i in start..frames {
                    if finished {
                        break;
                    }

                    let index = self.cursor;
                    if index >= readable {
                        // Streaming underrun or true end of data
                        finished = true;
                        break;
                    }

                    let frac = self.cursor_frac;
                    let read = |channel: usize, at: u64| -> f32 {
                        let a = view.sample(channel, at as usize);
                        let b = view.sample(channel, (at + 1).min(end_frame - 1) as usize);
                        a + (b - a) * frac
                    };

                    let mut l = read(0, index);
                    let mut r = if channels > 1 { read(1, index) } else { l };

                    // Loop crossfade: blend in the pre-loop material near
                    // the loop end
                    if looping && crossfade_frames > 0 && index > loop_start {
                        let to_end = loop_end.saturating_sub(index);
                        if to_end < crossfade_frames {
                            let loop_length = loop_end - loop_start + 1;
                            if index >= loop_length {
                                let mix =
                                    1.0 - to_end as f32 / crossfade_frames as f32;
                                let shadow = index - loop_length;
                                l = l * (1.0 - mix) + read(0, shadow) * mix;
                                r = if channels > 1 {
                                    r * (1.0 - mix) + read(1, shadow) * mix
                                } else {
                                    l
                                };
                            }
                        }
                    }

                    left[i] = l;
                    right[i] = r;

                    // Advance the cursor by the per-sample pitch ratio
                    let ratio = self.base_pitch_ratio
                        * cents_factor(self.pitch_buffer[i]);
                    let advance = self.cursor_frac + ratio.max(0.0);
                    self.cursor += advance as u64;
                    self.cursor_frac = advance.fract();

                    if looping && self.cursor > loop_end {
                        self.cursor -= loop_end - loop_start + 1;
                    } else if self.cursor >= end_frame {
                        if self.loop_plays_remaining > 1 {
                            self.loop_plays_remaining -= 1;
                            self.cursor = 0;
                        } else {
                            finished = true;
                        }
                    }
                }
            }
            VoiceSource::Generator(oscillator) => {
                let (left, right) = output.stereo_mut();
                for i in start..frames {
                    let ratio =
                        self.base_pitch_ratio * cents_factor(self.pitch_buffer[i]);
                    let frequency = self.generator_frequency * ratio;
                    let (l, r) = oscillator.next_frame(frequency);
                    left[i] = l;
                    right[i] = r;
                }
            }
            VoiceSource::Noise(noise) => {
                let (left, right) = output.stereo_mut();
                for i in start..frames {
                    let sample = noise.next_sample(&mut self.rng);
                    left[i] = sample;
                    right[i] = sample;
                }
            }
            VoiceSource::Silence | VoiceSource::None => {}
        }

        finished
    }

    fn run_filters(
        &mut self,
        region: &Region,
        output: &mut AudioBuffer,
        frames: usize,
        context: &RenderContext,
    ) {
        if self.filters.is_empty() {
            return;
        }

        for (index, (filter, description)) in self
            .filters
            .iter_mut()
            .zip(&region.filters)
            .enumerate()
        {
            // Control-rate modulation: one target value per block
            let buffers = SourceBuffers {
                amp_eg: Some(&self.amp_eg_buffer[..frames]),
                fil_eg: self.fil_eg.as_ref().map(|_| &self.fil_eg_buffer[..frames]),
                flex_egs: &self.flex_buffers,
                lfos: &self.lfo_buffers,
                velocity: self.trigger.velocity,
                ..Default::default()
            };
            self.matrix.render_target(
                ModTarget::FilCutoff(index as u8),
                &buffers,
                context.midi,
                context.curves,
                &mut self.target_buffer[..frames],
            );
            let cutoff_mod_cents = self.target_buffer[frames - 1];

            let keytrack_cents = description.keytrack
                * (self.trigger.note as f32 - description.keycenter as f32);
            let veltrack_cents = description.veltrack * self.trigger.velocity;
            let cutoff = description.cutoff
                * cents_factor(keytrack_cents + veltrack_cents + cutoff_mod_cents);

            self.matrix.render_target(
                ModTarget::FilResonance(index as u8),
                &buffers,
                context.midi,
                context.curves,
                &mut self.target_buffer[..frames],
            );
            let resonance = description.resonance + self.target_buffer[frames - 1];

            let (left, right) = output.stereo_mut();
            filter.process(
                &mut left[..frames],
                &mut right[..frames],
                cutoff,
                resonance,
                description.gain,
            );
        }
    }

    fn run_eqs(
        &mut self,
        region: &Region,
        output: &mut AudioBuffer,
        frames: usize,
        context: &RenderContext,
    ) {
        if self.eqs.is_empty() {
            return;
        }

        for (index, (band, description)) in
            self.eqs.iter_mut().zip(&region.eqs).enumerate()
        {
            let buffers = SourceBuffers {
                flex_egs: &self.flex_buffers,
                lfos: &self.lfo_buffers,
                velocity: self.trigger.velocity,
                ..Default::default()
            };
            self.matrix.render_target(
                ModTarget::EqFrequency(index as u8),
                &buffers,
                context.midi,
                context.curves,
                &mut self.target_buffer[..frames],
            );
            let frequency = description.frequency
                + description.vel2frequency * self.trigger.velocity
                + self.target_buffer[frames - 1];

            self.matrix.render_target(
                ModTarget::EqGain(index as u8),
                &buffers,
                context.midi,
                context.curves,
                &mut self.target_buffer[..frames],
            );
            let gain = description.gain
                + description.vel2gain * self.trigger.velocity
                + self.target_buffer[frames - 1];

            let (left, right) = output.stereo_mut();
            band.process(
                &mut left[..frames],
                &mut right[..frames],
                frequency,
                description.bandwidth,
                gain,
            );
        }
    }

    fn run_pan(
        &mut self,
        region: &Region,
        output: &mut AudioBuffer,
        frames: usize,
        context: &RenderContext,
    ) {
        let mut pan = region.pan / 100.0;
        if self.matrix.has_target(ModTarget::Pan) {
            let buffers = SourceBuffers {
                flex_egs: &self.flex_buffers,
                lfos: &self.lfo_buffers,
                velocity: self.trigger.velocity,
                ..Default::default()
            };
            self.matrix.render_target(
                ModTarget::Pan,
                &buffers,
                context.midi,
                context.curves,
                &mut self.target_buffer[..frames],
            );
            pan += self.target_buffer[frames - 1];
        }

        let width = region.width / 100.0;
        let position = region.position / 100.0;
        let stereo_source = matches!(
            &self.source,
            VoiceSource::File(handle) if handle.data().information().channels > 1
        ) || matches!(&self.source, VoiceSource::Generator(_) if region.oscillator_multi > 1);

        let (pan_left, pan_right) = context.pan_table.gains(pan.clamp(-1.0, 1.0));
        let (left, right) = output.stereo_mut();
        if stereo_source {
            for i in 0..frames {
                let l = left[i] * pan_left * std::f32::consts::SQRT_2;
                let r = right[i] * pan_right * std::f32::consts::SQRT_2;
                let (wl, wr) =
                    apply_width_position(l, r, width, position, context.pan_table);
                left[i] = wl;
                right[i] = wr;
            }
        } else {
            for i in 0..frames {
                left[i] *= pan_left;
                right[i] *= pan_right;
            }
        }
    }
}

impl std::fmt::Debug for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Voice")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("region", &self.region_id)
            .field("age", &self.age)
            .finish()
    }
}
