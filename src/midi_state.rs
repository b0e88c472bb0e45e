//! MidiState Module
//!
//! Mutable snapshot of the incoming MIDI-like state: last note velocities,
//! note-on times, controller values, pitch bend, channel aftertouch and
//! tempo. The engine's event-ingest step is the single writer; voices read
//! it on the same thread during render.
//!
//! Controller slots keep a small ordered list of `(delay, value)` events
//! for the current block so that voices can observe mid-block changes; the
//! lists are dropped at the end of the block with the final value kept as
//! the running state.

use crate::config::constants::CC_COUNT;

/// One timed controller change within the current block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    /// Frame offset within the block
    pub delay: usize,

    /// Normalized value
    pub value: f32,
}

/// Per-controller state: the running value, the value the block started
/// with, and this block's events.
#[derive(Debug, Clone)]
struct CcSlot {
    value: f32,
    block_start_value: f32,
    events: Vec<Event>,
}

impl CcSlot {
    fn new() -> Self {
        Self {
            value: 0.0,
            block_start_value: 0.0,
            events: Vec::with_capacity(8),
        }
    }
}

/// The engine's view of the MIDI channel state.
#[derive(Debug, Clone)]
pub struct MidiState {
    /// Last note-on velocity per key, normalized
    note_velocities: [f32; 128],

    /// Engine frame at which each key was last pressed
    note_on_frames: [u64; 128],

    /// Whether each key is currently held
    pressed: [bool; 128],

    /// Controller slots
    cc: Vec<CcSlot>,

    /// Pitch bend, normalized -1..1
    pitch_bend: f32,

    /// Pitch bend events this block
    pitch_bend_events: Vec<Event>,

    /// Channel aftertouch, normalized 0..1
    channel_aftertouch: f32,

    /// Tempo in seconds per quarter note
    seconds_per_quarter: f32,

    /// Keys currently held
    active_notes: usize,

    /// Engine frame counter, advanced per block
    current_frame: u64,

    /// Sample rate for duration queries
    sample_rate: f32,
}

impl MidiState {
    /// Creates a state snapshot for the given sample rate.
    pub fn new(sample_rate: f32) -> Self {
        Self {
            note_velocities: [0.0; 128],
            note_on_frames: [0; 128],
            pressed: [false; 128],
            cc: (0..CC_COUNT).map(|_| CcSlot::new()).collect(),
            pitch_bend: 0.0,
            pitch_bend_events: Vec::with_capacity(8),
            channel_aftertouch: 0.0,
            seconds_per_quarter: 0.5,
            active_notes: 0,
            current_frame: 0,
            sample_rate,
        }
    }

    /// Updates the sample rate used for note duration queries.
    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
    }

    /// Registers a note-on.
    pub fn note_on_event(&mut self, delay: usize, note: u8, velocity: f32) {
        let note = note as usize & 127;
        self.note_velocities[note] = velocity.clamp(0.0, 1.0);
        self.note_on_frames[note] = self.current_frame + delay as u64;
        if !self.pressed[note] {
            self.pressed[note] = true;
            self.active_notes += 1;
        }
    }

    /// Registers a note-off.
    pub fn note_off_event(&mut self, _delay: usize, note: u8, _velocity: f32) {
        let note = note as usize & 127;
        if self.pressed[note] {
            self.pressed[note] = false;
            self.active_notes = self.active_notes.saturating_sub(1);
        }
    }

    /// Registers a controller change.
    pub fn cc_event(&mut self, delay: usize, number: u16, value: f32) {
        let Some(slot) = self.cc.get_mut(number as usize) else {
            return;
        };
        let value = value.clamp(0.0, 1.0);
        slot.value = value;
        if slot.events.len() < slot.events.capacity() {
            slot.events.push(Event { delay, value });
        }
    }

    /// Registers a pitch bend change, normalized to -1..1.
    pub fn pitch_bend_event(&mut self, delay: usize, value: f32) {
        let value = value.clamp(-1.0, 1.0);
        self.pitch_bend = value;
        if self.pitch_bend_events.len() < self.pitch_bend_events.capacity() {
            self.pitch_bend_events.push(Event { delay, value });
        }
    }

    /// Registers a channel aftertouch change.
    pub fn aftertouch_event(&mut self, _delay: usize, value: f32) {
        self.channel_aftertouch = value.clamp(0.0, 1.0);
    }

    /// Registers a tempo change.
    pub fn tempo_event(&mut self, _delay: usize, seconds_per_quarter: f32) {
        if seconds_per_quarter > 0.0 {
            self.seconds_per_quarter = seconds_per_quarter;
        }
    }

    /// Ends the block: drops per-block event lists, keeps running values
    /// and advances the frame clock.
    pub fn advance_block(&mut self, frames: usize) {
        for slot in &mut self.cc {
            slot.events.clear();
            slot.block_start_value = slot.value;
        }
        self.pitch_bend_events.clear();
        self.current_frame += frames as u64;
    }

    /// Last note-on velocity for a key.
    pub fn note_velocity(&self, note: u8) -> f32 {
        self.note_velocities[note as usize & 127]
    }

    /// Whether a key is currently held.
    pub fn is_note_pressed(&self, note: u8) -> bool {
        self.pressed[note as usize & 127]
    }

    /// Seconds a key has been held, measured at `delay` within the block.
    pub fn note_duration(&self, note: u8, delay: usize) -> f32 {
        let note = note as usize & 127;
        let now = self.current_frame + delay as u64;
        let held = now.saturating_sub(self.note_on_frames[note]);
        held as f32 / self.sample_rate
    }

    /// Running value for a controller.
    pub fn cc_value(&self, number: u16) -> f32 {
        self.cc
            .get(number as usize)
            .map(|slot| slot.value)
            .unwrap_or(0.0)
    }

    /// Controller value observed at `delay` within the current block:
    /// the last event at or before `delay`, else the value the block
    /// started with.
    pub fn cc_value_at(&self, number: u16, delay: usize) -> f32 {
        let Some(slot) = self.cc.get(number as usize) else {
            return 0.0;
        };
        let mut value = slot.block_start_value;
        for event in &slot.events {
            if event.delay <= delay {
                value = event.value;
            } else {
                break;
            }
        }
        value
    }

    /// This block's events for a controller, in delay order.
    pub fn cc_events(&self, number: u16) -> &[Event] {
        self.cc
            .get(number as usize)
            .map(|slot| slot.events.as_slice())
            .unwrap_or(&[])
    }

    /// Current pitch bend, -1..1.
    pub fn pitch_bend(&self) -> f32 {
        self.pitch_bend
    }

    /// Current channel aftertouch, 0..1.
    pub fn channel_aftertouch(&self) -> f32 {
        self.channel_aftertouch
    }

    /// Current tempo in seconds per quarter note.
    pub fn seconds_per_quarter(&self) -> f32 {
        self.seconds_per_quarter
    }

    /// Current tempo in beats per minute.
    pub fn bpm(&self) -> f32 {
        60.0 / self.seconds_per_quarter
    }

    /// Number of keys currently held.
    pub fn active_notes(&self) -> usize {
        self.active_notes
    }

    /// Engine frame at the start of the current block.
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Clears everything back to power-on state.
    pub fn reset(&mut self) {
        self.note_velocities = [0.0; 128];
        self.note_on_frames = [0; 128];
        self.pressed = [false; 128];
        for slot in &mut self.cc {
            slot.value = 0.0;
            slot.block_start_value = 0.0;
            slot.events.clear();
        }
        self.pitch_bend = 0.0;
        self.pitch_bend_events.clear();
        self.channel_aftertouch = 0.0;
        self.active_notes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_off_tracking() {
        let mut state = MidiState::new(48000.0);
        state.note_on_event(0, 60, 0.8);
        assert_eq!(state.active_notes(), 1);
        assert!(state.is_note_pressed(60));
        assert!((state.note_velocity(60) - 0.8).abs() < 1e-6);

        state.note_off_event(0, 60, 0.0);
        assert_eq!(state.active_notes(), 0);
        assert!(!state.is_note_pressed(60));
        // Velocity of the last press is retained for release triggers
        assert!((state.note_velocity(60) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_repeated_note_on_counts_once() {
        let mut state = MidiState::new(48000.0);
        state.note_on_event(0, 60, 0.5);
        state.note_on_event(10, 60, 0.9);
        assert_eq!(state.active_notes(), 1);
        assert!((state.note_velocity(60) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_cc_running_value_kept_after_block() {
        let mut state = MidiState::new(48000.0);
        state.cc_event(5, 64, 1.0);
        assert_eq!(state.cc_events(64).len(), 1);

        state.advance_block(512);
        assert!(state.cc_events(64).is_empty());
        assert!((state.cc_value(64) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cc_value_at_delay() {
        let mut state = MidiState::new(48000.0);
        state.cc_event(100, 1, 0.25);
        state.cc_event(200, 1, 0.75);

        assert!((state.cc_value_at(1, 150) - 0.25).abs() < 1e-6);
        assert!((state.cc_value_at(1, 250) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_note_duration_advances_with_blocks() {
        let mut state = MidiState::new(48000.0);
        state.note_on_event(0, 60, 1.0);
        state.advance_block(48000);
        assert!((state.note_duration(60, 0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_pitch_bend_clamped() {
        let mut state = MidiState::new(48000.0);
        state.pitch_bend_event(0, 2.0);
        assert_eq!(state.pitch_bend(), 1.0);
        state.pitch_bend_event(0, -3.0);
        assert_eq!(state.pitch_bend(), -1.0);
    }

    #[test]
    fn test_tempo_conversion() {
        let mut state = MidiState::new(48000.0);
        state.tempo_event(0, 0.5);
        assert!((state.bpm() - 120.0).abs() < 1e-3);
        // Non-positive tempo is ignored
        state.tempo_event(0, 0.0);
        assert!((state.bpm() - 120.0).abs() < 1e-3);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut state = MidiState::new(48000.0);
        state.note_on_event(0, 60, 1.0);
        state.cc_event(0, 64, 1.0);
        state.reset();
        assert_eq!(state.active_notes(), 0);
        assert_eq!(state.cc_value(64), 0.0);
    }
}
