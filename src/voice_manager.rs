//! VoiceManager Module
//!
//! The fixed voice pool, sister-voice rings and the stealing policies.
//! Voices started by the same event are linked into a circular doubly
//! linked ring threaded through the pool slots, so a kill or release
//! propagates across the whole set without heap containers.

use crate::config::constants::{STEALING_AGE_COEFF, STEALING_POWER_COEFF};
use crate::config::StealingAlgorithm;
use crate::region::{Region, RegionId};
use crate::voice::{Voice, VoiceId, VoiceState};

/// The pool of voices plus stealing state.
#[derive(Debug)]
pub struct VoiceManager {
    voices: Vec<Voice>,
    stealing: StealingAlgorithm,

    /// Scratch for candidate ordering, sized to the pool
    candidates: Vec<VoiceId>,

    /// Scratch for ring traversal
    ring_scratch: Vec<VoiceId>,
}

impl VoiceManager {
    /// Creates a pool of `num_voices` idle voices.
    pub fn new(num_voices: usize, sample_rate: f32, samples_per_block: usize) -> Self {
        Self {
            voices: (0..num_voices)
                .map(|id| Voice::new(id, sample_rate, samples_per_block))
                .collect(),
            stealing: StealingAlgorithm::default(),
            candidates: Vec::with_capacity(num_voices),
            ring_scratch: Vec::with_capacity(num_voices),
        }
    }

    /// Resizes the pool; stops everything.
    pub fn set_num_voices(&mut self, num_voices: usize, sample_rate: f32, samples_per_block: usize) {
        self.voices = (0..num_voices)
            .map(|id| Voice::new(id, sample_rate, samples_per_block))
            .collect();
        self.candidates = Vec::with_capacity(num_voices);
        self.ring_scratch = Vec::with_capacity(num_voices);
    }

    /// Reconfigures every voice for new rates; stops everything.
    pub fn configure(&mut self, sample_rate: f32, samples_per_block: usize) {
        for voice in &mut self.voices {
            voice.configure(sample_rate, samples_per_block);
        }
    }

    /// Selects the stealing algorithm.
    pub fn set_stealing_algorithm(&mut self, algorithm: StealingAlgorithm) {
        self.stealing = algorithm;
    }

    /// Pool size.
    pub fn num_voices(&self) -> usize {
        self.voices.len()
    }

    /// Voices not currently idle.
    pub fn num_active_voices(&self) -> usize {
        self.voices.iter().filter(|v| !v.is_idle()).count()
    }

    /// Playing voices that have not entered release.
    pub fn num_unreleased_voices(&self) -> usize {
        self.voices
            .iter()
            .filter(|v| v.state() == VoiceState::Playing && !v.is_released())
            .count()
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn voices_mut(&mut self) -> &mut [Voice] {
        &mut self.voices
    }

    pub fn get(&self, id: VoiceId) -> &Voice {
        &self.voices[id]
    }

    pub fn get_mut(&mut self, id: VoiceId) -> &mut Voice {
        &mut self.voices[id]
    }

    /// Stops every voice immediately.
    pub fn reset_all(&mut self) {
        for voice in &mut self.voices {
            voice.reset();
        }
    }

    /// Moves finished voices back to idle; called after each block.
    pub fn cleanup(&mut self) {
        for voice in &mut self.voices {
            voice.cleanup();
        }
    }

    /// First idle voice, if any.
    pub fn find_free_voice(&self) -> Option<VoiceId> {
        self.voices.iter().position(|v| v.is_idle())
    }

    // --- Sister rings ---

    /// Links the voices started by one event into a circular ring.
    pub fn close_ring(&mut self, started: &[VoiceId]) {
        if started.len() < 2 {
            return;
        }
        let count = started.len();
        for (position, &id) in started.iter().enumerate() {
            let prev = started[(position + count - 1) % count];
            let next = started[(position + 1) % count];
            self.voices[id].set_sister_links(prev, next);
        }
    }

    /// Collects the ids of a voice's ring, the voice included.
    fn collect_ring(&mut self, start: VoiceId) {
        self.ring_scratch.clear();
        let mut current = start;
        loop {
            self.ring_scratch.push(current);
            current = self.voices[current].sister_next();
            if current == start || self.ring_scratch.len() >= self.voices.len() {
                break;
            }
        }
    }

    /// Applies a function to every voice of a ring.
    pub fn for_each_in_ring(&mut self, start: VoiceId, mut f: impl FnMut(&mut Voice)) {
        self.collect_ring(start);
        let ids = std::mem::take(&mut self.ring_scratch);
        for &id in &ids {
            f(&mut self.voices[id]);
        }
        self.ring_scratch = ids;
    }

    /// Offs a voice's entire ring using each member's region off mode.
    pub fn off_ring(&mut self, start: VoiceId, delay: usize, regions: &[Region]) {
        self.for_each_in_ring(start, |voice| {
            let (mode, time) = voice
                .region_id()
                .and_then(|id| regions.get(id))
                .map(|region| (region.off_mode, region.off_time))
                .unwrap_or_default();
            voice.off(delay, mode, time);
        });
    }

    /// Releases a voice's entire ring (normal release).
    pub fn release_ring(&mut self, start: VoiceId, delay: usize) {
        self.for_each_in_ring(start, |voice| voice.release(delay));
    }

    /// The highest sister power of a voice's ring.
    fn ring_max_power(&mut self, start: VoiceId) -> f32 {
        self.collect_ring(start);
        self.ring_scratch
            .iter()
            .map(|&id| self.voices[id].average_power())
            .fold(0.0, f32::max)
    }

    fn sisters(&self, a: VoiceId, b: VoiceId) -> bool {
        let mut current = a;
        loop {
            if current == b {
                return true;
            }
            current = self.voices[current].sister_next();
            if current == a {
                return false;
            }
        }
    }

    // --- Stealing ---

    /// Picks a voice to steal among the currently playing ones, per the
    /// selected algorithm. Ties are broken by pool order.
    pub fn steal(&mut self) -> Option<VoiceId> {
        self.candidates.clear();
        for voice in &self.voices {
            if voice.state() == VoiceState::Playing {
                self.candidates.push(voice.id());
            }
        }
        if self.candidates.is_empty() {
            return None;
        }

        match self.stealing {
            StealingAlgorithm::First => Some(self.candidates[0]),
            StealingAlgorithm::Oldest => {
                self.sort_candidates_by_age();
                Some(self.candidates[0])
            }
            StealingAlgorithm::EnvelopeAndAge => {
                self.sort_candidates_by_age();
                Some(self.steal_envelope_and_age())
            }
        }
    }

    /// Age descending; ties broken by (note, velocity, pool order) to
    /// keep the choice stable.
    fn sort_candidates_by_age(&mut self) {
        let voices = &self.voices;
        self.candidates.sort_by(|&a, &b| {
            let va = &voices[a];
            let vb = &voices[b];
            vb.age()
                .cmp(&va.age())
                .then_with(|| va.trigger_event().note.cmp(&vb.trigger_event().note))
                .then_with(|| {
                    va.trigger_event()
                        .velocity
                        .partial_cmp(&vb.trigger_event().velocity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.cmp(&b))
        });
    }

    /// Oldest-first scan that skips loud or too-young voices: quiet old
    /// voices go first, and the plain oldest is the fallback.
    fn steal_envelope_and_age(&mut self) -> VoiceId {
        let candidates = std::mem::take(&mut self.candidates);

        let sum_power: f32 = candidates
            .iter()
            .map(|&id| self.voices[id].average_power())
            .sum();
        let power_threshold =
            sum_power / candidates.len() as f32 * STEALING_POWER_COEFF;
        let age_threshold =
            (self.voices[candidates[0]].age() as f32 * STEALING_AGE_COEFF) as u32;

        let mut chosen = candidates[0];
        let mut index = 0;
        while index < candidates.len() {
            let id = candidates[index];

            if self.voices[id].age() <= age_threshold {
                // Too young from here on; kill the oldest
                break;
            }

            if self.ring_max_power(id) < power_threshold {
                chosen = id;
                break;
            }

            // Jump over the sisters of this ring
            index += 1;
            while index < candidates.len() && self.sisters(id, candidates[index]) {
                index += 1;
            }
        }

        self.candidates = candidates;
        chosen
    }

    // --- Polyphony counting helpers ---

    /// Unreleased voices playing a region.
    pub fn count_region_voices(&self, region: RegionId) -> usize {
        self.voices
            .iter()
            .filter(|v| {
                v.state() == VoiceState::Playing
                    && !v.is_released()
                    && v.region_id() == Some(region)
            })
            .count()
    }

    /// Unreleased voices in a polyphony group.
    pub fn count_group_voices(&self, group: u64, regions: &[Region]) -> usize {
        self.voices
            .iter()
            .filter(|v| {
                v.state() == VoiceState::Playing
                    && !v.is_released()
                    && v.region_id()
                        .and_then(|id| regions.get(id))
                        .map(|r| r.group == group)
                        .unwrap_or(false)
            })
            .count()
    }

    /// Unreleased voices of a group playing a specific note.
    pub fn find_note_voices(
        &self,
        note: u8,
        group: u64,
        regions: &[Region],
        out: &mut Vec<VoiceId>,
    ) {
        out.clear();
        for voice in &self.voices {
            if voice.state() != VoiceState::Playing
                || voice.is_released()
                || voice.trigger_event().note != note
            {
                continue;
            }
            let same_group = voice
                .region_id()
                .and_then(|id| regions.get(id))
                .map(|r| r.group == group)
                .unwrap_or(false);
            if same_group {
                out.push(voice.id());
            }
        }
    }

    /// Unreleased voices whose region belongs to the given set list.
    pub fn count_set_voices(&self, set_regions: &[RegionId]) -> usize {
        self.voices
            .iter()
            .filter(|v| {
                v.state() == VoiceState::Playing
                    && !v.is_released()
                    && v.region_id()
                        .map(|id| set_regions.contains(&id))
                        .unwrap_or(false)
            })
            .count()
    }
}
