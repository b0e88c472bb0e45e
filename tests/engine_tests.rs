//! End-to-end engine tests for the RIPPLE sampling core
//!
//! Each test builds an instrument from parsed sections, feeds timed
//! events and checks the rendered output against the expected behavior:
//! envelope shapes, polyphony limits, pedal semantics, round robin,
//! crossfades and loop playback.

mod common;

use common::{
    assert_samples_are_finite, calculate_peak, calculate_rms, count_zero_crossings,
};
use ripple::config::EngineConfig;
use ripple::opcode::{Header, Section};
use ripple::synth::Synth;

const SAMPLE_RATE: f32 = 48000.0;
const BLOCK: usize = 512;

fn engine() -> Synth {
    engine_with_seed(0)
}

fn engine_with_seed(seed: u64) -> Synth {
    let config = EngineConfig {
        sample_rate: SAMPLE_RATE,
        samples_per_block: BLOCK,
        rng_seed: seed,
        ..Default::default()
    };
    Synth::new(config)
}

fn render_block(synth: &mut Synth) -> (Vec<f32>, Vec<f32>) {
    let mut left = vec![0.0; BLOCK];
    let mut right = vec![0.0; BLOCK];
    synth.render_block(&mut left, &mut right);
    (left, right)
}

fn render_blocks(synth: &mut Synth, blocks: usize) -> Vec<f32> {
    let mut collected = Vec::with_capacity(blocks * BLOCK);
    for _ in 0..blocks {
        let (left, _) = render_block(synth);
        collected.extend_from_slice(&left);
    }
    collected
}

// --- Round trip: an instrument with no events renders silence ---
#[test]
fn test_loaded_instrument_renders_silence() {
    let mut synth = engine();
    let sections = vec![Section::new(Header::Region)
        .with("sample", "*sine")
        .with("key", "69")];
    synth.load_sections(&sections).unwrap();

    let samples = render_blocks(&mut synth, 10);
    assert_eq!(calculate_peak(&samples), 0.0);
}

// --- Minimal sine at A4, one second at 48 kHz ---
#[test]
fn test_sine_at_a4() {
    let mut synth = engine();
    let sections = vec![Section::new(Header::Region)
        .with("sample", "*sine")
        .with("key", "69")
        .with("pitch_keycenter", "69")
        .with("ampeg_attack", "0")
        .with("ampeg_release", "0.01")];
    synth.load_sections(&sections).unwrap();

    synth.note_on(0, 69, 1.0);
    let mut samples = Vec::new();
    for block in 0..94 {
        if block == 93 {
            synth.note_off(0, 69, 1.0);
        }
        let (left, _) = render_block(&mut synth);
        samples.extend_from_slice(&left);
    }

    assert_samples_are_finite(&samples);

    // The attack starts from zero
    assert!(samples[0].abs() <= 1.0 / (1u32 << 23) as f32);

    // 440 Hz over the sustained portion
    let sustained = &samples[BLOCK..BLOCK * 90];
    let seconds = sustained.len() as f32 / SAMPLE_RATE;
    let frequency = count_zero_crossings(sustained) as f32 / seconds;
    assert!((frequency - 440.0).abs() < 5.0, "frequency={}", frequency);

    // The release tail decays monotonically (peak per window; windows
    // longer than one 440 Hz period so each one sees a crest)
    let tail = &samples[samples.len() - 480..];
    let mut previous = f32::MAX;
    for window in tail.chunks(120) {
        let peak = calculate_peak(window);
        assert!(peak <= previous + 1e-6, "peak={} previous={}", peak, previous);
        previous = peak;
    }

    // Fully silent shortly after the release completes
    let silence = render_blocks(&mut synth, 4);
    assert!(calculate_rms(&silence[BLOCK * 2..]) < 1e-5);
}

// --- Polyphony cap: third same-note voice releases the earliest ---
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
    render_block(&mut synth);

    assert_eq!(synth.num_unreleased_voices(), 2);
    // The released earliest voice is still rendering its tail
    assert_eq!(synth.num_active_voices(), 3);
}

// --- Sustain pedal: note-off deferred until CC 64 falls ---
#[test]
fn test_sustain_pedal_holds_note() {
    let mut synth = engine();
    let sections = vec![Section::new(Header::Region)
        .with("sample", "*sine")
        .with("key", "60")
        .with("ampeg_release", "0.005")];
    synth.load_sections(&sections).unwrap();

    synth.note_on(0, 60, 1.0);
    synth.cc(0, 64, 1.0);
    synth.note_off(100, 60, 0.0);
    render_block(&mut synth);
    assert_eq!(synth.num_unreleased_voices(), 1, "pedal must defer the off");

    render_block(&mut synth);
    assert_eq!(synth.num_unreleased_voices(), 1);

    synth.cc(0, 64, 0.0);
    render_block(&mut synth);
    assert_eq!(synth.num_unreleased_voices(), 0, "pedal drop releases");
}

// --- Sostenuto: only notes pressed at the crossing are captured ---
#[test]
fn test_sostenuto_captures_held_notes_only() {
    let mut synth = engine();
    let sections = vec![Section::new(Header::Region)
        .with("sample", "*sine")
        .with("lokey", "0")
        .with("hikey", "127")
        .with("ampeg_release", "0.005")];
    synth.load_sections(&sections).unwrap();

    // Note 60 pressed before the pedal, note 64 after
    synth.note_on(0, 60, 1.0);
    render_block(&mut synth);
    synth.cc(0, 66, 1.0);
    synth.note_on(10, 64, 1.0);
    render_block(&mut synth);

    synth.note_off(0, 60, 0.0);
    synth.note_off(1, 64, 0.0);
    render_block(&mut synth);

    // 60 was captured and stays; 64 releases normally
    assert_eq!(synth.num_unreleased_voices(), 1);

    synth.cc(0, 66, 0.0);
    render_block(&mut synth);
    assert_eq!(synth.num_unreleased_voices(), 0);
}

// --- Round robin across two seq positions ---
#[test]
fn test_round_robin_sequence() {
    let mut synth = engine();
    let sections = vec![
        Section::new(Header::Region)
            .with("sample", "*sine")
            .with("key", "60")
            .with("seq_length", "2")
            .with("seq_position", "1"),
        Section::new(Header::Region)
            .with("sample", "*sine")
            .with("key", "60")
            .with("seq_length", "2")
            .with("seq_position", "2"),
    ];
    synth.load_sections(&sections).unwrap();

    let mut activations = Vec::new();
    for _ in 0..4 {
        synth.note_on(0, 60, 1.0);
        render_block(&mut synth);
        activations.push(*synth.active_region_ids().last().unwrap());
        // Stop everything before the next trigger
        synth.cc(0, 120, 0.0);
        render_block(&mut synth);
    }
    assert_eq!(activations, vec![0, 1, 0, 1]);
}

// --- Velocity crossfade-in with the equal-power curve ---
#[test]
fn test_velocity_crossfade_power_curve() {
    let peak_for = |velocity: f32| {
        let mut synth = engine();
        let sections = vec![Section::new(Header::Region)
            .with("sample", "*sine")
            .with("key", "60")
            .with("amp_veltrack", "0")
            .with("xfin_lovel", "0")
            .with("xfin_hivel", "64")
            .with("xf_velcurve", "power")];
        synth.load_sections(&sections).unwrap();
        synth.note_on(0, 60, velocity);
        let samples = render_blocks(&mut synth, 4);
        calculate_peak(&samples[BLOCK..])
    };

    let silent = peak_for(0.0);
    let quarter = peak_for(0.25);
    let half = peak_for(0.5);

    assert!(silent < 1e-6, "silent={}", silent);
    let expected = (std::f32::consts::PI / 8.0).sin() / (std::f32::consts::PI / 4.0).sin();
    let measured = quarter / half;
    assert!(
        (measured - expected).abs() / expected < 0.005,
        "measured={} expected={}",
        measured,
        expected
    );
}

// --- Looped sample: the loop wraps exactly and never overruns ---
#[test]
fn test_looped_sample_wraps() {
    let path = common::write_ramp_wav("ripple_engine_loop.wav", 1000, 48000);
    let mut synth = engine();
    let sections = vec![Section::new(Header::Region)
        .with("sample", "ripple_engine_loop.wav")
        .with("key", "60")
        .with("pitch_keycenter", "60")
        .with("amp_veltrack", "0")
        .with("loop_start", "500")
        .with("loop_end", "999")
        .with("loop_mode", "loop_continuous")];
    {
        // Resolve against the temp directory
        let control = Section::new(Header::Control).with(
            "default_path",
            std::env::temp_dir().to_str().unwrap(),
        );
        let mut all = vec![control];
        all.extend(sections);
        synth.load_sections(&all).unwrap();
    }
    assert!(!synth.region(0).unwrap().is_disabled(), "sample must load");

    synth.note_on(0, 60, 1.0);
    let samples = render_blocks(&mut synth, 8); // > 4000 frames

    // Frame n reads source frame n until the wrap at loop_end
    assert!((samples[500] - samples[1000]).abs() < 1e-6);
    assert!((samples[1000] - samples[1500]).abs() < 1e-6);
    // The wrapped frames replay the loop body, not anything past it
    let loop_peak = calculate_peak(&samples[1000..4000]);
    assert!(loop_peak > 0.0);
    assert_samples_are_finite(&samples);

    let _ = std::fs::remove_file(&path);
}

// --- Idempotence: note-off with no sounding voice is a no-op ---
#[test]
fn test_note_off_idempotent() {
    let mut synth = engine();
    let sections = vec![Section::new(Header::Region)
        .with("sample", "*sine")
        .with("key", "60")];
    synth.load_sections(&sections).unwrap();

    synth.note_off(0, 60, 0.0);
    synth.note_off(10, 60, 0.0);
    let samples = render_blocks(&mut synth, 2);
    assert_eq!(calculate_peak(&samples), 0.0);
    assert_eq!(synth.num_active_voices(), 0);
}

// --- Determinism: same seed and events give identical output ---
#[test]
fn test_deterministic_render() {
    let run = || {
        let mut synth = engine_with_seed(99);
        let sections = vec![Section::new(Header::Region)
            .with("sample", "*noise")
            .with("key", "60")
            .with("pitch_random", "35")
            .with("amp_random", "6")];
        synth.load_sections(&sections).unwrap();
        synth.note_on(0, 60, 0.9);
        render_blocks(&mut synth, 4)
    };
    assert_eq!(run(), run());
}

// --- Group polyphony invariant ---
#[test]
fn test_group_polyphony_cap() {
    let mut synth = engine();
    let sections = vec![Section::new(Header::Region)
        .with("sample", "*sine")
        .with("lokey", "0")
        .with("hikey", "127")
        .with("group", "3")
        .with("ampeg_release", "0.005")];
    synth.load_sections(&sections).unwrap();
    synth.set_group_polyphony(3, 2);

    for key in 60..66 {
        synth.note_on(0, key, 1.0);
        render_block(&mut synth);
    }
    assert!(synth.num_unreleased_voices() <= 2);
}

// --- Engine voice cap invariant under heavy load ---
#[test]
fn test_engine_voice_cap_invariant() {
    let config = EngineConfig {
        sample_rate: SAMPLE_RATE,
        samples_per_block: BLOCK,
        num_voices: 8,
        ..Default::default()
    };
    let mut synth = Synth::new(config);
    let sections = vec![Section::new(Header::Region)
        .with("sample", "*saw")
        .with("lokey", "0")
        .with("hikey", "127")];
    synth.load_sections(&sections).unwrap();

    for round in 0..8 {
        for key in 40..56 {
            synth.note_on((key as usize) % BLOCK, key, 0.8);
        }
        let (left, _) = render_block(&mut synth);
        assert!(synth.num_active_voices() <= 8, "round={}", round);
        assert_samples_are_finite(&left);
    }
}

// --- off_by: a triggered region silences the named group ---
#[test]
fn test_off_by_silences_group() {
    let mut synth = engine();
    let sections = vec![
        Section::new(Header::Region)
            .with("sample", "*sine")
            .with("key", "60")
            .with("group", "1"),
        Section::new(Header::Region)
            .with("sample", "*sine")
            .with("key", "62")
            .with("group", "2")
            .with("off_by", "1"),
    ];
    synth.load_sections(&sections).unwrap();

    synth.note_on(0, 60, 1.0);
    render_block(&mut synth);
    assert_eq!(synth.num_unreleased_voices(), 1);

    synth.note_on(0, 62, 1.0);
    render_block(&mut synth);
    // The group-1 voice was offed; the new group-2 voice remains
    assert_eq!(synth.num_unreleased_voices(), 1);
    assert_eq!(*synth.active_region_ids().last().unwrap(), 1);
}

// --- Release trigger plays on note-off with rt_decay attenuation ---
#[test]
fn test_release_trigger_with_rt_decay() {
    let build = || {
        let mut synth = engine();
        let sections = vec![
            // The attack region is made inaudible so the measured peaks
            // come from the release sample alone
            Section::new(Header::Region)
                .with("sample", "*sine")
                .with("key", "60")
                .with("volume", "-100"),
            Section::new(Header::Region)
                .with("sample", "*sine")
                .with("key", "60")
                .with("trigger", "release")
                .with("amp_veltrack", "0")
                .with("rt_decay", "6")
                .with("ampeg_release", "0.05"),
        ];
        synth.load_sections(&sections).unwrap();
        synth
    };

    // Short hold: louder release sample
    let mut synth = build();
    synth.note_on(0, 60, 1.0);
    render_blocks(&mut synth, 10);
    synth.note_off(0, 60, 0.0);
    let short_hold = render_blocks(&mut synth, 2);

    // Long hold: quieter release sample (rt_decay dB per second)
    let mut synth = build();
    synth.note_on(0, 60, 1.0);
    render_blocks(&mut synth, 100);
    synth.note_off(0, 60, 0.0);
    let long_hold = render_blocks(&mut synth, 2);

    let short_peak = calculate_peak(&short_hold);
    let long_peak = calculate_peak(&long_hold);
    assert!(
        long_peak < short_peak,
        "rt_decay must attenuate: short={} long={}",
        short_peak,
        long_peak
    );
}

// --- First/legato triggers ---
#[test]
fn test_first_and_legato_triggers() {
    let mut synth = engine();
    let sections = vec![
        Section::new(Header::Region)
            .with("sample", "*sine")
            .with("lokey", "0")
            .with("hikey", "127")
            .with("trigger", "first"),
        Section::new(Header::Region)
            .with("sample", "*square")
            .with("lokey", "0")
            .with("hikey", "127")
            .with("trigger", "legato"),
    ];
    synth.load_sections(&sections).unwrap();

    // First note: only the `first` region
    synth.note_on(0, 60, 1.0);
    render_block(&mut synth);
    assert_eq!(synth.active_region_ids(), vec![0]);

    // Second, overlapping note: only the `legato` region
    synth.note_on(0, 64, 1.0);
    render_block(&mut synth);
    let ids = synth.active_region_ids();
    assert!(ids.contains(&1));
    assert_eq!(ids.iter().filter(|&&id| id == 0).count(), 1);
}

// --- Streaming: a long sample plays beyond its preload head ---
#[test]
fn test_streamed_sample_plays_past_preload() {
    let path = common::write_ramp_wav("ripple_engine_stream.wav", 100000, 48000);
    let config = EngineConfig {
        sample_rate: SAMPLE_RATE,
        samples_per_block: BLOCK,
        preload_size: 2048,
        freewheeling: true,
        ..Default::default()
    };
    let mut synth = Synth::new(config);
    let sections = vec![
        Section::new(Header::Control).with(
            "default_path",
            std::env::temp_dir().to_str().unwrap(),
        ),
        Section::new(Header::Region)
            .with("sample", "ripple_engine_stream.wav")
            .with("key", "60")
            .with("pitch_keycenter", "60")
            .with("amp_veltrack", "0"),
    ];
    synth.load_sections(&sections).unwrap();

    synth.note_on(0, 60, 1.0);
    // 10 blocks = 5120 frames, well past the 2048-frame head
    let samples = render_blocks(&mut synth, 10);
    let late = &samples[4096..5120];
    assert!(
        calculate_rms(late) > 0.01,
        "must keep playing from the streamed body"
    );
    assert_samples_are_finite(&samples);

    let _ = std::fs::remove_file(&path);
}
