//! Config Module
//!
//! Engine-wide configuration options and tuning constants. The options map
//! one-to-one to what a host may persist; `EngineConfig` therefore derives
//! serde traits. Changing sample rate, block size or voice count at runtime
//! goes through the corresponding `Synth` setters, which stop all voices
//! first.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::EngineError;

/// Engine-wide tuning constants.
///
/// These mirror the closed set of thresholds and coefficients the DSP code
/// relies on. They are deliberately not exposed as runtime options.
pub mod constants {
    /// Hard ceiling on the voice pool size.
    pub const MAX_VOICES: usize = 512;

    /// Hard ceiling on samples per block.
    pub const MAX_BLOCK_SIZE: usize = 8192;

    /// Maximum number of effect busses (stereo each).
    pub const MAX_EFFECT_BUSSES: usize = 256;

    /// Number of controller slots (CC 0-511, includes extended CCs).
    pub const CC_COUNT: usize = 512;

    /// Sustain level below which the amplitude EG free-runs to release.
    pub const SUSTAIN_FREE_RUNNING_THRESHOLD: f32 = 0.032;

    /// EG level treated as the end of the release segment (~-80 dB).
    pub const EG_RELEASE_THRESHOLD: f32 = 1e-4;

    /// Length of the linear fadeout appended after release, in seconds.
    pub const EG_TRANSITION_TIME: f32 = 0.01;

    /// Values below this are considered zero in EG comparisons.
    pub const VIRTUALLY_ZERO: f32 = 0.00005;

    /// Minimum release time for release-triggered regions, in seconds.
    pub const MIN_RELEASE_TIME: f32 = 0.005;

    /// Power follower attack tracking factor (per second).
    pub const POWER_FOLLOWER_ATTACK: f32 = 200.0;

    /// Power follower release tracking factor (per second).
    pub const POWER_FOLLOWER_RELEASE: f32 = 50.0;

    /// Stealing: power threshold coefficient relative to mean power.
    pub const STEALING_POWER_COEFF: f32 = 1.0;

    /// Stealing: age threshold coefficient relative to the oldest age.
    pub const STEALING_AGE_COEFF: f32 = 0.5;

    /// Default smoothing time constant for CC modulation chains, seconds.
    pub const MOD_SMOOTHING_TIME: f32 = 0.003;

    /// Filter/EQ coefficient update interval in samples (control rate).
    pub const FILTER_CONTROL_INTERVAL: usize = 16;

    /// Entries in the equal-power pan lookup table.
    pub const PAN_TABLE_SIZE: usize = 4095;

    /// Default sustain pedal controller number.
    pub const DEFAULT_SUSTAIN_CC: u16 = 64;

    /// Default sostenuto pedal controller number.
    pub const DEFAULT_SOSTENUTO_CC: u16 = 66;

    /// Default pedal threshold (normalized).
    pub const DEFAULT_PEDAL_THRESHOLD: f32 = 0.5;

    /// Capacity of the per-block pending event queue.
    pub const EVENT_QUEUE_CAPACITY: usize = 1024;

    /// Capacity of the handle-registration (promise) queue to the dispatcher.
    pub const PROMISE_QUEUE_CAPACITY: usize = 256;

    /// Number of background file-loading worker threads.
    pub const WORKER_THREADS: usize = 4;

    /// Seconds between file-pool garbage collection passes.
    pub const GC_PERIOD_SECONDS: f32 = 1.0;

    /// Seconds a released file must stay untouched before its streamed
    /// body is freed.
    pub const GC_GRACE_SECONDS: f32 = 10.0;

    /// Uniform noise generator bounds for `*noise`.
    pub const NOISE_BOUNDS: f32 = 0.25;

    /// Scratch buffers available to voices per render call.
    pub const SCRATCH_BUFFERS: usize = 8;
}

/// Oversampling factor applied to sample data on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Oversampling {
    /// No oversampling (1x)
    #[default]
    X1,

    /// 2x oversampling
    X2,

    /// 4x oversampling
    X4,

    /// 8x oversampling
    X8,
}

impl Oversampling {
    /// Gets the oversampling factor as a frame multiplier.
    pub fn factor(&self) -> usize {
        match self {
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 4,
            Oversampling::X8 => 8,
        }
    }
}

/// Voice stealing algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StealingAlgorithm {
    /// Pick the first active voice.
    First,

    /// Pick the voice with the highest age.
    Oldest,

    /// Skip loud young voices, fall back to oldest.
    #[default]
    EnvelopeAndAge,
}

/// Engine configuration options.
///
/// All fields correspond to host-settable options. The host may serialize
/// this structure alongside the path of the loaded SFZ file; the engine
/// itself persists nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Output sample rate in Hz
    pub sample_rate: f32,

    /// Maximum frames per render block (1..8192)
    pub samples_per_block: usize,

    /// Voice pool size (1..512)
    pub num_voices: usize,

    /// Frames of each sample kept resident; 0 loads full files
    pub preload_size: usize,

    /// Oversampling applied to preload and stream data
    pub oversampling: Oversampling,

    /// Voice stealing algorithm
    pub stealing_algorithm: StealingAlgorithm,

    /// When set, wait for all pending loads before each block (offline only)
    pub freewheeling: bool,

    /// Interpolation quality for live rendering (1..10)
    pub sample_quality_live: u8,

    /// Interpolation quality while freewheeling (1..10)
    pub sample_quality_freewheel: u8,

    /// Root key for scale tuning (0..127)
    pub tuning_root_key: u8,

    /// Reference frequency in Hz for the tuning root
    pub tuning_frequency: f32,

    /// Optional Scala (.scl) file replacing 12-TET
    pub scala_file: Option<PathBuf>,

    /// Optional prefix prepended to engine log lines
    pub logging_prefix: Option<String>,

    /// Seed for the engine RNG; fixed seeds give bit-identical renders
    pub rng_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            samples_per_block: 1024,
            num_voices: 64,
            preload_size: 8192,
            oversampling: Oversampling::X1,
            stealing_algorithm: StealingAlgorithm::EnvelopeAndAge,
            freewheeling: false,
            sample_quality_live: 2,
            sample_quality_freewheel: 10,
            tuning_root_key: 60,
            tuning_frequency: 440.0,
            scala_file: None,
            logging_prefix: None,
            rng_seed: 0,
        }
    }
}

impl EngineConfig {
    /// Validates every option against its documented range.
    ///
    /// # Returns
    ///
    /// `Ok(())` when all options are usable, otherwise the first offending
    /// option as `EngineError::ConfigurationInvalid`.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(EngineError::ConfigurationInvalid(format!(
                "sample_rate {} must be positive",
                self.sample_rate
            )));
        }
        if self.samples_per_block == 0 || self.samples_per_block > constants::MAX_BLOCK_SIZE {
            return Err(EngineError::ConfigurationInvalid(format!(
                "samples_per_block {} out of range 1..{}",
                self.samples_per_block,
                constants::MAX_BLOCK_SIZE
            )));
        }
        if self.num_voices == 0 || self.num_voices > constants::MAX_VOICES {
            return Err(EngineError::ConfigurationInvalid(format!(
                "num_voices {} out of range 1..{}",
                self.num_voices,
                constants::MAX_VOICES
            )));
        }
        if !(1..=10).contains(&self.sample_quality_live)
            || !(1..=10).contains(&self.sample_quality_freewheel)
        {
            return Err(EngineError::ConfigurationInvalid(
                "sample quality out of range 1..10".to_string(),
            ));
        }
        if self.tuning_root_key > 127 {
            return Err(EngineError::ConfigurationInvalid(format!(
                "tuning_root_key {} out of range 0..127",
                self.tuning_root_key
            )));
        }
        if !(self.tuning_frequency.is_finite() && self.tuning_frequency > 0.0) {
            return Err(EngineError::ConfigurationInvalid(format!(
                "tuning_frequency {} must be positive",
                self.tuning_frequency
            )));
        }
        Ok(())
    }
}
