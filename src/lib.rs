//! RIPPLE - SFZ Sampling Engine Library
//!
//! This crate provides the real-time core of an SFZ-format software sampler:
//! given a parsed instrument definition and a stream of MIDI-like events, it
//! produces stereo audio output.
//!
//! # Architecture
//!
//! The engine consists of several interconnected modules:
//! - **Region**: Per-SFZ-region playback parameters and activation conditions
//! - **Voice**: One active playback instance running the DSP chain
//! - **VoiceManager**: Fixed voice pool, polyphony limits and voice stealing
//! - **FilePool**: Preloaded sample heads plus background-streamed bodies
//! - **Envelope / FlexEg / Lfo**: Per-voice modulators
//! - **ModMatrix**: Source-to-target modulation routing
//! - **Synth**: The engine root that dispatches events and drives rendering
//!
//! # Example
//!
//! ```rust,no_run
//! use ripple::synth::Synth;
//! use ripple::opcode::{Header, Section};
//!
//! let mut synth = Synth::new(Default::default());
//! let region = Section::new(Header::Region)
//!     .with("sample", "*sine")
//!     .with("key", "69");
//! synth.load_sections(&[region]).unwrap();
//! synth.note_on(0, 69, 1.0);
//! let mut left = vec![0.0; 1024];
//! let mut right = vec![0.0; 1024];
//! synth.render_block(&mut left, &mut right);
//! ```

pub mod buffer;
pub mod config;
pub mod curve;
pub mod envelope;
pub mod error;
pub mod file_metadata;
pub mod file_pool;
pub mod filter;
pub mod flex_eg;
pub mod lfo;
pub mod math;
pub mod midi_state;
pub mod modulation;
pub mod opcode;
pub mod oscillator;
pub mod region;
pub mod region_set;
pub mod smoother;
pub mod synth;
pub mod tuning;
pub mod voice;
pub mod voice_manager;

pub use buffer::{AudioBuffer, BufferPool};
pub use config::{EngineConfig, Oversampling, StealingAlgorithm};
pub use error::EngineError;
pub use region::Region;
pub use synth::Synth;
pub use voice::Voice;
