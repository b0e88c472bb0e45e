//! Error Module
//!
//! Error taxonomy for the engine. Everything that can fail on the audio
//! thread is recovered locally and never surfaces here; these errors are
//! returned only by the off-audio API (loading, configuration).

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the off-audio engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A configuration option was out of its documented range.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// A referenced sample file could not be found on disk.
    #[error("sample file not found: {}", .0.display())]
    FileMissing(PathBuf),

    /// A sample file was found but could not be decoded.
    #[error("failed to decode sample file {}: {reason}", path.display())]
    FileDecode { path: PathBuf, reason: String },

    /// A Scala tuning file could not be parsed.
    #[error("failed to parse scala file: {0}")]
    ScalaParse(String),
}

/// A non-fatal diagnostic collected while building regions from parsed
/// sections. Unknown opcodes and malformed values land here instead of
/// failing the load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    /// The opcode name as it appeared in the source
    pub opcode: String,

    /// The raw value text
    pub value: String,

    /// Human-readable description of what went wrong
    pub message: String,
}

impl ParseWarning {
    pub fn unknown(opcode: &str, value: &str) -> Self {
        Self {
            opcode: opcode.to_string(),
            value: value.to_string(),
            message: "unknown opcode".to_string(),
        }
    }

    pub fn malformed(opcode: &str, value: &str) -> Self {
        Self {
            opcode: opcode.to_string(),
            value: value.to_string(),
            message: "malformed value, using default".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::ConfigurationInvalid("block size 0 out of range".into());
        assert!(err.to_string().contains("block size 0"));

        let err = EngineError::FileMissing(PathBuf::from("missing.wav"));
        assert!(err.to_string().contains("missing.wav"));
    }

    #[test]
    fn test_parse_warning_constructors() {
        let w = ParseWarning::unknown("frobnicate", "12");
        assert_eq!(w.opcode, "frobnicate");
        assert_eq!(w.message, "unknown opcode");

        let w = ParseWarning::malformed("key", "banana");
        assert!(w.message.contains("default"));
    }
}
