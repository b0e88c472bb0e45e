//! Math Module
//!
//! Small numeric helpers shared across the DSP chain: decibel and cents
//! conversions, MIDI note frequencies, the equal-power pan lookup table and
//! sample interpolation primitives.

use crate::config::constants::PAN_TABLE_SIZE;
use std::f32::consts::PI;

/// Converts decibels to a linear magnitude.
#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10.0f32.powf(db * 0.05)
}

/// Converts a linear magnitude to decibels.
///
/// Magnitudes at or below zero map to -160 dB.
#[inline]
pub fn gain_to_db(gain: f32) -> f32 {
    if gain > 0.0 {
        20.0 * gain.log10()
    } else {
        -160.0
    }
}

/// Converts a cents offset to a frequency ratio.
#[inline]
pub fn cents_factor(cents: f32) -> f32 {
    2.0f32.powf(cents / 1200.0)
}

/// Converts a MIDI note number to a frequency with standard A4 = 440 Hz.
#[inline]
pub fn midi_note_frequency(note: f32) -> f32 {
    440.0 * 2.0f32.powf((note - 69.0) / 12.0)
}

/// Linear interpolation between two values.
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Linearly interpolated read of `data` at fractional position
/// `index + frac`. The caller guarantees `index < data.len()`; the final
/// frame interpolates against itself.
#[inline]
pub fn interpolate_at(data: &[f32], index: usize, frac: f32) -> f32 {
    let a = data[index];
    let b = if index + 1 < data.len() {
        data[index + 1]
    } else {
        a
    };
    lerp(a, b, frac)
}

/// Equal-power pan lookup table.
///
/// Stores one quarter sine period; left and right gains are read with
/// mirror indexing so that pan -1 is full left, 0 is center (-3 dB per
/// side) and +1 is full right.
pub struct PanTable {
    table: Vec<f32>,
}

impl PanTable {
    /// Builds the table. Done once at engine construction.
    pub fn new() -> Self {
        let table = (0..PAN_TABLE_SIZE)
            .map(|i| {
                let phase = i as f32 / (PAN_TABLE_SIZE - 1) as f32;
                (phase * PI * 0.5).sin()
            })
            .collect();
        Self { table }
    }

    /// Gets (left, right) gains for a pan position in [-1, 1].
    #[inline]
    pub fn gains(&self, pan: f32) -> (f32, f32) {
        let pan = pan.clamp(-1.0, 1.0);
        let position = (pan + 1.0) * 0.5 * (PAN_TABLE_SIZE - 1) as f32;
        let index = (position as usize).min(PAN_TABLE_SIZE - 1);
        let right = self.table[index];
        let left = self.table[PAN_TABLE_SIZE - 1 - index];
        (left, right)
    }
}

impl Default for PanTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies width then position to a stereo frame.
///
/// Width 0 collapses to mono, 1 keeps the original image, values above 1
/// exaggerate the sides. Position shifts the resulting image with the same
/// equal-power law used for pan.
#[inline]
pub fn apply_width_position(
    left: f32,
    right: f32,
    width: f32,
    position: f32,
    pan_table: &PanTable,
) -> (f32, f32) {
    let mid = (left + right) * 0.5;
    let side = (right - left) * 0.5 * width;
    let (pos_left, pos_right) = pan_table.gains(position);
    // Renormalize against the center gain so position 0 is transparent
    let center = (0.5f32).sqrt();
    ((mid - side) * pos_left / center, (mid + side) * pos_right / center)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_round_trip() {
        for db in [-60.0, -6.0, 0.0, 6.0] {
            let gain = db_to_gain(db);
            assert!((gain_to_db(gain) - db).abs() < 1e-3);
        }
    }

    #[test]
    fn test_db_to_gain_known_values() {
        assert!((db_to_gain(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_gain(-6.0) - 0.5012).abs() < 1e-3);
        assert!((db_to_gain(20.0) - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_cents_factor() {
        assert!((cents_factor(0.0) - 1.0).abs() < 1e-6);
        assert!((cents_factor(1200.0) - 2.0).abs() < 1e-5);
        assert!((cents_factor(-1200.0) - 0.5).abs() < 1e-5);
        assert!((cents_factor(100.0) - 2.0f32.powf(1.0 / 12.0)).abs() < 1e-5);
    }

    #[test]
    fn test_midi_note_frequency() {
        assert!((midi_note_frequency(69.0) - 440.0).abs() < 1e-3);
        assert!((midi_note_frequency(57.0) - 220.0).abs() < 1e-3);
        assert!((midi_note_frequency(60.0) - 261.626).abs() < 1e-2);
    }

    #[test]
    fn test_pan_table_extremes() {
        let table = PanTable::new();

        let (l, r) = table.gains(-1.0);
        assert!((l - 1.0).abs() < 1e-3);
        assert!(r.abs() < 1e-3);

        let (l, r) = table.gains(1.0);
        assert!(l.abs() < 1e-3);
        assert!((r - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_pan_table_center_equal_power() {
        let table = PanTable::new();
        let (l, r) = table.gains(0.0);
        assert!((l - r).abs() < 1e-3);
        // -3 dB per side
        assert!((l * l + r * r - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_interpolate_at() {
        let data = [0.0, 1.0, 2.0];
        assert!((interpolate_at(&data, 0, 0.5) - 0.5).abs() < 1e-6);
        assert!((interpolate_at(&data, 1, 0.25) - 1.25).abs() < 1e-6);
        // Last frame interpolates against itself
        assert!((interpolate_at(&data, 2, 0.9) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_width_zero_collapses_to_mono() {
        let table = PanTable::new();
        let (l, r) = apply_width_position(0.8, 0.2, 0.0, 0.0, &table);
        assert!((l - r).abs() < 1e-6);
    }
}
