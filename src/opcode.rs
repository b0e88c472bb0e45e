//! Opcode Module
//!
//! The hand-off format from the external SFZ text parser: a stream of
//! sections, each a header plus ordered `(name, value)` opcode pairs. The
//! engine aggregates `<global>` into `<master>` into `<group>` into
//! `<region>` and builds its `Region` objects from the merged pairs.
//!
//! Value-reading helpers live here too; a malformed value never fails the
//! load, it falls back to the opcode's default and is reported as a parse
//! warning.

/// SFZ section headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Global,
    Master,
    Group,
    Region,
    Control,
    Curve,
    Effect,
}

/// One parsed section: a header and its opcodes in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub header: Header,
    pub opcodes: Vec<(String, String)>,
}

impl Section {
    /// Creates an empty section.
    pub fn new(header: Header) -> Self {
        Self {
            header,
            opcodes: Vec::new(),
        }
    }

    /// Builder-style opcode append, for tests and programmatic loads.
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.opcodes.push((name.to_string(), value.to_string()));
        self
    }

    /// Last value for an opcode name, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.opcodes
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Reads a float value.
pub fn read_f32(value: &str) -> Option<f32> {
    value.trim().parse::<f32>().ok().filter(|v| v.is_finite())
}

/// Reads an integer value, tolerating a trailing fraction.
pub fn read_i32(value: &str) -> Option<i32> {
    let trimmed = value.trim();
    trimmed
        .parse::<i32>()
        .ok()
        .or_else(|| trimmed.parse::<f32>().ok().map(|v| v as i32))
}

/// Reads a non-negative integer.
pub fn read_usize(value: &str) -> Option<usize> {
    read_i32(value).filter(|&v| v >= 0).map(|v| v as usize)
}

/// Reads a MIDI note: either a number or a name like `c4`, `a#3`, `db5`.
/// Octave -1 holds MIDI 0-11.
pub fn read_note(value: &str) -> Option<u8> {
    let trimmed = value.trim();
    if let Some(number) = read_i32(trimmed) {
        return (0..=127).contains(&number).then_some(number as u8);
    }

    let lower = trimmed.to_ascii_lowercase();
    let mut chars = lower.chars();
    let letter = chars.next()?;
    let base: i32 = match letter {
        'c' => 0,
        'd' => 2,
        'e' => 4,
        'f' => 5,
        'g' => 7,
        'a' => 9,
        'b' => 11,
        _ => return None,
    };

    let rest: String = chars.collect();
    let (accidental, octave_text) = if let Some(stripped) = rest.strip_prefix('#') {
        (1, stripped)
    } else if let Some(stripped) = rest.strip_prefix('b') {
        (-1, stripped)
    } else {
        (0, rest.as_str())
    };

    let octave: i32 = octave_text.parse().ok()?;
    let note = (octave + 1) * 12 + base + accidental;
    (0..=127).contains(&note).then_some(note as u8)
}

/// Reads a MIDI-style 0-127 value normalized to 0..1; accepts `float`
/// values already in 0..1 when they carry a decimal point.
pub fn read_normalized(value: &str) -> Option<f32> {
    let trimmed = value.trim();
    let number = read_f32(trimmed)?;
    if trimmed.contains('.') && number <= 1.0 {
        Some(number.clamp(0.0, 1.0))
    } else {
        Some((number / 127.0).clamp(0.0, 1.0))
    }
}

/// Splits a sub-indexed opcode name: `locc64` -> (`locc`, 64),
/// `eq3_gain` stays whole (index embedded mid-name is the caller's job).
pub fn split_cc_suffix(name: &str) -> Option<(&str, u16)> {
    let digits_at = name.find(|c: char| c.is_ascii_digit())?;
    let (prefix, digits) = name.split_at(digits_at);
    let index: u16 = digits.parse().ok()?;
    Some((prefix, index))
}

/// Splits a name of the form `<prefix><N>_<rest>`, e.g. `eq2_gain` ->
/// (`eq`, 2, `gain`) or `lfo3_freq` -> (`lfo`, 3, `freq`).
pub fn split_indexed(name: &str) -> Option<(&str, usize, &str)> {
    let underscore = name.find('_')?;
    let (head, rest) = name.split_at(underscore);
    let rest = &rest[1..];
    let digits_at = head.find(|c: char| c.is_ascii_digit())?;
    let (prefix, digits) = head.split_at(digits_at);
    let index: usize = digits.parse().ok()?;
    Some((prefix, index, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_builder() {
        let section = Section::new(Header::Region)
            .with("sample", "*sine")
            .with("key", "60");
        assert_eq!(section.get("sample"), Some("*sine"));
        assert_eq!(section.get("key"), Some("60"));
        assert_eq!(section.get("missing"), None);
    }

    #[test]
    fn test_last_value_wins() {
        let section = Section::new(Header::Region)
            .with("key", "60")
            .with("key", "64");
        assert_eq!(section.get("key"), Some("64"));
    }

    #[test]
    fn test_read_note_numeric() {
        assert_eq!(read_note("60"), Some(60));
        assert_eq!(read_note("0"), Some(0));
        assert_eq!(read_note("127"), Some(127));
        assert_eq!(read_note("128"), None);
        assert_eq!(read_note("-1"), None);
    }

    #[test]
    fn test_read_note_names() {
        assert_eq!(read_note("c4"), Some(60));
        assert_eq!(read_note("a4"), Some(69));
        assert_eq!(read_note("c#4"), Some(61));
        assert_eq!(read_note("db4"), Some(61));
        assert_eq!(read_note("C-1"), Some(0));
        assert_eq!(read_note("g9"), Some(127));
        assert_eq!(read_note("x2"), None);
    }

    #[test]
    fn test_read_normalized() {
        assert_eq!(read_normalized("127"), Some(1.0));
        assert_eq!(read_normalized("0"), Some(0.0));
        assert!((read_normalized("64").unwrap() - 64.0 / 127.0).abs() < 1e-6);
        assert_eq!(read_normalized("0.5"), Some(0.5));
        assert_eq!(read_normalized("1.0"), Some(1.0));
    }

    #[test]
    fn test_split_cc_suffix() {
        assert_eq!(split_cc_suffix("locc64"), Some(("locc", 64)));
        assert_eq!(split_cc_suffix("on_hicc1"), Some(("on_hicc", 1)));
        assert_eq!(split_cc_suffix("cutoff"), None);
    }

    #[test]
    fn test_split_indexed() {
        assert_eq!(split_indexed("eq2_gain"), Some(("eq", 2, "gain")));
        assert_eq!(split_indexed("lfo10_freq"), Some(("lfo", 10, "freq")));
        assert_eq!(split_indexed("eg1_time3"), Some(("eg", 1, "time3")));
        assert_eq!(split_indexed("volume"), None);
    }

    #[test]
    fn test_malformed_values_rejected() {
        assert_eq!(read_f32("banana"), None);
        assert_eq!(read_f32("inf"), None);
        assert_eq!(read_i32("1.7"), Some(1));
    }
}
