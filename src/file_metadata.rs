//! FileMetadata Module
//!
//! Loop-point extraction from sample files: the RIFF `smpl` chunk for WAV
//! and the `INST`/`MARK` chunk pair for AIFF. Decoding of the audio frames
//! themselves is the loader's job; this module only walks the container
//! chunks.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Loop points read from a sample file, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPoints {
    pub start: u64,
    pub end: u64,
}

/// Instrument metadata a sample file may carry.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InstrumentInfo {
    pub loop_points: Option<LoopPoints>,

    /// MIDI root key, when declared
    pub root_key: Option<u8>,

    /// Fine tune in cents, when declared
    pub fine_tune: Option<i8>,
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u32_be(bytes: &[u8], offset: usize) -> Option<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u16_be(bytes: &[u8], offset: usize) -> Option<u16> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Parses a RIFF `smpl` chunk payload: header (36 bytes) followed by loop
/// records of 24 bytes each. Loop modes 0 (forward), 1 (alternating) and
/// 2 (backward) are all mapped to plain forward loop points.
pub fn parse_smpl_chunk(payload: &[u8]) -> InstrumentInfo {
    let mut info = InstrumentInfo::default();

    if let Some(root) = read_u32_le(payload, 12) {
        if root <= 127 {
            info.root_key = Some(root as u8);
        }
    }

    let loop_count = read_u32_le(payload, 28).unwrap_or(0) as usize;
    // Each loop record: id, type, start, end, fraction, play count
    for index in 0..loop_count {
        let base = 36 + index * 24;
        let mode = match read_u32_le(payload, base + 4) {
            Some(mode) if mode <= 2 => mode,
            _ => continue,
        };
        let _ = mode;
        let start = read_u32_le(payload, base + 8);
        let end = read_u32_le(payload, base + 12);
        if let (Some(start), Some(end)) = (start, end) {
            if end >= start {
                info.loop_points = Some(LoopPoints {
                    start: start as u64,
                    end: end as u64,
                });
                break;
            }
        }
    }

    info
}

/// Walks the chunks of a RIFF/WAVE file looking for `smpl`.
pub fn read_wav_metadata(path: &Path) -> std::io::Result<InstrumentInfo> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 12];
    file.read_exact(&mut header)?;
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        return Ok(InstrumentInfo::default());
    }

    loop {
        let mut chunk_header = [0u8; 8];
        if file.read_exact(&mut chunk_header).is_err() {
            return Ok(InstrumentInfo::default());
        }
        let size = u32::from_le_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]) as u64;

        if &chunk_header[0..4] == b"smpl" {
            let mut payload = vec![0u8; size.min(1 << 20) as usize];
            file.read_exact(&mut payload)?;
            return Ok(parse_smpl_chunk(&payload));
        }

        // Chunks are word-aligned
        file.seek(SeekFrom::Current((size + (size & 1)) as i64))?;
    }
}

/// Walks the chunks of an AIFF file, combining `INST` (root key, loop
/// marker references) with `MARK` (marker positions).
pub fn read_aiff_metadata(path: &Path) -> std::io::Result<InstrumentInfo> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 12];
    file.read_exact(&mut header)?;
    if &header[0..4] != b"FORM" || (&header[8..12] != b"AIFF" && &header[8..12] != b"AIFC") {
        return Ok(InstrumentInfo::default());
    }

    let mut info = InstrumentInfo::default();
    let mut markers: Vec<(u16, u32)> = Vec::new();
    let mut loop_markers: Option<(u16, u16)> = None;

    loop {
        let mut chunk_header = [0u8; 8];
        if file.read_exact(&mut chunk_header).is_err() {
            break;
        }
        let size = u32::from_be_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]) as u64;

        match &chunk_header[0..4] {
            b"INST" => {
                let mut payload = vec![0u8; size.min(256) as usize];
                file.read_exact(&mut payload)?;
                if let Some(&root) = payload.first() {
                    if root <= 127 {
                        info.root_key = Some(root);
                    }
                }
                if let Some(&detune) = payload.get(1) {
                    info.fine_tune = Some(detune as i8);
                }
                // Sustain loop: play mode, begin marker, end marker
                let begin = read_u16_be(&payload, 10);
                let end = read_u16_be(&payload, 12);
                if let (Some(begin), Some(end)) = (begin, end) {
                    if begin != 0 && end != 0 {
                        loop_markers = Some((begin, end));
                    }
                }
            }
            b"MARK" => {
                let mut payload = vec![0u8; size.min(1 << 20) as usize];
                file.read_exact(&mut payload)?;
                let count = read_u16_be(&payload, 0).unwrap_or(0) as usize;
                let mut offset = 2;
                for _ in 0..count {
                    let id = match read_u16_be(&payload, offset) {
                        Some(id) => id,
                        None => break,
                    };
                    let position = match read_u32_be(&payload, offset + 2) {
                        Some(position) => position,
                        None => break,
                    };
                    markers.push((id, position));
                    // Marker name is a pascal string, padded to even length
                    let name_length = payload.get(offset + 6).copied().unwrap_or(0) as usize;
                    let padded = name_length + 1 + (name_length + 1) % 2;
                    offset += 6 + padded;
                }
            }
            _ => {
                file.seek(SeekFrom::Current((size + (size & 1)) as i64))?;
                continue;
            }
        }

        if size & 1 == 1 {
            file.seek(SeekFrom::Current(1))?;
        }
    }

    if let Some((begin, end)) = loop_markers {
        let find = |id: u16| markers.iter().find(|(m, _)| *m == id).map(|(_, p)| *p);
        if let (Some(start), Some(end)) = (find(begin), find(end)) {
            if end >= start {
                info.loop_points = Some(LoopPoints {
                    start: start as u64,
                    end: end as u64,
                });
            }
        }
    }

    Ok(info)
}

/// Reads instrument metadata, selecting the walker by file extension.
pub fn read_metadata(path: &Path) -> InstrumentInfo {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let result = match extension.as_deref() {
        Some("wav") => read_wav_metadata(path),
        Some("aif") | Some("aiff") | Some("aifc") => read_aiff_metadata(path),
        _ => Ok(InstrumentInfo::default()),
    };
    result.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal smpl payload with one loop record.
    fn smpl_payload(root: u32, mode: u32, start: u32, end: u32) -> Vec<u8> {
        let mut payload = vec![0u8; 36 + 24];
        payload[12..16].copy_from_slice(&root.to_le_bytes());
        payload[28..32].copy_from_slice(&1u32.to_le_bytes());
        payload[36 + 4..36 + 8].copy_from_slice(&mode.to_le_bytes());
        payload[36 + 8..36 + 12].copy_from_slice(&start.to_le_bytes());
        payload[36 + 12..36 + 16].copy_from_slice(&end.to_le_bytes());
        payload
    }

    #[test]
    fn test_smpl_forward_loop() {
        let info = parse_smpl_chunk(&smpl_payload(60, 0, 500, 999));
        assert_eq!(info.root_key, Some(60));
        assert_eq!(
            info.loop_points,
            Some(LoopPoints {
                start: 500,
                end: 999
            })
        );
    }

    #[test]
    fn test_smpl_all_modes_accepted() {
        for mode in 0..=2 {
            let info = parse_smpl_chunk(&smpl_payload(60, mode, 10, 20));
            assert!(info.loop_points.is_some(), "mode={}", mode);
        }
        // Unknown mode is skipped
        let info = parse_smpl_chunk(&smpl_payload(60, 3, 10, 20));
        assert!(info.loop_points.is_none());
    }

    #[test]
    fn test_smpl_rejects_inverted_loop() {
        let info = parse_smpl_chunk(&smpl_payload(60, 0, 999, 500));
        assert!(info.loop_points.is_none());
    }

    #[test]
    fn test_smpl_rejects_out_of_range_root() {
        let info = parse_smpl_chunk(&smpl_payload(200, 0, 10, 20));
        assert_eq!(info.root_key, None);
    }

    #[test]
    fn test_empty_payload() {
        let info = parse_smpl_chunk(&[]);
        assert_eq!(info, InstrumentInfo::default());
    }

    #[test]
    fn test_wav_metadata_round_trip() {
        // Write a wav with hound, append a smpl chunk by hand
        let dir = std::env::temp_dir();
        let path = dir.join("ripple_meta_test.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        {
            let mut writer = hound::WavWriter::create(&path, spec).unwrap();
            for i in 0..100i16 {
                writer.write_sample(i).unwrap();
            }
            writer.finalize().unwrap();
        }

        // Append the smpl chunk and patch the RIFF size
        {
            use std::io::Write;
            let mut bytes = std::fs::read(&path).unwrap();
            let payload = smpl_payload(60, 0, 25, 75);
            bytes.extend_from_slice(b"smpl");
            bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&payload);
            let riff_size = (bytes.len() - 8) as u32;
            bytes[4..8].copy_from_slice(&riff_size.to_le_bytes());
            let mut file = File::create(&path).unwrap();
            file.write_all(&bytes).unwrap();
        }

        let info = read_metadata(&path);
        assert_eq!(
            info.loop_points,
            Some(LoopPoints { start: 25, end: 75 })
        );
        assert_eq!(info.root_key, Some(60));

        let _ = std::fs::remove_file(&path);
    }
}
