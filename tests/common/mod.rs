// Test utilities and helper functions for RIPPLE engine tests

/// Root-mean-square level of a signal.
pub fn calculate_rms(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = signal.iter().map(|s| s * s).sum();
    (sum_sq / signal.len() as f32).sqrt()
}

/// Peak absolute level of a signal.
pub fn calculate_peak(signal: &[f32]) -> f32 {
    signal.iter().fold(0.0f32, |peak, &s| peak.max(s.abs()))
}

/// Asserts every sample is finite.
pub fn assert_samples_are_finite(signal: &[f32]) {
    for (i, sample) in signal.iter().enumerate() {
        assert!(sample.is_finite(), "sample {} is not finite: {}", i, sample);
    }
}

/// Counts upward zero crossings, an estimate of frequency when divided
/// by the signal duration.
pub fn count_zero_crossings(signal: &[f32]) -> usize {
    signal
        .windows(2)
        .filter(|w| w[0] < 0.0 && w[1] >= 0.0)
        .count()
}

/// Writes a mono float WAV with a linear ramp payload and returns its path.
pub fn write_ramp_wav(name: &str, frames: usize, sample_rate: u32) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for i in 0..frames {
        writer.write_sample(i as f32 / frames as f32).unwrap();
    }
    writer.finalize().unwrap();
    path
}
