//! Filter Module
//!
//! Per-voice multimode filters and the parametric EQ chain. The filter
//! type set is closed, so selection is a tagged variant dispatching to a
//! per-type coefficient updater over a shared biquad processing primitive;
//! there is no virtual dispatch in the hot path. Stereo filters carry two
//! independent delay states. Coefficients are recomputed at a control-rate
//! interval, and only when cutoff, resonance or gain moved by more than an
//! epsilon.

use crate::config::constants::FILTER_CONTROL_INTERVAL;
use std::f32::consts::PI;

/// Relative change that forces a coefficient update.
const PARAMETER_EPSILON: f32 = 1e-3;

/// The closed set of filter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterType {
    /// Bypass
    None,

    /// One-pole lowpass (6 dB/oct)
    Lpf1p,

    /// One-pole highpass
    Hpf1p,

    /// Two-pole lowpass (12 dB/oct)
    #[default]
    Lpf2p,

    /// Two-pole highpass
    Hpf2p,

    /// Two-pole bandpass
    Bpf2p,

    /// Two-pole band-reject
    Brf2p,

    /// Two-pole allpass
    Apf2p,

    /// Four-pole lowpass (two cascaded sections)
    Lpf4p,

    /// Four-pole highpass
    Hpf4p,

    /// Six-pole lowpass (three cascaded sections)
    Lpf6p,

    /// Six-pole highpass
    Hpf6p,

    /// State-variable lowpass
    LpfSv,

    /// State-variable highpass
    HpfSv,

    /// State-variable bandpass
    BpfSv,

    /// State-variable band-reject
    BrfSv,

    /// Peaking bell
    Peak,

    /// Low shelf
    LowShelf,

    /// High shelf
    HighShelf,

    /// Pink noise shaping filter (-3 dB/oct approximation)
    Pink,
}

impl FilterType {
    /// Number of cascaded biquad sections the type needs.
    fn sections(&self) -> usize {
        match self {
            FilterType::Lpf4p | FilterType::Hpf4p => 2,
            FilterType::Lpf6p | FilterType::Hpf6p => 3,
            _ => 1,
        }
    }
}

/// Biquad coefficients, transposed direct form II.
#[derive(Debug, Clone, Copy, Default)]
struct Coefficients {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

/// Per-channel biquad delay state.
#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    z1: f32,
    z2: f32,
}

impl BiquadState {
    /// Processes one sample, Direct Form II Transposed.
    #[inline]
    fn process(&mut self, c: &Coefficients, input: f32) -> f32 {
        let output = c.b0 * input + self.z1;
        self.z1 = c.b1 * input - c.a1 * output + self.z2;
        self.z2 = c.b2 * input - c.a2 * output;
        output
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Computes RBJ cookbook coefficients for a section of the given type.
fn compute_coefficients(
    filter_type: FilterType,
    cutoff: f32,
    resonance_db: f32,
    gain_db: f32,
    sample_rate: f32,
) -> Coefficients {
    let cutoff = cutoff.clamp(10.0, sample_rate * 0.45);
    let omega = 2.0 * PI * cutoff / sample_rate;
    let (sin, cos) = omega.sin_cos();
    // Resonance expressed in dB above the Butterworth baseline
    let q = (10.0f32.powf(resonance_db / 20.0) * std::f32::consts::FRAC_1_SQRT_2).max(0.1);
    let alpha = sin / (2.0 * q);
    let a = 10.0f32.powf(gain_db / 40.0);

    let (b0, b1, b2, a0, a1, a2) = match filter_type {
        FilterType::None => (1.0, 0.0, 0.0, 1.0, 0.0, 0.0),
        FilterType::Lpf1p => {
            // One-pole via bilinear transform
            let k = (omega / 2.0).tan();
            let norm = 1.0 / (1.0 + k);
            return Coefficients {
                b0: k * norm,
                b1: k * norm,
                b2: 0.0,
                a1: (k - 1.0) * norm,
                a2: 0.0,
            };
        }
        FilterType::Hpf1p => {
            let k = (omega / 2.0).tan();
            let norm = 1.0 / (1.0 + k);
            return Coefficients {
                b0: norm,
                b1: -norm,
                b2: 0.0,
                a1: (k - 1.0) * norm,
                a2: 0.0,
            };
        }
        FilterType::Lpf2p
        | FilterType::Lpf4p
        | FilterType::Lpf6p
        | FilterType::LpfSv => {
            let b1 = 1.0 - cos;
            (b1 / 2.0, b1, b1 / 2.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
        }
        FilterType::Hpf2p
        | FilterType::Hpf4p
        | FilterType::Hpf6p
        | FilterType::HpfSv => {
            let b1 = 1.0 + cos;
            (b1 / 2.0, -b1, b1 / 2.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
        }
        FilterType::Bpf2p | FilterType::BpfSv => {
            (alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
        }
        FilterType::Brf2p | FilterType::BrfSv => {
            (1.0, -2.0 * cos, 1.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
        }
        FilterType::Apf2p => (
            1.0 - alpha,
            -2.0 * cos,
            1.0 + alpha,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        ),
        FilterType::Peak => (
            1.0 + alpha * a,
            -2.0 * cos,
            1.0 - alpha * a,
            1.0 + alpha / a,
            -2.0 * cos,
            1.0 - alpha / a,
        ),
        FilterType::LowShelf => {
            let sqrt_a = a.sqrt();
            let two_sqrt_a_alpha = 2.0 * sqrt_a * alpha;
            (
                a * ((a + 1.0) - (a - 1.0) * cos + two_sqrt_a_alpha),
                2.0 * a * ((a - 1.0) - (a + 1.0) * cos),
                a * ((a + 1.0) - (a - 1.0) * cos - two_sqrt_a_alpha),
                (a + 1.0) + (a - 1.0) * cos + two_sqrt_a_alpha,
                -2.0 * ((a - 1.0) + (a + 1.0) * cos),
                (a + 1.0) + (a - 1.0) * cos - two_sqrt_a_alpha,
            )
        }
        FilterType::HighShelf => {
            let sqrt_a = a.sqrt();
            let two_sqrt_a_alpha = 2.0 * sqrt_a * alpha;
            (
                a * ((a + 1.0) + (a - 1.0) * cos + two_sqrt_a_alpha),
                -2.0 * a * ((a - 1.0) + (a + 1.0) * cos),
                a * ((a + 1.0) + (a - 1.0) * cos - two_sqrt_a_alpha),
                (a + 1.0) - (a - 1.0) * cos + two_sqrt_a_alpha,
                2.0 * ((a - 1.0) - (a + 1.0) * cos),
                (a + 1.0) - (a - 1.0) * cos - two_sqrt_a_alpha,
            )
        }
        FilterType::Pink => {
            // Economy pink approximation: gentle first-order tilt around
            // the cutoff; exact -3 dB/oct shaping is the generator's job
            let k = (omega / 2.0).tan();
            let norm = 1.0 / (1.0 + k);
            return Coefficients {
                b0: (1.0 + 0.15 * k) * norm * 0.7,
                b1: (0.15 * k - 1.0) * norm * 0.7 + 0.3,
                b2: 0.0,
                a1: (k - 1.0) * norm,
                a2: 0.0,
            };
        }
    };

    Coefficients {
        b0: b0 / a0,
        b1: b1 / a0,
        b2: b2 / a0,
        a1: a1 / a0,
        a2: a2 / a0,
    }
}

/// One stereo multimode filter instance.
#[derive(Debug, Clone)]
pub struct Filter {
    filter_type: FilterType,
    coefficients: Coefficients,
    states: [[BiquadState; 3]; 2],
    sample_rate: f32,

    last_cutoff: f32,
    last_resonance: f32,
    last_gain: f32,
    control_counter: usize,
}

impl Filter {
    /// Creates a filter of the given type.
    pub fn new(filter_type: FilterType, sample_rate: f32) -> Self {
        let mut filter = Self {
            filter_type,
            coefficients: Coefficients::default(),
            states: [[BiquadState::default(); 3]; 2],
            sample_rate,
            last_cutoff: 0.0,
            last_resonance: 0.0,
            last_gain: 0.0,
            control_counter: 0,
        };
        filter.update(1000.0, 0.0, 0.0);
        filter
    }

    /// The filter type.
    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    /// Clears the delay states.
    pub fn reset(&mut self) {
        for channel in &mut self.states {
            for state in channel.iter_mut() {
                state.reset();
            }
        }
        self.control_counter = 0;
    }

    fn update(&mut self, cutoff: f32, resonance: f32, gain: f32) {
        self.coefficients = compute_coefficients(
            self.filter_type,
            cutoff,
            resonance,
            gain,
            self.sample_rate,
        );
        self.last_cutoff = cutoff;
        self.last_resonance = resonance;
        self.last_gain = gain;
    }

    fn needs_update(&self, cutoff: f32, resonance: f32, gain: f32) -> bool {
        let rel = |new: f32, old: f32| {
            (new - old).abs() > PARAMETER_EPSILON * old.abs().max(1.0)
        };
        rel(cutoff, self.last_cutoff)
            || rel(resonance, self.last_resonance)
            || rel(gain, self.last_gain)
    }

    /// Processes a stereo block in place with per-block target parameters.
    ///
    /// Coefficients are refreshed every `FILTER_CONTROL_INTERVAL` samples
    /// when the targets moved by more than the epsilon.
    pub fn process(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        cutoff: f32,
        resonance: f32,
        gain: f32,
    ) {
        if self.filter_type == FilterType::None {
            return;
        }

        let frames = left.len().min(right.len());
        let sections = self.filter_type.sections();

        let mut i = 0;
        while i < frames {
            if self.control_counter == 0 && self.needs_update(cutoff, resonance, gain) {
                self.update(cutoff, resonance, gain);
            }

            let run = (FILTER_CONTROL_INTERVAL - self.control_counter).min(frames - i);
            for frame in i..i + run {
                let mut l = left[frame];
                let mut r = right[frame];
                for section in 0..sections {
                    l = self.states[0][section].process(&self.coefficients, l);
                    r = self.states[1][section].process(&self.coefficients, r);
                }
                left[frame] = l;
                right[frame] = r;
            }
            self.control_counter = (self.control_counter + run) % FILTER_CONTROL_INTERVAL;
            i += run;
        }
    }
}

/// EQ band types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EqType {
    /// Peaking bell
    #[default]
    Peak,

    /// Low shelf
    LowShelf,

    /// High shelf
    HighShelf,
}

impl EqType {
    fn as_filter_type(&self) -> FilterType {
        match self {
            EqType::Peak => FilterType::Peak,
            EqType::LowShelf => FilterType::LowShelf,
            EqType::HighShelf => FilterType::HighShelf,
        }
    }
}

/// One parametric EQ band (stereo).
#[derive(Debug, Clone)]
pub struct EqBand {
    inner: Filter,
    bandwidth_octaves: f32,
}

impl EqBand {
    /// Creates a band of the given type.
    pub fn new(eq_type: EqType, sample_rate: f32) -> Self {
        Self {
            inner: Filter::new(eq_type.as_filter_type(), sample_rate),
            bandwidth_octaves: 1.0,
        }
    }

    /// Clears delay states.
    pub fn reset(&mut self) {
        self.inner.reset();
    }

    /// Processes a stereo block in place.
    ///
    /// `bandwidth` is in octaves and mapped onto the resonance parameter
    /// of the shared biquad.
    pub fn process(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        frequency: f32,
        bandwidth: f32,
        gain: f32,
    ) {
        self.bandwidth_octaves = bandwidth.max(0.1);
        // Narrower bandwidth = higher Q; expressed as resonance dB
        let q = 1.0 / (2.0f32.powf(self.bandwidth_octaves / 2.0)
            - 2.0f32.powf(-self.bandwidth_octaves / 2.0));
        let resonance_db = 20.0 * (q / std::f32::consts::FRAC_1_SQRT_2).log10();
        self.inner
            .process(left, right, frequency, resonance_db, gain);
    }
}
