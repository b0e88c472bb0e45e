//! Curve Module
//!
//! 128-point lookup curves used by controller modulations, crossfades and
//! the amplitude velocity mapping. A curve set holds the standard default
//! curves at indices 0-6 plus any curves declared by the instrument.

/// Number of points in a lookup curve.
pub const CURVE_POINTS: usize = 128;

/// A 128-point lookup curve evaluated with linear interpolation.
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    points: [f32; CURVE_POINTS],
}

impl Curve {
    /// Builds a curve by sampling a function over [0, 1].
    pub fn from_fn(f: impl Fn(f32) -> f32) -> Self {
        let mut points = [0.0; CURVE_POINTS];
        for (i, point) in points.iter_mut().enumerate() {
            *point = f(i as f32 / (CURVE_POINTS - 1) as f32);
        }
        Self { points }
    }

    /// Builds a curve from explicit point values; missing points are
    /// filled by linear interpolation between the given anchors.
    pub fn from_points(anchors: &[(usize, f32)]) -> Self {
        let mut curve = Curve::linear();
        if anchors.is_empty() {
            return curve;
        }

        let mut sorted: Vec<(usize, f32)> = anchors
            .iter()
            .map(|&(i, v)| (i.min(CURVE_POINTS - 1), v))
            .collect();
        sorted.sort_by_key(|&(i, _)| i);

        // Flat extension before the first and after the last anchor
        let (first_index, first_value) = sorted[0];
        for i in 0..=first_index {
            curve.points[i] = first_value;
        }
        let (last_index, last_value) = sorted[sorted.len() - 1];
        for i in last_index..CURVE_POINTS {
            curve.points[i] = last_value;
        }

        for window in sorted.windows(2) {
            let (i0, v0) = window[0];
            let (i1, v1) = window[1];
            if i1 <= i0 {
                continue;
            }
            let span = (i1 - i0) as f32;
            for i in i0..=i1 {
                let t = (i - i0) as f32 / span;
                curve.points[i] = v0 + (v1 - v0) * t;
            }
        }
        curve
    }

    /// Identity curve: 0..1 linear.
    pub fn linear() -> Self {
        Self::from_fn(|x| x)
    }

    /// Evaluates the curve at a normalized position.
    #[inline]
    pub fn eval(&self, x: f32) -> f32 {
        let x = x.clamp(0.0, 1.0) * (CURVE_POINTS - 1) as f32;
        let index = (x as usize).min(CURVE_POINTS - 2);
        let frac = x - index as f32;
        self.points[index] + (self.points[index + 1] - self.points[index]) * frac
    }

    /// Evaluates at a MIDI-style 0..127 position.
    #[inline]
    pub fn eval_cc(&self, value: u8) -> f32 {
        self.points[value as usize & 127]
    }
}

/// The engine's curve table. Indices 0-6 hold the standard defaults:
///
/// 0. linear 0..1
/// 1. bipolar linear -1..1
/// 2. inverted linear 1..0
/// 3. inverted bipolar 1..-1
/// 4. concave
/// 5. convex
/// 6. concave rising from below
#[derive(Debug, Clone)]
pub struct CurveSet {
    curves: Vec<Curve>,
}

impl CurveSet {
    /// Creates the default curve table.
    pub fn new() -> Self {
        let curves = vec![
            Curve::linear(),
            Curve::from_fn(|x| 2.0 * x - 1.0),
            Curve::from_fn(|x| 1.0 - x),
            Curve::from_fn(|x| 1.0 - 2.0 * x),
            Curve::from_fn(|x| x * x),
            Curve::from_fn(|x| x.sqrt()),
            Curve::from_fn(|x| 1.0 - (1.0 - x) * (1.0 - x)),
        ];
        Self { curves }
    }

    /// Number of defined curves.
    pub fn len(&self) -> usize {
        self.curves.len()
    }

    /// True when no curves are defined.
    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    /// Gets a curve by index, defaulting to linear for unknown indices.
    pub fn get(&self, index: usize) -> &Curve {
        self.curves.get(index).unwrap_or(&self.curves[0])
    }

    /// Registers or replaces a curve at an index, growing the table with
    /// linear curves as needed.
    pub fn set(&mut self, index: usize, curve: Curve) {
        if index >= self.curves.len() {
            self.curves.resize(index + 1, Curve::linear());
        }
        self.curves[index] = curve;
    }
}

impl Default for CurveSet {
    fn default() -> Self {
        Self::new()
    }
}
