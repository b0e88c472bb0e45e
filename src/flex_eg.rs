//! FlexEg Module
//!
//! Free-form multi-point envelope generator. Each point carries a time, a
//! target level and a curve shape; one point index is the sustain point.
//! While the note is held the envelope stays on the sustain point (unless
//! marked free-running); on release it fast-forwards past the sustain
//! point and runs the remaining points to the end.

/// One envelope point: ramp to `level` over `time` seconds with a power
/// curve of the given shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlexPoint {
    /// Ramp duration in seconds
    pub time: f32,

    /// Target level, typically -1..1 or 0..1 depending on the target
    pub level: f32,

    /// Curve shape (0 = linear, >0 slow start, <0 fast start)
    pub shape: f32,
}

/// Description of a flex envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct FlexEgDescription {
    /// Ordered point list
    pub points: Vec<FlexPoint>,

    /// Index of the sustain point in `points`
    pub sustain_point: usize,

    /// When set, the envelope runs through the sustain point while held
    pub free_running: bool,
}

impl FlexEgDescription {
    /// A one-segment envelope ramping to 1 instantly and sustaining.
    pub fn gate() -> Self {
        Self {
            points: vec![FlexPoint {
                time: 0.0,
                level: 1.0,
                shape: 0.0,
            }],
            sustain_point: 0,
            free_running: false,
        }
    }
}

/// A running flex envelope instance.
#[derive(Debug, Clone)]
pub struct FlexEnvelope {
    description: FlexEgDescription,
    sample_rate: f32,

    /// Current point being ramped toward; == points.len() when finished
    point_index: usize,

    /// Level the current ramp started from
    segment_start_level: f32,

    /// Phase through the current segment, 0..1
    phase: f32,

    /// Phase step per sample for the current segment
    phase_step: f32,

    current: f32,
    released: bool,
    delay_remaining: usize,
}

impl FlexEnvelope {
    /// Creates an instance; call `trigger` before rendering.
    pub fn new(description: FlexEgDescription, sample_rate: f32) -> Self {
        let mut envelope = Self {
            description,
            sample_rate,
            point_index: 0,
            segment_start_level: 0.0,
            phase: 0.0,
            phase_step: 0.0,
            current: 0.0,
            released: false,
            delay_remaining: 0,
        };
        envelope.begin_segment(0);
        envelope
    }

    fn begin_segment(&mut self, index: usize) {
        self.point_index = index;
        self.segment_start_level = self.current;
        self.phase = 0.0;
        self.phase_step = match self.description.points.get(index) {
            Some(point) if point.time > 0.0 => 1.0 / (point.time * self.sample_rate),
            Some(_) => 1.0,
            None => 0.0,
        };
    }

    /// Arms the envelope at a block offset.
    pub fn trigger(&mut self, delay: usize) {
        self.current = 0.0;
        self.released = false;
        self.delay_remaining = delay;
        self.begin_segment(0);
    }

    /// Signals the release: playback continues past the sustain point.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            // Fast-forward when parked on the sustain point
            if self.point_index == self.description.sustain_point
                && self.phase >= 1.0
            {
                self.begin_segment(self.point_index + 1);
            }
        }
    }

    /// Whether the final point has completed.
    pub fn is_finished(&self) -> bool {
        self.point_index >= self.description.points.len()
    }

    /// Current output level.
    pub fn current(&self) -> f32 {
        self.current
    }

    fn shaped(phase: f32, shape: f32) -> f32 {
        if shape < 0.0 {
            phase.powf(-shape + 1.0)
        } else {
            phase.powf(1.0 / (shape + 1.0))
        }
    }

    /// Renders the next `output.len()` samples.
    pub fn render(&mut self, output: &mut [f32]) {
        for sample in output.iter_mut() {
            if self.delay_remaining > 0 {
                self.delay_remaining -= 1;
                *sample = self.current;
                continue;
            }
            *sample = self.step();
        }
    }

    fn step(&mut self) -> f32 {
        let points = &self.description.points;
        if self.point_index >= points.len() {
            return self.current;
        }

        let point = points[self.point_index];

        if self.phase < 1.0 {
            self.phase = (self.phase + self.phase_step).min(1.0);
            let t = Self::shaped(self.phase, point.shape);
            self.current = self.segment_start_level
                + (point.level - self.segment_start_level) * t;
        }

        if self.phase >= 1.0 {
            let at_sustain = self.point_index == self.description.sustain_point;
            let hold = at_sustain && !self.released && !self.description.free_running;
            if !hold {
                self.begin_segment(self.point_index + 1);
            }
        }

        self.current
    }
}
