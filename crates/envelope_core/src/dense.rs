//! Piecewise cubic Hermite dense output.
//!
//! Each accepted integrator step contributes one segment built from the states and
//! derivatives at both ends. Segments can be cut short (at an event) and stitched across
//! several integrations, which is how the switching driver assembles one continuous
//! interpolant for an interval interrupted by mode changes.

/// Cubic Hermite interpolant over one step.
#[derive(Debug, Clone)]
pub struct HermiteSegment {
    t0: f64,
    h: f64,
    end: f64,
    y0: Vec<f64>,
    y1: Vec<f64>,
    f0: Vec<f64>,
    f1: Vec<f64>,
}

impl HermiteSegment {
    pub fn new(t0: f64, t1: f64, y0: &[f64], y1: &[f64], f0: &[f64], f1: &[f64]) -> Self {
        Self {
            t0,
            h: t1 - t0,
            end: t1,
            y0: y0.to_vec(),
            y1: y1.to_vec(),
            f0: f0.to_vec(),
            f1: f1.to_vec(),
        }
    }

    pub fn start(&self) -> f64 {
        self.t0
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn evaluate_into(&self, t: f64, out: &mut [f64]) {
        let s = (t - self.t0) / self.h;
        let s2 = s * s;
        let s3 = s2 * s;
        let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
        let h10 = s3 - 2.0 * s2 + s;
        let h01 = -2.0 * s3 + 3.0 * s2;
        let h11 = s3 - s2;
        for i in 0..out.len() {
            out[i] = h00 * self.y0[i]
                + h10 * self.h * self.f0[i]
                + h01 * self.y1[i]
                + h11 * self.h * self.f1[i];
        }
    }

    pub fn evaluate(&self, t: f64) -> Vec<f64> {
        let mut out = vec![0.0; self.y0.len()];
        self.evaluate_into(t, &mut out);
        out
    }

    /// Restricts the segment to `[t0, t]` without changing the polynomial.
    fn clip(&mut self, t: f64) {
        self.end = t;
    }
}

/// Continuous solution made of consecutive Hermite segments.
#[derive(Debug, Clone, Default)]
pub struct DenseOutput {
    segments: Vec<HermiteSegment>,
}

impl DenseOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Interval covered by the interpolant.
    pub fn span(&self) -> Option<(f64, f64)> {
        let first = self.segments.first()?;
        let last = self.segments.last()?;
        Some((first.t0, last.end))
    }

    pub fn push(&mut self, segment: HermiteSegment) {
        self.segments.push(segment);
    }

    /// Evaluates the interpolant, or returns `None` outside the covered interval.
    ///
    /// Requests a few ulps past either end are clamped onto it.
    pub fn evaluate(&self, t: f64) -> Option<Vec<f64>> {
        let (start, end) = self.span()?;
        let slack = 8.0 * f64::EPSILON * start.abs().max(end.abs()).max(end - start);
        if t < start - slack || t > end + slack {
            return None;
        }
        let index = self
            .segments
            .partition_point(|segment| segment.end < t)
            .min(self.segments.len() - 1);
        Some(self.segments[index].evaluate(t))
    }

    /// Drops everything after `t`.
    pub fn truncate(&mut self, t: f64) {
        let keep = self.segments.partition_point(|segment| segment.t0 < t).max(1);
        self.segments.truncate(keep);
        if let Some(last) = self.segments.last_mut() {
            if last.end > t {
                last.clip(t);
            }
        }
    }

    /// Appends another interpolant that starts where this one ends.
    pub fn append(&mut self, other: DenseOutput) {
        let boundary = self.span().map(|(_, end)| end);
        for segment in other.segments {
            match boundary {
                Some(end) if segment.end <= end => continue,
                _ => self.segments.push(segment),
            }
        }
    }
}
