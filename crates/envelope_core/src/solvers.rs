use crate::dense::{DenseOutput, HermiteSegment};
use crate::error::IntegrationError;
use crate::events::{locate_crossing, EventDescriptor};
use crate::traits::DynamicalSystem;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Relative and absolute tolerances of an adaptive integration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    pub rtol: f64,
    pub atol: f64,
}

impl Tolerances {
    pub fn new(rtol: f64, atol: f64) -> Self {
        Self { rtol, atol }
    }

    fn validate(&self) -> Result<(), IntegrationError> {
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if valid(self.rtol) && valid(self.atol) {
            Ok(())
        } else {
            Err(IntegrationError::InvalidTolerances {
                rtol: self.rtol,
                atol: self.atol,
            })
        }
    }
}

/// Work counters of an integration.
///
/// `njev` and `nlu` stay at zero for explicit methods; they are kept so counts from
/// implicit integrators can be accumulated through the same type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverStats {
    pub nfev: usize,
    pub njev: usize,
    pub nlu: usize,
    pub accepted: usize,
    pub rejected: usize,
}

impl AddAssign for SolverStats {
    fn add_assign(&mut self, other: Self) {
        self.nfev += other.nfev;
        self.njev += other.njev;
        self.nlu += other.nlu;
        self.accepted += other.accepted;
        self.rejected += other.rejected;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SolveStatus {
    /// The end of the interval was reached.
    Completed,
    /// A terminal event stopped the integration.
    Terminated,
    /// The integrator gave up; the trajectory holds everything up to that point.
    Failed(String),
}

impl SolveStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, SolveStatus::Failed(_))
    }
}

/// Output of a single adaptive integration.
#[derive(Debug, Clone)]
pub struct OdeSolution {
    pub t: Vec<f64>,
    pub y: Vec<Vec<f64>>,
    pub dense: DenseOutput,
    /// Event times per registered event, in the order events were passed.
    pub t_events: Vec<Vec<f64>>,
    pub y_events: Vec<Vec<Vec<f64>>>,
    pub stats: SolverStats,
    pub status: SolveStatus,
}

impl OdeSolution {
    fn start(t0: f64, y0: &[f64], events: usize) -> Self {
        Self {
            t: vec![t0],
            y: vec![y0.to_vec()],
            dense: DenseOutput::new(),
            t_events: vec![Vec::new(); events],
            y_events: vec![Vec::new(); events],
            stats: SolverStats::default(),
            status: SolveStatus::Completed,
        }
    }
}

/// An adaptive integrator with dense output and event location.
pub trait OdeIntegrator {
    fn solve<S: DynamicalSystem + ?Sized>(
        &mut self,
        system: &S,
        t_span: (f64, f64),
        y0: &[f64],
        tolerances: Tolerances,
        events: &[EventDescriptor],
    ) -> Result<OdeSolution, IntegrationError>;
}

// Tsitouras 5(4) tableau.
const C2: f64 = 0.161;
const C3: f64 = 0.327;
const C4: f64 = 0.9;
const C5: f64 = 0.9800255409045097;

const A21: f64 = 0.161;
const A31: f64 = -0.008480655492356989;
const A32: f64 = 0.335480655492357;
const A41: f64 = 2.898;
const A42: f64 = -6.359447987781783;
const A43: f64 = 4.361447987781783;
const A51: f64 = 5.325864858437957;
const A52: f64 = -11.748883564062828;
const A53: f64 = 7.495539342889693;
const A54: f64 = -0.09249506636030195;
const A61: f64 = 5.86145544294642;
const A62: f64 = -12.92096931784711;
const A63: f64 = 8.159367898576159;
const A64: f64 = -0.071584973281401;
const A65: f64 = -0.02826857949054663;

// 5th order weights (FSAL: also the last row of the tableau).
const B1: f64 = 0.09646076681806523;
const B2: f64 = 0.01;
const B3: f64 = 0.4798896504144996;
const B4: f64 = 1.379008574103742;
const B5: f64 = -3.290069515436099;
const B6: f64 = 2.324710524099774;

// Difference between the 5th and the embedded 4th order weights.
const E1: f64 = -0.00178001105222577714;
const E2: f64 = -0.0008164344596567469;
const E3: f64 = 0.007880878010261995;
const E4: f64 = -0.1447110071732629;
const E5: f64 = 0.5823571654525552;
const E6: f64 = -0.45808210592918697;
const E7: f64 = 0.015151515151515152;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tsit5Settings {
    pub max_steps: usize,
    pub safety: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for Tsit5Settings {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            safety: 0.9,
            min_factor: 0.2,
            max_factor: 10.0,
        }
    }
}

/// Adaptive Tsitouras 5/4 solver with FSAL, Hermite dense output and event location.
#[derive(Debug, Clone, Default)]
pub struct Tsit5 {
    settings: Tsit5Settings,
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    k5: Vec<f64>,
    k6: Vec<f64>,
    k7: Vec<f64>,
    tmp: Vec<f64>,
    y_new: Vec<f64>,
}

impl Tsit5 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: Tsit5Settings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    fn resize(&mut self, dim: usize) {
        for buffer in [
            &mut self.k1,
            &mut self.k2,
            &mut self.k3,
            &mut self.k4,
            &mut self.k5,
            &mut self.k6,
            &mut self.k7,
            &mut self.tmp,
            &mut self.y_new,
        ] {
            buffer.clear();
            buffer.resize(dim, 0.0);
        }
    }

    /// Hairer's starting step heuristic. Expects `k1 = f(t, y)`.
    fn initial_step<S: DynamicalSystem + ?Sized>(
        &mut self,
        system: &S,
        t: f64,
        y: &[f64],
        span: f64,
        tolerances: Tolerances,
        stats: &mut SolverStats,
    ) -> f64 {
        let scale: Vec<f64> = y
            .iter()
            .map(|v| tolerances.atol + tolerances.rtol * v.abs())
            .collect();
        let d0 = rms_scaled(y, &scale);
        let d1 = rms_scaled(&self.k1, &scale);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        }
        .min(span);

        for i in 0..y.len() {
            self.tmp[i] = y[i] + h0 * self.k1[i];
        }
        system.apply(t + h0, &self.tmp, &mut self.k2);
        stats.nfev += 1;

        let d2 = self
            .k2
            .iter()
            .zip(&self.k1)
            .zip(&scale)
            .map(|((a, b), s)| ((a - b) / s).powi(2))
            .sum::<f64>()
            .sqrt()
            / (y.len().max(1) as f64).sqrt()
            / h0;

        let h1 = if d1.max(d2) <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(0.2)
        };
        (100.0 * h0).min(h1).min(span)
    }

    /// One Tsit5 step from `(t, y)` with `k1 = f(t, y)` already in place.
    /// Leaves the candidate in `y_new`, `f(t + dt, y_new)` in `k7` and returns the scaled error norm.
    fn attempt<S: DynamicalSystem + ?Sized>(
        &mut self,
        system: &S,
        t: f64,
        y: &[f64],
        dt: f64,
        t_new: f64,
        tolerances: Tolerances,
    ) -> f64 {
        let n = y.len();

        for i in 0..n {
            self.tmp[i] = y[i] + dt * (A21 * self.k1[i]);
        }
        system.apply(t + C2 * dt, &self.tmp, &mut self.k2);

        for i in 0..n {
            self.tmp[i] = y[i] + dt * (A31 * self.k1[i] + A32 * self.k2[i]);
        }
        system.apply(t + C3 * dt, &self.tmp, &mut self.k3);

        for i in 0..n {
            self.tmp[i] = y[i] + dt * (A41 * self.k1[i] + A42 * self.k2[i] + A43 * self.k3[i]);
        }
        system.apply(t + C4 * dt, &self.tmp, &mut self.k4);

        for i in 0..n {
            self.tmp[i] = y[i]
                + dt * (A51 * self.k1[i] + A52 * self.k2[i] + A53 * self.k3[i] + A54 * self.k4[i]);
        }
        system.apply(t + C5 * dt, &self.tmp, &mut self.k5);

        for i in 0..n {
            self.tmp[i] = y[i]
                + dt * (A61 * self.k1[i]
                    + A62 * self.k2[i]
                    + A63 * self.k3[i]
                    + A64 * self.k4[i]
                    + A65 * self.k5[i]);
        }
        system.apply(t + dt, &self.tmp, &mut self.k6);

        for i in 0..n {
            self.y_new[i] = y[i]
                + dt * (B1 * self.k1[i]
                    + B2 * self.k2[i]
                    + B3 * self.k3[i]
                    + B4 * self.k4[i]
                    + B5 * self.k5[i]
                    + B6 * self.k6[i]);
        }
        system.apply(t_new, &self.y_new, &mut self.k7);

        let mut sum = 0.0;
        for i in 0..n {
            let err = dt
                * (E1 * self.k1[i]
                    + E2 * self.k2[i]
                    + E3 * self.k3[i]
                    + E4 * self.k4[i]
                    + E5 * self.k5[i]
                    + E6 * self.k6[i]
                    + E7 * self.k7[i]);
            let scale = tolerances.atol + tolerances.rtol * y[i].abs().max(self.y_new[i].abs());
            sum += (err / scale).powi(2);
        }
        (sum / n.max(1) as f64).sqrt()
    }
}

fn rms_scaled(values: &[f64], scale: &[f64]) -> f64 {
    let sum: f64 = values
        .iter()
        .zip(scale)
        .map(|(v, s)| (v / s).powi(2))
        .sum();
    (sum / values.len().max(1) as f64).sqrt()
}

impl OdeIntegrator for Tsit5 {
    fn solve<S: DynamicalSystem + ?Sized>(
        &mut self,
        system: &S,
        t_span: (f64, f64),
        y0: &[f64],
        tolerances: Tolerances,
        events: &[EventDescriptor],
    ) -> Result<OdeSolution, IntegrationError> {
        let (t0, t1) = t_span;
        let dim = system.dimension();
        if y0.len() != dim {
            return Err(IntegrationError::DimensionMismatch {
                expected: dim,
                actual: y0.len(),
            });
        }
        if !(t0.is_finite() && t1.is_finite() && t1 > t0) {
            return Err(IntegrationError::InvalidSpan { t0, t1 });
        }
        tolerances.validate()?;
        self.resize(dim);

        let mut solution = OdeSolution::start(t0, y0, events.len());
        let mut stats = SolverStats::default();
        let mut t = t0;
        let mut y = y0.to_vec();

        system.apply(t, &y, &mut self.k1);
        stats.nfev += 1;
        let mut h = self.initial_step(system, t, &y, t1 - t0, tolerances, &mut stats);
        let mut g_prev: Vec<f64> = events.iter().map(|e| e.value(t, &y)).collect();
        let mut steps = 0usize;

        solution.status = loop {
            if t >= t1 {
                break SolveStatus::Completed;
            }
            if steps >= self.settings.max_steps {
                break SolveStatus::Failed(format!(
                    "maximum number of steps ({}) reached at t = {t:e}",
                    self.settings.max_steps
                ));
            }
            let h_min = 16.0 * f64::EPSILON * t.abs().max(t1.abs());
            if h < h_min || !h.is_finite() {
                break SolveStatus::Failed(format!("step size {h:e} too small at t = {t:e}"));
            }
            steps += 1;

            let last = h >= t1 - t;
            let dt = if last { t1 - t } else { h };
            let t_new = if last { t1 } else { t + dt };

            let err = self.attempt(system, t, &y, dt, t_new, tolerances);
            stats.nfev += 6;

            if err.is_nan() || err > 1.0 {
                stats.rejected += 1;
                let factor = if err.is_finite() {
                    (self.settings.safety * err.powf(-0.2)).max(self.settings.min_factor)
                } else {
                    self.settings.min_factor
                };
                h = dt * factor.min(1.0);
                continue;
            }
            stats.accepted += 1;

            let segment = HermiteSegment::new(t, t_new, &y, &self.y_new, &self.k1, &self.k7);

            let mut crossings: Vec<(f64, usize)> = Vec::new();
            for (index, event) in events.iter().enumerate() {
                let g_new = event.value(t_new, &self.y_new);
                if event.direction().crossed(g_prev[index], g_new) {
                    let root = locate_crossing(
                        |s| event.value(s, &segment.evaluate(s)),
                        t,
                        t_new,
                        g_prev[index],
                        g_new,
                    );
                    crossings.push((root, index));
                }
                g_prev[index] = g_new;
            }
            crossings.sort_by(|a, b| a.0.total_cmp(&b.0));

            let stop = crossings
                .iter()
                .find(|(_, index)| events[*index].terminal())
                .map(|(root, _)| *root);
            for &(root, index) in &crossings {
                if stop.map_or(true, |s| root <= s) {
                    solution.t_events[index].push(root);
                    solution.y_events[index].push(segment.evaluate(root));
                }
            }

            if let Some(t_stop) = stop {
                let y_stop = segment.evaluate(t_stop);
                solution.dense.push(segment);
                solution.dense.truncate(t_stop);
                solution.t.push(t_stop);
                solution.y.push(y_stop);
                break SolveStatus::Terminated;
            }

            solution.dense.push(segment);
            solution.t.push(t_new);
            solution.y.push(self.y_new.clone());

            t = t_new;
            y.copy_from_slice(&self.y_new);
            std::mem::swap(&mut self.k1, &mut self.k7);

            let factor = if err == 0.0 {
                self.settings.max_factor
            } else {
                (self.settings.safety * err.powf(-0.2))
                    .clamp(self.settings.min_factor, self.settings.max_factor)
            };
            h = dt * factor;
        };

        solution.stats = stats;
        Ok(solution)
    }
}
