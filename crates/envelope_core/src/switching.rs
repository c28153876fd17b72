//! Fine integration of switched systems.
//!
//! [`SwitchedDriver`] integrates a [`VectorFieldModel`] across an interval, stopping at the
//! earliest event, letting the model switch mode, and resuming from the event state. User
//! events are located alongside the model's switching events, and a synthetic end event at
//! the requested final time is always registered last so the interval is hit exactly even
//! though each sub-integration is allowed to overshoot it slightly.

use crate::dense::DenseOutput;
use crate::error::IntegrationError;
use crate::events::{EventDescriptor, EventDirection};
use crate::solvers::{OdeIntegrator, OdeSolution, SolveStatus, SolverStats, Tolerances, Tsit5};
use crate::traits::{VariationalSystem, VectorFieldModel};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// What the driver integrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// The model state only.
    State,
    /// The augmented state `[y, vec(Phi)]`; saltation matrices are applied at switches.
    Variational,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Two event times closer than this fraction of the interval are treated as simultaneous.
    pub event_tolerance: f64,
    /// Each sub-integration runs to `t1 + overshoot * (t1 - t0)` so the end event can fire.
    pub overshoot: f64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            event_tolerance: 1e-10,
            overshoot: 1e-3,
        }
    }
}

/// Mode change recorded by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    pub t: f64,
    pub event: usize,
    pub mode: usize,
}

#[derive(Debug, Clone)]
pub struct SwitchedSolution {
    pub t: Vec<f64>,
    pub y: Vec<Vec<f64>>,
    pub dense: DenseOutput,
    /// Occurrences of the user events, in the order they were passed.
    pub t_events: Vec<Vec<f64>>,
    pub y_events: Vec<Vec<Vec<f64>>>,
    pub switches: Vec<Switch>,
    pub stats: SolverStats,
    pub status: SolveStatus,
}

impl SwitchedSolution {
    fn empty(user_events: usize) -> Self {
        Self {
            t: Vec::new(),
            y: Vec::new(),
            dense: DenseOutput::new(),
            t_events: vec![Vec::new(); user_events],
            y_events: vec![Vec::new(); user_events],
            switches: Vec::new(),
            stats: SolverStats::default(),
            status: SolveStatus::Completed,
        }
    }

    /// Final sample of the trajectory.
    pub fn last_state(&self) -> Option<&[f64]> {
        self.y.last().map(Vec::as_slice)
    }

    pub fn last_time(&self) -> Option<f64> {
        self.t.last().copied()
    }

    /// Appends the samples of `segment` strictly before `t_cut`, skipping a repeated boundary sample.
    fn stitch(&mut self, segment: OdeSolution, t_cut: f64) {
        for (t, y) in segment.t.into_iter().zip(segment.y) {
            if t >= t_cut {
                break;
            }
            if self.t.last().map_or(true, |&last| t > last) {
                self.t.push(t);
                self.y.push(y);
            }
        }
        let mut dense = segment.dense;
        dense.truncate(t_cut);
        self.dense.append(dense);
    }

    fn push_sample(&mut self, t: f64, y: Vec<f64>) {
        if self.t.last().map_or(true, |&last| t > last) {
            self.t.push(t);
            self.y.push(y);
        }
    }
}

/// Integrates a switched model across an interval, mode change by mode change.
#[derive(Debug, Clone, Default)]
pub struct SwitchedDriver<I = Tsit5> {
    integrator: I,
    settings: DriverSettings,
    /// Work accumulated over every call to [`SwitchedDriver::integrate`].
    stats: SolverStats,
}

impl SwitchedDriver<Tsit5> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<I: OdeIntegrator> SwitchedDriver<I> {
    pub fn with_integrator(integrator: I, settings: DriverSettings) -> Self {
        Self {
            integrator,
            settings,
            stats: SolverStats::default(),
        }
    }

    pub fn settings(&self) -> DriverSettings {
        self.settings
    }

    pub fn stats(&self) -> SolverStats {
        self.stats
    }

    /// Integrates `model` over `t_span` starting from `y0`.
    ///
    /// For [`Propagation::Variational`], `y0` is the augmented state and every switch
    /// left-multiplies the `Phi` block by the saltation matrix the model returns.
    /// The model's mode is advanced in place; after the call it is the mode active at the
    /// final time.
    pub fn integrate<M: VectorFieldModel + ?Sized>(
        &mut self,
        model: &mut M,
        t_span: (f64, f64),
        y0: &[f64],
        tolerances: Tolerances,
        user_events: &[EventDescriptor],
        propagation: Propagation,
    ) -> Result<SwitchedSolution, IntegrationError> {
        let (t0, t1) = t_span;
        let n = model.dimension();
        let expected = match propagation {
            Propagation::State => n,
            Propagation::Variational => n + n * n,
        };
        if y0.len() != expected {
            return Err(IntegrationError::DimensionMismatch {
                expected,
                actual: y0.len(),
            });
        }
        if !(t0.is_finite() && t1.is_finite() && t1 >= t0) {
            return Err(IntegrationError::InvalidSpan { t0, t1 });
        }

        let mut out = SwitchedSolution::empty(user_events.len());
        out.push_sample(t0, y0.to_vec());
        if t1 == t0 {
            return Ok(out);
        }

        let mut events = model.events();
        let model_events = events.len();
        events.extend(user_events.iter().cloned());
        let end_event = events.len();
        events.push(EventDescriptor::new(
            move |t, _| t - t1,
            EventDirection::Rising,
            false,
        ));

        let span = t1 - t0;
        let horizon = t1 + self.settings.overshoot * span;
        let tolerance = (self.settings.event_tolerance * span).max(64.0 * f64::EPSILON * t1.abs());

        let mut t_cur = t0;
        let mut y_cur = y0.to_vec();
        let mut terminated = false;

        while (t1 - t_cur).abs() > tolerance && !terminated {
            let segment = match propagation {
                Propagation::State => {
                    self.integrator
                        .solve(&*model, (t_cur, horizon), &y_cur, tolerances, &events)?
                }
                Propagation::Variational => self.integrator.solve(
                    &VariationalSystem::new(&*model),
                    (t_cur, horizon),
                    &y_cur,
                    tolerances,
                    &events,
                )?,
            };
            out.stats += segment.stats;
            self.stats += segment.stats;

            if let SolveStatus::Failed(message) = &segment.status {
                let message = message.clone();
                let t_fail = segment.t.last().copied().unwrap_or(t_cur);
                out.stitch(segment, f64::INFINITY);
                out.status = SolveStatus::Failed(message);
                trace!(t = t_fail, "fine integration failed");
                return Ok(out);
            }

            // Earliest crossing not sitting on the restart point; ties keep the earlier registration.
            let mut winner: Option<(f64, usize)> = None;
            for (index, times) in segment.t_events.iter().enumerate() {
                let Some(&t_event) = times.iter().find(|&&te| te - t_cur > tolerance) else {
                    continue;
                };
                match winner {
                    Some((t_best, _)) if t_event >= t_best - tolerance => {}
                    _ => winner = Some((t_event, index)),
                }
            }

            let (t_next, y_next) = match winner {
                Some((t_event, _)) => {
                    let y_event = segment
                        .dense
                        .evaluate(t_event)
                        .ok_or(IntegrationError::OutsideDenseOutput { t: t_event })?;
                    (t_event, y_event)
                }
                None => match (segment.t.last(), segment.y.last()) {
                    (Some(&t), Some(y)) => (t, y.clone()),
                    _ => (t_cur, y_cur.clone()),
                },
            };

            // User events coinciding with the winner are recorded too.
            for (index, times) in segment.t_events.iter().enumerate() {
                if index < model_events || index >= end_event {
                    continue;
                }
                let user = index - model_events;
                let coincident = times
                    .iter()
                    .zip(&segment.y_events[index])
                    .find(|(te, _)| **te - t_cur > tolerance && (**te - t_next).abs() <= tolerance);
                if let Some((&t_event, y_event)) = coincident {
                    out.t_events[user].push(t_event);
                    out.y_events[user].push(y_event[..].to_vec());
                    terminated |= events[index].terminal();
                }
            }

            let mut y_after = y_next.clone();
            if let Some((_, index)) = winner {
                if index < model_events {
                    let saltation = model.handle_event(index, t_next, &y_next[..n]);
                    let mode = model.mode();
                    trace!(t = t_next, event = index, mode, "mode switch");
                    out.switches.push(Switch {
                        t: t_next,
                        event: index,
                        mode,
                    });
                    if let (Propagation::Variational, Some(s)) = (propagation, saltation) {
                        let (state, phi) = VariationalSystem::<M>::split(&y_next, n);
                        y_after = VariationalSystem::<M>::augment(&state, &(s * phi));
                    }
                }
            }

            if t_next <= t_cur {
                out.stitch(segment, t_next);
                out.status =
                    SolveStatus::Failed(format!("switching driver stalled at t = {t_cur:e}"));
                return Ok(out);
            }

            out.stitch(segment, t_next);
            out.push_sample(t_next, y_after.clone());
            t_cur = t_next;
            y_cur = y_after;
        }

        out.status = if terminated {
            SolveStatus::Terminated
        } else {
            SolveStatus::Completed
        };
        Ok(out)
    }
}
